//! Resolution pool: bounded, group-scoped accumulator of assertions to resolve.
//!
//! Work is registered per named group. The same assertion needed by several
//! groups is tracked once and requested under a grouping label covering all of
//! them, so one network round trip serves every group in the pool.
//!
//! # Lifecycle
//!
//! 1. `add_to_update` / `add_unresolved` register work.
//! 2. `to_resolve` snapshots what still needs asking for.
//! 3. `add_error` / `add_grouping_error` / `add_batch` feed results back.
//! 4. Repeat 2-3 until nothing new is unresolved, then `commit_to`.
//! 5. `errors` reports per group; `clear_groups` readies the pool for the next chunk.

use std::collections::{btree_map, BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use crate::batch::Batch;
use crate::db::TrustDb;
use crate::error::{GroupError, PoolError};
use crate::transport::{ActionRequest, GroupRequest};
use crate::types::{Assertion, AssertionRef, AtRevision, Grouping, REVISION_NOT_KNOWN};

type GroupNum = u16;

/// Hard ceiling imposed by the group number width.
pub const MAX_POOL_GROUPS: usize = GroupNum::MAX as usize + 1;

struct GroupRec {
    name: String,
    err: Option<GroupError>,
}

struct ItemRec {
    at: AtRevision,
    groups: BTreeSet<GroupNum>,
    requested: bool,
}

struct StagedRec {
    assertion: Assertion,
    groups: BTreeSet<GroupNum>,
}

/// Resolution pool.
pub struct Pool {
    db: Arc<dyn TrustDb>,
    max_groups: usize,
    groups: Vec<GroupRec>,
    group_nums: HashMap<String, GroupNum>,
    unresolved: BTreeMap<AssertionRef, ItemRec>,
    staged: BTreeMap<AssertionRef, StagedRec>,
}

impl Pool {
    /// Pool reading current revisions from `db`, tracking at most `max_groups` groups.
    pub fn new(db: Arc<dyn TrustDb>, max_groups: usize) -> Self {
        Self {
            db,
            max_groups: max_groups.min(MAX_POOL_GROUPS),
            groups: Vec::new(),
            group_nums: HashMap::new(),
            unresolved: BTreeMap::new(),
            staged: BTreeMap::new(),
        }
    }

    pub fn max_groups(&self) -> usize {
        self.max_groups
    }

    /// Number of live groups.
    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    /// Number of assertions registered and not yet settled.
    pub fn pending(&self) -> usize {
        self.unresolved.len() + self.staged.len()
    }

    /// Register a refresh of `reference`, which must be in the trust database,
    /// together with its prerequisite chain.
    pub fn add_to_update(
        &mut self,
        reference: &AssertionRef,
        group: &str,
    ) -> Result<(), PoolError> {
        if !reference.is_well_formed() {
            return Err(PoolError::InvalidReference(reference.clone()));
        }
        let current = self.db.find(reference).map_err(|e| {
            if e.is_not_found() {
                PoolError::NotFound(reference.clone())
            } else {
                PoolError::Db(e)
            }
        })?;
        let num = self.ensure_group(group)?;

        let mut visited = HashSet::new();
        let mut stack = vec![current];
        while let Some(assertion) = stack.pop() {
            let r = assertion.reference();
            if !visited.insert(r.clone()) {
                continue;
            }
            for prereq in &assertion.prerequisites {
                match self.db.find(prereq) {
                    Ok(found) => stack.push(found),
                    // The db guarantees prerequisites on add; a gap is fetched fresh.
                    Err(e) if e.is_not_found() => self.track(prereq.at(REVISION_NOT_KNOWN), num),
                    Err(e) => return Err(PoolError::Db(e)),
                }
            }
            self.track(r.at(assertion.revision), num);
        }
        Ok(())
    }

    /// Register a fetch of an assertion that may not be local yet.
    pub fn add_unresolved(&mut self, at: &AtRevision, group: &str) -> Result<(), PoolError> {
        if !at.reference.is_well_formed() {
            return Err(PoolError::InvalidReference(at.reference.clone()));
        }
        let num = self.ensure_group(group)?;
        self.track(at.clone(), num);
        Ok(())
    }

    /// Items not requested yet, grouped by grouping. Marks them requested.
    pub fn to_resolve(&mut self) -> ActionRequest {
        let mut by_grouping: BTreeMap<BTreeSet<GroupNum>, Vec<AtRevision>> = BTreeMap::new();
        for rec in self.unresolved.values_mut().filter(|rec| !rec.requested) {
            rec.requested = true;
            by_grouping
                .entry(rec.groups.clone())
                .or_default()
                .push(rec.at.clone());
        }

        ActionRequest {
            groups: by_grouping
                .into_iter()
                .map(|(nums, assertions)| GroupRequest {
                    grouping: grouping_label(&nums),
                    assertions,
                })
                .collect(),
        }
    }

    /// Record a server-reported failure for one assertion against every group
    /// that needed it. The assertion is dropped from the pool.
    pub fn add_error(
        &mut self,
        err: GroupError,
        reference: &AssertionRef,
    ) -> Result<(), PoolError> {
        let rec = self
            .unresolved
            .remove(reference)
            .ok_or_else(|| PoolError::NotInPool(reference.clone()))?;
        for num in rec.groups {
            self.set_group_error(num, err.clone());
        }
        Ok(())
    }

    /// Record a failure against every group of `grouping`.
    ///
    /// Pending assertions only failed groups were waiting for are dropped.
    pub fn add_grouping_error(
        &mut self,
        err: GroupError,
        grouping: &Grouping,
    ) -> Result<(), PoolError> {
        let nums = self.parse_grouping(grouping)?;
        for num in nums {
            self.set_group_error(num, err.clone());
        }

        let groups = &self.groups;
        self.unresolved.retain(|_, rec| {
            rec.groups
                .iter()
                .any(|num| groups[usize::from(*num)].err.is_none())
        });
        Ok(())
    }

    /// Merge downloaded assertions for `grouping`.
    ///
    /// Returns whether another round is needed, i.e. merging surfaced
    /// prerequisites that still have to be fetched.
    pub fn add_batch(&mut self, batch: Batch, grouping: &Grouping) -> Result<bool, PoolError> {
        let nums = self.parse_grouping(grouping)?;

        for assertion in batch.into_assertions() {
            let reference = assertion.reference();
            let groups = match self.unresolved.remove(&reference) {
                Some(rec) => {
                    if rec.at.is_revision_known() && assertion.revision <= rec.at.revision {
                        // already current
                        continue;
                    }
                    rec.groups
                }
                None => {
                    if self.staged.contains_key(&reference) {
                        continue;
                    }
                    if let Ok(local) = self.db.find(&reference) {
                        if local.revision >= assertion.revision {
                            continue;
                        }
                    }
                    nums.clone()
                }
            };
            self.stage(assertion, groups);
        }

        Ok(self.unresolved.values().any(|rec| !rec.requested))
    }

    /// Add resolved assertions to `db` in prerequisite order.
    ///
    /// Assertions whose groups have all failed are skipped. Rejections are
    /// recorded against the assertion's groups. Fetches that never resolved
    /// become `GroupError::Unresolved`; updates the server did not answer are
    /// considered current.
    pub fn commit_to(&mut self, db: &dyn TrustDb) {
        for rec in std::mem::take(&mut self.unresolved).into_values() {
            if !rec.at.is_revision_known() {
                for num in rec.groups {
                    self.set_group_error(num, GroupError::Unresolved);
                }
            }
        }

        let staged = std::mem::take(&mut self.staged);
        let order = prerequisite_order(&staged, |rec| rec.assertion.prerequisites.as_slice());
        for reference in order {
            let rec = &staged[reference];
            if rec.groups.iter().all(|num| self.group_failed(*num)) {
                continue;
            }
            if let Err(e) = db.add(rec.assertion.clone()) {
                tracing::debug!("Cannot commit {}: {}", reference, e);
                for num in &rec.groups {
                    self.set_group_error(*num, GroupError::Commit(e.clone()));
                }
            }
        }
    }

    /// First error recorded per group, by group name.
    pub fn errors(&self) -> BTreeMap<String, GroupError> {
        self.groups
            .iter()
            .filter_map(|g| g.err.as_ref().map(|e| (g.name.clone(), e.clone())))
            .collect()
    }

    /// Forget all groups so the pool can take the next chunk of work.
    pub fn clear_groups(&mut self) -> Result<(), PoolError> {
        if !self.unresolved.is_empty() || !self.staged.is_empty() {
            return Err(PoolError::InvalidState(format!(
                "cannot clear groups of a pool with {} pending assertions",
                self.pending()
            )));
        }
        self.groups.clear();
        self.group_nums.clear();
        Ok(())
    }

    /// Group names covered by `grouping`.
    pub fn group_names(&self, grouping: &Grouping) -> Result<Vec<&str>, PoolError> {
        Ok(self
            .parse_grouping(grouping)?
            .into_iter()
            .map(|num| self.groups[usize::from(num)].name.as_str())
            .collect())
    }

    fn ensure_group(&mut self, name: &str) -> Result<GroupNum, PoolError> {
        if let Some(num) = self.group_nums.get(name) {
            return Ok(*num);
        }
        if self.groups.len() >= self.max_groups {
            return Err(PoolError::TooManyGroups {
                group: name.to_string(),
                max: self.max_groups,
            });
        }
        let num = GroupNum::try_from(self.groups.len()).map_err(|_| PoolError::TooManyGroups {
            group: name.to_string(),
            max: self.max_groups,
        })?;
        self.groups.push(GroupRec {
            name: name.to_string(),
            err: None,
        });
        self.group_nums.insert(name.to_string(), num);
        Ok(num)
    }

    fn track(&mut self, at: AtRevision, num: GroupNum) {
        if let Some(staged) = self.staged.get_mut(&at.reference) {
            staged.groups.insert(num);
            return;
        }
        match self.unresolved.entry(at.reference.clone()) {
            btree_map::Entry::Occupied(mut e) => {
                e.get_mut().groups.insert(num);
            }
            btree_map::Entry::Vacant(e) => {
                e.insert(ItemRec {
                    at,
                    groups: BTreeSet::from([num]),
                    requested: false,
                });
            }
        }
    }

    fn stage(&mut self, assertion: Assertion, groups: BTreeSet<GroupNum>) {
        for prereq in &assertion.prerequisites {
            if let Some(staged) = self.staged.get_mut(prereq) {
                staged.groups.extend(&groups);
            } else if let Some(rec) = self.unresolved.get_mut(prereq) {
                rec.groups.extend(&groups);
            } else if !self.db.contains(prereq) {
                self.unresolved.insert(
                    prereq.clone(),
                    ItemRec {
                        at: prereq.at(REVISION_NOT_KNOWN),
                        groups: groups.clone(),
                        requested: false,
                    },
                );
            }
        }
        self.staged
            .insert(assertion.reference(), StagedRec { assertion, groups });
    }

    fn set_group_error(&mut self, num: GroupNum, err: GroupError) {
        if let Some(group) = self.groups.get_mut(usize::from(num)) {
            group.err.get_or_insert(err);
        }
    }

    fn group_failed(&self, num: GroupNum) -> bool {
        self.groups
            .get(usize::from(num))
            .map_or(true, |g| g.err.is_some())
    }

    fn parse_grouping(&self, grouping: &Grouping) -> Result<BTreeSet<GroupNum>, PoolError> {
        let unknown = || PoolError::UnknownGrouping(grouping.clone());
        if grouping.as_str().is_empty() {
            return Err(unknown());
        }
        grouping
            .as_str()
            .split(',')
            .map(|part| {
                part.parse::<GroupNum>()
                    .ok()
                    .filter(|num| usize::from(*num) < self.groups.len())
                    .ok_or_else(unknown)
            })
            .collect()
    }
}

fn grouping_label(nums: &BTreeSet<GroupNum>) -> Grouping {
    let parts: Vec<String> = nums.iter().map(|n| n.to_string()).collect();
    Grouping(parts.join(","))
}

/// Keys of `items` ordered so that prerequisites present in `items` come first.
pub(crate) fn prerequisite_order<'a, T>(
    items: &'a BTreeMap<AssertionRef, T>,
    prerequisites: impl Fn(&T) -> &[AssertionRef],
) -> Vec<&'a AssertionRef> {
    let mut order = Vec::with_capacity(items.len());
    let mut visited = HashSet::new();
    for start in items.keys() {
        let mut stack = vec![(start, false)];
        while let Some((reference, expanded)) = stack.pop() {
            if expanded {
                order.push(reference);
                continue;
            }
            if !visited.insert(reference) {
                continue;
            }
            stack.push((reference, true));
            for prereq in prerequisites(&items[reference]) {
                if let Some((key, _)) = items.get_key_value(prereq) {
                    if !visited.contains(key) {
                        stack.push((key, false));
                    }
                }
            }
        }
    }
    order
}
