//! Trust database interface.
//!
//! The database is shared with the rest of the system; refresh only mutates it
//! through `TrustDb::add` during a pool commit (or the one-by-one fallback).

use std::collections::HashMap;
use std::sync::RwLock;

use crate::error::DbError;
use crate::types::{Assertion, AssertionRef};

/// Local store of trust statements.
pub trait TrustDb: Send + Sync {
    /// Current revision of the referenced assertion.
    fn find(&self, reference: &AssertionRef) -> Result<Assertion, DbError>;

    /// Add or replace an assertion. Each call is atomic.
    ///
    /// Implementations reject assertions whose prerequisites are missing and
    /// revisions that are not newer than the stored one.
    fn add(&self, assertion: Assertion) -> Result<(), DbError>;

    fn contains(&self, reference: &AssertionRef) -> bool {
        self.find(reference).is_ok()
    }
}

/// In-memory trust database.
#[derive(Debug, Default)]
pub struct MemoryTrustDb {
    assertions: RwLock<HashMap<AssertionRef, Assertion>>,
}

impl MemoryTrustDb {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed assertions without prerequisite or revision checks.
    pub fn with_assertions(assertions: impl IntoIterator<Item = Assertion>) -> Self {
        let map = assertions
            .into_iter()
            .map(|a| (a.reference(), a))
            .collect();
        Self {
            assertions: RwLock::new(map),
        }
    }

    pub fn len(&self) -> usize {
        self.assertions.read().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn poisoned() -> DbError {
        DbError::Backend("assertion map lock poisoned".into())
    }
}

impl TrustDb for MemoryTrustDb {
    fn find(&self, reference: &AssertionRef) -> Result<Assertion, DbError> {
        let map = self.assertions.read().map_err(|_| Self::poisoned())?;
        map.get(reference)
            .cloned()
            .ok_or_else(|| DbError::NotFound(reference.clone()))
    }

    fn add(&self, assertion: Assertion) -> Result<(), DbError> {
        let mut map = self.assertions.write().map_err(|_| Self::poisoned())?;
        let reference = assertion.reference();

        if let Some(missing) = assertion
            .prerequisites
            .iter()
            .find(|p| !map.contains_key(*p))
        {
            return Err(DbError::MissingPrerequisite {
                reference,
                prerequisite: missing.clone(),
            });
        }

        if let Some(current) = map.get(&reference) {
            if current.revision >= assertion.revision {
                return Err(DbError::NotNewer {
                    reference,
                    current: current.revision,
                    new: assertion.revision,
                });
            }
        }

        map.insert(reference, assertion);
        Ok(())
    }

    fn contains(&self, reference: &AssertionRef) -> bool {
        self.assertions
            .read()
            .map(|m| m.contains_key(reference))
            .unwrap_or(false)
    }
}
