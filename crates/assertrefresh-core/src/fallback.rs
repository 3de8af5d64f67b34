//! One-by-one refresh.
//!
//! Servers that reject bulk refresh still serve single assertions. This path
//! fetches each declaration on its own, chases missing prerequisites one fetch
//! at a time and adds the chain to the database in prerequisite order.

use std::collections::{BTreeMap, HashSet};

use crate::batch::{handle_unsupported, unsupported_format, UnsupportedHandler};
use crate::bulk::{DeclarationRefresher, REFRESH_FAILED_MESSAGE, STORE_GROUP};
use crate::db::TrustDb;
use crate::error::{GroupError, ResolvePoolError, Result, TransportError};
use crate::pool::prerequisite_order;
use crate::state::{RefreshState, StateGuard};
use crate::transport::Transport;
use crate::types::{AssertionRef, DeviceContext, PackageState, UserId, UserIdentity};

impl DeclarationRefresher {
    /// `bulk_refresh`, falling back to `refresh_one_by_one` when the server
    /// asks for it and the fallback is enabled.
    pub async fn refresh<S: RefreshState>(
        &self,
        guard: &mut StateGuard<S>,
        packages: &BTreeMap<String, PackageState>,
        user_id: UserId,
        device: &DeviceContext,
    ) -> Result<()> {
        match self.bulk_refresh(guard, packages, user_id, device).await {
            Err(e) if e.is_fallback() && self.config.fallback.enabled => {
                tracing::info!("Falling back to one-by-one assertion refresh: {}", e);
                self.metrics.fallbacks_total.inc();
                self.refresh_one_by_one(guard, packages, user_id, device).await
            }
            other => other,
        }
    }

    /// Refresh each declaration, and the store assertion, with single fetches.
    pub async fn refresh_one_by_one<S: RefreshState>(
        &self,
        guard: &mut StateGuard<S>,
        packages: &BTreeMap<String, PackageState>,
        user_id: UserId,
        device: &DeviceContext,
    ) -> Result<()> {
        let user = guard.user(user_id)?;
        let (db, transport) = {
            let state = guard.get()?;
            (state.assertion_db(), state.transport(device))
        };
        let unsupported = handle_unsupported(db.clone());
        let fetcher = Fetcher {
            db: db.as_ref(),
            transport: transport.as_ref(),
            user: user.as_ref(),
            unsupported: &unsupported,
        };

        let mut errors = BTreeMap::new();
        for (name, package) in packages {
            let Some(package_id) = package.declaration_id() else {
                continue;
            };
            let reference = AssertionRef::declaration(&self.config.series, package_id);
            match fetcher.fetch_chain(guard, &reference).await {
                Ok(added) => tracing::debug!("Refreshed {} assertions for {}", added, name),
                Err(e) => {
                    tracing::warn!("Cannot refresh declaration of {}: {}", name, e);
                    errors.insert(name.clone(), e);
                }
            }
        }

        if let Some(store) = device.model.store() {
            match fetcher.fetch_chain(guard, &AssertionRef::store(store)).await {
                Ok(_) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => {
                    errors.insert(STORE_GROUP.to_string(), e);
                }
            }
        }

        if errors.is_empty() {
            return Ok(());
        }
        self.metrics.groups_failed.inc_by(errors.len() as u64);
        Err(ResolvePoolError::new(errors)
            .with_message(REFRESH_FAILED_MESSAGE)
            .into())
    }
}

struct Fetcher<'a> {
    db: &'a dyn TrustDb,
    transport: &'a dyn Transport,
    user: Option<&'a UserIdentity>,
    unsupported: &'a UnsupportedHandler,
}

impl Fetcher<'_> {
    /// Fetch `reference` and any prerequisites missing locally, then add the
    /// newer ones. Returns how many assertions were added.
    async fn fetch_chain<S>(
        &self,
        guard: &mut StateGuard<S>,
        reference: &AssertionRef,
    ) -> std::result::Result<usize, GroupError> {
        let mut fetched = BTreeMap::new();
        let mut visited = HashSet::new();
        let mut stack = vec![reference.clone()];

        while let Some(next) = stack.pop() {
            if !visited.insert(next.clone()) {
                continue;
            }
            let assertion = guard
                .unlocked(self.transport.fetch_assertion(&next, self.user))
                .await
                .map_err(fetch_error)?;

            let local = self.db.find(&next).ok();
            if local.is_some_and(|l| l.revision >= assertion.revision) {
                continue;
            }
            if !assertion.is_format_supported() {
                (self.unsupported)(&next, &unsupported_format(&assertion))?;
                continue;
            }

            stack.extend(
                assertion
                    .prerequisites
                    .iter()
                    .filter(|p| !self.db.contains(p))
                    .cloned(),
            );
            fetched.insert(next, assertion);
        }

        for next in prerequisite_order(&fetched, |a| a.prerequisites.as_slice()) {
            self.db.add(fetched[next].clone())?;
        }
        Ok(fetched.len())
    }
}

fn fetch_error(err: TransportError) -> GroupError {
    match err {
        TransportError::NotFound(reference) => GroupError::NotFound(reference),
        other => GroupError::Fetch(other.to_string()),
    }
}
