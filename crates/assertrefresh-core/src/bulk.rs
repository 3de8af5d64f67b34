//! Bulk refresh of package declarations and the store assertion.
//!
//! One group per package, plus `STORE_GROUP` for the model's store. Work is
//! chunked so that a pool never tracks more than `pool.max_groups` groups:
//! every time that many packages are registered a resolution pass runs and
//! the pool is cleared for the next chunk.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::config::RefreshConfig;
use crate::error::{FallbackError, RefreshError, ResolvePoolError, Result};
use crate::metrics::{RefreshMetrics, StageTimer};
use crate::pool::Pool;
use crate::state::{RefreshState, StateGuard};
use crate::types::{AssertionRef, DeviceContext, PackageState, UserId, REVISION_NOT_KNOWN};

/// Group under which the model's store assertion is resolved.
pub const STORE_GROUP: &str = "store assertion";

pub(crate) const REFRESH_FAILED_MESSAGE: &str = "cannot refresh package-declarations for packages";

/// Refreshes package declarations against the assertion service.
#[derive(Debug)]
pub struct DeclarationRefresher {
    pub(crate) config: RefreshConfig,
    pub(crate) metrics: Arc<RefreshMetrics>,
}

impl DeclarationRefresher {
    pub fn new(config: RefreshConfig) -> Self {
        Self {
            config,
            metrics: Arc::new(RefreshMetrics::new()),
        }
    }

    /// Share an existing metrics collection.
    pub fn with_metrics(mut self, metrics: Arc<RefreshMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn config(&self) -> &RefreshConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<RefreshMetrics> {
        &self.metrics
    }

    /// Refresh the declarations of `packages` and the model's store assertion.
    ///
    /// Per-group failures are collected across passes and reported together as
    /// `RefreshError::Resolve`. `RefreshError::Fallback` asks the caller to
    /// retry with `refresh_one_by_one`.
    pub async fn bulk_refresh<S: RefreshState>(
        &self,
        guard: &mut StateGuard<S>,
        packages: &BTreeMap<String, PackageState>,
        user_id: UserId,
        device: &DeviceContext,
    ) -> Result<()> {
        self.config.validate()?;
        let db = guard.get()?.assertion_db();
        let max_groups = self.config.pool.max_groups;
        let mut pool = Pool::new(db, max_groups);
        let mut merged: Option<ResolvePoolError> = None;

        let mut registered = 0usize;
        for (name, package) in packages {
            let Some(package_id) = package.declaration_id() else {
                continue;
            };
            let reference = AssertionRef::declaration(&self.config.series, package_id);
            pool.add_to_update(&reference, name)
                .map_err(|source| RefreshError::Prepare {
                    package: name.clone(),
                    source,
                })?;

            registered += 1;
            if registered % max_groups == 0 {
                let pass = self.run_pass(guard, &mut pool, user_id, device).await?;
                accumulate(&mut merged, pass);
                clear_for_next_chunk(&mut pool)?;
            }
        }

        if let Some(store) = device.model.store() {
            let store_ref = AssertionRef::store(store);
            if let Err(e) = pool.add_to_update(&store_ref, STORE_GROUP) {
                if !e.is_not_found() {
                    return Err(RefreshError::PrepareStore(e));
                }
                // not local yet, fetch it
                pool.add_unresolved(&store_ref.at(REVISION_NOT_KNOWN), STORE_GROUP)
                    .map_err(RefreshError::PrepareStoreFetch)?;
            }
        }

        let pass = self.run_pass(guard, &mut pool, user_id, device).await?;
        accumulate(&mut merged, pass);

        let Some(mut merged) = merged else {
            return Ok(());
        };
        merged.suppress(STORE_GROUP, |e| e.is_not_found() || e.is_unresolved());
        if merged.is_empty() {
            return Ok(());
        }
        Err(merged.with_message(REFRESH_FAILED_MESSAGE).into())
    }

    async fn run_pass<S: RefreshState>(
        &self,
        guard: &mut StateGuard<S>,
        pool: &mut Pool,
        user_id: UserId,
        device: &DeviceContext,
    ) -> Result<Option<ResolvePoolError>> {
        self.metrics.passes_total.inc();
        self.metrics.pool_groups.set(pool.group_count() as u64);
        tracing::debug!("Resolving assertion pool with {} groups", pool.group_count());

        let errors = {
            let _timer = StageTimer::start(&self.metrics.pass_latency);
            self.resolve_pool(guard, pool, user_id, device).await?
        };
        if errors.is_empty() {
            return Ok(None);
        }
        self.metrics.groups_failed.inc_by(errors.len() as u64);
        Ok(Some(ResolvePoolError::new(errors)))
    }
}

/// Work left pending after a pass means the service cannot be driven in bulk.
fn clear_for_next_chunk(pool: &mut Pool) -> Result<()> {
    pool.clear_groups().map_err(FallbackError::from)?;
    Ok(())
}

fn accumulate(merged: &mut Option<ResolvePoolError>, pass: Option<ResolvePoolError>) {
    let Some(pass) = pass else {
        return;
    };
    match merged {
        Some(acc) => acc.merge(pass),
        None => *merged = Some(pass),
    }
}
