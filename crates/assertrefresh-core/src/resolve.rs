//! One resolution pass: drive a pool to convergence against the transport.

use std::collections::BTreeMap;

use crate::batch::{handle_unsupported, Batch};
use crate::bulk::DeclarationRefresher;
use crate::error::{FallbackError, GroupError, ResolveFailure, Result, TransportError};
use crate::pool::Pool;
use crate::state::{RefreshState, StateGuard};
use crate::transport::{classify, ActionResponse, Disposition};
use crate::types::{DeviceContext, UserId};

impl DeclarationRefresher {
    /// Resolve everything registered in `pool` and commit it.
    ///
    /// Returns the per-group errors left on the pool; empty means every group
    /// resolved. The state lock is released around each transport call.
    pub async fn resolve_pool<S: RefreshState>(
        &self,
        guard: &mut StateGuard<S>,
        pool: &mut Pool,
        user_id: UserId,
        device: &DeviceContext,
    ) -> Result<BTreeMap<String, GroupError>> {
        let user = guard.user(user_id)?;
        let (db, transport) = {
            let state = guard.get()?;
            (state.assertion_db(), state.transport(device))
        };
        let unsupported = handle_unsupported(db.clone());

        loop {
            let request = pool.to_resolve();
            self.metrics.rounds_total.inc();
            tracing::debug!(
                "Requesting {} assertions in {} groupings",
                request.len(),
                request.groups.len()
            );

            let outcome = guard
                .unlocked(transport.request_assertions(&request, user.as_ref()))
                .await;
            let response = match outcome {
                Ok(response) => response,
                Err(err) => match classify(&err) {
                    Disposition::Converged => ActionResponse {
                        results: Vec::new(),
                        failures: match err {
                            TransportError::Action(action) => action.failures,
                            _ => Vec::new(),
                        },
                    },
                    Disposition::Fallback => return Err(FallbackError::from(err).into()),
                    Disposition::Fatal => return Err(err.into()),
                },
            };
            guard.get()?;

            for failure in response.failures {
                match failure {
                    ResolveFailure::Assertion { reference, error } => {
                        pool.add_error(error, &reference)?
                    }
                    ResolveFailure::Grouping { grouping, error } => {
                        pool.add_grouping_error(error, &grouping)?
                    }
                }
            }

            if response.results.is_empty() {
                break;
            }

            for result in response.results {
                self.metrics.downloads_total.inc();
                let downloaded = guard
                    .unlocked(transport.download_assertions(&result.stream_urls, user.as_ref()))
                    .await;
                guard.get()?;

                let assertions = match downloaded {
                    Ok(assertions) => assertions,
                    Err(e) => {
                        tracing::warn!("Cannot download assertions for {}: {}", result.grouping, e);
                        self.metrics.download_failures.inc();
                        let err = GroupError::Fetch(e.to_string());
                        pool.add_grouping_error(err, &result.grouping)?;
                        continue;
                    }
                };

                let mut batch = Batch::new(Some(unsupported.clone()));
                if let Err(e) = batch.add_stream(assertions) {
                    tracing::warn!("Cannot use assertions for {}: {}", result.grouping, e);
                    pool.add_grouping_error(e.into(), &result.grouping)?;
                    continue;
                }
                pool.add_batch(batch, &result.grouping)?;
            }
        }

        pool.commit_to(db.as_ref());
        Ok(pool.errors())
    }
}
