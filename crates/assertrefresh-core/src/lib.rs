//! Bulk refresh of signed package declarations.
//!
//! Installed packages are bound to signed declarations, and the device model
//! may name a store with its own store assertion. These go stale and are
//! re-validated against the assertion service in bounded batches, without
//! holding the shared state lock during network I/O.
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `pool` | Bounded, group-scoped resolution pool |
//! | `bulk` | Orchestrator: chunking, store group, error reporting |
//! | `resolve` | One resolution pass against the transport |
//! | `fallback` | One-by-one refresh when bulk refresh is rejected |
//! | `state` | Lock released around network calls |
//! | `transport` | Assertion service contract and error classification |
//! | `batch` | Downloaded assertion batches |
//! | `db` | Trust database contract and in-memory implementation |
//!
//! # Example Usage
//!
//! ```ignore
//! use assertrefresh_core::{DeclarationRefresher, RefreshConfig, SharedState};
//!
//! let refresher = DeclarationRefresher::new(RefreshConfig::from_env()?);
//! let mut guard = shared.lock().await;
//! refresher.refresh(&mut guard, &packages, user_id, &device).await?;
//! ```

pub mod batch;
pub mod bulk;
pub mod config;
pub mod db;
pub mod error;
pub mod fallback;
pub mod logging;
pub mod metrics;
pub mod pool;
pub mod resolve;
pub mod state;
pub mod transport;
pub mod types;

pub use batch::{handle_unsupported, Batch, UnsupportedHandler};
pub use bulk::{DeclarationRefresher, STORE_GROUP};
pub use config::{RefreshConfig, DEFAULT_MAX_GROUPS};
pub use db::{MemoryTrustDb, TrustDb};
pub use error::{
    ActionError, BatchError, DbError, FallbackError, GroupError, PoolError, RefreshError,
    ResolveFailure, ResolvePoolError, Result, TransportError,
};
pub use metrics::RefreshMetrics;
pub use pool::Pool;
pub use state::{RefreshState, SharedState, StateGuard};
pub use transport::{
    classify, ActionRequest, ActionResponse, AssertionResult, Disposition, GroupRequest,
    Transport,
};
pub use types::{
    Assertion, AssertionRef, AssertionType, AtRevision, DeviceContext, Grouping, Model,
    PackageState, SideInfo, UserId, UserIdentity, REVISION_NOT_KNOWN,
};
