//! Transport contract towards the authoritative assertion service.
//!
//! Only the interface lives here. Implementations are expected to be thin
//! adapters over an HTTP client; none of them are allowed to touch the shared
//! state, which is why failures come back as data in `ActionResponse` and the
//! resolution loop applies them to the pool under the lock.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{ResolveFailure, TransportError};
use crate::types::{Assertion, AssertionRef, AtRevision, Grouping, UserIdentity};

/// Items of one grouping to be resolved.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupRequest {
    pub grouping: Grouping,
    pub assertions: Vec<AtRevision>,
}

/// Snapshot of what the pool wants resolved in one round.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionRequest {
    pub groups: Vec<GroupRequest>,
}

impl ActionRequest {
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Total number of assertions across groupings.
    pub fn len(&self) -> usize {
        self.groups.iter().map(|g| g.assertions.len()).sum()
    }
}

/// Streams to download for one grouping.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssertionResult {
    pub grouping: Grouping,
    pub stream_urls: Vec<String>,
}

/// Answer to an `ActionRequest`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ActionResponse {
    pub results: Vec<AssertionResult>,
    pub failures: Vec<ResolveFailure>,
}

/// Assertion service client.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Ask which assertions changed and where to download them.
    async fn request_assertions(
        &self,
        request: &ActionRequest,
        user: Option<&UserIdentity>,
    ) -> Result<ActionResponse, TransportError>;

    /// Download and decode the given assertion streams.
    async fn download_assertions(
        &self,
        urls: &[String],
        user: Option<&UserIdentity>,
    ) -> Result<Vec<Assertion>, TransportError>;

    /// Fetch the latest revision of a single assertion.
    async fn fetch_assertion(
        &self,
        reference: &AssertionRef,
        user: Option<&UserIdentity>,
    ) -> Result<Assertion, TransportError>;
}

/// What a failed `request_assertions` call means for the resolution loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Disposition {
    /// Nothing more to learn; commit what we have.
    Converged,
    /// Abandon bulk refresh and let the caller use the one-by-one strategy.
    Fallback,
    Fatal,
}

/// Client errors, and 500 which older servers answer the bulk endpoint with.
const FALLBACK_STATUS: std::ops::RangeInclusive<u16> = 400..=500;

pub fn classify(err: &TransportError) -> Disposition {
    match err {
        TransportError::Action(e) if e.is_only_no_results() => Disposition::Converged,
        TransportError::Action(_) => Disposition::Fallback,
        TransportError::UnexpectedHttpStatus { status, .. } if FALLBACK_STATUS.contains(status) => {
            Disposition::Fallback
        }
        _ => Disposition::Fatal,
    }
}
