//! Error types for assertion refresh.
//!
//! Group-scoped failures (`GroupError`) are data: they are collected per group and
//! reported together. Everything else aborts the current operation.

use std::collections::BTreeMap;
use std::error::Error as StdError;
use std::fmt;

use thiserror::Error;

use crate::types::{AssertionRef, AssertionType, Grouping, UserId};

/// Trust database error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DbError {
    #[error("{0} not found")]
    NotFound(AssertionRef),

    #[error("revision {new} of {reference} is not newer than current revision {current}")]
    NotNewer {
        reference: AssertionRef,
        current: i32,
        new: i32,
    },

    #[error("cannot add {reference}: prerequisite {prerequisite} not found")]
    MissingPrerequisite {
        reference: AssertionRef,
        prerequisite: AssertionRef,
    },

    #[error("trust database error: {0}")]
    Backend(String),
}

impl DbError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, DbError::NotFound(_))
    }
}

/// Error while building a batch from a downloaded stream.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BatchError {
    #[error("proposed {reference} has format {format} but {assertion_type} can only be handled up to format {max}")]
    UnsupportedFormat {
        reference: AssertionRef,
        assertion_type: AssertionType,
        format: u32,
        max: u32,
    },

    #[error("malformed assertion {0}")]
    Malformed(String),
}

/// Failure recorded against one group.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GroupError {
    #[error("{0} not found")]
    NotFound(AssertionRef),

    #[error("unresolved assertion")]
    Unresolved,

    #[error("{0}")]
    Fetch(String),

    #[error(transparent)]
    Batch(#[from] BatchError),

    #[error("cannot commit: {0}")]
    Commit(#[from] DbError),
}

impl GroupError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, GroupError::NotFound(_))
    }

    pub fn is_unresolved(&self) -> bool {
        matches!(self, GroupError::Unresolved)
    }
}

/// Resolution pool error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    #[error("{0} not found")]
    NotFound(AssertionRef),

    #[error("cannot add group {group:?}: pool already tracks the maximum of {max} groups")]
    TooManyGroups { group: String, max: usize },

    #[error("malformed assertion reference {0}")]
    InvalidReference(AssertionRef),

    #[error("unknown grouping {0:?}")]
    UnknownGrouping(Grouping),

    #[error("{0} is not tracked by the pool")]
    NotInPool(AssertionRef),

    #[error("internal error: {0}")]
    InvalidState(String),

    #[error(transparent)]
    Db(DbError),
}

impl PoolError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, PoolError::NotFound(_))
    }
}

/// Transport action error.
///
/// `no_results` with empty `other` just means the server had nothing to add.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ActionError {
    pub no_results: bool,
    pub other: Vec<String>,
    /// Per-assertion or per-grouping failures reported alongside.
    pub failures: Vec<ResolveFailure>,
}

impl ActionError {
    pub fn no_results() -> Self {
        Self {
            no_results: true,
            ..Default::default()
        }
    }

    /// Only "no results", nothing else went wrong.
    pub fn is_only_no_results(&self) -> bool {
        self.no_results && self.other.is_empty()
    }
}

impl fmt::Display for ActionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.no_results, self.other.as_slice()) {
            (true, []) => f.write_str("no install/refresh information results from the store"),
            (_, [single]) => write!(f, "cannot refresh: {single}"),
            (_, []) => f.write_str("cannot refresh: unexpected action error"),
            (_, many) => {
                f.write_str("cannot refresh:")?;
                for e in many {
                    write!(f, "\n{e}")?;
                }
                Ok(())
            }
        }
    }
}

impl StdError for ActionError {}

/// A failure the server reported for part of an action request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolveFailure {
    Assertion {
        reference: AssertionRef,
        error: GroupError,
    },
    Grouping {
        grouping: Grouping,
        error: GroupError,
    },
}

/// Transport error, as a closed set of shapes the refresh logic can match on.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error(transparent)]
    Action(#[from] ActionError),

    #[error("unexpected HTTP status code {status} on {method} request to {url:?}")]
    UnexpectedHttpStatus {
        status: u16,
        method: String,
        url: String,
    },

    #[error("{0} not found")]
    NotFound(AssertionRef),

    #[error("network error: {0}")]
    Network(String),

    #[error(transparent)]
    Other(Box<dyn StdError + Send + Sync + 'static>),
}

/// Marker error asking the caller to abandon bulk refresh and use the
/// one-by-one strategy instead.
#[derive(Debug, Error)]
#[error("unsuccessful bulk assertion refresh, fallback: {source}")]
pub struct FallbackError {
    #[source]
    source: Box<dyn StdError + Send + Sync + 'static>,
}

impl FallbackError {
    pub fn new(source: impl StdError + Send + Sync + 'static) -> Self {
        Self {
            source: Box::new(source),
        }
    }
}

impl From<TransportError> for FallbackError {
    fn from(err: TransportError) -> Self {
        Self::new(err)
    }
}

impl From<PoolError> for FallbackError {
    fn from(err: PoolError) -> Self {
        Self::new(err)
    }
}

pub const DEFAULT_RESOLVE_MESSAGE: &str = "cannot fetch and resolve assertions";

/// Per-group errors of one or more resolution passes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvePoolError {
    pub message: String,
    pub errors: BTreeMap<String, GroupError>,
}

impl ResolvePoolError {
    pub fn new(errors: BTreeMap<String, GroupError>) -> Self {
        Self {
            message: String::new(),
            errors,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    /// Fold `other` in. Entries from `other` win on a repeated group.
    pub fn merge(&mut self, other: ResolvePoolError) {
        self.errors.extend(other.errors);
    }

    /// Drop `group`'s error if `benign` says so.
    pub fn suppress(&mut self, group: &str, benign: impl Fn(&GroupError) -> bool) {
        if self.errors.get(group).is_some_and(benign) {
            self.errors.remove(group);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }
}

impl fmt::Display for ResolvePoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let message = if self.message.is_empty() {
            DEFAULT_RESOLVE_MESSAGE
        } else {
            self.message.as_str()
        };
        write!(f, "{message}:")?;
        for (group, err) in &self.errors {
            write!(f, "\n - {group}: {err}")?;
        }
        Ok(())
    }
}

impl StdError for ResolvePoolError {}

/// Top-level refresh error.
#[derive(Debug, Error)]
pub enum RefreshError {
    #[error("cannot prepare package-declaration refresh for package {package:?}: {source}")]
    Prepare {
        package: String,
        #[source]
        source: PoolError,
    },

    #[error("cannot prepare store assertion refresh: {0}")]
    PrepareStore(#[source] PoolError),

    #[error("cannot prepare store assertion fetching: {0}")]
    PrepareStoreFetch(#[source] PoolError),

    #[error(transparent)]
    Fallback(#[from] FallbackError),

    #[error(transparent)]
    Resolve(#[from] ResolvePoolError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Db(#[from] DbError),

    #[error("unknown user id {0}")]
    UnknownUser(UserId),

    #[error("shared state lock is not held")]
    StateNotLocked,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("logging setup failed: {0}")]
    Logging(String),
}

impl RefreshError {
    /// Whether the caller should retry with the one-by-one strategy.
    pub fn is_fallback(&self) -> bool {
        matches!(self, RefreshError::Fallback(_))
    }

    pub fn as_resolve(&self) -> Option<&ResolvePoolError> {
        match self {
            RefreshError::Resolve(e) => Some(e),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, RefreshError>;
