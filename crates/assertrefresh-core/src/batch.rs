//! Batches of downloaded assertions.

use std::collections::HashSet;
use std::sync::Arc;

use crate::db::TrustDb;
use crate::error::BatchError;
use crate::types::{Assertion, AssertionRef};

/// Decides what to do with an assertion whose format is too new.
///
/// Returning `Ok(())` drops the assertion from the batch; an error fails the batch.
pub type UnsupportedHandler =
    Arc<dyn Fn(&AssertionRef, &BatchError) -> Result<(), BatchError> + Send + Sync>;

/// Tolerate too-new formats for assertions we already hold some revision of.
///
/// The local revision keeps working, so the update is skipped with a warning.
/// Without any local revision the error stands.
pub fn handle_unsupported(db: Arc<dyn TrustDb>) -> UnsupportedHandler {
    Arc::new(move |reference, err| {
        if db.contains(reference) {
            tracing::warn!("Cannot update assertion {}: {}", reference, err);
            Ok(())
        } else {
            Err(err.clone())
        }
    })
}

pub(crate) fn unsupported_format(assertion: &Assertion) -> BatchError {
    BatchError::UnsupportedFormat {
        reference: assertion.reference(),
        assertion_type: assertion.assertion_type,
        format: assertion.format,
        max: assertion.assertion_type.max_supported_format(),
    }
}

/// Write-once collection of assertions for one grouping.
pub struct Batch {
    assertions: Vec<Assertion>,
    seen: HashSet<AssertionRef>,
    unsupported: Option<UnsupportedHandler>,
}

impl Batch {
    pub fn new(unsupported: Option<UnsupportedHandler>) -> Self {
        Self {
            assertions: Vec::new(),
            seen: HashSet::new(),
            unsupported,
        }
    }

    /// Add one assertion. Duplicates are ignored.
    pub fn add(&mut self, assertion: Assertion) -> Result<(), BatchError> {
        let reference = assertion.reference();
        if !reference.is_well_formed() {
            return Err(BatchError::Malformed(reference.to_string()));
        }

        if !assertion.is_format_supported() {
            let err = unsupported_format(&assertion);
            return match &self.unsupported {
                Some(handler) => handler(&reference, &err),
                None => Err(err),
            };
        }

        if self.seen.insert(reference) {
            self.assertions.push(assertion);
        }
        Ok(())
    }

    /// Add a whole decoded stream; stops at the first error.
    pub fn add_stream(
        &mut self,
        stream: impl IntoIterator<Item = Assertion>,
    ) -> Result<(), BatchError> {
        for assertion in stream {
            self.add(assertion)?;
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.assertions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assertions.is_empty()
    }

    pub fn into_assertions(self) -> Vec<Assertion> {
        self.assertions
    }
}
