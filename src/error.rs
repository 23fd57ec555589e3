//! Crate-wide error taxonomy.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::delivery::TransmissionError;
use crate::store::StoreError;

/// Field-keyed validation messages, accumulated across all fields in one
/// pass so callers can render the complete error map rather than the first
/// failure.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct FieldErrors {
    fields: BTreeMap<&'static str, Vec<String>>,
}

impl FieldErrors {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, field: &'static str, message: impl Into<String>) {
        self.fields.entry(field).or_default().push(message.into());
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    #[must_use]
    pub fn get(&self, field: &str) -> Option<&[String]> {
        self.fields.get(field).map(Vec::as_slice)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &[String])> {
        self.fields
            .iter()
            .map(|(field, messages)| (*field, messages.as_slice()))
    }

    /// Wraps the map in [`Error::Validation`] when any message was recorded.
    ///
    /// # Errors
    /// Returns `Error::Validation` carrying `self` if it is non-empty.
    pub fn into_result(self) -> Result<(), Error> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(Error::Validation(self))
        }
    }
}

impl fmt::Display for FieldErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (field, messages) in &self.fields {
            if !first {
                write!(f, "; ")?;
            }
            first = false;
            write!(f, "{field}: {}", messages.join(", "))?;
        }
        Ok(())
    }
}

/// Errors surfaced by the identity core.
///
/// Wrong and expired secrets are not errors: verification returns
/// `Ok(false)` for both so callers cannot use the distinction as an
/// expiry-timing oracle.
#[derive(Debug, Error)]
pub enum Error {
    /// One or more fields failed validation; carries the full error map.
    #[error("validation failed: {0}")]
    Validation(FieldErrors),

    /// A verify was attempted during an active lockout window. Distinct from
    /// a wrong secret; carries the data for caller-side backoff messaging.
    #[error("verification locked until {locked_until} after {failure_count} failures")]
    Timeout {
        locked_until: DateTime<Utc>,
        failure_count: u32,
    },

    /// The delivery collaborator could not send a secret. The generated
    /// secret stays valid; retrying is the caller's decision.
    #[error("secret delivery failed")]
    Transmission(#[from] TransmissionError),

    /// A null or empty argument was submitted; rejected before any throttle
    /// bookkeeping runs.
    #[error("missing or empty {0}")]
    InvalidArgument(&'static str),

    /// The requested entity does not exist.
    #[error("{0} not found")]
    NotFound(&'static str),

    /// The password hashing collaborator failed.
    #[error("password hashing failed: {0}")]
    Hashing(String),

    /// The persistence collaborator failed.
    #[error("storage error")]
    Store(#[from] StoreError),
}
