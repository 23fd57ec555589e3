//! Outbound delivery of generated secrets.
//!
//! Sending email or SMS is an external collaborator injected at startup.
//! The core only calls [`SecretDelivery::send`] after the new secret has
//! been persisted, and a delivery failure surfaces to the caller without
//! rolling the secret back, so a retry can reuse the same challenge.

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

use crate::redact;
use crate::user::ContactKind;

/// The delivery collaborator could not hand the secret off.
#[derive(Debug, Error)]
#[error("failed to deliver secret to {destination}: {reason}")]
pub struct TransmissionError {
    pub destination: String,
    pub reason: String,
}

impl TransmissionError {
    #[must_use]
    pub fn new(destination: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            destination: destination.into(),
            reason: reason.into(),
        }
    }
}

/// Strategy object for sending a secret to an email address or phone
/// number. Resolved once at process startup, never looked up at call time.
#[async_trait]
pub trait SecretDelivery: Send + Sync {
    /// Hands `secret` off for delivery to `destination`.
    ///
    /// # Errors
    /// Returns [`TransmissionError`] when the channel rejects the send.
    async fn send(
        &self,
        kind: ContactKind,
        destination: &str,
        secret: &str,
    ) -> Result<(), TransmissionError>;
}

/// Delivery that logs a redacted destination and drops the secret. Useful
/// in tests and in composition roots that wire delivery up later.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopDelivery;

#[async_trait]
impl SecretDelivery for NoopDelivery {
    async fn send(
        &self,
        kind: ContactKind,
        destination: &str,
        _secret: &str,
    ) -> Result<(), TransmissionError> {
        let redacted = match kind {
            ContactKind::Email => redact::obscure_email(destination),
            ContactKind::Phone => redact::obscure_phone(destination),
        };
        debug!(kind = kind.as_str(), destination = %redacted, "dropping secret delivery");
        Ok(())
    }
}
