//! One-time secret generation and verification.
//!
//! An [`OtpSecret`] moves between two states: empty (no secret outstanding)
//! and pending (a secret was generated and not yet consumed). Successful
//! verification consumes the secret and marks the channel confirmed; a new
//! generation overwrites whatever was pending. Throttling is orthogonal:
//! the embedded [`Throttle`] can lock the channel regardless of which state
//! the secret is in.

use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::throttle::{Throttle, ThrottledVerifier};

/// Default alphabet avoids ambiguous glyphs (no 0/O, 1/I/L) so secrets
/// survive being read aloud or retyped from a small screen.
pub const DEFAULT_ALPHABET: &str = "ABCDEFGHJKMNPQRSTUVWXYZ23456789";
const DEFAULT_LENGTH: usize = 8;

/// Secret shape: alphabet, length and optional time-to-live.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OtpConfig {
    alphabet: String,
    length: usize,
    ttl: Option<Duration>,
}

impl Default for OtpConfig {
    fn default() -> Self {
        Self {
            alphabet: DEFAULT_ALPHABET.to_string(),
            length: DEFAULT_LENGTH,
            ttl: None,
        }
    }
}

impl OtpConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Numeric six-digit shape with a short life, the common SMS profile.
    #[must_use]
    pub fn numeric_short_lived() -> Self {
        Self::new()
            .with_alphabet("0123456789")
            .with_length(6)
            .with_ttl(Duration::minutes(5))
    }

    #[must_use]
    pub fn with_alphabet(mut self, alphabet: impl Into<String>) -> Self {
        self.alphabet = alphabet.into();
        self
    }

    #[must_use]
    pub fn with_length(mut self, length: usize) -> Self {
        self.length = length;
        self
    }

    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    #[must_use]
    pub fn without_ttl(mut self) -> Self {
        self.ttl = None;
        self
    }

    #[must_use]
    pub fn length(&self) -> usize {
        self.length
    }

    #[must_use]
    pub fn ttl(&self) -> Option<Duration> {
        self.ttl
    }
}

/// The persisted verification state of one out-of-band channel.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OtpSecret {
    secret: Option<String>,
    confirmed: bool,
    expires_at: Option<DateTime<Utc>>,
    throttle: Throttle,
}

impl OtpSecret {
    #[must_use]
    pub fn new(
        secret: Option<String>,
        confirmed: bool,
        expires_at: Option<DateTime<Utc>>,
        throttle: Throttle,
    ) -> Self {
        Self {
            secret,
            confirmed,
            expires_at,
            throttle,
        }
    }

    #[must_use]
    pub fn secret(&self) -> Option<&str> {
        self.secret.as_deref()
    }

    #[must_use]
    pub fn is_confirmed(&self) -> bool {
        self.confirmed
    }

    #[must_use]
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }

    #[must_use]
    pub fn throttle(&self) -> &Throttle {
        &self.throttle
    }

    /// Draws a fresh secret from the configured alphabet and arms the
    /// channel: confirmation and throttle state reset, expiry set when the
    /// config carries a ttl. Returns the plaintext for delivery; the caller
    /// persists `self` before attempting to send.
    pub fn generate<R: RngCore + ?Sized>(
        &mut self,
        config: &OtpConfig,
        rng: &mut R,
        now: DateTime<Utc>,
    ) -> String {
        let secret = draw_secret(config, rng);
        self.secret = Some(secret.clone());
        self.confirmed = false;
        self.expires_at = config.ttl.map(|ttl| now + ttl);
        self.throttle = Throttle::default();
        secret
    }

    /// Applies the reset side effects of a generation without drawing a new
    /// secret: pending secret cleared, confirmation revoked, expiry and
    /// throttle state wiped. Used when the bound identifier changes under
    /// the channel.
    pub fn invalidate(&mut self) {
        self.secret = None;
        self.confirmed = false;
        self.expires_at = None;
        self.throttle = Throttle::default();
    }

    /// Checks `submitted` against the pending secret.
    ///
    /// Empty submissions are rejected up front and never touch the
    /// throttle. An active lockout rejects everything, the correct secret
    /// included. An expired secret counts as a plain failure without the
    /// secrets being compared, so callers cannot distinguish expiry from a
    /// wrong guess. On success the secret is consumed, the channel marked
    /// confirmed and the throttle cleared.
    ///
    /// # Errors
    /// [`Error::InvalidArgument`] for an empty submission,
    /// [`Error::Timeout`] while locked out.
    pub fn verify(&mut self, submitted: &str, now: DateTime<Utc>) -> Result<bool, Error> {
        if submitted.is_empty() {
            return Err(Error::InvalidArgument("secret"));
        }

        let expired = self.expires_at.is_some_and(|deadline| now >= deadline);
        let matches = !expired
            && self
                .secret
                .as_deref()
                .is_some_and(|stored| constant_time_eq(stored.as_bytes(), submitted.as_bytes()));

        let passed = ThrottledVerifier::new(&mut self.throttle).verify(now, || matches)?;
        if passed {
            self.secret = None;
            self.confirmed = true;
            self.expires_at = None;
        }
        Ok(passed)
    }
}

fn draw_secret<R: RngCore + ?Sized>(config: &OtpConfig, rng: &mut R) -> String {
    let alphabet: Vec<char> = config.alphabet.chars().collect();
    debug_assert!(!alphabet.is_empty(), "otp alphabet must not be empty");
    let mut raw = vec![0u8; config.length];
    rng.fill_bytes(&mut raw);
    raw.iter()
        .map(|byte| alphabet[usize::from(*byte) % alphabet.len()])
        .collect()
}

/// Constant-time comparison of two byte slices.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut acc = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        acc |= x ^ y;
    }
    acc == 0
}
