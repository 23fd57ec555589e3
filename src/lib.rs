//! # Anyid (multi-identifier authentication core)
//!
//! `anyid` is the identity core of an authentication service where users
//! sign up and sign in with any combination of username, email address or
//! phone number, plus a password.
//!
//! ## Identifier Classification
//!
//! A bare sign-in string is classified by syntactic shape alone, and the
//! three shapes are mutually exclusive by construction: usernames never
//! contain `@` and never open with a decimal digit or `+`, emails always
//! carry exactly one `@`, phone numbers are digits plus separator
//! punctuation. Stored values are normalized before validation (NFKC for
//! usernames, lowercase + IDNA domain encoding for emails, E.164 shaping
//! for phones), and uniqueness is case-insensitive for usernames, exact
//! post-normalization for the other two.
//!
//! ## Out-of-band Verification
//!
//! Every email or phone a user holds is tracked by an OTP credential:
//! random single-use secrets, optional expiry, and an exponential-backoff
//! lockout (1s, 2s, 4s, ...) that rejects everything, the correct secret
//! included, until the window elapses. Changing an identifier rebinds its
//! credentials in place and revokes any pending or confirmed state;
//! clearing it deletes them.
//!
//! ## Collaborators
//!
//! Persistence, password hashing and outbound delivery are injected
//! strategy objects resolved at startup. The crate ships a Postgres store,
//! an in-memory store, an Argon2id hasher and a no-op delivery; everything
//! else is brought by the embedding service.

pub mod classify;
pub mod clock;
pub mod credential;
pub mod delivery;
pub mod error;
pub mod otp;
pub mod password;
pub mod redact;
pub mod service;
pub mod store;
pub mod throttle;
pub mod user;

pub use classify::IdentifierKind;
pub use clock::{Clock, ManualClock, SystemClock};
pub use credential::{ChallengePurpose, OtpCredential};
pub use delivery::{NoopDelivery, SecretDelivery, TransmissionError};
pub use error::{Error, FieldErrors};
pub use otp::{OtpConfig, OtpSecret};
pub use password::{Argon2Hasher, PasswordHasher};
pub use service::{IdentityConfig, IdentityService};
pub use store::{IdentityStore, MemoryStore, PgStore, StoreError};
pub use throttle::Throttle;
pub use user::{ContactKind, NewUser, UserRecord};
