//! Persistence collaborator contract.
//!
//! The core never talks to a database directly; it goes through
//! [`IdentityStore`]. Implementations must make every method atomic:
//! `insert_user` lands the user and its credentials or nothing,
//! `update_contact` applies the user row and the credential lifecycle in
//! one transaction, and `update_credential_guarded` is a compare-and-set on
//! the throttle state so concurrent verification attempts never lose
//! updates.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::credential::{ChallengePurpose, ContactChange, OtpCredential};
use crate::user::{ContactKind, UserRecord};

/// Failures surfaced by a store implementation.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("user not found")]
    UserNotFound,
    #[error("credential not found")]
    CredentialNotFound,
    /// A uniqueness constraint rejected the write; carries the field name.
    #[error("{0} is already taken")]
    Duplicate(&'static str),
    /// The guarded write lost a compare-and-set race.
    #[error("concurrent update conflict")]
    Conflict,
    #[error("storage backend failure")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// Atomic persistence operations for users and their OTP credentials.
#[async_trait]
pub trait IdentityStore: Send + Sync {
    /// Inserts a user and its initial credentials in one transaction.
    async fn insert_user(
        &self,
        user: &UserRecord,
        credentials: &[OtpCredential],
    ) -> Result<(), StoreError>;

    async fn fetch_user(&self, id: Uuid) -> Result<UserRecord, StoreError>;

    /// Case-insensitive username lookup; callers pass the folded form.
    async fn find_by_username(&self, username_folded: &str)
        -> Result<Option<UserRecord>, StoreError>;

    async fn find_by_email(&self, email: &str) -> Result<Option<UserRecord>, StoreError>;

    async fn find_by_phone(&self, phone: &str) -> Result<Option<UserRecord>, StoreError>;

    /// Persists non-contact fields (username, password hash).
    async fn update_user(&self, user: &UserRecord) -> Result<(), StoreError>;

    /// Persists a contact-field mutation together with its credential
    /// lifecycle effect, atomically.
    async fn update_contact(
        &self,
        user: &UserRecord,
        kind: ContactKind,
        change: &ContactChange,
    ) -> Result<(), StoreError>;

    /// Deletes the user and, by cascade, every credential it owns.
    async fn delete_user(&self, id: Uuid) -> Result<(), StoreError>;

    async fn insert_credential(&self, credential: &OtpCredential) -> Result<(), StoreError>;

    async fn fetch_credential(
        &self,
        user_id: Uuid,
        kind: ContactKind,
        purpose: ChallengePurpose,
    ) -> Result<OtpCredential, StoreError>;

    /// Writes a credential back, guarded by the failure count the caller
    /// read. Fails with [`StoreError::Conflict`] when another writer got
    /// there first.
    async fn update_credential_guarded(
        &self,
        credential: &OtpCredential,
        expected_failures: u32,
    ) -> Result<(), StoreError>;
}
