//! In-memory store for tests and embedders that bring their own
//! persistence later. One mutex over the whole state gives every operation
//! the same atomicity the contract demands from a real backend.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::credential::{ChallengePurpose, ContactChange, OtpCredential};
use crate::user::{ContactKind, UserRecord};

use super::{IdentityStore, StoreError};

#[derive(Debug, Default)]
struct Inner {
    users: HashMap<Uuid, UserRecord>,
    credentials: HashMap<Uuid, OtpCredential>,
}

impl Inner {
    fn duplicate_of(&self, user: &UserRecord) -> Option<&'static str> {
        for other in self.users.values() {
            if other.id == user.id {
                continue;
            }
            if user.username_folded.is_some() && other.username_folded == user.username_folded {
                return Some("username");
            }
            if user.email.is_some() && other.email == user.email {
                return Some("email");
            }
            if user.phone.is_some() && other.phone == user.phone {
                return Some("phone");
            }
        }
        None
    }

    fn apply_change(&mut self, user_id: Uuid, kind: ContactKind, change: &ContactChange) {
        match change {
            ContactChange::Create(credential) => {
                self.credentials.insert(credential.id, credential.clone());
            }
            ContactChange::Rebind { value, at } => {
                for credential in self.credentials.values_mut() {
                    if credential.user_id == user_id && credential.kind == kind {
                        credential.rebind(value.clone(), *at);
                    }
                }
            }
            ContactChange::Delete => {
                self.credentials
                    .retain(|_, credential| !(credential.user_id == user_id && credential.kind == kind));
            }
            ContactChange::Unchanged => {}
        }
    }
}

/// Mutex-guarded map store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl IdentityStore for MemoryStore {
    async fn insert_user(
        &self,
        user: &UserRecord,
        credentials: &[OtpCredential],
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if let Some(field) = inner.duplicate_of(user) {
            return Err(StoreError::Duplicate(field));
        }
        inner.users.insert(user.id, user.clone());
        for credential in credentials {
            inner.credentials.insert(credential.id, credential.clone());
        }
        Ok(())
    }

    async fn fetch_user(&self, id: Uuid) -> Result<UserRecord, StoreError> {
        let inner = self.inner.lock().await;
        inner.users.get(&id).cloned().ok_or(StoreError::UserNotFound)
    }

    async fn find_by_username(
        &self,
        username_folded: &str,
    ) -> Result<Option<UserRecord>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .users
            .values()
            .find(|user| user.username_folded.as_deref() == Some(username_folded))
            .cloned())
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<UserRecord>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .users
            .values()
            .find(|user| user.email.as_deref() == Some(email))
            .cloned())
    }

    async fn find_by_phone(&self, phone: &str) -> Result<Option<UserRecord>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .users
            .values()
            .find(|user| user.phone.as_deref() == Some(phone))
            .cloned())
    }

    async fn update_user(&self, user: &UserRecord) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if !inner.users.contains_key(&user.id) {
            return Err(StoreError::UserNotFound);
        }
        if let Some(field) = inner.duplicate_of(user) {
            return Err(StoreError::Duplicate(field));
        }
        inner.users.insert(user.id, user.clone());
        Ok(())
    }

    async fn update_contact(
        &self,
        user: &UserRecord,
        kind: ContactKind,
        change: &ContactChange,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if !inner.users.contains_key(&user.id) {
            return Err(StoreError::UserNotFound);
        }
        if let Some(field) = inner.duplicate_of(user) {
            return Err(StoreError::Duplicate(field));
        }
        inner.users.insert(user.id, user.clone());
        inner.apply_change(user.id, kind, change);
        Ok(())
    }

    async fn delete_user(&self, id: Uuid) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if inner.users.remove(&id).is_none() {
            return Err(StoreError::UserNotFound);
        }
        inner.credentials.retain(|_, credential| credential.user_id != id);
        Ok(())
    }

    async fn insert_credential(&self, credential: &OtpCredential) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if !inner.users.contains_key(&credential.user_id) {
            return Err(StoreError::UserNotFound);
        }
        inner.credentials.insert(credential.id, credential.clone());
        Ok(())
    }

    async fn fetch_credential(
        &self,
        user_id: Uuid,
        kind: ContactKind,
        purpose: ChallengePurpose,
    ) -> Result<OtpCredential, StoreError> {
        let inner = self.inner.lock().await;
        inner
            .credentials
            .values()
            .find(|credential| {
                credential.user_id == user_id
                    && credential.kind == kind
                    && credential.purpose == purpose
            })
            .cloned()
            .ok_or(StoreError::CredentialNotFound)
    }

    async fn update_credential_guarded(
        &self,
        credential: &OtpCredential,
        expected_failures: u32,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let Some(stored) = inner.credentials.get_mut(&credential.id) else {
            return Err(StoreError::CredentialNotFound);
        };
        if stored.otp.throttle().failure_count() != expected_failures {
            return Err(StoreError::Conflict);
        }
        *stored = credential.clone();
        Ok(())
    }
}
