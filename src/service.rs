//! High-level identity operations.
//!
//! [`IdentityService`] owns the orchestration: classification and
//! normalization on every write, credential lifecycle fan-out inside the
//! same store transaction as the user mutation, throttled OTP issue/verify,
//! and password login across all three identifier kinds. Collaborators are
//! injected once at construction and never resolved at call time.

use std::sync::Arc;

use rand::rngs::OsRng;
use rand::RngCore;
use secrecy::SecretString;
use tracing::{debug, info};
use uuid::Uuid;

use crate::classify::{self, IdentifierKind};
use crate::clock::Clock;
use crate::credential::{on_contact_changed, ChallengePurpose, OtpCredential};
use crate::delivery::SecretDelivery;
use crate::error::{Error, FieldErrors};
use crate::otp::{OtpConfig, DEFAULT_ALPHABET};
use crate::password::PasswordHasher;
use crate::redact;
use crate::store::{IdentityStore, StoreError};
use crate::user::{self, ContactKind, NewUser, UserRecord};

/// Per-purpose OTP shapes.
#[derive(Clone, Debug)]
pub struct IdentityConfig {
    setup_otp: OtpConfig,
    login_otp: OtpConfig,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            setup_otp: OtpConfig::new(),
            login_otp: OtpConfig::numeric_short_lived(),
        }
    }
}

impl IdentityConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_setup_otp(mut self, config: OtpConfig) -> Self {
        self.setup_otp = config;
        self
    }

    #[must_use]
    pub fn with_login_otp(mut self, config: OtpConfig) -> Self {
        self.login_otp = config;
        self
    }

    #[must_use]
    pub fn otp_for(&self, purpose: ChallengePurpose) -> &OtpConfig {
        match purpose {
            ChallengePurpose::Setup => &self.setup_otp,
            ChallengePurpose::Login => &self.login_otp,
        }
    }
}

/// The identity core service.
pub struct IdentityService {
    store: Arc<dyn IdentityStore>,
    hasher: Arc<dyn PasswordHasher>,
    delivery: Arc<dyn SecretDelivery>,
    clock: Arc<dyn Clock>,
    config: IdentityConfig,
    /// Hash of a random throwaway password, verified against when a login
    /// identifier matches nobody so lookups stay timing-uniform.
    login_dummy_hash: String,
}

impl IdentityService {
    /// Wires the service up with its collaborators.
    ///
    /// # Errors
    /// Returns [`Error::Hashing`] when the dummy login hash cannot be
    /// produced.
    pub fn new(
        store: Arc<dyn IdentityStore>,
        hasher: Arc<dyn PasswordHasher>,
        delivery: Arc<dyn SecretDelivery>,
        clock: Arc<dyn Clock>,
        config: IdentityConfig,
    ) -> Result<Self, Error> {
        let login_dummy_hash = hasher.hash(&random_password())?;
        Ok(Self {
            store,
            hasher,
            delivery,
            clock,
            config,
            login_dummy_hash,
        })
    }

    /// Creates a user: normalizes and validates every supplied identifier,
    /// hashes the password (or stores an unusable marker), and persists the
    /// user with one setup credential per contact channel, atomically.
    ///
    /// # Errors
    /// [`Error::Validation`] on malformed, blank, missing or duplicate
    /// identifiers.
    pub async fn signup(&self, new: NewUser) -> Result<UserRecord, Error> {
        let validated = user::validate_identifiers(
            new.username.as_deref(),
            new.email.as_deref(),
            new.phone.as_deref(),
        )?;
        let password_hash = match &new.password {
            Some(password) => self.hasher.hash(password)?,
            None => self.hasher.set_unusable(),
        };

        let now = self.clock.now();
        let record = UserRecord {
            id: Uuid::new_v4(),
            username: validated.username,
            username_folded: validated.username_folded,
            email: validated.email,
            phone: validated.phone,
            password_hash,
            created_at: now,
            updated_at: now,
        };

        let credentials: Vec<OtpCredential> = ContactKind::ALL
            .iter()
            .filter_map(|kind| {
                record.contact(*kind).map(|value| {
                    OtpCredential::new(record.id, *kind, ChallengePurpose::Setup, value, now)
                })
            })
            .collect();

        self.store
            .insert_user(&record, &credentials)
            .await
            .map_err(map_store)?;
        info!(user = %record.id, "created user");
        Ok(record)
    }

    /// Fetches a user by id.
    ///
    /// # Errors
    /// [`Error::NotFound`] when no such user exists.
    pub async fn user(&self, id: Uuid) -> Result<UserRecord, Error> {
        self.store.fetch_user(id).await.map_err(map_store)
    }

    /// Resolves a bare sign-in string to a user, inferring the identifier
    /// kind from its shape.
    ///
    /// # Errors
    /// Only on storage failure; an unmatched identifier is `Ok(None)`.
    pub async fn find_by_identifier(&self, raw: &str) -> Result<Option<UserRecord>, Error> {
        let result = match classify::classify(raw) {
            IdentifierKind::Username => {
                self.store
                    .find_by_username(&classify::fold_username(raw))
                    .await
            }
            IdentifierKind::Email => {
                self.store
                    .find_by_email(&classify::normalize_email(raw))
                    .await
            }
            IdentifierKind::Phone => {
                self.store
                    .find_by_phone(&classify::normalize_phone(raw))
                    .await
            }
        };
        result.map_err(map_store)
    }

    /// Password sign-in against any identifier kind. Returns `Ok(None)` for
    /// both unknown identifiers and wrong passwords; the two are kept
    /// indistinguishable, and unknown identifiers still burn a hash
    /// verification so response timing does not leak account existence.
    ///
    /// # Errors
    /// Only on storage failure.
    pub async fn login(
        &self,
        raw_identifier: &str,
        password: &SecretString,
    ) -> Result<Option<UserRecord>, Error> {
        match self.find_by_identifier(raw_identifier).await? {
            Some(record) => {
                if self.hasher.verify(password, &record.password_hash) {
                    debug!(user = %record.id, "password login succeeded");
                    Ok(Some(record))
                } else {
                    debug!(user = %record.id, "password login failed");
                    Ok(None)
                }
            }
            None => {
                self.hasher.verify(password, &self.login_dummy_hash);
                Ok(None)
            }
        }
    }

    /// Sets or clears the username.
    ///
    /// # Errors
    /// [`Error::Validation`] on a malformed value, a duplicate, or when the
    /// change would leave the user without any identifier.
    pub async fn set_username(&self, id: Uuid, value: Option<&str>) -> Result<UserRecord, Error> {
        let mut record = self.user(id).await?;

        let username = match value {
            Some(raw) => match user::check_username(raw) {
                Ok(normalized) => Some(normalized),
                Err(message) => {
                    let mut errors = FieldErrors::new();
                    errors.push("username", message);
                    return Err(Error::Validation(errors));
                }
            },
            None => None,
        };

        record.username_folded = username.as_deref().map(classify::fold_username);
        record.username = username;
        ensure_identified(&record)?;
        record.updated_at = self.clock.now();

        self.store.update_user(&record).await.map_err(map_store)?;
        Ok(record)
    }

    /// Sets or clears the email address, driving the credential lifecycle
    /// for the channel in the same transaction.
    ///
    /// # Errors
    /// See [`IdentityService::set_username`].
    pub async fn set_email(&self, id: Uuid, value: Option<&str>) -> Result<UserRecord, Error> {
        self.set_contact(id, ContactKind::Email, value).await
    }

    /// Sets or clears the phone number, driving the credential lifecycle
    /// for the channel in the same transaction.
    ///
    /// # Errors
    /// See [`IdentityService::set_username`].
    pub async fn set_phone(&self, id: Uuid, value: Option<&str>) -> Result<UserRecord, Error> {
        self.set_contact(id, ContactKind::Phone, value).await
    }

    async fn set_contact(
        &self,
        id: Uuid,
        kind: ContactKind,
        value: Option<&str>,
    ) -> Result<UserRecord, Error> {
        let mut record = self.user(id).await?;

        let checked = match value {
            Some(raw) => {
                let result = match kind {
                    ContactKind::Email => user::check_email(raw),
                    ContactKind::Phone => user::check_phone(raw),
                };
                match result {
                    Ok(normalized) => Some(normalized),
                    Err(message) => {
                        let mut errors = FieldErrors::new();
                        errors.push(kind.as_str(), message);
                        return Err(Error::Validation(errors));
                    }
                }
            }
            None => None,
        };

        let now = self.clock.now();
        let old = record.contact(kind).map(str::to_string);
        let change = on_contact_changed(record.id, kind, old.as_deref(), checked.as_deref(), now);

        match kind {
            ContactKind::Email => record.email = checked,
            ContactKind::Phone => record.phone = checked,
        }
        ensure_identified(&record)?;
        record.updated_at = now;

        self.store
            .update_contact(&record, kind, &change)
            .await
            .map_err(map_store)?;
        debug!(user = %record.id, kind = kind.as_str(), "contact updated");
        Ok(record)
    }

    /// Replaces the password; `None` stores an unusable marker.
    ///
    /// # Errors
    /// [`Error::NotFound`] for an unknown user, [`Error::Hashing`] when
    /// hashing fails.
    pub async fn set_password(
        &self,
        id: Uuid,
        password: Option<&SecretString>,
    ) -> Result<(), Error> {
        let mut record = self.user(id).await?;
        record.password_hash = match password {
            Some(password) => self.hasher.hash(password)?,
            None => self.hasher.set_unusable(),
        };
        record.updated_at = self.clock.now();
        self.store.update_user(&record).await.map_err(map_store)
    }

    /// Deletes a user and, by cascade, every credential it owns.
    ///
    /// # Errors
    /// [`Error::NotFound`] for an unknown user.
    pub async fn delete_user(&self, id: Uuid) -> Result<(), Error> {
        self.store.delete_user(id).await.map_err(map_store)?;
        info!(user = %id, "deleted user");
        Ok(())
    }

    /// Generates a fresh secret for the channel and hands it to the
    /// delivery collaborator. The pending state is persisted before the
    /// send is attempted; a delivery failure surfaces as
    /// [`Error::Transmission`] but leaves the generated secret valid.
    ///
    /// # Errors
    /// [`Error::NotFound`] when the channel has no credential (and, for
    /// login codes, the user has no such contact), [`Error::Transmission`]
    /// when delivery fails.
    pub async fn issue_challenge(
        &self,
        user_id: Uuid,
        kind: ContactKind,
        purpose: ChallengePurpose,
    ) -> Result<(), Error> {
        let record = self.user(user_id).await?;
        let now = self.clock.now();
        let otp_config = self.config.otp_for(purpose);

        let (credential, secret) = match self.store.fetch_credential(user_id, kind, purpose).await {
            Ok(mut credential) => {
                let expected = credential.otp.throttle().failure_count();
                // Re-capture the live address; lifecycle rebinds keep the
                // two in sync, this covers the window where they drifted.
                if let Some(value) = record.contact(kind) {
                    credential.bound_value = value.to_string();
                }
                let secret = credential.otp.generate(otp_config, &mut OsRng, now);
                credential.updated_at = now;
                self.store
                    .update_credential_guarded(&credential, expected)
                    .await
                    .map_err(map_store)?;
                (credential, secret)
            }
            Err(StoreError::CredentialNotFound) if purpose == ChallengePurpose::Login => {
                let Some(value) = record.contact(kind) else {
                    return Err(Error::NotFound("credential"));
                };
                let mut credential = OtpCredential::new(user_id, kind, purpose, value, now);
                let secret = credential.otp.generate(otp_config, &mut OsRng, now);
                self.store
                    .insert_credential(&credential)
                    .await
                    .map_err(map_store)?;
                (credential, secret)
            }
            Err(err) => return Err(map_store(err)),
        };

        let destination = credential.bound_value.as_str();
        let redacted = match kind {
            ContactKind::Email => redact::obscure_email(destination),
            ContactKind::Phone => redact::obscure_phone(destination),
        };
        debug!(
            user = %user_id,
            kind = kind.as_str(),
            purpose = purpose.as_str(),
            destination = %redacted,
            "issued challenge"
        );
        self.delivery.send(kind, destination, &secret).await?;
        Ok(())
    }

    /// Checks a submitted secret for the channel. `Ok(false)` covers both a
    /// wrong and an expired secret; lockout and blank submissions are
    /// distinct errors and leave the stored state untouched.
    ///
    /// # Errors
    /// [`Error::InvalidArgument`] for an empty submission,
    /// [`Error::Timeout`] during an active lockout, [`Error::NotFound`]
    /// when the channel has no credential.
    pub async fn verify_challenge(
        &self,
        user_id: Uuid,
        kind: ContactKind,
        purpose: ChallengePurpose,
        submitted: &str,
    ) -> Result<bool, Error> {
        let mut credential = self
            .store
            .fetch_credential(user_id, kind, purpose)
            .await
            .map_err(map_store)?;
        let expected = credential.otp.throttle().failure_count();
        let now = self.clock.now();

        let passed = credential.otp.verify(submitted, now)?;
        credential.updated_at = now;
        self.store
            .update_credential_guarded(&credential, expected)
            .await
            .map_err(map_store)?;

        debug!(
            user = %user_id,
            kind = kind.as_str(),
            purpose = purpose.as_str(),
            passed,
            "verified challenge"
        );
        Ok(passed)
    }

    /// True when the channel was confirmed *and* the confirmation still
    /// applies to the user's current value. A credential confirmed for an
    /// address the user has since changed counts as unverified; callers
    /// should re-issue a challenge instead of trusting the old binding.
    ///
    /// # Errors
    /// Only on storage failure; a missing credential is `Ok(false)`.
    pub async fn contact_is_verified(
        &self,
        user_id: Uuid,
        kind: ContactKind,
    ) -> Result<bool, Error> {
        let record = self.user(user_id).await?;
        match self
            .store
            .fetch_credential(user_id, kind, ChallengePurpose::Setup)
            .await
        {
            Ok(credential) => Ok(credential.otp.is_confirmed() && !credential.is_stale(&record)),
            Err(StoreError::CredentialNotFound) => Ok(false),
            Err(err) => Err(map_store(err)),
        }
    }
}

fn ensure_identified(record: &UserRecord) -> Result<(), Error> {
    if record.has_identifier() {
        return Ok(());
    }
    let mut errors = FieldErrors::new();
    errors.push(
        "identifier",
        "at least one of username, email or phone is required",
    );
    Err(Error::Validation(errors))
}

fn map_store(err: StoreError) -> Error {
    match err {
        StoreError::UserNotFound => Error::NotFound("user"),
        StoreError::CredentialNotFound => Error::NotFound("credential"),
        StoreError::Duplicate(field) => {
            let mut errors = FieldErrors::new();
            errors.push(field, "already taken");
            Error::Validation(errors)
        }
        other => Error::Store(other),
    }
}

fn random_password() -> SecretString {
    let alphabet = DEFAULT_ALPHABET.as_bytes();
    let mut raw = [0u8; 32];
    OsRng.fill_bytes(&mut raw);
    let password: String = raw
        .iter()
        .map(|byte| alphabet[usize::from(*byte) % alphabet.len()] as char)
        .collect();
    SecretString::from(password)
}
