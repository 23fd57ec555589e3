//! OTP credentials: the persisted binding between a user's contact channel
//! and one secret lifecycle.
//!
//! Two purposes share the same state machine. `Setup` credentials are
//! created automatically whenever a user gains an email or phone and track
//! whether that channel was ever proven. `Login` credentials are issued on
//! demand for login-style one-time codes. The bound value is captured when
//! the credential is created or rebound, never read live from the owner, so
//! drift between the two is detectable.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::otp::OtpSecret;
use crate::user::{ContactKind, UserRecord};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChallengePurpose {
    /// Out-of-band proof that the user controls the address.
    Setup,
    /// Ongoing login-style one-time codes.
    Login,
}

impl ChallengePurpose {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Setup => "setup",
            Self::Login => "login",
        }
    }
}

/// One persisted OTP lifecycle bound to one (owner, channel, purpose).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OtpCredential {
    pub id: Uuid,
    pub user_id: Uuid,
    pub kind: ContactKind,
    pub purpose: ChallengePurpose,
    /// The address the secret was generated for, captured at bind time.
    pub bound_value: String,
    pub otp: OtpSecret,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OtpCredential {
    #[must_use]
    pub fn new(
        user_id: Uuid,
        kind: ContactKind,
        purpose: ChallengePurpose,
        bound_value: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            kind,
            purpose,
            bound_value: bound_value.into(),
            otp: OtpSecret::default(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Points the credential at a new address and wipes its verification
    /// state. The row identity is preserved; only the binding changes.
    pub fn rebind(&mut self, value: impl Into<String>, now: DateTime<Utc>) {
        self.bound_value = value.into();
        self.otp.invalidate();
        self.updated_at = now;
    }

    /// True when the owner's live field no longer matches the value this
    /// credential was bound to. A confirmed-but-stale credential proves an
    /// address the user no longer has; callers wanting a verified *current*
    /// channel must check this and re-issue rather than trust the binding
    /// forever.
    #[must_use]
    pub fn is_stale(&self, owner: &UserRecord) -> bool {
        owner.contact(self.kind) != Some(self.bound_value.as_str())
    }
}

/// Lifecycle effect of one contact-field transition, applied by the store
/// in the same transaction as the owning user update.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ContactChange {
    /// The field went from unset to a value: start tracking it.
    Create(OtpCredential),
    /// The field moved to a different value: rebind every credential row
    /// for this channel in place.
    Rebind { value: String, at: DateTime<Utc> },
    /// The field was cleared: drop every credential row for this channel.
    Delete,
    /// No effective change.
    Unchanged,
}

/// Computes the credential lifecycle effect of an identifier change. Called
/// synchronously from the user mutation path; the returned change is
/// persisted atomically with the user row.
#[must_use]
pub fn on_contact_changed(
    user_id: Uuid,
    kind: ContactKind,
    old: Option<&str>,
    new: Option<&str>,
    now: DateTime<Utc>,
) -> ContactChange {
    match (old, new) {
        (None, Some(value)) => ContactChange::Create(OtpCredential::new(
            user_id,
            kind,
            ChallengePurpose::Setup,
            value,
            now,
        )),
        (Some(_), None) => ContactChange::Delete,
        (Some(old_value), Some(new_value)) if old_value != new_value => ContactChange::Rebind {
            value: new_value.to_string(),
            at: now,
        },
        _ => ContactChange::Unchanged,
    }
}
