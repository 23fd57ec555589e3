//! The user identity aggregate.
//!
//! A user is addressable by up to three identifiers. Writes normalize first
//! and validate second, accumulating every field failure into one error map.
//! Normalization is the only silent correction that ever happens to a
//! stored value.

use chrono::{DateTime, Utc};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::classify;
use crate::error::{Error, FieldErrors};

/// The two out-of-band contact channels a challenge can be bound to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContactKind {
    Email,
    Phone,
}

impl ContactKind {
    pub const ALL: [Self; 2] = [Self::Email, Self::Phone];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Email => "email",
            Self::Phone => "phone",
        }
    }
}

/// Signup input. Identifiers are raw caller-supplied strings; `None` means
/// the identifier is not being set at all, which is distinct from an empty
/// string (always a validation error).
#[derive(Debug, Default)]
pub struct NewUser {
    pub username: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub password: Option<SecretString>,
}

/// A persisted user identity.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: Uuid,
    /// NFKC-normalized display form.
    pub username: Option<String>,
    /// Case-folded form backing the case-insensitive uniqueness rule.
    pub username_folded: Option<String>,
    /// Normalized (lowercased, IDNA-encoded domain) address.
    pub email: Option<String>,
    /// Canonical E.164-shaped number.
    pub phone: Option<String>,
    pub password_hash: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UserRecord {
    /// The current value of one contact channel.
    #[must_use]
    pub fn contact(&self, kind: ContactKind) -> Option<&str> {
        match kind {
            ContactKind::Email => self.email.as_deref(),
            ContactKind::Phone => self.phone.as_deref(),
        }
    }

    #[must_use]
    pub fn has_identifier(&self) -> bool {
        self.username.is_some() || self.email.is_some() || self.phone.is_some()
    }
}

/// Identifier set after normalization and validation, ready to persist.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct ValidatedIdentifiers {
    pub username: Option<String>,
    pub username_folded: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
}

/// Normalizes and validates every supplied identifier, collecting all
/// failures before reporting.
///
/// # Errors
/// Returns [`Error::Validation`] with the complete field map when any
/// identifier is blank or malformed, or when no identifier is supplied.
pub(crate) fn validate_identifiers(
    username: Option<&str>,
    email: Option<&str>,
    phone: Option<&str>,
) -> Result<ValidatedIdentifiers, Error> {
    let mut errors = FieldErrors::new();

    let username = match username {
        Some(raw) => match check_username(raw) {
            Ok(normalized) => Some(normalized),
            Err(message) => {
                errors.push("username", message);
                None
            }
        },
        None => None,
    };
    let email = match email {
        Some(raw) => match check_email(raw) {
            Ok(normalized) => Some(normalized),
            Err(message) => {
                errors.push("email", message);
                None
            }
        },
        None => None,
    };
    let phone = match phone {
        Some(raw) => match check_phone(raw) {
            Ok(normalized) => Some(normalized),
            Err(message) => {
                errors.push("phone", message);
                None
            }
        },
        None => None,
    };

    if errors.is_empty() && username.is_none() && email.is_none() && phone.is_none() {
        errors.push(
            "identifier",
            "at least one of username, email or phone is required",
        );
    }

    errors.into_result()?;
    let username_folded = username.as_deref().map(classify::fold_username);
    Ok(ValidatedIdentifiers {
        username,
        username_folded,
        email,
        phone,
    })
}

/// Normalizes and validates a single username.
pub(crate) fn check_username(raw: &str) -> Result<String, String> {
    let normalized = classify::normalize_username(raw);
    if normalized.is_empty() {
        return Err("must not be blank".to_string());
    }
    if !classify::is_username(&normalized) {
        return Err("not a valid username".to_string());
    }
    Ok(normalized)
}

/// Normalizes and validates a single email address.
pub(crate) fn check_email(raw: &str) -> Result<String, String> {
    if raw.is_empty() {
        return Err("must not be blank".to_string());
    }
    let normalized = classify::normalize_email(raw);
    if !classify::is_emaillike(&normalized) {
        return Err("not a valid email address".to_string());
    }
    Ok(normalized)
}

/// Normalizes and validates a single phone number.
pub(crate) fn check_phone(raw: &str) -> Result<String, String> {
    if raw.is_empty() {
        return Err("must not be blank".to_string());
    }
    if !classify::is_phonelike(raw) {
        return Err("not a valid phone number".to_string());
    }
    Ok(classify::normalize_phone(raw))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validates_and_normalizes_all_fields() {
        let validated = validate_identifiers(
            Some("ⅠvalidUsername"),
            Some("validEmail@bücher.example"),
            Some("+1 (202) 555-0100"),
        )
        .expect("all valid");

        // NFKC maps U+2160 ROMAN NUMERAL ONE to a plain latin I.
        assert_eq!(validated.username.as_deref(), Some("IvalidUsername"));
        assert_eq!(validated.username_folded.as_deref(), Some("ivalidusername"));
        assert_eq!(
            validated.email.as_deref(),
            Some("validEmail@xn--bcher-kva.example")
        );
        assert_eq!(validated.phone.as_deref(), Some("+12025550100"));
    }

    #[test]
    fn collects_every_field_failure() {
        let err = validate_identifiers(Some("0invalidUsername"), Some("not-an-email"), Some("abc"))
            .unwrap_err();
        let Error::Validation(map) = err else {
            panic!("expected validation error");
        };
        assert!(map.get("username").is_some());
        assert!(map.get("email").is_some());
        assert!(map.get("phone").is_some());
    }

    #[test]
    fn empty_string_is_invalid_not_unset() {
        let err = validate_identifiers(Some(""), None, None).unwrap_err();
        let Error::Validation(map) = err else {
            panic!("expected validation error");
        };
        assert_eq!(map.get("username"), Some(&["must not be blank".to_string()][..]));
    }

    #[test]
    fn all_unset_is_rejected() {
        let err = validate_identifiers(None, None, None).unwrap_err();
        let Error::Validation(map) = err else {
            panic!("expected validation error");
        };
        assert!(map.get("identifier").is_some());
    }

    #[test]
    fn one_identifier_is_enough() {
        let validated = validate_identifiers(None, None, Some("+12025551234")).expect("valid");
        assert_eq!(validated.phone.as_deref(), Some("+12025551234"));
        assert!(validated.username.is_none());
        assert!(validated.email.is_none());
    }

    #[test]
    fn contact_accessor_selects_the_channel() {
        let user = UserRecord {
            id: Uuid::new_v4(),
            username: None,
            username_folded: None,
            email: Some("a@example.com".to_string()),
            phone: Some("+12025551234".to_string()),
            password_hash: "!unusable".to_string(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert_eq!(user.contact(ContactKind::Email), Some("a@example.com"));
        assert_eq!(user.contact(ContactKind::Phone), Some("+12025551234"));
    }
}
