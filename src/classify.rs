//! Identifier classification and normalization.
//!
//! A login form presents one opaque string that may be a username, an email
//! address or a phone number. Classification infers the kind from syntactic
//! shape alone, and the three shapes are mutually exclusive by construction:
//!
//! - usernames never contain `@` and never start with a decimal digit or `+`,
//!   so no username parses as an email or as a phone number;
//! - emails always contain `@`, which both other kinds forbid;
//! - phone numbers carry only digits, separator punctuation and an optional
//!   extension marker, so they never match the username grammar.
//!
//! Normalization is best-effort and happens before validation: usernames are
//! NFKC-normalized, email domains are lowercased and IDNA-encoded. Malformed
//! values pass through unchanged so downstream validation still rejects them
//! with a field error instead of a panic mid-normalization.

use idna::domain_to_ascii;
use regex::Regex;
use serde::{Deserialize, Serialize};
use unicode_normalization::UnicodeNormalization;

/// The first character may be any letter, mark or non-decimal numeral.
/// Decimal digits (`Nd`) and `+` are reserved as phone-number openers, `@`
/// as the email marker; keeping them out of the leading position is what
/// makes the three identifier shapes disjoint. Roman numerals, Ethiopic
/// digits and other `Nl`/`No` numerals are legal openers.
const USERNAME_PATTERN: &str = r"^[\p{L}\p{M}\p{Nl}\p{No}][\p{L}\p{M}\p{N}._-]*$";

/// ASCII domain grammar applied after IDNA encoding: dotted labels with a
/// purely alphabetic final label, the shape the rest of the stack expects
/// from a deliverable address.
const EMAIL_DOMAIN_PATTERN: &str =
    r"^([a-zA-Z0-9]([a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?\.)+[a-zA-Z]{2,63}$";

/// International or region-interpretable phone shape: optional `+`, digits
/// with separator punctuation, optional `x`/`ext`/`#` extension.
const PHONE_PATTERN: &str = r"(?i)^\s*(\+)?([0-9()\-./\s]*[0-9][0-9()\-./\s]*?)\s*(?:(?:ext\.?|x|#)\s*([0-9]{1,7}))?\s*$";

const PHONE_MIN_DIGITS: usize = 7;
const PHONE_MAX_DIGITS: usize = 15;

/// Which of the three identifier shapes a raw string was classified as.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentifierKind {
    Username,
    Email,
    Phone,
}

impl IdentifierKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Username => "username",
            Self::Email => "email",
            Self::Phone => "phone",
        }
    }
}

/// Returns true when `raw` matches the username grammar.
#[must_use]
pub fn is_username(raw: &str) -> bool {
    Regex::new(USERNAME_PATTERN).is_ok_and(|regex| regex.is_match(raw))
}

/// Returns true when `raw` has exactly one `@`, a non-empty local part and a
/// domain that survives IDNA encoding and the domain grammar.
#[must_use]
pub fn is_emaillike(raw: &str) -> bool {
    if raw.chars().filter(|&ch| ch == '@').count() != 1 {
        return false;
    }
    let Some((local, domain)) = raw.rsplit_once('@') else {
        return false;
    };
    if local.is_empty() || local.chars().any(char::is_whitespace) {
        return false;
    }
    let Ok(ascii_domain) = domain_to_ascii(domain) else {
        return false;
    };
    Regex::new(EMAIL_DOMAIN_PATTERN).is_ok_and(|regex| regex.is_match(&ascii_domain))
}

/// Returns true when `raw` parses as an international (`+`-prefixed) or
/// region-interpretable phone number. Vanity alphanumeric forms are
/// rejected; only digits, separators and an extension marker are accepted.
#[must_use]
pub fn is_phonelike(raw: &str) -> bool {
    if raw.contains('@') {
        return false;
    }
    let Some(parts) = phone_parts(raw) else {
        return false;
    };
    (PHONE_MIN_DIGITS..=PHONE_MAX_DIGITS).contains(&parts.digits.len())
}

/// Infers the identifier kind of a bare sign-in string.
///
/// The dispatch is a loose heuristic ordered for sign-in convenience: the
/// username grammar wins, anything with an `@` is treated as an email, and
/// everything else falls through to phone. The fallback means some
/// malformed inputs classify as phone; the strict per-kind grammar applies
/// to stored fields, not here.
#[must_use]
pub fn classify(raw: &str) -> IdentifierKind {
    if is_username(raw) {
        IdentifierKind::Username
    } else if raw.contains('@') {
        IdentifierKind::Email
    } else {
        IdentifierKind::Phone
    }
}

/// NFKC-normalizes a username. The empty string passes through unchanged so
/// blank-rejection downstream still fires on it.
#[must_use]
pub fn normalize_username(raw: &str) -> String {
    if raw.is_empty() {
        return String::new();
    }
    raw.nfkc().collect()
}

/// Case-folds a username for uniqueness comparison. Display forms keep
/// their case; lookups and the uniqueness constraint use this form.
#[must_use]
pub fn fold_username(raw: &str) -> String {
    normalize_username(raw).to_lowercase()
}

/// Lowercases and IDNA-encodes the domain part of an email, splitting on the
/// last `@`. The local part is preserved as supplied. Values without an `@`
/// or with a domain IDNA refuses are returned unchanged; the follow-up
/// grammar check rejects them with a proper field error.
#[must_use]
pub fn normalize_email(raw: &str) -> String {
    let Some((local, domain)) = raw.rsplit_once('@') else {
        return raw.to_string();
    };
    if domain.is_empty() {
        return raw.to_string();
    }
    match domain_to_ascii(domain) {
        Ok(ascii) if !ascii.is_empty() => format!("{local}@{ascii}"),
        _ => raw.to_string(),
    }
}

/// Canonicalizes a phone number to `+`-prefixed (when supplied) digits with
/// a lowercase `x` extension marker: `"+1 (202) 555-0100 ext 7"` becomes
/// `"+12025550100x7"`. Unparseable values are returned unchanged.
#[must_use]
pub fn normalize_phone(raw: &str) -> String {
    let Some(parts) = phone_parts(raw) else {
        return raw.to_string();
    };
    let mut out = String::with_capacity(raw.len());
    if parts.international {
        out.push('+');
    }
    out.push_str(&parts.digits);
    if let Some(extension) = parts.extension {
        out.push('x');
        out.push_str(&extension);
    }
    out
}

struct PhoneParts {
    international: bool,
    digits: String,
    extension: Option<String>,
}

fn phone_parts(raw: &str) -> Option<PhoneParts> {
    let regex = Regex::new(PHONE_PATTERN).ok()?;
    let caps = regex.captures(raw)?;
    let digits: String = caps
        .get(2)
        .map(|body| body.as_str().chars().filter(char::is_ascii_digit).collect())?;
    if digits.is_empty() {
        return None;
    }
    Some(PhoneParts {
        international: caps.get(1).is_some(),
        digits,
        extension: caps.get(3).map(|ext| ext.as_str().to_string()),
    })
}
