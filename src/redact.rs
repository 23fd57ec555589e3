//! Presentation-only obscuring of contact identifiers.
//!
//! These helpers are pure and deterministic; they have no bearing on the
//! verification state machine. Calling layers use them when echoing a
//! destination back to a user ("we sent a code to ex*****@ex*****.***")
//! without disclosing the full address to a shoulder-surfer or to an
//! account-probing caller.

const VISIBLE_PREFIX: usize = 2;
const VISIBLE_PHONE_SUFFIX: usize = 2;

/// Obscures an email address, keeping the first two characters of the local
/// part and of every domain label except the last, which is fully starred:
/// `someone@mail.example.com` becomes `so*****@ma**.ex*****.***`. Lengths
/// and separators are preserved. Input without an `@` is treated as a bare
/// local part.
#[must_use]
pub fn obscure_email(email: &str) -> String {
    let Some((local, domain)) = email.rsplit_once('@') else {
        return keep_prefix(email);
    };
    let labels: Vec<&str> = domain.split('.').collect();
    let last = labels.len().saturating_sub(1);
    let obscured: Vec<String> = labels
        .iter()
        .enumerate()
        .map(|(index, label)| {
            if index == last {
                "*".repeat(label.chars().count())
            } else {
                keep_prefix(label)
            }
        })
        .collect();
    format!("{}@{}", keep_prefix(local), obscured.join("."))
}

/// Obscures a phone number, starring every digit except the last two while
/// leaving formatting punctuation and extension markers in place:
/// `+12025551234` becomes `+*********34`.
#[must_use]
pub fn obscure_phone(phone: &str) -> String {
    let digit_count = phone.chars().filter(char::is_ascii_digit).count();
    let starred = digit_count.saturating_sub(VISIBLE_PHONE_SUFFIX);
    let mut seen = 0;
    phone
        .chars()
        .map(|ch| {
            if ch.is_ascii_digit() {
                seen += 1;
                if seen <= starred {
                    '*'
                } else {
                    ch
                }
            } else {
                ch
            }
        })
        .collect()
}

fn keep_prefix(segment: &str) -> String {
    let total = segment.chars().count();
    if total <= VISIBLE_PREFIX {
        return segment.to_string();
    }
    let mut out = String::with_capacity(segment.len());
    for (index, ch) in segment.chars().enumerate() {
        if index < VISIBLE_PREFIX {
            out.push(ch);
        } else {
            out.push('*');
        }
    }
    out
}
