//! Password hashing collaborator.
//!
//! The core never inspects password hashing internals; it talks to this
//! trait. The default implementation is Argon2id with the library's
//! recommended parameters. Accounts created without a password get an
//! unusable marker that no verification can ever match.

use argon2::password_hash::SaltString;
use argon2::{Argon2, PasswordHash, PasswordVerifier};
use rand::rngs::OsRng;
use rand::RngCore;
use secrecy::{ExposeSecret, SecretString};

use crate::error::Error;
use crate::otp::DEFAULT_ALPHABET;

const UNUSABLE_PREFIX: char = '!';
const UNUSABLE_SUFFIX_LEN: usize = 24;

/// Hashing contract consumed by the identity service.
pub trait PasswordHasher: Send + Sync {
    /// Hashes a plaintext password for storage.
    ///
    /// # Errors
    /// Returns [`Error::Hashing`] when the underlying hasher fails.
    fn hash(&self, password: &SecretString) -> Result<String, Error>;

    /// Checks a plaintext password against a stored hash. Unusable or
    /// malformed hashes never match.
    fn verify(&self, password: &SecretString, stored: &str) -> bool;

    /// Produces a marker that can never match any password, for signups
    /// that supply no password at all.
    fn set_unusable(&self) -> String;
}

/// Argon2id-backed implementation of the hashing contract.
#[derive(Clone, Copy, Debug, Default)]
pub struct Argon2Hasher;

impl PasswordHasher for Argon2Hasher {
    fn hash(&self, password: &SecretString) -> Result<String, Error> {
        use argon2::password_hash::PasswordHasher as _;

        let salt = SaltString::generate(&mut OsRng);
        Argon2::default()
            .hash_password(password.expose_secret().as_bytes(), &salt)
            .map(|hash| hash.to_string())
            .map_err(|err| Error::Hashing(err.to_string()))
    }

    fn verify(&self, password: &SecretString, stored: &str) -> bool {
        let Ok(parsed) = PasswordHash::new(stored) else {
            return false;
        };
        Argon2::default()
            .verify_password(password.expose_secret().as_bytes(), &parsed)
            .is_ok()
    }

    fn set_unusable(&self) -> String {
        // Random suffix keeps unusable markers from comparing equal across
        // accounts.
        let alphabet = DEFAULT_ALPHABET.as_bytes();
        let mut raw = [0u8; UNUSABLE_SUFFIX_LEN];
        OsRng.fill_bytes(&mut raw);
        let mut marker = String::with_capacity(UNUSABLE_SUFFIX_LEN + 1);
        marker.push(UNUSABLE_PREFIX);
        for byte in raw {
            marker.push(alphabet[usize::from(byte) % alphabet.len()] as char);
        }
        marker
    }
}
