//! Access credential generation and verification.
//!
//! Secrets are never stored in the clear: the directory keeps a random salt
//! and a PBKDF2-HMAC-SHA256 digest of the secret, tagged with the iteration
//! count it was derived with.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rand::distributions::Alphanumeric;
use rand::Rng;
use sha2::Sha256;

/// Length of generated access keys and secret keys.
pub const KEY_LENGTH: usize = 64;

/// Iterations for newly hashed secrets.
pub const PBKDF2_ITERATIONS: u32 = 10_000;

const HASH_SCHEME: &str = "pbkdf2_sha256";
const DERIVED_KEY_LEN: usize = 32;

/// A freshly generated access/secret key pair.
///
/// The plaintext secret only exists in this value; `Debug` redacts it.
#[derive(Clone, PartialEq, Eq)]
pub struct CredentialPair {
    pub access_key: String,
    pub secret_key: String,
}

impl std::fmt::Debug for CredentialPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialPair")
            .field("access_key", &self.access_key)
            .field("secret_key", &"<redacted>")
            .finish()
    }
}

impl CredentialPair {
    /// Generate a new random pair.
    pub fn generate() -> Self {
        Self {
            access_key: random_string(KEY_LENGTH),
            secret_key: random_string(KEY_LENGTH),
        }
    }
}

/// Hashed form of a secret as persisted in the `researchers` table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashedSecret {
    pub hash: String,
    pub salt: String,
    pub iterations: u32,
}

impl HashedSecret {
    /// Column form: `pbkdf2_sha256$<iterations>$<base64 digest>`.
    pub fn encoded(&self) -> String {
        format!("{}${}${}", HASH_SCHEME, self.iterations, self.hash)
    }

    /// Parse the column form. `None` for anything not written by [`encoded`](Self::encoded).
    pub fn from_encoded(encoded: &str, salt: String) -> Option<Self> {
        let mut parts = encoded.splitn(3, '$');
        if parts.next()? != HASH_SCHEME {
            return None;
        }
        let iterations: u32 = parts.next()?.parse().ok()?;
        let hash = parts.next()?;
        if iterations == 0 || hash.is_empty() {
            return None;
        }
        Some(Self {
            hash: hash.to_string(),
            salt,
            iterations,
        })
    }
}

pub fn random_string(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Hash `secret` under a fresh random salt.
pub fn hash_secret(secret: &str) -> HashedSecret {
    hash_secret_with(secret, PBKDF2_ITERATIONS)
}

pub fn hash_secret_with(secret: &str, iterations: u32) -> HashedSecret {
    let salt_bytes: [u8; 16] = rand::thread_rng().gen();
    let salt = STANDARD.encode(salt_bytes);
    let hash = derive(&salt, secret, iterations);
    HashedSecret { hash, salt, iterations }
}

/// Check a presented secret against a stored hash, using the stored iteration count.
pub fn verify_secret(secret: &str, stored: &HashedSecret) -> bool {
    let candidate = derive(&stored.salt, secret, stored.iterations);
    // Constant-time comparison over equal-length base64 digests.
    candidate.len() == stored.hash.len()
        && candidate
            .bytes()
            .zip(stored.hash.bytes())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
}

fn derive(salt: &str, secret: &str, iterations: u32) -> String {
    let mut key = [0u8; DERIVED_KEY_LEN];
    pbkdf2::pbkdf2_hmac::<Sha256>(secret.as_bytes(), salt.as_bytes(), iterations, &mut key);
    STANDARD.encode(key)
}
