//! Username/password-hash store backing Basic auth.
//!
//! # File format
//!
//! ```text
//! # comment
//! alice:$argon2id$v=19$m=19456,t=2,p=1$<salt>$<hash>
//! bob:{SHA256}<base64 of the SHA-256 digest of the password>
//! ```
//!
//! The store is read once at startup and never changes afterwards.

use argon2::Argon2;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use base64::Engine;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::hint::black_box;
use std::path::Path;

use crate::error::CredentialError;

const SHA256_PREFIX: &str = "{SHA256}";

/// Salt of the placeholder hash checked for unknown users.
const DUMMY_SALT: &[u8] = b"gatehouse-unknown-user";

#[derive(Debug, Clone, PartialEq, Eq)]
enum StoredHash {
    /// PHC string, verified with Argon2.
    Argon2(String),
    Sha256([u8; 32]),
}

/// Verified-at-startup set of credentials.
#[derive(Debug)]
pub struct CredentialStore {
    entries: HashMap<String, StoredHash>,
    /// Checked in place of a real entry when the username is unknown.
    /// Argon2 as soon as any stored entry is Argon2, so a miss costs as
    /// much as the most expensive hit.
    miss: StoredHash,
}

impl Default for CredentialStore {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
            miss: StoredHash::Sha256([0u8; 32]),
        }
    }
}

impl CredentialStore {
    /// Loads credentials from a file on disk.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, CredentialError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| CredentialError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse(&text)
    }

    /// Parses the `username:hash` line format.
    pub fn parse(text: &str) -> Result<Self, CredentialError> {
        let mut entries = HashMap::new();

        for (idx, raw) in text.lines().enumerate() {
            let line_no = idx + 1;
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let malformed = |reason: &str| CredentialError::Malformed {
                line: line_no,
                reason: reason.to_string(),
            };

            let (user, hash) = line.split_once(':').ok_or_else(|| malformed("missing ':'"))?;
            if user.is_empty() {
                return Err(malformed("empty username"));
            }
            let stored = parse_hash(hash).map_err(|reason| malformed(&reason))?;
            if entries.insert(user.to_string(), stored).is_some() {
                return Err(malformed(&format!("duplicate user {:?}", user)));
            }
        }

        let miss = if entries.values().any(|h| matches!(h, StoredHash::Argon2(_))) {
            dummy_argon2().unwrap_or(StoredHash::Sha256([0u8; 32]))
        } else {
            StoredHash::Sha256([0u8; 32])
        };

        Ok(Self { entries, miss })
    }

    /// Checks a username/password pair.
    ///
    /// Unknown users are checked against a placeholder hash of the same
    /// kind as the stored ones, so a miss costs about as much as a wrong
    /// password.
    pub fn verify(&self, username: &str, password: &str) -> bool {
        match self.entries.get(username) {
            Some(stored) => check(stored, password),
            None => {
                black_box(check(&self.miss, password));
                false
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn check(stored: &StoredHash, password: &str) -> bool {
    match stored {
        StoredHash::Sha256(expected) => {
            let actual = Sha256::digest(password.as_bytes());
            constant_time_eq(actual.as_slice(), expected)
        }
        StoredHash::Argon2(phc) => match PasswordHash::new(phc) {
            Ok(parsed) => Argon2::default()
                .verify_password(password.as_bytes(), &parsed)
                .is_ok(),
            Err(_) => false,
        },
    }
}

/// Argon2 hash of an unguessable placeholder, computed once per store.
fn dummy_argon2() -> Option<StoredHash> {
    let salt = SaltString::encode_b64(DUMMY_SALT).ok()?;
    let phc = Argon2::default()
        .hash_password(b"\0gatehouse unknown user\0", &salt)
        .ok()?;
    Some(StoredHash::Argon2(phc.to_string()))
}

fn parse_hash(hash: &str) -> Result<StoredHash, String> {
    if let Some(encoded) = hash.strip_prefix(SHA256_PREFIX) {
        let digest = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| format!("invalid base64 digest: {}", e))?;
        let digest: [u8; 32] = digest
            .try_into()
            .map_err(|_| "SHA-256 digest must be 32 bytes".to_string())?;
        return Ok(StoredHash::Sha256(digest));
    }

    if hash.starts_with("$argon2") {
        PasswordHash::new(hash).map_err(|e| format!("invalid argon2 hash: {}", e))?;
        return Ok(StoredHash::Argon2(hash.to_string()));
    }

    Err("unsupported hash format (expected $argon2... or {SHA256}...)".to_string())
}

/// Compares two byte strings without short-circuiting on the first difference.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Renders the `{SHA256}` form of a password, as stored in the credential file.
pub fn sha256_entry(password: &str) -> String {
    let digest = Sha256::digest(password.as_bytes());
    format!(
        "{}{}",
        SHA256_PREFIX,
        base64::engine::general_purpose::STANDARD.encode(digest)
    )
}
