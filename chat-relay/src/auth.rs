//! Credential collaborator.
//!
//! The relay only needs yes/no answers for registration and login; how
//! passwords are kept is up to the implementation.

use std::{
    collections::HashMap,
    sync::{RwLock, RwLockReadGuard},
};

use argon2::{
    Algorithm, Argon2, Params, PasswordHash, PasswordHasher, PasswordVerifier, Version,
    password_hash::SaltString,
};
use rand::RngCore;
use tracing::warn;

pub trait CredentialStore: Send + Sync {
    /// Returns `false` if the username is already taken.
    fn register(&self, username: &str, password: &str) -> bool;

    fn verify(&self, username: &str, password: &str) -> bool;
}

/// In-memory store of Argon2id PHC hashes, each with its own random salt.
pub struct MemoryCredentials {
    hasher: Argon2<'static>,
    users: RwLock<HashMap<String, String>>,
}

impl Default for MemoryCredentials {
    fn default() -> Self {
        Self::with_params(Params::default())
    }
}

impl MemoryCredentials {
    pub fn with_params(params: Params) -> Self {
        Self {
            hasher: Argon2::new(Algorithm::Argon2id, Version::V0x13, params),
            users: RwLock::new(HashMap::new()),
        }
    }

    fn hash(&self, password: &str) -> Option<String> {
        let mut salt = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut salt);
        let salt = SaltString::encode_b64(&salt).ok()?;
        match self.hasher.hash_password(password.as_bytes(), &salt) {
            Ok(hash) => Some(hash.to_string()),
            Err(err) => {
                warn!(error = %err, "failed to hash password");
                None
            }
        }
    }

    fn users_read(&self) -> RwLockReadGuard<'_, HashMap<String, String>> {
        match self.users.read() {
            Ok(users) => users,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl CredentialStore for MemoryCredentials {
    fn register(&self, username: &str, password: &str) -> bool {
        if self.users_read().contains_key(username) {
            return false;
        }

        // Hash outside the lock; a racing registration is caught below.
        let Some(hash) = self.hash(password) else {
            return false;
        };

        let mut users = match self.users.write() {
            Ok(users) => users,
            Err(poisoned) => poisoned.into_inner(),
        };
        if users.contains_key(username) {
            return false;
        }
        users.insert(username.to_string(), hash);
        true
    }

    fn verify(&self, username: &str, password: &str) -> bool {
        let Some(stored) = self.users_read().get(username).cloned() else {
            return false;
        };
        let Ok(parsed) = PasswordHash::new(&stored) else {
            warn!(%username, "stored password hash is unreadable");
            return false;
        };
        self.hasher
            .verify_password(password.as_bytes(), &parsed)
            .is_ok()
    }
}

/// Cheap parameters for tests; never use these for real accounts.
#[cfg(test)]
pub(crate) fn fast_params() -> Params {
    Params::new(256, 1, 1, None).expect("valid argon2 params")
}
