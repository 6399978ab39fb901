//! User directory, password hashing and access decisions

use crate::config::{ConfigError, UserConfig};
use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use soht2_proto::{Soht2Connection, Soht2User, UserRole};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum PasswordError {
    #[error("Failed to hash password: {0}")]
    HashingFailed(String),

    #[error("Invalid password hash format: {0}")]
    InvalidHashFormat(String),
}

/// Hash a password with Argon2id, returning a PHC string
pub fn hash_password(password: &str) -> Result<String, PasswordError> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| PasswordError::HashingFailed(e.to_string()))?;
    Ok(hash.to_string())
}

/// Verify a password against a PHC string
pub fn verify_password(password: &str, hash: &str) -> Result<bool, PasswordError> {
    let parsed =
        PasswordHash::new(hash).map_err(|e| PasswordError::InvalidHashFormat(e.to_string()))?;
    Ok(Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok())
}

/// Authenticated caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub username: String,
    pub role: UserRole,
}

impl Identity {
    pub fn is_admin(&self) -> bool {
        self.role == UserRole::Admin
    }
}

/// Authentication and authorization decisions for the HTTP API
pub trait Authorizer: Send + Sync {
    /// Check credentials, returning the caller identity on success
    fn authenticate(&self, username: &str, password: &str) -> Option<Identity>;

    /// Full profile of a known user
    fn user_profile(&self, username: &str) -> Option<Soht2User>;

    fn is_target_allowed(&self, identity: &Identity, host: &str, port: u16) -> bool {
        self.user_profile(&identity.username)
            .map(|user| user.is_allowed_target(host, port))
            .unwrap_or(false)
    }

    /// Admins see every connection, users only their own
    fn can_view(&self, identity: &Identity, connection: &Soht2Connection) -> bool {
        identity.is_admin()
            || connection
                .user
                .username
                .eq_ignore_ascii_case(&identity.username)
    }
}

struct DirectoryEntry {
    user: Soht2User,
    password_hash: String,
}

struct CachedLogin {
    digest: [u8; 32],
    identity: Identity,
    verified_at: Instant,
}

/// Users from configuration, with a short-lived cache of verified credentials
/// so a session's steady stream of exchanges does not re-run Argon2 each time.
pub struct UserDirectory {
    users: HashMap<String, DirectoryEntry>,
    cache: DashMap<String, CachedLogin>,
    cache_ttl: Duration,
}

impl UserDirectory {
    pub fn new(users: &[UserConfig], cache_ttl: Duration) -> Result<Self, ConfigError> {
        let mut entries = HashMap::with_capacity(users.len());
        for user in users {
            PasswordHash::new(&user.password_hash)
                .map_err(|_| ConfigError::InvalidPasswordHash(user.username.clone()))?;
            entries.insert(
                user.username.to_lowercase(),
                DirectoryEntry {
                    user: Soht2User {
                        username: user.username.clone(),
                        role: user.role,
                        allowed_targets: user.allowed_targets.clone(),
                    },
                    password_hash: user.password_hash.clone(),
                },
            );
        }
        Ok(Self {
            users: entries,
            cache: DashMap::new(),
            cache_ttl,
        })
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    fn digest(username: &str, password: &str) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(username.as_bytes());
        hasher.update([0u8]);
        hasher.update(password.as_bytes());
        hasher.finalize().into()
    }
}

impl Authorizer for UserDirectory {
    fn authenticate(&self, username: &str, password: &str) -> Option<Identity> {
        let key = username.to_lowercase();
        let digest = Self::digest(&key, password);

        if let Some(cached) = self.cache.get(&key) {
            if cached.digest == digest && cached.verified_at.elapsed() < self.cache_ttl {
                return Some(cached.identity.clone());
            }
        }

        let entry = self.users.get(&key)?;
        match verify_password(password, &entry.password_hash) {
            Ok(true) => {}
            Ok(false) => {
                debug!("Invalid password for user {}", username);
                return None;
            }
            Err(e) => {
                debug!("Cannot verify password of user {}: {}", username, e);
                return None;
            }
        }

        let identity = Identity {
            username: entry.user.username.clone(),
            role: entry.user.role,
        };
        self.cache.insert(
            key,
            CachedLogin {
                digest,
                identity: identity.clone(),
                verified_at: Instant::now(),
            },
        );
        Some(identity)
    }

    fn user_profile(&self, username: &str) -> Option<Soht2User> {
        self.users
            .get(&username.to_lowercase())
            .map(|entry| entry.user.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn directory() -> UserDirectory {
        let users = vec![
            UserConfig {
                username: "admin".to_string(),
                password_hash: hash_password("admin-secret").unwrap(),
                role: UserRole::Admin,
                allowed_targets: vec!["*:*".to_string()],
            },
            UserConfig {
                username: "User1".to_string(),
                password_hash: hash_password("secret").unwrap(),
                role: UserRole::User,
                allowed_targets: vec!["localhost:*".to_string()],
            },
        ];
        UserDirectory::new(&users, Duration::from_secs(60)).unwrap()
    }

    #[test]
    fn test_hash_and_verify() {
        let hash = hash_password("MyPassword123!").unwrap();
        assert!(hash.starts_with("$argon2"));
        assert!(verify_password("MyPassword123!", &hash).unwrap());
        assert!(!verify_password("wrong", &hash).unwrap());
        assert!(verify_password("x", "not a hash").is_err());
    }

    #[test]
    fn test_authenticate() {
        let directory = directory();
        let identity = directory.authenticate("user1", "secret").unwrap();
        assert_eq!(identity.username, "User1");
        assert!(!identity.is_admin());

        // served from cache
        assert_eq!(directory.authenticate("USER1", "secret"), Some(identity));
        // cache never accepts a different password
        assert!(directory.authenticate("user1", "other").is_none());
        assert!(directory.authenticate("nobody", "secret").is_none());
    }

    #[test]
    fn test_target_permissions() {
        let directory = directory();
        let user = directory.authenticate("user1", "secret").unwrap();
        let admin = directory.authenticate("admin", "admin-secret").unwrap();

        assert!(directory.is_target_allowed(&user, "localhost", 22));
        assert!(!directory.is_target_allowed(&user, "example.com", 22));
        assert!(directory.is_target_allowed(&admin, "example.com", 22));
    }

    #[test]
    fn test_visibility() {
        let directory = directory();
        let user = directory.authenticate("user1", "secret").unwrap();
        let admin = directory.authenticate("admin", "admin-secret").unwrap();
        let own = Soht2Connection::new(Soht2User::named("user1"), "c", "h", 1);
        let other = Soht2Connection::new(Soht2User::named("user2"), "c", "h", 1);

        assert!(directory.can_view(&user, &own));
        assert!(!directory.can_view(&user, &other));
        assert!(directory.can_view(&admin, &other));
    }

    #[test]
    fn test_rejects_malformed_hash() {
        let users = vec![UserConfig {
            username: "broken".to_string(),
            password_hash: "plaintext".to_string(),
            role: UserRole::User,
            allowed_targets: Vec::new(),
        }];
        assert!(matches!(
            UserDirectory::new(&users, Duration::from_secs(1)),
            Err(ConfigError::InvalidPasswordHash(_))
        ));
    }
}
