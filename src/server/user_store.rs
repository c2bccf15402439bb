//! User accounts and credential verification
//!
//! Users persist in a plain-text file, one record per line:
//! `username:base64(hash):base64(salt)` with hash = SHA-256(salt ∥ password).

use std::collections::HashMap;
use std::fs;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use rand::Rng;
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use crate::error::{ChatError, Result};

/// A registered user
#[derive(Debug, Clone)]
pub struct User {
    username: String,
    password_hash: String,
    salt: String,
}

impl User {
    pub fn username(&self) -> &str {
        &self.username
    }
}

/// Identity is the username
impl PartialEq for User {
    fn eq(&self, other: &Self) -> bool {
        self.username == other.username
    }
}

impl Eq for User {}

impl Hash for User {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.username.hash(state);
    }
}

/// File-backed user directory
pub struct UserStore {
    users: RwLock<HashMap<String, User>>,
    path: PathBuf,
}

impl UserStore {
    /// Load the store from `path`, creating and seeding it with the
    /// default development accounts when the file does not exist.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut users = HashMap::new();

        if path.exists() {
            let contents = fs::read_to_string(&path)
                .map_err(|e| ChatError::storage(format!("Failed to read {:?}: {}", path, e)))?;
            for line in contents.lines() {
                let mut fields = line.splitn(3, ':');
                match (fields.next(), fields.next(), fields.next()) {
                    (Some(username), Some(hash), Some(salt)) => {
                        users.insert(
                            username.to_string(),
                            User {
                                username: username.to_string(),
                                password_hash: hash.to_string(),
                                salt: salt.to_string(),
                            },
                        );
                    }
                    _ => warn!("Skipping malformed user record: {:?}", line),
                }
            }
            info!("Loaded {} users from {:?}", users.len(), path);
        } else {
            for (username, password) in [
                ("diogo", "1234"),
                ("alvaro", "1234"),
                ("tomas", "1234"),
                ("alice", "password1"),
                ("bob", "password2"),
                ("eve", "password3"),
            ] {
                users.insert(username.to_string(), new_user(username, password));
            }
            save(&users, &path)?;
            info!("Seeded {:?} with {} default users", path, users.len());
        }

        Ok(Self {
            users: RwLock::new(users),
            path,
        })
    }

    /// Register a new user. Returns `Ok(false)` when the name is taken.
    /// The record is persisted before this returns `Ok(true)`.
    pub async fn register(&self, username: &str, password: &str) -> Result<bool> {
        let mut users = self.users.write().await;
        if users.contains_key(username) {
            return Ok(false);
        }

        let user = new_user(username, password);

        // Persist first so a created account survives a crash.
        let mut candidate = users.clone();
        candidate.insert(username.to_string(), user.clone());
        if let Err(e) = save(&candidate, &self.path) {
            error!("Failed to persist user {:?}: {}", username, e);
            return Err(e);
        }

        users.insert(username.to_string(), user);
        Ok(true)
    }

    /// Verify credentials. Returns `None` for unknown users and wrong
    /// passwords alike.
    pub async fn authenticate(&self, username: &str, password: &str) -> Option<User> {
        let users = self.users.read().await;
        let user = users.get(username)?;

        let supplied = hash_password(password, &user.salt);
        if constant_time_eq(supplied.as_bytes(), user.password_hash.as_bytes()) {
            Some(user.clone())
        } else {
            None
        }
    }

    /// Number of registered users
    pub async fn len(&self) -> usize {
        self.users.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.users.read().await.is_empty()
    }
}

fn new_user(username: &str, password: &str) -> User {
    let salt = generate_salt();
    let password_hash = hash_password(password, &salt);
    User {
        username: username.to_string(),
        password_hash,
        salt,
    }
}

fn save(users: &HashMap<String, User>, path: &Path) -> Result<()> {
    let mut contents = String::new();
    for user in users.values() {
        contents.push_str(&user.username);
        contents.push(':');
        contents.push_str(&user.password_hash);
        contents.push(':');
        contents.push_str(&user.salt);
        contents.push('\n');
    }
    fs::write(path, contents)
        .map_err(|e| ChatError::storage(format!("Failed to write {:?}: {}", path, e)))
}

/// 16 random bytes, base64-encoded
fn generate_salt() -> String {
    let salt: [u8; 16] = rand::rng().random();
    BASE64.encode(salt)
}

/// base64(SHA-256(salt-text ∥ password))
fn hash_password(password: &str, salt: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(password.as_bytes());
    BASE64.encode(hasher.finalize())
}

/// Compare without short-circuiting on the first mismatching byte.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
