//! User accounts backed by SQLite.
//!
//! Accounts are created from the admin CLI only; the HTTP surface just
//! verifies credentials.

use anyhow::{Context, Result};
use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::path::Path;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// Minimum accepted password length.
pub const MIN_PASSWORD_LEN: usize = 8;

/// Maximum accepted username length.
pub const MAX_USERNAME_LEN: usize = 64;

/// A user account.
#[derive(Debug, Clone, Serialize)]
pub struct User {
    pub id: String,
    pub username: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_login_at: Option<DateTime<Utc>>,
}

#[derive(Clone)]
pub struct UserStore {
    conn: Arc<Mutex<Connection>>,
}

impl UserStore {
    /// Open (or create) the user database at `db_path`.
    pub fn new(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        let conn = Connection::open(db_path)
            .with_context(|| format!("Failed to open user database {}", db_path.display()))?;

        conn.execute_batch(
            r"
            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                username TEXT UNIQUE NOT NULL,
                password_hash TEXT NOT NULL,
                created_at TEXT NOT NULL,
                last_login_at TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_users_username ON users(username);
            ",
        )?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create an account. Fails if the username is taken.
    pub fn create(&self, username: &str, password: &str) -> Result<User> {
        let username = username.trim();
        if username.is_empty() {
            anyhow::bail!("Username cannot be empty");
        }
        if username.len() > MAX_USERNAME_LEN {
            anyhow::bail!("Username too long (max {MAX_USERNAME_LEN} characters)");
        }
        if password.len() < MIN_PASSWORD_LEN {
            anyhow::bail!("Password must be at least {MIN_PASSWORD_LEN} characters");
        }

        let password_hash = hash_password(password)?;
        let now = Utc::now();
        let id = Uuid::new_v4().to_string();

        let conn = self.conn.lock().map_err(|e| anyhow::anyhow!("{}", e))?;
        conn.execute(
            "INSERT INTO users (id, username, password_hash, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![id, username, password_hash, now.to_rfc3339()],
        )
        .with_context(|| format!("Failed to create user '{username}'"))?;

        tracing::info!(user_id = %id, username = %username, "User created");

        Ok(User {
            id,
            username: username.to_string(),
            password_hash,
            created_at: now,
            last_login_at: None,
        })
    }

    pub fn get(&self, id: &str) -> Result<Option<User>> {
        let conn = self.conn.lock().map_err(|e| anyhow::anyhow!("{}", e))?;
        get_internal(&conn, "id", id)
    }

    pub fn get_by_username(&self, username: &str) -> Result<Option<User>> {
        let conn = self.conn.lock().map_err(|e| anyhow::anyhow!("{}", e))?;
        get_internal(&conn, "username", username)
    }

    pub fn count(&self) -> Result<usize> {
        let conn = self.conn.lock().map_err(|e| anyhow::anyhow!("{}", e))?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Check credentials. Returns the user on success and records the login.
    pub fn verify_password(&self, username: &str, password: &str) -> Result<Option<User>> {
        let Some(mut user) = self.get_by_username(username)? else {
            return Ok(None);
        };

        if !verify_password(password, &user.password_hash)? {
            return Ok(None);
        }

        let now = Utc::now();
        let conn = self.conn.lock().map_err(|e| anyhow::anyhow!("{}", e))?;
        conn.execute(
            "UPDATE users SET last_login_at = ?1 WHERE id = ?2",
            params![now.to_rfc3339(), user.id],
        )?;
        user.last_login_at = Some(now);

        Ok(Some(user))
    }
}

fn get_internal(conn: &Connection, field: &str, value: &str) -> Result<Option<User>> {
    let query = format!(
        "SELECT id, username, password_hash, created_at, last_login_at FROM users WHERE {field} = ?1"
    );

    conn.query_row(&query, params![value], |row| {
        let created_at: String = row.get(3)?;
        let last_login_at: Option<String> = row.get(4)?;

        Ok(User {
            id: row.get(0)?,
            username: row.get(1)?,
            password_hash: row.get(2)?,
            created_at: parse_timestamp(&created_at).unwrap_or_else(Utc::now),
            last_login_at: last_login_at.as_deref().and_then(parse_timestamp),
        })
    })
    .optional()
    .with_context(|| format!("Failed to get user by {field} = {value}"))
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
}

fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| anyhow::anyhow!("Failed to hash password: {}", e))?;
    Ok(hash.to_string())
}

fn verify_password(password: &str, hash: &str) -> Result<bool> {
    let parsed_hash =
        PasswordHash::new(hash).map_err(|e| anyhow::anyhow!("Invalid password hash: {}", e))?;
    Ok(Argon2::default()
        .verify_password(password.as_bytes(), &parsed_hash)
        .is_ok())
}
