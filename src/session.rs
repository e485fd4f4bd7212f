//! Persisted session: the bearer token and the cached profile of the
//! logged-in user, kept in a small SQLite key/value table.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::watch;
use tracing::info;

use crate::error::Result;
use crate::models::UserProfile;

const AUTH_TOKEN_KEY: &str = "auth_token";
const USER_PROFILE_KEY: &str = "user_profile";

pub struct SessionStore {
    conn: Mutex<Connection>,
    logged_in: watch::Sender<bool>,
}

impl SessionStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            // Best effort; `Connection::open` reports the real failure.
            let _ = std::fs::create_dir_all(parent);
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY NOT NULL,
                value TEXT NOT NULL
            );",
        )?;
        let has_token = conn
            .query_row(
                "SELECT 1 FROM kv WHERE key = ?1",
                params![AUTH_TOKEN_KEY],
                |_| Ok(()),
            )
            .optional()?
            .is_some();
        let (logged_in, _) = watch::channel(has_token);
        Ok(Self {
            conn: Mutex::new(conn),
            logged_in,
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn get(&self, key: &str) -> Result<Option<String>> {
        let value = self
            .conn()
            .query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(value)
    }

    fn put(&self, key: &str, value: &str) -> Result<()> {
        self.conn().execute(
            "INSERT INTO kv (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    pub fn save_login(&self, token: &str, profile: &UserProfile) -> Result<()> {
        self.put(AUTH_TOKEN_KEY, token)?;
        self.put(USER_PROFILE_KEY, &serde_json::to_string(profile)?)?;
        self.logged_in.send_replace(true);
        Ok(())
    }

    pub fn token(&self) -> Result<Option<String>> {
        self.get(AUTH_TOKEN_KEY)
    }

    pub fn profile(&self) -> Result<Option<UserProfile>> {
        match self.get(USER_PROFILE_KEY)? {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    /// Forget the token and profile. Used on logout and on any 401.
    pub fn clear(&self) -> Result<()> {
        self.conn().execute(
            "DELETE FROM kv WHERE key IN (?1, ?2)",
            params![AUTH_TOKEN_KEY, USER_PROFILE_KEY],
        )?;
        if self.logged_in.send_replace(false) {
            info!("session cleared");
        }
        Ok(())
    }

    /// Flips to `false` when the session is torn down.
    pub fn logged_in(&self) -> watch::Receiver<bool> {
        self.logged_in.subscribe()
    }
}
