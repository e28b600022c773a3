//! SQLite-backed implementation of the storage collaborators.

use super::schema::{CREATE_SCHEMA, SCHEMA_VERSION};
use super::{FileStore, RoomDirectory, UserDirectory};
use crate::error::{Error, Result};
use rand::RngCore;
use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

/// Shared SQLite handle. Cloning shares the connection.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create a database file.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| Error::Storage(format!("failed to create directory: {}", e)))?;
            }
        }

        let conn = Connection::open(path)
            .map_err(|e| Error::Storage(format!("failed to open database: {}", e)))?;
        Self::init(conn)
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::Storage(format!("failed to open database: {}", e)))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(CREATE_SCHEMA)
            .map_err(|e| Error::Storage(format!("failed to create schema: {}", e)))?;

        let version: Option<u32> = conn
            .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| row.get(0))
            .optional()?;
        if version.is_none() {
            conn.execute(
                "INSERT INTO schema_version (version) VALUES (?)",
                params![SCHEMA_VERSION],
            )?;
        }

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub(super) fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::Storage("lock poisoned".into()))
    }
}

fn hash_password(salt: &str, password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(password.as_bytes());
    hex::encode(hasher.finalize())
}

/// Current Unix timestamp.
pub(super) fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

impl UserDirectory for Database {
    fn exists(&self, name: &str) -> Result<bool> {
        let conn = self.lock()?;
        let found: Option<i64> = conn
            .query_row("SELECT 1 FROM users WHERE name = ?", params![name], |row| row.get(0))
            .optional()?;
        Ok(found.is_some())
    }

    fn register(&self, name: &str, password: Option<&str>) -> Result<bool> {
        let (hash, salt) = match password {
            Some(pw) => {
                let mut raw = [0u8; 16];
                rand::rngs::OsRng.fill_bytes(&mut raw);
                let salt = hex::encode(raw);
                (Some(hash_password(&salt, pw)), Some(salt))
            }
            None => (None, None),
        };

        let conn = self.lock()?;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO users (name, password_hash, salt, created_at) VALUES (?, ?, ?, ?)",
            params![name, hash, salt, now()],
        )?;
        Ok(inserted == 1)
    }

    fn verify_credentials(&self, name: &str, password: Option<&str>) -> Result<bool> {
        let conn = self.lock()?;
        let row: Option<(Option<String>, Option<String>)> = conn
            .query_row(
                "SELECT password_hash, salt FROM users WHERE name = ?",
                params![name],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        match row {
            None => Ok(false),
            Some((None, _)) => Ok(true),
            Some((Some(stored), salt)) => Ok(match password {
                Some(pw) => hash_password(salt.as_deref().unwrap_or(""), pw) == stored,
                None => false,
            }),
        }
    }
}

impl FileStore for Database {
    fn save(&self, message_id: i64, name: &str, path: &Path, mime: &str, size: u64) -> Result<i64> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO files (message_id, name, path, mime, size, created_at) VALUES (?, ?, ?, ?, ?, ?)",
            params![
                message_id,
                name,
                path.to_string_lossy().into_owned(),
                mime,
                size as i64,
                now()
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }
}

impl RoomDirectory for Database {
    fn room_id(&self, name: &str) -> Result<i64> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR IGNORE INTO rooms (name, created_at) VALUES (?, ?)",
            params![name, now()],
        )?;
        let id = conn.query_row("SELECT id FROM rooms WHERE name = ?", params![name], |row| {
            row.get(0)
        })?;
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_exists() {
        let db = Database::open_in_memory().unwrap();
        assert!(!db.exists("alice").unwrap());

        assert!(db.register("alice", None).unwrap());
        assert!(db.exists("alice").unwrap());

        // Second register is a no-op.
        assert!(!db.register("alice", Some("late")).unwrap());
        assert!(db.verify_credentials("alice", None).unwrap());
    }

    #[test]
    fn test_password_verification() {
        let db = Database::open_in_memory().unwrap();
        db.register("bob", Some("s3cret")).unwrap();

        assert!(db.verify_credentials("bob", Some("s3cret")).unwrap());
        assert!(!db.verify_credentials("bob", Some("wrong")).unwrap());
        assert!(!db.verify_credentials("bob", None).unwrap());
        assert!(!db.verify_credentials("nobody", Some("x")).unwrap());
    }

    #[test]
    fn test_room_ids_are_stable() {
        let db = Database::open_in_memory().unwrap();
        let lobby = db.room_id("lobby").unwrap();
        let other = db.room_id("other").unwrap();
        assert_ne!(lobby, other);
        assert_eq!(db.room_id("lobby").unwrap(), lobby);
    }

    #[test]
    fn test_open_file_creates_parent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("palaver.db");
        let db = Database::open(&path).unwrap();
        db.register("carol", None).unwrap();
        drop(db);

        let reopened = Database::open(&path).unwrap();
        assert!(reopened.exists("carol").unwrap());
    }
}
