use crate::errors::{AppError, AppResult};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

pub const ONBOARDING_KEY: &str = "shield.onboarding";
pub const THEME_KEY: &str = "shield.theme";
pub const SESSION_KEY: &str = "shield.session";
pub const SETTINGS_KEY: &str = "shield.settings";

const LOCAL_STORAGE_SQL: &str = "CREATE TABLE IF NOT EXISTS local_storage (
  key TEXT PRIMARY KEY,
  value_json TEXT NOT NULL,
  updated_at TEXT NOT NULL
);";

/// Device-local key/value storage. Survives restarts, never leaves the device.
#[derive(Debug)]
pub struct LocalStorage {
    conn: Mutex<Connection>,
}

impl LocalStorage {
    pub fn new(path: &Path) -> AppResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| AppError::Io(err.to_string()))?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(LOCAL_STORAGE_SQL)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Unreadable values are treated as absent.
    pub fn get_item<T: DeserializeOwned>(&self, key: &str) -> AppResult<Option<T>> {
        let conn = self.lock()?;
        let raw = conn
            .query_row("SELECT value_json FROM local_storage WHERE key = ?1", [key], |row| {
                row.get::<_, String>(0)
            })
            .optional()?;

        let Some(raw) = raw else {
            return Ok(None);
        };
        match serde_json::from_str::<T>(&raw) {
            Ok(value) => Ok(Some(value)),
            Err(error) => {
                tracing::warn!(key, error = %error, "ignoring unreadable local storage value");
                Ok(None)
            }
        }
    }

    pub fn set_item<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> AppResult<()> {
        let raw = serde_json::to_string(value)?;
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO local_storage (key, value_json, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json, updated_at = excluded.updated_at",
            params![key, raw, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn remove_item(&self, key: &str) -> AppResult<bool> {
        let conn = self.lock()?;
        let removed = conn.execute("DELETE FROM local_storage WHERE key = ?1", [key])?;
        Ok(removed > 0)
    }

    fn lock(&self) -> AppResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| AppError::Internal("local storage mutex poisoned".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::{LocalStorage, ONBOARDING_KEY, THEME_KEY};

    #[test]
    fn values_survive_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("device.sqlite");
        {
            let storage = LocalStorage::new(&path).expect("storage");
            storage.set_item(ONBOARDING_KEY, &true).expect("set");
        }
        let storage = LocalStorage::new(&path).expect("reopen");
        assert_eq!(storage.get_item::<bool>(ONBOARDING_KEY).expect("get"), Some(true));
    }

    #[test]
    fn mismatched_values_read_as_absent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = LocalStorage::new(&dir.path().join("device.sqlite")).expect("storage");
        storage.set_item(THEME_KEY, "dark").expect("set");
        assert_eq!(storage.get_item::<bool>(THEME_KEY).expect("get"), None);
        assert!(storage.remove_item(THEME_KEY).expect("remove"));
        assert!(!storage.remove_item(THEME_KEY).expect("second remove"));
    }
}
