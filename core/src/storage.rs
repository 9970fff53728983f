//! Local storage using SQLite
//!
//! Holds the signed-in driver's token between runs, plus free-form settings.

use crate::error::Result;
use crate::models::Identity;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;

const KEY_TOKEN: &str = "token";
const KEY_DRIVER_ID: &str = "current_driver_id";
const KEY_DISPLAY_NAME: &str = "display_name";

pub struct LocalStorage {
    conn: Mutex<Connection>,
}

impl LocalStorage {
    pub fn new(data_dir: impl AsRef<Path>) -> Result<Self> {
        let data_dir = data_dir.as_ref();
        std::fs::create_dir_all(data_dir)?;
        let conn = Connection::open(data_dir.join("ridesync.db"))?;
        Self::with_connection(conn)
    }

    pub fn in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            "#,
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    // ========================================================================
    // Settings
    // ========================================================================

    pub fn save_setting(&self, key: &str, value: &str) -> Result<()> {
        self.conn.lock().execute(
            "INSERT OR REPLACE INTO settings (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }

    pub fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let value = self
            .conn
            .lock()
            .query_row(
                "SELECT value FROM settings WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    pub fn delete_setting(&self, key: &str) -> Result<()> {
        self.conn
            .lock()
            .execute("DELETE FROM settings WHERE key = ?1", params![key])?;
        Ok(())
    }

    // ========================================================================
    // Session
    // ========================================================================

    pub fn save_session(&self, identity: &Identity) -> Result<()> {
        self.save_setting(KEY_TOKEN, &identity.token)?;
        self.save_setting(KEY_DRIVER_ID, &identity.driver_id)?;
        match &identity.display_name {
            Some(name) => self.save_setting(KEY_DISPLAY_NAME, name)?,
            None => self.delete_setting(KEY_DISPLAY_NAME)?,
        }
        Ok(())
    }

    /// Stored identity, if a driver is signed in
    pub fn load_session(&self) -> Result<Option<Identity>> {
        let token = match self.get_setting(KEY_TOKEN)? {
            Some(token) => token,
            None => return Ok(None),
        };
        let driver_id = match self.get_setting(KEY_DRIVER_ID)? {
            Some(driver_id) => driver_id,
            None => return Ok(None),
        };

        Ok(Some(Identity {
            token,
            driver_id,
            display_name: self.get_setting(KEY_DISPLAY_NAME)?,
        }))
    }

    pub fn clear_session(&self) -> Result<()> {
        for key in [KEY_TOKEN, KEY_DRIVER_ID, KEY_DISPLAY_NAME] {
            self.delete_setting(key)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_roundtrip() {
        let storage = LocalStorage::in_memory().unwrap();
        assert_eq!(storage.get_setting("theme").unwrap(), None);

        storage.save_setting("theme", "dark").unwrap();
        storage.save_setting("theme", "light").unwrap();
        assert_eq!(storage.get_setting("theme").unwrap().as_deref(), Some("light"));

        storage.delete_setting("theme").unwrap();
        assert_eq!(storage.get_setting("theme").unwrap(), None);
    }

    #[test]
    fn test_session_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let mut identity = Identity::new("secret-token", "d1");
        identity.display_name = Some("Tunde".to_string());

        {
            let storage = LocalStorage::new(dir.path()).unwrap();
            storage.save_session(&identity).unwrap();
        }

        let storage = LocalStorage::new(dir.path()).unwrap();
        let restored = storage.load_session().unwrap().unwrap();
        assert_eq!(restored.token, "secret-token");
        assert_eq!(restored.driver_id, "d1");
        assert_eq!(restored.display_name.as_deref(), Some("Tunde"));

        storage.clear_session().unwrap();
        assert!(storage.load_session().unwrap().is_none());
    }

    #[test]
    fn test_partial_session_is_ignored() {
        let storage = LocalStorage::in_memory().unwrap();
        storage.save_setting(KEY_TOKEN, "orphan").unwrap();
        assert!(storage.load_session().unwrap().is_none());
    }
}
