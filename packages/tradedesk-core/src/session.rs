//! Client-side session storage.
//!
//! The backend keeps the real credentials in cookies. This store only caches
//! what the front end wants to remember between calls: the signed-in user's
//! profile, a session marker and the last activity timestamp.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::Result;

/// Cached profile of the signed-in user (JSON).
pub const USER_KEY: &str = "user";
/// Session marker written alongside the cached user.
pub const SESSION_KEY: &str = "session";
/// RFC 3339 timestamp of the last user activity.
pub const LAST_ACTIVITY_KEY: &str = "last_activity";

/// Session cookies saved by [`PersistentCookies`](crate::api::PersistentCookies).
pub const COOKIES_KEY: &str = "cookies";

/// Slots cleared by the client when the session cannot be renewed.
pub const EXPIRED_SESSION_KEYS: [&str; 2] = [USER_KEY, SESSION_KEY];

/// Every slot holding authentication data, cleared on logout.
pub const AUTH_KEYS: [&str; 7] = [
    USER_KEY,
    SESSION_KEY,
    LAST_ACTIVITY_KEY,
    COOKIES_KEY,
    "access_token",
    "refresh_token",
    "user_session",
];

/// Key-value storage for client-side session data.
pub trait SessionStore: Send + Sync + fmt::Debug {
    /// Read a slot.
    fn get(&self, key: &str) -> Option<String>;

    /// Write a slot.
    fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Clear a slot. Clearing an empty slot is not an error.
    fn remove(&self, key: &str) -> Result<()>;
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// In-memory session store. Contents are lost when the process exits.
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of occupied slots.
    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SessionStore for MemorySessionStore {
    fn get(&self, key: &str) -> Option<String> {
        lock(&self.entries).get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        lock(&self.entries).insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        lock(&self.entries).remove(key);
        Ok(())
    }
}

/// Session store persisted as a JSON object on disk.
///
/// Every write rewrites the whole file; the store is tiny.
#[derive(Debug)]
pub struct FileSessionStore {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, String>>,
}

impl FileSessionStore {
    /// Open the store at `path`, loading existing entries if the file exists.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let entries = Self::load_from_path(&path)?;
        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    /// Get the backing file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load_from_path(path: &Path) -> Result<BTreeMap<String, String>> {
        if !path.exists() {
            return Ok(BTreeMap::new());
        }

        let content = fs::read_to_string(path)?;
        if content.trim().is_empty() {
            return Ok(BTreeMap::new());
        }
        Ok(serde_json::from_str(&content)?)
    }

    fn save(&self, entries: &BTreeMap<String, String>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = serde_json::to_string_pretty(entries)?;
        fs::write(&self.path, content)?;
        Ok(())
    }
}

impl SessionStore for FileSessionStore {
    fn get(&self, key: &str) -> Option<String> {
        lock(&self.entries).get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut entries = lock(&self.entries);
        entries.insert(key.to_string(), value.to_string());
        self.save(&entries)
    }

    fn remove(&self, key: &str) -> Result<()> {
        let mut entries = lock(&self.entries);
        if entries.remove(key).is_none() {
            return Ok(());
        }
        self.save(&entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_memory_store_roundtrip() {
        let store = MemorySessionStore::new();
        assert!(store.get(USER_KEY).is_none());

        store.set(USER_KEY, r#"{"id":"u_1"}"#).unwrap();
        assert_eq!(store.get(USER_KEY).as_deref(), Some(r#"{"id":"u_1"}"#));

        store.remove(USER_KEY).unwrap();
        store.remove(USER_KEY).unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn test_file_store_persists_between_opens() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested/session.json");

        {
            let store = FileSessionStore::open(&path).unwrap();
            store.set(USER_KEY, "ada").unwrap();
            store.set(SESSION_KEY, "s_1").unwrap();
        }

        let store = FileSessionStore::open(&path).unwrap();
        assert_eq!(store.get(USER_KEY).as_deref(), Some("ada"));
        assert_eq!(store.get(SESSION_KEY).as_deref(), Some("s_1"));

        store.remove(SESSION_KEY).unwrap();
        let reopened = FileSessionStore::open(&path).unwrap();
        assert!(reopened.get(SESSION_KEY).is_none());
        assert_eq!(reopened.get(USER_KEY).as_deref(), Some("ada"));
    }

    #[test]
    fn test_file_store_missing_file_is_empty() {
        let dir = tempdir().unwrap();
        let store = FileSessionStore::open(dir.path().join("absent.json")).unwrap();
        assert!(store.get(USER_KEY).is_none());
        // Removing from an empty store doesn't create the file
        store.remove(USER_KEY).unwrap();
        assert!(!store.path().exists());
    }

    #[test]
    fn test_file_store_rejects_corrupt_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("session.json");
        fs::write(&path, "not json").unwrap();

        assert!(matches!(
            FileSessionStore::open(&path),
            Err(crate::Error::Json(_))
        ));
    }
}
