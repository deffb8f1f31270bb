//! Session credentials and their durable storage
//!
//! The token pair is the only mutable state shared across components. It is
//! written only through [`Session::set`] and [`Session::clear`], and every
//! write is persisted to the configured [`TokenStore`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use serde_json::Value as JsonValue;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::model::TokenPair;

/// Durable key for the access token
pub const TOKEN_KEY: &str = "token";
/// Durable key for the refresh token
pub const REFRESH_TOKEN_KEY: &str = "refreshToken";

/// Durable client storage for the token pair
pub trait TokenStore: Send + Sync {
    /// Read the persisted pair. A partial pair is reported as absent.
    fn load(&self) -> Result<Option<TokenPair>>;

    /// Persist the pair, or remove both keys when `None`.
    fn save(&self, pair: Option<&TokenPair>) -> Result<()>;
}

/// Token store backed by a small JSON key/value file
pub struct FileTokenStore {
    path: PathBuf,
}

impl FileTokenStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_entries(&self) -> Result<HashMap<String, JsonValue>> {
        if !self.path.exists() {
            return Ok(HashMap::new());
        }
        let content = std::fs::read_to_string(&self.path)?;
        if content.trim().is_empty() {
            return Ok(HashMap::new());
        }
        Ok(serde_json::from_str(&content)?)
    }
}

impl TokenStore for FileTokenStore {
    fn load(&self) -> Result<Option<TokenPair>> {
        let entries = self.read_entries()?;
        let token = entries.get(TOKEN_KEY).and_then(JsonValue::as_str);
        let refresh = entries.get(REFRESH_TOKEN_KEY).and_then(JsonValue::as_str);

        Ok(match (token, refresh) {
            (Some(token), Some(refresh)) => Some(TokenPair {
                access_token: token.to_string(),
                refresh_token: refresh.to_string(),
            }),
            _ => None,
        })
    }

    fn save(&self, pair: Option<&TokenPair>) -> Result<()> {
        // Other keys in the file are preserved
        let mut entries = self.read_entries().unwrap_or_default();
        match pair {
            Some(pair) => {
                entries.insert(TOKEN_KEY.into(), pair.access_token.clone().into());
                entries.insert(REFRESH_TOKEN_KEY.into(), pair.refresh_token.clone().into());
            }
            None => {
                entries.remove(TOKEN_KEY);
                entries.remove(REFRESH_TOKEN_KEY);
            }
        }

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(&self.path, serde_json::to_string_pretty(&entries)?)?;
        debug!(path = %self.path.display(), present = pair.is_some(), "Persisted session");
        Ok(())
    }
}

/// In-process token store
#[derive(Default)]
pub struct MemoryTokenStore {
    pair: RwLock<Option<TokenPair>>,
}

impl MemoryTokenStore {
    pub fn new(pair: Option<TokenPair>) -> Self {
        Self {
            pair: RwLock::new(pair),
        }
    }
}

impl TokenStore for MemoryTokenStore {
    fn load(&self) -> Result<Option<TokenPair>> {
        Ok(self.pair.read().map(|p| p.clone()).unwrap_or_default())
    }

    fn save(&self, pair: Option<&TokenPair>) -> Result<()> {
        if let Ok(mut stored) = self.pair.write() {
            *stored = pair.cloned();
        }
        Ok(())
    }
}

/// Current access/refresh credential pair
pub struct Session {
    store: Arc<dyn TokenStore>,
    pair: RwLock<Option<TokenPair>>,
    authenticated_tx: watch::Sender<bool>,
}

impl Session {
    /// Restore the pair from durable storage. Absence is a valid state, and
    /// an unreadable store is treated as absence.
    pub fn load(store: Arc<dyn TokenStore>) -> Self {
        let pair = match store.load() {
            Ok(pair) => pair,
            Err(e) => {
                warn!(error = %e, "Failed to read persisted session, starting logged out");
                None
            }
        };
        info!(authenticated = pair.is_some(), "Session loaded");

        let (authenticated_tx, _) = watch::channel(pair.is_some());
        Self {
            store,
            pair: RwLock::new(pair),
            authenticated_tx,
        }
    }

    /// Store both tokens and persist them
    pub fn set(&self, pair: TokenPair) {
        if let Err(e) = self.store.save(Some(&pair)) {
            warn!(error = %e, "Failed to persist session");
        }
        if let Ok(mut current) = self.pair.write() {
            *current = Some(pair);
        }
        self.authenticated_tx.send_replace(true);
    }

    /// Remove both tokens and persist the removal
    pub fn clear(&self) {
        if let Err(e) = self.store.save(None) {
            warn!(error = %e, "Failed to persist session removal");
        }
        if let Ok(mut current) = self.pair.write() {
            *current = None;
        }
        self.authenticated_tx.send_replace(false);
        info!("Session cleared");
    }

    pub fn is_authenticated(&self) -> bool {
        self.pair.read().map(|p| p.is_some()).unwrap_or(false)
    }

    /// Snapshot of the current pair
    pub fn current(&self) -> Option<TokenPair> {
        self.pair.read().map(|p| p.clone()).unwrap_or_default()
    }

    pub fn access_token(&self) -> Option<String> {
        self.current().map(|p| p.access_token)
    }

    pub fn refresh_token(&self) -> Option<String> {
        self.current().map(|p| p.refresh_token)
    }

    /// Observe authentication changes (forced logout included)
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.authenticated_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn pair(access: &str, refresh: &str) -> TokenPair {
        TokenPair {
            access_token: access.into(),
            refresh_token: refresh.into(),
        }
    }

    #[test]
    fn test_missing_file_is_logged_out() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(FileTokenStore::new(dir.path().join("session.json")));
        let session = Session::load(store);
        assert!(!session.is_authenticated());
        assert_eq!(session.access_token(), None);
    }

    #[test]
    fn test_partial_pair_is_treated_as_absent() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("session.json");
        std::fs::write(&path, r#"{"token":"abc"}"#).unwrap();

        let session = Session::load(Arc::new(FileTokenStore::new(&path)));
        assert!(!session.is_authenticated());
    }

    #[test]
    fn test_set_and_clear_persist() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("session.json");
        let store = Arc::new(FileTokenStore::new(&path));

        let session = Session::load(store.clone());
        session.set(pair("a1", "r1"));
        assert!(session.is_authenticated());
        assert_eq!(store.load().unwrap(), Some(pair("a1", "r1")));

        // A fresh process sees the persisted pair
        let restored = Session::load(store.clone());
        assert_eq!(restored.refresh_token().as_deref(), Some("r1"));

        session.clear();
        assert!(!session.is_authenticated());
        assert_eq!(store.load().unwrap(), None);

        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(!raw.contains(TOKEN_KEY));
    }

    #[test]
    fn test_save_preserves_unrelated_keys() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("session.json");
        std::fs::write(&path, r#"{"theme":"dark"}"#).unwrap();

        let store = FileTokenStore::new(&path);
        store.save(Some(&pair("a", "r"))).unwrap();
        store.save(None).unwrap();

        let raw: HashMap<String, JsonValue> =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw.get("theme").and_then(JsonValue::as_str), Some("dark"));
        assert_eq!(raw.len(), 1);
    }

    #[test]
    fn test_corrupt_store_loads_as_absent() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("session.json");
        std::fs::write(&path, "{{{").unwrap();

        let session = Session::load(Arc::new(FileTokenStore::new(&path)));
        assert!(!session.is_authenticated());
    }

    #[test]
    fn test_subscribers_observe_clear() {
        let session = Session::load(Arc::new(MemoryTokenStore::new(Some(pair("a", "r")))));
        let rx = session.subscribe();
        assert!(*rx.borrow());

        session.clear();
        assert!(!*rx.borrow());
    }
}
