//! Per-user, per-module key/value settings store.
//!
//! One pretty-printed JSON file per `(user, module, key)` under the store
//! root. Reads that miss write the supplied default back, so first use of
//! a module materializes an editable config file on disk. Operations are
//! self-contained and last-write-wins; there is no cross-key atomicity.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::warn;

/// File-backed settings store rooted at a configurable directory.
#[derive(Debug, Clone)]
pub struct SettingsStore {
    root: PathBuf,
}

impl SettingsStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// A view of this store scoped to one `(user, module)` pair.
    pub fn scoped(&self, user: &str, module: &str) -> ScopedSettings {
        ScopedSettings {
            store: self.clone(),
            user: user.to_string(),
            module: module.to_string(),
        }
    }

    /// Load a value; on a missing file the default is saved back and
    /// returned. A file that exists but does not parse yields the default
    /// without overwriting it.
    pub fn load(&self, user: &str, module: &str, key: &str, default: Value) -> Value {
        let path = self.path(user, module, key);
        match fs::read_to_string(&path) {
            Ok(text) => match serde_json::from_str(&text) {
                Ok(value) => value,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Unreadable settings file, using default");
                    default
                }
            },
            Err(_) => {
                if let Err(e) = self.save(user, module, key, &default) {
                    warn!(path = %path.display(), error = %e, "Failed to write default settings");
                }
                default
            }
        }
    }

    pub fn save(&self, user: &str, module: &str, key: &str, value: &Value) -> io::Result<()> {
        let path = self.path(user, module, key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, serde_json::to_string_pretty(value)?)
    }

    fn path(&self, user: &str, module: &str, key: &str) -> PathBuf {
        self.root.join(user).join(module).join(format!("{key}.json"))
    }
}

/// A settings view bound to one user and module, so module code only names
/// keys.
#[derive(Debug, Clone)]
pub struct ScopedSettings {
    store: SettingsStore,
    user: String,
    module: String,
}

impl ScopedSettings {
    pub fn load(&self, key: &str, default: Value) -> Value {
        self.store.load(&self.user, &self.module, key, default)
    }

    pub fn save(&self, key: &str, value: &Value) {
        if let Err(e) = self.store.save(&self.user, &self.module, key, value) {
            warn!(
                user = %self.user,
                module = %self.module,
                key = %key,
                error = %e,
                "Failed to save settings"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn missing_key_writes_default_back() {
        let dir = tempfile::tempdir().unwrap();
        let store = SettingsStore::new(dir.path());

        let value = store.load("alice", "player", "tokens", json!({"access_token": ""}));
        assert_eq!(value, json!({"access_token": ""}));

        // The default landed on disk and is returned on the next read.
        let path = dir.path().join("alice/player/tokens.json");
        assert!(path.exists());
        let again = store.load("alice", "player", "tokens", json!("other default"));
        assert_eq!(again, json!({"access_token": ""}));
    }

    #[test]
    fn save_then_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = SettingsStore::new(dir.path());

        store
            .save("bob", "home", "endpoint", &json!({"url": "http://hass.local"}))
            .unwrap();
        let value = store.load("bob", "home", "endpoint", json!(null));
        assert_eq!(value, json!({"url": "http://hass.local"}));
    }

    #[test]
    fn keys_are_isolated_per_user_and_module() {
        let dir = tempfile::tempdir().unwrap();
        let store = SettingsStore::new(dir.path());

        store.save("alice", "player", "k", &json!(1)).unwrap();
        store.save("alice", "home", "k", &json!(2)).unwrap();
        store.save("bob", "player", "k", &json!(3)).unwrap();

        assert_eq!(store.load("alice", "player", "k", json!(0)), json!(1));
        assert_eq!(store.load("alice", "home", "k", json!(0)), json!(2));
        assert_eq!(store.load("bob", "player", "k", json!(0)), json!(3));
    }

    #[test]
    fn scoped_view_uses_the_same_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = SettingsStore::new(dir.path());
        let scoped = store.scoped("carol", "internet");

        scoped.save("api", &json!({"api_key": "k"}));
        assert_eq!(
            store.load("carol", "internet", "api", json!(null)),
            json!({"api_key": "k"})
        );
    }
}
