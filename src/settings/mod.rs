//! Persistent host settings: the four ports and the feature flag.
//!
//! The store is owned by the host application. The supervisor only reads it,
//! writes resolved values back and watches the feature flag for changes.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;
use tokio::sync::watch;

use crate::ports::PortSet;

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("failed to read settings from {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write settings to {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed settings file: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("settings lock poisoned")]
    LockPoisoned,
}

/// Raw persisted values. Ports are kept signed and optional because the
/// store may hold anything; validation happens during resolution.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedSettings {
    #[serde(default)]
    pub debug_port: Option<i64>,
    #[serde(default)]
    pub control_port: Option<i64>,
    #[serde(default)]
    pub agent_port: Option<i64>,
    #[serde(default)]
    pub extension_port: Option<i64>,
    #[serde(default)]
    pub feature_enabled: Option<bool>,
}

/// Host-side persistent store.
pub trait SettingsStore: Send + Sync {
    fn load(&self) -> Result<PersistedSettings, SettingsError>;

    fn save_ports(&self, ports: &PortSet) -> Result<(), SettingsError>;

    /// Updates the flag and notifies subscribers when the value changes.
    fn set_feature_enabled(&self, enabled: bool) -> Result<(), SettingsError>;

    /// Change notifications for the feature flag.
    fn subscribe_feature_enabled(&self) -> watch::Receiver<bool>;
}

/// JSON file backed store. Without a path it keeps everything in memory.
pub struct JsonSettingsStore {
    file_path: Option<PathBuf>,
    state: Mutex<PersistedSettings>,
    flag_tx: watch::Sender<bool>,
}

impl JsonSettingsStore {
    /// Opens the store at `path`; a missing file starts empty.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        let path = path.as_ref().to_path_buf();
        let settings = if path.exists() {
            let content = fs::read_to_string(&path).map_err(|source| SettingsError::Read {
                path: path.clone(),
                source,
            })?;
            if content.trim().is_empty() {
                PersistedSettings::default()
            } else {
                serde_json::from_str(&content)?
            }
        } else {
            tracing::info!("Settings file {} does not exist, starting empty", path.display());
            PersistedSettings::default()
        };

        Ok(Self::with_settings(Some(path), settings))
    }

    pub fn in_memory() -> Self {
        Self::with_settings(None, PersistedSettings::default())
    }

    pub fn with_settings(file_path: Option<PathBuf>, settings: PersistedSettings) -> Self {
        let (flag_tx, _) = watch::channel(settings.feature_enabled.unwrap_or(true));
        Self {
            file_path,
            state: Mutex::new(settings),
            flag_tx,
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, PersistedSettings>, SettingsError> {
        self.state.lock().map_err(|e| {
            tracing::error!("Settings lock poisoned: {}", e);
            SettingsError::LockPoisoned
        })
    }

    fn persist(&self, settings: &PersistedSettings) -> Result<(), SettingsError> {
        let Some(path) = &self.file_path else {
            return Ok(());
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| SettingsError::Write {
                path: path.clone(),
                source,
            })?;
        }
        let content = serde_json::to_string_pretty(settings)?;
        fs::write(path, content).map_err(|source| SettingsError::Write {
            path: path.clone(),
            source,
        })
    }
}

impl SettingsStore for JsonSettingsStore {
    fn load(&self) -> Result<PersistedSettings, SettingsError> {
        Ok(self.lock()?.clone())
    }

    fn save_ports(&self, ports: &PortSet) -> Result<(), SettingsError> {
        let mut state = self.lock()?;
        state.debug_port = Some(i64::from(ports.debug));
        state.control_port = Some(i64::from(ports.control));
        state.agent_port = Some(i64::from(ports.agent));
        state.extension_port = Some(i64::from(ports.extension));
        self.persist(&state)
    }

    fn set_feature_enabled(&self, enabled: bool) -> Result<(), SettingsError> {
        {
            let mut state = self.lock()?;
            state.feature_enabled = Some(enabled);
            self.persist(&state)?;
        }
        self.flag_tx.send_if_modified(|current| {
            if *current == enabled {
                false
            } else {
                *current = enabled;
                true
            }
        });
        Ok(())
    }

    fn subscribe_feature_enabled(&self) -> watch::Receiver<bool> {
        self.flag_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonSettingsStore::open(dir.path().join("settings.json")).unwrap();
        assert_eq!(store.load().unwrap(), PersistedSettings::default());
    }

    #[test]
    fn ports_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.json");
        let ports = PortSet {
            debug: 9300,
            control: 9301,
            agent: 9302,
            extension: 9303,
        };
        {
            let store = JsonSettingsStore::open(&path).unwrap();
            store.save_ports(&ports).unwrap();
            store.set_feature_enabled(false).unwrap();
        }

        let store = JsonSettingsStore::open(&path).unwrap();
        let loaded = store.load().unwrap();
        assert_eq!(loaded.debug_port, Some(9300));
        assert_eq!(loaded.extension_port, Some(9303));
        assert_eq!(loaded.feature_enabled, Some(false));
        assert!(!*store.subscribe_feature_enabled().borrow());
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            JsonSettingsStore::open(&path),
            Err(SettingsError::Malformed(_))
        ));
    }

    #[test]
    fn unknown_and_negative_values_are_preserved_raw() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, r#"{"debug_port": -5, "control_port": 0, "extra": 1}"#).unwrap();
        let loaded = JsonSettingsStore::open(&path).unwrap().load().unwrap();
        assert_eq!(loaded.debug_port, Some(-5));
        assert_eq!(loaded.control_port, Some(0));
        assert_eq!(loaded.agent_port, None);
    }

    #[tokio::test]
    async fn flag_change_notifies_once() {
        let store = JsonSettingsStore::in_memory();
        let mut rx = store.subscribe_feature_enabled();
        assert!(*rx.borrow());

        store.set_feature_enabled(false).unwrap();
        rx.changed().await.unwrap();
        assert!(!*rx.borrow_and_update());

        // Same value again is not a change
        store.set_feature_enabled(false).unwrap();
        assert!(!rx.has_changed().unwrap());
    }
}
