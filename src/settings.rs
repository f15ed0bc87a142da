use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Small per-user preference file kept next to the content index.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UserSettings {
    #[serde(default)]
    pub skip_delete_confirmation: bool,
    /// Millisecond timestamp of the last successful auto-sync.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sync_at: Option<i64>,
}

pub fn load_user_settings(path: &Path) -> io::Result<UserSettings> {
    let bytes = fs::read(path)?;
    serde_json::from_slice(&bytes).map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
}

pub fn save_user_settings(path: &Path, settings: &UserSettings) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_vec_pretty(settings)
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
    fs::write(path, json)
}

pub fn default_settings_path(root: &Path) -> PathBuf {
    root.join("user_settings.json")
}

/// Shared handle over the settings file. Missing or corrupt files fall
/// back to defaults; writes go straight through to disk.
pub struct SettingsStore {
    path: PathBuf,
    inner: Mutex<UserSettings>,
}

impl SettingsStore {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let settings = match load_user_settings(&path) {
            Ok(settings) => settings,
            Err(err) if err.kind() == io::ErrorKind::NotFound => UserSettings::default(),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "unreadable settings file, using defaults");
                UserSettings::default()
            }
        };
        Self {
            path,
            inner: Mutex::new(settings),
        }
    }

    pub fn snapshot(&self) -> UserSettings {
        self.inner.lock().expect("poisoned").clone()
    }

    pub fn update<F>(&self, apply: F) -> io::Result<()>
    where
        F: FnOnce(&mut UserSettings),
    {
        let mut guard = self.inner.lock().expect("poisoned");
        apply(&mut guard);
        save_user_settings(&self.path, &guard)
    }

    pub fn last_sync_at(&self) -> Option<i64> {
        self.inner.lock().expect("poisoned").last_sync_at
    }

    pub fn set_last_sync_at(&self, timestamp: i64) -> io::Result<()> {
        self.update(|settings| settings.last_sync_at = Some(timestamp))
    }
}
