//! Durable key-value settings used by the session.
//!
//! The session never touches a process-global store. It is handed a
//! [`SettingsStore`] at construction: [`FileSettings`] for real use and
//! [`MemorySettings`] for tests.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::SettingsError;

/// Well-known settings keys.
pub mod keys {
    pub const AUTH_TOKEN: &str = "OvertimeAuthToken";
    pub const DEVICE_ID: &str = "OvertimeDeviceId";
    pub const DEVICE_USER_ID: &str = "OvertimeDeviceUserId";
    pub const CURRENT_USER_ID: &str = "OvertimeCurrentUserId";
    pub const MIGRATED_USER_ID: &str = "OvertimeMigratedUserId";
    pub const APP_UPDATE_STATUS: &str = "appUpdateStatus";
    pub const UPDATE_PROMPT_AT: &str = "ConfigurationUpdatePromptKey";
    pub const DEBUG_UPDATE_PROMPT: &str = "debugConfigurationUpdatePromptKey";
    pub const PUSH_DEVICE_TOKEN: &str = "deviceToken";
}

/// A flat, string-keyed durable store.
#[async_trait]
pub trait SettingsStore: Send + Sync {
    /// Get a value by key.
    async fn get(&self, key: &str) -> Option<String>;

    /// Set a value, persisting it before returning.
    async fn set(&self, key: &str, value: &str) -> Result<(), SettingsError>;

    /// Remove a value. Removing a missing key is not an error.
    async fn remove(&self, key: &str) -> Result<(), SettingsError>;

    /// Remove every value.
    async fn clear(&self) -> Result<(), SettingsError>;

    /// All keys currently stored.
    async fn keys(&self) -> Vec<String>;
}

/// In-memory settings, for tests and ephemeral sessions.
#[derive(Debug, Default)]
pub struct MemorySettings {
    values: DashMap<String, String>,
}

impl MemorySettings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored values.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[async_trait]
impl SettingsStore for MemorySettings {
    async fn get(&self, key: &str) -> Option<String> {
        self.values.get(key).map(|v| v.value().clone())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), SettingsError> {
        self.values.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), SettingsError> {
        self.values.remove(key);
        Ok(())
    }

    async fn clear(&self) -> Result<(), SettingsError> {
        self.values.clear();
        Ok(())
    }

    async fn keys(&self) -> Vec<String> {
        self.values.iter().map(|r| r.key().clone()).collect()
    }
}

/// Settings file format.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SettingsFile {
    version: u32,
    values: HashMap<String, String>,
}

impl Default for SettingsFile {
    fn default() -> Self {
        Self {
            version: 1,
            values: HashMap::new(),
        }
    }
}

/// Settings persisted to a JSON file.
///
/// Every mutation rewrites the file. The file is created with owner-only
/// permissions on Unix since it holds the auth token.
#[derive(Debug)]
pub struct FileSettings {
    path: PathBuf,
    data: RwLock<SettingsFile>,
}

impl FileSettings {
    /// Load settings from the default or specified path.
    ///
    /// If the file doesn't exist, starts with an empty store.
    pub async fn load(path: Option<PathBuf>) -> Result<Self, SettingsError> {
        let path = path.unwrap_or_else(Self::default_path);

        let data = if fs::try_exists(&path).await? {
            let content = fs::read_to_string(&path).await?;
            serde_json::from_str(&content)?
        } else {
            SettingsFile::default()
        };

        debug!(path = %path.display(), count = data.values.len(), "loaded settings");
        Ok(Self {
            path,
            data: RwLock::new(data),
        })
    }

    /// Get the default settings path.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("overtime")
            .join("settings.json")
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn save(&self, data: &SettingsFile) -> Result<(), SettingsError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let content = serde_json::to_string_pretty(data)?;

        #[cfg(unix)]
        {
            let mut file = fs::OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .mode(0o600)
                .open(&self.path)
                .await?;
            file.write_all(content.as_bytes()).await?;
            file.flush().await?;
        }

        #[cfg(not(unix))]
        {
            let mut file = fs::File::create(&self.path).await?;
            file.write_all(content.as_bytes()).await?;
            file.flush().await?;
        }

        Ok(())
    }
}

#[async_trait]
impl SettingsStore for FileSettings {
    async fn get(&self, key: &str) -> Option<String> {
        self.data.read().await.values.get(key).cloned()
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), SettingsError> {
        let mut data = self.data.write().await;
        data.values.insert(key.to_string(), value.to_string());
        self.save(&data).await
    }

    async fn remove(&self, key: &str) -> Result<(), SettingsError> {
        let mut data = self.data.write().await;
        if data.values.remove(key).is_some() {
            self.save(&data).await?;
        }
        Ok(())
    }

    async fn clear(&self) -> Result<(), SettingsError> {
        let mut data = self.data.write().await;
        data.values.clear();
        self.save(&data).await?;
        debug!(path = %self.path.display(), "settings cleared");
        Ok(())
    }

    async fn keys(&self) -> Vec<String> {
        self.data.read().await.values.keys().cloned().collect()
    }
}
