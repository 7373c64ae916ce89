use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;
use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized},
};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

pub const SETTINGS_DIRECTORY_NAME: &str = "tandem";
pub const SETTINGS_FILE_NAME: &str = "settings.json";
pub const SETTINGS_ENV_PREFIX: &str = "TANDEM_";
pub const DEFAULT_LOG_FILTER: &str = "info,tandem_storage=warn";
const DATABASE_FILE_NAME: &str = "tandem.sqlite3";
const BLOB_DIRECTORY_NAME: &str = "blobs";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
    #[serde(default = "default_blob_root")]
    pub blob_root: PathBuf,
    /// Prefix that blob keys are appended to when building attachment URLs.
    #[serde(default)]
    pub blob_public_base_url: String,
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
    #[serde(default)]
    pub current_username: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            blob_root: default_blob_root(),
            blob_public_base_url: String::new(),
            log_filter: default_log_filter(),
            current_username: None,
        }
    }
}

impl Settings {
    pub fn normalized(mut self) -> Self {
        if self.database_path.as_os_str().is_empty() {
            self.database_path = default_database_path();
        }
        if self.blob_root.as_os_str().is_empty() {
            self.blob_root = default_blob_root();
        }

        self.blob_public_base_url = self.blob_public_base_url.trim().to_string();
        if self.blob_public_base_url.is_empty() {
            // Without a server in front of the blob root, attachments resolve to local files.
            self.blob_public_base_url = format!("file://{}", self.blob_root.display());
        }

        self.log_filter = if self.log_filter.trim().is_empty() {
            default_log_filter()
        } else {
            self.log_filter.trim().to_string()
        };
        self.current_username = self
            .current_username
            .map(|username| username.trim().to_string())
            .filter(|username| !username.is_empty());

        self
    }
}

pub struct SettingsStore {
    settings: ArcSwap<Settings>,
    config_path: PathBuf,
}

impl SettingsStore {
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".tandem"))
    }

    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join(SETTINGS_FILE_NAME)
    }

    pub fn new(config_path: PathBuf) -> Self {
        let settings = Self::load_from_disk(&config_path);
        Self {
            settings: ArcSwap::from_pointee(settings),
            config_path,
        }
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn settings(&self) -> Arc<Settings> {
        self.settings.load_full()
    }

    pub fn update(&self, settings: Settings) -> Result<Arc<Settings>, SettingsError> {
        let normalized_settings = Arc::new(settings.normalized());
        self.persist(&normalized_settings)?;
        self.settings.store(Arc::clone(&normalized_settings));
        Ok(normalized_settings)
    }

    fn load_from_disk(path: &Path) -> Settings {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "settings file not found; using defaults");
        }

        let figment = Figment::from(Serialized::defaults(Settings::default()))
            .merge(Json::file(path))
            .merge(Env::prefixed(SETTINGS_ENV_PREFIX));

        match figment.extract::<Settings>() {
            Ok(settings) => settings.normalized(),
            Err(error) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %error,
                    "failed to parse settings; using defaults"
                );
                Settings::default().normalized()
            }
        }
    }

    fn persist(&self, settings: &Settings) -> Result<(), SettingsError> {
        if let Some(parent) = self.config_path.parent() {
            std::fs::create_dir_all(parent).context(CreateDirSnafu {
                stage: "create-settings-directory",
                path: parent.to_path_buf(),
            })?;
        }

        let content = serde_json::to_string_pretty(settings).context(SerializeConfigSnafu {
            stage: "serialize-settings-json",
        })?;

        let temp_path = self.config_path.with_extension("json.tmp");
        std::fs::write(&temp_path, content).context(WriteFileSnafu {
            stage: "write-temporary-settings-file",
            path: temp_path.clone(),
        })?;

        std::fs::rename(&temp_path, &self.config_path).context(RenameTempFileSnafu {
            stage: "rename-temporary-settings-file",
            from: temp_path,
            to: self.config_path.clone(),
        })?;

        tracing::info!(path = %self.config_path.display(), "saved settings");
        Ok(())
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SettingsError {
    #[snafu(display("failed to create settings directory at {path:?} on `{stage}`: {source}"))]
    CreateDir {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("failed to serialize settings on `{stage}`: {source}"))]
    SerializeConfig {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("failed to write settings file at {path:?} on `{stage}`: {source}"))]
    WriteFile {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display(
        "failed to replace settings file from {from:?} to {to:?} on `{stage}`: {source}"
    ))]
    RenameTempFile {
        stage: &'static str,
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
}

fn data_dir() -> PathBuf {
    dirs::data_dir()
        .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
        .unwrap_or_else(|| PathBuf::from(".tandem"))
}

fn default_database_path() -> PathBuf {
    data_dir().join(DATABASE_FILE_NAME)
}

fn default_blob_root() -> PathBuf {
    data_dir().join(BLOB_DIRECTORY_NAME)
}

fn default_log_filter() -> String {
    DEFAULT_LOG_FILTER.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_normalized_defaults() {
        let directory = tempfile::tempdir().unwrap();
        let store = SettingsStore::new(directory.path().join("settings.json"));

        let settings = store.settings();
        assert_eq!(settings.database_path, default_database_path());
        assert!(settings.blob_public_base_url.starts_with("file://"));
    }

    #[test]
    fn update_persists_and_reloads() {
        let directory = tempfile::tempdir().unwrap();
        let path = directory.path().join("nested").join("settings.json");
        let store = SettingsStore::new(path.clone());

        let saved = store
            .update(Settings {
                database_path: directory.path().join("chat.sqlite3"),
                blob_root: directory.path().join("blobs"),
                blob_public_base_url: " https://cdn.test/files ".to_string(),
                log_filter: "debug".to_string(),
                current_username: Some("  alice ".to_string()),
            })
            .unwrap();

        assert_eq!(saved.blob_public_base_url, "https://cdn.test/files");
        assert_eq!(saved.current_username.as_deref(), Some("alice"));
        assert!(!path.with_extension("json.tmp").exists());

        let reloaded = SettingsStore::new(path);
        assert_eq!(*reloaded.settings(), *saved);
    }

    #[test]
    fn malformed_file_falls_back_to_defaults() {
        let directory = tempfile::tempdir().unwrap();
        let path = directory.path().join("settings.json");
        std::fs::write(&path, "{ not json").unwrap();

        let store = SettingsStore::new(path);

        assert_eq!(store.settings().log_filter, DEFAULT_LOG_FILTER);
        assert_eq!(store.settings().current_username, None);
    }

    #[test]
    fn blank_fields_are_restored() {
        let normalized = Settings {
            database_path: PathBuf::new(),
            blob_root: PathBuf::new(),
            blob_public_base_url: "   ".to_string(),
            log_filter: " ".to_string(),
            current_username: Some("   ".to_string()),
        }
        .normalized();

        assert_eq!(normalized.database_path, default_database_path());
        assert_eq!(normalized.blob_root, default_blob_root());
        assert_eq!(normalized.log_filter, DEFAULT_LOG_FILTER);
        assert_eq!(normalized.current_username, None);
    }
}
