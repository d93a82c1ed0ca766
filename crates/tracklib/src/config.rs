//! Configuration loaded from `$TRACKLIB_HOME/config.toml`.
//!
//! Every field has a default, so a missing file or a partial file is valid.

use crate::error::ConfigError;
use crate::library::{LibraryId, DATABASE_FILENAME};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_FILENAME: &str = "config.toml";

fn default_data_dir() -> PathBuf {
    tracklib_logging::tracklib_home()
}

fn default_library_name() -> String {
    "Default".to_string()
}

fn default_true() -> bool {
    true
}

fn default_batch_size() -> usize {
    200
}

fn default_extensions() -> Vec<String> {
    [
        "mp3", "flac", "ogg", "opus", "m4a", "aac", "wav", "wv", "ape", "aiff", "wma",
    ]
    .iter()
    .map(|ext| ext.to_string())
    .collect()
}

fn default_exclude_dir_names() -> Vec<String> {
    vec![".git".to_string(), "@eaDir".to_string(), "$RECYCLE.BIN".to_string()]
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TracklibConfig {
    /// Root of the library stores: `<data_dir>/libraries/<id>/library.db`.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Name given to library 1 when it is first created.
    #[serde(default = "default_library_name")]
    pub default_library: String,

    #[serde(default)]
    pub indexer: IndexerConfig,
}

impl Default for TracklibConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            default_library: default_library_name(),
            indexer: IndexerConfig::default(),
        }
    }
}

impl TracklibConfig {
    pub fn default_path() -> PathBuf {
        tracklib_logging::tracklib_home().join(CONFIG_FILENAME)
    }

    /// Load from `path`, falling back to defaults when the file does not exist.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&text)?)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.to_toml()?)?;
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn library_dir(&self, id: LibraryId) -> PathBuf {
        self.data_dir.join("libraries").join(id.to_string())
    }

    pub fn library_db_path(&self, id: LibraryId) -> PathBuf {
        self.library_dir(id).join(DATABASE_FILENAME)
    }
}

/// Indexer behavior.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexerConfig {
    /// Synchronize once when the library opens.
    #[serde(default)]
    pub sync_on_startup: bool,

    /// Synchronize after `add_path`/`remove_path`.
    #[serde(default = "default_true")]
    pub sync_on_path_change: bool,

    /// Periodic synchronization; 0 disables it.
    #[serde(default)]
    pub auto_sync_interval_secs: u64,

    /// Delete tracks whose file is gone.
    #[serde(default = "default_true")]
    pub remove_missing_files: bool,

    /// Files per insert/update/delete query.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default)]
    pub follow_symlinks: bool,

    /// Lowercase extensions to index, without the dot.
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,

    /// Directory names skipped during the walk, matched exactly.
    #[serde(default = "default_exclude_dir_names")]
    pub exclude_dir_names: Vec<String>,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            sync_on_startup: false,
            sync_on_path_change: default_true(),
            auto_sync_interval_secs: 0,
            remove_missing_files: default_true(),
            batch_size: default_batch_size(),
            follow_symlinks: false,
            extensions: default_extensions(),
            exclude_dir_names: default_exclude_dir_names(),
        }
    }
}

impl IndexerConfig {
    pub fn auto_sync_interval(&self) -> Option<Duration> {
        (self.auto_sync_interval_secs > 0).then(|| Duration::from_secs(self.auto_sync_interval_secs))
    }

    /// Batch size, never zero.
    pub fn effective_batch_size(&self) -> usize {
        self.batch_size.max(1)
    }

    pub fn accepts_extension(&self, extension: &str) -> bool {
        self.extensions
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(extension))
    }

    pub fn is_excluded_dir(&self, name: &str) -> bool {
        self.exclude_dir_names.iter().any(|excluded| excluded == name)
    }
}
