//! Per-device, per-folder backup settings.

mod json;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::core::CopyMode;

pub use json::{CONFIG_FILE_NAME, JsonFolderStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupStrategy {
    #[default]
    Incremental,
    Full,
    None,
}

impl BackupStrategy {
    /// The planning mode for this strategy, or `None` when backups are disabled.
    pub fn copy_mode(self) -> Option<CopyMode> {
        match self {
            BackupStrategy::Incremental => Some(CopyMode::Incremental),
            BackupStrategy::Full => Some(CopyMode::Full),
            BackupStrategy::None => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FolderConfig {
    pub device_path: PathBuf,
    pub folder_name: String,
    pub backup_strategy: BackupStrategy,
    pub preview_before_copy: bool,
    pub include_subfolders: bool,
    pub last_backup_time: Option<NaiveDateTime>,
    pub file_patterns: Vec<String>,
    pub exclude_patterns: Vec<String>,
    pub saved_files: Vec<String>,
    pub unsaved_files: Vec<String>,
}

impl Default for FolderConfig {
    fn default() -> Self {
        Self {
            device_path: PathBuf::new(),
            folder_name: String::new(),
            backup_strategy: BackupStrategy::Incremental,
            preview_before_copy: true,
            include_subfolders: true,
            last_backup_time: None,
            file_patterns: vec!["*".to_string()],
            exclude_patterns: Vec::new(),
            saved_files: Vec::new(),
            unsaved_files: Vec::new(),
        }
    }
}

impl FolderConfig {
    pub fn for_folder(device: &Path, folder_name: &str) -> Self {
        Self {
            device_path: device.to_path_buf(),
            folder_name: folder_name.to_string(),
            ..Self::default()
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("failed to access folder config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("folder config {path} is not valid JSON: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Storage for folder settings, keyed by device root and folder name.
pub trait FolderConfigStore: Send + Sync {
    fn get_folder_config(&self, device: &Path, folder_name: &str)
    -> Result<Option<FolderConfig>, StoreError>;

    fn save_folder_config(
        &self,
        device: &Path,
        folder_name: &str,
        config: &FolderConfig,
    ) -> Result<(), StoreError>;

    /// Create, persist and return the default settings for a folder.
    fn create_default_config(&self, device: &Path, folder_name: &str) -> Result<FolderConfig, StoreError> {
        let config = FolderConfig::for_folder(device, folder_name);
        self.save_folder_config(device, folder_name, &config)?;
        Ok(config)
    }

    /// Stored settings for the folder, creating defaults on first sight.
    fn get_or_create(&self, device: &Path, folder_name: &str) -> Result<FolderConfig, StoreError> {
        match self.get_folder_config(device, folder_name)? {
            Some(config) => Ok(config),
            None => self.create_default_config(device, folder_name),
        }
    }

    /// Stamp the folder with the current local time. No-op without a config.
    fn update_last_backup_time(&self, device: &Path, folder_name: &str) -> Result<(), StoreError> {
        if let Some(mut config) = self.get_folder_config(device, folder_name)? {
            config.last_backup_time = Some(chrono::Local::now().naive_local());
            self.save_folder_config(device, folder_name, &config)?;
        }
        Ok(())
    }

    fn update_folder_file_info(
        &self,
        device: &Path,
        folder_name: &str,
        saved_files: Vec<String>,
        unsaved_files: Vec<String>,
    ) -> Result<(), StoreError> {
        let mut config = self.get_or_create(device, folder_name)?;
        config.saved_files = saved_files;
        config.unsaved_files = unsaved_files;
        self.save_folder_config(device, folder_name, &config)
    }
}
