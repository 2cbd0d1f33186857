use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use super::{FolderConfig, FolderConfigStore, StoreError};

pub const CONFIG_FILE_NAME: &str = "CamSyncConfig.json";

/// On-disk shape: `{ "folders": { "<name>": FolderConfig } }`.
#[derive(Debug, Default, Serialize, Deserialize)]
struct ConfigDocument {
    #[serde(default)]
    folders: BTreeMap<String, FolderConfig>,
    /// Unknown top-level keys are kept as-is
    #[serde(flatten)]
    extra: Map<String, Value>,
}

/// Keeps folder settings in a JSON file at the root of each device, so the
/// settings travel with the card.
#[derive(Debug, Clone)]
pub struct JsonFolderStore {
    file_name: String,
}

impl Default for JsonFolderStore {
    fn default() -> Self {
        Self {
            file_name: CONFIG_FILE_NAME.to_string(),
        }
    }
}

impl JsonFolderStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file_name(file_name: impl Into<String>) -> Self {
        Self {
            file_name: file_name.into(),
        }
    }

    pub fn config_path(&self, device: &Path) -> PathBuf {
        device.join(&self.file_name)
    }

    fn read_document(&self, path: &Path) -> Result<Option<ConfigDocument>, StoreError> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(StoreError::Io {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };

        serde_json::from_str(&content)
            .map(Some)
            .map_err(|source| StoreError::Parse {
                path: path.to_path_buf(),
                source,
            })
    }
}

impl FolderConfigStore for JsonFolderStore {
    fn get_folder_config(
        &self,
        device: &Path,
        folder_name: &str,
    ) -> Result<Option<FolderConfig>, StoreError> {
        let path = self.config_path(device);
        match self.read_document(&path) {
            Ok(doc) => Ok(doc.and_then(|mut d| d.folders.remove(folder_name))),
            Err(StoreError::Parse { path, source }) => {
                warn!(path = %path.display(), error = %source, "Ignoring unreadable folder config");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn save_folder_config(
        &self,
        device: &Path,
        folder_name: &str,
        config: &FolderConfig,
    ) -> Result<(), StoreError> {
        let path = self.config_path(device);

        // An unparseable file is left alone rather than overwritten
        let mut doc = self.read_document(&path)?.unwrap_or_default();
        doc.folders.insert(folder_name.to_string(), config.clone());

        let content = serde_json::to_string_pretty(&doc).map_err(|source| StoreError::Parse {
            path: path.clone(),
            source,
        })?;

        write_replacing(&path, content.as_bytes()).map_err(|source| StoreError::Io {
            path: path.clone(),
            source,
        })?;

        info!(path = %path.display(), folder = %folder_name, "Saved folder config");
        Ok(())
    }
}

/// Write next to `path` and rename over it, so pulling the card mid-save
/// leaves either the old file or the new one.
fn write_replacing(path: &Path, content: &[u8]) -> std::io::Result<()> {
    let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(".tmp");
    let tmp = path.with_file_name(tmp_name);

    let result = File::create(&tmp).and_then(|mut file| {
        file.write_all(content)?;
        file.sync_all()
    });
    if let Err(e) = result.and_then(|()| fs::rename(&tmp, path)) {
        let _ = fs::remove_file(&tmp);
        return Err(e);
    }
    Ok(())
}
