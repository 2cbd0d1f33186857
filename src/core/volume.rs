use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};
use walkdir::WalkDir;

use super::models::{MarkerFolder, Volume};

/// Folder names that mark a volume as carrying camera media.
pub const DEFAULT_MARKER_FOLDERS: [&str; 3] = ["DCIM", "PRIVATE", "MISC"];

#[derive(Debug, Clone)]
pub enum VolumeEvent {
    Arrived {
        volume: Volume,
        marker_folders: Vec<MarkerFolder>,
    },
    Departed(PathBuf),
}

#[derive(Debug, thiserror::Error)]
pub enum EnumerationError {
    #[error("failed to read mount table {path}: {source}")]
    MountTable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("volume enumeration failed: {0}")]
    Other(String),
}

/// Platform seam for listing attached removable volumes.
pub trait VolumeEnumerator: Send + Sync {
    /// List all currently attached removable volumes.
    fn list_volumes(&self) -> Result<Vec<Volume>, EnumerationError>;
}

/// Find recognized marker folders directly under `volume_path`.
///
/// Only real directories (or links resolving to directories) are returned, in
/// the order of `names`. Each folder is sized with a full recursive walk.
pub fn scan_marker_folders(volume_path: &Path, names: &[String]) -> Vec<MarkerFolder> {
    let entries = match fs::read_dir(volume_path) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(volume = %volume_path.display(), error = %e, "Failed to list volume root");
            return Vec::new();
        }
    };

    let present: HashSet<String> = entries
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry.file_name().to_string_lossy().into_owned()),
            Err(e) => {
                warn!(volume = %volume_path.display(), error = %e, "Skipping unreadable entry");
                None
            }
        })
        .collect();

    let mut found = Vec::new();
    for name in names {
        if !present.contains(name) {
            continue;
        }

        let path = volume_path.join(name);
        match fs::metadata(&path) {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => {
                debug!(path = %path.display(), "Marker name is not a directory, ignoring");
                continue;
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to stat marker folder");
                continue;
            }
        }

        let (file_count, total_bytes) = folder_stats(&path);
        info!(
            volume = %volume_path.display(),
            folder = %name,
            file_count,
            total_bytes,
            "Found marker folder"
        );

        found.push(MarkerFolder {
            name: name.clone(),
            path,
            file_count,
            total_bytes,
        });
    }

    found
}

/// Count files and sum their sizes under `path`. Unreadable entries are skipped.
pub fn folder_stats(path: &Path) -> (u64, u64) {
    let mut file_count = 0;
    let mut total_bytes = 0;

    for entry in WalkDir::new(path).follow_links(false) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                debug!(error = %e, "Skipping unreadable entry while sizing folder");
                continue;
            }
        };

        if !entry.file_type().is_file() {
            continue;
        }

        if let Ok(meta) = entry.metadata() {
            file_count += 1;
            total_bytes += meta.len();
        }
    }

    (file_count, total_bytes)
}

pub fn default_marker_folders() -> Vec<String> {
    DEFAULT_MARKER_FOLDERS.iter().map(|s| s.to_string()).collect()
}
