use std::collections::HashSet;
use std::ffi::{OsStr, OsString};
use std::fs;
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::core::models::Volume;
use crate::core::volume::{EnumerationError, VolumeEnumerator};

#[derive(Debug, Clone)]
pub struct LinuxEnumeratorConfig {
    /// Mount table to read (normally `/proc/mounts`)
    pub mounts_path: PathBuf,
    /// sysfs block directory (normally `/sys/block`)
    pub sys_block_path: PathBuf,
    /// Label symlink directory (normally `/dev/disk/by-label`)
    pub by_label_path: PathBuf,
    /// Mounts below these roots count as removable even when sysfs says
    /// otherwise, since many USB readers report `removable = 0`
    pub media_roots: Vec<PathBuf>,
}

impl Default for LinuxEnumeratorConfig {
    fn default() -> Self {
        Self {
            mounts_path: PathBuf::from("/proc/mounts"),
            sys_block_path: PathBuf::from("/sys/block"),
            by_label_path: PathBuf::from("/dev/disk/by-label"),
            media_roots: vec![PathBuf::from("/media"), PathBuf::from("/run/media")],
        }
    }
}

/// Lists removable volumes from the kernel mount table.
pub struct LinuxEnumerator {
    config: LinuxEnumeratorConfig,
}

impl LinuxEnumerator {
    pub fn new(config: LinuxEnumeratorConfig) -> Self {
        Self { config }
    }

    pub fn with_defaults() -> Self {
        Self::new(LinuxEnumeratorConfig::default())
    }

    fn is_removable(&self, device_name: &str, mount_point: &Path) -> bool {
        if self
            .config
            .media_roots
            .iter()
            .any(|root| mount_point.starts_with(root))
        {
            return true;
        }

        let Some(disk) = parent_disk(&self.config.sys_block_path, device_name) else {
            debug!(device = %device_name, "No sysfs entry for block device");
            return false;
        };

        let flag_path = self.config.sys_block_path.join(&disk).join("removable");
        match fs::read_to_string(&flag_path) {
            Ok(flag) => flag.trim() == "1",
            Err(e) => {
                debug!(path = %flag_path.display(), error = %e, "Cannot read removable flag");
                false
            }
        }
    }

    fn label_for(&self, device_name: &str, mount_point: &Path) -> String {
        if let Some(label) = self.lookup_label(device_name) {
            return label;
        }

        mount_point
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| device_name.to_string())
    }

    fn lookup_label(&self, device_name: &str) -> Option<String> {
        let entries = fs::read_dir(&self.config.by_label_path).ok()?;

        for entry in entries.flatten() {
            let Ok(target) = fs::read_link(entry.path()) else {
                continue;
            };
            if target.file_name().is_some_and(|n| n == device_name) {
                return Some(unescape_label(&entry.file_name().to_string_lossy()));
            }
        }

        None
    }
}

impl VolumeEnumerator for LinuxEnumerator {
    fn list_volumes(&self) -> Result<Vec<Volume>, EnumerationError> {
        let table = fs::read(&self.config.mounts_path).map_err(|source| {
            EnumerationError::MountTable {
                path: self.config.mounts_path.clone(),
                source,
            }
        })?;

        let mut seen = HashSet::new();
        let mut volumes = Vec::new();

        for line in table.split(|&b| b == b'\n') {
            let mut fields = line
                .split(|b| b.is_ascii_whitespace())
                .filter(|f| !f.is_empty());
            let (Some(device), Some(mount_point)) = (fields.next(), fields.next()) else {
                continue;
            };

            if !device.starts_with(b"/dev/") {
                continue;
            }

            let mount_point = unescape_mount_field(mount_point);
            if !seen.insert(mount_point.clone()) {
                continue;
            }

            let device = Path::new(OsStr::from_bytes(device));
            let device_path = fs::canonicalize(device).unwrap_or_else(|_| device.to_path_buf());
            let Some(device_name) = device_path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
            else {
                warn!(device = %device.display(), "Skipping mount with unusable device path");
                continue;
            };

            if !self.is_removable(&device_name, &mount_point) {
                continue;
            }

            let label = self.label_for(&device_name, &mount_point);
            volumes.push(Volume {
                path: mount_point,
                label,
                removable: true,
            });
        }

        Ok(volumes)
    }
}

/// Name of the whole-disk sysfs entry for a block device or partition.
fn parent_disk(sys_block: &Path, device_name: &str) -> Option<String> {
    if sys_block.join(device_name).exists() {
        return Some(device_name.to_string());
    }

    // mmcblk0p1 / nvme0n1p1 -> strip "pN"; sdb1 -> strip trailing digits
    let without_digits = device_name.trim_end_matches(|c: char| c.is_ascii_digit());
    let candidate = match without_digits.strip_suffix('p') {
        Some(base) if base.ends_with(|c: char| c.is_ascii_digit()) => base,
        _ => without_digits,
    };

    (!candidate.is_empty() && sys_block.join(candidate).exists()).then(|| candidate.to_string())
}

/// Decode the octal escapes (`\040` for space, ...) used in `/proc/mounts`.
///
/// Mount points are raw bytes; FAT labels written by cameras are not always UTF-8.
fn unescape_mount_field(field: &[u8]) -> PathBuf {
    let mut out = Vec::with_capacity(field.len());
    let mut i = 0;

    while i < field.len() {
        if field[i] == b'\\' && i + 3 < field.len() {
            let digits = &field[i + 1..i + 4];
            if digits.iter().all(|b| (b'0'..=b'7').contains(b)) {
                let value = digits
                    .iter()
                    .fold(0u32, |acc, b| acc * 8 + u32::from(b - b'0'));
                if let Ok(value) = u8::try_from(value) {
                    out.push(value);
                    i += 4;
                    continue;
                }
            }
        }
        out.push(field[i]);
        i += 1;
    }

    PathBuf::from(OsString::from_vec(out))
}

/// Decode the `\xNN` escapes udev uses in `/dev/disk/by-label` names.
fn unescape_label(name: &str) -> String {
    let mut out = Vec::with_capacity(name.len());
    let bytes = name.as_bytes();
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'\\' && bytes.get(i + 1) == Some(&b'x') && i + 4 <= bytes.len() {
            let hex = std::str::from_utf8(&bytes[i + 2..i + 4]).ok();
            if let Some(value) = hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                out.push(value);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }

    String::from_utf8_lossy(&out).into_owned()
}
