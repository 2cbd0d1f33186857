use serde::Serialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Maximum number of failed files listed in an outcome message.
const MAX_REPORTED_FAILURES: usize = 5;

/// A mounted removable volume, identified by its root path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Volume {
    pub path: PathBuf,
    pub label: String,
    pub removable: bool,
}

impl Volume {
    pub fn new(path: impl Into<PathBuf>, label: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            label: label.into(),
            removable: true,
        }
    }
}

/// A recognized camera-media folder directly under a volume root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MarkerFolder {
    pub name: String,
    pub path: PathBuf,
    pub file_count: u64,
    pub total_bytes: u64,
}

/// A single planned file transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CopyItem {
    pub source: PathBuf,
    pub destination: PathBuf,
    /// Source size observed while planning
    pub size: u64,
}

impl CopyItem {
    /// Short description used for progress reporting.
    pub fn describe(&self) -> String {
        let name = self
            .source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.source.display().to_string());
        format!("Copying {}", name)
    }
}

/// Ordered list of transfers, in source tree traversal order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CopySet {
    items: Vec<CopyItem>,
}

impl CopySet {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&mut self, item: CopyItem) {
        self.items.push(item);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, CopyItem> {
        self.items.iter()
    }

    pub fn items(&self) -> &[CopyItem] {
        &self.items
    }

    /// Sum of the planned source sizes.
    pub fn total_bytes(&self) -> u64 {
        self.items.iter().map(|i| i.size).sum()
    }
}

impl From<Vec<CopyItem>> for CopySet {
    fn from(items: Vec<CopyItem>) -> Self {
        Self { items }
    }
}

impl IntoIterator for CopySet {
    type Item = CopyItem;
    type IntoIter = std::vec::IntoIter<CopyItem>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.into_iter()
    }
}

impl<'a> IntoIterator for &'a CopySet {
    type Item = &'a CopyItem;
    type IntoIter = std::slice::Iter<'a, CopyItem>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}

/// Three-way structural comparison of two trees, keyed by relative path.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DiffReport {
    pub source_only: BTreeSet<PathBuf>,
    pub dest_only: BTreeSet<PathBuf>,
    /// Present on both sides with a different size or modification time
    pub changed: BTreeSet<PathBuf>,
    /// Source total bytes minus destination total bytes
    pub size_delta: i64,
}

impl DiffReport {
    pub fn is_identical(&self) -> bool {
        self.source_only.is_empty()
            && self.dest_only.is_empty()
            && self.changed.is_empty()
            && self.size_delta == 0
    }
}

/// Progress update emitted after each attempted item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CopyProgress {
    pub done: usize,
    pub total: usize,
    pub current: String,
}

/// A file that could not be copied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CopyFailure {
    pub path: PathBuf,
    pub error: String,
    /// The I/O error looked like the source device went away
    pub device_removed: bool,
}

/// Terminal result of one copy run.
#[derive(Debug, Clone, Serialize)]
pub struct TransferOutcome {
    pub success: bool,
    pub transferred: usize,
    pub failures: Vec<CopyFailure>,
    pub elapsed: Duration,
    pub cancelled: bool,
    pub message: String,
}

impl TransferOutcome {
    pub(crate) fn from_run(
        transferred: usize,
        failures: Vec<CopyFailure>,
        elapsed: Duration,
        cancelled: bool,
    ) -> Self {
        let success = failures.is_empty();

        let mut message = if success {
            format!(
                "Copied {} file(s) in {:.2}s",
                transferred,
                elapsed.as_secs_f64()
            )
        } else {
            let mut msg = format!(
                "Copy finished with {} failed file(s)\nFailed files:\n",
                failures.len()
            );
            for failure in failures.iter().take(MAX_REPORTED_FAILURES) {
                msg.push_str(&format!("- {}: {}\n", failure.path.display(), failure.error));
            }
            if failures.len() > MAX_REPORTED_FAILURES {
                msg.push_str(&format!(
                    "... and {} more failed file(s) not shown",
                    failures.len() - MAX_REPORTED_FAILURES
                ));
            }
            msg.trim_end().to_string()
        };

        if cancelled {
            message = format!("Cancelled. {}", message);
        }

        Self {
            success,
            transferred,
            failures,
            elapsed,
            cancelled,
            message,
        }
    }

    /// Outcome for a run that died outside the per-item error handling.
    pub(crate) fn fatal(error: impl Into<String>, elapsed: Duration) -> Self {
        let error = error.into();
        Self {
            success: false,
            transferred: 0,
            failures: Vec::new(),
            elapsed,
            cancelled: false,
            message: format!("Copy operation failed: {}", error),
        }
    }

    pub fn failed_paths(&self) -> impl Iterator<Item = &Path> {
        self.failures.iter().map(|f| f.path.as_path())
    }
}

/// Format a byte count with two decimals, e.g. `1.50 MB`.
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];

    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    format!("{:.2} {}", size, UNITS[unit])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failure(n: usize) -> CopyFailure {
        CopyFailure {
            path: PathBuf::from(format!("/card/DCIM/IMG_{:04}.JPG", n)),
            error: "Permission denied".to_string(),
            device_removed: false,
        }
    }

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(0), "0.00 B");
        assert_eq!(format_size(512), "512.00 B");
        assert_eq!(format_size(1536), "1.50 KB");
        assert_eq!(format_size(5 * 1024 * 1024 * 1024), "5.00 GB");
        assert_eq!(format_size(3 * 1024u64.pow(5)), "3072.00 TB");
    }

    #[test]
    fn test_outcome_success_message() {
        let outcome = TransferOutcome::from_run(3, Vec::new(), Duration::from_millis(1500), false);
        assert!(outcome.success);
        assert_eq!(outcome.message, "Copied 3 file(s) in 1.50s");
    }

    #[test]
    fn test_outcome_lists_first_five_failures() {
        let failures: Vec<_> = (0..8).map(failure).collect();
        let outcome = TransferOutcome::from_run(2, failures, Duration::from_secs(1), false);

        assert!(!outcome.success);
        assert!(outcome.message.contains("8 failed file(s)"));
        assert!(outcome.message.contains("IMG_0004.JPG"));
        assert!(!outcome.message.contains("IMG_0005.JPG"));
        assert!(outcome.message.ends_with("... and 3 more failed file(s) not shown"));
    }

    #[test]
    fn test_outcome_cancelled_keeps_success_semantics() {
        let outcome = TransferOutcome::from_run(1, Vec::new(), Duration::ZERO, true);
        assert!(outcome.success);
        assert!(outcome.cancelled);
        assert!(outcome.message.starts_with("Cancelled."));
    }

    #[test]
    fn test_copy_set_total_bytes() {
        let set = CopySet::from(vec![
            CopyItem {
                source: PathBuf::from("/a/1.jpg"),
                destination: PathBuf::from("/b/1.jpg"),
                size: 10,
            },
            CopyItem {
                source: PathBuf::from("/a/2.jpg"),
                destination: PathBuf::from("/b/2.jpg"),
                size: 32,
            },
        ]);
        assert_eq!(set.len(), 2);
        assert_eq!(set.total_bytes(), 42);
        assert_eq!(set.items()[0].describe(), "Copying 1.jpg");
    }
}
