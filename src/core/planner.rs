//! Copy-set planning and tree comparison.
//!
//! Incremental planning uses a size + modification time heuristic, not content
//! hashes. A destination file with the same size as its source and an mtime no
//! older than the source is treated as already copied, so two different files
//! that happen to match on both counts are skipped (a known false negative).

use std::collections::BTreeMap;
use std::fs::{self, Metadata};
use std::path::{Path, PathBuf};

use filetime::FileTime;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use super::models::{CopyItem, CopySet, DiffReport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CopyMode {
    /// Copy every source file
    Full,
    /// Skip files that appear to be already present at the destination
    Incremental,
}

impl From<bool> for CopyMode {
    fn from(incremental: bool) -> Self {
        if incremental {
            CopyMode::Incremental
        } else {
            CopyMode::Full
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PlanError {
    #[error("cannot read source folder {path}: {source}")]
    SourceUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot read destination folder {path}: {source}")]
    DestinationUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// A copy-set plus the files left out of it because the destination is current.
#[derive(Debug, Clone, Default)]
pub struct FolderPlan {
    pub set: CopySet,
    /// Relative paths skipped by incremental planning
    pub up_to_date: Vec<PathBuf>,
}

/// Compute the files under `source_root` that must be copied to `dest_root`.
///
/// Fails only when the source root itself cannot be read. Entries that cannot
/// be read or stat'ed during the walk are logged and left out of the plan.
pub fn plan_copy(source_root: &Path, dest_root: &Path, mode: CopyMode) -> Result<CopySet, PlanError> {
    plan_folder(source_root, dest_root, mode).map(|plan| plan.set)
}

/// Like [`plan_copy`], also reporting which files were skipped as up to date.
pub fn plan_folder(source_root: &Path, dest_root: &Path, mode: CopyMode) -> Result<FolderPlan, PlanError> {
    fs::read_dir(source_root).map_err(|source| PlanError::SourceUnreadable {
        path: source_root.to_path_buf(),
        source,
    })?;

    let mut plan = FolderPlan::default();

    for (relative, meta) in walk_files(source_root) {
        let source = source_root.join(&relative);
        let destination = dest_root.join(&relative);

        if mode == CopyMode::Incremental && is_up_to_date(&meta, &destination) {
            debug!(file = %relative.display(), "Destination is up to date, skipping");
            plan.up_to_date.push(relative);
            continue;
        }

        plan.set.push(CopyItem {
            source,
            destination,
            size: meta.len(),
        });
    }

    info!(
        source = %source_root.display(),
        destination = %dest_root.display(),
        ?mode,
        planned = plan.set.len(),
        skipped = plan.up_to_date.len(),
        total_bytes = plan.set.total_bytes(),
        "Copy plan ready"
    );

    Ok(plan)
}

/// Compare two trees by relative path, size and modification time.
///
/// A missing destination root compares as an empty tree. This is an audit
/// view only: files count as equal solely when size and mtime both match,
/// which is stricter than the incremental planning rule.
pub fn diff_trees(source_root: &Path, dest_root: &Path) -> Result<DiffReport, PlanError> {
    fs::read_dir(source_root).map_err(|source| PlanError::SourceUnreadable {
        path: source_root.to_path_buf(),
        source,
    })?;

    let source_files = collect_tree(source_root);
    let dest_files = if dest_root.exists() {
        fs::read_dir(dest_root).map_err(|source| PlanError::DestinationUnreadable {
            path: dest_root.to_path_buf(),
            source,
        })?;
        collect_tree(dest_root)
    } else {
        BTreeMap::new()
    };

    let mut report = DiffReport::default();

    for (path, src) in &source_files {
        match dest_files.get(path) {
            None => {
                report.source_only.insert(path.clone());
            }
            Some(dst) if dst != src => {
                report.changed.insert(path.clone());
            }
            Some(_) => {}
        }
    }

    for path in dest_files.keys() {
        if !source_files.contains_key(path) {
            report.dest_only.insert(path.clone());
        }
    }

    let source_total: u64 = source_files.values().map(|s| s.size).sum();
    let dest_total: u64 = dest_files.values().map(|s| s.size).sum();
    report.size_delta = source_total as i64 - dest_total as i64;

    info!(
        source = %source_root.display(),
        destination = %dest_root.display(),
        source_only = report.source_only.len(),
        dest_only = report.dest_only.len(),
        changed = report.changed.len(),
        size_delta = report.size_delta,
        "Tree comparison complete"
    );

    Ok(report)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileStamp {
    size: u64,
    mtime: FileTime,
}

fn collect_tree(root: &Path) -> BTreeMap<PathBuf, FileStamp> {
    walk_files(root)
        .map(|(relative, meta)| {
            let stamp = FileStamp {
                size: meta.len(),
                mtime: FileTime::from_last_modification_time(&meta),
            };
            (relative, stamp)
        })
        .collect()
}

/// Regular files under `root` as (relative path, metadata), in a stable order.
///
/// Symlinks and special files are not followed or returned.
fn walk_files(root: &Path) -> impl Iterator<Item = (PathBuf, Metadata)> + '_ {
    WalkDir::new(root)
        .follow_links(false)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_map(move |entry| {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    let path = e.path().map(|p| p.display().to_string()).unwrap_or_default();
                    warn!(path = %path, error = %e, "Skipping unreadable entry");
                    return None;
                }
            };

            if !entry.file_type().is_file() {
                return None;
            }

            let meta = match entry.metadata() {
                Ok(meta) => meta,
                Err(e) => {
                    warn!(path = %entry.path().display(), error = %e, "Failed to stat file, skipping");
                    return None;
                }
            };

            let relative = entry.path().strip_prefix(root).ok()?.to_path_buf();
            Some((relative, meta))
        })
}

/// Destination exists with the same size and an mtime not older than the source.
fn is_up_to_date(source: &Metadata, destination: &Path) -> bool {
    let Ok(dest) = fs::metadata(destination) else {
        return false;
    };

    if !dest.is_file() || dest.len() != source.len() {
        return false;
    }

    FileTime::from_last_modification_time(&dest) >= FileTime::from_last_modification_time(source)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write(path: &Path, content: &[u8]) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, content).unwrap();
    }

    fn set_mtime(path: &Path, secs: i64) {
        filetime::set_file_mtime(path, FileTime::from_unix_time(secs, 0)).unwrap();
    }

    #[test]
    fn test_full_plan_includes_every_file_rerooted() {
        let temp = tempdir().unwrap();
        let src = temp.path().join("DCIM");
        let dst = temp.path().join("backup/DCIM");

        write(&src.join("100CANON/IMG_0001.JPG"), b"one");
        write(&src.join("100CANON/IMG_0002.JPG"), b"two!");
        write(&src.join("index.dat"), b"idx");

        let set = plan_copy(&src, &dst, CopyMode::Full).unwrap();

        assert_eq!(set.len(), 3);
        for item in &set {
            let rel = item.source.strip_prefix(&src).unwrap();
            assert_eq!(item.destination, dst.join(rel));
        }
        assert_eq!(set.total_bytes(), 3 + 4 + 3);
    }

    #[test]
    fn test_full_plan_ignores_existing_destination() {
        let temp = tempdir().unwrap();
        let src = temp.path().join("src");
        let dst = temp.path().join("dst");
        write(&src.join("a.jpg"), b"same");
        write(&dst.join("a.jpg"), b"same");

        assert_eq!(plan_copy(&src, &dst, CopyMode::Full).unwrap().len(), 1);
    }

    #[test]
    fn test_incremental_skips_up_to_date_file() {
        let temp = tempdir().unwrap();
        let src = temp.path().join("src");
        let dst = temp.path().join("dst");
        write(&src.join("a.jpg"), b"same");
        write(&dst.join("a.jpg"), b"same");
        set_mtime(&src.join("a.jpg"), 1_600_000_000);
        set_mtime(&dst.join("a.jpg"), 1_600_000_000);

        let set = plan_copy(&src, &dst, CopyMode::Incremental).unwrap();
        assert!(set.is_empty());
    }

    #[test]
    fn test_folder_plan_reports_skipped_files() {
        let temp = tempdir().unwrap();
        let src = temp.path().join("src");
        let dst = temp.path().join("dst");
        write(&src.join("100CANON/a.jpg"), b"same");
        write(&dst.join("100CANON/a.jpg"), b"same");
        write(&src.join("100CANON/b.jpg"), b"new");
        set_mtime(&src.join("100CANON/a.jpg"), 1_600_000_000);
        set_mtime(&dst.join("100CANON/a.jpg"), 1_600_000_000);

        let plan = plan_folder(&src, &dst, CopyMode::Incremental).unwrap();
        assert_eq!(plan.set.len(), 1);
        assert_eq!(plan.up_to_date, vec![PathBuf::from("100CANON/a.jpg")]);

        let full = plan_folder(&src, &dst, CopyMode::Full).unwrap();
        assert_eq!(full.set.len(), 2);
        assert!(full.up_to_date.is_empty());
    }

    #[test]
    fn test_incremental_includes_older_destination_of_same_size() {
        let temp = tempdir().unwrap();
        let src = temp.path().join("src");
        let dst = temp.path().join("dst");
        write(&src.join("a.jpg"), b"same");
        write(&dst.join("a.jpg"), b"same");
        set_mtime(&src.join("a.jpg"), 1_600_000_100);
        set_mtime(&dst.join("a.jpg"), 1_600_000_000);

        let set = plan_copy(&src, &dst, CopyMode::Incremental).unwrap();
        assert_eq!(set.len(), 1);
        assert_eq!(set.items()[0].destination, dst.join("a.jpg"));
    }

    #[test]
    fn test_incremental_includes_size_mismatch_even_if_newer() {
        let temp = tempdir().unwrap();
        let src = temp.path().join("src");
        let dst = temp.path().join("dst");
        write(&src.join("a.jpg"), b"longer content");
        write(&dst.join("a.jpg"), b"short");
        set_mtime(&src.join("a.jpg"), 1_600_000_000);
        set_mtime(&dst.join("a.jpg"), 1_700_000_000);

        assert_eq!(plan_copy(&src, &dst, CopyMode::Incremental).unwrap().len(), 1);
    }

    #[test]
    fn test_incremental_skips_same_size_newer_destination() {
        // Different content, same size, newer destination: skipped by design
        let temp = tempdir().unwrap();
        let src = temp.path().join("src");
        let dst = temp.path().join("dst");
        write(&src.join("a.jpg"), b"AAAA");
        write(&dst.join("a.jpg"), b"BBBB");
        set_mtime(&src.join("a.jpg"), 1_600_000_000);
        set_mtime(&dst.join("a.jpg"), 1_600_000_500);

        assert!(plan_copy(&src, &dst, CopyMode::Incremental).unwrap().is_empty());
    }

    #[test]
    fn test_plan_fails_for_missing_source_root() {
        let temp = tempdir().unwrap();
        let result = plan_copy(&temp.path().join("gone"), temp.path(), CopyMode::Full);
        assert!(matches!(result, Err(PlanError::SourceUnreadable { .. })));
    }

    #[test]
    fn test_plan_does_not_create_directories() {
        let temp = tempdir().unwrap();
        let src = temp.path().join("src");
        let dst = temp.path().join("dst");
        write(&src.join("nested/deep/a.jpg"), b"x");

        plan_copy(&src, &dst, CopyMode::Incremental).unwrap();
        assert!(!dst.exists());
    }

    #[test]
    fn test_copy_mode_from_bool() {
        assert_eq!(CopyMode::from(true), CopyMode::Incremental);
        assert_eq!(CopyMode::from(false), CopyMode::Full);
    }

    #[test]
    fn test_diff_identical_tree() {
        let temp = tempdir().unwrap();
        write(&temp.path().join("a/1.jpg"), b"one");
        write(&temp.path().join("2.jpg"), b"two");

        let report = diff_trees(temp.path(), temp.path()).unwrap();
        assert!(report.is_identical());
    }

    #[test]
    fn test_diff_three_way() {
        let temp = tempdir().unwrap();
        let src = temp.path().join("src");
        let dst = temp.path().join("dst");

        write(&src.join("only_src.jpg"), b"12345");
        write(&dst.join("only_dst.jpg"), b"12");
        write(&src.join("same.jpg"), b"same");
        write(&dst.join("same.jpg"), b"same");
        set_mtime(&src.join("same.jpg"), 1_600_000_000);
        set_mtime(&dst.join("same.jpg"), 1_600_000_000);
        write(&src.join("sub/changed.jpg"), b"abc");
        write(&dst.join("sub/changed.jpg"), b"abc");
        set_mtime(&src.join("sub/changed.jpg"), 1_600_000_000);
        // Newer destination still counts as changed in an audit
        set_mtime(&dst.join("sub/changed.jpg"), 1_600_000_900);

        let report = diff_trees(&src, &dst).unwrap();

        assert_eq!(
            report.source_only.iter().cloned().collect::<Vec<_>>(),
            vec![PathBuf::from("only_src.jpg")]
        );
        assert_eq!(
            report.dest_only.iter().cloned().collect::<Vec<_>>(),
            vec![PathBuf::from("only_dst.jpg")]
        );
        assert_eq!(
            report.changed.iter().cloned().collect::<Vec<_>>(),
            vec![PathBuf::from("sub/changed.jpg")]
        );
        // (5 + 4 + 3) - (2 + 4 + 3)
        assert_eq!(report.size_delta, 3);
    }

    #[test]
    fn test_diff_missing_destination_is_empty_tree() {
        let temp = tempdir().unwrap();
        let src = temp.path().join("src");
        write(&src.join("a.jpg"), b"abcd");

        let report = diff_trees(&src, &temp.path().join("nowhere")).unwrap();
        assert_eq!(report.source_only.len(), 1);
        assert!(report.dest_only.is_empty());
        assert_eq!(report.size_delta, 4);
    }
}
