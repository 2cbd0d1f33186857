use crate::core::models::{CopyFailure, CopyItem, CopyProgress, CopySet, TransferOutcome};
use crate::logging::ProgressThrottle;
use filetime::FileTime;
use std::fs::{self, File, Metadata};
use std::io::{self, BufReader, BufWriter, ErrorKind, Write};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn};
use uuid::Uuid;

/// Read/write buffer per copied file
const BUFFER_SIZE: usize = 128 * 1024;

/// Minimum time between progress log lines
const PROGRESS_LOG_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("a copy run is already in progress")]
    AlreadyRunning,
}

/// Sequential batch copier.
///
/// Copies a [`CopySet`] item by item:
/// - Parent directories are created on demand
/// - Content, permissions and modification time are preserved
/// - A failed item is recorded and the batch continues
/// - Cancellation is checked between items, never mid-file
///
/// Only one background run may be active per executor.
#[derive(Clone)]
pub struct CopyExecutor {
    /// fsync every destination file before moving on
    pub sync_files: bool,
    active: Arc<AtomicBool>,
}

impl Default for CopyExecutor {
    fn default() -> Self {
        Self {
            sync_files: true,
            active: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl CopyExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_running(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Run the copy set to completion on the current thread.
    ///
    /// `observer` is called once per attempted item, in order, including
    /// items that failed. An empty set reports a single `0 of 0` update.
    pub fn run(
        &self,
        set: &CopySet,
        cancel: &CancellationToken,
        observer: &mut dyn FnMut(CopyProgress),
    ) -> TransferOutcome {
        let span = info_span!("copy_run", run_id = %Uuid::now_v7(), items = set.len());
        let _enter = span.enter();

        let start_time = Instant::now();
        let total = set.len();
        let mut throttle = ProgressThrottle::new(PROGRESS_LOG_INTERVAL);

        info!(total_bytes = set.total_bytes(), "Starting copy run");

        let mut transferred = 0usize;
        let mut failures: Vec<CopyFailure> = Vec::new();
        let mut cancelled = false;

        for (index, item) in set.iter().enumerate() {
            if cancel.is_cancelled() {
                info!(done = index, total, "Copy run cancelled");
                cancelled = true;
                break;
            }

            debug!(
                source = %item.source.display(),
                destination = %item.destination.display(),
                size = item.size,
                "Copying file"
            );

            match copy_item(item, self.sync_files) {
                Ok(bytes) => {
                    transferred += 1;
                    debug!(file = %item.source.display(), bytes, "Copied file");
                }
                Err(e) => {
                    if e.device_removed {
                        warn!(file = %item.source.display(), "Source device may have been removed");
                    }
                    error!(
                        file = %item.source.display(),
                        destination = %item.destination.display(),
                        error = %e.message,
                        "Failed to copy file"
                    );
                    failures.push(CopyFailure {
                        path: item.source.clone(),
                        error: e.message,
                        device_removed: e.device_removed,
                    });
                }
            }

            let done = index + 1;
            if throttle.ready() || done == total {
                info!(done, total, failed = failures.len(), "Copy progress");
            }

            observer(CopyProgress {
                done,
                total,
                current: item.describe(),
            });
        }

        if total == 0 {
            observer(CopyProgress {
                done: 0,
                total: 0,
                current: "Nothing to copy".to_string(),
            });
        }

        let outcome = TransferOutcome::from_run(transferred, failures, start_time.elapsed(), cancelled);

        if outcome.success {
            info!(
                transferred,
                duration_ms = outcome.elapsed.as_millis() as u64,
                "Copy run complete"
            );
        } else {
            warn!(
                transferred,
                failed = outcome.failures.len(),
                duration_ms = outcome.elapsed.as_millis() as u64,
                "Copy run finished with failures"
            );
        }

        outcome
    }

    /// Run the copy set in the background, sending progress to `progress`.
    pub fn spawn(
        &self,
        set: CopySet,
        progress: mpsc::Sender<CopyProgress>,
    ) -> Result<CopyHandle, ExecutorError> {
        self.spawn_with_observer(set, move |update| {
            // Receiver may have gone away; the run still completes
            let _ = progress.blocking_send(update);
        })
    }

    /// Run the copy set in the background with a custom progress observer.
    ///
    /// Fails with [`ExecutorError::AlreadyRunning`] while another run started
    /// from this executor (or a clone of it) is still active.
    pub fn spawn_with_observer<F>(&self, set: CopySet, mut observer: F) -> Result<CopyHandle, ExecutorError>
    where
        F: FnMut(CopyProgress) + Send + 'static,
    {
        self.active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| ExecutorError::AlreadyRunning)?;

        let cancel = CancellationToken::new();
        let executor = self.clone();
        let token = cancel.clone();

        let handle = tokio::task::spawn_blocking(move || {
            let _guard = ActiveGuard(executor.active.clone());
            executor.run(&set, &token, &mut observer)
        });

        Ok(CopyHandle {
            cancel,
            handle,
            started: Instant::now(),
        })
    }
}

/// Clears the executor's active flag when the run ends, even by panic.
struct ActiveGuard(Arc<AtomicBool>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Handle to a background copy run.
pub struct CopyHandle {
    cancel: CancellationToken,
    handle: JoinHandle<TransferOutcome>,
    started: Instant,
}

impl CopyHandle {
    /// Ask the run to stop before the next item.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the run to exit and return its outcome.
    ///
    /// A run that panicked yields a failed outcome carrying the panic text.
    pub async fn wait(self) -> TransferOutcome {
        match self.handle.await {
            Ok(outcome) => outcome,
            Err(e) => {
                let reason = panic_message(e);
                error!(error = %reason, "Copy run aborted unexpectedly");
                TransferOutcome::fatal(reason, self.started.elapsed())
            }
        }
    }

    /// Cancel and wait for the run to exit.
    pub async fn stop(self) -> TransferOutcome {
        self.cancel();
        self.wait().await
    }
}

fn panic_message(err: tokio::task::JoinError) -> String {
    if !err.is_panic() {
        return err.to_string();
    }
    let payload = err.into_panic();
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "copy thread panicked".to_string()
    }
}

/// Where in the per-item sequence a copy failed.
#[derive(Debug, Clone, Copy)]
enum Stage {
    Prepare,
    Open,
    Create,
    Transfer,
    Sync,
}

impl Stage {
    fn describe(self) -> &'static str {
        match self {
            Stage::Prepare => "cannot create destination folder",
            Stage::Open => "cannot open source",
            Stage::Create => "cannot create destination",
            Stage::Transfer => "copy interrupted",
            Stage::Sync => "cannot flush destination to disk",
        }
    }
}

struct ItemError {
    message: String,
    device_removed: bool,
}

impl ItemError {
    fn at(stage: Stage) -> impl FnOnce(io::Error) -> Self {
        move |e| Self {
            message: format!("{}: {}", stage.describe(), e),
            device_removed: looks_like_removal(&e),
        }
    }
}

/// Copy one item and carry over permissions and timestamps.
///
/// Returns the number of bytes written.
fn copy_item(item: &CopyItem, sync_file: bool) -> Result<u64, ItemError> {
    if let Some(parent) = item.destination.parent() {
        fs::create_dir_all(parent).map_err(ItemError::at(Stage::Prepare))?;
    }

    let mut source = File::open(&item.source).map_err(ItemError::at(Stage::Open))?;
    let metadata = source.metadata().map_err(ItemError::at(Stage::Open))?;
    let mut dest = File::create(&item.destination).map_err(ItemError::at(Stage::Create))?;

    let copied = stream(&mut source, &mut dest).map_err(ItemError::at(Stage::Transfer))?;

    if sync_file {
        dest.sync_all().map_err(ItemError::at(Stage::Sync))?;
    }
    drop(dest);

    apply_source_metadata(&metadata, &item.destination);
    Ok(copied)
}

fn stream(source: &mut File, dest: &mut File) -> io::Result<u64> {
    let mut reader = BufReader::with_capacity(BUFFER_SIZE, source);
    let mut writer = BufWriter::with_capacity(BUFFER_SIZE, dest);
    let copied = io::copy(&mut reader, &mut writer)?;
    writer.flush()?;
    Ok(copied)
}

fn apply_source_metadata(metadata: &Metadata, dest: &Path) {
    if let Err(e) = fs::set_permissions(dest, metadata.permissions()) {
        debug!(dest = %dest.display(), error = %e, "Could not copy permissions");
    }

    // Incremental planning compares against this mtime
    let atime = FileTime::from_last_access_time(metadata);
    let mtime = FileTime::from_last_modification_time(metadata);
    if let Err(e) = filetime::set_file_times(dest, atime, mtime) {
        warn!(dest = %dest.display(), error = %e, "Could not copy timestamps");
    }
}

/// Errors that usually mean the card was pulled mid-copy.
fn looks_like_removal(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        ErrorKind::NotFound | ErrorKind::BrokenPipe | ErrorKind::NotConnected
    ) || error.raw_os_error().is_some_and(is_device_errno)
}

#[cfg(unix)]
fn is_device_errno(code: i32) -> bool {
    #[cfg(target_os = "linux")]
    if code == libc::ENOMEDIUM || code == libc::EMEDIUMTYPE {
        return true;
    }
    matches!(code, libc::EIO | libc::ENODEV | libc::ENXIO)
}

#[cfg(not(unix))]
fn is_device_errno(_code: i32) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::models::CopyItem;
    use std::path::PathBuf;
    use tempfile::tempdir;

    fn item(source: PathBuf, destination: PathBuf) -> CopyItem {
        let size = fs::metadata(&source).map(|m| m.len()).unwrap_or(0);
        CopyItem {
            source,
            destination,
            size,
        }
    }

    fn fixture(root: &Path, count: usize) -> Vec<CopyItem> {
        let src = root.join("src");
        let dst = root.join("dst");
        fs::create_dir_all(&src).unwrap();
        (0..count)
            .map(|i| {
                let name = format!("IMG_{:04}.JPG", i);
                fs::write(src.join(&name), format!("image {}", i)).unwrap();
                item(src.join(&name), dst.join("100CANON").join(&name))
            })
            .collect()
    }

    fn run_collecting(set: &CopySet, cancel: &CancellationToken) -> (TransferOutcome, Vec<CopyProgress>) {
        let executor = CopyExecutor::new();
        let mut updates = Vec::new();
        let outcome = executor.run(set, cancel, &mut |p| updates.push(p));
        (outcome, updates)
    }

    #[test]
    fn test_vanished_source_counts_as_removal() {
        let temp = tempdir().unwrap();
        let gone = item(temp.path().join("DCIM/IMG_0001.JPG"), temp.path().join("out/IMG_0001.JPG"));

        let err = copy_item(&gone, false).err().unwrap();
        assert!(err.device_removed);
        assert!(err.message.starts_with("cannot open source"));
    }

    #[test]
    fn test_blocked_destination_is_not_removal() {
        let temp = tempdir().unwrap();
        let source = temp.path().join("IMG_0001.JPG");
        fs::write(&source, b"jpeg").unwrap();
        let blocker = temp.path().join("backup");
        fs::write(&blocker, b"a file where the folder should be").unwrap();

        let err = copy_item(&item(source, blocker.join("DCIM/IMG_0001.JPG")), false)
            .err()
            .unwrap();
        assert!(!err.device_removed);
        assert!(err.message.starts_with("cannot create destination folder"));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_medium_errors_count_as_removal() {
        assert!(looks_like_removal(&io::Error::from_raw_os_error(libc::ENOMEDIUM)));
        assert!(looks_like_removal(&io::Error::from_raw_os_error(libc::EIO)));
        assert!(!looks_like_removal(&io::Error::from_raw_os_error(libc::ENOSPC)));
    }

    #[test]
    fn test_copy_item_preserves_content_and_mtime() {
        let temp = tempdir().unwrap();
        let source = temp.path().join("DCIM/100CANON/IMG_0001.CR3");
        fs::create_dir_all(source.parent().unwrap()).unwrap();
        let content = vec![7u8; 300 * 1024];
        fs::write(&source, &content).unwrap();
        let mtime = FileTime::from_unix_time(1_600_000_000, 0);
        filetime::set_file_mtime(&source, mtime).unwrap();

        let dest = temp.path().join("backup/DCIM/100CANON/IMG_0001.CR3");
        let copied = copy_item(&item(source, dest.clone()), true).ok();
        assert_eq!(copied, Some(content.len() as u64));

        assert_eq!(fs::read(&dest).unwrap(), content);
        let dest_meta = fs::metadata(&dest).unwrap();
        assert_eq!(FileTime::from_last_modification_time(&dest_meta), mtime);
    }

    #[test]
    fn test_run_creates_parent_directories() {
        let temp = tempdir().unwrap();
        let set = CopySet::from(fixture(temp.path(), 2));

        let (outcome, updates) = run_collecting(&set, &CancellationToken::new());

        assert!(outcome.success);
        assert_eq!(outcome.transferred, 2);
        assert_eq!(updates.len(), 2);
        assert!(temp.path().join("dst/100CANON/IMG_0001.JPG").exists());
    }

    #[test]
    fn test_run_continues_after_failed_item() {
        let temp = tempdir().unwrap();
        let mut items = fixture(temp.path(), 3);

        // A regular file where a directory is needed makes item 2 unwritable
        let blocker = temp.path().join("blocker");
        fs::write(&blocker, b"not a directory").unwrap();
        items[1].destination = blocker.join("IMG_0001.JPG");
        let failing_source = items[1].source.clone();

        let set = CopySet::from(items);
        let (outcome, updates) = run_collecting(&set, &CancellationToken::new());

        assert!(!outcome.success);
        assert!(!outcome.cancelled);
        assert_eq!(outcome.transferred, 2);
        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.failures[0].path, failing_source);

        let done: Vec<_> = updates.iter().map(|p| (p.done, p.total)).collect();
        assert_eq!(done, vec![(1, 3), (2, 3), (3, 3)]);

        assert!(temp.path().join("dst/100CANON/IMG_0000.JPG").exists());
        assert!(temp.path().join("dst/100CANON/IMG_0002.JPG").exists());
    }

    #[test]
    fn test_run_missing_source_is_recorded() {
        let temp = tempdir().unwrap();
        let set = CopySet::from(vec![CopyItem {
            source: temp.path().join("vanished.jpg"),
            destination: temp.path().join("out/vanished.jpg"),
            size: 10,
        }]);

        let (outcome, updates) = run_collecting(&set, &CancellationToken::new());

        assert!(!outcome.success);
        assert!(outcome.failures[0].device_removed);
        assert_eq!(updates.len(), 1);
    }

    #[test]
    fn test_cancel_after_first_item() {
        let temp = tempdir().unwrap();
        let set = CopySet::from(fixture(temp.path(), 5));
        let cancel = CancellationToken::new();

        let executor = CopyExecutor::new();
        let mut updates = Vec::new();
        let outcome = executor.run(&set, &cancel, &mut |p| {
            if p.done == 1 {
                cancel.cancel();
            }
            updates.push(p);
        });

        assert!(outcome.cancelled);
        assert!(outcome.success);
        assert_eq!(outcome.transferred, 1);
        assert_eq!(updates.len(), 1);
        assert!(!temp.path().join("dst/100CANON/IMG_0001.JPG").exists());
    }

    #[test]
    fn test_empty_set_reports_zero_progress() {
        let (outcome, updates) = run_collecting(&CopySet::new(), &CancellationToken::new());

        assert!(outcome.success);
        assert_eq!(outcome.transferred, 0);
        assert_eq!(updates.len(), 1);
        assert_eq!((updates[0].done, updates[0].total), (0, 0));
    }

    #[tokio::test]
    async fn test_spawn_rejects_concurrent_run() {
        let temp = tempdir().unwrap();
        let set = CopySet::from(fixture(temp.path(), 3));
        let executor = CopyExecutor::new();

        // Capacity 1 keeps the first run blocked on progress until drained
        let (tx, mut rx) = mpsc::channel(1);
        let handle = executor.spawn(set.clone(), tx).unwrap();

        let (tx2, _rx2) = mpsc::channel(1);
        assert!(matches!(
            executor.spawn(set.clone(), tx2),
            Err(ExecutorError::AlreadyRunning)
        ));

        let mut updates = Vec::new();
        while let Some(update) = rx.recv().await {
            updates.push(update);
        }
        let outcome = handle.wait().await;

        assert!(outcome.success);
        assert_eq!(updates.len(), 3);
        assert!(!executor.is_running());

        // A new run is accepted once the previous one has exited
        let (tx3, _rx3) = mpsc::channel(8);
        let outcome = executor.spawn(CopySet::new(), tx3).unwrap().wait().await;
        assert!(outcome.success);
    }

    #[tokio::test]
    async fn test_panicking_run_becomes_failed_outcome() {
        let temp = tempdir().unwrap();
        let set = CopySet::from(fixture(temp.path(), 2));
        let executor = CopyExecutor::new();

        let handle = executor
            .spawn_with_observer(set, |_| panic!("observer exploded"))
            .unwrap();
        let outcome = handle.wait().await;

        assert!(!outcome.success);
        assert!(outcome.message.contains("observer exploded"));
        assert!(!executor.is_running());
    }

    #[tokio::test]
    async fn test_stop_returns_partial_outcome() {
        let temp = tempdir().unwrap();
        let set = CopySet::from(fixture(temp.path(), 4));
        let executor = CopyExecutor::new();

        let (tx, mut rx) = mpsc::channel(1);
        let handle = executor.spawn(set, tx).unwrap();

        // First update proves one item is done; the run then blocks on the
        // second send until we read again, after cancellation is set.
        let first = rx.recv().await.unwrap();
        assert_eq!(first.done, 1);
        let token = handle.cancellation_token();
        token.cancel();

        let drain = tokio::spawn(async move {
            let mut rest = Vec::new();
            while let Some(update) = rx.recv().await {
                rest.push(update);
            }
            rest
        });

        let outcome = handle.stop().await;
        let rest = drain.await.unwrap();

        assert!(outcome.cancelled);
        assert!(outcome.transferred < 4);
        assert_eq!(outcome.transferred, 1 + rest.len());
    }
}
