use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::context::AppContext;
use crate::core::models::{MarkerFolder, TransferOutcome, Volume, format_size};
use crate::core::planner::{FolderPlan, plan_folder};
use crate::core::presence::PresenceMonitor;
use crate::core::volume::{VolumeEnumerator, VolumeEvent};
use crate::store::FolderConfigStore;

/// What happened to one marker folder of an arrived volume.
#[derive(Debug)]
pub struct FolderBackupReport {
    pub folder: String,
    /// `None` when the folder's strategy disables backups
    pub outcome: Option<TransferOutcome>,
}

/// Glue between presence events, planning and the copy executor.
///
/// Folder backups run one at a time, which also keeps two runs from writing
/// into the same destination tree. Cancelling the shutdown token stops the
/// copy in progress after its current file and skips the remaining folders.
pub struct Orchestrator {
    ctx: AppContext,
    shutdown: CancellationToken,
}

impl Orchestrator {
    pub fn new(ctx: AppContext) -> Self {
        Self::with_shutdown(ctx, CancellationToken::new())
    }

    pub fn with_shutdown(ctx: AppContext, shutdown: CancellationToken) -> Self {
        Self { ctx, shutdown }
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Watch for volumes until shutdown, then stop the monitor.
    pub async fn run(&self, enumerator: Arc<dyn VolumeEnumerator>) -> Result<()> {
        info!(
            backup_directory = %self.ctx.config.backup_directory.display(),
            "CamSync watcher starting"
        );

        let (tx, mut rx) = mpsc::channel(32);
        let monitor = PresenceMonitor::new(
            enumerator,
            self.ctx.config.marker_folders.clone(),
            self.ctx.config.poll_interval(),
        );

        monitor.start(tx);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                event = rx.recv() => match event {
                    Some(event) => {
                        self.handle_event(event).await;
                    }
                    None => break,
                },
            }
        }

        monitor.stop().await;
        info!("CamSync watcher stopped");
        Ok(())
    }

    pub async fn handle_event(&self, event: VolumeEvent) -> Vec<FolderBackupReport> {
        match event {
            VolumeEvent::Arrived {
                volume,
                marker_folders,
            } => self.handle_volume_arrived(volume, marker_folders).await,
            VolumeEvent::Departed(path) => {
                info!(path = %path.display(), "Volume removed");
                Vec::new()
            }
        }
    }

    async fn handle_volume_arrived(
        &self,
        volume: Volume,
        marker_folders: Vec<MarkerFolder>,
    ) -> Vec<FolderBackupReport> {
        if marker_folders.is_empty() {
            info!(path = %volume.path.display(), label = %volume.label, "No camera folders on volume");
            return Vec::new();
        }

        info!(
            path = %volume.path.display(),
            label = %volume.label,
            folders = marker_folders.len(),
            "Camera volume detected"
        );

        let mut reports = Vec::with_capacity(marker_folders.len());
        for folder in marker_folders {
            if self.shutdown.is_cancelled() {
                info!(folder = %folder.name, "Shutting down, folder not backed up");
                break;
            }

            info!(
                folder = %folder.name,
                file_count = folder.file_count,
                size = %format_size(folder.total_bytes),
                "Processing camera folder"
            );

            match self.backup_folder(&volume, &folder).await {
                Ok(outcome) => {
                    if let Some(outcome) = &outcome {
                        info!(folder = %folder.name, success = outcome.success, "{}", outcome.message);
                    }
                    reports.push(FolderBackupReport {
                        folder: folder.name,
                        outcome,
                    });
                }
                Err(e) => {
                    error!(folder = %folder.name, error = %format!("{:#}", e), "Folder backup failed");
                    reports.push(FolderBackupReport {
                        outcome: Some(TransferOutcome::fatal(format!("{:#}", e), Default::default())),
                        folder: folder.name,
                    });
                }
            }
        }

        reports
    }

    /// Plan and copy one marker folder into `<backup_directory>/<folder name>`.
    pub async fn backup_folder(
        &self,
        volume: &Volume,
        folder: &MarkerFolder,
    ) -> Result<Option<TransferOutcome>> {
        let store = self.ctx.store.clone();
        let device = volume.path.clone();
        let folder_name = folder.name.clone();
        let source = folder.path.clone();
        let backup_root = self.ctx.config.backup_directory.clone();
        let destination = backup_root.join(&folder.name);

        let planned = tokio::task::spawn_blocking(move || -> Result<_> {
            let config = match store.get_or_create(&device, &folder_name) {
                Ok(config) => config,
                Err(e) => {
                    warn!(error = %e, "Folder config unavailable, using defaults");
                    crate::store::FolderConfig::for_folder(&device, &folder_name)
                }
            };

            let Some(mode) = config.backup_strategy.copy_mode() else {
                return Ok(None);
            };

            std::fs::create_dir_all(&backup_root).with_context(|| {
                format!("Failed to create backup directory {}", backup_root.display())
            })?;

            let plan = plan_folder(&source, &destination, mode)?;
            Ok(Some((config, plan)))
        })
        .await
        .context("Planning task failed")??;

        let Some((config, plan)) = planned else {
            info!(folder = %folder.name, "Backup disabled for folder, skipping");
            return Ok(None);
        };
        let FolderPlan { set, up_to_date } = plan;

        if config.preview_before_copy {
            info!(
                folder = %folder.name,
                files = set.len(),
                up_to_date = up_to_date.len(),
                size = %format_size(set.total_bytes()),
                "Files to copy"
            );
            for item in set.iter() {
                debug!(source = %item.source.display(), size = item.size, "Planned");
            }
        }

        let planned: Vec<(PathBuf, String)> = set
            .iter()
            .map(|item| (item.source.clone(), relative_name(&folder.path, &item.source)))
            .collect();
        let current: Vec<String> = up_to_date
            .iter()
            .map(|path| path.to_string_lossy().into_owned())
            .collect();

        let (tx, mut rx) = mpsc::channel(64);
        let handle = self.ctx.executor.spawn(set, tx)?;

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled(), if !handle.cancellation_token().is_cancelled() => {
                    info!(folder = %folder.name, "Shutdown requested, stopping copy");
                    handle.cancel();
                }
                progress = rx.recv() => match progress {
                    Some(progress) => {
                        debug!(done = progress.done, total = progress.total, "{}", progress.current);
                    }
                    None => break,
                },
            }
        }
        let outcome = handle.wait().await;

        self.record_outcome(volume, folder, &outcome, planned, current)
            .await;
        Ok(Some(outcome))
    }

    async fn record_outcome(
        &self,
        volume: &Volume,
        folder: &MarkerFolder,
        outcome: &TransferOutcome,
        planned: Vec<(PathBuf, String)>,
        up_to_date: Vec<String>,
    ) {
        let store: Arc<dyn FolderConfigStore> = self.ctx.store.clone();
        let device = volume.path.clone();
        let folder_name = folder.name.clone();
        let failed: Vec<PathBuf> = outcome.failed_paths().map(Path::to_path_buf).collect();
        let attempted = outcome.transferred + outcome.failures.len();
        let success = outcome.success && !outcome.cancelled;

        let result = tokio::task::spawn_blocking(move || {
            // Files already current at the destination count as saved
            let mut saved = up_to_date;
            let mut unsaved = Vec::new();
            for (index, (source, name)) in planned.into_iter().enumerate() {
                if index < attempted && !failed.contains(&source) {
                    saved.push(name);
                } else {
                    unsaved.push(name);
                }
            }

            saved.sort();
            unsaved.sort();
            store.update_folder_file_info(&device, &folder_name, saved, unsaved)?;
            if success {
                store.update_last_backup_time(&device, &folder_name)?;
            }
            Ok::<_, crate::store::StoreError>(())
        })
        .await;

        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(folder = %folder.name, error = %e, "Failed to record backup result"),
            Err(e) => warn!(folder = %folder.name, error = %e, "Recording task failed"),
        }
    }
}

fn relative_name(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .to_string_lossy()
        .into_owned()
}
