//! Removable volume presence tracking.
//!
//! [`PresenceTracker`] diffs successive enumerations into arrival and departure
//! sets. [`PresenceMonitor`] runs a tracker on a fixed interval in a background
//! task and forwards the results as [`VolumeEvent`]s.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::models::Volume;
use super::volume::{VolumeEnumerator, VolumeEvent, scan_marker_folders};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Result of a single poll.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PollResult {
    pub arrived: Vec<Volume>,
    pub departed: Vec<PathBuf>,
}

impl PollResult {
    pub fn is_empty(&self) -> bool {
        self.arrived.is_empty() && self.departed.is_empty()
    }
}

/// Tracks which volume paths are currently known across polls.
pub struct PresenceTracker {
    enumerator: Arc<dyn VolumeEnumerator>,
    known: BTreeSet<PathBuf>,
}

impl PresenceTracker {
    pub fn new(enumerator: Arc<dyn VolumeEnumerator>) -> Self {
        Self {
            enumerator,
            known: BTreeSet::new(),
        }
    }

    /// Enumerate volumes and report what appeared or vanished since the last call.
    ///
    /// A failed enumeration reports nothing and leaves the known set untouched.
    pub fn poll(&mut self) -> PollResult {
        let volumes = match self.enumerator.list_volumes() {
            Ok(volumes) => volumes,
            Err(e) => {
                warn!(error = %e, "Volume enumeration failed, skipping this tick");
                return PollResult::default();
            }
        };

        let mut current = BTreeSet::new();
        let mut arrived = Vec::new();

        for volume in volumes {
            if !current.insert(volume.path.clone()) {
                continue;
            }
            if self.known.insert(volume.path.clone()) {
                info!(path = %volume.path.display(), label = %volume.label, "Volume arrived");
                arrived.push(volume);
            }
        }

        let departed: Vec<PathBuf> = self.known.difference(&current).cloned().collect();
        for path in &departed {
            self.known.remove(path);
            info!(path = %path.display(), "Volume departed");
        }

        PollResult { arrived, departed }
    }

    pub fn known(&self) -> impl Iterator<Item = &PathBuf> {
        self.known.iter()
    }

    pub fn reset(&mut self) {
        self.known.clear();
    }
}

struct RunningLoop {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Background poll loop with an Idle/Running lifecycle.
pub struct PresenceMonitor {
    enumerator: Arc<dyn VolumeEnumerator>,
    marker_folders: Arc<[String]>,
    interval: Duration,
    running: Mutex<Option<RunningLoop>>,
}

impl PresenceMonitor {
    pub fn new(
        enumerator: Arc<dyn VolumeEnumerator>,
        marker_folders: Vec<String>,
        interval: Duration,
    ) -> Self {
        Self {
            enumerator,
            marker_folders: marker_folders.into(),
            interval,
            running: Mutex::new(None),
        }
    }

    /// Start polling and send events to `event_sender`.
    ///
    /// Returns false without doing anything if the loop is already running.
    /// Must be called from within a tokio runtime.
    pub fn start(&self, event_sender: mpsc::Sender<VolumeEvent>) -> bool {
        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(current) = running.as_ref() {
            if !current.handle.is_finished() {
                debug!("Presence monitor already running");
                return false;
            }
        }

        let cancel = CancellationToken::new();
        let tracker = Arc::new(Mutex::new(PresenceTracker::new(self.enumerator.clone())));
        let handle = tokio::spawn(poll_loop(
            tracker,
            self.marker_folders.clone(),
            self.interval,
            event_sender,
            cancel.clone(),
        ));

        info!(interval_ms = self.interval.as_millis() as u64, "Presence monitor started");
        *running = Some(RunningLoop { cancel, handle });
        true
    }

    /// Stop polling and wait for the loop to exit. No-op when idle.
    pub async fn stop(&self) {
        let current = self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        let Some(RunningLoop { cancel, handle }) = current else {
            return;
        };

        cancel.cancel();
        if let Err(e) = handle.await {
            error!(error = %e, "Presence monitor loop ended abnormally");
        }
        info!("Presence monitor stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|r| !r.handle.is_finished())
    }
}

async fn poll_loop(
    tracker: Arc<Mutex<PresenceTracker>>,
    marker_folders: Arc<[String]>,
    interval: Duration,
    tx: mpsc::Sender<VolumeEvent>,
    cancel: CancellationToken,
) {
    loop {
        let tick_tracker = tracker.clone();
        let tick_markers = marker_folders.clone();

        let tick = tokio::task::spawn_blocking(move || {
            let result = tick_tracker
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .poll();

            let mut events = Vec::with_capacity(result.arrived.len() + result.departed.len());
            for volume in result.arrived {
                let marker_folders = scan_marker_folders(&volume.path, &tick_markers);
                events.push(VolumeEvent::Arrived {
                    volume,
                    marker_folders,
                });
            }
            events.extend(result.departed.into_iter().map(VolumeEvent::Departed));
            events
        })
        .await;

        let events = match tick {
            Ok(events) => events,
            Err(e) => {
                error!(error = %e, "Poll tick failed");
                Vec::new()
            }
        };

        for event in events {
            tokio::select! {
                _ = cancel.cancelled() => return,
                sent = tx.send(event) => {
                    if sent.is_err() {
                        debug!("Event receiver dropped, ending poll loop");
                        return;
                    }
                }
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(interval) => {}
        }
    }
}
