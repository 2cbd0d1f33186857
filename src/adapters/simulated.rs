use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::core::models::Volume;
use crate::core::volume::{EnumerationError, VolumeEnumerator};

#[derive(Default)]
struct SimulatedState {
    volumes: Mutex<Vec<Volume>>,
    failing: AtomicBool,
}

impl SimulatedState {
    fn volumes(&self) -> MutexGuard<'_, Vec<Volume>> {
        // A panicked writer leaves a valid Vec behind
        self.volumes.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Handle for attaching and detaching fake volumes.
#[derive(Clone)]
pub struct Simulator {
    state: Arc<SimulatedState>,
}

impl Simulator {
    /// Attach a volume rooted at `path`. Re-adding a known path replaces its label.
    pub fn add_volume(&self, path: impl Into<PathBuf>, label: &str) {
        let path = path.into();
        let mut volumes = self.state.volumes();
        match volumes.iter_mut().find(|v| v.path == path) {
            Some(existing) => existing.label = label.to_string(),
            None => volumes.push(Volume::new(path, label)),
        }
    }

    pub fn remove_volume(&self, path: &Path) {
        self.state.volumes().retain(|v| v.path != path);
    }

    /// Make subsequent enumerations fail until cleared.
    pub fn set_failing(&self, failing: bool) {
        self.state.failing.store(failing, Ordering::SeqCst);
    }
}

/// In-memory enumerator driven by a [`Simulator`].
pub struct SimulatedEnumerator {
    state: Arc<SimulatedState>,
}

impl SimulatedEnumerator {
    pub fn new() -> (Self, Simulator) {
        let state = Arc::new(SimulatedState::default());
        (
            Self {
                state: state.clone(),
            },
            Simulator { state },
        )
    }
}

impl VolumeEnumerator for SimulatedEnumerator {
    fn list_volumes(&self) -> Result<Vec<Volume>, EnumerationError> {
        if self.state.failing.load(Ordering::SeqCst) {
            return Err(EnumerationError::Other(
                "simulated enumeration failure".to_string(),
            ));
        }
        Ok(self.state.volumes().clone())
    }
}
