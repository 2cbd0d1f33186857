pub mod executor;
pub mod models;
pub mod orchestrator;
pub mod planner;
pub mod presence;
pub mod volume;

pub use executor::{CopyExecutor, CopyHandle, ExecutorError};
pub use models::{
    CopyFailure, CopyItem, CopyProgress, CopySet, DiffReport, MarkerFolder, TransferOutcome,
    Volume, format_size,
};
pub use orchestrator::{FolderBackupReport, Orchestrator};
pub use planner::{CopyMode, FolderPlan, PlanError, diff_trees, plan_copy, plan_folder};
pub use presence::{PollResult, PresenceMonitor, PresenceTracker};
pub use volume::{EnumerationError, VolumeEnumerator, VolumeEvent, scan_marker_folders};
