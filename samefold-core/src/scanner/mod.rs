mod hasher;
mod progress;
mod walker;

pub use progress::{ScanWarning, WalkCounters, WarningKind, WarningSink};
pub use walker::{CancellationToken, WalkOptions, walk, worker_count};
