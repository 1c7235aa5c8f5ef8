pub mod aggregate;
pub mod cache;
pub mod diff;
pub mod error;
pub mod fingerprint;
pub mod folder;
pub mod group;
pub mod normalize;
pub mod planner;
pub mod report;
pub mod request;
pub mod scanner;
pub mod schedule;
pub mod size;
pub mod store;
pub mod tree;

pub use diff::{DiffEntry, FolderDiff};
pub use error::{Result, SamefoldError};
pub use fingerprint::{EqualityMode, FileFingerprint, StructurePolicy};
pub use folder::{FolderInfo, FolderSummary};
pub use planner::{ConfirmOutcome, DeletionPlan};
pub use report::{GroupInfo, GroupLabel, GroupMember, ScanReport};
pub use request::ScanRequest;
pub use scanner::{CancellationToken, ScanWarning, WarningKind};
pub use schedule::{
    Engine, PhaseMetrics, ProgressEvent, ScanPhase, ScanState, ScanStats, ScanStatus,
};
pub use size::{format_count, format_size};
pub use store::FolderStore;
