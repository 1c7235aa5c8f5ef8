use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SamefoldError {
    #[error("Root path does not exist: {0}")]
    RootNotFound(PathBuf),

    #[error("Root path is not a directory: {0}")]
    RootNotDirectory(PathBuf),

    #[error("Path resolves outside the scan root: {0}")]
    RootEscape(PathBuf),

    #[error("Invalid scan request: {0}")]
    InvalidRequest(String),

    #[error("Unknown scan: {0}")]
    UnknownScan(String),

    #[error("Scan {0} has not completed")]
    ScanNotCompleted(String),

    #[error("Folder is not part of the scan index: {0}")]
    UnknownFolder(String),

    #[error("Fingerprint cache error: {0}")]
    Cache(String),

    #[error("Folder store error: {0}")]
    Store(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Scan was cancelled")]
    Cancelled,

    #[error("Deletion was not enabled for scan {0}")]
    DeletionDisabled(String),

    #[error("Unknown deletion plan: {0}")]
    UnknownPlan(String),

    #[error("Confirmation token does not match")]
    TokenInvalid,

    #[error("Confirmation token has expired")]
    TokenExpired,

    #[error("Canonical member of a group cannot be planned for deletion: {0}")]
    CannotPlanCanonical(String),

    #[error("File drift detected under {0}; nothing was moved")]
    DriftDetected(String),
}

pub type Result<T> = std::result::Result<T, SamefoldError>;
