//! Per-file identity.
//!
//! A scan runs in one of two equality modes. In `name_size` mode two files
//! are the same iff their relative path and size match; in `sha256` mode
//! identity is the content digest. The mode is fixed per scan and recorded
//! in the folder store so later diff and deletion operations agree with the
//! scan that produced them.

use std::fmt::Write as _;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

/// Raw SHA-256 output.
pub type Digest = [u8; 32];

/// Hex-encode a digest for display and reports.
pub fn digest_hex(digest: &Digest) -> String {
    let mut out = String::with_capacity(64);
    for byte in digest {
        let _ = write!(out, "{byte:02x}");
    }
    out
}

/// How file identity is derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EqualityMode {
    /// `(relative_path, size)` is the identity; no content is read.
    #[default]
    NameSize,
    /// Content SHA-256 is the identity.
    Sha256,
}

/// How folder comparison keys are built from file identities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StructurePolicy {
    /// Keys keep the path relative to the compared folder.
    #[default]
    Relative,
    /// Path components are discarded; only `(basename, size)` or the digest
    /// remains.
    BagOfFiles,
}

/// Identity of one file beneath the scan root.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileFingerprint {
    /// NFC-normalized, `/`-separated path relative to the scan root.
    pub relative_path: String,
    pub size: u64,
    /// Modification time snapshot taken at stat time.
    pub mtime: SystemTime,
    /// Absent on filesystems without device/inode identity.
    pub device: Option<u64>,
    pub inode: Option<u64>,
    /// Present only in `sha256` mode.
    pub digest: Option<Digest>,
    /// Set when size or mtime changed mid-read and a single rehash settled.
    pub unstable: bool,
}
