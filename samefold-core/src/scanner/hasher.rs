//! Content hashing workers for `sha256` scans.
//!
//! Files are read in 4 MiB chunks. A file whose size or mtime changed
//! between the pre-read stat and the post-read stat is rehashed once; if the
//! drift persists the file is skipped, its parent folder is flagged
//! unstable, and a warning is recorded.

use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::SystemTime;

use crossbeam_channel::{Receiver, Sender};
use sha2::{Digest as _, Sha256};

use super::progress::{WarningKind, WarningSink};
use super::walker::CancellationToken;
use crate::cache::{CacheKey, FingerprintCache};
use crate::fingerprint::{Digest, FileFingerprint};
use crate::tree::FolderId;

const HASH_CHUNK: usize = 4 * 1024 * 1024;

#[derive(Debug)]
pub(crate) struct HashJob {
    pub folder: FolderId,
    pub path: PathBuf,
    pub relative_path: String,
    pub size: u64,
    pub mtime: SystemTime,
    pub device: Option<u64>,
    pub inode: Option<u64>,
}

#[derive(Debug)]
pub(crate) struct HashDone {
    pub folder: FolderId,
    pub fingerprint: Option<FileFingerprint>,
    /// Drift persisted; the owning folder must be flagged unstable.
    pub folder_unstable: bool,
}

pub(crate) fn spawn_hash_pool(
    workers: usize,
    jobs: Receiver<HashJob>,
    done: Sender<HashDone>,
    cache: Arc<FingerprintCache>,
    warnings: Arc<WarningSink>,
    cancel: CancellationToken,
) -> Vec<JoinHandle<()>> {
    (0..workers)
        .map(|_| {
            let jobs = jobs.clone();
            let done = done.clone();
            let cache = Arc::clone(&cache);
            let warnings = Arc::clone(&warnings);
            let cancel = cancel.clone();
            std::thread::spawn(move || {
                for job in jobs.iter() {
                    let outcome = if cancel.is_cancelled() {
                        HashDone {
                            folder: job.folder,
                            fingerprint: None,
                            folder_unstable: false,
                        }
                    } else {
                        fingerprint_job(job, &cache, &warnings)
                    };
                    if done.send(outcome).is_err() {
                        break;
                    }
                }
            })
        })
        .collect()
}

fn fingerprint_job(job: HashJob, cache: &FingerprintCache, warnings: &WarningSink) -> HashDone {
    let key = match (job.device, job.inode) {
        (Some(device), Some(inode)) => Some(CacheKey::new(device, inode, job.size, job.mtime)),
        _ => None,
    };

    // Cache is authoritative only on a full key match; nothing is read, so
    // drift cannot occur on this path.
    if let Some(key) = &key
        && let Some(digest) = cache.lookup(key)
    {
        return HashDone {
            folder: job.folder,
            fingerprint: Some(fingerprint(&job, job.size, job.mtime, digest, false)),
            folder_unstable: false,
        };
    }

    let first = match hash_attempt(&job.path, job.size, job.mtime) {
        Ok(attempt) => attempt,
        Err(e) => return skipped(&job, warnings, e),
    };
    let (digest, size, mtime, drifted) = match first {
        Attempt::Stable { digest } => (digest, job.size, job.mtime, false),
        Attempt::Drifted { size, mtime } => {
            match hash_attempt(&job.path, size, mtime) {
                Ok(Attempt::Stable { digest }) => (digest, size, mtime, true),
                Ok(Attempt::Drifted { .. }) => {
                    warnings.push(
                        WarningKind::Unstable,
                        job.relative_path.clone(),
                        "file kept changing while being hashed",
                    );
                    return HashDone {
                        folder: job.folder,
                        fingerprint: None,
                        folder_unstable: true,
                    };
                }
                Err(e) => return skipped(&job, warnings, e),
            }
        }
    };

    if let (Some(device), Some(inode)) = (job.device, job.inode) {
        cache.insert(CacheKey::new(device, inode, size, mtime), digest);
    }

    HashDone {
        folder: job.folder,
        fingerprint: Some(fingerprint(&job, size, mtime, digest, drifted)),
        folder_unstable: false,
    }
}

enum Attempt {
    Stable { digest: Digest },
    Drifted { size: u64, mtime: SystemTime },
}

fn hash_attempt(path: &Path, size: u64, mtime: SystemTime) -> std::io::Result<Attempt> {
    let digest = hash_file(path)?;
    let metadata = fs::metadata(path)?;
    let mtime_after = metadata.modified()?;
    if metadata.len() == size && mtime_after == mtime {
        Ok(Attempt::Stable { digest })
    } else {
        Ok(Attempt::Drifted {
            size: metadata.len(),
            mtime: mtime_after,
        })
    }
}

/// SHA-256 of a file's contents, read in 4 MiB chunks.
pub(crate) fn hash_file(path: &Path) -> std::io::Result<Digest> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; HASH_CHUNK];

    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }

    Ok(hasher.finalize().into())
}

fn fingerprint(
    job: &HashJob,
    size: u64,
    mtime: SystemTime,
    digest: Digest,
    unstable: bool,
) -> FileFingerprint {
    FileFingerprint {
        relative_path: job.relative_path.clone(),
        size,
        mtime,
        device: job.device,
        inode: job.inode,
        digest: Some(digest),
        unstable,
    }
}

fn skipped(job: &HashJob, warnings: &WarningSink, error: std::io::Error) -> HashDone {
    let kind = if error.kind() == std::io::ErrorKind::PermissionDenied {
        WarningKind::Permission
    } else {
        WarningKind::IoError
    };
    warnings.push(kind, job.relative_path.clone(), error.to_string());
    HashDone {
        folder: job.folder,
        fingerprint: None,
        folder_unstable: false,
    }
}
