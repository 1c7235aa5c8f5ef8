//! Persistent fingerprint cache.
//!
//! Maps `(device, inode, size, mtime)` to a content digest so rescans can
//! skip re-hashing unchanged files. The cache is authoritative only when all
//! four key components match; any size or mtime change misses. It is shared
//! process-wide, survives across scans, and is never consulted in
//! `name_size` mode.
//!
//! File format:
//! [4B] Magic "SFCA"
//! [4B] Version (u32 LE)
//! [NB] Entries (postcard `Vec<(CacheKey, Digest)>`)
//! [4B] CRC32 checksum of all preceding bytes

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Result, SamefoldError};
use crate::fingerprint::Digest;

/// Current cache format version - increment when format changes
pub const CACHE_VERSION: u32 = 1;

/// Magic bytes identifying a samefold cache file
pub const CACHE_MAGIC: [u8; 4] = *b"SFCA";

/// Stat identity of a file at hash time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    pub device: u64,
    pub inode: u64,
    pub size: u64,
    pub mtime_secs: i64,
    pub mtime_nanos: u32,
}

impl CacheKey {
    pub fn new(device: u64, inode: u64, size: u64, mtime: SystemTime) -> Self {
        let (mtime_secs, mtime_nanos) = match mtime.duration_since(UNIX_EPOCH) {
            Ok(d) => (d.as_secs() as i64, d.subsec_nanos()),
            Err(e) => (-(e.duration().as_secs() as i64), e.duration().subsec_nanos()),
        };
        Self {
            device,
            inode,
            size,
            mtime_secs,
            mtime_nanos,
        }
    }
}

struct CacheInner {
    map: HashMap<CacheKey, Digest>,
    dirty: bool,
    hits: u64,
    misses: u64,
}

/// Process-wide digest cache with concurrent readers; writes serialize on
/// the inner lock.
pub struct FingerprintCache {
    path: PathBuf,
    inner: Mutex<CacheInner>,
}

impl FingerprintCache {
    /// Open the cache at `path`. A missing file starts empty; a corrupt file
    /// is discarded and re-hashing is forced, per the recovery policy.
    pub fn open(path: &Path) -> Self {
        let map = match load_entries(path) {
            Ok(map) => map,
            Err(SamefoldError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                HashMap::new()
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "fingerprint cache corrupt; resetting");
                let _ = fs::remove_file(path);
                HashMap::new()
            }
        };
        Self {
            path: path.to_path_buf(),
            inner: Mutex::new(CacheInner {
                map,
                dirty: false,
                hits: 0,
                misses: 0,
            }),
        }
    }

    pub fn lookup(&self, key: &CacheKey) -> Option<Digest> {
        let mut inner = self.inner.lock().ok()?;
        match inner.map.get(key).copied() {
            Some(digest) => {
                inner.hits += 1;
                Some(digest)
            }
            None => {
                inner.misses += 1;
                None
            }
        }
    }

    pub fn insert(&self, key: CacheKey, digest: Digest) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.map.insert(key, digest);
            inner.dirty = true;
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|i| i.map.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `(hits, misses)` since this cache was opened.
    pub fn stats(&self) -> (u64, u64) {
        self.inner.lock().map(|i| (i.hits, i.misses)).unwrap_or((0, 0))
    }

    /// Persist the cache if it changed since the last flush.
    pub fn flush(&self) -> Result<()> {
        let entries: Vec<(CacheKey, Digest)> = {
            let mut inner = self
                .inner
                .lock()
                .map_err(|_| SamefoldError::Cache("cache lock poisoned".to_string()))?;
            if !inner.dirty {
                return Ok(());
            }
            inner.dirty = false;
            inner.map.iter().map(|(k, v)| (*k, *v)).collect()
        };
        save_entries(&self.path, &entries)
    }
}

fn save_entries(path: &Path, entries: &[(CacheKey, Digest)]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let mut data = Vec::new();
    data.extend_from_slice(&CACHE_MAGIC);
    data.extend_from_slice(&CACHE_VERSION.to_le_bytes());

    let body = postcard::to_allocvec(entries)
        .map_err(|e| SamefoldError::Cache(format!("failed to serialize cache: {e}")))?;
    data.extend_from_slice(&body);

    let checksum = crc32fast::hash(&data);
    data.extend_from_slice(&checksum.to_le_bytes());

    // Write atomically by writing to temp file then renaming
    let temp_path = path.with_extension("tmp");
    let mut file = File::create(&temp_path)?;
    file.write_all(&data)?;
    file.sync_all()?;
    drop(file);
    fs::rename(&temp_path, path)?;

    Ok(())
}

fn load_entries(path: &Path) -> Result<HashMap<CacheKey, Digest>> {
    let mut file = File::open(path)?;
    let mut data = Vec::new();
    file.read_to_end(&mut data)?;

    // magic(4) + version(4) + checksum(4)
    if data.len() < 12 {
        return Err(SamefoldError::Cache("cache file too small".to_string()));
    }

    let checksum_offset = data.len() - 4;
    let stored = u32::from_le_bytes(data[checksum_offset..].try_into().unwrap());
    if stored != crc32fast::hash(&data[..checksum_offset]) {
        return Err(SamefoldError::Cache("cache checksum mismatch".to_string()));
    }

    if data[..4] != CACHE_MAGIC {
        return Err(SamefoldError::Cache("invalid cache magic".to_string()));
    }
    let version = u32::from_le_bytes(data[4..8].try_into().unwrap());
    if version != CACHE_VERSION {
        return Err(SamefoldError::Cache(format!(
            "cache version mismatch: expected {CACHE_VERSION}, got {version}"
        )));
    }

    let entries: Vec<(CacheKey, Digest)> = postcard::from_bytes(&data[8..checksum_offset])
        .map_err(|e| SamefoldError::Cache(format!("failed to deserialize cache: {e}")))?;
    Ok(entries.into_iter().collect())
}
