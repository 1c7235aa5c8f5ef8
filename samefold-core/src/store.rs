//! Per-scan folder index with spill-to-disk semantics.
//!
//! The aggregator streams `FolderInfo` records into a writer as folders
//! close; the finished file supports random access by relative path, which
//! the grouper, diff projector and deletion planner all rely on after the
//! scan completes. Decoded records are kept in a small LRU so hot folders
//! stay in RAM without holding the whole index.
//!
//! File format:
//! [4B] Magic "SFIX"
//! [4B] Version (u32 LE)
//! [4B] Meta length (u32 LE)
//! [NB] Meta (postcard)
//! Per record: [NB] FolderInfo (postcard), [4B] CRC32 of the record bytes
//! [NB] Index (postcard `Vec<IndexRow>`)
//! [4B] Index length (u32 LE)
//! [4B] CRC32 of the index bytes

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use lru::LruCache;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SamefoldError};
use crate::fingerprint::{EqualityMode, StructurePolicy};
use crate::folder::{FolderInfo, FolderSummary};

/// Current store format version - increment when format changes
pub const STORE_VERSION: u32 = 1;

/// Magic bytes identifying a samefold folder index
pub const STORE_MAGIC: [u8; 4] = *b"SFIX";

const RECORD_CACHE_CAP: usize = 512;

/// Scan parameters the index was built under. Diff and deletion operations
/// read these back so they key files exactly the way the scan did.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreMeta {
    pub scan_id: String,
    pub root_path: PathBuf,
    pub file_equality: EqualityMode,
    pub structure_policy: StructurePolicy,
    pub force_case_insensitive: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IndexRow {
    summary: FolderSummary,
    offset: u64,
    len: u32,
}

fn store_err(context: &str, e: impl std::fmt::Display) -> SamefoldError {
    SamefoldError::Store(format!("{context}: {e}"))
}

/// Streaming writer; records land on disk as folders close.
pub struct FolderStoreWriter {
    final_path: PathBuf,
    temp_path: PathBuf,
    file: BufWriter<File>,
    offset: u64,
    rows: Vec<IndexRow>,
}

impl FolderStoreWriter {
    pub fn create(path: &Path, meta: &StoreMeta) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let temp_path = path.with_extension("tmp");
        let mut file = BufWriter::new(File::create(&temp_path)?);

        let meta_bytes =
            postcard::to_allocvec(meta).map_err(|e| store_err("failed to serialize meta", e))?;
        file.write_all(&STORE_MAGIC)?;
        file.write_all(&STORE_VERSION.to_le_bytes())?;
        file.write_all(&(meta_bytes.len() as u32).to_le_bytes())?;
        file.write_all(&meta_bytes)?;

        Ok(Self {
            final_path: path.to_path_buf(),
            temp_path,
            offset: 12 + meta_bytes.len() as u64,
            file,
            rows: Vec::new(),
        })
    }

    pub fn insert(&mut self, info: &FolderInfo) -> Result<()> {
        let bytes =
            postcard::to_allocvec(info).map_err(|e| store_err("failed to serialize folder", e))?;
        let checksum = crc32fast::hash(&bytes);
        self.file.write_all(&bytes)?;
        self.file.write_all(&checksum.to_le_bytes())?;

        self.rows.push(IndexRow {
            summary: FolderSummary {
                relative_path: info.relative_path.clone(),
                total_bytes: info.total_bytes,
                file_count: info.file_count,
                unstable: info.unstable,
            },
            offset: self.offset,
            len: bytes.len() as u32,
        });
        self.offset += bytes.len() as u64 + 4;
        Ok(())
    }

    /// Seal the file (atomically, via rename) and reopen it for reading.
    pub fn finish(mut self) -> Result<FolderStore> {
        let index_bytes = postcard::to_allocvec(&self.rows)
            .map_err(|e| store_err("failed to serialize index", e))?;
        let checksum = crc32fast::hash(&index_bytes);
        self.file.write_all(&index_bytes)?;
        self.file.write_all(&(index_bytes.len() as u32).to_le_bytes())?;
        self.file.write_all(&checksum.to_le_bytes())?;
        self.file.flush()?;
        self.file.get_ref().sync_all()?;
        drop(self.file);

        fs::rename(&self.temp_path, &self.final_path)?;
        FolderStore::open(&self.final_path)
    }
}

/// Read side: single-writer during the scan, multi-reader afterwards.
pub struct FolderStore {
    path: PathBuf,
    meta: StoreMeta,
    summaries: Vec<FolderSummary>,
    offsets: Vec<(u64, u32)>,
    by_path: HashMap<String, usize>,
    file: Mutex<File>,
    records: Mutex<LruCache<usize, Arc<FolderInfo>>>,
}

impl FolderStore {
    pub fn open(path: &Path) -> Result<Self> {
        let mut file = File::open(path)?;

        let mut header = [0u8; 12];
        file.read_exact(&mut header)
            .map_err(|e| store_err("store header truncated", e))?;
        if header[..4] != STORE_MAGIC {
            return Err(SamefoldError::Store("invalid store magic".to_string()));
        }
        let version = u32::from_le_bytes(header[4..8].try_into().unwrap());
        if version != STORE_VERSION {
            return Err(SamefoldError::Store(format!(
                "store version mismatch: expected {STORE_VERSION}, got {version}"
            )));
        }
        let meta_len = u32::from_le_bytes(header[8..12].try_into().unwrap()) as usize;
        let mut meta_bytes = vec![0u8; meta_len];
        file.read_exact(&mut meta_bytes)
            .map_err(|e| store_err("store meta truncated", e))?;
        let meta: StoreMeta = postcard::from_bytes(&meta_bytes)
            .map_err(|e| store_err("failed to deserialize meta", e))?;

        // Index sits at the tail: [index][len u32][crc u32].
        file.seek(SeekFrom::End(-8))?;
        let mut tail = [0u8; 8];
        file.read_exact(&mut tail)?;
        let index_len = u32::from_le_bytes(tail[..4].try_into().unwrap()) as u64;
        let stored_crc = u32::from_le_bytes(tail[4..].try_into().unwrap());

        file.seek(SeekFrom::End(-8 - index_len as i64))?;
        let mut index_bytes = vec![0u8; index_len as usize];
        file.read_exact(&mut index_bytes)?;
        if crc32fast::hash(&index_bytes) != stored_crc {
            return Err(SamefoldError::Store("index checksum mismatch".to_string()));
        }
        let rows: Vec<IndexRow> = postcard::from_bytes(&index_bytes)
            .map_err(|e| store_err("failed to deserialize index", e))?;

        let mut summaries = Vec::with_capacity(rows.len());
        let mut offsets = Vec::with_capacity(rows.len());
        let mut by_path = HashMap::with_capacity(rows.len());
        for (i, row) in rows.into_iter().enumerate() {
            by_path.insert(row.summary.relative_path.clone(), i);
            offsets.push((row.offset, row.len));
            summaries.push(row.summary);
        }

        Ok(Self {
            path: path.to_path_buf(),
            meta,
            summaries,
            offsets,
            by_path,
            file: Mutex::new(file),
            records: Mutex::new(LruCache::new(
                NonZeroUsize::new(RECORD_CACHE_CAP).expect("nonzero cache cap"),
            )),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn meta(&self) -> &StoreMeta {
        &self.meta
    }

    pub fn summaries(&self) -> &[FolderSummary] {
        &self.summaries
    }

    pub fn len(&self) -> usize {
        self.summaries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.summaries.is_empty()
    }

    pub fn get(&self, relative_path: &str) -> Result<Option<Arc<FolderInfo>>> {
        match self.by_path.get(relative_path) {
            Some(&index) => self.get_by_index(index).map(Some),
            None => Ok(None),
        }
    }

    pub fn get_by_index(&self, index: usize) -> Result<Arc<FolderInfo>> {
        if let Ok(mut cache) = self.records.lock()
            && let Some(info) = cache.get(&index)
        {
            return Ok(Arc::clone(info));
        }

        let (offset, len) = *self
            .offsets
            .get(index)
            .ok_or_else(|| SamefoldError::Store(format!("record {index} out of range")))?;

        let mut bytes = vec![0u8; len as usize + 4];
        {
            let mut file = self
                .file
                .lock()
                .map_err(|_| SamefoldError::Store("store lock poisoned".to_string()))?;
            file.seek(SeekFrom::Start(offset))?;
            file.read_exact(&mut bytes)?;
        }
        let (record, crc) = bytes.split_at(len as usize);
        let stored_crc = u32::from_le_bytes(crc.try_into().unwrap());
        if crc32fast::hash(record) != stored_crc {
            return Err(SamefoldError::Store(format!(
                "record checksum mismatch at {offset}"
            )));
        }
        let info: Arc<FolderInfo> = Arc::new(
            postcard::from_bytes(record)
                .map_err(|e| store_err("failed to deserialize folder", e))?,
        );

        if let Ok(mut cache) = self.records.lock() {
            cache.put(index, Arc::clone(&info));
        }
        Ok(info)
    }
}
