use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningKind {
    Permission,
    Unstable,
    IoError,
}

/// A recovered per-entry problem; the entry contributed nothing to the scan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanWarning {
    pub path: String,
    pub kind: WarningKind,
    pub message: String,
}

/// Bounded warning collector shared between walker workers and the
/// scheduler. The cap keeps a degenerate tree from ballooning scan state;
/// overflow is counted instead of stored.
#[derive(Debug)]
pub struct WarningSink {
    entries: Mutex<Vec<ScanWarning>>,
    overflow: AtomicU64,
    cap: usize,
}

impl WarningSink {
    pub fn new(cap: usize) -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            overflow: AtomicU64::new(0),
            cap,
        }
    }

    pub fn push(&self, kind: WarningKind, path: impl Into<String>, message: impl Into<String>) {
        let path = path.into();
        let message = message.into();
        warn!(path = %path, kind = ?kind, "{message}");
        if let Ok(mut entries) = self.entries.lock() {
            if entries.len() < self.cap {
                entries.push(ScanWarning {
                    path,
                    kind,
                    message,
                });
                return;
            }
        }
        self.overflow.fetch_add(1, Ordering::Relaxed);
    }

    /// `(stored warnings, overflow count)` copy-on-read.
    pub fn snapshot(&self) -> (Vec<ScanWarning>, u64) {
        let entries = self
            .entries
            .lock()
            .map(|e| e.clone())
            .unwrap_or_default();
        (entries, self.overflow.load(Ordering::Relaxed))
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for WarningSink {
    fn default() -> Self {
        Self::new(1_000)
    }
}

/// Shared walking-phase counters. The walker only ever increments; the
/// scheduler samples them for heartbeat events, so observed stats never
/// decrease.
#[derive(Debug, Default)]
pub struct WalkCounters {
    pub files_scanned: AtomicU64,
    pub folders_scanned: AtomicU64,
    pub bytes_scanned: AtomicU64,
    pub hardlinks_collapsed: AtomicU64,
    current_path: Mutex<Option<String>>,
}

impl WalkCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_current_path(&self, path: String) {
        if let Ok(mut guard) = self.current_path.lock() {
            *guard = Some(path);
        }
    }

    pub fn current_path(&self) -> Option<String> {
        self.current_path.lock().ok().and_then(|g| g.clone())
    }

    pub fn files(&self) -> u64 {
        self.files_scanned.load(Ordering::Relaxed)
    }

    pub fn folders(&self) -> u64 {
        self.folders_scanned.load(Ordering::Relaxed)
    }

    pub fn bytes(&self) -> u64 {
        self.bytes_scanned.load(Ordering::Relaxed)
    }

    pub fn hardlinks(&self) -> u64 {
        self.hardlinks_collapsed.load(Ordering::Relaxed)
    }
}
