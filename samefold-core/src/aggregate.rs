//! Post-order folder roll-up.
//!
//! Arena insertion order puts every parent before its children, so a single
//! reverse sweep closes each folder after all of its subtree: the folder's
//! `file_weights` are its direct files plus the already-closed weights of
//! its immediate subdirectories. Closed records stream straight into the
//! folder store and only the still-open ancestors keep weights in RAM,
//! which bounds stack and heap on deep trees.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::Result;
use crate::fingerprint::{EqualityMode, FileFingerprint, StructurePolicy};
use crate::folder::{FileWeight, FolderInfo, comparison_entries, fingerprint_hash};
use crate::normalize::fold_path;
use crate::scanner::CancellationToken;
use crate::store::{FolderStore, FolderStoreWriter};
use crate::tree::FolderArena;

/// Aggregation phase progress, sampled by the scheduler.
#[derive(Debug, Default)]
pub struct AggregateCounters {
    pub processed: AtomicU64,
    pub total: AtomicU64,
}

impl AggregateCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fraction(&self) -> Option<f64> {
        let total = self.total.load(Ordering::Relaxed);
        if total == 0 {
            return None;
        }
        Some(self.processed.load(Ordering::Relaxed) as f64 / total as f64)
    }
}

fn to_weight(fingerprint: FileFingerprint) -> FileWeight {
    FileWeight {
        relative_path: fingerprint.relative_path,
        weight: fingerprint.size,
        mtime: fingerprint.mtime,
        digest: fingerprint.digest,
    }
}

/// Fold the walked arena into one `FolderInfo` per folder (including the
/// root) and persist each as it closes.
pub fn aggregate(
    arena: FolderArena,
    mode: EqualityMode,
    policy: StructurePolicy,
    case_insensitive: bool,
    mut writer: FolderStoreWriter,
    counters: &AggregateCounters,
    cancel: &CancellationToken,
) -> Result<FolderStore> {
    let root_path = arena.root_path().to_path_buf();
    let nodes = arena.into_nodes();
    let count = nodes.len();
    counters.total.store(count as u64, Ordering::Relaxed);

    let mut parents: Vec<Option<usize>> = Vec::with_capacity(count);
    let mut rels: Vec<String> = Vec::with_capacity(count);
    let mut unstable: Vec<bool> = Vec::with_capacity(count);
    let mut pending: Vec<Vec<FileWeight>> = Vec::with_capacity(count);

    for node in nodes {
        parents.push(node.parent.map(|p| p.index()));
        rels.push(node.relative_path);
        let file_drifted = node.files.iter().any(|f| f.unstable);
        unstable.push(node.unstable || file_drifted);
        pending.push(node.files.into_iter().map(to_weight).collect());
    }

    for i in (0..count).rev() {
        if cancel.is_cancelled() {
            return Err(crate::error::SamefoldError::Cancelled);
        }

        let mut weights = std::mem::take(&mut pending[i]);
        weights.sort_unstable_by(|a, b| {
            fold_path(&a.relative_path, case_insensitive)
                .cmp(&fold_path(&b.relative_path, case_insensitive))
        });

        let relative_path = std::mem::take(&mut rels[i]);
        let total_bytes = weights.iter().map(|w| w.weight).sum();
        let mut info = FolderInfo {
            path: if relative_path == "." {
                root_path.clone()
            } else {
                root_path.join(&relative_path)
            },
            relative_path,
            total_bytes,
            file_count: weights.len() as u64,
            file_weights: weights,
            fingerprint_hash: [0; 32],
            unstable: unstable[i],
        };
        info.fingerprint_hash =
            fingerprint_hash(&comparison_entries(&info, mode, policy, case_insensitive));

        writer.insert(&info)?;
        counters.processed.fetch_add(1, Ordering::Relaxed);

        if let Some(parent) = parents[i] {
            unstable[parent] |= unstable[i];
            pending[parent].extend(info.file_weights);
        }
    }

    writer.finish()
}
