//! Per-folder roll-ups and comparison keys.
//!
//! `FolderInfo` is the persisted record the aggregator produces for every
//! folder, including the root. Its `file_weights` are keyed by root-relative
//! path so that roll-up is a plain union and ancestor maps dominate
//! descendant maps entry for entry. The grouper and diff projector never
//! compare stored entries directly; they project them into [`IdentityKey`]s
//! relative to the folder under comparison first.

use std::path::PathBuf;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

use crate::fingerprint::{Digest, EqualityMode, StructurePolicy, digest_hex};
use crate::normalize::fold_path;

/// One stored `file_weights` entry: a file identity and its byte weight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileWeight {
    /// NFC path relative to the scan root, original spelling.
    pub relative_path: String,
    pub weight: u64,
    /// Stat snapshot kept for the deletion planner's drift check.
    pub mtime: SystemTime,
    pub digest: Option<Digest>,
}

/// Per-folder roll-up over the folder's whole subtree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FolderInfo {
    pub path: PathBuf,
    /// `"."` for the scan root.
    pub relative_path: String,
    pub total_bytes: u64,
    pub file_count: u64,
    /// Sorted by folded `relative_path`.
    pub file_weights: Vec<FileWeight>,
    /// Stable hash over the folder's sorted comparison keys.
    pub fingerprint_hash: Digest,
    /// True if any descendant file was flagged unstable.
    pub unstable: bool,
}

impl FolderInfo {
    pub fn is_empty(&self) -> bool {
        self.file_count == 0
    }

    /// Largest-weight entry; used as the drift-check representative.
    pub fn representative(&self) -> Option<&FileWeight> {
        self.file_weights.iter().max_by(|a, b| {
            a.weight
                .cmp(&b.weight)
                .then_with(|| b.relative_path.cmp(&a.relative_path))
        })
    }
}

/// Lightweight row of the folder index, used for bucketing without loading
/// full records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FolderSummary {
    pub relative_path: String,
    pub total_bytes: u64,
    pub file_count: u64,
    pub unstable: bool,
}

/// A file identity as seen from one folder, projected for a structure
/// policy. Within a scan all keys use the same variant.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum IdentityKey {
    /// Folder-relative path (or basename under `bag_of_files`) plus size.
    NameSize { name: String, size: u64 },
    /// Folder-relative path plus content digest.
    PathDigest { name: String, digest: Digest },
    /// Content digest alone (`bag_of_files` + `sha256`).
    ContentDigest { digest: Digest },
}

impl IdentityKey {
    /// Human-readable identity for diff output and reports.
    pub fn display(&self) -> String {
        match self {
            IdentityKey::NameSize { name, .. } | IdentityKey::PathDigest { name, .. } => {
                name.clone()
            }
            IdentityKey::ContentDigest { digest } => format!("sha256:{}", digest_hex(digest)),
        }
    }
}

/// Project a folder's stored entries into sorted `(key, weight)` pairs for
/// comparison. Weights of colliding keys sum, which only happens under
/// `bag_of_files`.
pub fn comparison_entries(
    info: &FolderInfo,
    mode: EqualityMode,
    policy: StructurePolicy,
    case_insensitive: bool,
) -> Vec<(IdentityKey, u64)> {
    let prefix_len = if info.relative_path == "." {
        0
    } else {
        info.relative_path.len() + 1
    };

    let mut keyed: Vec<(IdentityKey, u64)> = info
        .file_weights
        .iter()
        .map(|entry| {
            let local = &entry.relative_path[prefix_len.min(entry.relative_path.len())..];
            let name = match policy {
                StructurePolicy::Relative => local,
                StructurePolicy::BagOfFiles => local.rsplit('/').next().unwrap_or(local),
            };
            let name = fold_path(name, case_insensitive).into_owned();
            let key = match (mode, policy) {
                (EqualityMode::NameSize, _) => IdentityKey::NameSize {
                    name,
                    size: entry.weight,
                },
                (EqualityMode::Sha256, StructurePolicy::Relative) => IdentityKey::PathDigest {
                    name,
                    digest: entry.digest.unwrap_or_default(),
                },
                (EqualityMode::Sha256, StructurePolicy::BagOfFiles) => IdentityKey::ContentDigest {
                    digest: entry.digest.unwrap_or_default(),
                },
            };
            (key, entry.weight)
        })
        .collect();

    keyed.sort_unstable_by(|a, b| a.0.cmp(&b.0));

    // Merge duplicate keys; weights sum over the subtree.
    let mut merged: Vec<(IdentityKey, u64)> = Vec::with_capacity(keyed.len());
    for (key, weight) in keyed {
        match merged.last_mut() {
            Some((last, acc)) if *last == key => *acc += weight,
            _ => merged.push((key, weight)),
        }
    }
    merged
}

/// Hash a byte field with an explicit length prefix so distinct field
/// sequences cannot serialize to identical byte streams.
fn hash_field(hasher: &mut Sha256, bytes: &[u8]) {
    hasher.update((bytes.len() as u64).to_be_bytes());
    hasher.update(bytes);
}

fn hash_u64(hasher: &mut Sha256, value: u64) {
    hasher.update(value.to_be_bytes());
}

/// Stable hash over sorted `(identity, weight)` pairs. Folders with equal
/// comparison keys hash identically regardless of their depth in the tree.
pub fn fingerprint_hash(entries: &[(IdentityKey, u64)]) -> Digest {
    let mut hasher = Sha256::new();
    hash_u64(&mut hasher, entries.len() as u64);
    for (key, weight) in entries {
        match key {
            IdentityKey::NameSize { name, size } => {
                hasher.update([0u8]);
                hash_field(&mut hasher, name.as_bytes());
                hash_u64(&mut hasher, *size);
            }
            IdentityKey::PathDigest { name, digest } => {
                hasher.update([1u8]);
                hash_field(&mut hasher, name.as_bytes());
                hasher.update(digest);
            }
            IdentityKey::ContentDigest { digest } => {
                hasher.update([2u8]);
                hasher.update(digest);
            }
        }
        hash_u64(&mut hasher, *weight);
    }
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(path: &str, weight: u64) -> FileWeight {
        FileWeight {
            relative_path: path.to_string(),
            weight,
            mtime: SystemTime::UNIX_EPOCH,
            digest: None,
        }
    }

    fn folder(rel: &str, entries: Vec<FileWeight>) -> FolderInfo {
        let total = entries.iter().map(|e| e.weight).sum();
        FolderInfo {
            path: PathBuf::from("/root").join(rel),
            relative_path: rel.to_string(),
            total_bytes: total,
            file_count: entries.len() as u64,
            file_weights: entries,
            fingerprint_hash: [0; 32],
            unstable: false,
        }
    }

    #[test]
    fn test_relative_projection_strips_folder_prefix() {
        let info = folder("a/x", vec![entry("a/x/f", 10), entry("a/x/sub/g", 20)]);
        let keys = comparison_entries(
            &info,
            EqualityMode::NameSize,
            StructurePolicy::Relative,
            false,
        );
        assert_eq!(
            keys,
            vec![
                (
                    IdentityKey::NameSize {
                        name: "f".into(),
                        size: 10
                    },
                    10
                ),
                (
                    IdentityKey::NameSize {
                        name: "sub/g".into(),
                        size: 20
                    },
                    20
                ),
            ]
        );
    }

    #[test]
    fn test_root_projection_keeps_full_path() {
        let info = folder(".", vec![entry("a/f", 10)]);
        let keys = comparison_entries(
            &info,
            EqualityMode::NameSize,
            StructurePolicy::Relative,
            false,
        );
        assert_eq!(
            keys[0].0,
            IdentityKey::NameSize {
                name: "a/f".into(),
                size: 10
            }
        );
    }

    #[test]
    fn test_bag_of_files_merges_same_basename() {
        let info = folder("d", vec![entry("d/one/f", 10), entry("d/two/f", 10)]);
        let keys = comparison_entries(
            &info,
            EqualityMode::NameSize,
            StructurePolicy::BagOfFiles,
            false,
        );
        assert_eq!(
            keys,
            vec![(
                IdentityKey::NameSize {
                    name: "f".into(),
                    size: 10
                },
                20
            )]
        );
    }

    #[test]
    fn test_case_folding_applies_to_keys() {
        let info = folder("d", vec![entry("d/File.TXT", 5)]);
        let keys = comparison_entries(
            &info,
            EqualityMode::NameSize,
            StructurePolicy::Relative,
            true,
        );
        assert_eq!(
            keys[0].0,
            IdentityKey::NameSize {
                name: "file.txt".into(),
                size: 5
            }
        );
    }

    #[test]
    fn test_fingerprint_hash_is_depth_invariant() {
        let shallow = folder("x", vec![entry("x/f", 10)]);
        let deep = folder("a/b/x", vec![entry("a/b/x/f", 10)]);
        let mode = EqualityMode::NameSize;
        let policy = StructurePolicy::Relative;
        let h1 = fingerprint_hash(&comparison_entries(&shallow, mode, policy, false));
        let h2 = fingerprint_hash(&comparison_entries(&deep, mode, policy, false));
        assert_eq!(h1, h2);
    }

    #[test]
    fn test_fingerprint_hash_differs_on_weight() {
        let a = folder("x", vec![entry("x/f", 10)]);
        let b = folder("x", vec![entry("x/f", 11)]);
        let mode = EqualityMode::NameSize;
        let policy = StructurePolicy::Relative;
        let h1 = fingerprint_hash(&comparison_entries(&a, mode, policy, false));
        let h2 = fingerprint_hash(&comparison_entries(&b, mode, policy, false));
        assert_ne!(h1, h2);
    }

    #[test]
    fn test_representative_prefers_heaviest() {
        let info = folder("d", vec![entry("d/small", 1), entry("d/big", 100)]);
        assert_eq!(info.representative().unwrap().relative_path, "d/big");
    }
}
