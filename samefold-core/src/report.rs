//! Group and report datamodel, plus the persisted report snapshot.

use std::fs::{self, File};
use std::io::Write as _;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SamefoldError};
use crate::request::ScanRequest;
use crate::scanner::ScanWarning;
use crate::schedule::{PhaseMetrics, ScanStats};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupLabel {
    Identical,
    NearDuplicate,
    /// Reserved for the overlap explorer; the default grouper never emits it.
    PartialOverlap,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupMember {
    pub relative_path: String,
    pub total_bytes: u64,
    pub file_count: u64,
}

/// One undirected similarity edge between members, by member index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimilarityEdge {
    pub left: u32,
    pub right: u32,
    pub similarity: f64,
}

/// A cluster of folders whose pairwise similarity meets the threshold.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupInfo {
    /// Stable, monotonically assigned: `g_000001`...
    pub group_id: String,
    pub label: GroupLabel,
    /// Members are ordered with the canonical first.
    pub canonical_index: usize,
    pub members: Vec<GroupMember>,
    /// Sparse for large groups: max-spanning edges plus the canonical's row.
    pub pairwise_similarity: Vec<SimilarityEdge>,
    /// True if accepting this group suppressed a descendant group.
    pub suppressed_descendants: bool,
    /// Bytes freed if every non-canonical member were removed.
    pub reclaimable_bytes: u64,
}

impl GroupInfo {
    pub fn canonical(&self) -> &GroupMember {
        &self.members[self.canonical_index]
    }
}

/// Final scan output, persisted as `report.json` next to the folder index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanReport {
    pub scan_id: String,
    pub root_path: PathBuf,
    pub generated_at: DateTime<Utc>,
    pub request: ScanRequest,
    pub groups: Vec<GroupInfo>,
    /// Path of the spilled folder index backing this report.
    pub folder_index_ref: String,
    pub stats: ScanStats,
    pub metrics: Vec<PhaseMetrics>,
    pub warnings: Vec<ScanWarning>,
    pub warnings_overflow: u64,
}

/// Write the report snapshot. Idempotent: rewriting the same report yields
/// the same file, and the temp-file rename keeps readers consistent.
pub fn save_report(path: &Path, report: &ScanReport) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_vec_pretty(report)
        .map_err(|e| SamefoldError::Store(format!("failed to serialize report: {e}")))?;

    let temp_path = path.with_extension("tmp");
    let mut file = File::create(&temp_path)?;
    file.write_all(&json)?;
    file.sync_all()?;
    drop(file);
    fs::rename(&temp_path, path)?;
    Ok(())
}

pub fn load_report(path: &Path) -> Result<ScanReport> {
    let data = fs::read(path)?;
    serde_json::from_slice(&data)
        .map_err(|e| SamefoldError::Store(format!("failed to deserialize report: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_report() -> ScanReport {
        ScanReport {
            scan_id: "s1".to_string(),
            root_path: PathBuf::from("/data"),
            generated_at: Utc::now(),
            request: ScanRequest::new("/data"),
            groups: vec![GroupInfo {
                group_id: "g_000001".to_string(),
                label: GroupLabel::Identical,
                canonical_index: 0,
                members: vec![
                    GroupMember {
                        relative_path: "x".to_string(),
                        total_bytes: 1024,
                        file_count: 1,
                    },
                    GroupMember {
                        relative_path: "a/x".to_string(),
                        total_bytes: 1024,
                        file_count: 1,
                    },
                ],
                pairwise_similarity: vec![SimilarityEdge {
                    left: 0,
                    right: 1,
                    similarity: 1.0,
                }],
                suppressed_descendants: false,
                reclaimable_bytes: 1024,
            }],
            folder_index_ref: "store.bin".to_string(),
            stats: ScanStats::default(),
            metrics: Vec::new(),
            warnings: Vec::new(),
            warnings_overflow: 0,
        }
    }

    #[test]
    fn test_report_roundtrip() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("report.json");
        let report = sample_report();

        save_report(&path, &report).unwrap();
        let loaded = load_report(&path).unwrap();

        assert_eq!(loaded.scan_id, report.scan_id);
        assert_eq!(loaded.groups.len(), 1);
        assert_eq!(loaded.groups[0].label, GroupLabel::Identical);
        assert_eq!(loaded.groups[0].canonical().relative_path, "x");
    }

    #[test]
    fn test_save_is_idempotent() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("report.json");
        let report = sample_report();

        save_report(&path, &report).unwrap();
        let first = fs::read(&path).unwrap();
        save_report(&path, &report).unwrap();
        let second = fs::read(&path).unwrap();
        assert_eq!(first, second);
    }
}
