//! Diff projection between two folders of one scan.
//!
//! Both folders are projected into the comparison-key space the scan was
//! grouped under, so a diff explains exactly what the similarity score saw.

use serde::Serialize;

use crate::error::{Result, SamefoldError};
use crate::folder::{FolderInfo, comparison_entries};
use crate::schedule::ScanRecord;

#[derive(Debug, Clone, Serialize)]
pub struct DiffEntry {
    pub identity: String,
    pub left_weight: Option<u64>,
    pub right_weight: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FolderDiff {
    pub left: String,
    pub right: String,
    /// Identities present in left but absent in right, with left's weight.
    pub only_left: Vec<DiffEntry>,
    pub only_right: Vec<DiffEntry>,
    /// Present in both with differing byte weights.
    pub mismatched: Vec<DiffEntry>,
}

/// Project the stored records for `left` and `right` into a diff, after
/// optionally checking both are members of `group_id`.
pub fn project(
    record: &ScanRecord,
    group_id: Option<&str>,
    left: &str,
    right: &str,
) -> Result<FolderDiff> {
    if let Some(group_id) = group_id {
        let group = record
            .report
            .groups
            .iter()
            .find(|g| g.group_id == group_id)
            .ok_or_else(|| SamefoldError::InvalidRequest(format!("unknown group {group_id}")))?;
        for side in [left, right] {
            if !group.members.iter().any(|m| m.relative_path == side) {
                return Err(SamefoldError::InvalidRequest(format!(
                    "{side} is not a member of {group_id}"
                )));
            }
        }
    }

    let left_info = record
        .store
        .get(left)?
        .ok_or_else(|| SamefoldError::UnknownFolder(left.to_string()))?;
    let right_info = record
        .store
        .get(right)?
        .ok_or_else(|| SamefoldError::UnknownFolder(right.to_string()))?;

    let meta = record.store.meta();
    Ok(project_folders(
        &left_info,
        &right_info,
        meta.file_equality,
        meta.structure_policy,
        meta.force_case_insensitive,
    ))
}

pub(crate) fn project_folders(
    left: &FolderInfo,
    right: &FolderInfo,
    mode: crate::fingerprint::EqualityMode,
    policy: crate::fingerprint::StructurePolicy,
    case_insensitive: bool,
) -> FolderDiff {
    let a = comparison_entries(left, mode, policy, case_insensitive);
    let b = comparison_entries(right, mode, policy, case_insensitive);

    let mut only_left = Vec::new();
    let mut only_right = Vec::new();
    let mut mismatched = Vec::new();

    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        match a[i].0.cmp(&b[j].0) {
            std::cmp::Ordering::Less => {
                only_left.push(DiffEntry {
                    identity: a[i].0.display(),
                    left_weight: Some(a[i].1),
                    right_weight: None,
                });
                i += 1;
            }
            std::cmp::Ordering::Greater => {
                only_right.push(DiffEntry {
                    identity: b[j].0.display(),
                    left_weight: None,
                    right_weight: Some(b[j].1),
                });
                j += 1;
            }
            std::cmp::Ordering::Equal => {
                if a[i].1 != b[j].1 {
                    mismatched.push(DiffEntry {
                        identity: a[i].0.display(),
                        left_weight: Some(a[i].1),
                        right_weight: Some(b[j].1),
                    });
                }
                i += 1;
                j += 1;
            }
        }
    }
    for (key, weight) in &a[i..] {
        only_left.push(DiffEntry {
            identity: key.display(),
            left_weight: Some(*weight),
            right_weight: None,
        });
    }
    for (key, weight) in &b[j..] {
        only_right.push(DiffEntry {
            identity: key.display(),
            left_weight: None,
            right_weight: Some(*weight),
        });
    }

    // Deterministic output: weight descending, then identity ascending.
    for list in [&mut only_left, &mut only_right, &mut mismatched] {
        list.sort_by(|x, y| {
            let wx = x.left_weight.unwrap_or(0).max(x.right_weight.unwrap_or(0));
            let wy = y.left_weight.unwrap_or(0).max(y.right_weight.unwrap_or(0));
            wy.cmp(&wx).then_with(|| x.identity.cmp(&y.identity))
        });
    }

    FolderDiff {
        left: left.relative_path.clone(),
        right: right.relative_path.clone(),
        only_left,
        only_right,
        mismatched,
    }
}
