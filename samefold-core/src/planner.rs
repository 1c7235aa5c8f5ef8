//! Guarded deletion planning.
//!
//! Deletion is a two-step handshake: `plan` validates the queue and returns
//! an opaque single-use token; `confirm` re-checks every target against its
//! stored fingerprint and only then renames it into the dated quarantine
//! directory under the scan root. Canonical group members can never be
//! planned, and a plan dies after fifteen minutes or on its first failed
//! confirmation.

use std::collections::{HashMap, HashSet};
use std::ffi::OsStr;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Local, Utc};
use rand::RngCore;
use rand::rngs::OsRng;
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use crate::error::{Result, SamefoldError};
use crate::normalize::{depth_of, nfc_name, resolve_under_root};
use crate::schedule::ScanRecord;

const PLAN_TTL_MINUTES: i64 = 15;

/// Staged-but-not-applied deletion.
#[derive(Debug, Clone, Serialize)]
pub struct DeletionPlan {
    pub plan_id: String,
    pub scan_id: String,
    /// Opaque single-use confirmation token; 256 bits from the OS RNG.
    pub token: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Relative paths to quarantine, each validated to resolve inside root.
    pub queue: Vec<String>,
    pub reclaimable_bytes: u64,
    pub quarantine_root: PathBuf,
}

#[derive(Debug, Clone, Serialize)]
pub struct MovedEntry {
    pub relative_path: String,
    pub quarantine_path: PathBuf,
}

#[derive(Debug, Clone, Serialize)]
pub struct FailedMove {
    pub relative_path: String,
    pub message: String,
}

/// Result of a confirmed plan. Already-moved items stay in quarantine even
/// when later moves fail; they are recoverable by hand.
#[derive(Debug, Clone, Serialize)]
pub struct ConfirmOutcome {
    pub plan_id: String,
    pub moved: Vec<MovedEntry>,
    pub failed: Vec<FailedMove>,
    pub reclaimed_bytes: u64,
}

pub struct Planner {
    plans: Mutex<HashMap<String, DeletionPlan>>,
    /// Per-scan confirm lock: no two plans apply against the same root
    /// concurrently.
    confirm_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl Default for Planner {
    fn default() -> Self {
        Self::new()
    }
}

impl Planner {
    pub fn new() -> Self {
        Self {
            plans: Mutex::new(HashMap::new()),
            confirm_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn scan_of(&self, plan_id: &str) -> Option<String> {
        self.plans
            .lock()
            .ok()?
            .get(plan_id)
            .map(|plan| plan.scan_id.clone())
    }

    /// Validate the queue and stage a plan.
    pub fn plan(&self, record: &ScanRecord, paths: &[String]) -> Result<DeletionPlan> {
        let report = &record.report;
        if !report.request.deletion_enabled {
            return Err(SamefoldError::DeletionDisabled(report.scan_id.clone()));
        }
        let root = &report.root_path;

        let canonicals: HashSet<&str> = report
            .groups
            .iter()
            .map(|group| group.canonical().relative_path.as_str())
            .collect();

        let mut queue: Vec<String> = Vec::new();
        let mut reclaimable_bytes = 0u64;
        for raw in paths {
            let rel = normalize_queue_path(raw);
            if rel == "." || rel.is_empty() {
                return Err(SamefoldError::InvalidRequest(
                    "the scan root cannot be planned for deletion".to_string(),
                ));
            }
            let info = record
                .store
                .get(&rel)?
                .ok_or_else(|| SamefoldError::UnknownFolder(rel.clone()))?;
            resolve_under_root(root, &rel)?;
            if canonicals.contains(rel.as_str()) {
                return Err(SamefoldError::CannotPlanCanonical(rel));
            }
            if queue.contains(&rel) {
                continue;
            }
            reclaimable_bytes += info.total_bytes;
            queue.push(rel);
        }

        let now = Utc::now();
        let plan = DeletionPlan {
            plan_id: Uuid::new_v4().to_string(),
            scan_id: report.scan_id.clone(),
            token: generate_token(),
            created_at: now,
            expires_at: now + chrono::Duration::minutes(PLAN_TTL_MINUTES),
            queue,
            reclaimable_bytes,
            quarantine_root: root
                .join(".quarantine")
                .join(Local::now().format("%Y%m%d").to_string()),
        };
        info!(
            plan_id = %plan.plan_id,
            scan_id = %plan.scan_id,
            folders = plan.queue.len(),
            reclaimable = plan.reclaimable_bytes,
            "deletion plan staged"
        );
        self.plans
            .lock()
            .map_err(|_| SamefoldError::Store("planner lock poisoned".to_string()))?
            .insert(plan.plan_id.clone(), plan.clone());
        Ok(plan)
    }

    /// Apply a staged plan. Any failure before the first move leaves the
    /// filesystem untouched; the plan is consumed either way.
    pub fn confirm(
        &self,
        record: &ScanRecord,
        plan_id: &str,
        token: &str,
    ) -> Result<ConfirmOutcome> {
        let plan = self
            .plans
            .lock()
            .map_err(|_| SamefoldError::Store("planner lock poisoned".to_string()))?
            .remove(plan_id)
            .ok_or_else(|| SamefoldError::UnknownPlan(plan_id.to_string()))?;

        if plan.token != token {
            return Err(SamefoldError::TokenInvalid);
        }
        if Utc::now() >= plan.expires_at {
            return Err(SamefoldError::TokenExpired);
        }

        let lock = {
            let mut locks = self
                .confirm_locks
                .lock()
                .map_err(|_| SamefoldError::Store("planner lock poisoned".to_string()))?;
            Arc::clone(
                locks
                    .entry(plan.scan_id.clone())
                    .or_insert_with(|| Arc::new(Mutex::new(()))),
            )
        };
        let _guard = lock.lock();

        let root = &record.report.root_path;

        // Re-stat a representative of every queued folder before touching
        // anything: one drifted target aborts the whole confirmation.
        for rel in &plan.queue {
            let info = record
                .store
                .get(rel)?
                .ok_or_else(|| SamefoldError::UnknownFolder(rel.clone()))?;
            match info.representative() {
                Some(representative) => {
                    let absolute = root.join(&representative.relative_path);
                    let Ok(metadata) = fs::metadata(&absolute) else {
                        return Err(SamefoldError::DriftDetected(rel.clone()));
                    };
                    if metadata.len() != representative.weight
                        || metadata.modified().ok() != Some(representative.mtime)
                    {
                        return Err(SamefoldError::DriftDetected(rel.clone()));
                    }
                }
                None => {
                    if !root.join(rel).is_dir() {
                        return Err(SamefoldError::DriftDetected(rel.clone()));
                    }
                }
            }
        }

        fs::create_dir_all(&plan.quarantine_root)?;

        // Parents first, so a nested queue entry fails loudly instead of
        // quietly moving twice.
        let mut queue = plan.queue.clone();
        queue.sort_by_key(|rel| (depth_of(rel), rel.clone()));

        let mut moved = Vec::new();
        let mut failed = Vec::new();
        let mut reclaimed_bytes = 0u64;
        for rel in &queue {
            let source = root.join(rel);
            let destination = plan.quarantine_root.join(rel);
            if let Some(parent) = destination.parent()
                && let Err(e) = fs::create_dir_all(parent)
            {
                failed.push(FailedMove {
                    relative_path: rel.clone(),
                    message: e.to_string(),
                });
                continue;
            }
            let destination = free_destination(destination);
            match fs::rename(&source, &destination) {
                Ok(()) => {
                    if let Ok(Some(info)) = record.store.get(rel) {
                        reclaimed_bytes += info.total_bytes;
                    }
                    info!(path = %rel, to = %destination.display(), "folder quarantined");
                    moved.push(MovedEntry {
                        relative_path: rel.clone(),
                        quarantine_path: destination,
                    });
                }
                Err(e) => failed.push(FailedMove {
                    relative_path: rel.clone(),
                    message: e.to_string(),
                }),
            }
        }

        Ok(ConfirmOutcome {
            plan_id: plan.plan_id,
            moved,
            failed,
            reclaimed_bytes,
        })
    }
}

/// NFC-normalize a queued path component-wise and strip stray separators.
fn normalize_queue_path(raw: &str) -> String {
    raw.trim_matches('/')
        .split('/')
        .filter(|component| !component.is_empty() && *component != ".")
        .map(|component| nfc_name(OsStr::new(component)))
        .collect::<Vec<_>>()
        .join("/")
}

/// Smallest `.N` suffix making the quarantine name free.
fn free_destination(destination: PathBuf) -> PathBuf {
    if !destination.exists() {
        return destination;
    }
    let mut n = 1u32;
    loop {
        let candidate = PathBuf::from(format!("{}.{n}", destination.display()));
        if !candidate.exists() {
            return candidate;
        }
        n += 1;
    }
}

fn generate_token() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}
