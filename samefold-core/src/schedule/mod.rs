//! Scan scheduling: phase state machine, streaming progress, cancellation,
//! admission, and the engine facade the transport layer talks to.

mod state;

pub use state::{
    PhaseMetrics, ProgressEvent, ScanPhase, ScanState, ScanStats, ScanStatus, blended_progress,
    peak_rss_bytes,
};

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use tracing::{info, warn};
use uuid::Uuid;

use crate::aggregate::{AggregateCounters, aggregate};
use crate::cache::FingerprintCache;
use crate::diff::{self, FolderDiff};
use crate::error::{Result, SamefoldError};
use crate::group::{GroupCounters, GrouperOptions, build_groups};
use crate::normalize::normalize_root;
use crate::planner::{ConfirmOutcome, DeletionPlan, Planner};
use crate::report::{ScanReport, load_report, save_report};
use crate::request::ScanRequest;
use crate::scanner::{
    CancellationToken, WalkCounters, WalkOptions, WarningSink, walk, worker_count,
};
use crate::store::{FolderStore, FolderStoreWriter, StoreMeta};
use state::ThroughputWindow;

const HEARTBEAT_INTERVAL: Duration = Duration::from_millis(200);
const ETA_WINDOW: Duration = Duration::from_secs(10);

/// A completed scan: its report plus the folder index backing it. Diff and
/// deletion operations read these after the scan finished.
pub struct ScanRecord {
    pub report: Arc<ScanReport>,
    pub store: Arc<FolderStore>,
}

/// Counters every phase writes into and the heartbeat samples from.
pub(crate) struct PipelineCounters {
    pub walk: WalkCounters,
    pub warnings: Arc<WarningSink>,
    pub aggregate: AggregateCounters,
    pub group: GroupCounters,
}

impl PipelineCounters {
    fn new() -> Self {
        Self {
            walk: WalkCounters::new(),
            warnings: Arc::new(WarningSink::default()),
            aggregate: AggregateCounters::new(),
            group: GroupCounters::new(),
        }
    }
}

/// One live scan, owned by the scheduler. Observers only receive snapshots.
struct ScanHandle {
    scan_id: String,
    cancel: CancellationToken,
    state: Mutex<ScanState>,
    counters: Arc<PipelineCounters>,
    subscribers: Mutex<Vec<Sender<ProgressEvent>>>,
    /// Files the previous scan of the same root saw; drives the walking ETA.
    expected_files: Option<u64>,
}

impl ScanHandle {
    fn new(scan_id: String, root_path: PathBuf, expected_files: Option<u64>) -> Self {
        Self {
            state: Mutex::new(ScanState::new(scan_id.clone(), root_path)),
            scan_id,
            cancel: CancellationToken::new(),
            counters: Arc::new(PipelineCounters::new()),
            subscribers: Mutex::new(Vec::new()),
            expected_files,
        }
    }

    fn snapshot(&self) -> ScanState {
        self.state.lock().expect("scan state lock").clone()
    }

    fn update<F: FnOnce(&mut ScanState)>(&self, f: F) -> ScanState {
        let mut state = self.state.lock().expect("scan state lock");
        f(&mut state);
        state.clone()
    }

    fn publish(&self, event: ProgressEvent) {
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        }
    }

    /// Fold live counters into the state and build a copy-on-publish event.
    fn build_event(&self, window: Option<&ThroughputWindow>) -> ProgressEvent {
        let counters = &self.counters;
        let (warnings, overflow) = counters.warnings.snapshot();
        let files = counters.walk.files();
        let snapshot = self.update(|state| {
            state.stats.files_scanned = files;
            state.stats.folders_scanned = counters.walk.folders();
            state.stats.bytes_scanned = counters.walk.bytes();
            state.stats.hardlinks_collapsed = counters.walk.hardlinks();
            state.warnings = warnings.clone();
            state.warnings_overflow = overflow;
        });

        // Walking progress is approximated against the previous scan of the
        // same root; with no prior it is unknowable and reported as None.
        let walk_fraction = self.expected_files.map(|expected| {
            if expected == 0 {
                1.0
            } else {
                (files as f64 / expected as f64).min(0.99)
            }
        });
        let progress = match snapshot.status {
            ScanStatus::Completed => Some(1.0),
            ScanStatus::Running => blended_progress(
                snapshot.phase,
                walk_fraction,
                counters.aggregate.fraction(),
                counters.group.fraction(),
            ),
            _ => None,
        };
        let eta_seconds = match (snapshot.phase, snapshot.status) {
            (ScanPhase::Walking, ScanStatus::Running) => window
                .zip(self.expected_files)
                .and_then(|(w, expected)| w.eta_seconds(expected, files)),
            _ => None,
        };

        ProgressEvent {
            scan_id: snapshot.scan_id.clone(),
            status: snapshot.status,
            phase: snapshot.phase,
            phases: snapshot.phases.clone(),
            stats: snapshot.stats,
            warnings,
            last_path: counters.walk.current_path(),
            progress,
            eta_seconds,
        }
    }
}

/// Global admission: permits for concurrently running scans; default 1.
struct Admission {
    tx: Sender<()>,
    rx: Receiver<()>,
}

struct AdmissionPermit {
    tx: Sender<()>,
}

impl Admission {
    fn new(slots: usize) -> Self {
        let (tx, rx) = crossbeam_channel::bounded(slots.max(1));
        for _ in 0..slots.max(1) {
            let _ = tx.send(());
        }
        Self { tx, rx }
    }

    /// Block until a slot frees up, polling the cancel flag while queued.
    fn acquire(&self, cancel: &CancellationToken) -> Option<AdmissionPermit> {
        loop {
            if cancel.is_cancelled() {
                return None;
            }
            match self.rx.recv_timeout(Duration::from_millis(100)) {
                Ok(()) => {
                    return Some(AdmissionPermit {
                        tx: self.tx.clone(),
                    });
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return None,
            }
        }
    }
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        let _ = self.tx.send(());
    }
}

struct EngineShared {
    state_dir: PathBuf,
    cache: Arc<FingerprintCache>,
    scans: Mutex<HashMap<String, Arc<ScanHandle>>>,
    completed: Mutex<HashMap<String, Arc<ScanRecord>>>,
    admission: Admission,
    planner: Planner,
}

/// The engine facade: submit scans, stream their progress, then diff,
/// plan and confirm deletions against the persisted results.
pub struct Engine {
    inner: Arc<EngineShared>,
}

impl Engine {
    /// Open an engine over a state directory holding `cache.db` and
    /// `scans/<scan_id>/{store.bin, report.json}`.
    pub fn new(state_dir: &Path) -> Result<Self> {
        Self::with_max_active(state_dir, 1)
    }

    pub fn with_max_active(state_dir: &Path, max_active: usize) -> Result<Self> {
        fs::create_dir_all(state_dir.join("scans"))?;
        let cache = Arc::new(FingerprintCache::open(&state_dir.join("cache.db")));
        Ok(Self {
            inner: Arc::new(EngineShared {
                state_dir: state_dir.to_path_buf(),
                cache,
                scans: Mutex::new(HashMap::new()),
                completed: Mutex::new(HashMap::new()),
                admission: Admission::new(max_active),
                planner: Planner::new(),
            }),
        })
    }

    pub fn state_dir(&self) -> &Path {
        &self.inner.state_dir
    }

    /// Validate and enqueue a scan; returns its id immediately. The scan
    /// stays `pending` while queued behind the admission semaphore.
    pub fn submit(&self, mut request: ScanRequest) -> Result<String> {
        request.validate()?;
        let root = normalize_root(&request.root_path)?;
        request.root_path = root.clone();

        let scan_id = Uuid::new_v4().to_string();
        let expected_files = self.expected_files_for(&root);
        let handle = Arc::new(ScanHandle::new(scan_id.clone(), root.clone(), expected_files));
        self.inner
            .scans
            .lock()
            .expect("scan registry lock")
            .insert(scan_id.clone(), Arc::clone(&handle));

        let shared = Arc::clone(&self.inner);
        std::thread::spawn(move || run_pipeline(shared, handle, request, root));
        Ok(scan_id)
    }

    /// Most recent completed file count for the same root, if any scan of it
    /// was persisted before. Feeds the walking ETA.
    fn expected_files_for(&self, root: &Path) -> Option<u64> {
        let scans_dir = self.inner.state_dir.join("scans");
        let mut best: Option<(chrono::DateTime<Utc>, u64)> = None;
        for entry in fs::read_dir(&scans_dir).ok()?.flatten() {
            let report_path = entry.path().join("report.json");
            let Ok(report) = load_report(&report_path) else {
                continue;
            };
            if report.root_path != root {
                continue;
            }
            if best.is_none_or(|(t, _)| report.generated_at > t) {
                best = Some((report.generated_at, report.stats.files_scanned));
            }
        }
        best.map(|(_, files)| files)
    }

    fn handle(&self, scan_id: &str) -> Result<Arc<ScanHandle>> {
        self.inner
            .scans
            .lock()
            .expect("scan registry lock")
            .get(scan_id)
            .cloned()
            .ok_or_else(|| SamefoldError::UnknownScan(scan_id.to_string()))
    }

    /// Copy-on-read snapshot of the scan state.
    pub fn state(&self, scan_id: &str) -> Result<ScanState> {
        Ok(self.handle(scan_id)?.snapshot())
    }

    /// Subscribe to progress events. The current state is delivered first,
    /// so terminal scans yield exactly one event.
    pub fn subscribe(&self, scan_id: &str) -> Result<Receiver<ProgressEvent>> {
        let handle = self.handle(scan_id)?;
        let (tx, rx) = crossbeam_channel::unbounded();
        // Register before snapshotting, so a terminal event can never slip
        // between the snapshot and the registration.
        handle
            .subscribers
            .lock()
            .expect("subscriber lock")
            .push(tx.clone());
        let _ = tx.send(handle.build_event(None));
        Ok(rx)
    }

    /// Request cooperative cancellation.
    pub fn cancel(&self, scan_id: &str) -> Result<()> {
        self.handle(scan_id)?.cancel.cancel();
        Ok(())
    }

    /// Block until the scan reaches a terminal state.
    pub fn wait(&self, scan_id: &str) -> Result<ScanState> {
        let rx = self.subscribe(scan_id)?;
        for event in rx.iter() {
            if event.status.is_terminal() {
                break;
            }
        }
        self.state(scan_id)
    }

    /// The completed scan's report and folder index, loading them from the
    /// state directory when the scan ran in an earlier process.
    pub fn record(&self, scan_id: &str) -> Result<Arc<ScanRecord>> {
        if let Some(record) = self
            .inner
            .completed
            .lock()
            .expect("completed lock")
            .get(scan_id)
        {
            return Ok(Arc::clone(record));
        }

        if let Ok(handle) = self.handle(scan_id) {
            let status = handle.snapshot().status;
            if status != ScanStatus::Completed {
                return Err(SamefoldError::ScanNotCompleted(scan_id.to_string()));
            }
        }

        let scan_dir = self.inner.state_dir.join("scans").join(scan_id);
        let report = match load_report(&scan_dir.join("report.json")) {
            Ok(report) => report,
            Err(SamefoldError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(SamefoldError::UnknownScan(scan_id.to_string()));
            }
            Err(e) => return Err(e),
        };
        let store = FolderStore::open(&scan_dir.join("store.bin"))?;
        let record = Arc::new(ScanRecord {
            report: Arc::new(report),
            store: Arc::new(store),
        });
        self.inner
            .completed
            .lock()
            .expect("completed lock")
            .insert(scan_id.to_string(), Arc::clone(&record));
        Ok(record)
    }

    pub fn report(&self, scan_id: &str) -> Result<Arc<ScanReport>> {
        Ok(Arc::clone(&self.record(scan_id)?.report))
    }

    /// Project the stored differences between two folders of one scan.
    pub fn diff(
        &self,
        scan_id: &str,
        group_id: Option<&str>,
        left: &str,
        right: &str,
    ) -> Result<FolderDiff> {
        let record = self.record(scan_id)?;
        diff::project(&record, group_id, left, right)
    }

    /// Stage a deletion plan; nothing moves until the token comes back.
    pub fn plan_deletion(&self, scan_id: &str, paths: &[String]) -> Result<DeletionPlan> {
        let record = self.record(scan_id)?;
        self.inner.planner.plan(&record, paths)
    }

    /// Apply a previously staged plan. The token is single-use: any failed
    /// confirmation invalidates the plan.
    pub fn confirm_deletion(&self, plan_id: &str, token: &str) -> Result<ConfirmOutcome> {
        let scan_id = self
            .inner
            .planner
            .scan_of(plan_id)
            .ok_or_else(|| SamefoldError::UnknownPlan(plan_id.to_string()))?;
        let record = self.record(&scan_id)?;
        self.inner.planner.confirm(&record, plan_id, token)
    }
}

struct Heartbeat {
    stop: Arc<AtomicBool>,
    thread: std::thread::JoinHandle<()>,
}

impl Heartbeat {
    fn spawn(handle: Arc<ScanHandle>) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let thread = std::thread::spawn(move || {
            let mut window = ThroughputWindow::new(ETA_WINDOW);
            while !stop_flag.load(Ordering::Relaxed) {
                std::thread::sleep(HEARTBEAT_INTERVAL);
                window.record(handle.counters.walk.files());
                let event = handle.build_event(Some(&window));
                handle.publish(event);
            }
        });
        Self { stop, thread }
    }

    fn stop(self) {
        self.stop.store(true, Ordering::Relaxed);
        let _ = self.thread.join();
    }
}

fn run_pipeline(
    shared: Arc<EngineShared>,
    handle: Arc<ScanHandle>,
    request: ScanRequest,
    root: PathBuf,
) {
    let heartbeat = Heartbeat::spawn(Arc::clone(&handle));
    let result = execute_scan(&shared, &handle, &request, &root);

    match result {
        Ok(()) => info!(scan_id = %handle.scan_id, "scan completed"),
        Err(SamefoldError::Cancelled) => {
            info!(scan_id = %handle.scan_id, "scan cancelled");
            handle.update(|state| state.status = ScanStatus::Cancelled);
        }
        Err(e) => {
            warn!(scan_id = %handle.scan_id, error = %e, "scan failed");
            handle.update(|state| {
                state.status = ScanStatus::Failed;
                state.error = Some(e.to_string());
            });
        }
    }

    heartbeat.stop();
    let event = handle.build_event(None);
    handle.publish(event);
}

fn close_phase(handle: &ScanHandle, f: impl FnOnce(&mut PhaseMetrics)) {
    let rss = peak_rss_bytes();
    handle.update(|state| {
        if let Some(metrics) = state.phases.last_mut() {
            metrics.end_time = Some(Utc::now());
            metrics.peak_rss = rss;
            f(metrics);
        }
    });
}

fn execute_scan(
    shared: &EngineShared,
    handle: &ScanHandle,
    request: &ScanRequest,
    root: &Path,
) -> Result<()> {
    let _permit = shared
        .admission
        .acquire(&handle.cancel)
        .ok_or(SamefoldError::Cancelled)?;
    if handle.cancel.is_cancelled() {
        return Err(SamefoldError::Cancelled);
    }

    let workers = worker_count(request.concurrency);
    info!(
        scan_id = %handle.scan_id,
        root = %root.display(),
        workers,
        mode = ?request.file_equality,
        "scan starting"
    );
    handle.update(|state| {
        state.status = ScanStatus::Running;
        state.phase = ScanPhase::Walking;
        state.stats.workers = workers;
        state.phases.push(PhaseMetrics::begin(ScanPhase::Walking, workers));
    });

    let counters = Arc::clone(&handle.counters);
    let walk_options = WalkOptions {
        include: request.include.clone(),
        exclude: request.exclude.clone(),
        mode: request.file_equality,
        workers,
    };
    let arena = walk(
        root,
        &walk_options,
        &shared.cache,
        &counters.walk,
        &counters.warnings,
        &handle.cancel,
    )?;

    close_phase(handle, |metrics| {
        metrics.bytes_scanned_delta = counters.walk.bytes();
        metrics.files_processed = counters.walk.files();
        metrics.folders_processed = counters.walk.folders();
    });
    if request.file_equality == crate::fingerprint::EqualityMode::Sha256
        && let Err(e) = shared.cache.flush()
    {
        warn!(error = %e, "failed to persist fingerprint cache");
    }

    // Aggregating: totals known at phase entry.
    let folder_total = arena.len() as u64;
    handle.update(|state| {
        state.phase = ScanPhase::Aggregating;
        state
            .phases
            .push(PhaseMetrics::begin(ScanPhase::Aggregating, 1));
    });

    let scan_dir = shared.state_dir.join("scans").join(&handle.scan_id);
    let store_meta = StoreMeta {
        scan_id: handle.scan_id.clone(),
        root_path: root.to_path_buf(),
        file_equality: request.file_equality,
        structure_policy: request.structure_policy,
        force_case_insensitive: request.force_case_insensitive,
    };
    let writer = FolderStoreWriter::create(&scan_dir.join("store.bin"), &store_meta)?;
    let store = aggregate(
        arena,
        request.file_equality,
        request.structure_policy,
        request.force_case_insensitive,
        writer,
        &counters.aggregate,
        &handle.cancel,
    )?;

    close_phase(handle, |metrics| {
        metrics.folders_processed = folder_total;
    });
    handle.update(|state| {
        state.phase = ScanPhase::Grouping;
        state.phases.push(PhaseMetrics::begin(ScanPhase::Grouping, 1));
    });

    let grouper_options = GrouperOptions {
        min_similarity: request.similarity_threshold,
        mode: request.file_equality,
        policy: request.structure_policy,
        case_insensitive: request.force_case_insensitive,
    };
    let groups = build_groups(&store, &grouper_options, &handle.cancel, &counters.group)?;

    close_phase(handle, |metrics| {
        metrics.folders_processed = store.len() as u64;
    });

    let (warnings, warnings_overflow) = counters.warnings.snapshot();
    let snapshot = handle.snapshot();
    let report = Arc::new(ScanReport {
        scan_id: handle.scan_id.clone(),
        root_path: root.to_path_buf(),
        generated_at: Utc::now(),
        request: request.clone(),
        groups,
        folder_index_ref: store.path().display().to_string(),
        stats: ScanStats {
            folders_scanned: counters.walk.folders(),
            files_scanned: counters.walk.files(),
            bytes_scanned: counters.walk.bytes(),
            hardlinks_collapsed: counters.walk.hardlinks(),
            workers,
        },
        metrics: snapshot.phases.clone(),
        warnings,
        warnings_overflow,
    });
    save_report(&scan_dir.join("report.json"), &report)?;

    shared
        .completed
        .lock()
        .expect("completed lock")
        .insert(
            handle.scan_id.clone(),
            Arc::new(ScanRecord {
                report: Arc::clone(&report),
                store: Arc::new(store),
            }),
        );

    handle.update(|state| {
        state.phase = ScanPhase::Done;
        state.status = ScanStatus::Completed;
        state.report = Some(report);
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs as stdfs;
    use tempfile::TempDir;

    fn fixture_tree(root: &Path) {
        stdfs::create_dir_all(root.join("x")).unwrap();
        stdfs::create_dir_all(root.join("a/x")).unwrap();
        stdfs::write(root.join("x/f"), vec![1u8; 1024]).unwrap();
        stdfs::write(root.join("a/x/f"), vec![1u8; 1024]).unwrap();
    }

    fn engine() -> (TempDir, Engine) {
        let state = TempDir::new().unwrap();
        let engine = Engine::new(state.path()).unwrap();
        (state, engine)
    }

    #[test]
    fn test_scan_lifecycle_to_completed() {
        let data = TempDir::new().unwrap();
        fixture_tree(data.path());
        let (_state, engine) = engine();

        let scan_id = engine
            .submit(ScanRequest::new(data.path().canonicalize().unwrap()))
            .unwrap();
        let state = engine.wait(&scan_id).unwrap();

        assert_eq!(state.status, ScanStatus::Completed);
        assert_eq!(state.phase, ScanPhase::Done);
        assert_eq!(state.stats.files_scanned, 2);
        assert_eq!(state.phases.len(), 3);
        assert!(state.phases.iter().all(|p| p.end_time.is_some()));

        let report = engine.report(&scan_id).unwrap();
        assert_eq!(report.groups.len(), 1);
        assert_eq!(report.groups[0].canonical().relative_path, "x");
    }

    #[test]
    fn test_report_persists_across_engines() {
        let data = TempDir::new().unwrap();
        fixture_tree(data.path());
        let state = TempDir::new().unwrap();

        let scan_id = {
            let engine = Engine::new(state.path()).unwrap();
            let scan_id = engine
                .submit(ScanRequest::new(data.path().canonicalize().unwrap()))
                .unwrap();
            engine.wait(&scan_id).unwrap();
            scan_id
        };

        // A fresh engine over the same state dir reads it back from disk.
        let engine = Engine::new(state.path()).unwrap();
        let report = engine.report(&scan_id).unwrap();
        assert_eq!(report.scan_id, scan_id);
        let record = engine.record(&scan_id).unwrap();
        assert!(record.store.get("x").unwrap().is_some());
    }

    #[test]
    fn test_unknown_scan() {
        let (_state, engine) = engine();
        assert!(matches!(
            engine.state("missing"),
            Err(SamefoldError::UnknownScan(_))
        ));
        assert!(matches!(
            engine.report("missing"),
            Err(SamefoldError::UnknownScan(_))
        ));
    }

    #[test]
    fn test_submit_rejects_missing_root() {
        let (_state, engine) = engine();
        let request = ScanRequest::new("/definitely/not/here/samefold");
        assert!(matches!(
            engine.submit(request),
            Err(SamefoldError::RootNotFound(_))
        ));
    }

    #[test]
    fn test_cancel_yields_no_report() {
        let data = TempDir::new().unwrap();
        fixture_tree(data.path());
        let (_state, engine) = engine();

        let scan_id = engine
            .submit(ScanRequest::new(data.path().canonicalize().unwrap()))
            .unwrap();
        // Cancel immediately; tiny scans may still win the race, so accept
        // either terminal state but require consistency.
        engine.cancel(&scan_id).unwrap();
        let state = engine.wait(&scan_id).unwrap();
        assert!(state.status.is_terminal());
        if state.status == ScanStatus::Cancelled {
            assert!(state.report.is_none());
            assert!(matches!(
                engine.report(&scan_id),
                Err(SamefoldError::ScanNotCompleted(_))
            ));
        }
    }

    #[test]
    fn test_scan_idempotency_modulo_timestamps() {
        let data = TempDir::new().unwrap();
        fixture_tree(data.path());
        let (_state, engine) = engine();
        let root = data.path().canonicalize().unwrap();

        let first = engine.submit(ScanRequest::new(root.clone())).unwrap();
        engine.wait(&first).unwrap();
        let second = engine.submit(ScanRequest::new(root)).unwrap();
        engine.wait(&second).unwrap();

        let a = engine.report(&first).unwrap();
        let b = engine.report(&second).unwrap();
        assert_eq!(
            serde_json::to_string(&a.groups).unwrap(),
            serde_json::to_string(&b.groups).unwrap()
        );
        assert_eq!(a.stats.files_scanned, b.stats.files_scanned);
        assert_eq!(a.stats.bytes_scanned, b.stats.bytes_scanned);
    }

    #[test]
    fn test_subscribe_streams_terminal_event() {
        let data = TempDir::new().unwrap();
        fixture_tree(data.path());
        let (_state, engine) = engine();

        let scan_id = engine
            .submit(ScanRequest::new(data.path().canonicalize().unwrap()))
            .unwrap();
        engine.wait(&scan_id).unwrap();

        // Late subscriber still sees the terminal snapshot immediately.
        let rx = engine.subscribe(&scan_id).unwrap();
        let event = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(event.status, ScanStatus::Completed);
        assert_eq!(event.progress, Some(1.0));
    }
}
