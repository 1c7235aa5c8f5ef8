//! Scan lifecycle types and progress accounting.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::report::ScanReport;
use crate::scanner::ScanWarning;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ScanStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ScanStatus::Completed | ScanStatus::Failed | ScanStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanPhase {
    Walking,
    Aggregating,
    Grouping,
    Done,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ScanStats {
    pub folders_scanned: u64,
    pub files_scanned: u64,
    pub bytes_scanned: u64,
    pub hardlinks_collapsed: u64,
    pub workers: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseMetrics {
    pub phase: ScanPhase,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub bytes_scanned_delta: u64,
    pub folders_processed: u64,
    pub files_processed: u64,
    /// Sampled at phase end; bytes.
    pub peak_rss: u64,
    pub workers_active: usize,
}

impl PhaseMetrics {
    pub fn begin(phase: ScanPhase, workers_active: usize) -> Self {
        Self {
            phase,
            start_time: Utc::now(),
            end_time: None,
            bytes_scanned_delta: 0,
            folders_processed: 0,
            files_processed: 0,
            peak_rss: 0,
            workers_active,
        }
    }
}

/// Lifecycle of one scan job. Owned by the scheduler; observers only ever
/// see cloned snapshots.
#[derive(Debug, Clone, Serialize)]
pub struct ScanState {
    pub scan_id: String,
    pub root_path: PathBuf,
    pub status: ScanStatus,
    pub phase: ScanPhase,
    pub phases: Vec<PhaseMetrics>,
    pub stats: ScanStats,
    pub warnings: Vec<ScanWarning>,
    pub warnings_overflow: u64,
    pub error: Option<String>,
    #[serde(skip)]
    pub report: Option<Arc<ScanReport>>,
}

impl ScanState {
    pub fn new(scan_id: String, root_path: PathBuf) -> Self {
        Self {
            scan_id,
            root_path,
            status: ScanStatus::Pending,
            phase: ScanPhase::Walking,
            phases: Vec::new(),
            stats: ScanStats::default(),
            warnings: Vec::new(),
            warnings_overflow: 0,
            error: None,
            report: None,
        }
    }
}

/// Streaming progress snapshot, copy-on-publish.
#[derive(Debug, Clone, Serialize)]
pub struct ProgressEvent {
    pub scan_id: String,
    pub status: ScanStatus,
    pub phase: ScanPhase,
    pub phases: Vec<PhaseMetrics>,
    pub stats: ScanStats,
    pub warnings: Vec<ScanWarning>,
    pub last_path: Option<String>,
    /// Blended overall fraction; None while indeterminate.
    pub progress: Option<f64>,
    pub eta_seconds: Option<u64>,
}

const WALK_WEIGHT: f64 = 0.55;
const AGGREGATE_WEIGHT: f64 = 0.20;
const GROUP_WEIGHT: f64 = 0.25;

/// Blend per-phase fractions into one overall figure. Walking progress is an
/// approximation and may be unknowable, in which case the overall figure is
/// indeterminate until walking completes.
pub fn blended_progress(
    phase: ScanPhase,
    walk: Option<f64>,
    aggregate: Option<f64>,
    group: Option<f64>,
) -> Option<f64> {
    match phase {
        ScanPhase::Walking => walk.map(|w| WALK_WEIGHT * w.clamp(0.0, 1.0)),
        ScanPhase::Aggregating => Some(
            WALK_WEIGHT + AGGREGATE_WEIGHT * aggregate.unwrap_or(0.0).clamp(0.0, 1.0),
        ),
        ScanPhase::Grouping => Some(
            WALK_WEIGHT
                + AGGREGATE_WEIGHT
                + GROUP_WEIGHT * group.unwrap_or(0.0).clamp(0.0, 1.0),
        ),
        ScanPhase::Done => Some(1.0),
    }
}

/// Files/sec over a sliding window; drives the walking-phase ETA.
#[derive(Debug)]
pub struct ThroughputWindow {
    samples: VecDeque<(Instant, u64)>,
    window: Duration,
}

impl ThroughputWindow {
    pub fn new(window: Duration) -> Self {
        Self {
            samples: VecDeque::new(),
            window,
        }
    }

    pub fn record(&mut self, files: u64) {
        let now = Instant::now();
        self.samples.push_back((now, files));
        while let Some(&(t, _)) = self.samples.front() {
            if now.duration_since(t) > self.window && self.samples.len() > 2 {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    /// Files per second over the retained window.
    pub fn rate(&self) -> Option<f64> {
        let (&(t0, f0), &(t1, f1)) = (self.samples.front()?, self.samples.back()?);
        let elapsed = t1.duration_since(t0).as_secs_f64();
        if elapsed <= 0.0 || f1 <= f0 {
            return None;
        }
        Some((f1 - f0) as f64 / elapsed)
    }

    pub fn eta_seconds(&self, expected_total: u64, current: u64) -> Option<u64> {
        let rate = self.rate()?;
        if current >= expected_total {
            return None;
        }
        Some(((expected_total - current) as f64 / rate).round() as u64)
    }
}

/// Peak resident set size of this process, in bytes.
#[cfg(unix)]
pub fn peak_rss_bytes() -> u64 {
    // SAFETY: getrusage only writes into the struct we hand it.
    let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::getrusage(libc::RUSAGE_SELF, &mut usage) };
    if rc != 0 {
        return 0;
    }
    let max = usage.ru_maxrss.max(0) as u64;
    // ru_maxrss is KiB on Linux, bytes on macOS.
    if cfg!(target_os = "macos") { max } else { max * 1024 }
}

#[cfg(not(unix))]
pub fn peak_rss_bytes() -> u64 {
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blended_progress_weights() {
        fn approx(value: Option<f64>, expected: f64) -> bool {
            value.is_some_and(|v| (v - expected).abs() < 1e-9)
        }

        assert!(approx(
            blended_progress(ScanPhase::Walking, Some(1.0), None, None),
            0.55
        ));
        assert_eq!(blended_progress(ScanPhase::Walking, None, None, None), None);
        assert!(approx(
            blended_progress(ScanPhase::Aggregating, None, Some(0.5), None),
            0.65
        ));
        assert!(approx(
            blended_progress(ScanPhase::Grouping, None, None, Some(1.0)),
            1.0
        ));
        assert_eq!(blended_progress(ScanPhase::Done, None, None, None), Some(1.0));
    }

    #[test]
    fn test_throughput_window_rate() {
        let mut window = ThroughputWindow::new(Duration::from_secs(10));
        window.record(0);
        std::thread::sleep(Duration::from_millis(50));
        window.record(100);
        let rate = window.rate().unwrap();
        assert!(rate > 0.0);
        assert!(window.eta_seconds(200, 100).is_some());
        assert!(window.eta_seconds(50, 100).is_none());
    }

    #[test]
    fn test_status_terminal() {
        assert!(!ScanStatus::Pending.is_terminal());
        assert!(!ScanStatus::Running.is_terminal());
        assert!(ScanStatus::Completed.is_terminal());
        assert!(ScanStatus::Cancelled.is_terminal());
    }

    #[cfg(unix)]
    #[test]
    fn test_peak_rss_positive() {
        assert!(peak_rss_bytes() > 0);
    }
}
