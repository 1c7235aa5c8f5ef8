use std::collections::{HashMap, HashSet};
use std::fs::Metadata;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

#[cfg(unix)]
use std::os::unix::fs::MetadataExt;

use crossbeam_channel::Receiver;
use globset::{Glob, GlobSet, GlobSetBuilder};
use jwalk::WalkDir;
use tracing::debug;

use super::hasher::{HashDone, HashJob, spawn_hash_pool};
use super::progress::{WalkCounters, WarningKind, WarningSink};
use crate::cache::FingerprintCache;
use crate::error::{Result, SamefoldError};
use crate::fingerprint::{EqualityMode, FileFingerprint};
use crate::normalize::relative;
use crate::tree::{FolderArena, FolderId};

/// Cancellation token for stopping scans
#[derive(Debug, Clone)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Worker pool size: `min(requested, min(32, 2 x CPU))`, defaulting to the
/// CPU count when no cap was requested.
pub fn worker_count(requested: Option<usize>) -> usize {
    let cpus = num_cpus::get().max(1);
    let ceiling = (cpus * 2).min(32).max(1);
    match requested {
        Some(cap) => cap.clamp(1, ceiling),
        None => cpus.min(ceiling),
    }
}

/// Walker configuration
#[derive(Debug, Clone)]
pub struct WalkOptions {
    /// If non-empty, only matching files emit fingerprints.
    pub include: Vec<String>,
    /// Matching files are skipped; matching directories are pruned whole.
    pub exclude: Vec<String>,
    pub mode: EqualityMode,
    /// Worker pool size, already resolved via [`worker_count`].
    pub workers: usize,
}

/// Build a matcher over root-relative paths. A pattern with a leading `/`
/// anchors at the root; a bare name matches at any depth; a trailing `/`
/// is accepted and ignored (directories prune their whole subtree either
/// way).
pub(crate) fn build_glob_set(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for raw in patterns {
        let anchored = raw.starts_with('/');
        let trimmed = raw.trim_matches('/');
        if trimmed.is_empty() {
            continue;
        }
        let mut expansions = vec![trimmed.to_string(), format!("{trimmed}/**")];
        if !anchored && !trimmed.contains('/') {
            expansions.push(format!("**/{trimmed}"));
            expansions.push(format!("**/{trimmed}/**"));
        }
        for pattern in &expansions {
            let glob = Glob::new(pattern)
                .map_err(|e| SamefoldError::InvalidRequest(format!("bad glob {raw:?}: {e}")))?;
            builder.add(glob);
        }
    }
    builder
        .build()
        .map_err(|e| SamefoldError::InvalidRequest(format!("bad glob set: {e}")))
}

/// Walk the tree under `root`, producing an arena of folders with their
/// direct file fingerprints attached.
///
/// Symlinks are never followed and never emitted. The first occurrence of a
/// `(device, inode)` pair is emitted with its full size; later hard links to
/// the same inode are counted as collapsed aliases and contribute nothing.
/// Emissions for a folder are complete when this function returns, which is
/// what lets the aggregator close folders in post-order afterwards.
pub fn walk(
    root: &Path,
    options: &WalkOptions,
    cache: &Arc<FingerprintCache>,
    counters: &WalkCounters,
    warnings: &Arc<WarningSink>,
    cancel: &CancellationToken,
) -> Result<FolderArena> {
    let include = build_glob_set(&options.include)?;

    let mut arena = FolderArena::new(root.to_path_buf());
    let mut path_to_id: HashMap<PathBuf, FolderId> = HashMap::new();
    path_to_id.insert(root.to_path_buf(), FolderId::ROOT);

    // First-seen inodes for hard link collapsing.
    let mut seen_inodes: HashSet<(u64, u64)> = HashSet::new();

    // Hash pool, only in sha256 mode.
    let mut pool = match options.mode {
        EqualityMode::Sha256 => Some(HashPool::spawn(
            options.workers,
            cache,
            warnings,
            cancel,
        )),
        EqualityMode::NameSize => None,
    };

    let root_for_filter = root.to_path_buf();
    let exclude_for_filter = build_glob_set(&options.exclude)?;
    let cancel_for_filter = cancel.clone();
    let walker = WalkDir::new(root)
        .skip_hidden(false)
        .follow_links(false)
        .sort(true)
        .process_read_dir(move |_depth, _path, _read_dir_state, children| {
            // Drain pending directories without starting new work.
            if cancel_for_filter.is_cancelled() {
                children.clear();
                return;
            }
            children.retain(|entry| {
                let Ok(e) = entry else { return true };
                // Symlinks are skipped entirely: not followed, not emitted.
                if e.file_type().is_symlink() {
                    return false;
                }
                match relative(&e.path(), &root_for_filter) {
                    Some(rel) => !exclude_for_filter.is_match(rel.as_str()),
                    None => true,
                }
            });
        })
        .parallelism(jwalk::Parallelism::RayonNewPool(options.workers));

    let mut cancelled = false;

    for entry_result in walker {
        if cancel.is_cancelled() {
            cancelled = true;
            break;
        }

        let entry = match entry_result {
            Ok(e) => e,
            Err(e) => {
                let path = e
                    .path()
                    .and_then(|p| relative(p, root))
                    .unwrap_or_else(|| root.display().to_string());
                let kind = match e.io_error() {
                    Some(io) if io.kind() == std::io::ErrorKind::PermissionDenied => {
                        WarningKind::Permission
                    }
                    _ => WarningKind::IoError,
                };
                warnings.push(kind, path, e.to_string());
                continue;
            }
        };

        let path = entry.path();
        if path == root {
            continue;
        }
        let Some(rel) = relative(&path, root) else {
            continue;
        };

        let parent_id = match path.parent().and_then(|p| path_to_id.get(p)) {
            Some(&id) => id,
            None => continue, // parent was pruned
        };

        let file_type = entry.file_type();
        if file_type.is_symlink() {
            continue;
        }

        if file_type.is_dir() {
            let name = rel.rsplit('/').next().unwrap_or(&rel).to_string();
            let id = arena.add_folder(name, parent_id);
            path_to_id.insert(path.clone(), id);
            counters.folders_scanned.fetch_add(1, Ordering::Relaxed);
            counters.set_current_path(rel);
            continue;
        }

        // Regular file.
        if !options.include.is_empty() && !include.is_match(rel.as_str()) {
            continue;
        }

        let metadata = match entry.metadata() {
            Ok(m) => m,
            Err(e) => {
                warnings.push(WarningKind::IoError, rel, e.to_string());
                continue;
            }
        };

        let (device, inode, nlink) = file_ids(&metadata);
        if nlink > 1
            && let (Some(device), Some(inode)) = (device, inode)
            && !seen_inodes.insert((device, inode))
        {
            counters.hardlinks_collapsed.fetch_add(1, Ordering::Relaxed);
            continue;
        }

        let mtime = match metadata.modified() {
            Ok(m) => m,
            Err(e) => {
                warnings.push(WarningKind::IoError, rel, e.to_string());
                continue;
            }
        };
        let size = metadata.len();

        match pool.as_mut() {
            None => {
                let fingerprint = FileFingerprint {
                    relative_path: rel.clone(),
                    size,
                    mtime,
                    device,
                    inode,
                    digest: None,
                    unstable: false,
                };
                attach(&mut arena, parent_id, fingerprint, counters);
            }
            Some(pool) => {
                pool.submit(HashJob {
                    folder: parent_id,
                    path: path.clone(),
                    relative_path: rel.clone(),
                    size,
                    mtime,
                    device,
                    inode,
                });
                // Keep the arena warm while workers hash.
                pool.drain_ready(&mut arena, counters);
            }
        }
        counters.set_current_path(rel);
    }

    if let Some(pool) = pool.take() {
        pool.finish(&mut arena, counters);
    }

    if cancelled {
        debug!(root = %root.display(), "walk cancelled");
        return Err(SamefoldError::Cancelled);
    }

    Ok(arena)
}

fn attach(
    arena: &mut FolderArena,
    folder: FolderId,
    fingerprint: FileFingerprint,
    counters: &WalkCounters,
) {
    counters.files_scanned.fetch_add(1, Ordering::Relaxed);
    counters
        .bytes_scanned
        .fetch_add(fingerprint.size, Ordering::Relaxed);
    if let Some(node) = arena.get_mut(folder) {
        node.files.push(fingerprint);
    }
}

fn attach_done(arena: &mut FolderArena, done: HashDone, counters: &WalkCounters) {
    if done.folder_unstable
        && let Some(node) = arena.get_mut(done.folder)
    {
        node.unstable = true;
    }
    if let Some(fingerprint) = done.fingerprint {
        attach(arena, done.folder, fingerprint, counters);
    }
}

struct HashPool {
    jobs: Option<crossbeam_channel::Sender<HashJob>>,
    done: Receiver<HashDone>,
    handles: Vec<std::thread::JoinHandle<()>>,
    sent: u64,
    received: u64,
}

impl HashPool {
    fn spawn(
        workers: usize,
        cache: &Arc<FingerprintCache>,
        warnings: &Arc<WarningSink>,
        cancel: &CancellationToken,
    ) -> Self {
        let (jobs_tx, jobs_rx) = crossbeam_channel::bounded::<HashJob>(workers * 8);
        let (done_tx, done_rx) = crossbeam_channel::unbounded::<HashDone>();
        let handles = spawn_hash_pool(
            workers,
            jobs_rx,
            done_tx,
            Arc::clone(cache),
            Arc::clone(warnings),
            cancel.clone(),
        );
        Self {
            jobs: Some(jobs_tx),
            done: done_rx,
            handles,
            sent: 0,
            received: 0,
        }
    }

    fn submit(&mut self, job: HashJob) {
        if let Some(jobs) = &self.jobs
            && jobs.send(job).is_ok()
        {
            self.sent += 1;
        }
    }

    fn drain_ready(&mut self, arena: &mut FolderArena, counters: &WalkCounters) {
        while let Ok(done) = self.done.try_recv() {
            self.received += 1;
            attach_done(arena, done, counters);
        }
    }

    fn finish(mut self, arena: &mut FolderArena, counters: &WalkCounters) {
        self.jobs.take();
        while self.received < self.sent {
            match self.done.recv() {
                Ok(done) => {
                    self.received += 1;
                    attach_done(arena, done, counters);
                }
                Err(_) => break,
            }
        }
        for handle in self.handles {
            let _ = handle.join();
        }
    }
}

/// Device, inode and link count for hard link collapsing
#[cfg(unix)]
fn file_ids(metadata: &Metadata) -> (Option<u64>, Option<u64>, u64) {
    (Some(metadata.dev()), Some(metadata.ino()), metadata.nlink())
}

/// Windows fallback - no inode identity, hard links are not collapsed
#[cfg(not(unix))]
fn file_ids(_metadata: &Metadata) -> (Option<u64>, Option<u64>, u64) {
    (None, None, 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn walk_all(root: &Path, options: &WalkOptions) -> (FolderArena, Arc<WalkCounters>) {
        let cache = Arc::new(FingerprintCache::open(&root.join(".nonexistent-cache")));
        let counters = Arc::new(WalkCounters::new());
        let warnings = Arc::new(WarningSink::default());
        let cancel = CancellationToken::new();
        let arena = walk(root, options, &cache, &counters, &warnings, &cancel).unwrap();
        (arena, counters)
    }

    fn name_size_options() -> WalkOptions {
        WalkOptions {
            include: Vec::new(),
            exclude: Vec::new(),
            mode: EqualityMode::NameSize,
            workers: 2,
        }
    }

    #[test]
    fn test_worker_count_formula() {
        let cpus = num_cpus::get().max(1);
        assert_eq!(worker_count(None), cpus.min((cpus * 2).min(32)));
        assert_eq!(worker_count(Some(1)), 1);
        assert!(worker_count(Some(1000)) <= 32);
    }

    #[test]
    fn test_walk_collects_files_per_folder() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().canonicalize().unwrap();
        fs::write(root.join("a.txt"), b"aaaa").unwrap();
        fs::create_dir(root.join("sub")).unwrap();
        fs::write(root.join("sub/b.txt"), b"bb").unwrap();

        let (arena, counters) = walk_all(&root, &name_size_options());

        assert_eq!(arena.len(), 2);
        assert_eq!(counters.files(), 2);
        assert_eq!(counters.bytes(), 6);
        assert_eq!(arena.root().files.len(), 1);
        assert_eq!(arena.root().files[0].relative_path, "a.txt");
    }

    #[test]
    fn test_exclude_prunes_directories() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().canonicalize().unwrap();
        fs::create_dir(root.join(".git")).unwrap();
        fs::write(root.join(".git/blob"), b"xxxx").unwrap();
        fs::create_dir(root.join("keep")).unwrap();
        fs::write(root.join("keep/f"), b"yy").unwrap();

        let mut options = name_size_options();
        options.exclude = vec![".git/".to_string()];
        let (arena, counters) = walk_all(&root, &options);

        assert_eq!(counters.files(), 1);
        assert!(arena.iter().all(|n| n.relative_path != ".git"));
    }

    #[test]
    fn test_root_anchored_exclude() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().canonicalize().unwrap();
        fs::create_dir(root.join(".quarantine")).unwrap();
        fs::write(root.join(".quarantine/f"), b"x").unwrap();
        fs::create_dir_all(root.join("nested/.quarantine")).unwrap();
        fs::write(root.join("nested/.quarantine/g"), b"y").unwrap();

        let mut options = name_size_options();
        options.exclude = vec!["/.quarantine/".to_string()];
        let (_, counters) = walk_all(&root, &options);

        // Root-level .quarantine pruned; the nested one is ordinary data.
        assert_eq!(counters.files(), 1);
    }

    #[test]
    fn test_include_limits_emissions() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().canonicalize().unwrap();
        fs::write(root.join("keep.rs"), b"fn").unwrap();
        fs::write(root.join("skip.txt"), b"no").unwrap();

        let mut options = name_size_options();
        options.include = vec!["*.rs".to_string()];
        let (arena, counters) = walk_all(&root, &options);

        assert_eq!(counters.files(), 1);
        assert_eq!(arena.root().files[0].relative_path, "keep.rs");
    }

    #[cfg(unix)]
    #[test]
    fn test_symlinks_are_skipped() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().canonicalize().unwrap();
        fs::write(root.join("real"), b"data").unwrap();
        std::os::unix::fs::symlink(root.join("real"), root.join("link")).unwrap();

        let (arena, counters) = walk_all(&root, &name_size_options());

        assert_eq!(counters.files(), 1);
        assert_eq!(arena.root().files.len(), 1);
        assert_eq!(arena.root().files[0].relative_path, "real");
    }

    #[cfg(unix)]
    #[test]
    fn test_hardlinks_collapse() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().canonicalize().unwrap();
        fs::create_dir(root.join("a")).unwrap();
        fs::write(root.join("a/big"), vec![7u8; 4096]).unwrap();
        fs::hard_link(root.join("a/big"), root.join("a/alias")).unwrap();

        let (arena, counters) = walk_all(&root, &name_size_options());

        assert_eq!(counters.files(), 1);
        assert_eq!(counters.hardlinks(), 1);
        assert_eq!(counters.bytes(), 4096);
        let a = arena.iter().find(|n| n.relative_path == "a").unwrap();
        assert_eq!(a.files.len(), 1);
    }

    #[test]
    fn test_sha256_mode_emits_digests() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().canonicalize().unwrap();
        fs::write(root.join("x"), b"same").unwrap();
        fs::write(root.join("y"), b"same").unwrap();

        let mut options = name_size_options();
        options.mode = EqualityMode::Sha256;
        let (arena, counters) = walk_all(&root, &options);

        assert_eq!(counters.files(), 2);
        let digests: Vec<_> = arena.root().files.iter().map(|f| f.digest).collect();
        assert!(digests[0].is_some());
        assert_eq!(digests[0], digests[1]);
    }

    #[test]
    fn test_cancel_stops_walk() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().canonicalize().unwrap();
        fs::write(root.join("f"), b"x").unwrap();

        let cache = Arc::new(FingerprintCache::open(&root.join(".nope")));
        let counters = Arc::new(WalkCounters::new());
        let warnings = Arc::new(WarningSink::default());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = walk(
            &root,
            &name_size_options(),
            &cache,
            &counters,
            &warnings,
            &cancel,
        );
        assert!(matches!(result, Err(SamefoldError::Cancelled)));
    }
}
