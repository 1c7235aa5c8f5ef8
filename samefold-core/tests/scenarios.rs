//! End-to-end scenarios over real fixture trees.

use std::fs;
use std::path::{Path, PathBuf};

use samefold_core::{
    Engine, EqualityMode, GroupInfo, GroupLabel, ScanRequest, ScanStatus, StructurePolicy,
};
use tempfile::TempDir;

struct Fixture {
    _data: TempDir,
    _state: TempDir,
    engine: Engine,
    root: PathBuf,
}

fn fixture(build: impl FnOnce(&Path)) -> Fixture {
    let data = TempDir::new().unwrap();
    build(data.path());
    let state = TempDir::new().unwrap();
    let engine = Engine::new(state.path()).unwrap();
    let root = data.path().canonicalize().unwrap();
    Fixture {
        _data: data,
        _state: state,
        engine,
        root,
    }
}

fn scan(fixture: &Fixture, configure: impl FnOnce(&mut ScanRequest)) -> String {
    let mut request = ScanRequest::new(fixture.root.clone());
    configure(&mut request);
    let scan_id = fixture.engine.submit(request).unwrap();
    let state = fixture.engine.wait(&scan_id).unwrap();
    assert_eq!(state.status, ScanStatus::Completed, "{:?}", state.error);
    scan_id
}

fn write(root: &Path, rel: &str, bytes: &[u8]) {
    let path = root.join(rel);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, bytes).unwrap();
}

fn member_paths(group: &GroupInfo) -> Vec<&str> {
    group
        .members
        .iter()
        .map(|m| m.relative_path.as_str())
        .collect()
}

fn group_of<'a>(groups: &'a [GroupInfo], member: &str) -> Option<&'a GroupInfo> {
    groups
        .iter()
        .find(|g| g.members.iter().any(|m| m.relative_path == member))
}

#[test]
fn nested_identical_folders_form_one_group_with_shallowest_canonical() {
    let fx = fixture(|root| {
        write(root, "x/f", &[7u8; 1024]);
        write(root, "a/x/f", &[7u8; 1024]);
        write(root, "b/nested/x/f", &[7u8; 1024]);
    });
    let scan_id = scan(&fx, |_| {});
    let report = fx.engine.report(&scan_id).unwrap();

    let group = group_of(&report.groups, "x").expect("x group");
    assert_eq!(group.label, GroupLabel::Identical);
    assert_eq!(member_paths(group), vec!["x", "a/x", "b/nested/x"]);
    assert_eq!(group.canonical().relative_path, "x");
    // One group, and nothing else in it: root, a, b and b/nested all stay
    // out. The a/b-nested shell around the x copies is suppressed.
    assert_eq!(report.groups.len(), 1);
    assert!(group_of(&report.groups, ".").is_none());
    assert!(group_of(&report.groups, "a").is_none());
    assert!(group_of(&report.groups, "b").is_none());
    assert!(group_of(&report.groups, "b/nested").is_none());
}

#[test]
fn threshold_demotes_or_drops_partial_copies() {
    let fx = fixture(|root| {
        write(root, "x/f", &[7u8; 1024]);
        write(root, "a/x/f", &[7u8; 1024]);
        write(root, "b/nested/x/f", &[7u8; 1024]);
        write(root, "c/x/f", &[7u8; 1024]);
        write(root, "c/x/extra", &[9u8; 512]);
    });

    // sim(x, c/x) = 1024 / 1536; below that threshold all four group and
    // the extra file demotes the label.
    let lenient = scan(&fx, |request| request.similarity_threshold = 0.60);
    let report = fx.engine.report(&lenient).unwrap();
    let group = group_of(&report.groups, "c/x").expect("lenient group");
    assert_eq!(group.label, GroupLabel::NearDuplicate);
    assert_eq!(group.members.len(), 4);
    assert_eq!(group.canonical().relative_path, "x");

    // At the default threshold c/x drops out and the rest are identical.
    let strict = scan(&fx, |_| {});
    let report = fx.engine.report(&strict).unwrap();
    let group = group_of(&report.groups, "x").expect("strict group");
    assert_eq!(group.label, GroupLabel::Identical);
    assert_eq!(member_paths(group), vec!["x", "a/x", "b/nested/x"]);
    assert!(group_of(&report.groups, "c/x").is_none());
    assert!(group_of(&report.groups, "a").is_none());
}

#[test]
fn empty_folders_never_group() {
    let fx = fixture(|root| {
        fs::create_dir_all(root.join("empty_a")).unwrap();
        fs::create_dir_all(root.join("empty_b")).unwrap();
        fs::create_dir_all(root.join("empty_c/subdir")).unwrap();
    });
    let scan_id = scan(&fx, |_| {});
    let report = fx.engine.report(&scan_id).unwrap();
    assert!(report.groups.is_empty());
}

#[test]
fn parent_group_suppresses_child_groups() {
    let fx = fixture(|root| {
        write(root, "x/a/f1", &[1u8; 100]);
        write(root, "x/b/f2", &[2u8; 200]);
        write(root, "y/a/f1", &[1u8; 100]);
        write(root, "y/b/f2", &[2u8; 200]);
    });
    let scan_id = scan(&fx, |_| {});
    let report = fx.engine.report(&scan_id).unwrap();

    assert_eq!(report.groups.len(), 1);
    let group = &report.groups[0];
    assert_eq!(member_paths(group), vec!["x", "y"]);
    assert!(group.suppressed_descendants);
}

#[cfg(unix)]
#[test]
fn hardlink_aliases_collapse_to_one_weight() {
    let fx = fixture(|root| {
        write(root, "a/big", &[5u8; 8192]);
        write(root, "b/big", &[5u8; 8192]);
    });
    fs::hard_link(fx.root.join("a/big"), fx.root.join("a/alias")).unwrap();

    let scan_id = scan(&fx, |request| {
        request.file_equality = EqualityMode::Sha256;
        request.structure_policy = StructurePolicy::BagOfFiles;
    });
    let report = fx.engine.report(&scan_id).unwrap();
    let record = fx.engine.record(&scan_id).unwrap();

    let a = record.store.get("a").unwrap().unwrap();
    assert_eq!(a.total_bytes, 8192, "alias contributes no extra weight");
    assert_eq!(a.file_count, 1);
    assert_eq!(report.stats.hardlinks_collapsed, 1);

    // With the alias collapsed, a and b are byte- and count-identical.
    let group = group_of(&report.groups, "a").expect("hardlink group");
    assert_eq!(group.label, GroupLabel::Identical);
    assert_eq!(member_paths(group), vec!["a", "b"]);
}

#[test]
fn sha256_bag_of_files_matches_renamed_content() {
    let fx = fixture(|root| {
        write(root, "left/photo_001.jpg", b"the very same bytes");
        write(root, "right/renamed.jpg", b"the very same bytes");
        write(root, "other/different.jpg", b"entirely other bytes!");
    });

    // Under relative name_size keys the rename hides the duplicate.
    let strict = scan(&fx, |_| {});
    let report = fx.engine.report(&strict).unwrap();
    assert!(group_of(&report.groups, "left").is_none());

    // Content identity plus bag-of-files sees through it.
    let by_content = scan(&fx, |request| {
        request.file_equality = EqualityMode::Sha256;
        request.structure_policy = StructurePolicy::BagOfFiles;
    });
    let report = fx.engine.report(&by_content).unwrap();
    let group = group_of(&report.groups, "left").expect("content group");
    assert_eq!(member_paths(group), vec!["left", "right"]);
    assert!(group_of(&report.groups, "other").is_none());
}

#[test]
fn warm_cache_rescan_reproduces_folder_fingerprints() {
    let fx = fixture(|root| {
        write(root, "x/f", &[3u8; 4096]);
        write(root, "y/f", &[3u8; 4096]);
    });

    let cold = scan(&fx, |request| request.file_equality = EqualityMode::Sha256);
    let warm = scan(&fx, |request| request.file_equality = EqualityMode::Sha256);

    let cold_record = fx.engine.record(&cold).unwrap();
    let warm_record = fx.engine.record(&warm).unwrap();
    for rel in ["x", "y", "."] {
        let a = cold_record.store.get(rel).unwrap().unwrap();
        let b = warm_record.store.get(rel).unwrap().unwrap();
        assert_eq!(a.fingerprint_hash, b.fingerprint_hash, "{rel}");
        assert_eq!(
            a.file_weights[0].digest, b.file_weights[0].digest,
            "warm digests must equal cold digests"
        );
    }
}

#[test]
fn mtime_change_invalidates_cache_and_rehashing_agrees() {
    let fx = fixture(|root| {
        write(root, "x/f", &[3u8; 1024]);
        write(root, "y/f", &[3u8; 1024]);
    });

    let first = scan(&fx, |request| request.file_equality = EqualityMode::Sha256);
    // Touch one file: the cache key no longer matches, forcing a re-hash of
    // unchanged content.
    filetime::set_file_mtime(
        fx.root.join("x/f"),
        filetime::FileTime::from_unix_time(1_600_000_000, 0),
    )
    .unwrap();
    let second = scan(&fx, |request| request.file_equality = EqualityMode::Sha256);

    let a = fx.engine.record(&first).unwrap();
    let b = fx.engine.record(&second).unwrap();
    let before = a.store.get("x").unwrap().unwrap();
    let after = b.store.get("x").unwrap().unwrap();
    assert_eq!(before.file_weights[0].digest, after.file_weights[0].digest);
    assert_eq!(before.fingerprint_hash, after.fingerprint_hash);
}

#[test]
fn default_excludes_skip_noise_directories() {
    let fx = fixture(|root| {
        write(root, "src/main.rs", b"fn main() {}");
        write(root, ".git/objects/blob", &[0u8; 2048]);
        write(root, "node_modules/pkg/index.js", b"module.exports = 1");
        write(root, "sub/.DS_Store", &[1u8; 64]);
    });
    let scan_id = scan(&fx, |_| {});
    let report = fx.engine.report(&scan_id).unwrap();

    assert_eq!(report.stats.files_scanned, 1);
    let record = fx.engine.record(&scan_id).unwrap();
    assert!(record.store.get(".git").unwrap().is_none());
    assert!(record.store.get("node_modules").unwrap().is_none());
}

#[test]
fn deletion_roundtrip_preserves_quarantined_tree() {
    let fx = fixture(|root| {
        write(root, "keep/f", &[1u8; 512]);
        write(root, "dupe/f", &[1u8; 512]);
    });
    let scan_id = scan(&fx, |request| request.deletion_enabled = true);
    let report = fx.engine.report(&scan_id).unwrap();
    let group = group_of(&report.groups, "dupe").expect("group");
    let victim = group.members[1].relative_path.clone();
    assert_ne!(victim, group.canonical().relative_path);

    let plan = fx.engine.plan_deletion(&scan_id, &[victim.clone()]).unwrap();
    let outcome = fx
        .engine
        .confirm_deletion(&plan.plan_id, &plan.token)
        .unwrap();

    assert_eq!(outcome.moved.len(), 1);
    let quarantined = &outcome.moved[0].quarantine_path;
    assert!(quarantined.join("f").exists());
    assert_eq!(fs::metadata(quarantined.join("f")).unwrap().len(), 512);
    assert!(!fx.root.join(&victim).exists());

    // A rescan no longer sees the quarantined folder: the quarantine
    // directory is excluded by default.
    let rescan = scan(&fx, |_| {});
    let report = fx.engine.report(&rescan).unwrap();
    assert!(report.groups.is_empty());
}
