//! Integration tests for directory download and upload
//!
//! Every scenario runs against a `LocalBackend` twice: once with raw
//! handles and once push-only, so both streaming paths are covered.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use filetime::FileTime;
use remsync::{
    Capabilities, Engine, Handle, LocalBackend, OpenFlags, Outcome, RemoteFile, RemoteFs, Result,
    StatusCode, SyncError, SyncOperation, SyncOptions,
};
use tempfile::TempDir;

struct Env {
    remote: TempDir,
    local: TempDir,
    engine: Engine<LocalBackend>,
}

fn env(raw_handles: bool) -> Env {
    let remote = TempDir::new().unwrap();
    let local = TempDir::new().unwrap();
    let backend = LocalBackend::new(remote.path())
        .unwrap()
        .with_raw_handles(raw_handles);
    Env {
        engine: Engine::new(Arc::new(backend)),
        remote,
        local,
    }
}

fn write_at(path: &Path, data: &[u8], mtime: i64) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(path, data).unwrap();
    filetime::set_file_mtime(path, FileTime::from_unix_time(mtime, 0)).unwrap();
}

fn sorted(paths: &[String]) -> Vec<String> {
    let mut v = paths.to_vec();
    v.sort();
    v
}

/// Relative paths of every regular file under `root`, sorted.
fn file_tree(root: &Path) -> Vec<(String, Vec<u8>)> {
    let mut out = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in fs::read_dir(&dir).unwrap() {
            let entry = entry.unwrap();
            let path = entry.path();
            if entry.file_type().unwrap().is_dir() {
                stack.push(path);
            } else {
                let rel = path.strip_prefix(root).unwrap().to_string_lossy().replace('\\', "/");
                out.push((rel, fs::read(&path).unwrap()));
            }
        }
    }
    out.sort();
    out
}

/// Every directory and file under `root` with file contents, sorted.
fn snapshot(root: &Path) -> Vec<(String, Option<Vec<u8>>)> {
    let mut out = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in fs::read_dir(&dir).unwrap() {
            let path = entry.unwrap().path();
            let rel = path.strip_prefix(root).unwrap().to_string_lossy().replace('\\', "/");
            if fs::symlink_metadata(&path).unwrap().is_dir() {
                out.push((rel, None));
                stack.push(path);
            } else {
                out.push((rel, Some(fs::read(&path).unwrap())));
            }
        }
    }
    out.sort();
    out
}

/// A dry run and the commit after it must classify every path the same way.
fn assert_same_plan(dry: &SyncOperation, commit: &SyncOperation) {
    assert_eq!(sorted(dry.created()), sorted(commit.created()));
    assert_eq!(sorted(dry.updated()), sorted(commit.updated()));
    assert_eq!(sorted(dry.unchanged()), sorted(commit.unchanged()));
    assert_eq!(sorted(dry.deleted()), sorted(commit.deleted()));
    assert_eq!(sorted(&dry.all()), sorted(&commit.all()));
    assert_eq!(
        dry.errors().keys().collect::<Vec<_>>(),
        commit.errors().keys().collect::<Vec<_>>()
    );
    assert_eq!(dry.size(), commit.size());
}

fn populate(root: &Path) {
    write_at(&root.join("a.txt"), b"alpha", 1_600_000_000);
    write_at(&root.join("docs/readme.md"), b"# readme", 1_600_000_100);
    write_at(&root.join("docs/deep/notes.txt"), &vec![7u8; 100_000], 1_600_000_200);
    fs::create_dir_all(root.join("empty")).unwrap();
}

// =============================================================================
// Download
// =============================================================================

#[test]
fn test_download_flat_sync_example() {
    for raw in [true, false] {
        let e = env(raw);
        write_at(&e.local.path().join("a.txt"), b"0123456789", 1_000_000);
        write_at(&e.local.path().join("b.txt"), b"bee", 1_000_000);
        write_at(&e.remote.path().join("a.txt"), b"0123456789", 1_000_000);
        write_at(&e.remote.path().join("c.txt"), b"sea", 1_000_500);

        let op = e
            .engine
            .download("/", e.local.path(), SyncOptions::new(false, true, true))
            .unwrap();

        assert_eq!(op.unchanged(), ["a.txt"]);
        assert_eq!(op.created(), ["c.txt"]);
        assert_eq!(op.deleted(), ["b.txt"]);
        assert!(op.updated().is_empty());
        assert_eq!(op.files(), 3);
        assert_eq!(op.size(), 3);
        assert!(!op.has_errors());

        assert!(!e.local.path().join("b.txt").exists());
        assert_eq!(fs::read(e.local.path().join("c.txt")).unwrap(), b"sea");
    }
}

#[test]
fn test_download_mirrors_tree_and_is_idempotent() {
    for raw in [true, false] {
        let e = env(raw);
        populate(e.remote.path());

        let first = e
            .engine
            .download("/", e.local.path(), SyncOptions::default())
            .unwrap();
        assert_eq!(
            sorted(first.created()),
            ["a.txt", "docs/deep/notes.txt", "docs/readme.md"]
        );
        assert_eq!(first.size(), 5 + 8 + 100_000);
        assert_eq!(file_tree(e.local.path()), file_tree(e.remote.path()));
        assert!(e.local.path().join("empty").is_dir());

        let second = e
            .engine
            .download("/", e.local.path(), SyncOptions::default())
            .unwrap();
        assert!(second.created().is_empty());
        assert!(second.updated().is_empty());
        assert_eq!(second.unchanged().len(), 3);
        assert_eq!(second.size(), 0);
    }
}

#[test]
fn test_download_detects_updates_by_size_and_mtime() {
    let e = env(true);
    write_at(&e.remote.path().join("same.txt"), b"1234", 2_000);
    write_at(&e.remote.path().join("grown.txt"), b"12345", 2_000);
    write_at(&e.remote.path().join("touched.txt"), b"1234", 3_000);
    write_at(&e.local.path().join("same.txt"), b"abcd", 2_000);
    write_at(&e.local.path().join("grown.txt"), b"1234", 2_000);
    write_at(&e.local.path().join("touched.txt"), b"1234", 2_000);

    let op = e
        .engine
        .download("/", e.local.path(), SyncOptions::default())
        .unwrap();
    // Same size and mtime counts as unchanged even with different bytes.
    assert_eq!(op.unchanged(), ["same.txt"]);
    assert_eq!(sorted(op.updated()), ["grown.txt", "touched.txt"]);
    assert_eq!(fs::read(e.local.path().join("same.txt")).unwrap(), b"abcd");
    assert_eq!(fs::read(e.local.path().join("grown.txt")).unwrap(), b"12345");
}

#[test]
fn test_download_dry_run_touches_nothing() {
    for raw in [true, false] {
        let e = env(raw);
        populate(e.remote.path());
        write_at(&e.local.path().join("stale.txt"), b"old", 1_000);
        let target = e.local.path().join("mirror");
        fs::create_dir(&target).unwrap();
        write_at(&target.join("stale.txt"), b"old", 1_000);
        let before = file_tree(e.local.path());

        let op = e
            .engine
            .download("/", &target, SyncOptions::new(true, true, false))
            .unwrap();
        assert_eq!(op.created().len(), 3);
        assert_eq!(op.deleted(), ["stale.txt"]);
        assert_eq!(file_tree(e.local.path()), before);

        let applied = e
            .engine
            .download("/", &target, SyncOptions::new(true, true, true))
            .unwrap();
        assert_eq!(sorted(&applied.all()), sorted(&op.all()));
        assert_eq!(applied.size(), op.size());
    }
}

#[test]
fn test_download_dry_run_into_missing_directory() {
    let e = env(true);
    populate(e.remote.path());
    let target = e.local.path().join("not-there");

    let op = e
        .engine
        .download("/", &target, SyncOptions::new(true, true, false))
        .unwrap();
    assert_eq!(op.created().len(), 3);
    assert!(op.deleted().is_empty());
    assert!(!target.exists());
}

#[test]
fn test_download_sync_deletes_local_subtree_deepest_first() {
    let e = env(true);
    write_at(&e.remote.path().join("keep.txt"), b"k", 1_000);
    write_at(&e.local.path().join("keep.txt"), b"k", 1_000);
    write_at(&e.local.path().join("gone/inner/x.txt"), b"x", 1_000);

    let op = e
        .engine
        .download("/", e.local.path(), SyncOptions::new(true, true, true))
        .unwrap();
    assert_eq!(op.deleted(), ["gone/inner/x.txt", "gone/inner", "gone"]);
    assert!(!e.local.path().join("gone").exists());
    assert!(e.local.path().join("keep.txt").exists());
}

#[test]
fn test_download_without_sync_keeps_extras() {
    let e = env(false);
    write_at(&e.remote.path().join("a.txt"), b"a", 1_000);
    write_at(&e.local.path().join("extra.txt"), b"e", 1_000);

    let op = e
        .engine
        .download("/", e.local.path(), SyncOptions::new(true, false, true))
        .unwrap();
    assert!(op.deleted().is_empty());
    assert!(e.local.path().join("extra.txt").exists());
}

#[test]
fn test_download_local_dir_replaced_by_remote_file() {
    let e = env(true);
    write_at(&e.remote.path().join("thing"), b"now a file", 1_000);
    write_at(&e.local.path().join("thing/old.txt"), b"o", 1_000);

    let op = e
        .engine
        .download("/", e.local.path(), SyncOptions::default())
        .unwrap();
    assert_eq!(op.updated(), ["thing"]);
    assert_eq!(fs::read(e.local.path().join("thing")).unwrap(), b"now a file");
}

#[test]
fn test_download_missing_remote_is_error() {
    let e = env(true);
    let err = e
        .engine
        .download("/nope", e.local.path(), SyncOptions::default())
        .unwrap_err();
    assert!(err.is_not_found());
}

// =============================================================================
// Upload
// =============================================================================

#[test]
fn test_upload_mirrors_tree_and_is_idempotent() {
    for raw in [true, false] {
        let e = env(raw);
        populate(e.local.path());

        let first = e
            .engine
            .upload(e.local.path(), "/dest", SyncOptions::default())
            .unwrap();
        assert_eq!(
            sorted(first.created()),
            ["a.txt", "docs/deep/notes.txt", "docs/readme.md"]
        );
        assert!(!first.has_errors());
        let dest = e.remote.path().join("dest");
        assert_eq!(file_tree(&dest), file_tree(e.local.path()));
        assert!(dest.join("empty").is_dir());

        let second = e
            .engine
            .upload(e.local.path(), "/dest", SyncOptions::default())
            .unwrap();
        assert!(second.created().is_empty());
        assert!(second.updated().is_empty());
        assert_eq!(second.unchanged().len(), 3);
    }
}

#[test]
fn test_upload_dry_run_touches_nothing() {
    for raw in [true, false] {
        let e = env(raw);
        populate(e.local.path());

        let op = e
            .engine
            .upload(e.local.path(), "/dest", SyncOptions::new(true, true, false))
            .unwrap();
        assert_eq!(op.created().len(), 3);
        assert!(!e.remote.path().join("dest").exists());
        assert!(e.engine.fs().list_dir("/").unwrap().is_empty());
    }
}

#[test]
fn test_upload_without_recurse_stays_at_top_level() {
    let e = env(true);
    populate(e.local.path());

    let op = e
        .engine
        .upload(e.local.path(), "/", SyncOptions::new(false, false, true))
        .unwrap();
    assert_eq!(op.created(), ["a.txt"]);
    assert!(!e.remote.path().join("docs").exists());
}

#[test]
fn test_upload_sync_deletes_remote_extras() {
    let e = env(false);
    write_at(&e.local.path().join("keep.txt"), b"k", 1_000);
    write_at(&e.remote.path().join("keep.txt"), b"k", 1_000);
    write_at(&e.remote.path().join("stale.txt"), b"s", 1_000);
    write_at(&e.remote.path().join("old/x.txt"), b"x", 1_000);

    let op = e
        .engine
        .upload(e.local.path(), "/", SyncOptions::new(true, true, true))
        .unwrap();
    assert_eq!(op.unchanged(), ["keep.txt"]);
    assert_eq!(sorted(op.deleted()), ["old", "old/x.txt", "stale.txt"]);
    let old = op.deleted().iter().position(|p| p == "old").unwrap();
    let inner = op.deleted().iter().position(|p| p == "old/x.txt").unwrap();
    assert!(inner < old);
    assert!(!e.remote.path().join("old").exists());
    assert!(!e.remote.path().join("stale.txt").exists());
}

#[test]
fn test_upload_remote_file_replaced_by_directory() {
    let e = env(true);
    write_at(&e.local.path().join("sub/inner.txt"), b"i", 1_000);
    write_at(&e.remote.path().join("sub"), b"was a file", 1_000);

    let op = e
        .engine
        .upload(e.local.path(), "/", SyncOptions::default())
        .unwrap();
    assert_eq!(op.deleted(), ["sub"]);
    assert_eq!(op.created(), ["sub/inner.txt"]);
    assert!(e.remote.path().join("sub").is_dir());
    assert_eq!(fs::read(e.remote.path().join("sub/inner.txt")).unwrap(), b"i");
}

#[test]
fn test_upload_dry_run_over_remote_file_matches_commit() {
    for raw in [true, false] {
        let e = env(raw);
        write_at(&e.local.path().join("sub/inner.txt"), b"i", 1_000);
        write_at(&e.local.path().join("sub/nested/more.txt"), b"m", 1_000);
        write_at(&e.remote.path().join("sub"), b"was a file", 1_000);
        let before = snapshot(e.remote.path());

        let options = |commit| SyncOptions::new(true, true, commit);
        let dry = e.engine.upload(e.local.path(), "/", options(false)).unwrap();
        assert_eq!(snapshot(e.remote.path()), before);
        assert!(!dry.has_errors());
        assert_eq!(dry.deleted(), ["sub"]);
        assert_eq!(sorted(dry.created()), ["sub/inner.txt", "sub/nested/more.txt"]);

        let commit = e.engine.upload(e.local.path(), "/", options(true)).unwrap();
        assert_same_plan(&dry, &commit);
        assert!(e.remote.path().join("sub/nested/more.txt").is_file());
    }
}

#[test]
fn test_upload_dry_run_matches_commit() {
    for raw in [true, false] {
        let e = env(raw);
        let local = e.local.path();
        let remote = e.remote.path();

        write_at(&local.join("same.txt"), b"same", 1_000);
        write_at(&remote.join("same.txt"), b"same", 1_000);
        write_at(&local.join("changed.txt"), b"new contents", 2_000);
        write_at(&remote.join("changed.txt"), b"old", 1_000);
        write_at(&local.join("item"), b"file now", 1_000);
        write_at(&remote.join("item/nested/x.txt"), b"x", 1_000);
        write_at(&local.join("sub/inner.txt"), b"i", 1_000);
        write_at(&remote.join("sub"), b"was a file", 1_000);
        write_at(&local.join("fresh/deeper/d.txt"), b"d", 1_000);
        write_at(&remote.join("stale.txt"), b"s", 1_000);
        write_at(&remote.join("old/gone/y.txt"), b"y", 1_000);
        let before = snapshot(remote);

        let options = |commit| SyncOptions::new(true, true, commit);
        let dry = e.engine.upload(local, "/", options(false)).unwrap();
        assert_eq!(snapshot(remote), before);
        assert!(!dry.has_errors());
        assert_eq!(dry.unchanged(), ["same.txt"]);
        assert_eq!(sorted(dry.updated()), ["changed.txt", "item"]);
        assert_eq!(
            sorted(dry.created()),
            ["fresh/deeper/d.txt", "sub/inner.txt"]
        );
        assert_eq!(
            sorted(dry.deleted()),
            ["old", "old/gone", "old/gone/y.txt", "stale.txt", "sub"]
        );

        let commit = e.engine.upload(local, "/", options(true)).unwrap();
        assert_same_plan(&dry, &commit);
        assert_eq!(snapshot(remote), snapshot(local));
    }
}

/// Local backend whose `remove` always fails.
struct StickyFs(LocalBackend);

impl RemoteFs for StickyFs {
    fn capabilities(&self) -> Capabilities {
        self.0.capabilities()
    }

    fn stat(&self, path: &str) -> Result<RemoteFile> {
        self.0.stat(path)
    }

    fn lstat(&self, path: &str) -> Result<RemoteFile> {
        self.0.lstat(path)
    }

    fn list_dir(&self, path: &str) -> Result<Vec<RemoteFile>> {
        self.0.list_dir(path)
    }

    fn open_handle(&self, path: &str, flags: OpenFlags, permissions: u32) -> Result<Box<dyn Handle>> {
        self.0.open_handle(path, flags, permissions)
    }

    fn mkdir(&self, path: &str, permissions: u32) -> Result<()> {
        self.0.mkdir(path, permissions)
    }

    fn remove(&self, path: &str) -> Result<()> {
        Err(SyncError::status(StatusCode::PermissionDenied, path))
    }

    fn remove_dir(&self, path: &str) -> Result<()> {
        self.0.remove_dir(path)
    }

    fn rename(&self, from: &str, to: &str) -> Result<()> {
        self.0.rename(from, to)
    }

    fn chmod(&self, path: &str, permissions: u32) -> Result<()> {
        self.0.chmod(path, permissions)
    }

    fn set_mod_time(&self, path: &str, modified: std::time::SystemTime) -> Result<()> {
        self.0.set_mod_time(path, modified)
    }
}

#[test]
fn test_upload_failed_remote_removal_is_not_deleted() {
    let remote = TempDir::new().unwrap();
    let local = TempDir::new().unwrap();
    let engine = Engine::new(Arc::new(StickyFs(LocalBackend::new(remote.path()).unwrap())));
    write_at(&local.path().join("sub/inner.txt"), b"i", 1_000);
    write_at(&remote.path().join("sub"), b"in the way", 1_000);
    write_at(&remote.path().join("stale.txt"), b"s", 1_000);

    let op = engine
        .upload(local.path(), "/", SyncOptions::new(true, true, true))
        .unwrap();
    assert!(op.deleted().is_empty());
    assert_eq!(
        op.errors().keys().map(String::as_str).collect::<Vec<_>>(),
        ["stale.txt", "sub"]
    );
    assert!(remote.path().join("stale.txt").is_file());
    assert!(remote.path().join("sub").is_file());
}

#[test]
fn test_upload_remote_directory_replaced_by_file() {
    let e = env(true);
    write_at(&e.local.path().join("item"), b"file now", 1_000);
    write_at(&e.remote.path().join("item/nested/x.txt"), b"x", 1_000);

    let op = e
        .engine
        .upload(e.local.path(), "/", SyncOptions::default())
        .unwrap();
    assert_eq!(op.updated(), ["item"]);
    assert_eq!(fs::read(e.remote.path().join("item")).unwrap(), b"file now");
}

#[test]
fn test_upload_onto_remote_file_root_fails() {
    let e = env(true);
    write_at(&e.local.path().join("a.txt"), b"a", 1_000);
    write_at(&e.remote.path().join("target"), b"t", 1_000);

    let err = e
        .engine
        .upload(e.local.path(), "/target", SyncOptions::default())
        .unwrap_err();
    assert_eq!(err.code(), Some(remsync::StatusCode::NotADirectory));
}

#[test]
fn test_upload_of_missing_local_directory_fails() {
    let e = env(true);
    let missing = e.local.path().join("nothing");
    assert!(e
        .engine
        .upload(&missing, "/", SyncOptions::default())
        .is_err());
}

// =============================================================================
// Round trips
// =============================================================================

#[test]
fn test_upload_then_download_round_trip() {
    for raw in [true, false] {
        let e = env(raw);
        let source = TempDir::new().unwrap();
        populate(source.path());

        e.engine
            .upload(source.path(), "/backup", SyncOptions::default())
            .unwrap();
        let op = e
            .engine
            .download("/backup", e.local.path(), SyncOptions::default())
            .unwrap();
        assert_eq!(op.created().len(), 3);
        assert_eq!(file_tree(e.local.path()), file_tree(source.path()));

        // Timestamps survive both legs, so the reverse direction is a no-op.
        let back = e
            .engine
            .upload(e.local.path(), "/backup", SyncOptions::new(true, true, true))
            .unwrap();
        assert_eq!(back.unchanged().len(), 3);
        assert!(back.deleted().is_empty());
        assert_eq!(back.outcome_of("docs/readme.md"), Some(Outcome::Unchanged));
    }
}
