//! Tree walking.
//!
//! `walk` drives a `FileVisitor` over a remote tree, `walk_local` drives a
//! `LocalVisitor` over a local one. Both follow the same protocol:
//!
//! - a directory gets `pre_visit_directory`; anything but `Continue` is
//!   returned as-is and the directory is not entered;
//! - each child is visited in listing order: files through `visit_file`,
//!   directories recursively;
//! - a file result other than `Continue` / `SkipSubtree` leaves the
//!   directory at once, without its post-visit;
//! - `SkipSiblings` from a child directory ends this directory's listing,
//!   `Terminate` ends the whole walk;
//! - `post_visit_directory` runs last, with the error that cut the listing
//!   short, if any.
//!
//! Symlinks are never followed below the starting point.

use std::fs;
use std::path::{Path, PathBuf};

use crate::backend::RemoteFs;
use crate::error::{Result, SyncError};
use crate::file::{system_time_secs, RemoteFile};
use crate::path::join_relative;

/// What a visitor wants the walk to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VisitResult {
    Continue,
    /// Stop the whole walk.
    Terminate,
    /// Do not enter this directory.
    SkipSubtree,
    /// Ignore the remaining entries of the enclosing directory.
    SkipSiblings,
}

// =============================================================================
// Remote walk
// =============================================================================

/// Callbacks for `walk`. Every method defaults to `Continue`.
pub trait FileVisitor {
    fn pre_visit_directory(&mut self, _dir: &RemoteFile) -> Result<VisitResult> {
        Ok(VisitResult::Continue)
    }

    fn visit_file(&mut self, _file: &RemoteFile) -> Result<VisitResult> {
        Ok(VisitResult::Continue)
    }

    /// `error` is the failure that ended the listing early. The default
    /// returns it.
    fn post_visit_directory(&mut self, _dir: &RemoteFile, error: Option<SyncError>) -> Result<VisitResult> {
        match error {
            Some(e) => Err(e),
            None => Ok(VisitResult::Continue),
        }
    }
}

/// Walk the remote tree rooted at `path`.
pub fn walk<F, V>(fs: &F, path: &str, visitor: &mut V) -> Result<VisitResult>
where
    F: RemoteFs + ?Sized,
    V: FileVisitor + ?Sized,
{
    let root = fs.stat(path)?;
    visit_remote(fs, root, visitor)
}

fn visit_remote<F, V>(fs: &F, node: RemoteFile, visitor: &mut V) -> Result<VisitResult>
where
    F: RemoteFs + ?Sized,
    V: FileVisitor + ?Sized,
{
    if !node.is_dir() {
        return visitor.visit_file(&node);
    }

    let pre = visitor.pre_visit_directory(&node)?;
    if pre != VisitResult::Continue {
        return Ok(pre);
    }

    let mut failure = None;
    match fs.directory(node.path(), None) {
        Err(e) => failure = Some(e),
        Ok(children) => {
            for child in children {
                let child = match child {
                    Ok(child) => child,
                    Err(e) => {
                        failure = Some(e);
                        break;
                    }
                };
                if child.is_dir() {
                    match visit_remote(fs, child, visitor)? {
                        VisitResult::Terminate => return Ok(VisitResult::Terminate),
                        VisitResult::SkipSiblings => break,
                        VisitResult::Continue | VisitResult::SkipSubtree => {}
                    }
                } else {
                    match visitor.visit_file(&child)? {
                        VisitResult::Continue | VisitResult::SkipSubtree => {}
                        other => return Ok(other),
                    }
                }
            }
        }
    }

    match visitor.post_visit_directory(&node, failure)? {
        VisitResult::SkipSubtree => Ok(VisitResult::Continue),
        other => Ok(other),
    }
}

// =============================================================================
// Local walk
// =============================================================================

/// A local entry met by `walk_local`.
#[derive(Debug, Clone)]
pub struct LocalEntry {
    pub path: PathBuf,
    /// `/`-separated path below the walk root; empty for the root itself.
    pub relative: String,
    pub metadata: fs::Metadata,
}

impl LocalEntry {
    pub fn name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    pub fn is_root(&self) -> bool {
        self.relative.is_empty()
    }

    pub fn is_dir(&self) -> bool {
        self.metadata.is_dir()
    }

    pub fn is_file(&self) -> bool {
        self.metadata.is_file()
    }

    pub fn size(&self) -> u64 {
        self.metadata.len()
    }

    pub fn mtime_secs(&self) -> i64 {
        local_mtime_secs(&self.metadata)
    }
}

pub(crate) fn local_mtime_secs(meta: &fs::Metadata) -> i64 {
    meta.modified().map(system_time_secs).unwrap_or(0)
}

/// Callbacks for `walk_local`.
pub trait LocalVisitor {
    fn pre_visit_directory(&mut self, _dir: &LocalEntry) -> Result<VisitResult> {
        Ok(VisitResult::Continue)
    }

    fn visit_file(&mut self, _file: &LocalEntry) -> Result<VisitResult> {
        Ok(VisitResult::Continue)
    }

    fn post_visit_directory(&mut self, _dir: &LocalEntry, error: Option<SyncError>) -> Result<VisitResult> {
        match error {
            Some(e) => Err(e),
            None => Ok(VisitResult::Continue),
        }
    }
}

/// Walk the local tree rooted at `root`. The root itself is followed if it
/// is a symlink; nothing below it is.
pub fn walk_local<V: LocalVisitor + ?Sized>(root: &Path, visitor: &mut V) -> Result<VisitResult> {
    let metadata = fs::metadata(root).map_err(|e| SyncError::io("stat", root, e))?;
    let entry = LocalEntry {
        path: root.to_path_buf(),
        relative: String::new(),
        metadata,
    };
    visit_local(entry, visitor)
}

fn visit_local<V: LocalVisitor + ?Sized>(node: LocalEntry, visitor: &mut V) -> Result<VisitResult> {
    if !node.is_dir() {
        return visitor.visit_file(&node);
    }

    let pre = visitor.pre_visit_directory(&node)?;
    if pre != VisitResult::Continue {
        return Ok(pre);
    }

    let mut failure = None;
    match read_local_dir(&node.path, &node.relative) {
        Err(e) => failure = Some(e),
        Ok(children) => {
            for child in children {
                if child.is_dir() {
                    match visit_local(child, visitor)? {
                        VisitResult::Terminate => return Ok(VisitResult::Terminate),
                        VisitResult::SkipSiblings => break,
                        VisitResult::Continue | VisitResult::SkipSubtree => {}
                    }
                } else {
                    match visitor.visit_file(&child)? {
                        VisitResult::Continue | VisitResult::SkipSubtree => {}
                        other => return Ok(other),
                    }
                }
            }
        }
    }

    match visitor.post_visit_directory(&node, failure)? {
        VisitResult::SkipSubtree => Ok(VisitResult::Continue),
        other => Ok(other),
    }
}

/// Children of a local directory sorted by name, symlinks not followed.
pub(crate) fn read_local_dir(dir: &Path, relative: &str) -> Result<Vec<LocalEntry>> {
    let mut entries = Vec::new();
    for entry in fs::read_dir(dir).map_err(|e| SyncError::io("list", dir, e))? {
        let entry = entry.map_err(|e| SyncError::io("list", dir, e))?;
        let path = entry.path();
        let metadata = fs::symlink_metadata(&path).map_err(|e| SyncError::io("stat", &path, e))?;
        let name = entry.file_name().to_string_lossy().into_owned();
        entries.push(LocalEntry {
            relative: join_relative(relative, &name),
            path,
            metadata,
        });
    }
    entries.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(entries)
}

/// Every path below `dir`, deepest first, as `relative`-prefixed ledger paths.
pub(crate) fn local_subtree(dir: &Path, relative: &str) -> Result<Vec<String>> {
    let walker = ignore::WalkBuilder::new(dir)
        .standard_filters(false)
        .follow_links(false)
        .sort_by_file_name(|a, b| a.cmp(b))
        .build();

    let mut found = Vec::new();
    for entry in walker {
        let entry = entry.map_err(|e| SyncError::Iteration(e.to_string()))?;
        if entry.depth() == 0 {
            continue;
        }
        let Ok(below) = entry.path().strip_prefix(dir) else {
            continue;
        };
        let below = below
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/");
        found.push(join_relative(relative, &below));
    }
    found.reverse();
    Ok(found)
}

/// Every path below the remote directory `dir`, deepest first.
pub(crate) fn remote_subtree<F: RemoteFs + ?Sized>(fs: &F, dir: &str, relative: &str) -> Result<Vec<String>> {
    struct Collect<'a> {
        root: &'a str,
        relative: &'a str,
        found: Vec<String>,
    }

    impl Collect<'_> {
        fn push(&mut self, path: &str) {
            let below = path
                .strip_prefix(self.root)
                .unwrap_or(path)
                .trim_start_matches('/');
            if !below.is_empty() {
                self.found.push(join_relative(self.relative, below));
            }
        }
    }

    impl FileVisitor for Collect<'_> {
        fn pre_visit_directory(&mut self, dir: &RemoteFile) -> Result<VisitResult> {
            self.push(dir.path());
            Ok(VisitResult::Continue)
        }

        fn visit_file(&mut self, file: &RemoteFile) -> Result<VisitResult> {
            self.push(file.path());
            Ok(VisitResult::Continue)
        }
    }

    let mut collect = Collect {
        root: dir.trim_end_matches('/'),
        relative,
        found: Vec::new(),
    };
    walk(fs, dir, &mut collect)?;
    collect.found.reverse();
    Ok(collect.found)
}
