//! Sync operation ledger.
//!
//! One `SyncOperation` is built per top-level download or upload. Paths are
//! relative to the sync root and `/`-separated; each lands in exactly one of
//! the four buckets.

use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::fmt;

use crate::error::SyncError;

/// Classification of a single path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Created,
    Updated,
    Unchanged,
    Deleted,
}

/// Result of a directory sync.
#[derive(Debug, Default)]
pub struct SyncOperation {
    created: Vec<String>,
    updated: Vec<String>,
    unchanged: Vec<String>,
    deleted: Vec<String>,
    errors: BTreeMap<String, SyncError>,
    size: u64,
    seen: HashSet<String>,
}

impl SyncOperation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn created(&self) -> &[String] {
        &self.created
    }

    pub fn updated(&self) -> &[String] {
        &self.updated
    }

    pub fn unchanged(&self) -> &[String] {
        &self.unchanged
    }

    pub fn deleted(&self) -> &[String] {
        &self.deleted
    }

    pub fn errors(&self) -> &BTreeMap<String, SyncError> {
        &self.errors
    }

    /// Bytes transferred, or that would be in a dry run.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Number of classified paths.
    pub fn files(&self) -> usize {
        self.created.len() + self.updated.len() + self.unchanged.len() + self.deleted.len()
    }

    /// Every classified path: deleted, unchanged, updated, then created.
    pub fn all(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        self.deleted
            .iter()
            .chain(&self.unchanged)
            .chain(&self.updated)
            .chain(&self.created)
            .filter(|p| seen.insert(p.as_str()))
            .cloned()
            .collect()
    }

    pub fn contains(&self, path: &str) -> bool {
        self.seen.contains(path)
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Which bucket holds `path`, if any.
    pub fn outcome_of(&self, path: &str) -> Option<Outcome> {
        if !self.seen.contains(path) {
            return None;
        }
        let in_bucket = |bucket: &[String]| bucket.iter().any(|p| p == path);
        if in_bucket(&self.created) {
            Some(Outcome::Created)
        } else if in_bucket(&self.updated) {
            Some(Outcome::Updated)
        } else if in_bucket(&self.unchanged) {
            Some(Outcome::Unchanged)
        } else {
            Some(Outcome::Deleted)
        }
    }

    /// Classify `path`. Returns false if it was already classified.
    pub fn record(&mut self, outcome: Outcome, path: impl Into<String>) -> bool {
        let path = path.into();
        if !self.seen.insert(path.clone()) {
            tracing::warn!("{} already classified, ignoring {:?}", path, outcome);
            return false;
        }
        match outcome {
            Outcome::Created => self.created.push(path),
            Outcome::Updated => self.updated.push(path),
            Outcome::Unchanged => self.unchanged.push(path),
            Outcome::Deleted => self.deleted.push(path),
        }
        true
    }

    /// Record a failure against `path`. The first error for a path wins.
    pub fn record_error(&mut self, path: impl Into<String>, err: SyncError) {
        self.errors.entry(path.into()).or_insert(err);
    }

    pub fn increase_size(&mut self, bytes: u64) {
        self.size += bytes;
    }

    /// Merge a sub-directory result into this one.
    pub fn add(&mut self, sub: SyncOperation) {
        for (outcome, bucket) in [
            (Outcome::Updated, sub.updated),
            (Outcome::Created, sub.created),
            (Outcome::Unchanged, sub.unchanged),
            (Outcome::Deleted, sub.deleted),
        ] {
            for path in bucket {
                self.record(outcome, path);
            }
        }
        for (path, err) in sub.errors {
            self.record_error(path, err);
        }
        self.size += sub.size;
    }

    /// Serializable snapshot.
    pub fn report(&self) -> SyncReport {
        SyncReport {
            created: self.created.clone(),
            updated: self.updated.clone(),
            unchanged: self.unchanged.clone(),
            deleted: self.deleted.clone(),
            errors: self
                .errors
                .iter()
                .map(|(path, err)| (path.clone(), err.to_string()))
                .collect(),
            files: self.files(),
            size: self.size,
        }
    }
}

impl fmt::Display for SyncOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "All: {}, Updated: {}, Created: {}, Unchanged: {}, Deleted: {}, Errors: {}",
            self.files(),
            self.updated.len(),
            self.created.len(),
            self.unchanged.len(),
            self.deleted.len(),
            self.errors.len()
        )
    }
}

/// Plain-data copy of a `SyncOperation` for JSON output.
#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub created: Vec<String>,
    pub updated: Vec<String>,
    pub unchanged: Vec<String>,
    pub deleted: Vec<String>,
    pub errors: BTreeMap<String, String>,
    pub files: usize,
    pub size: u64,
}
