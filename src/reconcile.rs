use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::EngineConfig;
use crate::error::Result;
use crate::manifest::{Manifest, ManifestEntry};
use crate::pool::WorkerPool;
use crate::util::{self, FileEntry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairReason {
    /// Declared file whose size or MD5 differs from the manifest.
    ChecksumMismatch,
    /// Declared file not found on disk.
    Missing,
    /// Undeclared file the filesystem fails to read.
    Unreadable,
}

/// Relative paths that need to be fetched again, with the reason each was flagged.
#[derive(Debug, Clone, Default)]
pub struct PendingRepairSet {
    items: BTreeMap<String, RepairReason>,
}

impl PendingRepairSet {
    fn insert(&mut self, path: String, reason: RepairReason) {
        self.items.entry(path).or_insert(reason);
    }

    pub fn contains(&self, path: &str) -> bool {
        self.items.contains_key(path)
    }

    pub fn reason(&self, path: &str) -> Option<RepairReason> {
        self.items.get(path).copied()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, RepairReason)> {
        self.items.iter().map(|(path, reason)| (path.as_str(), *reason))
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.items.keys().map(String::as_str)
    }
}

/// Compares an installed tree against its manifest.
pub struct Reconciler {
    config: EngineConfig,
    pool: Arc<WorkerPool>,
}

impl Reconciler {
    pub fn new(config: EngineConfig, pool: Arc<WorkerPool>) -> Self {
        Self { config, pool }
    }

    /// Compute the set of files under `install_root` that need repair.
    ///
    /// The walk consumes manifest entries from a working map as it finds
    /// their files, so whatever is left afterwards is missing on disk. Files
    /// without an entry are only checked for readability.
    pub fn reconcile(&self, install_root: &Path, manifest: &Manifest) -> Result<PendingRepairSet> {
        let mut working: HashMap<&str, &ManifestEntry> = manifest
            .iter()
            .filter(|entry| !self.config.is_excluded(&entry.relative_path))
            .map(|entry| (entry.relative_path.as_str(), entry))
            .collect();

        let files = util::walk_files(install_root, |rel| self.config.is_excluded(rel))?;

        let mut declared: Vec<(FileEntry, &ManifestEntry)> = Vec::new();
        let mut undeclared: Vec<FileEntry> = Vec::new();
        for file in files {
            match working.remove(file.relative_path.as_str()) {
                Some(entry) => declared.push((file, entry)),
                None => undeclared.push(file),
            }
        }
        debug!(
            declared = declared.len(),
            undeclared = undeclared.len(),
            missing = working.len(),
            "walked installation"
        );

        let mut pending = PendingRepairSet::default();

        let mismatched = self.pool.run_batch(declared, |(file, entry)| {
            (!matches_entry(&file, entry)).then_some(file.relative_path)
        });
        for path in mismatched.into_iter().flatten() {
            pending.insert(path, RepairReason::ChecksumMismatch);
        }

        for path in find_unreadable(&self.pool, undeclared) {
            pending.insert(path, RepairReason::Unreadable);
        }

        for path in working.into_keys() {
            pending.insert(path.to_string(), RepairReason::Missing);
        }

        info!(
            files = manifest.len(),
            to_repair = pending.len(),
            "reconciliation finished"
        );
        Ok(pending)
    }
}

/// Size first, since it is free from the directory scan; MD5 only when sizes agree.
/// A declared file that can't be hashed counts as a mismatch.
fn matches_entry(file: &FileEntry, entry: &ManifestEntry) -> bool {
    if file.size != entry.size {
        debug!(path = %file.relative_path, "size differs from manifest");
        return false;
    }
    match util::md5_file(&file.full_path) {
        Ok(actual) => actual.eq_ignore_ascii_case(&entry.md5),
        Err(e) => {
            debug!(path = %file.relative_path, error = %e, "failed to hash declared file");
            false
        }
    }
}

fn find_unreadable(pool: &WorkerPool, files: Vec<FileEntry>) -> Vec<String> {
    pool.run_batch(files, |file| match util::check_readable(&file.full_path) {
        Ok(()) => None,
        Err(e) => {
            debug!(path = %file.relative_path, error = %e, "undeclared file is unreadable");
            Some(file.relative_path)
        }
    })
    .into_iter()
    .flatten()
    .collect()
}
