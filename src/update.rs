//! Applies update archives and full install archives to an installation.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::archive::{open_archive, ArchiveReader, ArchiveSource};
use crate::config::EngineConfig;
use crate::control::{control_entry_names, ControlPlan, DiffPair};
use crate::diff::{DiffApplier, DiffTool, Hpatchz, PatchOutcome};
use crate::error::{Error, FileFailure, Result};
use crate::pool::WorkerPool;
use crate::repair::{RepairSource, Repairer};
use crate::util;

/// What happened to every file an update touched.
#[derive(Debug, Default)]
pub struct UpdateReport {
    pub deleted: Vec<String>,
    /// Paths refused because they resolve outside the installation.
    pub refused: Vec<String>,
    pub patched: Vec<String>,
    /// Files rebuilt by the repair fallback after their patch or extraction failed.
    pub repaired: Vec<String>,
    /// Diff targets whose source was not installed.
    pub skipped: Vec<String>,
    /// Files left at their previous version because patching and repair both failed.
    pub unverified: Vec<String>,
    pub extracted: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    /// Nothing to delete.
    Missing,
    /// Path resolves outside the installation or onto its root.
    Refused,
}

/// Delete one installation-relative path, never reaching outside `install_root`.
pub fn delete_within(install_root: &Path, relative: &str) -> Result<DeleteOutcome> {
    let Some(path) = util::resolve_within(install_root, relative) else {
        warn!(path = relative, "refusing to delete path outside the installation");
        return Ok(DeleteOutcome::Refused);
    };
    if util::remove_file_if_exists(&path)? {
        Ok(DeleteOutcome::Deleted)
    } else {
        Ok(DeleteOutcome::Missing)
    }
}

struct DiffJob {
    target_name: String,
    source: PathBuf,
    target: PathBuf,
    patch_entry: String,
    patch_file: PathBuf,
}

struct RepairBinding {
    repairer: Arc<Repairer>,
    source: Arc<dyn RepairSource>,
}

impl RepairBinding {
    fn repair(&self, path: &Path, relative: &str) -> Result<()> {
        self.repairer.repair_one(path, &self.source.url_for(relative))
    }
}

/// Drives archive extraction, deletion and diff application for one installation.
pub struct UpdateEngine {
    pool: Arc<WorkerPool>,
    diff_tool: Arc<dyn DiffTool>,
    repair: Option<RepairBinding>,
}

impl UpdateEngine {
    pub fn new(pool: Arc<WorkerPool>, diff_tool: Arc<dyn DiffTool>) -> Self {
        Self {
            pool,
            diff_tool,
            repair: None,
        }
    }

    /// Engine that patches with the configured `hpatchz` executable.
    pub fn from_config(config: &EngineConfig, pool: Arc<WorkerPool>) -> Self {
        Self::new(pool, Arc::new(Hpatchz::new(config.hpatchz.clone())))
    }

    /// Enable repair fallbacks: files that fail to patch or extract are
    /// fetched from `source` when an update runs with `auto_repair`.
    pub fn with_repair(mut self, repairer: Arc<Repairer>, source: Arc<dyn RepairSource>) -> Self {
        self.repair = Some(RepairBinding { repairer, source });
        self
    }

    /// Apply an update archive to `install_root`.
    ///
    /// Phases run strictly one after another: control entries, deletions,
    /// patch extraction into `scratch_dir`, diff application, plain extraction.
    /// A malformed plan aborts before anything is touched. Per-file failures
    /// do not stop the other files and are returned together as
    /// [`Error::PartialFailure`].
    pub fn apply_update_archive(
        &self,
        archive: impl Into<ArchiveSource>,
        install_root: &Path,
        scratch_dir: &Path,
        auto_repair: bool,
    ) -> Result<UpdateReport> {
        let mut archive = open_archive(archive)?;
        info!(entries = archive.entries().len(), format = ?archive.format(), "opened update archive");

        let control_names = control_entry_names();
        let plan = ControlPlan::from_entries(&archive.read_entries(&control_names)?)?;
        let mut plain: BTreeSet<String> = archive
            .entries()
            .iter()
            .filter(|name| !control_names.contains(*name))
            .cloned()
            .collect();

        let mut report = UpdateReport::default();
        let mut failures = Vec::new();

        for relative in &plan.delete_list {
            match delete_within(install_root, relative) {
                Ok(DeleteOutcome::Deleted) => report.deleted.push(relative.clone()),
                Ok(DeleteOutcome::Missing) => debug!(path = %relative, "already absent"),
                Ok(DeleteOutcome::Refused) => report.refused.push(relative.clone()),
                Err(e) => failures.push(FileFailure::new(relative.clone(), e)),
            }
        }

        let jobs = self.plan_diff_jobs(
            &*archive,
            &plan,
            install_root,
            scratch_dir,
            &mut plain,
            &mut report,
            &mut failures,
        );
        let jobs = self.extract_patches(&mut *archive, jobs, scratch_dir, &mut report, &mut failures)?;
        self.run_diff_jobs(jobs, auto_repair, &mut report, &mut failures);

        let extraction = archive.extract(&plain, install_root, &self.pool)?;
        report.extracted = extraction.extracted;
        report.refused.extend(extraction.refused);
        self.settle_extraction_failures(
            extraction.failures,
            install_root,
            auto_repair,
            &mut report,
            &mut failures,
        );
        drop(archive);

        for path in &report.unverified {
            warn!(path = %path, "file could not be patched or repaired and is unverified");
        }
        info!(
            deleted = report.deleted.len(),
            patched = report.patched.len(),
            repaired = report.repaired.len(),
            skipped = report.skipped.len(),
            unverified = report.unverified.len(),
            extracted = report.extracted.len(),
            failed = failures.len(),
            "update finished"
        );

        if !failures.is_empty() {
            return Err(Error::PartialFailure(failures));
        }
        Ok(report)
    }

    /// Extract every entry of a full install archive into `install_root`.
    pub fn install_archive(
        &self,
        archive: impl Into<ArchiveSource>,
        install_root: &Path,
    ) -> Result<UpdateReport> {
        std::fs::create_dir_all(install_root).map_err(|e| Error::io(install_root, e))?;
        let mut archive = open_archive(archive)?;
        let names: BTreeSet<String> = archive.entries().iter().cloned().collect();
        info!(entries = names.len(), format = ?archive.format(), "installing archive");

        let extraction = archive.extract(&names, install_root, &self.pool)?;
        if !extraction.failures.is_empty() {
            return Err(Error::PartialFailure(extraction.failures));
        }
        Ok(UpdateReport {
            extracted: extraction.extracted,
            refused: extraction.refused,
            ..UpdateReport::default()
        })
    }

    /// Turn the diff map into jobs. Every patch entry named by the map is
    /// removed from the plain set, including those that end up skipped.
    ///
    /// Jobs of one batch never share a path: a pair repeated verbatim is
    /// planned once, and a pair touching a path another queued job already
    /// owns fails on its own.
    #[allow(clippy::too_many_arguments)]
    fn plan_diff_jobs(
        &self,
        archive: &dyn ArchiveReader,
        plan: &ControlPlan,
        install_root: &Path,
        scratch_dir: &Path,
        plain: &mut BTreeSet<String>,
        report: &mut UpdateReport,
        failures: &mut Vec<FileFailure>,
    ) -> Vec<DiffJob> {
        let mut jobs = Vec::new();
        let mut seen: HashSet<&DiffPair> = HashSet::new();
        let mut claimed: HashSet<PathBuf> = HashSet::new();
        for pair in &plan.diff_map {
            let patch_entry = pair.patch_entry();
            plain.remove(&patch_entry);
            if !seen.insert(pair) {
                debug!(target = %pair.target, "duplicate diff pair");
                continue;
            }

            let resolved = (
                util::resolve_within(install_root, &pair.source),
                util::resolve_within(install_root, &pair.target),
                util::resolve_within(scratch_dir, &patch_entry),
            );
            let (Some(source), Some(target), Some(patch_file)) = resolved else {
                warn!(source = %pair.source, target = %pair.target, "refusing diff pair outside the installation");
                report.refused.push(pair.target.clone());
                continue;
            };
            if !source.is_file() {
                debug!(source = %pair.source, "source not installed, skipping patch");
                report.skipped.push(pair.target.clone());
                continue;
            }
            if !archive.contains(&patch_entry) {
                failures.push(FileFailure::new(pair.target.clone(), Error::MissingEntry(patch_entry)));
                continue;
            }
            if claimed.contains(&source) || claimed.contains(&target) {
                failures.push(FileFailure::new(
                    pair.target.clone(),
                    Error::archive_format(format!(
                        "diff pair {} -> {} overlaps another pair",
                        pair.source, pair.target
                    )),
                ));
                continue;
            }
            claimed.insert(source.clone());
            claimed.insert(target.clone());
            jobs.push(DiffJob {
                target_name: pair.target.clone(),
                source,
                target,
                patch_entry,
                patch_file,
            });
        }
        jobs
    }

    /// Extract all queued patches into the scratch directory in one batch.
    /// Jobs whose patch could not be extracted become failures.
    fn extract_patches(
        &self,
        archive: &mut dyn ArchiveReader,
        jobs: Vec<DiffJob>,
        scratch_dir: &Path,
        report: &mut UpdateReport,
        failures: &mut Vec<FileFailure>,
    ) -> Result<Vec<DiffJob>> {
        if jobs.is_empty() {
            return Ok(jobs);
        }
        std::fs::create_dir_all(scratch_dir).map_err(|e| Error::io(scratch_dir, e))?;

        let names: BTreeSet<String> = jobs.iter().map(|job| job.patch_entry.clone()).collect();
        let extraction = archive.extract(&names, scratch_dir, &self.pool)?;
        let mut failed: HashMap<String, Error> = extraction
            .failures
            .into_iter()
            .map(|failure| (failure.path, failure.error))
            .collect();
        let refused: BTreeSet<String> = extraction.refused.into_iter().collect();

        let mut ready = Vec::with_capacity(jobs.len());
        for job in jobs {
            if let Some(error) = failed.remove(&job.patch_entry) {
                failures.push(FileFailure::new(job.target_name, error));
            } else if refused.contains(&job.patch_entry) {
                report.refused.push(job.target_name);
            } else {
                ready.push(job);
            }
        }
        Ok(ready)
    }

    fn run_diff_jobs(
        &self,
        jobs: Vec<DiffJob>,
        auto_repair: bool,
        report: &mut UpdateReport,
        failures: &mut Vec<FileFailure>,
    ) {
        let applier = DiffApplier::new(self.diff_tool.as_ref());
        let repair = self.repair.as_ref().filter(|_| auto_repair);

        let results = self.pool.run_batch(jobs, |job| {
            let outcome = match repair {
                Some(binding) => {
                    let fallback = |path: &Path| binding.repair(path, &job.target_name);
                    applier.apply(&job.source, &job.target, &job.patch_file, Some(&fallback))
                }
                None => applier.apply(&job.source, &job.target, &job.patch_file, None),
            };
            (job.target_name, outcome)
        });

        for (name, outcome) in results {
            match outcome {
                Ok(PatchOutcome::Patched) => report.patched.push(name),
                Ok(PatchOutcome::Skipped) => report.skipped.push(name),
                Ok(PatchOutcome::Repaired) => report.repaired.push(name),
                Ok(PatchOutcome::Unverified) => report.unverified.push(name),
                Err(e) => failures.push(FileFailure::new(name, e)),
            }
        }
    }

    /// Entries that failed to extract are fetched through the repair source
    /// when allowed; otherwise they are reported as they are.
    fn settle_extraction_failures(
        &self,
        extraction_failures: Vec<FileFailure>,
        install_root: &Path,
        auto_repair: bool,
        report: &mut UpdateReport,
        failures: &mut Vec<FileFailure>,
    ) {
        let Some(binding) = self.repair.as_ref().filter(|_| auto_repair) else {
            failures.extend(extraction_failures);
            return;
        };

        let results = self.pool.run_batch(extraction_failures, |failure| {
            let Some(path) = util::resolve_within(install_root, &failure.path) else {
                return Err(failure);
            };
            warn!(entry = %failure.path, error = %failure.error, "extraction failed, repairing");
            match binding.repair(&path, &failure.path) {
                Ok(()) => Ok(failure.path),
                Err(e) => Err(FileFailure::new(failure.path, e)),
            }
        });
        for result in results {
            match result {
                Ok(name) => report.repaired.push(name),
                Err(failure) => failures.push(failure),
            }
        }
    }
}
