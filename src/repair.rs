//! Whole-file replacement from a remote source.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::download::{Downloader, FetchOutcome};
use crate::error::{Error, FileFailure, Result};
use crate::manifest::{Manifest, PKG_VERSION};
use crate::pool::WorkerPool;
use crate::reconcile::{PendingRepairSet, Reconciler};
use crate::util;

/// Maps an installation-relative path to the URL it can be fetched from.
pub trait RepairSource: Send + Sync {
    fn url_for(&self, relative_path: &str) -> String;
}

/// Files published one by one under a common base URL.
#[derive(Debug, Clone)]
pub struct ScatteredFiles {
    base_url: String,
}

impl ScatteredFiles {
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url = base_url.into();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

impl RepairSource for ScatteredFiles {
    fn url_for(&self, relative_path: &str) -> String {
        format!("{}/{}", self.base_url, relative_path.trim_start_matches('/'))
    }
}

/// One file to replace, with what the replacement must look like when known.
#[derive(Debug, Clone)]
pub struct RepairTarget {
    /// Name used when reporting failures.
    pub name: String,
    pub path: PathBuf,
    pub url: String,
    pub md5: Option<String>,
    pub size: Option<u64>,
}

impl RepairTarget {
    pub fn new(path: impl Into<PathBuf>, url: impl Into<String>) -> Self {
        let path = path.into();
        Self {
            name: util::to_forward_slashes(&path),
            path,
            url: url.into(),
            md5: None,
            size: None,
        }
    }
}

#[derive(Debug, Default)]
pub struct RepairReport {
    pub repaired: Vec<String>,
}

/// Result of healing a whole installation.
#[derive(Debug)]
pub struct InstallationRepair {
    pub pending: PendingRepairSet,
    pub report: RepairReport,
}

/// Fetches files to replace local ones, keeping a `.bak` of the previous
/// copy until the replacement is verified and in place.
pub struct Repairer {
    downloader: Downloader,
    pool: Arc<WorkerPool>,
    config: EngineConfig,
}

impl Repairer {
    pub fn new(config: EngineConfig, pool: Arc<WorkerPool>) -> Self {
        Self {
            downloader: Downloader::new(&config),
            pool,
            config,
        }
    }

    pub fn repair_one(&self, target: &Path, url: &str) -> Result<()> {
        self.repair_target(&RepairTarget::new(target, url))
    }

    pub fn repair_target(&self, target: &RepairTarget) -> Result<()> {
        let path = &target.path;
        let backup = util::backup_path(path);
        let had_original = path.is_file();
        if had_original {
            util::rename(path, &backup)?;
        }

        match self.replace(target) {
            Ok(()) => {
                if had_original {
                    util::remove_file_if_exists(&backup)?;
                }
                debug!(file = %path.display(), "repaired");
                Ok(())
            }
            Err(e) => {
                if had_original {
                    if let Err(restore) = util::restore_backup(&backup, path) {
                        warn!(file = %path.display(), error = %restore, "failed to restore backup");
                    }
                }
                Err(Error::Repair {
                    path: path.clone(),
                    source: Box::new(e),
                })
            }
        }
    }

    /// Download into the partial file, verify it, then move it over the target.
    fn replace(&self, target: &RepairTarget) -> Result<()> {
        let partial = util::partial_path(&target.path);
        util::ensure_parent(&partial)?;

        match self.downloader.fetch(&target.url, &partial)? {
            FetchOutcome::AlreadyComplete => {
                debug!(file = %target.path.display(), "partial download was already complete");
            }
            FetchOutcome::Downloaded { bytes, resumed_from } => {
                debug!(file = %target.path.display(), bytes, resumed_from, "downloaded");
            }
        }

        if let Err(e) = verify(&partial, target) {
            util::remove_file_if_exists(&partial)?;
            return Err(e);
        }
        util::rename(&partial, &target.path)
    }

    /// Repair every target on the worker pool. Failures are collected, never
    /// short-circuited.
    pub fn repair_many(&self, targets: Vec<RepairTarget>) -> Result<RepairReport> {
        let total = targets.len();
        let results = self.pool.run_batch(targets, |target| {
            let outcome = self.repair_target(&target);
            (target.name, outcome)
        });

        let mut report = RepairReport::default();
        let mut failures = Vec::new();
        for (name, outcome) in results {
            match outcome {
                Ok(()) => report.repaired.push(name),
                Err(e) => failures.push(FileFailure::new(name, e)),
            }
        }

        info!(total, repaired = report.repaired.len(), failed = failures.len(), "repair batch finished");
        if !failures.is_empty() {
            return Err(Error::AggregateRepair(failures));
        }
        Ok(report)
    }

    /// Reconcile `install_root` against its `pkg_version` and repair whatever
    /// is damaged or missing.
    ///
    /// A missing `pkg_version` is fetched through `source` first; if that
    /// fails there is nothing to compare against and the installation has to
    /// be reinstalled.
    pub fn repair_installation(
        &self,
        install_root: &Path,
        source: &dyn RepairSource,
    ) -> Result<InstallationRepair> {
        let manifest = self.load_or_fetch_manifest(install_root, source)?;

        let reconciler = Reconciler::new(self.config.clone(), Arc::clone(&self.pool));
        let pending = reconciler.reconcile(install_root, &manifest)?;

        let mut targets = Vec::with_capacity(pending.len());
        for relative in pending.paths() {
            let Some(path) = util::resolve_within(install_root, relative) else {
                warn!(path = relative, "manifest entry resolves outside the installation, skipping");
                continue;
            };
            let entry = manifest.get(relative);
            targets.push(RepairTarget {
                name: relative.to_string(),
                path,
                url: source.url_for(relative),
                md5: entry.map(|e| e.md5.clone()),
                size: entry.map(|e| e.size),
            });
        }

        let report = self.repair_many(targets)?;
        Ok(InstallationRepair { pending, report })
    }

    fn load_or_fetch_manifest(&self, install_root: &Path, source: &dyn RepairSource) -> Result<Manifest> {
        if let Some(manifest) = Manifest::load(install_root)? {
            return Ok(manifest);
        }

        warn!(root = %install_root.display(), "{PKG_VERSION} missing, fetching it");
        let path = install_root.join(PKG_VERSION);
        if let Err(e) = self.repair_one(&path, &source.url_for(PKG_VERSION)) {
            return Err(Error::ReinstallRequired(format!(
                "{PKG_VERSION} is missing and could not be fetched: {e}"
            )));
        }
        Manifest::load(install_root)?.ok_or_else(|| {
            Error::ReinstallRequired(format!("{PKG_VERSION} is still missing after download"))
        })
    }
}

fn verify(file: &Path, target: &RepairTarget) -> Result<()> {
    if let Some(expected) = target.size {
        let actual = std::fs::metadata(file).map_err(|e| Error::io(file, e))?.len();
        if actual != expected {
            return Err(Error::SizeMismatch { expected, actual });
        }
    }
    if let Some(expected) = &target.md5 {
        let actual = util::md5_file(file)?;
        if !actual.eq_ignore_ascii_case(expected) {
            return Err(Error::ChecksumMismatch {
                path: target.path.clone(),
                expected: expected.clone(),
                actual,
            });
        }
    }
    Ok(())
}
