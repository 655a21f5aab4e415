//! Update and repair engine for game installations.
//!
//! Applies incremental update archives (delete-list, binary diffs, new
//! files) to an installation directory, and heals an installation against
//! its `pkg_version` manifest by re-fetching damaged or missing files.

pub mod archive;
pub mod config;
pub mod control;
pub mod diff;
pub mod download;
pub mod error;
pub mod manifest;
pub mod pool;
pub mod reconcile;
pub mod repair;
pub mod update;
pub mod util;

pub use archive::{open_archive, ArchiveReader, ArchiveSource};
pub use config::EngineConfig;
pub use diff::{DiffApplier, DiffTool, Hpatchz, PatchOutcome};
pub use download::{Downloader, FetchOutcome};
pub use error::{Error, FileFailure, Result};
pub use manifest::{Manifest, ManifestEntry};
pub use pool::WorkerPool;
pub use reconcile::{PendingRepairSet, Reconciler, RepairReason};
pub use repair::{RepairSource, RepairTarget, Repairer, ScatteredFiles};
pub use update::{UpdateEngine, UpdateReport};
