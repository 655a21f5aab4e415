use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing_subscriber::EnvFilter;

use repatch::reconcile::Reconciler;
use repatch::{
    EngineConfig, Manifest, RepairSource, Repairer, ScatteredFiles, UpdateEngine, UpdateReport,
    WorkerPool,
};

#[derive(Parser)]
#[command(name = "repatch", about = "Game installation updater and repairer")]
struct Cli {
    #[command(flatten)]
    engine: EngineArgs,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct EngineArgs {
    /// JSON engine configuration
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Worker threads (defaults to available parallelism)
    #[arg(long, global = true)]
    workers: Option<usize>,
    /// Path to the hpatchz executable
    #[arg(long, global = true)]
    hpatchz: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply an update archive to an installation
    Update {
        /// Installation directory
        #[arg(long)]
        install_root: PathBuf,
        /// Update archive (zip or tar, optionally gzip/zstd compressed)
        #[arg(long, short)]
        archive: PathBuf,
        /// Directory for extracted patches (defaults to <install-root>/.repatch)
        #[arg(long)]
        scratch: Option<PathBuf>,
        /// Base URL individual files can be fetched from when patching fails
        #[arg(long)]
        repair_url: Option<String>,
        /// Never fall back to downloading files
        #[arg(long)]
        no_auto_repair: bool,
    },
    /// Extract a full install archive
    Install {
        #[arg(long)]
        install_root: PathBuf,
        #[arg(long, short)]
        archive: PathBuf,
    },
    /// Check an installation against its pkg_version
    Verify {
        #[arg(long)]
        install_root: PathBuf,
    },
    /// Re-fetch damaged or missing files
    Repair {
        #[arg(long)]
        install_root: PathBuf,
        /// Base URL individual files are published under
        #[arg(long)]
        repair_url: String,
    },
}

impl EngineArgs {
    fn load(&self) -> Result<EngineConfig> {
        let mut config = match &self.config {
            Some(path) => EngineConfig::load(path)
                .with_context(|| format!("Failed to load config: {}", path.display()))?,
            None => EngineConfig::default(),
        };
        if let Some(workers) = self.workers {
            config.workers = workers;
        }
        if let Some(hpatchz) = &self.hpatchz {
            config.hpatchz = hpatchz.clone();
        }
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = cli.engine.load()?;
    let pool = Arc::new(WorkerPool::from_config(&config)?);

    match cli.command {
        Commands::Update {
            install_root,
            archive,
            scratch,
            repair_url,
            no_auto_repair,
        } => {
            println!("Applying update...");
            println!("  Install root: {}", install_root.display());
            println!("  Archive: {}", archive.display());

            let owned_scratch = scratch.is_none();
            let scratch = scratch.unwrap_or_else(|| install_root.join(".repatch"));
            let mut engine = UpdateEngine::from_config(&config, Arc::clone(&pool));
            if let Some(url) = repair_url {
                let repairer = Arc::new(Repairer::new(config.clone(), Arc::clone(&pool)));
                engine = engine.with_repair(repairer, Arc::new(ScatteredFiles::new(url)));
            }

            let start = Instant::now();
            let report = tokio::task::spawn_blocking(move || {
                let report =
                    engine.apply_update_archive(archive, &install_root, &scratch, !no_auto_repair);
                if owned_scratch {
                    let _ = std::fs::remove_dir_all(&scratch);
                }
                report
            })
            .await
            .context("Update task panicked")??;
            let elapsed = start.elapsed();

            println!("\nUpdate applied successfully!");
            print_report(&report);
            println!("  Time elapsed: {:.3}s", elapsed.as_secs_f64());
        }
        Commands::Install {
            install_root,
            archive,
        } => {
            println!("Installing...");
            println!("  Install root: {}", install_root.display());
            println!("  Archive: {}", archive.display());

            let engine = UpdateEngine::from_config(&config, Arc::clone(&pool));
            let start = Instant::now();
            let report =
                tokio::task::spawn_blocking(move || engine.install_archive(archive, &install_root))
                    .await
                    .context("Install task panicked")??;
            let elapsed = start.elapsed();

            println!("\nInstalled successfully!");
            println!("  Files extracted: {}", report.extracted.len());
            println!("  Entries refused: {}", report.refused.len());
            println!("  Time elapsed: {:.3}s", elapsed.as_secs_f64());
        }
        Commands::Verify { install_root } => {
            println!("Verifying {}...", install_root.display());

            let start = Instant::now();
            let reconciler = Reconciler::new(config.clone(), Arc::clone(&pool));
            let root = install_root.clone();
            let (files, pending) = tokio::task::spawn_blocking(move || -> Result<_> {
                let manifest = load_manifest(&root)?;
                let pending = reconciler.reconcile(&root, &manifest)?;
                Ok((manifest.len(), pending))
            })
            .await
            .context("Verify task panicked")??;
            let elapsed = start.elapsed();

            println!("\nVerification finished.");
            println!("  Files declared: {files}");
            println!("  Files needing repair: {}", pending.len());
            for (path, reason) in pending.iter() {
                println!("    {path} ({reason:?})");
            }
            println!("  Time elapsed: {:.3}s", elapsed.as_secs_f64());
        }
        Commands::Repair {
            install_root,
            repair_url,
        } => {
            println!("Repairing {}...", install_root.display());
            println!("  Source: {repair_url}");

            let repairer = Repairer::new(config.clone(), Arc::clone(&pool));
            let source: Arc<dyn RepairSource> = Arc::new(ScatteredFiles::new(repair_url));
            let start = Instant::now();
            let result = tokio::task::spawn_blocking(move || {
                repairer.repair_installation(&install_root, source.as_ref())
            })
            .await
            .context("Repair task panicked")??;
            let elapsed = start.elapsed();

            println!("\nRepair finished successfully!");
            println!("  Files flagged: {}", result.pending.len());
            println!("  Files repaired: {}", result.report.repaired.len());
            println!("  Time elapsed: {:.3}s", elapsed.as_secs_f64());
        }
    }

    Ok(())
}

fn load_manifest(root: &Path) -> Result<Manifest> {
    Manifest::load(root)?
        .with_context(|| format!("No pkg_version in {}", root.display()))
}

fn print_report(report: &UpdateReport) {
    println!("  Files deleted: {}", report.deleted.len());
    println!("  Files patched: {}", report.patched.len());
    println!("  Files repaired: {}", report.repaired.len());
    println!("  Files skipped: {}", report.skipped.len());
    println!("  Files extracted: {}", report.extracted.len());
    println!("  Paths refused: {}", report.refused.len());
    if !report.unverified.is_empty() {
        println!("  Unverified (left at previous version): {}", report.unverified.len());
        for path in &report.unverified {
            println!("    {path}");
        }
    }
}
