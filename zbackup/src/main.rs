//! zbackup - Main entry point
//!
//! Incremental directory backups to a local path or over SSH.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use zbackup::config::{BackupConfig, BackupMode, ChecksumAlgo, FileConfig};
use zbackup::daemon::ShutdownCoordinator;
use zbackup::fs::{Endpoint, SshOptions};
use zbackup::transfer::{BarProgress, NoopProgress, Progress};
use zbackup::utils;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Source directory: a local path or [user@]host:/path
    #[arg(short, long)]
    source: Option<String>,

    /// Destination directory: a local path or [user@]host:/path
    #[arg(short, long)]
    dest: Option<String>,

    /// SSH port
    #[arg(short, long)]
    port: Option<u16>,

    /// SSH private key file (the SSH agent is used otherwise)
    #[arg(short, long, value_name = "FILE")]
    identity: Option<PathBuf>,

    /// SSH user when the endpoint does not name one
    #[arg(long)]
    user: Option<String>,

    /// known_hosts file to verify the remote host key against
    #[arg(long, value_name = "FILE")]
    known_hosts: Option<PathBuf>,

    /// Backup mode
    #[arg(short, long, value_enum)]
    mode: Option<BackupMode>,

    /// Checksum used to verify transferred files
    #[arg(long, value_enum)]
    checksum: Option<ChecksumAlgo>,

    /// Glob pattern to exclude (repeatable)
    #[arg(long, value_name = "PATTERN")]
    exclude: Vec<String>,

    /// Show the plan without transferring anything
    #[arg(long)]
    dry_run: bool,

    /// Snapshot name (defaults to the UTC start time)
    #[arg(long)]
    snapshot_name: Option<String>,

    /// Disable the progress bar
    #[arg(long)]
    no_progress: bool,

    /// Also write logs to this file
    #[arg(long, value_name = "FILE")]
    log_file: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,
}

impl Args {
    /// Layer CLI flags over the config file
    fn into_backup_config(self, file: FileConfig) -> Result<BackupConfig> {
        let ssh = SshOptions {
            port: self.port.unwrap_or(file.ssh.port),
            user: self.user.or(file.ssh.user),
            identity: self.identity.or(file.ssh.identity),
            known_hosts: self.known_hosts.or(file.ssh.known_hosts),
        };

        let source = self
            .source
            .or(file.backup.source)
            .context("a source is required (--source)")?;
        let dest = self
            .dest
            .or(file.backup.dest)
            .context("a destination is required (--dest)")?;

        let mut config = BackupConfig::new(Endpoint::parse(&source, &ssh)?, Endpoint::parse(&dest, &ssh)?);
        config.mode = self.mode.or(file.backup.mode).unwrap_or_default();
        config.checksum = self.checksum.or(file.backup.checksum).unwrap_or_default();
        config.excludes = file.backup.excludes;
        config.excludes.extend(self.exclude);
        config.dry_run = self.dry_run;
        config.snapshot_name = self.snapshot_name;

        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let file_config = match &args.config {
        Some(path) => FileConfig::from_file(path)
            .with_context(|| format!("failed to load config file {}", path.display()))?,
        None => FileConfig::default(),
    };

    // Initialize logging
    let log_level = args.log_level.clone().unwrap_or_else(|| file_config.log.level.clone());
    let log_file = args.log_file.clone().or_else(|| file_config.log.file.clone());
    utils::logger::init(&log_level, log_file.as_deref())?;

    tracing::info!("Starting zbackup v{}", env!("CARGO_PKG_VERSION"));

    let no_progress = args.no_progress;
    let mut config = args.into_backup_config(file_config)?;
    config.dest_log = log_file.is_none();
    config.validate()?;

    let progress: Arc<dyn Progress> = if no_progress || config.dry_run {
        Arc::new(NoopProgress)
    } else {
        Arc::new(BarProgress::new())
    };

    // Signals stop the run between files
    let shutdown_coordinator = Arc::new(ShutdownCoordinator::new());
    let cancel = shutdown_coordinator.token();
    let signal_watcher = {
        let coordinator = shutdown_coordinator.clone();
        tokio::spawn(async move { coordinator.wait_for_signal().await })
    };

    let run_cancel = cancel.clone();
    let outcome = tokio::task::spawn_blocking(move || zbackup::run(&config, &run_cancel, progress)).await;

    // Run finished on its own; release the signal watcher
    shutdown_coordinator.shutdown();
    let _ = signal_watcher.await;

    let summary = outcome.context("backup task panicked")??;
    if summary.dry_run {
        tracing::info!(
            snapshot = %summary.snapshot_name,
            items = summary.plan.len(),
            files = summary.plan.total_files,
            bytes = summary.plan.total_bytes,
            "Dry run complete"
        );
    } else {
        tracing::info!(
            run_id = %summary.run_id,
            snapshot = %summary.snapshot_name,
            transferred = summary.transferred,
            "Backup finished"
        );
    }

    Ok(())
}
