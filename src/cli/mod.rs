pub mod audit;
pub mod config;
pub mod paths;
pub mod proxy;
pub mod serve;
pub mod sweep;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use nix::sys::signal::{SigSet, Signal};
use std::path::PathBuf;
use std::sync::Arc;

use crate::config::Config;
use crate::paths::Paths;
use crate::security::{AuditLog, SweepReport, sweep_all};

#[derive(Parser)]
#[command(name = "credproxy")]
#[command(author, version, about = "Filtered credential forwarding for sandboxed processes")]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to config file
    #[arg(short, long, global = true, env = "CREDPROXY_CONFIG")]
    pub config: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Remove resources left behind by crashed runs
    Sweep,

    /// Prepare credential delivery, print it as JSON and hold it until signalled
    Serve(serve::ServeArgs),

    /// Run a single forwarding channel in the foreground
    Proxy(proxy::ProxyArgs),

    /// Inspect the audit log
    Audit(audit::AuditArgs),

    /// Show resolved directory paths
    Paths,

    /// Configuration management
    Config(config::ConfigArgs),
}

/// Load the config from `--config` if given, else from the default location.
pub fn load_config(path: Option<&str>) -> Result<Config> {
    match path {
        Some(path) => {
            let path = PathBuf::from(shellexpand::tilde(path).to_string());
            if !path.exists() {
                anyhow::bail!("Config file not found: {}", path.display());
            }
            Config::load_from(&path, Paths::resolve()?)
        }
        None => Config::load(),
    }
}

/// Audit log as configured. An unusable audit file is reported, not fatal.
pub(crate) fn open_audit_log(config: &Config) -> Arc<AuditLog> {
    let audit = Arc::new(AuditLog::new());
    if config.audit.enabled {
        let path = config.audit_log_path();
        match audit.enable(&path) {
            Ok(()) => tracing::debug!("Audit log: {}", path.display()),
            Err(e) => tracing::warn!("Audit logging disabled: {:#}", e),
        }
    }
    audit
}

pub(crate) fn run_sweep(config: &Config) -> SweepReport {
    let base = config.base_dir();
    let report = sweep_all(&base, config.legacy_max_age());
    if !report.is_empty() {
        tracing::info!(
            "Sweep of {}: removed {}, kept {}, failed {}",
            base.display(),
            report.removed.len(),
            report.retained,
            report.failed.len()
        );
    }
    report
}

/// Block SIGINT/SIGTERM for this thread and every thread spawned after it.
///
/// Must run before any channel is opened so relay threads inherit the mask
/// and the signal is only ever consumed by [`wait_for_shutdown`].
pub(crate) fn block_shutdown_signals() -> Result<SigSet> {
    let mut set = SigSet::empty();
    set.add(Signal::SIGINT);
    set.add(Signal::SIGTERM);
    set.thread_block().context("Failed to block shutdown signals")?;
    Ok(set)
}

pub(crate) fn wait_for_shutdown(set: &SigSet) -> Result<Signal> {
    let signal = set.wait().context("Failed to wait for shutdown signal")?;
    tracing::info!("Received {}, shutting down", signal);
    Ok(signal)
}
