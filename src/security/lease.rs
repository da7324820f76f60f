//! Crash-safe reclamation of temp resources.
//!
//! Every resource directory this crate creates carries a sentinel file
//! (`.credproxy.pid`) holding the creating process id. Drop-based teardown
//! never runs when the process is SIGKILLed, so a sweep at startup removes
//! directories whose owner is gone.
//!
//! # Orphan rules
//!
//! | Resource | Orphaned when |
//! |----------|---------------|
//! | Sentinel present | Recorded pid no longer exists |
//! | No (or unreadable) sentinel | Last modified longer ago than the legacy cutoff |
//!
//! The age cutoff defaults to 24h and must stay well above the lifetime of
//! a normal sandbox run.

use anyhow::{Context, Result};
use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::{MetadataExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use super::scrub::scrub_and_remove;

/// Name of the sentinel file written into every tracked directory.
pub const LEASE_FILENAME: &str = ".credproxy.pid";

/// Default age after which an unleased resource is considered abandoned.
pub const DEFAULT_LEGACY_MAX_AGE: Duration = Duration::from_secs(24 * 60 * 60);

/// Name prefixes of every resource category created by this crate.
pub const RESOURCE_PREFIXES: &[&str] = &[
    SSH_PROXY_PREFIX,
    GPG_PROXY_PREFIX,
    TMUX_PROXY_PREFIX,
    SECRETS_PREFIX,
    SSH_SAFE_PREFIX,
];

pub const SSH_PROXY_PREFIX: &str = "ssh-proxy-";
pub const GPG_PROXY_PREFIX: &str = "gpg-proxy-";
pub const TMUX_PROXY_PREFIX: &str = "tmux-proxy-";
pub const SECRETS_PREFIX: &str = "credproxy-secrets-";
pub const SSH_SAFE_PREFIX: &str = "ssh-safe-";

/// Record the current process as owner of `dir`.
pub fn write_lease(dir: &Path) -> Result<()> {
    let path = dir.join(LEASE_FILENAME);
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(&path)
        .with_context(|| format!("Failed to write lease {}", path.display()))?;
    write!(file, "{}", std::process::id())
        .with_context(|| format!("Failed to write lease {}", path.display()))?;
    Ok(())
}

/// Create `<base>/<prefix>XXXXXX` with mode 0700 and a lease sentinel.
///
/// A missing `base` is created 0700. An existing one must be a real
/// directory owned by the effective user with no group or other access.
/// The directory is removed again if the lease cannot be written, so an
/// untracked directory never survives this call.
pub fn create_owned_dir(base: &Path, prefix: &str) -> Result<PathBuf> {
    match fs::symlink_metadata(base) {
        Ok(_) => verify_private_dir(base)?,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            crate::paths::create_dir_with_mode(base)?;
            verify_private_dir(base)?;
        }
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to inspect {}", base.display()));
        }
    }

    let dir = tempfile::Builder::new()
        .prefix(prefix)
        .permissions(fs::Permissions::from_mode(0o700))
        .tempdir_in(base)
        .with_context(|| format!("Failed to create {}* directory in {}", prefix, base.display()))?
        .keep();

    if let Err(e) = write_lease(&dir) {
        let _ = fs::remove_dir_all(&dir);
        return Err(e);
    }

    Ok(dir)
}

/// Refuse a resource base another user could tamper with.
pub fn verify_private_dir(path: &Path) -> Result<()> {
    let metadata = fs::symlink_metadata(path)
        .with_context(|| format!("Failed to inspect {}", path.display()))?;
    if !metadata.file_type().is_dir() {
        anyhow::bail!("{} is not a directory", path.display());
    }

    // SAFETY: geteuid has no preconditions and cannot fail.
    let euid = unsafe { libc::geteuid() };
    if metadata.uid() != euid {
        anyhow::bail!(
            "{} is owned by uid {}, expected {}",
            path.display(),
            metadata.uid(),
            euid
        );
    }
    if metadata.mode() & 0o077 != 0 {
        anyhow::bail!(
            "{} has mode {:o}, expected 700",
            path.display(),
            metadata.mode() & 0o777
        );
    }
    Ok(())
}

/// Whether a process with `pid` currently exists.
///
/// Signal 0 performs the permission and existence checks without delivering
/// anything. EPERM means the process exists but belongs to someone else.
pub fn process_exists(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    match kill(Pid::from_raw(pid), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Decide whether `path` was abandoned by a dead process.
pub fn is_orphaned(path: &Path, legacy_max_age: Duration) -> bool {
    if path.is_dir()
        && let Some(pid) = read_lease(path)
    {
        return !process_exists(pid);
    }

    is_older_than(path, legacy_max_age)
}

fn read_lease(dir: &Path) -> Option<i32> {
    let content = fs::read_to_string(dir.join(LEASE_FILENAME)).ok()?;
    content.trim().parse::<i32>().ok()
}

fn is_older_than(path: &Path, max_age: Duration) -> bool {
    let Ok(metadata) = fs::symlink_metadata(path) else {
        return false;
    };
    let Ok(modified) = metadata.modified() else {
        return false;
    };
    match SystemTime::now().duration_since(modified) {
        Ok(age) => age > max_age,
        // Modified in the future: clock skew, keep it.
        Err(_) => false,
    }
}

/// Outcome of a [`sweep`].
#[derive(Debug, Default)]
pub struct SweepReport {
    /// Resources that were removed.
    pub removed: Vec<PathBuf>,
    /// Matching resources that are still owned (or too young to judge).
    pub retained: usize,
    /// Orphans that could not be removed.
    pub failed: Vec<PathBuf>,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.removed.is_empty() && self.failed.is_empty()
    }
}

/// Remove orphaned resources under `base` whose names start with one of `prefixes`.
///
/// Intended to run once at startup. Errors are logged, never returned.
pub fn sweep(base: &Path, prefixes: &[&str], legacy_max_age: Duration) -> SweepReport {
    let mut report = SweepReport::default();

    for prefix in prefixes {
        let pattern = base.join(format!("{}*", glob::Pattern::escape(prefix)));
        let Some(pattern) = pattern.to_str() else {
            tracing::debug!("Skipping non-UTF-8 sweep pattern under {}", base.display());
            continue;
        };

        let matches = match glob::glob(pattern) {
            Ok(paths) => paths,
            Err(e) => {
                tracing::debug!("Invalid sweep pattern {}: {}", pattern, e);
                continue;
            }
        };

        for path in matches.flatten() {
            if !is_orphaned(&path, legacy_max_age) {
                tracing::debug!("Resource {} still owned, keeping", path.display());
                report.retained += 1;
                continue;
            }

            match remove_orphan(&path) {
                Ok(()) => {
                    tracing::info!("Removed orphaned resource: {}", path.display());
                    report.removed.push(path);
                }
                Err(e) => {
                    tracing::warn!("Failed to remove orphaned resource {}: {}", path.display(), e);
                    report.failed.push(path);
                }
            }
        }
    }

    report
}

/// Remove one orphan. Secrets directories are scrubbed file by file first,
/// since their owner never got to run its own teardown.
fn remove_orphan(path: &Path) -> io::Result<()> {
    let metadata = fs::symlink_metadata(path)?;
    if !metadata.file_type().is_dir() {
        return fs::remove_file(path);
    }

    let is_secrets = path
        .file_name()
        .is_some_and(|name| name.to_string_lossy().starts_with(SECRETS_PREFIX));
    if is_secrets {
        for entry in fs::read_dir(path)?.flatten() {
            let is_file = entry.file_type().is_ok_and(|t| t.is_file());
            if is_file && entry.file_name() != LEASE_FILENAME {
                scrub_and_remove(&entry.path());
            }
        }
    }

    fs::remove_dir_all(path)
}

/// Sweep every resource category this crate creates.
pub fn sweep_all(base: &Path, legacy_max_age: Duration) -> SweepReport {
    if !base.exists() {
        return SweepReport::default();
    }
    sweep(base, RESOURCE_PREFIXES, legacy_max_age)
}
