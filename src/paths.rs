//! XDG Base Directory compliant path resolution.
//!
//! Every directory is resolved through a three-level fallback:
//! 1. credproxy-specific env var (CREDPROXY_CONFIG_DIR, etc.)
//! 2. XDG env var (XDG_CONFIG_HOME, etc.) via `etcetera`
//! 3. Platform default (~/.config, etc.)
//!
//! All paths are absolute. Relative paths from env vars are ignored per XDG spec.

use anyhow::{Context, Result};
use libc::getuid;
use std::path::{Path, PathBuf};

const AUDIT_FILENAME: &str = "credproxy.audit.jsonl";

/// Resolved directory paths for the whole process.
///
/// Created once at startup and threaded through [`crate::Config`].
#[derive(Debug, Clone)]
pub struct Paths {
    /// Config directory: config.toml lives here
    pub config_dir: PathBuf,

    /// State directory: audit log
    pub state_dir: PathBuf,

    /// Runtime directory: default home of proxy sockets and secrets bundles.
    pub runtime_dir: PathBuf,
}

impl Paths {
    /// Resolve all paths using real environment variables.
    pub fn resolve() -> Result<Self> {
        Self::resolve_with_env(|key| std::env::var(key))
    }

    /// Resolve paths with a custom env var lookup (for testing).
    pub fn resolve_with_env<F>(env_fn: F) -> Result<Self>
    where
        F: Fn(&str) -> std::result::Result<String, std::env::VarError>,
    {
        use etcetera::BaseStrategy;

        let strategy = etcetera::choose_base_strategy()
            .map_err(|e| anyhow::anyhow!("Failed to determine base directories: {}", e))?;

        let config_dir = env_or(&env_fn, "CREDPROXY_CONFIG_DIR", || {
            strategy.config_dir().join("credproxy")
        });

        let state_dir = env_or(&env_fn, "CREDPROXY_STATE_DIR", || {
            let base_state = strategy.state_dir().unwrap_or_else(|| strategy.data_dir());
            base_state.join("credproxy")
        });

        let runtime_dir = env_or(&env_fn, "CREDPROXY_RUNTIME_DIR", || {
            resolve_runtime_dir(&env_fn)
        });

        Ok(Self {
            config_dir,
            state_dir,
            runtime_dir,
        })
    }

    /// Config file: config_dir/config.toml
    pub fn config_file(&self) -> PathBuf {
        self.config_dir.join("config.toml")
    }

    /// Audit log: state_dir/credproxy.audit.jsonl
    pub fn audit_log(&self) -> PathBuf {
        self.state_dir.join(AUDIT_FILENAME)
    }

    /// Create all directories with mode 0700.
    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [&self.config_dir, &self.state_dir, &self.runtime_dir] {
            create_dir_with_mode(dir)?;
        }
        Ok(())
    }
}

impl Default for Paths {
    fn default() -> Self {
        Self::resolve().unwrap_or_else(|_| {
            let home = etcetera::home_dir().unwrap_or_else(|_| PathBuf::from("."));
            Self {
                config_dir: home.join(".config").join("credproxy"),
                state_dir: home.join(".local").join("state").join("credproxy"),
                runtime_dir: std::env::temp_dir().join("credproxy"),
            }
        })
    }
}

/// Resolve an env var with fallback. Ignores empty and relative paths per XDG spec.
fn env_or<F>(env_fn: &F, var: &str, default: impl FnOnce() -> PathBuf) -> PathBuf
where
    F: Fn(&str) -> std::result::Result<String, std::env::VarError>,
{
    env_fn(var)
        .ok()
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .filter(|p| p.is_absolute())
        .unwrap_or_else(default)
}

/// XDG_RUNTIME_DIR/credproxy, else $TMPDIR/credproxy-$UID.
fn resolve_runtime_dir<F>(env_fn: &F) -> PathBuf
where
    F: Fn(&str) -> std::result::Result<String, std::env::VarError>,
{
    if let Ok(dir) = env_fn("XDG_RUNTIME_DIR")
        && !dir.is_empty()
    {
        let path = PathBuf::from(&dir);
        if path.is_absolute() {
            return path.join("credproxy");
        }
    }

    // SAFETY: getuid has no preconditions and cannot fail.
    let uid = unsafe { getuid() };
    let tmpdir = env_fn("TMPDIR")
        .ok()
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| "/tmp".to_string());
    PathBuf::from(tmpdir).join(format!("credproxy-{}", uid))
}

/// Create a directory with mode 0700 per XDG spec.
pub(crate) fn create_dir_with_mode(path: &Path) -> Result<()> {
    std::fs::create_dir_all(path)
        .with_context(|| format!("Failed to create directory: {}", path.display()))?;

    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))
        .with_context(|| format!("Failed to set permissions on {}", path.display()))?;

    Ok(())
}
