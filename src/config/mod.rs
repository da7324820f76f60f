use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::forward::{AllowList, CredentialPolicy};
use crate::paths::Paths;

pub use crate::forward::ForwardMode;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Resolved XDG-compliant paths (not serialized)
    #[serde(skip)]
    pub paths: Paths,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub audit: AuditConfig,

    #[serde(default)]
    pub ssh: SshConfig,

    #[serde(default)]
    pub gpg: GpgConfig,

    #[serde(default)]
    pub tmux: TmuxConfig,

    #[serde(default)]
    pub secrets: SecretsConfig,

    #[serde(default)]
    pub cleanup: CleanupConfig,

    #[serde(default)]
    pub sandbox: SandboxConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    /// Record allow/deny decisions of the agent proxies (default: true)
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Override for the audit log location (default: state dir)
    #[serde(default)]
    pub file: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SshConfig {
    #[serde(default)]
    pub forward: ForwardMode,

    /// Comment or fingerprint fragments of keys the sandbox may use.
    #[serde(default)]
    pub allowed_keys: Vec<String>,

    /// Upstream agent socket (default: $SSH_AUTH_SOCK)
    #[serde(default)]
    pub agent_socket: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GpgConfig {
    #[serde(default)]
    pub forward: ForwardMode,

    /// Keygrip fragments of keys the sandbox may use.
    #[serde(default)]
    pub allowed_keys: Vec<String>,

    /// Upstream agent socket (default: `gpgconf --list-dirs agent-socket`)
    #[serde(default)]
    pub agent_socket: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TmuxConfig {
    /// Relay the active tmux control socket into the sandbox
    #[serde(default)]
    pub forward: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretsConfig {
    /// Deliver secret variables as files instead of environment (default: true)
    #[serde(default = "default_true")]
    pub isolate: bool,

    /// Environment variable names treated as secret
    #[serde(default)]
    pub names: Vec<String>,

    /// Where the secrets directory appears inside the sandbox
    #[serde(default = "default_secrets_mount_path")]
    pub mount_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupConfig {
    /// Age after which an unleased resource counts as orphaned
    #[serde(default = "default_legacy_max_age_hours")]
    pub legacy_max_age_hours: u64,

    /// Where proxy sockets and secrets bundles are created (default: runtime dir)
    #[serde(default)]
    pub base_dir: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Home directory of the sandbox user, used for mount targets
    #[serde(default = "default_sandbox_home")]
    pub home: String,
}

// Default value functions
fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

fn default_secrets_mount_path() -> String {
    "/run/secrets".to_string()
}

fn default_legacy_max_age_hours() -> u64 {
    24
}

fn default_sandbox_home() -> String {
    "/home/sandbox".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            file: None,
        }
    }
}

impl Default for SecretsConfig {
    fn default() -> Self {
        Self {
            isolate: default_true(),
            names: Vec::new(),
            mount_path: default_secrets_mount_path(),
        }
    }
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            legacy_max_age_hours: default_legacy_max_age_hours(),
            base_dir: None,
        }
    }
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            home: default_sandbox_home(),
        }
    }
}

impl SshConfig {
    pub fn policy(&self) -> CredentialPolicy {
        CredentialPolicy::new(self.forward, AllowList::new(&self.allowed_keys))
    }
}

impl GpgConfig {
    pub fn policy(&self) -> CredentialPolicy {
        // Key files make no sense for gpg-agent; treat as disabled.
        let mode = match self.forward {
            ForwardMode::Keys => ForwardMode::None,
            mode => mode,
        };
        CredentialPolicy::new(mode, AllowList::new(&self.allowed_keys))
    }
}

impl Config {
    /// Load from the default location, falling back to defaults if absent.
    pub fn load() -> Result<Self> {
        let paths = Paths::resolve()?;
        let path = paths.config_file();
        Self::load_from(&path, paths)
    }

    /// Load from an explicit file. A missing file yields defaults.
    pub fn load_from(path: &Path, paths: Paths) -> Result<Self> {
        if !path.exists() {
            return Ok(Config {
                paths,
                ..Config::default()
            });
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let mut config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        config.paths = paths;

        Ok(config)
    }

    /// Audit log location: explicit override or the state directory default.
    pub fn audit_log_path(&self) -> PathBuf {
        match self.audit.file {
            Some(ref file) => PathBuf::from(shellexpand::tilde(file).to_string()),
            None => self.paths.audit_log(),
        }
    }

    /// Directory under which resource directories are created and swept.
    pub fn base_dir(&self) -> PathBuf {
        match self.cleanup.base_dir {
            Some(ref dir) => PathBuf::from(shellexpand::tilde(dir).to_string()),
            None => self.paths.runtime_dir.clone(),
        }
    }

    pub fn legacy_max_age(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.cleanup.legacy_max_age_hours.saturating_mul(3600))
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize config")
    }
}
