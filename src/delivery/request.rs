use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Command;
use tracing::debug;

use crate::config::Config;
use crate::forward::{CredentialPolicy, ForwardMode};
use crate::secrets::EnvMap;

/// Inputs for one sandbox invocation's credential delivery.
#[derive(Debug, Clone)]
pub struct DeliveryRequest {
    /// Where resource directories are created.
    pub base_dir: PathBuf,
    /// Home directory of the sandbox user.
    pub sandbox_home: PathBuf,
    /// Home directory on the host, source of `~/.ssh`.
    pub host_home: Option<PathBuf>,

    pub ssh: CredentialPolicy,
    pub ssh_socket: Option<PathBuf>,

    pub gpg: CredentialPolicy,
    pub gpg_socket: Option<PathBuf>,

    pub tmux: bool,

    pub isolate_secrets: bool,
    pub secret_names: Vec<String>,
    pub secrets_mount: PathBuf,

    /// Environment the sandbox would otherwise inherit.
    pub env: EnvMap,
}

impl DeliveryRequest {
    /// Build from configuration and the host environment.
    ///
    /// `extra_secret_names` are added to the configured names (e.g. the
    /// variables a tool declares as secret).
    pub fn from_config(config: &Config, env: EnvMap, extra_secret_names: &[String]) -> Self {
        let ssh = config.ssh.policy();
        let gpg = config.gpg.policy();

        let ssh_socket = config
            .ssh
            .agent_socket
            .as_deref()
            .map(expand)
            .or_else(|| env.get("SSH_AUTH_SOCK").filter(|s| !s.is_empty()).map(PathBuf::from));

        let gpg_socket = match gpg.mode {
            ForwardMode::None | ForwardMode::Keys => None,
            _ => config
                .gpg
                .agent_socket
                .as_deref()
                .map(expand)
                .or_else(gpgconf_agent_socket),
        };

        let host_home = env
            .get("HOME")
            .filter(|h| !h.is_empty())
            .map(PathBuf::from)
            .or_else(|| directories::BaseDirs::new().map(|b| b.home_dir().to_path_buf()));

        let mut secret_names = config.secrets.names.clone();
        for name in extra_secret_names {
            if !secret_names.contains(name) {
                secret_names.push(name.clone());
            }
        }

        Self {
            base_dir: config.base_dir(),
            sandbox_home: PathBuf::from(&config.sandbox.home),
            host_home,
            ssh,
            ssh_socket,
            gpg,
            gpg_socket,
            tmux: config.tmux.forward,
            isolate_secrets: config.secrets.isolate,
            secret_names,
            secrets_mount: PathBuf::from(&config.secrets.mount_path),
            env,
        }
    }
}

/// Collect an environment such as [`std::env::vars_os`] into an [`EnvMap`].
///
/// Entries whose name or value is not valid UTF-8 are skipped. Only the
/// name is logged.
pub fn collect_env<I>(vars: I) -> EnvMap
where
    I: IntoIterator<Item = (OsString, OsString)>,
{
    vars.into_iter()
        .filter_map(|(name, value)| match (name.into_string(), value.into_string()) {
            (Ok(name), Ok(value)) => Some((name, value)),
            (name, _) => {
                let name = name.unwrap_or_else(|raw| raw.to_string_lossy().into_owned());
                debug!("Skipping non-UTF-8 environment variable {}", name);
                None
            }
        })
        .collect()
}

fn expand(path: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(path).to_string())
}

/// Ask gpgconf where the agent listens.
pub(crate) fn gpgconf_agent_socket() -> Option<PathBuf> {
    let output = Command::new("gpgconf")
        .args(["--list-dirs", "agent-socket"])
        .output()
        .inspect_err(|e| debug!("gpgconf not available: {}", e))
        .ok()?;
    if !output.status.success() {
        debug!("gpgconf exited with {}", output.status);
        return None;
    }
    let path = String::from_utf8_lossy(&output.stdout).trim().to_string();
    (!path.is_empty()).then(|| PathBuf::from(path))
}
