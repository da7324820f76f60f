//! Credential delivery for one sandbox invocation.
//!
//! [`prepare_delivery`] turns a [`DeliveryRequest`] into what a sandbox
//! launcher consumes: mounts, environment, user-facing warnings, and the
//! cleanup handles that must run once the sandbox exits.
//!
//! Unavailable upstream sockets only produce a warning and the channel is
//! skipped. Any other failure aborts the whole preparation after tearing down
//! what was already created, so a requested filter is never silently replaced
//! by a raw agent mount.

mod request;

pub use request::{DeliveryRequest, collect_env};
pub(crate) use request::gpgconf_agent_socket;

use anyhow::{Context, Result};
use serde::Serialize;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::forward::{
    ForwardChannel, ForwardError, ForwardMode, check_upstream, gpg_agent_proxy, ssh_agent_proxy,
    tmux_relay,
};
use crate::secrets::{EnvMap, SecretsBundle, prepare_secrets};
use crate::security::{AuditLog, SSH_SAFE_PREFIX, create_owned_dir};

/// In-sandbox path of the forwarded SSH agent socket.
pub const SANDBOX_SSH_AUTH_SOCK: &str = "/ssh-agent";

/// Variable telling the sandbox where the secrets directory is mounted.
pub const SECRETS_DIR_ENV: &str = "CREDPROXY_SECRETS_DIR";

/// Files of `~/.ssh` that are safe to expose next to an agent socket.
const SAFE_SSH_FILES: &[&str] = &["config", "known_hosts"];

/// A host path made visible inside the sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MountSpec {
    pub host: PathBuf,
    pub sandbox: PathBuf,
    pub read_only: bool,
}

impl MountSpec {
    pub fn read_only(host: impl Into<PathBuf>, sandbox: impl Into<PathBuf>) -> Self {
        Self {
            host: host.into(),
            sandbox: sandbox.into(),
            read_only: true,
        }
    }

    pub fn read_write(host: impl Into<PathBuf>, sandbox: impl Into<PathBuf>) -> Self {
        Self {
            host: host.into(),
            sandbox: sandbox.into(),
            read_only: false,
        }
    }

    /// `host:sandbox[:ro]`, the volume syntax of docker and podman.
    pub fn volume_arg(&self) -> String {
        let mut arg = format!("{}:{}", self.host.display(), self.sandbox.display());
        if self.read_only {
            arg.push_str(":ro");
        }
        arg
    }
}

/// Something that must be torn down after the sandbox exits.
#[derive(Debug)]
pub enum CleanupHandle {
    /// Relay or agent proxy; stopping it removes its directory.
    Channel(ForwardChannel),
    /// Secrets directory; scrubbed before removal.
    Secrets(SecretsBundle),
    /// Plain leased directory.
    TempDir(PathBuf),
}

impl CleanupHandle {
    pub fn run(self) {
        match self {
            CleanupHandle::Channel(channel) => channel.stop(),
            CleanupHandle::Secrets(mut bundle) => bundle.teardown(),
            CleanupHandle::TempDir(dir) => match fs::remove_dir_all(&dir) {
                Ok(()) => debug!("Removed {}", dir.display()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!("Failed to remove {}: {}", dir.display(), e),
            },
        }
    }
}

/// Everything the launcher needs, plus the obligation to clean up.
///
/// Dropping it runs [`teardown`](Self::teardown).
#[derive(Debug, Default)]
pub struct CredentialDelivery {
    pub mounts: Vec<MountSpec>,
    /// Full sandbox environment: input minus isolated secrets, plus overrides.
    pub env: EnvMap,
    /// Variables this delivery set or rewrote.
    pub overrides: EnvMap,
    /// Variables removed from the environment because they went to files.
    pub unset: Vec<String>,
    pub warnings: Vec<String>,
    handles: Vec<CleanupHandle>,
}

impl CredentialDelivery {
    pub fn handles(&self) -> &[CleanupHandle] {
        &self.handles
    }

    /// Run every cleanup handle, newest first.
    pub fn teardown(&mut self) {
        if self.handles.is_empty() {
            return;
        }
        debug!("Tearing down {} credential resource(s)", self.handles.len());
        while let Some(handle) = self.handles.pop() {
            handle.run();
        }
    }

    fn warn(&mut self, message: String) {
        warn!("{}", message);
        self.warnings.push(message);
    }

    fn set(&mut self, name: &str, value: impl Into<String>) {
        self.overrides.insert(name.to_string(), value.into());
    }

    /// Keep a channel, or downgrade an unavailable upstream to a warning.
    fn track_channel(
        &mut self,
        feature: &str,
        opened: Result<ForwardChannel, ForwardError>,
    ) -> Result<Option<PathBuf>> {
        match opened {
            Ok(channel) => {
                let socket = channel.socket_path().to_path_buf();
                self.handles.push(CleanupHandle::Channel(channel));
                Ok(Some(socket))
            }
            Err(e @ ForwardError::UpstreamUnavailable { .. }) => {
                self.warn(format!("{} forwarding unavailable: {}", feature, e));
                Ok(None)
            }
            Err(e) => Err(anyhow::Error::new(e).context(format!("{} forwarding failed", feature))),
        }
    }
}

impl Drop for CredentialDelivery {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Set up every requested credential channel.
pub fn prepare_delivery(
    request: &DeliveryRequest,
    audit: &Arc<AuditLog>,
) -> Result<CredentialDelivery> {
    let mut delivery = CredentialDelivery::default();
    let mut env = request.env.clone();

    // Early returns drop `delivery`, which tears down what exists so far.
    deliver_tmux(request, &mut delivery)?;
    deliver_ssh(request, audit, &mut delivery)?;
    deliver_gpg(request, audit, &mut delivery)?;
    if let Some(residual) = deliver_secrets(request, &mut delivery)? {
        env = residual;
    }

    for (name, value) in &delivery.overrides {
        env.insert(name.clone(), value.clone());
    }
    delivery.env = env;

    Ok(delivery)
}

fn deliver_tmux(request: &DeliveryRequest, delivery: &mut CredentialDelivery) -> Result<()> {
    if !request.tmux {
        return Ok(());
    }
    let Some(tmux) = request.env.get("TMUX").filter(|t| !t.is_empty()) else {
        debug!("TMUX not set, nothing to forward");
        return Ok(());
    };

    // socket,pid,session
    let mut parts = tmux.splitn(3, ',');
    let socket = parts.next().unwrap_or_default();
    let (Some(pid), Some(session)) = (parts.next(), parts.next()) else {
        delivery.warn(format!("tmux forwarding unavailable: malformed TMUX value {:?}", tmux));
        return Ok(());
    };

    let Some(proxy_socket) =
        delivery.track_channel("tmux", tmux_relay(&request.base_dir, Path::new(socket)))?
    else {
        return Ok(());
    };

    if let Some(dir) = proxy_socket.parent() {
        delivery.mounts.push(MountSpec::read_write(dir, dir));
    }
    delivery.set("TMUX", format!("{},{},{}", proxy_socket.display(), pid, session));
    if let Some(pane) = request.env.get("TMUX_PANE").filter(|p| !p.is_empty()) {
        delivery.set("TMUX_PANE", pane.clone());
    }
    info!("tmux forwarding active via {}", proxy_socket.display());
    Ok(())
}

fn deliver_ssh(
    request: &DeliveryRequest,
    audit: &Arc<AuditLog>,
    delivery: &mut CredentialDelivery,
) -> Result<()> {
    let sandbox_ssh_dir = request.sandbox_home.join(".ssh");

    match request.ssh.mode {
        ForwardMode::None => return Ok(()),
        ForwardMode::Keys => {
            match request.host_home.as_ref().map(|h| h.join(".ssh")) {
                Some(dir) if dir.is_dir() => {
                    delivery.mounts.push(MountSpec::read_only(dir, sandbox_ssh_dir));
                }
                _ => delivery.warn("SSH key forwarding unavailable: no ~/.ssh directory".into()),
            }
            return Ok(());
        }
        ForwardMode::Agent | ForwardMode::Proxy => {}
    }

    let Some(upstream) = request.ssh_socket.as_deref() else {
        delivery.warn("SSH forwarding unavailable: SSH_AUTH_SOCK not set".into());
        return Ok(());
    };

    let agent_socket = if request.ssh.mode == ForwardMode::Proxy {
        let opened = ssh_agent_proxy(
            &request.base_dir,
            upstream,
            request.ssh.allow_list.clone(),
            Arc::clone(audit),
        );
        let Some(socket) = delivery.track_channel("SSH", opened)? else {
            return Ok(());
        };
        if request.ssh.allow_list.is_empty() {
            info!("SSH proxy active: all keys accessible");
        } else {
            info!(
                "SSH proxy active: only keys matching {:?} are accessible",
                request.ssh.allow_list.entries()
            );
        }
        socket
    } else {
        if let Err(e) = check_upstream(upstream) {
            delivery.warn(format!("SSH forwarding unavailable: {}", e));
            return Ok(());
        }
        upstream.to_path_buf()
    };

    delivery
        .mounts
        .push(MountSpec::read_write(agent_socket, SANDBOX_SSH_AUTH_SOCK));
    delivery.set("SSH_AUTH_SOCK", SANDBOX_SSH_AUTH_SOCK);

    if let Some(host_ssh) = request.host_home.as_ref().map(|h| h.join(".ssh"))
        && host_ssh.is_dir()
    {
        let safe_dir = create_owned_dir(&request.base_dir, SSH_SAFE_PREFIX)?;
        delivery.handles.push(CleanupHandle::TempDir(safe_dir.clone()));
        copy_safe_ssh_files(&host_ssh, &safe_dir)?;
        delivery.mounts.push(MountSpec::read_only(safe_dir, sandbox_ssh_dir));
    }

    Ok(())
}

/// Copy `config`, `known_hosts` and public keys of `ssh_dir` into `safe_dir`.
fn copy_safe_ssh_files(ssh_dir: &Path, safe_dir: &Path) -> Result<()> {
    let mut sources: Vec<PathBuf> = SAFE_SSH_FILES.iter().map(|f| ssh_dir.join(f)).collect();
    let pattern = format!("{}/*.pub", glob::Pattern::escape(&ssh_dir.to_string_lossy()));
    sources.extend(
        glob::glob(&pattern)
            .context("Invalid public key pattern")?
            .flatten(),
    );

    for source in sources {
        let Some(name) = source.file_name() else {
            continue;
        };
        if !source.is_file() {
            continue;
        }
        if let Err(e) = fs::copy(&source, safe_dir.join(name)) {
            debug!("Skipping {}: {}", source.display(), e);
        }
    }
    Ok(())
}

fn deliver_gpg(
    request: &DeliveryRequest,
    audit: &Arc<AuditLog>,
    delivery: &mut CredentialDelivery,
) -> Result<()> {
    if !matches!(request.gpg.mode, ForwardMode::Agent | ForwardMode::Proxy) {
        return Ok(());
    }
    let Some(upstream) = request.gpg_socket.as_deref() else {
        delivery.warn("GPG forwarding unavailable: agent socket not found".into());
        return Ok(());
    };
    let target = request.sandbox_home.join(".gnupg").join("S.gpg-agent");

    let socket = if request.gpg.mode == ForwardMode::Proxy {
        let opened = gpg_agent_proxy(
            &request.base_dir,
            upstream,
            request.gpg.allow_list.clone(),
            Arc::clone(audit),
        );
        let Some(socket) = delivery.track_channel("GPG", opened)? else {
            return Ok(());
        };
        info!("GPG proxy active");
        socket
    } else {
        if let Err(e) = check_upstream(upstream) {
            delivery.warn(format!("GPG forwarding unavailable: {}", e));
            return Ok(());
        }
        upstream.to_path_buf()
    };

    delivery.mounts.push(MountSpec::read_write(socket, target));
    Ok(())
}

/// Returns the residual environment when secrets were isolated.
fn deliver_secrets(
    request: &DeliveryRequest,
    delivery: &mut CredentialDelivery,
) -> Result<Option<EnvMap>> {
    if !request.isolate_secrets || request.secret_names.is_empty() {
        return Ok(None);
    }

    let mut prepared = prepare_secrets(&request.base_dir, &request.env, &request.secret_names)
        .context("Failed to isolate secrets")?;

    if let Some(bundle) = prepared.bundle.take() {
        delivery.unset = bundle.names().into_iter().map(str::to_string).collect();
        delivery
            .mounts
            .push(MountSpec::read_only(bundle.dir(), &request.secrets_mount));
        delivery.set(SECRETS_DIR_ENV, request.secrets_mount.to_string_lossy());
        info!(
            "Isolated {} secret(s) into {}",
            delivery.unset.len(),
            request.secrets_mount.display()
        );
        delivery.handles.push(CleanupHandle::Secrets(bundle));
    }

    Ok(Some(prepared.env))
}
