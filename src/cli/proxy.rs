//! CLI subcommand: `credproxy proxy`

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use nix::sys::signal::SigSet;
use std::ffi::OsString;
use std::path::PathBuf;

use crate::config::Config;
use crate::delivery::gpgconf_agent_socket;
use crate::forward::{AllowList, ForwardChannel, gpg_agent_proxy, ssh_agent_proxy, tmux_relay};

use super::{block_shutdown_signals, open_audit_log, run_sweep, wait_for_shutdown};

#[derive(Args)]
pub struct ProxyArgs {
    #[command(subcommand)]
    pub command: ProxyCommands,
}

#[derive(Subcommand)]
pub enum ProxyCommands {
    /// Filtering proxy in front of an ssh-agent
    Ssh {
        /// Upstream agent socket (default: config, then $SSH_AUTH_SOCK)
        #[arg(short, long)]
        upstream: Option<PathBuf>,

        /// Comment or fingerprint fragment of a permitted key (repeatable)
        #[arg(short, long = "allow", value_name = "KEY")]
        allow: Vec<String>,
    },

    /// Filtering proxy in front of a gpg-agent
    Gpg {
        /// Upstream agent socket (default: config, then gpgconf)
        #[arg(short, long)]
        upstream: Option<PathBuf>,

        /// Keygrip fragment of a permitted key (repeatable)
        #[arg(short, long = "allow", value_name = "KEYGRIP")]
        allow: Vec<String>,
    },

    /// Plain byte relay to any Unix socket
    Relay {
        /// Upstream socket
        upstream: PathBuf,
    },
}

pub fn run(args: ProxyArgs, config: &Config) -> Result<()> {
    let signals = block_shutdown_signals()?;
    run_sweep(config);
    let base = config.base_dir();

    let channel = match args.command {
        ProxyCommands::Ssh { upstream, allow } => {
            let upstream = ssh_upstream(
                upstream,
                config.ssh.agent_socket.as_deref(),
                std::env::var_os("SSH_AUTH_SOCK"),
            )
            .context("No upstream agent: pass --upstream or set SSH_AUTH_SOCK")?;
            let allow = allow_list(allow, &config.ssh.allowed_keys);
            ssh_agent_proxy(&base, &upstream, allow, open_audit_log(config))?
        }
        ProxyCommands::Gpg { upstream, allow } => {
            let upstream = upstream
                .or_else(|| config.gpg.agent_socket.as_deref().map(expand))
                .or_else(gpgconf_agent_socket)
                .context("No upstream agent: pass --upstream or configure gpg.agent_socket")?;
            let allow = allow_list(allow, &config.gpg.allowed_keys);
            gpg_agent_proxy(&base, &upstream, allow, open_audit_log(config))?
        }
        ProxyCommands::Relay { upstream } => tmux_relay(&base, &upstream)?,
    };

    serve_until_signalled(channel, &signals)
}

fn serve_until_signalled(channel: ForwardChannel, signals: &SigSet) -> Result<()> {
    println!("{}", channel.socket_path().display());
    let waited = wait_for_shutdown(signals);
    channel.stop();
    waited.map(|_| ())
}

/// `--upstream`, then the configured socket, then `$SSH_AUTH_SOCK`; the
/// same precedence delivery uses.
fn ssh_upstream(
    cli: Option<PathBuf>,
    configured: Option<&str>,
    auth_sock: Option<OsString>,
) -> Option<PathBuf> {
    cli.or_else(|| configured.map(expand)).or_else(|| {
        auth_sock
            .filter(|sock| !sock.is_empty())
            .map(PathBuf::from)
    })
}

/// Command-line entries replace the configured list when given.
fn allow_list(cli: Vec<String>, configured: &[String]) -> AllowList {
    if cli.is_empty() {
        AllowList::new(configured)
    } else {
        AllowList::new(cli)
    }
}

fn expand(path: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(path).to_string())
}
