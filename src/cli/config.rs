use anyhow::Result;
use clap::{Args, Subcommand};

use crate::config::Config;

#[derive(Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommands,
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Show current configuration
    Show {
        /// Output format: toml (default) or json
        #[arg(short, long, default_value = "toml")]
        format: String,
    },

    /// Show config file path
    Path,

    /// Initialize default config file
    Init {
        /// Overwrite existing config
        #[arg(short, long)]
        force: bool,
    },
}

pub fn run(args: ConfigArgs, config: &Config) -> Result<()> {
    match args.command {
        ConfigCommands::Show { format } => show_config(config, &format),
        ConfigCommands::Path => show_path(config),
        ConfigCommands::Init { force } => init_config(config, force),
    }
}

fn show_config(config: &Config, format: &str) -> Result<()> {
    match format {
        "json" => {
            let json = serde_json::to_string_pretty(config)?;
            println!("{}", json);
        }
        _ => {
            println!("{}", config.to_toml()?);
        }
    }

    Ok(())
}

fn show_path(config: &Config) -> Result<()> {
    println!("{}", config.paths.config_file().display());
    Ok(())
}

fn init_config(config: &Config, force: bool) -> Result<()> {
    let path = config.paths.config_file();

    if path.exists() && !force {
        anyhow::bail!(
            "Config file already exists at {}. Use --force to overwrite.",
            path.display()
        );
    }

    config.paths.ensure_dirs()?;
    std::fs::write(&path, DEFAULT_CONFIG_TEMPLATE)?;

    println!("Created config file at {}", path.display());
    Ok(())
}

const DEFAULT_CONFIG_TEMPLATE: &str = r#"# credproxy configuration

[logging]
level = "info"

[audit]
enabled = true
# file = "~/.local/state/credproxy/credproxy.audit.jsonl"

[ssh]
# none | agent | proxy | keys
forward = "none"
# Comment or fingerprint fragments; a non-empty list turns "agent" into "proxy"
allowed_keys = []
# agent_socket = "/run/user/1000/ssh-agent.sock"   # default: $SSH_AUTH_SOCK

[gpg]
# none | agent | proxy
forward = "none"
# Keygrip fragments (case-insensitive)
allowed_keys = []
# agent_socket = "~/.gnupg/S.gpg-agent"   # default: gpgconf --list-dirs agent-socket

[tmux]
forward = false

[secrets]
# Deliver the variables below as files instead of environment
isolate = true
names = []
mount_path = "/run/secrets"

[cleanup]
legacy_max_age_hours = 24
# base_dir = "/run/user/1000/credproxy"

[sandbox]
home = "/home/sandbox"
"#;
