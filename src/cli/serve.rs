//! CLI subcommand: `credproxy serve`
//!
//! Prepares every configured credential channel, prints what a sandbox
//! launcher needs (mounts, environment overrides, variables to drop) as a
//! single JSON line on stdout, then holds the channels open until SIGINT or
//! SIGTERM. Everything is torn down before exit.

use anyhow::Result;
use clap::Args;
use serde::Serialize;
use tracing::warn;

use crate::config::Config;
use crate::delivery::{
    CredentialDelivery, DeliveryRequest, MountSpec, collect_env, prepare_delivery,
};
use crate::secrets::EnvMap;

use super::{block_shutdown_signals, open_audit_log, run_sweep, wait_for_shutdown};

#[derive(Args)]
pub struct ServeArgs {
    /// Additional environment variable to deliver as a secret file
    #[arg(long = "secret", value_name = "NAME")]
    pub secrets: Vec<String>,

    /// Pretty-print the delivery description
    #[arg(long)]
    pub pretty: bool,
}

/// What a launcher applies to the sandbox.
#[derive(Debug, Serialize)]
struct DeliveryReport<'a> {
    mounts: &'a [MountSpec],
    env: &'a EnvMap,
    unset: &'a [String],
    warnings: &'a [String],
}

impl<'a> From<&'a CredentialDelivery> for DeliveryReport<'a> {
    fn from(delivery: &'a CredentialDelivery) -> Self {
        Self {
            mounts: &delivery.mounts,
            env: &delivery.overrides,
            unset: &delivery.unset,
            warnings: &delivery.warnings,
        }
    }
}

pub fn run(args: ServeArgs, config: &Config) -> Result<()> {
    let signals = block_shutdown_signals()?;
    run_sweep(config);
    let audit = open_audit_log(config);

    let env = collect_env(std::env::vars_os());
    let request = DeliveryRequest::from_config(config, env, &args.secrets);
    let mut delivery = prepare_delivery(&request, &audit)?;
    for warning in &delivery.warnings {
        warn!("{}", warning);
    }

    let report = DeliveryReport::from(&delivery);
    let line = if args.pretty {
        serde_json::to_string_pretty(&report)?
    } else {
        serde_json::to_string(&report)?
    };
    println!("{}", line);

    let waited = wait_for_shutdown(&signals);
    delivery.teardown();
    waited.map(|_| ())
}
