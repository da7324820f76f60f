//! credproxy - filtered credential forwarding for sandboxed processes
//!
//! This crate provides:
//! - Unix socket relays with per-connection handlers
//! - ssh-agent and gpg-agent proxies that enforce key allow-lists
//! - A broker that moves secret environment variables into scrubbed files
//! - Lease-based cleanup of resources left behind by crashed runs
//! - An append-only audit log of every allow/deny decision

pub mod cli;
pub mod config;
pub mod delivery;
pub mod forward;
pub mod paths;
pub mod secrets;
pub mod security;

pub use config::Config;
