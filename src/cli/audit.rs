//! CLI subcommand: `credproxy audit`

use anyhow::Result;
use clap::{Args, Subcommand};
use std::path::PathBuf;

use crate::config::Config;
use crate::security::{AuditEvent, read_audit_log};

#[derive(Args)]
pub struct AuditArgs {
    #[command(subcommand)]
    pub command: AuditCommands,
}

#[derive(Subcommand)]
pub enum AuditCommands {
    /// Print recorded allow/deny decisions
    Show {
        /// Audit log to read (default: configured location)
        #[arg(short, long)]
        file: Option<PathBuf>,

        /// Only show the most recent N entries
        #[arg(short = 'n', long)]
        limit: Option<usize>,

        /// Only show denied or filtered decisions
        #[arg(long)]
        denied: bool,

        /// Print raw JSON lines
        #[arg(long)]
        json: bool,
    },
}

pub fn run(args: AuditArgs, config: &Config) -> Result<()> {
    match args.command {
        AuditCommands::Show {
            file,
            limit,
            denied,
            json,
        } => show(config, file, limit, denied, json),
    }
}

fn show(
    config: &Config,
    file: Option<PathBuf>,
    limit: Option<usize>,
    denied: bool,
    json: bool,
) -> Result<()> {
    let path = file.unwrap_or_else(|| config.audit_log_path());
    let mut events = read_audit_log(&path)?;
    if denied {
        events.retain(|e| !e.allowed);
    }
    if let Some(limit) = limit {
        let skip = events.len().saturating_sub(limit);
        events.drain(..skip);
    }

    if events.is_empty() {
        eprintln!("No audit entries in {}", path.display());
        return Ok(());
    }

    for event in &events {
        if json {
            println!("{}", serde_json::to_string(event)?);
        } else {
            println!("{}", format_event(event));
        }
    }
    Ok(())
}

fn format_event(event: &AuditEvent) -> String {
    let verdict = if event.allowed { "allow" } else { "DENY " };
    let event_type = serde_json::to_value(event.event_type)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_default();

    let mut line = format!(
        "{} {} {:<19}",
        event.timestamp.format("%Y-%m-%d %H:%M:%S"),
        verdict,
        event_type
    );
    if let Some(ref key_id) = event.key_id {
        line.push(' ');
        line.push_str(key_id);
    }
    if let Some(ref comment) = event.comment {
        line.push_str(&format!(" ({})", comment));
    }
    if let Some(ref reason) = event.reason {
        line.push_str(&format!(" - {}", reason));
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::AuditEventType;

    #[test]
    fn format_denied_event() {
        let event = AuditEvent::new(AuditEventType::SshSignDenied, false)
            .with_key_id("SHA256:abc")
            .with_comment("personal@laptop")
            .with_reason(Some("key not in allowed list"));

        let line = format_event(&event);
        assert!(line.contains("DENY"));
        assert!(line.contains("ssh_sign_denied"));
        assert!(line.contains("SHA256:abc (personal@laptop)"));
        assert!(line.ends_with("- key not in allowed list"));
    }

    #[test]
    fn format_minimal_event() {
        let event = AuditEvent::new(AuditEventType::GpgDecryptAllowed, true);
        let line = format_event(&event);
        assert!(line.contains("allow"));
        assert!(line.trim_end().ends_with("gpg_decrypt_allowed"));
    }
}
