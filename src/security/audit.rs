//! Append-only audit log of credential allow/deny decisions.
//!
//! One [`AuditLog`] is constructed at process start and shared by
//! reference (`Arc`) with every proxy. It starts disabled; [`AuditLog::enable`]
//! points it at a file and [`AuditLog::disable`] closes it again.
//!
//! # Format
//!
//! One JSON object per line (JSONL):
//!
//! | Field | Description |
//! |-------|-------------|
//! | `timestamp` | RFC 3339 UTC, assigned by the log itself |
//! | `type` | `ssh_sign_allowed`, `ssh_key_filtered`, `gpg_decrypt_denied`, ... |
//! | `key_id` | Key identifier, when known (omitted otherwise) |
//! | `comment` | Key comment, when known (omitted otherwise) |
//! | `allowed` | Outcome of the decision |
//! | `reason` | Why a request was denied (omitted otherwise) |
//!
//! The file is opened append-only with 0600 permissions. Entries are never
//! rewritten.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

/// Kinds of decisions recorded in the audit log.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    SshSignAllowed,
    SshSignDenied,
    SshKeyListed,
    SshKeyFiltered,
    GpgSignAllowed,
    GpgSignDenied,
    GpgDecryptAllowed,
    GpgDecryptDenied,
}

/// A single audit record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditEvent {
    /// Overwritten with the current UTC time when the event is logged.
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub event_type: AuditEventType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    pub allowed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Builders drop empty strings so optional fields stay absent.
impl AuditEvent {
    pub fn new(event_type: AuditEventType, allowed: bool) -> Self {
        Self {
            timestamp: Utc::now(),
            event_type,
            key_id: None,
            comment: None,
            allowed,
            reason: None,
        }
    }

    pub fn with_key_id(mut self, key_id: impl Into<String>) -> Self {
        let key_id = key_id.into();
        self.key_id = (!key_id.is_empty()).then_some(key_id);
        self
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        let comment = comment.into();
        self.comment = (!comment.is_empty()).then_some(comment);
        self
    }

    pub fn with_reason(mut self, reason: Option<&str>) -> Self {
        self.reason = reason.filter(|r| !r.is_empty()).map(str::to_string);
        self
    }
}

/// Process-wide audit sink. Disabled until [`AuditLog::enable`] is called.
#[derive(Debug, Default)]
pub struct AuditLog {
    state: Mutex<AuditState>,
}

#[derive(Debug, Default)]
struct AuditState {
    file: Option<File>,
    path: Option<PathBuf>,
}

impl AuditLog {
    /// A disabled log. Nothing is written until [`AuditLog::enable`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Open `path` for appending (0600), replacing any previously open file.
    pub fn enable(&self, path: &Path) -> Result<()> {
        let mut state = self.lock();

        // Close the old handle before opening the new one.
        state.file = None;
        state.path = None;

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create audit log directory {}", parent.display())
            })?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .mode(0o600)
            .open(path)
            .with_context(|| format!("Failed to open audit log {}", path.display()))?;

        state.file = Some(file);
        state.path = Some(path.to_path_buf());
        tracing::debug!("Audit log enabled at {}", path.display());
        Ok(())
    }

    /// Close the file and stop logging.
    pub fn disable(&self) {
        let mut state = self.lock();
        state.file = None;
        state.path = None;
    }

    pub fn is_enabled(&self) -> bool {
        self.lock().file.is_some()
    }

    /// Path of the currently open log, if any.
    pub fn path(&self) -> Option<PathBuf> {
        self.lock().path.clone()
    }

    /// Append one event. A no-op when disabled; failures are swallowed.
    pub fn log_event(&self, mut event: AuditEvent) {
        let mut state = self.lock();
        let Some(file) = state.file.as_mut() else {
            return;
        };

        event.timestamp = Utc::now();
        let Ok(mut line) = serde_json::to_string(&event) else {
            return;
        };
        line.push('\n');

        // Single write so concurrent appenders in other processes never split a line.
        if let Err(e) = file.write_all(line.as_bytes()) {
            tracing::debug!("Audit write failed: {}", e);
        }
    }

    pub fn log_ssh_sign(&self, comment: &str, fingerprint: &str, allowed: bool, reason: Option<&str>) {
        let event_type = if allowed {
            AuditEventType::SshSignAllowed
        } else {
            AuditEventType::SshSignDenied
        };
        self.log_event(
            AuditEvent::new(event_type, allowed)
                .with_key_id(fingerprint)
                .with_comment(comment)
                .with_reason(reason),
        );
    }

    pub fn log_ssh_key_access(&self, comment: &str, fingerprint: &str, allowed: bool) {
        let event_type = if allowed {
            AuditEventType::SshKeyListed
        } else {
            AuditEventType::SshKeyFiltered
        };
        self.log_event(
            AuditEvent::new(event_type, allowed)
                .with_key_id(fingerprint)
                .with_comment(comment),
        );
    }

    pub fn log_gpg_sign(&self, keygrip: &str, allowed: bool, reason: Option<&str>) {
        let event_type = if allowed {
            AuditEventType::GpgSignAllowed
        } else {
            AuditEventType::GpgSignDenied
        };
        self.log_event(
            AuditEvent::new(event_type, allowed)
                .with_key_id(keygrip)
                .with_reason(reason),
        );
    }

    pub fn log_gpg_decrypt(&self, keygrip: &str, allowed: bool, reason: Option<&str>) {
        let event_type = if allowed {
            AuditEventType::GpgDecryptAllowed
        } else {
            AuditEventType::GpgDecryptDenied
        };
        self.log_event(
            AuditEvent::new(event_type, allowed)
                .with_key_id(keygrip)
                .with_reason(reason),
        );
    }

    fn lock(&self) -> MutexGuard<'_, AuditState> {
        // Both fields are replaced wholesale, so a poisoned lock is still consistent.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Read and parse all entries from an audit log.
///
/// Corrupted lines are skipped. Returns an empty vector if the file does not
/// exist.
pub fn read_audit_log(path: &Path) -> Result<Vec<AuditEvent>> {
    if !path.exists() {
        return Ok(Vec::new());
    }

    let content = fs::read_to_string(path).context("Failed to read audit log")?;
    Ok(content
        .lines()
        .filter(|line| !line.is_empty())
        .filter_map(|line| serde_json::from_str::<AuditEvent>(line).ok())
        .collect())
}
