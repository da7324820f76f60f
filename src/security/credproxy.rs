//! # credproxy Security Primitives
//!
//! Front door for the primitives every credential channel relies on. All
//! security-relevant types and functions are re-exported here.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                  credproxy.rs (you are here)                     │
//! │                  Public API facade & documentation               │
//! ├──────────────────────┬─────────────────────┬────────────────────┤
//! │  audit.rs            │  scrub.rs           │  lease.rs          │
//! │  Append-only JSONL   │  Random overwrite,  │  Owner pid         │
//! │  decision log        │  fsync, unlink      │  sentinel + sweep  │
//! └──────────────────────┴─────────────────────┴────────────────────┘
//! ```
//!
//! ## Security Model
//!
//! 1. **Every decision is recorded**: each identity listed or filtered and
//!    each sign/decrypt allowed or denied by an agent proxy is exactly one
//!    line in the audit log. The log stamps its own UTC time.
//!
//! 2. **Secrets do not linger on disk**: files that held secret values are
//!    overwritten with CSPRNG output and synced before they are unlinked.
//!
//! 3. **Crashes do not leak resources forever**: resource directories carry
//!    the owner's pid; a startup sweep reclaims those whose owner died, and
//!    falls back to a long age cutoff when no owner is recorded.
//!
//! ## File Hierarchy
//!
//! ```text
//! $XDG_STATE_HOME/credproxy/
//! └── credproxy.audit.jsonl            # Append-only audit log (0600)
//! $XDG_RUNTIME_DIR/credproxy/          # Resource base (0700)
//! ├── ssh-proxy-XXXXXX/                # 0700
//! │   ├── .credproxy.pid               # Lease sentinel (0600)
//! │   └── agent.1234                   # Proxy socket (0600)
//! └── credproxy-secrets-XXXXXX/        # 0700
//!     ├── .credproxy.pid
//!     └── ANTHROPIC_API_KEY            # Secret value (0600)
//! ```
//!
//! ## Threat Model
//!
//! | Threat | Defense Layer |
//! |--------|--------------|
//! | Sandbox signs with a key it should not use | Allow-list + protocol refusal |
//! | Sandbox enumerates all host keys | Identity list filtering |
//! | Secret recovered from freed disk blocks | Scrub before unlink |
//! | Secret read from `/proc/<pid>/environ` | Secrets delivered as files |
//! | Socket hijacked by another local user | 0700 dir + 0600 socket |
//! | Process killed before teardown | Lease sweep at next start |

// ── Audit Log ───────────────────────────────────────────────────────

pub use super::audit::{AuditEvent, AuditEventType, AuditLog, read_audit_log};

// ── Scrubbing ───────────────────────────────────────────────────────

pub use super::scrub::{ScrubError, scrub_and_remove, scrub_file};

// ── Resource Leases ─────────────────────────────────────────────────

pub use super::lease::{
    DEFAULT_LEGACY_MAX_AGE, GPG_PROXY_PREFIX, LEASE_FILENAME, RESOURCE_PREFIXES, SECRETS_PREFIX,
    SSH_PROXY_PREFIX, SSH_SAFE_PREFIX, SweepReport, TMUX_PROXY_PREFIX, create_owned_dir,
    is_orphaned, process_exists, sweep, sweep_all, write_lease,
};
