//! Credential forwarding channels.
//!
//! Every channel is a [`ForwardChannel`]: a relay socket inside a leased
//! directory, serving each client on its own thread with a fresh upstream
//! connection. What happens on that connection is decided by a
//! [`ConnectionHandler`]:
//!
//! - [`Passthrough`] copies bytes verbatim (tmux control socket)
//! - [`SshAgentFilter`] interposes on identity listing and signing
//! - [`GpgAgentFilter`] interposes on `PKSIGN`/`PKDECRYPT`
//!
//! Policy decisions of the filters go to the shared [`AuditLog`](crate::security::AuditLog).

mod error;
mod gpg;
mod policy;
mod relay;
mod ssh;

pub use error::{ForwardError, ForwardResult};
pub use gpg::{ERR_FORBIDDEN, GpgAgentFilter, gpg_agent_proxy};
pub use policy::{AllowList, CredentialPolicy, ForwardMode};
pub use relay::{
    ChannelKind, ConnectionHandler, ForwardChannel, Passthrough, SocketRelay, check_upstream,
    pump, tmux_relay,
};
pub use ssh::{Identity, SshAgentFilter, fingerprint, ssh_agent_proxy};
