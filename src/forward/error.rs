//! Error types for credential forwarding channels.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ForwardError {
    /// The host-side socket is missing, not a socket, or nobody is listening.
    /// Callers degrade by skipping the channel.
    #[error("upstream socket {} unavailable: {reason}", .path.display())]
    UpstreamUnavailable { path: PathBuf, reason: String },

    /// The channel could not be established. Never degrade to an unfiltered
    /// path on this error.
    #[error("failed to {what}: {source}")]
    Setup {
        what: String,
        #[source]
        source: anyhow::Error,
    },
}

impl ForwardError {
    pub(crate) fn setup(what: impl Into<String>, source: impl Into<anyhow::Error>) -> Self {
        ForwardError::Setup {
            what: what.into(),
            source: source.into(),
        }
    }

    pub fn is_upstream_unavailable(&self) -> bool {
        matches!(self, ForwardError::UpstreamUnavailable { .. })
    }
}

/// Result type for forwarding operations.
pub type ForwardResult<T> = Result<T, ForwardError>;
