//! Error types for the playback core.

use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Why a content swap or staging operation was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictKind {
    /// `swap()` was called with nothing loaded into the inactive slot.
    NothingStaged,
    /// A content request was completed after a newer one had been started.
    Superseded { request: u64, latest: u64 },
}

impl fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConflictKind::NothingStaged => write!(f, "no content staged for swap"),
            ConflictKind::Superseded { request, latest } => {
                write!(f, "content request {request} superseded by request {latest}")
            }
        }
    }
}

/// Errors raised by the transport, the scheduler and the synchronization client.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Error {
    #[error("synchronization request '{request}' timed out after {timeout:?}")]
    ProtocolTimeout {
        request: &'static str,
        timeout: Duration,
    },

    #[error("synchronization channel disconnected")]
    ProtocolDisconnected,

    #[error("unexpected response to '{request}': {response}")]
    UnexpectedResponse {
        request: &'static str,
        response: String,
    },

    #[error("synchronization request '{0}' cancelled")]
    Cancelled(&'static str),

    #[error("invalid content: {0}")]
    InvalidContent(String),

    #[error("scheduling conflict: {0}")]
    SchedulingConflict(ConflictKind),

    #[error("audio context suspended by the host")]
    AudioContextSuspended,

    #[error("invalid tempo: {0} BPM")]
    InvalidTempo(f64),

    #[error("invalid loop region [{start}, {end})")]
    InvalidLoop { start: f64, end: f64 },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl Error {
    /// Protocol failures degrade synchronization to local-only playback
    /// instead of stopping it.
    pub fn is_protocol(&self) -> bool {
        matches!(
            self,
            Error::ProtocolTimeout { .. }
                | Error::ProtocolDisconnected
                | Error::UnexpectedResponse { .. }
                | Error::Cancelled(_)
        )
    }
}
