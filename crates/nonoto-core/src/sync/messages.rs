//! Wire messages exchanged with a tempo authority.
//!
//! Requests are correlated with their responses by id; push events carry no
//! id. Frames serialize as tagged JSON objects, e.g.
//! `{"id":3,"type":"set-tempo","bpm":128.0}` or
//! `{"kind":"event","event":{"type":"downbeat"}}`.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Requests a client sends to the authority.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SyncRequest {
    Enable,
    Disable,
    GetTempo,
    GetQuantum,
    GetPhase,
    GetNumPeers,
    SetTempo { bpm: f64 },
    SetQuantum { quantum: f64 },
    Ping,
}

impl SyncRequest {
    /// Short name used in logs and errors.
    pub fn name(&self) -> &'static str {
        match self {
            SyncRequest::Enable => "enable",
            SyncRequest::Disable => "disable",
            SyncRequest::GetTempo => "get-tempo",
            SyncRequest::GetQuantum => "get-quantum",
            SyncRequest::GetPhase => "get-phase",
            SyncRequest::GetNumPeers => "get-num-peers",
            SyncRequest::SetTempo { .. } => "set-tempo",
            SyncRequest::SetQuantum { .. } => "set-quantum",
            SyncRequest::Ping => "ping",
        }
    }
}

/// Answers to [`SyncRequest`]s.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SyncResponse {
    Enabled,
    Disabled,
    Tempo { bpm: f64 },
    Quantum { quantum: f64 },
    /// Beats elapsed within the current quantum.
    Phase { phase: f64 },
    NumPeers { count: u32 },
    Ack,
    Pong,
    Error { message: String },
}

/// Unsolicited notifications from the authority.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SyncEvent {
    Tempo { bpm: f64 },
    Quantum { quantum: f64 },
    NumPeers { count: u32 },
    Downbeat,
    Pong,
}

/// Client-to-authority frame.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OutboundFrame {
    pub id: u64,
    #[serde(flatten)]
    pub request: SyncRequest,
}

/// Authority-to-client frame.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum InboundFrame {
    Response { id: u64, response: SyncResponse },
    Event { event: SyncEvent },
}

/// A message for the user, shown for `display_for`.
#[derive(Clone, Debug, PartialEq)]
pub struct Notice {
    pub message: String,
    pub display_for: Duration,
}

/// Signals published by the synchronization client.
#[derive(Clone, Debug, PartialEq)]
pub enum ClientEvent {
    SynchronizationStarted,
    SynchronizationStopped,
    TempoChanged(f64),
    QuantumChanged(f64),
    PeersChanged(u32),
    Downbeat,
    Pong,
    /// The channel to the authority is gone; synchronization is off.
    Disconnected,
    Notice(Notice),
}

/// Client end of an abstract transport to the authority.
#[derive(Debug)]
pub struct SyncChannel {
    pub outbound: mpsc::UnboundedSender<OutboundFrame>,
    pub inbound: mpsc::UnboundedReceiver<InboundFrame>,
}

/// Authority end of a [`SyncChannel`].
#[derive(Debug)]
pub struct AuthorityEnd {
    pub requests: mpsc::UnboundedReceiver<OutboundFrame>,
    pub frames: mpsc::UnboundedSender<InboundFrame>,
}

impl SyncChannel {
    /// An in-memory channel and its authority end.
    pub fn pair() -> (SyncChannel, AuthorityEnd) {
        let (outbound, requests) = mpsc::unbounded_channel();
        let (frames, inbound) = mpsc::unbounded_channel();
        (
            SyncChannel { outbound, inbound },
            AuthorityEnd { requests, frames },
        )
    }
}

impl AuthorityEnd {
    pub fn respond(&self, id: u64, response: SyncResponse) -> bool {
        self.frames
            .send(InboundFrame::Response { id, response })
            .is_ok()
    }

    pub fn push(&self, event: SyncEvent) -> bool {
        self.frames.send(InboundFrame::Event { event }).is_ok()
    }
}
