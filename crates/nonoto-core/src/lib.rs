//! NONOTO Core - Playback transport and content scheduling for the NONOTO editor.
//!
//! This crate provides the timing heart of the editor:
//!
//! - **Timing** - Fixed-point beat time, time signatures, latency compensation
//! - **Transport** - The logical musical clock with loop support
//! - **Scheduler** - Lookahead event scheduling against the transport
//! - **Double buffer** - Glitch-free replacement of the content being played
//! - **Playback** - Play/stop/enable state machine, optionally synchronized
//! - **Sync** - Client for an external tempo authority and phase locking
//!
//! # Architecture
//!
//! A single [`SharedTransport`] is the source of truth for musical time. The
//! [`PlaybackManager`] decides whether it may run, the
//! [`DoubleBufferedContentScheduler`] maps content onto it, and the
//! [`PhaseLockLoop`](sync::PhaseLockLoop) nudges it toward the session phase
//! when synchronization is enabled. Content producers hand new material over
//! through a [`ContentPublisher`], which is drained at the next scheduling
//! tick.

pub mod config;
pub mod content;
pub mod double_buffer;
pub mod error;
pub mod events;
pub mod playback;
pub mod scheduler;
pub mod sink;
pub mod sync;
pub mod timing;
pub mod transport;

pub use config::{PhaseLockConfig, PlaybackConfig};
pub use content::{content_channel, ContentFeed, ContentPublisher, ContentRequest, ContentUpdate};
pub use double_buffer::{
    ContentGeneration, ContentTicket, DoubleBufferedContentScheduler, SlotId, SwapReport,
};
pub use error::{ConflictKind, Error, Result};
pub use events::{
    AudioClip, Content, ContentBody, Crossfade, NotePayload, ScheduledControlEvent,
    ScheduledEvent,
};
pub use playback::{AudioContext, PlayStart, PlaybackManager, PlaybackState, SynchronizedPlayback};
pub use scheduler::EventScheduler;
pub use sink::{NoteSink, RecordingSink};
pub use sync::{ClientEvent, LoopbackAuthority, SyncChannel, SyncClient, SyncState};
pub use timing::{BarsBeatsTicks, BeatTime, LatencyCompensation, LatencyMode, TimeSignature};
pub use transport::{SharedTransport, TransportClock, TransportSnapshot};
