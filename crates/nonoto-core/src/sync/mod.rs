//! Synchronization with an external tempo authority.
//!
//! [`SyncClient`] speaks the request/response protocol in [`messages`] over
//! any [`SyncChannel`]: the in-process [`loopback`] authority, a TCP
//! connection from [`json_lines`], or a test harness holding the
//! [`AuthorityEnd`](messages::AuthorityEnd). [`PhaseLockLoop`] keeps the local
//! transport aligned with the session phase.

pub mod client;
pub mod json_lines;
pub mod loopback;
pub mod messages;
pub mod phase_lock;

pub use client::{SyncClient, SyncSession, SyncState};
pub use loopback::{LoopbackAuthority, LoopbackHandle};
pub use messages::{ClientEvent, Notice, SyncChannel};
pub use phase_lock::{PhaseCorrector, PhaseLockHandle, PhaseLockLoop, PhaseReport};
