//! Playback control.

mod manager;
mod synchronized;

pub use manager::{AudioContext, PlaybackManager, PlaybackState, RunningContext};
pub use synchronized::{PlayStart, SynchronizedPlayback};
