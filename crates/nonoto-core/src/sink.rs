//! Output side of the scheduler.
//!
//! A [`NoteSink`] is the software instrument or MIDI port that actually makes
//! sound. Events reach it ahead of time, stamped with the instant at which
//! they must be heard.

use std::time::{Duration, Instant};

/// Receiver of scheduled notes and pedal changes.
///
/// Note-offs arrive as `play_note` calls with zero velocity and zero duration.
pub trait NoteSink {
    fn play_note(&mut self, time: Instant, note: u8, velocity: f32, duration: Duration, channel: u8);

    fn trigger_pedal(&mut self, time: Instant, down: bool);
}

/// A note handed to a [`RecordingSink`].
#[derive(Clone, Debug, PartialEq)]
pub struct FiredNote {
    pub time: Instant,
    pub note: u8,
    pub velocity: f32,
    pub duration: Duration,
    pub channel: u8,
}

/// Sink that keeps everything it receives.
#[derive(Clone, Debug, Default)]
pub struct RecordingSink {
    pub notes: Vec<FiredNote>,
    pub pedals: Vec<(Instant, bool)>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Notes with the given pitch, in the order they were received.
    pub fn notes_with_pitch(&self, note: u8) -> impl Iterator<Item = &FiredNote> {
        self.notes.iter().filter(move |fired| fired.note == note)
    }

    pub fn clear(&mut self) {
        self.notes.clear();
        self.pedals.clear();
    }
}

impl NoteSink for RecordingSink {
    fn play_note(&mut self, time: Instant, note: u8, velocity: f32, duration: Duration, channel: u8) {
        self.notes.push(FiredNote {
            time,
            note,
            velocity,
            duration,
            channel,
        });
    }

    fn trigger_pedal(&mut self, time: Instant, down: bool) {
        self.pedals.push((time, down));
    }
}

impl<S: NoteSink + ?Sized> NoteSink for &mut S {
    fn play_note(&mut self, time: Instant, note: u8, velocity: f32, duration: Duration, channel: u8) {
        (**self).play_note(time, note, velocity, duration, channel)
    }

    fn trigger_pedal(&mut self, time: Instant, down: bool) {
        (**self).trigger_pedal(time, down)
    }
}
