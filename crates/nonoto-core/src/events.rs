//! Schedulable musical content.
//!
//! - [`ScheduledEvent`] - A note event at a loop-relative beat
//! - [`ScheduledControlEvent`] - A controller change (sustain pedal)
//! - [`AudioClip`] - A mono sample buffer played in a loop
//! - [`Content`] - One complete generation pushed by a content producer
//! - [`Crossfade`] - Runtime state of a linear crossfade between the two slots

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::timing::BeatTime;

/// MIDI controller number of the sustain pedal.
pub const SUSTAIN_PEDAL: u8 = 64;

const MAX_NOTE: u8 = 127;
const MAX_CHANNEL: u8 = 15;

/// What an event does when it fires.
#[derive(Clone, Debug, PartialEq)]
pub enum NotePayload {
    NoteOn { note: u8, velocity: f32 },
    NoteOff { note: u8 },
    Chord { notes: Vec<u8>, velocity: f32 },
}

impl NotePayload {
    pub fn notes(&self) -> &[u8] {
        match self {
            NotePayload::NoteOn { note, .. } | NotePayload::NoteOff { note } => {
                std::slice::from_ref(note)
            }
            NotePayload::Chord { notes, .. } => notes,
        }
    }

    pub fn velocity(&self) -> Option<f32> {
        match self {
            NotePayload::NoteOn { velocity, .. } | NotePayload::Chord { velocity, .. } => {
                Some(*velocity)
            }
            NotePayload::NoteOff { .. } => None,
        }
    }
}

/// A note event at a beat position relative to the start of its content.
#[derive(Clone, Debug, PartialEq)]
pub struct ScheduledEvent {
    pub time: BeatTime,
    pub duration: BeatTime,
    pub channel: u8,
    pub payload: NotePayload,
}

impl ScheduledEvent {
    /// A single note on channel 0 at full velocity.
    pub fn note(time: f64, duration: f64, note: u8) -> Self {
        Self {
            time: BeatTime::from_float(time),
            duration: BeatTime::from_float(duration),
            channel: 0,
            payload: NotePayload::NoteOn {
                note,
                velocity: 1.0,
            },
        }
    }

    /// Set the channel for this event.
    pub fn on_channel(mut self, channel: u8) -> Self {
        self.channel = channel;
        self
    }

    /// Set the velocity for this event (ignored for note-offs).
    pub fn with_velocity(mut self, value: f32) -> Self {
        match &mut self.payload {
            NotePayload::NoteOn { velocity, .. } | NotePayload::Chord { velocity, .. } => {
                *velocity = value
            }
            NotePayload::NoteOff { .. } => {}
        }
        self
    }
}

/// A controller change at a beat position relative to the start of its content.
#[derive(Clone, Debug, PartialEq)]
pub struct ScheduledControlEvent {
    pub time: BeatTime,
    pub channel: u8,
    pub controller: u8,
    /// Normalized controller value in `[0, 1]`.
    pub value: f32,
}

impl ScheduledControlEvent {
    pub fn pedal(time: f64, down: bool) -> Self {
        Self {
            time: BeatTime::from_float(time),
            channel: 0,
            controller: SUSTAIN_PEDAL,
            value: if down { 1.0 } else { 0.0 },
        }
    }

    pub fn is_pedal(&self) -> bool {
        self.controller == SUSTAIN_PEDAL
    }

    pub fn pedal_down(&self) -> bool {
        self.value >= 0.5
    }
}

/// A mono sample buffer.
#[derive(Clone, Debug, PartialEq)]
pub struct AudioClip {
    pub sample_rate: u32,
    pub samples: Arc<[f32]>,
}

impl AudioClip {
    pub fn new(sample_rate: u32, samples: impl Into<Arc<[f32]>>) -> Self {
        Self {
            sample_rate,
            samples: samples.into(),
        }
    }

    /// Sample at `seconds` into the clip, zero outside it.
    pub fn sample_at(&self, seconds: f64) -> f32 {
        if seconds < 0.0 || self.sample_rate == 0 {
            return 0.0;
        }
        let index = (seconds * self.sample_rate as f64) as usize;
        self.samples.get(index).copied().unwrap_or(0.0)
    }

    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.samples.len() as f64 / self.sample_rate as f64)
    }
}

/// The two kinds of material a generation can hold.
#[derive(Clone, Debug, PartialEq)]
pub enum ContentBody {
    /// Discrete note and controller events (sheet / piano-roll tracks).
    Symbolic {
        events: Vec<ScheduledEvent>,
        control_events: Vec<ScheduledControlEvent>,
    },
    /// A continuous rendered signal (spectrogram inpainting output).
    Audio(AudioClip),
}

/// One complete piece of content handed over by a producer.
#[derive(Clone, Debug, PartialEq)]
pub struct Content {
    pub body: ContentBody,
    /// Length of the loop this content fills.
    pub duration_in_loop: BeatTime,
}

impl Content {
    pub fn symbolic(
        events: Vec<ScheduledEvent>,
        control_events: Vec<ScheduledControlEvent>,
        duration_in_loop: BeatTime,
    ) -> Self {
        Self {
            body: ContentBody::Symbolic {
                events,
                control_events,
            },
            duration_in_loop,
        }
    }

    pub fn audio(clip: AudioClip, duration_in_loop: BeatTime) -> Self {
        Self {
            body: ContentBody::Audio(clip),
            duration_in_loop,
        }
    }

    pub fn is_audio(&self) -> bool {
        matches!(self.body, ContentBody::Audio(_))
    }

    /// Reject empty or malformed material before it can reach a slot.
    pub fn validate(&self) -> Result<()> {
        if !self.duration_in_loop.is_positive() {
            return Err(Error::InvalidContent(format!(
                "duration in loop must be positive, got {}",
                self.duration_in_loop
            )));
        }

        match &self.body {
            ContentBody::Symbolic {
                events,
                control_events,
            } => {
                if events.is_empty() {
                    return Err(Error::InvalidContent("no note events".into()));
                }
                for event in events {
                    self.check_time(event.time)?;
                    check_channel(event.channel)?;
                    if event.duration < BeatTime::ZERO {
                        return Err(Error::InvalidContent(format!(
                            "negative duration {} at beat {}",
                            event.duration, event.time
                        )));
                    }
                    let notes = event.payload.notes();
                    if notes.is_empty() {
                        return Err(Error::InvalidContent(format!(
                            "empty chord at beat {}",
                            event.time
                        )));
                    }
                    if let Some(&note) = notes.iter().find(|&&n| n > MAX_NOTE) {
                        return Err(Error::InvalidContent(format!("note {note} out of range")));
                    }
                    if let Some(velocity) = event.payload.velocity() {
                        check_unit("velocity", velocity)?;
                    }
                }
                for control in control_events {
                    self.check_time(control.time)?;
                    check_channel(control.channel)?;
                    if control.controller > MAX_NOTE {
                        return Err(Error::InvalidContent(format!(
                            "controller {} out of range",
                            control.controller
                        )));
                    }
                    check_unit("controller value", control.value)?;
                }
            }
            ContentBody::Audio(clip) => {
                if clip.sample_rate == 0 {
                    return Err(Error::InvalidContent("sample rate must be positive".into()));
                }
                if clip.samples.is_empty() {
                    return Err(Error::InvalidContent("audio clip has no samples".into()));
                }
            }
        }
        Ok(())
    }

    fn check_time(&self, time: BeatTime) -> Result<()> {
        if time < BeatTime::ZERO || time >= self.duration_in_loop {
            return Err(Error::InvalidContent(format!(
                "event at beat {} outside [0, {})",
                time, self.duration_in_loop
            )));
        }
        Ok(())
    }
}

fn check_channel(channel: u8) -> Result<()> {
    if channel > MAX_CHANNEL {
        return Err(Error::InvalidContent(format!("channel {channel} out of range")));
    }
    Ok(())
}

fn check_unit(what: &str, value: f32) -> Result<()> {
    if !(0.0..=1.0).contains(&value) {
        return Err(Error::InvalidContent(format!("{what} {value} outside [0, 1]")));
    }
    Ok(())
}

/// Linear crossfade between the two generation slots.
///
/// The fade value is the weight of slot 1: 0.0 means slot 0 only, 1.0 means
/// slot 1 only.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Crossfade {
    pub from: f32,
    pub to: f32,
    pub start: Instant,
    pub duration: Duration,
}

impl Crossfade {
    /// Interpolated fade value at `time`.
    pub fn value_at(&self, time: Instant) -> f32 {
        if time <= self.start {
            return self.from;
        }
        let elapsed = time.duration_since(self.start);
        if elapsed >= self.duration || self.duration.is_zero() {
            return self.to;
        }
        let t = elapsed.as_secs_f64() / self.duration.as_secs_f64();
        self.from + (self.to - self.from) * t as f32
    }

    /// Per-slot gains at `time`; they always sum to one.
    pub fn gains_at(&self, time: Instant) -> [f32; 2] {
        let value = self.value_at(time);
        [1.0 - value, value]
    }

    pub fn is_complete_at(&self, time: Instant) -> bool {
        time.saturating_duration_since(self.start) >= self.duration
    }
}
