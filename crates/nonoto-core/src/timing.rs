//! Timing primitives for the transport and the scheduler.
//!
//! - [`BeatTime`] - Fixed-point beat representation used for every musical position
//! - [`TimeSignature`] - Musical time signature (e.g., 4/4, 3/4)
//! - [`BarsBeatsTicks`] - Human-readable `bar:beat:tick` view of a position
//! - [`LatencyCompensation`] - Lookahead horizons and output latency

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Fixed-point beat representation with 16 fractional bits.
///
/// Positions, loop bounds and event times are all expressed in quarter-note
/// beats. Fixed-point keeps loop arithmetic exact over long sessions.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BeatTime {
    beats: i64,
}

impl BeatTime {
    const SCALE: i64 = 65_536;

    /// Zero beat time constant.
    pub const ZERO: BeatTime = BeatTime { beats: 0 };

    /// Smallest representable step.
    pub const EPSILON: BeatTime = BeatTime { beats: 1 };

    /// Create a BeatTime from a floating-point beat value.
    #[inline]
    pub fn from_float(value: f64) -> Self {
        Self {
            beats: (value * Self::SCALE as f64).round() as i64,
        }
    }

    /// Convert to a floating-point beat value.
    #[inline]
    pub fn to_float(self) -> f64 {
        self.beats as f64 / Self::SCALE as f64
    }

    /// Position of the start of `bars` bars in the given signature.
    pub fn from_bars(bars: f64, signature: TimeSignature) -> Self {
        Self::from_float(bars * signature.beats_per_bar())
    }

    /// Convert to bars in the given signature.
    pub fn to_bars(self, signature: TimeSignature) -> f64 {
        self.to_float() / signature.beats_per_bar()
    }

    pub fn is_positive(self) -> bool {
        self.beats > 0
    }
}

impl std::ops::Add for BeatTime {
    type Output = Self;

    fn add(self, rhs: Self) -> Self::Output {
        Self {
            beats: self.beats.saturating_add(rhs.beats),
        }
    }
}

impl std::ops::Sub for BeatTime {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self::Output {
        Self {
            beats: self.beats.saturating_sub(rhs.beats),
        }
    }
}

impl From<f64> for BeatTime {
    fn from(value: f64) -> Self {
        BeatTime::from_float(value)
    }
}

impl From<BeatTime> for f64 {
    fn from(value: BeatTime) -> Self {
        value.to_float()
    }
}

impl fmt::Display for BeatTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.3}", self.to_float())
    }
}

/// Musical time signature (numerator/denominator).
///
/// The numerator indicates beats per bar, and the denominator indicates
/// the note value that gets one beat (4 = quarter note, 8 = eighth note).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeSignature {
    pub numerator: u32,
    pub denominator: u32,
}

impl TimeSignature {
    /// Create a new time signature.
    ///
    /// Values are clamped to at least 1 to prevent division by zero.
    pub fn new(numerator: u32, denominator: u32) -> Self {
        Self {
            numerator: numerator.max(1),
            denominator: denominator.max(1),
        }
    }

    /// Calculate the number of quarter-note beats per bar.
    ///
    /// For 4/4: 4 beats per bar
    /// For 3/4: 3 beats per bar
    /// For 6/8: 3 beats per bar (6 eighth notes = 3 quarter notes)
    pub fn beats_per_bar(&self) -> f64 {
        self.numerator as f64 * (4.0 / self.denominator as f64)
    }
}

impl Default for TimeSignature {
    fn default() -> Self {
        Self::new(4, 4)
    }
}

impl fmt::Display for TimeSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.numerator, self.denominator)
    }
}

/// Zero-based `bar:beat:tick` view of a position, 480 ticks per beat.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct BarsBeatsTicks {
    pub bar: u32,
    pub beat: u32,
    pub tick: u32,
}

impl BarsBeatsTicks {
    pub const TICKS_PER_BEAT: u32 = 480;

    /// Break a (non-negative) position down into bars, beats and ticks.
    pub fn from_beats(position: BeatTime, signature: TimeSignature) -> Self {
        let total_ticks =
            (position.to_float().max(0.0) * Self::TICKS_PER_BEAT as f64).round() as u64;
        let ticks_per_bar =
            (signature.beats_per_bar() * Self::TICKS_PER_BEAT as f64).round().max(1.0) as u64;

        let bar = total_ticks / ticks_per_bar;
        let within_bar = total_ticks % ticks_per_bar;
        let beat = within_bar / Self::TICKS_PER_BEAT as u64;
        let tick = within_bar % Self::TICKS_PER_BEAT as u64;

        Self {
            bar: bar as u32,
            beat: beat as u32,
            tick: tick as u32,
        }
    }
}

impl fmt::Display for BarsBeatsTicks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{:03}", self.bar, self.beat, self.tick)
    }
}

/// Scheduling horizon in use.
///
/// `Interactive` keeps the lookahead small so edits are heard quickly,
/// `Stable` trades latency for robustness during unattended playback.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LatencyMode {
    Interactive,
    #[default]
    Stable,
}

impl LatencyMode {
    pub fn toggled(self) -> Self {
        match self {
            LatencyMode::Interactive => LatencyMode::Stable,
            LatencyMode::Stable => LatencyMode::Interactive,
        }
    }
}

/// Lookahead and output latency configuration.
///
/// The active lookahead is how far ahead of real time events are handed to
/// the sink. The same amount, plus the sink's own output latency, is added
/// to the phase received from a tempo authority so that what is heard lines
/// up with the other peers.
#[derive(Clone, Debug, PartialEq)]
pub struct LatencyCompensation {
    /// Lookahead used in [`LatencyMode::Interactive`].
    pub interactive_lookahead: Duration,
    /// Lookahead used in [`LatencyMode::Stable`].
    pub stable_lookahead: Duration,
    /// Latency of the output device (e.g. a hardware MIDI port).
    pub output_latency: Duration,
    /// Currently active mode.
    pub mode: LatencyMode,
}

impl Default for LatencyCompensation {
    fn default() -> Self {
        Self {
            interactive_lookahead: Duration::from_millis(100),
            stable_lookahead: Duration::from_millis(150),
            output_latency: Duration::ZERO,
            mode: LatencyMode::Stable,
        }
    }
}

impl LatencyCompensation {
    /// Lookahead for the active mode.
    pub fn lookahead(&self) -> Duration {
        match self.mode {
            LatencyMode::Interactive => self.interactive_lookahead,
            LatencyMode::Stable => self.stable_lookahead,
        }
    }

    /// Lookahead plus output latency.
    pub fn total(&self) -> Duration {
        self.lookahead() + self.output_latency
    }

    /// Total latency expressed in beats at the given tempo.
    pub fn compensation_beats(&self, bpm: f64) -> f64 {
        (bpm / 60.0) * self.total().as_secs_f64()
    }
}
