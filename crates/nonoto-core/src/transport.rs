//! The logical musical clock.
//!
//! [`TransportClock`] is pure state: it never blocks and never performs I/O.
//! Every query and mutator takes the caller's notion of `now`, which keeps the
//! clock deterministic under test and lets the scheduler ask "where will the
//! transport be at instant t" for instants inside its lookahead window.
//!
//! Positions are derived from an anchor: the beat reached at `anchor_instant`
//! plus the beats elapsed since then at the current tempo. Positions before
//! loop normalization are called *unwrapped* beats; they only move forward
//! while the clock runs and are what the scheduler maps events through.

use std::sync::{Arc, PoisonError, RwLock, Weak};
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::timing::{BarsBeatsTicks, BeatTime, TimeSignature};

/// A nudge may never cancel more than this share of the nominal beats
/// elapsing over its window, so the clock never stands still or reverses.
const MAX_NUDGE_SHARE: f64 = 0.9;

/// Phase correction being slewed in from `anchor_instant`.
#[derive(Clone, Copy, Debug, PartialEq)]
struct Nudge {
    beats: f64,
    duration: Duration,
}

/// Transport-aware clock for beat/time conversion with loop support.
#[derive(Clone, Debug)]
pub struct TransportClock {
    bpm: f64,
    signature: TimeSignature,
    running: bool,
    /// Before this instant a running clock holds at its start offset.
    start_instant: Instant,
    anchor_instant: Instant,
    anchor_beat: f64,
    loop_start: BeatTime,
    loop_end: BeatTime,
    looping: bool,
    nudge: Option<Nudge>,
    epoch: u64,
}

/// A consistent view of the transport computed under a single borrow.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TransportSnapshot {
    pub bpm: f64,
    pub signature: TimeSignature,
    pub position: BeatTime,
    pub progress: f64,
    pub loop_start: BeatTime,
    pub loop_end: BeatTime,
    pub looping: bool,
    pub running: bool,
    pub epoch: u64,
}

impl TransportSnapshot {
    /// Position as `bar:beat:tick`.
    pub fn bars_beats_ticks(&self) -> BarsBeatsTicks {
        BarsBeatsTicks::from_beats(self.position, self.signature)
    }
}

impl Default for TransportClock {
    fn default() -> Self {
        Self::new()
    }
}

impl TransportClock {
    /// Create a new transport clock at 120 BPM, 4/4 time, stopped at beat 0,
    /// with a one-bar loop region and looping off.
    pub fn new() -> Self {
        let now = Instant::now();
        let signature = TimeSignature::default();
        Self {
            bpm: 120.0,
            signature,
            running: false,
            start_instant: now,
            anchor_instant: now,
            anchor_beat: 0.0,
            loop_start: BeatTime::ZERO,
            loop_end: BeatTime::from_bars(1.0, signature),
            looping: false,
            nudge: None,
            epoch: 0,
        }
    }

    /// Create a stopped clock with the given tempo and time signature.
    pub fn with_tempo(bpm: f64, signature: TimeSignature) -> Result<Self> {
        validate_tempo(bpm)?;
        Ok(Self {
            bpm,
            signature,
            loop_end: BeatTime::from_bars(1.0, signature),
            ..Self::new()
        })
    }

    /// Beats per second at the nominal tempo.
    fn rate(&self) -> f64 {
        self.bpm / 60.0
    }

    fn loop_len(&self) -> f64 {
        (self.loop_end - self.loop_start).to_float()
    }

    /// Fold an unwrapped beat into the loop region (identity when not looping).
    fn normalize(&self, beat: f64) -> f64 {
        if !self.looping {
            return beat;
        }
        let start = self.loop_start.to_float();
        let len = self.loop_len();
        let wrapped = (beat - start).rem_euclid(len);
        // rem_euclid may round up to `len` for tiny negative inputs
        if wrapped >= len {
            start
        } else {
            start + wrapped
        }
    }

    /// Unwrapped beat reached at `time`.
    ///
    /// Returns the anchor beat when the clock is not running. Instants before
    /// the start gate are clamped to it.
    pub fn unwrapped_at(&self, time: Instant) -> f64 {
        if !self.running {
            return self.anchor_beat;
        }
        let time = time.max(self.start_instant);
        if time < self.anchor_instant {
            let back = self.anchor_instant.duration_since(time).as_secs_f64();
            return self.anchor_beat - back * self.rate();
        }

        let elapsed = time.duration_since(self.anchor_instant);
        let mut beat = self.anchor_beat + elapsed.as_secs_f64() * self.rate();
        if let Some(nudge) = self.nudge {
            let share = if elapsed >= nudge.duration {
                1.0
            } else {
                elapsed.as_secs_f64() / nudge.duration.as_secs_f64()
            };
            beat += nudge.beats * share;
        }
        beat
    }

    /// Instant at which the running clock reaches the unwrapped beat `beat`.
    ///
    /// Returns `None` when the clock is stopped.
    pub fn instant_at_unwrapped(&self, beat: f64) -> Option<Instant> {
        if !self.running {
            return None;
        }
        let rate = self.rate();
        let delta = beat - self.anchor_beat;
        if delta < 0.0 {
            let back = Duration::from_secs_f64(-delta / rate);
            let instant = self
                .anchor_instant
                .checked_sub(back)
                .unwrap_or(self.anchor_instant);
            return Some(instant.max(self.start_instant));
        }

        let secs = match self.nudge {
            Some(nudge) => {
                let window = nudge.duration.as_secs_f64();
                let segment_beats = rate * window + nudge.beats;
                if delta <= segment_beats {
                    delta / (rate + nudge.beats / window)
                } else {
                    window + (delta - segment_beats) / rate
                }
            }
            None => delta / rate,
        };
        Some(self.anchor_instant + Duration::from_secs_f64(secs))
    }

    /// Loop-normalized position at `time`.
    pub fn position_at(&self, time: Instant) -> BeatTime {
        let position = BeatTime::from_float(self.normalize(self.unwrapped_at(time)));
        // rounding to fixed point can land exactly on the loop end
        if self.looping && position >= self.loop_end {
            self.loop_start
        } else {
            position
        }
    }

    /// Fraction of the loop region played at `time`, in `[0, 1)`.
    ///
    /// Always 0 when looping is off.
    pub fn progress_at(&self, time: Instant) -> f64 {
        if !self.looping {
            return 0.0;
        }
        let position = self.normalize(self.unwrapped_at(time));
        let progress = (position - self.loop_start.to_float()) / self.loop_len();
        if progress >= 1.0 {
            0.0
        } else {
            progress.max(0.0)
        }
    }

    /// Capture position, progress and loop bounds together.
    pub fn snapshot(&self, now: Instant) -> TransportSnapshot {
        TransportSnapshot {
            bpm: self.bpm,
            signature: self.signature,
            position: self.position_at(now),
            progress: self.progress_at(now),
            loop_start: self.loop_start,
            loop_end: self.loop_end,
            looping: self.looping,
            running: self.running,
            epoch: self.epoch,
        }
    }

    /// Move the anchor to `now` without changing the trajectory.
    ///
    /// An unfinished nudge is split: the applied share is folded into the
    /// anchor and the remainder keeps slewing at the same rate. An anchor
    /// ahead of `now` (a swap scheduled at the next tick) is pulled back to
    /// `now`, so the back-extrapolation never depends on a later tempo.
    fn reanchor(&mut self, now: Instant) {
        if !self.running {
            return;
        }
        let at = now.max(self.start_instant);
        if at == self.anchor_instant {
            return;
        }
        if at < self.anchor_instant {
            // no nudge share has been applied before the anchor
            self.anchor_beat = self.unwrapped_at(at);
            self.anchor_instant = at;
            return;
        }
        let beat = self.unwrapped_at(at);
        let elapsed = at.duration_since(self.anchor_instant);
        self.nudge = self.nudge.and_then(|nudge| {
            let remaining = nudge.duration.checked_sub(elapsed)?;
            if remaining.is_zero() {
                return None;
            }
            let share = remaining.as_secs_f64() / nudge.duration.as_secs_f64();
            Some(Nudge {
                beats: nudge.beats * share,
                duration: remaining,
            })
        });
        self.anchor_beat = beat;
        self.anchor_instant = at;
    }

    /// Re-anchor at `now` with a normalized position, starting a new epoch.
    fn rebase(&mut self, now: Instant) {
        let position = self.normalize(self.unwrapped_at(now));
        if self.running {
            self.anchor_instant = now.max(self.start_instant);
        } else {
            self.anchor_instant = now;
        }
        self.anchor_beat = position;
        self.nudge = None;
        self.epoch += 1;
    }

    /// Start running from instant `at`, at position `start_offset`.
    ///
    /// `at` may lie in the future; until then the position holds at the offset.
    pub fn start(&mut self, at: Instant, start_offset: BeatTime) {
        self.running = true;
        self.start_instant = at;
        self.anchor_instant = at;
        self.anchor_beat = self.normalize(start_offset.to_float());
        self.nudge = None;
        self.epoch += 1;
        log::debug!(
            "[TRANSPORT] Start at beat {:.3} ({} BPM)",
            self.anchor_beat,
            self.bpm
        );
    }

    /// Stop and return to the loop start (beat zero when not looping).
    pub fn stop(&mut self, now: Instant) {
        self.running = false;
        self.anchor_instant = now;
        self.anchor_beat = if self.looping {
            self.loop_start.to_float()
        } else {
            0.0
        };
        self.nudge = None;
        self.epoch += 1;
        log::debug!("[TRANSPORT] Stop");
    }

    /// Stop, keeping the current position.
    pub fn pause(&mut self, now: Instant) {
        let position = self.normalize(self.unwrapped_at(now));
        self.running = false;
        self.anchor_instant = now;
        self.anchor_beat = position;
        self.nudge = None;
        self.epoch += 1;
        log::debug!("[TRANSPORT] Pause at beat {:.3}", position);
    }

    /// Change the tempo, preserving the current position.
    pub fn set_tempo(&mut self, bpm: f64, now: Instant) -> Result<()> {
        validate_tempo(bpm)?;
        self.reanchor(now);
        if let Some(nudge) = self.nudge.as_mut() {
            // keep the remaining correction inside the monotone bound at the new rate
            let limit = MAX_NUDGE_SHARE * (bpm / 60.0) * nudge.duration.as_secs_f64();
            nudge.beats = nudge.beats.clamp(-limit, limit);
        }
        self.bpm = bpm;
        Ok(())
    }

    /// Change the time signature, preserving the current position.
    pub fn set_time_signature(&mut self, signature: TimeSignature, now: Instant) {
        self.reanchor(now);
        self.signature = signature;
    }

    /// Replace the loop region, folding the current position into it.
    pub fn set_loop(&mut self, start: BeatTime, end: BeatTime, now: Instant) -> Result<()> {
        if start < BeatTime::ZERO || end <= start {
            return Err(Error::InvalidLoop {
                start: start.to_float(),
                end: end.to_float(),
            });
        }
        let unwrapped = self.unwrapped_at(now);
        let position = self.normalize(unwrapped);
        self.loop_start = start;
        self.loop_end = end;
        let position = self.normalize(position);
        self.anchor_instant = if self.running {
            now.max(self.start_instant)
        } else {
            now
        };
        self.anchor_beat = position;
        self.nudge = None;
        self.epoch += 1;
        Ok(())
    }

    /// Turn looping on or off.
    pub fn set_looping(&mut self, looping: bool, now: Instant) {
        if self.looping == looping {
            return;
        }
        self.rebase(now);
        self.looping = looping;
        self.anchor_beat = self.normalize(self.anchor_beat);
    }

    /// Jump to `position`, clamped into the loop region when looping.
    pub fn seek(&mut self, position: BeatTime, now: Instant) {
        let position = if self.looping {
            position.clamp(self.loop_start, self.loop_end - BeatTime::EPSILON)
        } else {
            position.max(BeatTime::ZERO)
        };
        self.anchor_instant = if self.running {
            now.max(self.start_instant)
        } else {
            now
        };
        self.anchor_beat = position.to_float();
        self.nudge = None;
        self.epoch += 1;
    }

    /// Shift the phase by `beats`, slewed in linearly over `over`.
    ///
    /// The shift is clamped so the position never runs backwards. Returns the
    /// shift actually applied. A stopped clock ignores nudges.
    pub fn nudge(&mut self, beats: f64, over: Duration, now: Instant) -> f64 {
        if !self.running || over.is_zero() || !beats.is_finite() {
            return 0.0;
        }
        self.reanchor(now);
        let pending = self.nudge.map(|n| n.beats).unwrap_or(0.0);
        let limit = MAX_NUDGE_SHARE * self.rate() * over.as_secs_f64();
        let total = (pending + beats).clamp(-limit, limit);
        self.nudge = Some(Nudge {
            beats: total,
            duration: over,
        });
        log::trace!("[TRANSPORT] Nudge {:+.4} beats over {:?}", total, over);
        total - pending
    }

    /// Counter bumped by every discontinuous mutation (start, stop, pause,
    /// seek, loop changes). Tempo changes and nudges keep the epoch.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn bpm(&self) -> f64 {
        self.bpm
    }

    pub fn time_signature(&self) -> TimeSignature {
        self.signature
    }

    pub fn loop_start(&self) -> BeatTime {
        self.loop_start
    }

    pub fn loop_end(&self) -> BeatTime {
        self.loop_end
    }

    pub fn is_looping(&self) -> bool {
        self.looping
    }

    /// Check if the transport is running.
    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Beats covered by `window` at the current tempo.
    pub fn beats_in(&self, window: Duration) -> f64 {
        window.as_secs_f64() * self.rate()
    }

    /// Wall-clock duration of `beats` at the current tempo.
    pub fn duration_of(&self, beats: f64) -> Duration {
        Duration::from_secs_f64((beats / self.rate()).max(0.0))
    }
}

fn validate_tempo(bpm: f64) -> Result<()> {
    if bpm.is_finite() && bpm > 0.0 {
        Ok(())
    } else {
        Err(Error::InvalidTempo(bpm))
    }
}

/// Cloneable handle to a transport clock shared between the playback
/// manager, the scheduler and the phase-lock loop.
///
/// All access goes through closures so a reader always sees position, loop
/// bounds and tempo from the same state.
#[derive(Clone, Default)]
pub struct SharedTransport {
    clock: Arc<RwLock<TransportClock>>,
}

impl SharedTransport {
    pub fn new(clock: TransportClock) -> Self {
        Self {
            clock: Arc::new(RwLock::new(clock)),
        }
    }

    /// Read the clock with a closure.
    pub fn read<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&TransportClock) -> R,
    {
        let clock = self.clock.read().unwrap_or_else(PoisonError::into_inner);
        f(&clock)
    }

    /// Mutate the clock with a closure under an exclusive lock.
    pub fn write<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&mut TransportClock) -> R,
    {
        let mut clock = self.clock.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut clock)
    }

    pub fn snapshot(&self, now: Instant) -> TransportSnapshot {
        self.read(|clock| clock.snapshot(now))
    }

    /// Non-owning handle for background tasks.
    pub fn downgrade(&self) -> WeakTransport {
        WeakTransport {
            clock: Arc::downgrade(&self.clock),
        }
    }
}

impl std::fmt::Debug for SharedTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.read(|clock| {
            f.debug_struct("SharedTransport")
                .field("bpm", &clock.bpm())
                .field("running", &clock.is_running())
                .field("epoch", &clock.epoch())
                .finish_non_exhaustive()
        })
    }
}

/// Non-owning transport reference, see [`SharedTransport::downgrade`].
#[derive(Clone, Debug, Default)]
pub struct WeakTransport {
    clock: Weak<RwLock<TransportClock>>,
}

impl WeakTransport {
    pub fn upgrade(&self) -> Option<SharedTransport> {
        self.clock.upgrade().map(|clock| SharedTransport { clock })
    }
}
