//! Lookahead event scheduler.
//!
//! On every tick the scheduler collects the events whose loop position falls
//! between its frontier (the point up to which events were already handed
//! out) and `now + lookahead`, and stamps them with the instant at which the
//! transport will reach them. The frontier is kept in unwrapped beats so tempo
//! changes and phase nudges between ticks neither repeat nor skip events.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use crate::events::{ScheduledControlEvent, ScheduledEvent};
use crate::timing::BeatTime;
use crate::transport::TransportClock;

/// Tolerance when comparing occurrence beats against window bounds.
const WINDOW_EPSILON: f64 = 1e-6;

/// Upper bound on loop iterations generated per event and window.
const MAX_ITERATIONS: usize = 2048;

/// Borrowed event that is due within the current window.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Due<'a> {
    Note(&'a ScheduledEvent),
    Control(&'a ScheduledControlEvent),
}

/// An event occurrence stamped with its wall-clock time.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DueEvent<'a> {
    pub time: Instant,
    /// Unwrapped transport beat of this occurrence.
    pub beat: f64,
    pub item: Due<'a>,
}

/// Where the next window of a running transport begins.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Tick {
    /// Unwrapped transport beat.
    pub beat: f64,
    pub instant: Instant,
    /// Events exactly at `beat` have not been handed out yet.
    pub inclusive: bool,
}

#[derive(Clone, Copy, Debug, PartialEq)]
struct Frontier {
    epoch: u64,
    beat: f64,
    instant: Instant,
    inclusive: bool,
}

/// Lookahead scheduler for one stream of loop-relative events.
#[derive(Debug, Default)]
pub struct EventScheduler {
    frontier: Option<Frontier>,
}

impl EventScheduler {
    /// Create a new event scheduler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget the frontier. The next window starts at `now`, inclusive.
    ///
    /// Call this when the transport is stopped.
    pub fn reset(&mut self) {
        self.frontier = None;
    }

    /// Continue scheduling from `instant`.
    ///
    /// With `inclusive` set, events exactly at the transport position reached
    /// at `instant` are part of the next window.
    pub fn restart_at(&mut self, clock: &TransportClock, instant: Instant, inclusive: bool) {
        self.frontier = Some(Frontier {
            epoch: clock.epoch(),
            beat: clock.unwrapped_at(instant),
            instant,
            inclusive,
        });
    }

    /// The next scheduling tick: the earliest point no event has been
    /// handed out for yet.
    ///
    /// Returns `None` while the transport is stopped.
    pub fn next_tick(&self, clock: &TransportClock, now: Instant) -> Option<Tick> {
        if !clock.is_running() {
            return None;
        }
        let now_beat = clock.unwrapped_at(now);
        let tick = match self.frontier {
            Some(frontier) if frontier.epoch == clock.epoch() && frontier.beat > now_beat => {
                let instant = clock
                    .instant_at_unwrapped(frontier.beat)
                    .unwrap_or(frontier.instant)
                    .max(now);
                Tick {
                    beat: frontier.beat,
                    instant,
                    inclusive: frontier.inclusive,
                }
            }
            Some(frontier) if frontier.epoch != clock.epoch() && frontier.instant > now => Tick {
                beat: clock.unwrapped_at(frontier.instant),
                instant: frontier.instant,
                inclusive: true,
            },
            Some(frontier) if frontier.epoch == clock.epoch() => Tick {
                beat: now_beat,
                instant: now,
                inclusive: frontier.inclusive && frontier.beat >= now_beat,
            },
            _ => Tick {
                beat: now_beat,
                instant: now,
                inclusive: true,
            },
        };
        Some(tick)
    }

    /// Collect every occurrence of `events` and `controls` due before
    /// `now + lookahead`, in beat order, and advance the frontier.
    pub fn collect_due_events<'a>(
        &mut self,
        clock: &TransportClock,
        now: Instant,
        lookahead: Duration,
        events: &'a [ScheduledEvent],
        controls: &'a [ScheduledControlEvent],
    ) -> Vec<DueEvent<'a>> {
        if !clock.is_running() {
            self.frontier = None;
            return Vec::new();
        }

        let window_end = now + lookahead;
        let end_beat = clock.unwrapped_at(window_end);
        let now_beat = clock.unwrapped_at(now);

        let (start_beat, inclusive) = match self.frontier {
            Some(frontier) if frontier.epoch == clock.epoch() => {
                if frontier.beat + WINDOW_EPSILON < now_beat {
                    log::debug!(
                        "[SCHEDULER] Late by {:.3} beats, skipping to now",
                        now_beat - frontier.beat
                    );
                    (now_beat, false)
                } else {
                    (frontier.beat, frontier.inclusive)
                }
            }
            Some(frontier) => (clock.unwrapped_at(frontier.instant.max(now)), true),
            None => (now_beat, true),
        };

        let lower = if inclusive {
            start_beat - WINDOW_EPSILON
        } else {
            start_beat + WINDOW_EPSILON
        };
        let upper = end_beat + WINDOW_EPSILON;

        let mut by_beat: BTreeMap<BeatTime, Vec<(f64, Due<'a>)>> = BTreeMap::new();
        let mut push = |time: BeatTime, item: Due<'a>| {
            for beat in occurrences(clock, time.to_float(), lower, upper) {
                by_beat
                    .entry(BeatTime::from_float(beat))
                    .or_default()
                    .push((beat, item));
            }
        };
        for event in events {
            push(event.time, Due::Note(event));
        }
        for control in controls {
            push(control.time, Due::Control(control));
        }

        if end_beat >= start_beat {
            self.frontier = Some(Frontier {
                epoch: clock.epoch(),
                beat: end_beat,
                instant: window_end,
                inclusive: false,
            });
        }

        let due: Vec<DueEvent<'a>> = by_beat
            .into_values()
            .flatten()
            .map(|(beat, item)| DueEvent {
                time: clock
                    .instant_at_unwrapped(beat)
                    .map(|t| t.max(now))
                    .unwrap_or(now),
                beat,
                item,
            })
            .collect();

        if !due.is_empty() {
            log::trace!(
                "[SCHEDULER] {} events in ({:.3}, {:.3}]",
                due.len(),
                start_beat,
                end_beat
            );
        }
        due
    }
}

/// Unwrapped beats in `(lower, upper]` at which the transport passes the
/// loop position `position`.
fn occurrences(clock: &TransportClock, position: f64, lower: f64, upper: f64) -> Vec<f64> {
    if !clock.is_looping() {
        return if position > lower && position <= upper {
            vec![position]
        } else {
            Vec::new()
        };
    }

    let loop_start = clock.loop_start().to_float();
    let loop_end = clock.loop_end().to_float();
    // outside the loop region: never reached while looping
    if position < loop_start || position >= loop_end {
        return Vec::new();
    }
    let len = loop_end - loop_start;

    let first = ((lower - position) / len).floor();
    let mut beats = Vec::new();
    let mut iteration = first;
    for _ in 0..MAX_ITERATIONS {
        let beat = position + iteration * len;
        if beat > upper {
            break;
        }
        if beat > lower {
            beats.push(beat);
        }
        iteration += 1.0;
    }
    beats
}
