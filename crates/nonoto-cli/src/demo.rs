//! Demo content producer.
//!
//! Stands in for the generation backend: every few seconds it starts a new
//! request and delivers a freshly composed loop after a random "inference"
//! delay. Requests that are overtaken by a newer one are dropped.

use std::time::Duration;

use nonoto_core::{
    BeatTime, Content, ContentPublisher, Error, NotePayload, ScheduledControlEvent,
    ScheduledEvent, TimeSignature,
};
use rand::seq::IndexedRandom;
use rand::Rng;

/// C major pentatonic, C4 to A5.
const SCALE: [u8; 10] = [60, 62, 64, 67, 69, 72, 74, 76, 79, 81];

/// Bass roots for the chord on each downbeat.
const ROOTS: [u8; 4] = [48, 45, 41, 43];

/// Step lengths in beats the melody picks from.
const STEPS: [f64; 3] = [0.5, 1.0, 1.5];

/// Compose `bars` bars of melody over a chord per bar, with the sustain
/// pedal held through each bar.
pub fn compose<R: Rng>(rng: &mut R, bars: u32, signature: TimeSignature) -> Content {
    let beats_per_bar = signature.beats_per_bar();
    let length = f64::from(bars) * beats_per_bar;
    let mut events = Vec::new();
    let mut controls = Vec::new();

    for bar in 0..bars {
        let start = f64::from(bar) * beats_per_bar;
        let root = ROOTS[bar as usize % ROOTS.len()];
        events.push(ScheduledEvent {
            time: BeatTime::from_float(start),
            duration: BeatTime::from_float(beats_per_bar),
            channel: 1,
            payload: NotePayload::Chord {
                notes: vec![root, root + 7, root + 12],
                velocity: 0.6,
            },
        });
        controls.push(ScheduledControlEvent::pedal(start, true));
        controls.push(ScheduledControlEvent::pedal(start + beats_per_bar - 0.25, false));
    }

    let mut beat = 0.0;
    while beat < length {
        let step = *STEPS.choose(rng).unwrap_or(&1.0);
        if rng.random_bool(0.8) {
            let note = *SCALE.choose(rng).unwrap_or(&SCALE[0]);
            let duration = (step * 0.9).min(length - beat);
            events.push(
                ScheduledEvent::note(beat, duration, note).with_velocity(rng.random_range(0.5..1.0)),
            );
        }
        beat += step;
    }

    Content::symbolic(events, controls, BeatTime::from_float(length))
}

/// Start a new content request every `every`, forever.
pub async fn run_producer(
    publisher: ContentPublisher,
    every: Duration,
    bars: u32,
    signature: TimeSignature,
) {
    let mut ticker = tokio::time::interval(every);
    loop {
        ticker.tick().await;
        let request = publisher.begin_request();
        // generation sometimes takes longer than the interval
        let latency = every.mul_f64(rand::rng().random_range(0.05..1.4));
        let publisher = publisher.clone();
        log::info!(
            "[DEMO] Request {} started, ready in {:?}",
            request.id(),
            latency
        );

        tokio::spawn(async move {
            tokio::time::sleep(latency).await;
            if request.is_cancelled() {
                log::info!("[DEMO] Request {} was superseded, dropping it", request.id());
                return;
            }
            let content = compose(&mut rand::rng(), bars, signature);
            match publisher.complete(&request, content) {
                Ok(()) => log::info!("[DEMO] Request {} delivered", request.id()),
                Err(Error::SchedulingConflict(conflict)) => {
                    log::info!("[DEMO] Request {} dropped: {}", request.id(), conflict)
                }
                Err(e) => log::warn!("[DEMO] Request {} failed: {}", request.id(), e),
            }
        });
    }
}
