//! A note sink that logs instead of playing.

use std::time::{Duration, Instant};

use nonoto_core::NoteSink;

const NOTE_NAMES: [&str; 12] = [
    "C", "C#", "D", "D#", "E", "F", "F#", "G", "G#", "A", "A#", "B",
];

/// Scientific pitch name, e.g. 60 -> "C4".
pub fn note_name(note: u8) -> String {
    let octave = i32::from(note / 12) - 1;
    format!("{}{}", NOTE_NAMES[usize::from(note % 12)], octave)
}

/// Logs every scheduled note with how far ahead of time it arrived.
#[derive(Debug)]
pub struct LoggingSink {
    origin: Instant,
    notes: usize,
    note_offs: usize,
    pedals: usize,
}

impl LoggingSink {
    pub fn new(origin: Instant) -> Self {
        Self {
            origin,
            notes: 0,
            note_offs: 0,
            pedals: 0,
        }
    }

    pub fn notes(&self) -> usize {
        self.notes
    }

    pub fn note_offs(&self) -> usize {
        self.note_offs
    }

    pub fn pedals(&self) -> usize {
        self.pedals
    }

    fn offset(&self, time: Instant) -> f64 {
        time.saturating_duration_since(self.origin).as_secs_f64()
    }
}

impl NoteSink for LoggingSink {
    fn play_note(&mut self, time: Instant, note: u8, velocity: f32, duration: Duration, channel: u8) {
        if velocity <= 0.0 {
            self.note_offs += 1;
            log::debug!(
                "[SINK] {:>8.3}s  off {:<4} ch{}",
                self.offset(time),
                note_name(note),
                channel
            );
            return;
        }
        self.notes += 1;
        log::info!(
            "[SINK] {:>8.3}s  on  {:<4} ch{} vel {:.2} for {:?}",
            self.offset(time),
            note_name(note),
            channel,
            velocity,
            duration
        );
    }

    fn trigger_pedal(&mut self, time: Instant, down: bool) {
        self.pedals += 1;
        log::info!(
            "[SINK] {:>8.3}s  pedal {}",
            self.offset(time),
            if down { "down" } else { "up" }
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_note_names() {
        assert_eq!(note_name(60), "C4");
        assert_eq!(note_name(69), "A4");
        assert_eq!(note_name(0), "C-1");
        assert_eq!(note_name(127), "G9");
    }

    #[test]
    fn test_counts() {
        let origin = Instant::now();
        let mut sink = LoggingSink::new(origin);
        sink.play_note(origin, 60, 0.8, Duration::from_millis(250), 0);
        sink.play_note(origin, 60, 0.0, Duration::ZERO, 0);
        sink.trigger_pedal(origin, true);
        assert_eq!(sink.notes(), 1);
        assert_eq!(sink.note_offs(), 1);
        assert_eq!(sink.pedals(), 1);
    }
}
