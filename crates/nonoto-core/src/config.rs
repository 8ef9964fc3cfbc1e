//! Construction-time configuration.
//!
//! Every option has a documented default; there are no hidden constants
//! beyond the ones listed in [`PlaybackConfig::default`]. Durations are
//! written either as seconds (`0.15`) or as humantime strings (`"150ms"`).

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::timing::{LatencyCompensation, LatencyMode, TimeSignature};

/// Upper bound for the audio swap crossfade.
pub const MAX_CROSSFADE: Duration = Duration::from_secs(10);

/// Options for the playback core.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    /// Tempo at construction, in BPM.
    pub initial_tempo: f64,
    pub beats_per_bar: u32,
    pub beat_unit: u32,
    /// Beats per synchronization window.
    pub quantum: f64,
    #[serde(with = "duration_format")]
    pub interactive_lookahead: Duration,
    #[serde(with = "duration_format")]
    pub stable_lookahead: Duration,
    pub initial_latency_mode: LatencyMode,
    /// Extra latency of the output device, folded into phase compensation.
    #[serde(with = "duration_format")]
    pub output_latency: Duration,
    /// Delay between `play()` and the first scheduled sample.
    #[serde(with = "duration_format")]
    pub safe_start_offset: Duration,
    #[serde(with = "duration_format")]
    pub crossfade_duration: Duration,
    /// Deadline of every synchronization request.
    #[serde(with = "duration_format")]
    pub request_timeout: Duration,
    /// How long a synchronized start waits for the next downbeat.
    #[serde(with = "duration_format")]
    pub downbeat_wait: Duration,
    pub phase_lock: PhaseLockConfig,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            initial_tempo: 120.0,
            beats_per_bar: 4,
            beat_unit: 4,
            quantum: 4.0,
            interactive_lookahead: Duration::from_millis(100),
            stable_lookahead: Duration::from_millis(150),
            initial_latency_mode: LatencyMode::Stable,
            output_latency: Duration::ZERO,
            safe_start_offset: Duration::from_millis(200),
            crossfade_duration: Duration::from_secs(1),
            request_timeout: Duration::from_secs(2),
            downbeat_wait: Duration::from_secs(10),
            phase_lock: PhaseLockConfig::default(),
        }
    }
}

/// Options for the phase-lock loop.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PhaseLockConfig {
    /// Beats between correction cycles.
    pub period_beats: f64,
    /// Beats before the first cycle.
    pub first_cycle_beats: f64,
    /// Maximum random delay added to every period.
    #[serde(with = "duration_format")]
    pub jitter: Duration,
    /// Proportional correction gain.
    pub gain: f64,
    /// Largest correction applied in one cycle.
    pub max_step_beats: f64,
    /// Beats over which a correction is slewed in.
    pub correction_window_beats: f64,
}

impl Default for PhaseLockConfig {
    fn default() -> Self {
        Self {
            period_beats: 2.0,
            first_cycle_beats: 1.0,
            jitter: Duration::from_millis(20),
            gain: 0.5,
            max_step_beats: 0.125,
            correction_window_beats: 1.0,
        }
    }
}

impl PlaybackConfig {
    /// Parse and validate a JSON document. Missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| Error::InvalidConfig(format!("malformed configuration: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn time_signature(&self) -> TimeSignature {
        TimeSignature::new(self.beats_per_bar, self.beat_unit)
    }

    pub fn latency(&self) -> LatencyCompensation {
        LatencyCompensation {
            interactive_lookahead: self.interactive_lookahead,
            stable_lookahead: self.stable_lookahead,
            output_latency: self.output_latency,
            mode: self.initial_latency_mode,
        }
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(Error::InvalidConfig(msg));

        if !(self.initial_tempo.is_finite() && self.initial_tempo > 0.0) {
            return invalid(format!("initial_tempo must be positive, got {}", self.initial_tempo));
        }
        if !(self.quantum.is_finite() && self.quantum > 0.0) {
            return invalid(format!("quantum must be positive, got {}", self.quantum));
        }
        if self.beats_per_bar == 0 || self.beat_unit == 0 {
            return invalid("time signature parts must be non-zero".into());
        }
        if self.interactive_lookahead.is_zero() || self.stable_lookahead.is_zero() {
            return invalid("lookahead durations must be non-zero".into());
        }
        if self.interactive_lookahead > self.stable_lookahead {
            return invalid(format!(
                "interactive_lookahead ({:?}) exceeds stable_lookahead ({:?})",
                self.interactive_lookahead, self.stable_lookahead
            ));
        }
        if self.crossfade_duration.is_zero() || self.crossfade_duration > MAX_CROSSFADE {
            return invalid(format!(
                "crossfade_duration must be in (0, {:?}], got {:?}",
                MAX_CROSSFADE, self.crossfade_duration
            ));
        }
        if self.request_timeout.is_zero() {
            return invalid("request_timeout must be non-zero".into());
        }
        self.phase_lock.validate()
    }
}

impl PhaseLockConfig {
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(Error::InvalidConfig(msg));

        if !(self.period_beats.is_finite() && self.period_beats > 0.0) {
            return invalid(format!("phase_lock.period_beats must be positive, got {}", self.period_beats));
        }
        if !(self.first_cycle_beats.is_finite() && self.first_cycle_beats >= 0.0) {
            return invalid(format!(
                "phase_lock.first_cycle_beats must not be negative, got {}",
                self.first_cycle_beats
            ));
        }
        if !(self.gain > 0.0 && self.gain <= 1.0) {
            return invalid(format!("phase_lock.gain must be in (0, 1], got {}", self.gain));
        }
        if !(self.correction_window_beats.is_finite() && self.correction_window_beats > 0.0) {
            return invalid(format!(
                "phase_lock.correction_window_beats must be positive, got {}",
                self.correction_window_beats
            ));
        }
        if !(self.max_step_beats > 0.0 && self.max_step_beats < self.correction_window_beats) {
            return invalid(format!(
                "phase_lock.max_step_beats must be in (0, {}), got {}",
                self.correction_window_beats, self.max_step_beats
            ));
        }
        Ok(())
    }
}

/// Serde adapter: durations are written as humantime strings and read from
/// either humantime strings or plain seconds.
mod duration_format {
    use std::time::Duration;

    use serde::{de, Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawDuration {
        Seconds(f64),
        Text(String),
    }

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        match RawDuration::deserialize(deserializer)? {
            RawDuration::Seconds(secs) => Duration::try_from_secs_f64(secs)
                .map_err(|e| de::Error::custom(format!("invalid duration {secs}: {e}"))),
            RawDuration::Text(text) => humantime::parse_duration(&text)
                .map_err(|e| de::Error::custom(format!("invalid duration '{text}': {e}"))),
        }
    }
}
