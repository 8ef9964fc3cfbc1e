//! Periodic phase alignment against the tempo authority.
//!
//! Each cycle asks the authority for its phase within the quantum, compares
//! it with the local phase plus the latency compensation in effect and nudges
//! the transport by a bounded fraction of the difference. Corrections are
//! slewed in, never jumped to.

use std::sync::{Mutex, PoisonError, Weak};
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::client::{SyncClient, SyncState};
use crate::config::PhaseLockConfig;
use crate::playback::{PlaybackManager, PlaybackState};

/// Proportional controller for the phase error.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PhaseCorrector {
    pub gain: f64,
    pub max_step: f64,
}

impl PhaseCorrector {
    pub fn new(gain: f64, max_step: f64) -> Self {
        Self { gain, max_step }
    }

    pub fn from_config(config: &PhaseLockConfig) -> Self {
        Self::new(config.gain, config.max_step_beats)
    }

    /// Signed distance from the local phase to where it should be, wrapped
    /// into `[-quantum/2, quantum/2)`.
    ///
    /// The local phase should lead the external one by `compensation` beats
    /// so that what is heard lines up with the authority.
    pub fn phase_error(external: f64, local: f64, compensation: f64, quantum: f64) -> f64 {
        let half = quantum / 2.0;
        (external + compensation - local + half).rem_euclid(quantum) - half
    }

    /// Correction to apply for `error`, in beats.
    pub fn correction(&self, error: f64) -> f64 {
        (self.gain * error).clamp(-self.max_step, self.max_step)
    }
}

/// Outcome of one correction cycle.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PhaseReport {
    pub at: Instant,
    /// Phase error measured before correcting, in beats.
    pub error: f64,
    /// Shift actually applied to the transport.
    pub applied: f64,
}

/// Handle to a running phase-lock task. Dropping it stops the loop.
#[derive(Debug)]
pub struct PhaseLockHandle {
    task: JoinHandle<()>,
    reports: watch::Receiver<Option<PhaseReport>>,
}

impl PhaseLockHandle {
    /// Most recent correction, updated once per applied cycle.
    pub fn reports(&self) -> watch::Receiver<Option<PhaseReport>> {
        self.reports.clone()
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}

impl Drop for PhaseLockHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[derive(Debug, PartialEq)]
enum Cycle {
    Idle,
    Skipped,
    Corrected(PhaseReport),
    Gone,
}

/// The phase-lock task.
pub struct PhaseLockLoop {
    manager: Weak<Mutex<PlaybackManager>>,
    client: SyncClient,
    corrector: PhaseCorrector,
    config: PhaseLockConfig,
    reports: watch::Sender<Option<PhaseReport>>,
}

impl PhaseLockLoop {
    /// Start correcting the transport of `manager` against `client`.
    ///
    /// Holds only a weak reference to the manager; the task ends on its own
    /// once the manager is dropped.
    pub fn spawn(
        manager: Weak<Mutex<PlaybackManager>>,
        client: SyncClient,
        config: PhaseLockConfig,
    ) -> PhaseLockHandle {
        let (reports, rx) = watch::channel(None);
        let phase_lock = Self {
            manager,
            client,
            corrector: PhaseCorrector::from_config(&config),
            config,
            reports,
        };
        PhaseLockHandle {
            task: tokio::spawn(phase_lock.run()),
            reports: rx,
        }
    }

    async fn run(self) {
        log::debug!("[PHASE] Phase lock started");
        let Some(first) = self.beats_to_duration(self.config.first_cycle_beats) else {
            return;
        };
        tokio::time::sleep(first).await;

        loop {
            let Some(period) = self.beats_to_duration(self.config.period_beats) else {
                break;
            };
            match self.cycle(period).await {
                Cycle::Gone => break,
                Cycle::Corrected(report) => {
                    self.reports.send_replace(Some(report));
                }
                Cycle::Idle | Cycle::Skipped => {}
            }
            tokio::time::sleep(period + self.jitter()).await;
        }
        log::debug!("[PHASE] Phase lock finished");
    }

    fn jitter(&self) -> Duration {
        let max = self.config.jitter.as_micros() as u64;
        if max == 0 {
            return Duration::ZERO;
        }
        Duration::from_micros(rand::rng().random_range(0..=max))
    }

    fn beats_to_duration(&self, beats: f64) -> Option<Duration> {
        let manager = self.manager.upgrade()?;
        let manager = manager.lock().unwrap_or_else(PoisonError::into_inner);
        Some(manager.transport().read(|clock| clock.duration_of(beats)))
    }

    async fn cycle(&self, period: Duration) -> Cycle {
        let Some(manager) = self.manager.upgrade() else {
            return Cycle::Gone;
        };
        let playing = manager.lock().unwrap_or_else(PoisonError::into_inner).state()
            == PlaybackState::Playing;
        drop(manager);
        if !playing || self.client.state() != SyncState::Enabled {
            return Cycle::Idle;
        }

        let sent = tokio::time::Instant::now();
        let external = match tokio::time::timeout(period, self.client.request_phase()).await {
            Ok(Ok(phase)) => phase,
            Ok(Err(e)) => {
                log::debug!("[PHASE] Skipping cycle: {}", e);
                return Cycle::Skipped;
            }
            Err(_) => {
                log::debug!("[PHASE] Skipping cycle: no phase within {:?}", period);
                return Cycle::Skipped;
            }
        };
        let received = tokio::time::Instant::now();
        // the authority answered somewhere inside the round trip
        let measured_at = (sent + (received - sent) / 2).into_std();
        let quantum = self.client.session().quantum;

        let Some(manager) = self.manager.upgrade() else {
            return Cycle::Gone;
        };
        let manager = manager.lock().unwrap_or_else(PoisonError::into_inner);
        if manager.state() != PlaybackState::Playing {
            return Cycle::Idle;
        }
        let latency = manager.latency().clone();
        let now = received.into_std();
        let window_beats = self.config.correction_window_beats;

        let report = manager.transport().write(|clock| {
            let compensation = latency.compensation_beats(clock.bpm());
            let local = clock.unwrapped_at(measured_at) - clock.loop_start().to_float();
            let error = PhaseCorrector::phase_error(external, local, compensation, quantum);
            let correction = self.corrector.correction(error);
            let window = clock.duration_of(window_beats);
            let applied = clock.nudge(correction, window, now);
            PhaseReport {
                at: now,
                error,
                applied,
            }
        });
        log::debug!(
            "[PHASE] Error {:+.4} beats, nudging {:+.4}",
            report.error,
            report.applied
        );
        Cycle::Corrected(report)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::PlaybackConfig;
    use crate::sync::messages::{SyncChannel, SyncRequest, SyncResponse};
    use crate::transport::TransportClock;

    #[test]
    fn test_phase_error_wraps() {
        assert!((PhaseCorrector::phase_error(0.5, 0.25, 0.0, 4.0) - 0.25).abs() < 1e-9);
        // just past the downbeat vs just before it
        assert!((PhaseCorrector::phase_error(0.1, 3.9, 0.0, 4.0) - 0.2).abs() < 1e-9);
        assert!((PhaseCorrector::phase_error(3.9, 0.1, 0.0, 4.0) + 0.2).abs() < 1e-9);
        // compensation shifts the target ahead
        assert!((PhaseCorrector::phase_error(0.0, 0.3, 0.3, 4.0)).abs() < 1e-9);
        // local phase is not reduced by the caller
        assert!((PhaseCorrector::phase_error(1.0, 9.0, 0.0, 4.0)).abs() < 1e-9);
    }

    #[test]
    fn test_correction_is_clamped() {
        let corrector = PhaseCorrector::new(0.5, 0.125);
        assert!((corrector.correction(0.1) - 0.05).abs() < 1e-12);
        assert!((corrector.correction(1.0) - 0.125).abs() < 1e-12);
        assert!((corrector.correction(-1.0) + 0.125).abs() < 1e-12);
    }

    #[test]
    fn test_corrections_converge_without_overshoot() {
        let corrector = PhaseCorrector::new(0.5, 0.125);
        let mut error: f64 = 0.6;
        let mut previous = error.abs();
        for _ in 0..40 {
            let step = corrector.correction(error);
            error -= step;
            assert!(error.abs() <= previous + 1e-12);
            // never crosses zero by more than one step
            assert!(error >= -step.abs());
            previous = error.abs();
        }
        assert!(error.abs() < 1e-3);
    }

    /// Authority whose phase runs `offset` beats ahead of a reference clock
    /// started together with the local one.
    async fn offset_authority(mut authority: crate::sync::messages::AuthorityEnd, offset: f64) {
        let mut reference = TransportClock::new();
        reference.start(tokio::time::Instant::now().into_std(), Default::default());
        while let Some(frame) = authority.requests.recv().await {
            let now = tokio::time::Instant::now().into_std();
            let response = match frame.request {
                SyncRequest::Enable => SyncResponse::Enabled,
                SyncRequest::GetTempo => SyncResponse::Tempo { bpm: 120.0 },
                SyncRequest::GetPhase => SyncResponse::Phase {
                    phase: (reference.unwrapped_at(now) + offset).rem_euclid(4.0),
                },
                _ => SyncResponse::Ack,
            };
            authority.respond(frame.id, response);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_pulls_transport_toward_authority() {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut config = PlaybackConfig {
            output_latency: Duration::ZERO,
            ..Default::default()
        };
        config.phase_lock.jitter = Duration::ZERO;

        let (channel, authority) = SyncChannel::pair();
        tokio::spawn(offset_authority(authority, 0.4));
        let client = SyncClient::spawn(channel, &config);
        client.enable().await.unwrap();

        let manager = Arc::new(Mutex::new(PlaybackManager::from_config(&config).unwrap()));
        let transport = manager.lock().unwrap().transport().clone();
        let compensation = manager.lock().unwrap().latency().compensation_beats(120.0);
        let start = tokio::time::Instant::now().into_std();
        manager.lock().unwrap().start_synchronized(start).unwrap();
        // line the clock up with the reference, leaving only the offset
        transport.write(|clock| clock.start(start, Default::default()));

        let handle = PhaseLockLoop::spawn(Arc::downgrade(&manager), client, config.phase_lock.clone());
        let mut reports = handle.reports();

        let mut errors = Vec::new();
        for _ in 0..12 {
            reports.changed().await.unwrap();
            let report = (*reports.borrow()).expect("report");
            errors.push(report.error);
        }
        let target = 0.4 + compensation;
        assert!((errors[0] - target).abs() < 1e-3, "first error {}", errors[0]);
        for pair in errors.windows(2) {
            assert!(pair[1].abs() <= pair[0].abs() + 1e-6, "{errors:?}");
        }
        assert!(errors.last().unwrap().abs() < 0.01, "{errors:?}");
        assert!(handle.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_idles_while_stopped() {
        let mut config = PlaybackConfig::default();
        config.phase_lock.jitter = Duration::ZERO;
        let (channel, authority) = SyncChannel::pair();
        tokio::spawn(offset_authority(authority, 1.0));
        let client = SyncClient::spawn(channel, &config);
        client.enable().await.unwrap();

        let manager = Arc::new(Mutex::new(PlaybackManager::from_config(&config).unwrap()));
        let handle = PhaseLockLoop::spawn(Arc::downgrade(&manager), client, config.phase_lock.clone());
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(handle.reports().borrow().is_none());

        drop(manager);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(!handle.is_running());
    }
}
