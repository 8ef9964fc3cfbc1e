//! Play/stop/enable state machine around the transport clock.

use std::fmt;
use std::time::{Duration, Instant};

use tokio::sync::watch;

use crate::config::PlaybackConfig;
use crate::error::{Error, Result};
use crate::timing::{BeatTime, LatencyCompensation, LatencyMode};
use crate::transport::{SharedTransport, TransportClock};

/// Playback state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PlaybackState {
    Stopped,
    Playing,
    Disabled,
}

impl fmt::Display for PlaybackState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlaybackState::Stopped => write!(f, "stopped"),
            PlaybackState::Playing => write!(f, "playing"),
            PlaybackState::Disabled => write!(f, "disabled"),
        }
    }
}

/// The host's audio output, which may be suspended until user interaction.
pub trait AudioContext: Send {
    fn is_suspended(&self) -> bool;

    fn resume(&mut self) -> Result<()>;
}

/// An audio context that is always running.
#[derive(Clone, Copy, Debug, Default)]
pub struct RunningContext;

impl AudioContext for RunningContext {
    fn is_suspended(&self) -> bool {
        false
    }

    fn resume(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Owns the transport and gates whether it may run.
pub struct PlaybackManager {
    transport: SharedTransport,
    latency: LatencyCompensation,
    safe_start_offset: Duration,
    context: Box<dyn AudioContext>,
    state_tx: watch::Sender<PlaybackState>,
}

impl PlaybackManager {
    /// Build a manager with a fresh transport from `config`.
    pub fn from_config(config: &PlaybackConfig) -> Result<Self> {
        config.validate()?;
        let clock = TransportClock::with_tempo(config.initial_tempo, config.time_signature())?;
        Ok(Self::new(SharedTransport::new(clock), config))
    }

    /// Wrap an existing transport.
    pub fn new(transport: SharedTransport, config: &PlaybackConfig) -> Self {
        let (state_tx, _) = watch::channel(PlaybackState::Stopped);
        Self {
            transport,
            latency: config.latency(),
            safe_start_offset: config.safe_start_offset,
            context: Box::new(RunningContext),
            state_tx,
        }
    }

    /// Use `context` as the audio output.
    pub fn with_context(mut self, context: Box<dyn AudioContext>) -> Self {
        self.context = context;
        self
    }

    pub fn transport(&self) -> &SharedTransport {
        &self.transport
    }

    pub fn state(&self) -> PlaybackState {
        *self.state_tx.borrow()
    }

    /// Watch state transitions.
    pub fn subscribe(&self) -> watch::Receiver<PlaybackState> {
        self.state_tx.subscribe()
    }

    fn set_state(&self, state: PlaybackState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            log::info!("[PLAYBACK] {} -> {}", previous, state);
        }
    }

    /// Resume a suspended audio context; only a failed resume is an error.
    fn ensure_context(&mut self) -> Result<()> {
        if !self.context.is_suspended() {
            return Ok(());
        }
        log::info!("[PLAYBACK] Resuming suspended audio context");
        self.context.resume().map_err(|e| {
            log::warn!("[PLAYBACK] Could not resume audio context: {}", e);
            Error::AudioContextSuspended
        })
    }

    /// Start playback from the current loop progress after the safety offset.
    ///
    /// Returns `Ok(false)` while disabled. Playing again is a no-op.
    pub fn play(&mut self, now: Instant) -> Result<bool> {
        match self.state() {
            PlaybackState::Disabled => {
                log::debug!("[PLAYBACK] Ignoring play while disabled");
                return Ok(false);
            }
            PlaybackState::Playing => return Ok(true),
            PlaybackState::Stopped => {}
        }
        self.ensure_context()?;

        let start_at = now + self.safe_start_offset;
        self.transport.write(|clock| {
            let snapshot = clock.snapshot(now);
            let position = if snapshot.looping {
                let length = (snapshot.loop_end - snapshot.loop_start).to_float();
                snapshot.loop_start + BeatTime::from_float(snapshot.progress * length)
            } else {
                snapshot.position
            };
            clock.start(start_at, position);
        });
        self.set_state(PlaybackState::Playing);
        Ok(true)
    }

    /// Start immediately at the loop start, shifted by the latency
    /// compensation so that what is heard lines up with a downbeat.
    pub fn start_synchronized(&mut self, now: Instant) -> Result<bool> {
        if self.state() == PlaybackState::Disabled {
            return Ok(false);
        }
        self.ensure_context()?;

        let latency = &self.latency;
        let offset = self.transport.write(|clock| {
            let offset = latency.compensation_beats(clock.bpm());
            clock.start(now, clock.loop_start() + BeatTime::from_float(offset));
            offset
        });
        log::info!(
            "[PLAYBACK] Synchronized start, compensating {:.3} beats",
            offset
        );
        self.set_state(PlaybackState::Playing);
        Ok(true)
    }

    /// Stop and rewind to the loop start.
    pub fn stop(&mut self, now: Instant) {
        self.transport.write(|clock| clock.stop(now));
        if self.state() != PlaybackState::Disabled {
            self.set_state(PlaybackState::Stopped);
        }
    }

    /// Stop, keeping the current position.
    pub fn pause(&mut self, now: Instant) {
        self.transport.write(|clock| clock.pause(now));
        if self.state() != PlaybackState::Disabled {
            self.set_state(PlaybackState::Stopped);
        }
    }

    /// Allow `play()` again after [`disable`](Self::disable).
    pub fn enable(&mut self) {
        if self.state() == PlaybackState::Disabled {
            self.set_state(PlaybackState::Stopped);
        }
    }

    /// Stop (keeping the position) and refuse `play()` until re-enabled.
    pub fn disable(&mut self, now: Instant) {
        self.transport.write(|clock| clock.pause(now));
        self.set_state(PlaybackState::Disabled);
    }

    /// Switch between interactive and stable lookahead.
    ///
    /// `Some(true)` forces low latency, `Some(false)` forces stable, `None`
    /// toggles. Position and running state are untouched; the scheduler
    /// picks up the new horizon on its next tick.
    pub fn toggle_low_latency(&mut self, force: Option<bool>) -> LatencyMode {
        let mode = match force {
            Some(true) => LatencyMode::Interactive,
            Some(false) => LatencyMode::Stable,
            None => self.latency.mode.toggled(),
        };
        if mode != self.latency.mode {
            log::info!(
                "[PLAYBACK] Latency mode {:?} (lookahead {:?})",
                mode,
                match mode {
                    LatencyMode::Interactive => self.latency.interactive_lookahead,
                    LatencyMode::Stable => self.latency.stable_lookahead,
                }
            );
        }
        self.latency.mode = mode;
        mode
    }

    pub fn latency(&self) -> &LatencyCompensation {
        &self.latency
    }

    /// Scheduling horizon of the active latency mode.
    pub fn lookahead(&self) -> Duration {
        self.latency.lookahead()
    }

    pub fn set_tempo(&mut self, bpm: f64, now: Instant) -> Result<()> {
        self.transport.write(|clock| clock.set_tempo(bpm, now))
    }

    pub fn seek(&mut self, position: BeatTime, now: Instant) {
        self.transport.write(|clock| clock.seek(position, now));
    }

    pub fn set_loop(&mut self, start: BeatTime, end: BeatTime, now: Instant) -> Result<()> {
        self.transport.write(|clock| clock.set_loop(start, end, now))
    }

    pub fn set_looping(&mut self, looping: bool, now: Instant) {
        self.transport.write(|clock| clock.set_looping(looping, now));
    }
}

impl fmt::Debug for PlaybackManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlaybackManager")
            .field("state", &self.state())
            .field("latency", &self.latency.mode)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct SuspendedContext {
        suspended: bool,
        can_resume: bool,
        resumes: Arc<AtomicUsize>,
    }

    impl AudioContext for SuspendedContext {
        fn is_suspended(&self) -> bool {
            self.suspended
        }

        fn resume(&mut self) -> Result<()> {
            self.resumes.fetch_add(1, Ordering::SeqCst);
            if self.can_resume {
                self.suspended = false;
                Ok(())
            } else {
                Err(Error::AudioContextSuspended)
            }
        }
    }

    fn manager() -> PlaybackManager {
        PlaybackManager::from_config(&PlaybackConfig::default()).unwrap()
    }

    fn four_bar_loop(manager: &mut PlaybackManager, now: Instant) {
        manager
            .set_loop(BeatTime::ZERO, BeatTime::from_float(16.0), now)
            .unwrap();
        manager.set_looping(true, now);
    }

    #[test]
    fn test_play_applies_safe_start_offset() {
        let now = Instant::now();
        let mut manager = manager();
        assert!(manager.play(now).unwrap());
        assert_eq!(manager.state(), PlaybackState::Playing);

        let transport = manager.transport();
        // holds at 0 during the 200ms safety offset
        assert_eq!(transport.snapshot(now + Duration::from_millis(150)).position, BeatTime::ZERO);
        let position = transport.snapshot(now + Duration::from_millis(700)).position;
        assert!((position.to_float() - 1.0).abs() < 0.001);
    }

    #[test]
    fn test_play_resumes_from_loop_progress() {
        let now = Instant::now();
        let mut manager = manager();
        four_bar_loop(&mut manager, now);
        manager.seek(BeatTime::from_float(6.0), now);
        manager.play(now).unwrap();

        let snapshot = manager.transport().snapshot(now + Duration::from_millis(200));
        assert!((snapshot.position.to_float() - 6.0).abs() < 0.001);
    }

    #[test]
    fn test_disabled_ignores_play() {
        let now = Instant::now();
        let mut manager = manager();
        manager.play(now).unwrap();
        manager.disable(now + Duration::from_secs(1));
        assert_eq!(manager.state(), PlaybackState::Disabled);
        assert!(!manager.transport().read(|c| c.is_running()));

        assert!(!manager.play(now + Duration::from_secs(2)).unwrap());
        assert_eq!(manager.state(), PlaybackState::Disabled);

        manager.stop(now + Duration::from_secs(2));
        assert_eq!(manager.state(), PlaybackState::Disabled);

        manager.enable();
        assert_eq!(manager.state(), PlaybackState::Stopped);
        assert!(manager.play(now + Duration::from_secs(3)).unwrap());
    }

    #[test]
    fn test_stop_rewinds_to_loop_start() {
        let now = Instant::now();
        let mut manager = manager();
        four_bar_loop(&mut manager, now);
        manager
            .set_loop(BeatTime::from_float(4.0), BeatTime::from_float(16.0), now)
            .unwrap();
        manager.play(now).unwrap();
        manager.stop(now + Duration::from_secs(2));
        assert_eq!(manager.state(), PlaybackState::Stopped);
        let snapshot = manager.transport().snapshot(now + Duration::from_secs(2));
        assert_eq!(snapshot.position, BeatTime::from_float(4.0));
        assert!(!snapshot.running);
    }

    #[test]
    fn test_suspended_context_is_resumed_lazily() {
        let now = Instant::now();
        let resumes = Arc::new(AtomicUsize::new(0));
        let mut manager = manager().with_context(Box::new(SuspendedContext {
            suspended: true,
            can_resume: true,
            resumes: resumes.clone(),
        }));
        assert!(manager.play(now).unwrap());
        manager.stop(now);
        assert!(manager.play(now).unwrap());
        assert_eq!(resumes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unresumable_context_fails_play() {
        let now = Instant::now();
        let mut manager = manager().with_context(Box::new(SuspendedContext {
            suspended: true,
            can_resume: false,
            resumes: Arc::new(AtomicUsize::new(0)),
        }));
        assert_eq!(manager.play(now), Err(Error::AudioContextSuspended));
        assert_eq!(manager.state(), PlaybackState::Stopped);
        assert!(!manager.transport().read(|c| c.is_running()));
    }

    #[test]
    fn test_toggle_low_latency_keeps_playing() {
        let now = Instant::now();
        let mut manager = manager();
        manager.play(now).unwrap();
        let t = now + Duration::from_secs(1);
        let before = manager.transport().snapshot(t);

        assert_eq!(manager.toggle_low_latency(None), LatencyMode::Interactive);
        assert_eq!(manager.lookahead(), Duration::from_millis(100));
        assert_eq!(manager.toggle_low_latency(Some(true)), LatencyMode::Interactive);
        assert_eq!(manager.toggle_low_latency(Some(false)), LatencyMode::Stable);
        assert_eq!(manager.lookahead(), Duration::from_millis(150));

        assert_eq!(manager.state(), PlaybackState::Playing);
        assert_eq!(manager.transport().snapshot(t), before);
    }

    #[test]
    fn test_synchronized_start_compensates_latency() {
        let now = Instant::now();
        let mut manager = manager();
        four_bar_loop(&mut manager, now);
        manager.start_synchronized(now).unwrap();
        // 150ms stable lookahead at 120 BPM
        let position = manager.transport().snapshot(now).position;
        assert!((position.to_float() - 0.3).abs() < 0.001);
    }

    #[test]
    fn test_state_subscription() {
        let now = Instant::now();
        let mut manager = manager();
        let rx = manager.subscribe();
        manager.play(now).unwrap();
        assert_eq!(*rx.borrow(), PlaybackState::Playing);
        manager.pause(now);
        assert_eq!(*rx.borrow(), PlaybackState::Stopped);
    }
}
