//! Playback manager coupled to a tempo authority.
//!
//! While synchronization is enabled, `play()` arms a start on the next
//! downbeat instead of starting right away, the session tempo is followed and
//! a phase-lock loop keeps the transport aligned. When the authority is slow
//! or gone, playback keeps working on the local clock.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Instant;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use super::manager::{PlaybackManager, PlaybackState};
use crate::config::PlaybackConfig;
use crate::error::{Error, Result};
use crate::sync::{ClientEvent, PhaseLockHandle, PhaseLockLoop, SyncClient, SyncState};
use crate::timing::LatencyMode;

/// How a `play()` request was honored.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PlayStart {
    /// Started on the local clock.
    Local,
    /// Armed; the transport starts on the next downbeat of the session.
    OnNextDownbeat,
    /// Playback is disabled.
    Ignored,
}

fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

fn lock(manager: &Mutex<PlaybackManager>) -> MutexGuard<'_, PlaybackManager> {
    manager.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A [`PlaybackManager`] driven by a [`SyncClient`].
pub struct SynchronizedPlayback {
    manager: Arc<Mutex<PlaybackManager>>,
    client: SyncClient,
    config: PlaybackConfig,
    pending_start: Option<JoinHandle<()>>,
    phase_lock: Option<PhaseLockHandle>,
    follower: JoinHandle<()>,
}

impl SynchronizedPlayback {
    /// Couple `manager` to `client`. Must be called inside a tokio runtime.
    pub fn new(manager: PlaybackManager, client: SyncClient, config: &PlaybackConfig) -> Self {
        let manager = Arc::new(Mutex::new(manager));
        let follower = tokio::spawn(follow_tempo(
            Arc::downgrade(&manager),
            client.clone(),
            client.subscribe(),
        ));
        Self {
            manager,
            client,
            config: config.clone(),
            pending_start: None,
            phase_lock: None,
            follower,
        }
    }

    /// Shared handle to the manager, for schedulers and UI code.
    pub fn manager(&self) -> Arc<Mutex<PlaybackManager>> {
        Arc::clone(&self.manager)
    }

    pub fn client(&self) -> &SyncClient {
        &self.client
    }

    pub fn state(&self) -> PlaybackState {
        lock(&self.manager).state()
    }

    pub fn is_synchronized(&self) -> bool {
        self.client.state() == SyncState::Enabled
    }

    /// Whether a downbeat start is armed and has not fired yet.
    pub fn is_start_pending(&self) -> bool {
        self.pending_start
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    pub fn is_phase_locked(&self) -> bool {
        self.phase_lock
            .as_ref()
            .is_some_and(PhaseLockHandle::is_running)
    }

    pub fn phase_lock(&self) -> Option<&PhaseLockHandle> {
        self.phase_lock.as_ref()
    }

    /// Start playback.
    ///
    /// With synchronization enabled the start is deferred to the next
    /// downbeat. If the authority disappears before that, playback starts
    /// locally; if synchronization is switched off or no downbeat arrives in
    /// time, the armed start is dropped.
    pub fn play(&mut self) -> Result<PlayStart> {
        match self.state() {
            PlaybackState::Disabled => return Ok(PlayStart::Ignored),
            PlaybackState::Playing => return Ok(PlayStart::Local),
            PlaybackState::Stopped => {}
        }
        if !self.is_synchronized() {
            let started = lock(&self.manager).play(now())?;
            return Ok(if started {
                PlayStart::Local
            } else {
                PlayStart::Ignored
            });
        }

        if self.is_start_pending() {
            return Ok(PlayStart::OnNextDownbeat);
        }
        log::info!("[PLAYBACK] Waiting for the next downbeat");
        self.pending_start = Some(tokio::spawn(start_on_downbeat(
            Arc::downgrade(&self.manager),
            self.client.clone(),
            self.config.downbeat_wait,
        )));
        self.ensure_phase_lock();
        Ok(PlayStart::OnNextDownbeat)
    }

    pub fn stop(&mut self) {
        self.cancel_pending_start();
        self.phase_lock = None;
        lock(&self.manager).stop(now());
    }

    pub fn pause(&mut self) {
        self.cancel_pending_start();
        self.phase_lock = None;
        lock(&self.manager).pause(now());
    }

    pub fn enable(&mut self) {
        lock(&self.manager).enable();
    }

    pub fn disable(&mut self) {
        self.cancel_pending_start();
        self.phase_lock = None;
        lock(&self.manager).disable(now());
    }

    /// Join the session.
    ///
    /// On failure the error is returned and playback stays local; nothing
    /// else changes.
    pub async fn enable_sync(&mut self) -> Result<()> {
        if let Err(e) = self.client.enable().await {
            log::warn!("[PLAYBACK] Synchronization unavailable, playing locally: {}", e);
            return Err(e);
        }
        if let Some(bpm) = self.client.session().last_known_external_tempo {
            if let Err(e) = lock(&self.manager).set_tempo(bpm, now()) {
                log::warn!("[PLAYBACK] Ignoring session tempo: {}", e);
            }
        }
        if self.state() == PlaybackState::Playing {
            self.ensure_phase_lock();
        }
        Ok(())
    }

    /// Leave the session; playback continues on the local clock.
    pub async fn disable_sync(&mut self) -> Result<()> {
        self.cancel_pending_start();
        self.phase_lock = None;
        self.client.disable().await
    }

    /// Change the tempo locally and, while synchronized, for the session.
    ///
    /// A failure to reach the authority is logged; the local change stands.
    pub async fn set_tempo(&mut self, bpm: f64) -> Result<()> {
        lock(&self.manager).set_tempo(bpm, now())?;
        if self.is_synchronized() {
            match self.client.set_tempo(bpm).await {
                Ok(()) => {}
                Err(e) if e.is_protocol() => {
                    log::warn!("[PLAYBACK] Could not forward tempo to the session: {}", e);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    pub fn toggle_low_latency(&mut self, force: Option<bool>) -> LatencyMode {
        lock(&self.manager).toggle_low_latency(force)
    }

    fn cancel_pending_start(&mut self) {
        if let Some(task) = self.pending_start.take() {
            if !task.is_finished() {
                log::debug!("[PLAYBACK] Cancelling armed downbeat start");
            }
            task.abort();
        }
    }

    fn ensure_phase_lock(&mut self) {
        if self.is_phase_locked() {
            return;
        }
        self.phase_lock = Some(PhaseLockLoop::spawn(
            Arc::downgrade(&self.manager),
            self.client.clone(),
            self.config.phase_lock.clone(),
        ));
    }
}

impl Drop for SynchronizedPlayback {
    fn drop(&mut self) {
        self.cancel_pending_start();
        self.follower.abort();
    }
}

impl std::fmt::Debug for SynchronizedPlayback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SynchronizedPlayback")
            .field("state", &self.state())
            .field("sync", &self.client.state())
            .field("start_pending", &self.is_start_pending())
            .field("phase_locked", &self.is_phase_locked())
            .finish()
    }
}

async fn start_on_downbeat(
    manager: Weak<Mutex<PlaybackManager>>,
    client: SyncClient,
    wait: std::time::Duration,
) {
    let outcome = client.next_downbeat(wait).await;
    let Some(manager) = manager.upgrade() else {
        return;
    };
    let mut manager = lock(&manager);
    let result = match outcome {
        Ok(()) => manager.start_synchronized(now()),
        Err(Error::ProtocolDisconnected) => {
            log::warn!("[PLAYBACK] Tempo authority lost before downbeat, starting locally");
            manager.play(now())
        }
        Err(e) => {
            log::info!("[PLAYBACK] Dropping armed start: {}", e);
            return;
        }
    };
    if let Err(e) = result {
        log::warn!("[PLAYBACK] Could not start playback: {}", e);
    }
}

async fn follow_tempo(
    manager: Weak<Mutex<PlaybackManager>>,
    client: SyncClient,
    mut events: broadcast::Receiver<ClientEvent>,
) {
    loop {
        let bpm = match events.recv().await {
            Ok(ClientEvent::TempoChanged(bpm)) => bpm,
            Ok(_) => continue,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                log::debug!("[PLAYBACK] Tempo follower lagged by {} events", skipped);
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => return,
        };
        if client.state() != SyncState::Enabled {
            continue;
        }
        let Some(manager) = manager.upgrade() else {
            return;
        };
        let mut manager = lock(&manager);
        if let Err(e) = manager.set_tempo(bpm, now()) {
            log::warn!("[PLAYBACK] Ignoring session tempo: {}", e);
        } else {
            log::info!("[PLAYBACK] Following session tempo {} BPM", bpm);
        }
    }
}
