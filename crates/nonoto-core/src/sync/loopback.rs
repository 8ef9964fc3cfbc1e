//! In-process tempo authority.
//!
//! Simulates a shared session: a beat timeline at the session tempo, a
//! quantum, a peer count and a downbeat clock. Used by the CLI when no
//! external authority is configured, and by tests to script tempo changes,
//! silent authorities and disconnects.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::messages::{AuthorityEnd, SyncChannel, SyncEvent, SyncRequest, SyncResponse};

/// Resolution of the downbeat clock.
const TICK: Duration = Duration::from_millis(16);

#[derive(Clone, Debug)]
struct Session {
    bpm: f64,
    quantum: f64,
    peers: u32,
    enabled: bool,
    anchor_instant: Instant,
    anchor_beat: f64,
}

impl Session {
    fn beat_at(&self, now: Instant) -> f64 {
        let elapsed = now.saturating_duration_since(self.anchor_instant);
        self.anchor_beat + elapsed.as_secs_f64() * self.bpm / 60.0
    }

    fn phase_at(&self, now: Instant) -> f64 {
        self.beat_at(now).rem_euclid(self.quantum)
    }

    fn set_tempo(&mut self, bpm: f64, now: Instant) {
        self.anchor_beat = self.beat_at(now);
        self.anchor_instant = now;
        self.bpm = bpm;
    }
}

#[derive(Debug)]
enum Command {
    Tempo(f64),
    Peers(u32),
    Disconnect,
}

fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

/// Control handle for a running loopback authority.
#[derive(Debug)]
pub struct LoopbackHandle {
    session: Arc<Mutex<Session>>,
    muted: Arc<AtomicBool>,
    commands: mpsc::UnboundedSender<Command>,
    task: JoinHandle<()>,
}

/// Spawns loopback authorities.
pub struct LoopbackAuthority;

impl LoopbackAuthority {
    /// Start a session at `bpm` with `quantum` beats per downbeat.
    ///
    /// Returns the client end of the channel and a control handle.
    pub fn spawn(bpm: f64, quantum: f64) -> (SyncChannel, LoopbackHandle) {
        let (channel, authority) = SyncChannel::pair();
        let session = Arc::new(Mutex::new(Session {
            bpm,
            quantum,
            peers: 0,
            enabled: false,
            anchor_instant: now(),
            anchor_beat: 0.0,
        }));
        let muted = Arc::new(AtomicBool::new(false));
        let (commands, command_rx) = mpsc::unbounded_channel();

        let task = tokio::spawn(run(
            authority,
            command_rx,
            Arc::clone(&session),
            Arc::clone(&muted),
        ));
        log::info!("[LOOPBACK] Session at {} BPM, quantum {}", bpm, quantum);
        (
            channel,
            LoopbackHandle {
                session,
                muted,
                commands,
                task,
            },
        )
    }
}

impl LoopbackHandle {
    /// Another peer changes the session tempo.
    pub fn set_tempo(&self, bpm: f64) {
        let _ = self.commands.send(Command::Tempo(bpm));
    }

    pub fn set_peers(&self, count: u32) {
        let _ = self.commands.send(Command::Peers(count));
    }

    /// Stop answering requests; events keep flowing.
    pub fn mute(&self, muted: bool) {
        self.muted.store(muted, Ordering::Release);
    }

    /// Close the channel as if the authority crashed.
    pub fn disconnect(&self) {
        let _ = self.commands.send(Command::Disconnect);
    }

    pub fn tempo(&self) -> f64 {
        self.session().bpm
    }

    pub fn is_enabled(&self) -> bool {
        self.session().enabled
    }

    /// Session phase within the quantum at `at`.
    pub fn phase_at(&self, at: Instant) -> f64 {
        self.session().phase_at(at)
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    fn session(&self) -> std::sync::MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for LoopbackHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run(
    mut authority: AuthorityEnd,
    mut commands: mpsc::UnboundedReceiver<Command>,
    session: Arc<Mutex<Session>>,
    muted: Arc<AtomicBool>,
) {
    let lock = || session.lock().unwrap_or_else(PoisonError::into_inner);
    let mut ticker = tokio::time::interval(TICK);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut last_bar = {
        let session = lock();
        (session.beat_at(now()) / session.quantum).floor()
    };

    loop {
        tokio::select! {
            frame = authority.requests.recv() => {
                let Some(frame) = frame else {
                    log::debug!("[LOOPBACK] Client went away");
                    break;
                };
                let (response, event) = handle_request(&mut lock(), frame.request);
                if muted.load(Ordering::Acquire) {
                    log::trace!("[LOOPBACK] Muted, dropping reply to #{}", frame.id);
                } else {
                    authority.respond(frame.id, response);
                }
                if let Some(event) = event {
                    authority.push(event);
                }
            }
            command = commands.recv() => {
                let event = match command {
                    Some(Command::Tempo(bpm)) => {
                        lock().set_tempo(bpm, now());
                        log::info!("[LOOPBACK] Session tempo {} BPM", bpm);
                        SyncEvent::Tempo { bpm }
                    }
                    Some(Command::Peers(count)) => {
                        lock().peers = count;
                        SyncEvent::NumPeers { count }
                    }
                    Some(Command::Disconnect) | None => {
                        log::info!("[LOOPBACK] Disconnecting");
                        break;
                    }
                };
                authority.push(event);
            }
            _ = ticker.tick() => {
                let bar = {
                    let session = lock();
                    (session.beat_at(now()) / session.quantum).floor()
                };
                if bar > last_bar {
                    authority.push(SyncEvent::Downbeat);
                }
                last_bar = bar;
            }
        }
    }
}

fn handle_request(session: &mut Session, request: SyncRequest) -> (SyncResponse, Option<SyncEvent>) {
    match request {
        SyncRequest::Enable => {
            session.enabled = true;
            (SyncResponse::Enabled, None)
        }
        SyncRequest::Disable => {
            session.enabled = false;
            (SyncResponse::Disabled, None)
        }
        SyncRequest::GetTempo => (SyncResponse::Tempo { bpm: session.bpm }, None),
        SyncRequest::GetQuantum => (
            SyncResponse::Quantum {
                quantum: session.quantum,
            },
            None,
        ),
        SyncRequest::GetPhase => (
            SyncResponse::Phase {
                phase: session.phase_at(now()),
            },
            None,
        ),
        SyncRequest::GetNumPeers => (
            SyncResponse::NumPeers {
                count: session.peers,
            },
            None,
        ),
        SyncRequest::SetTempo { bpm } => {
            if !(bpm.is_finite() && bpm > 0.0) {
                return (
                    SyncResponse::Error {
                        message: format!("invalid tempo {bpm}"),
                    },
                    None,
                );
            }
            session.set_tempo(bpm, now());
            (SyncResponse::Ack, Some(SyncEvent::Tempo { bpm }))
        }
        SyncRequest::SetQuantum { quantum } => {
            if !(quantum.is_finite() && quantum > 0.0) {
                return (
                    SyncResponse::Error {
                        message: format!("invalid quantum {quantum}"),
                    },
                    None,
                );
            }
            session.quantum = quantum;
            (SyncResponse::Ack, Some(SyncEvent::Quantum { quantum }))
        }
        SyncRequest::Ping => (SyncResponse::Pong, Some(SyncEvent::Pong)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PlaybackConfig;
    use crate::error::Error;
    use crate::sync::client::SyncClient;
    use crate::sync::messages::ClientEvent;

    #[test]
    fn test_session_phase() {
        let start = Instant::now();
        let mut session = Session {
            bpm: 120.0,
            quantum: 4.0,
            peers: 0,
            enabled: true,
            anchor_instant: start,
            anchor_beat: 0.0,
        };
        let at = start + Duration::from_millis(2500);
        assert!((session.phase_at(at) - 1.0).abs() < 1e-9);

        session.set_tempo(60.0, at);
        assert!((session.beat_at(at + Duration::from_secs(1)) - 6.0).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_downbeats_and_phase() {
        let (channel, handle) = LoopbackAuthority::spawn(120.0, 4.0);
        let client = SyncClient::spawn(channel, &PlaybackConfig::default());
        client.enable().await.unwrap();
        assert!(handle.is_enabled());

        // one bar of 4 beats at 120 BPM lasts 2s
        client.next_downbeat(Duration::from_secs(3)).await.unwrap();
        let phase = client.request_phase().await.unwrap();
        assert!(phase < 0.1, "phase right after downbeat: {phase}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_external_tempo_change_is_pushed() {
        let (channel, handle) = LoopbackAuthority::spawn(120.0, 4.0);
        let client = SyncClient::spawn(channel, &PlaybackConfig::default());
        client.enable().await.unwrap();
        let mut events = client.subscribe();

        handle.set_tempo(90.0);
        loop {
            if let ClientEvent::TempoChanged(bpm) = events.recv().await.unwrap() {
                assert!((bpm - 90.0).abs() < 1e-9);
                break;
            }
        }
        assert_eq!(client.session().last_known_external_tempo, Some(90.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_muted_authority_times_out() {
        let (channel, handle) = LoopbackAuthority::spawn(120.0, 4.0);
        let client = SyncClient::spawn(channel, &PlaybackConfig::default());
        handle.mute(true);
        assert!(matches!(
            client.enable().await,
            Err(Error::ProtocolTimeout { request: "enable", .. })
        ));

        handle.mute(false);
        client.enable().await.unwrap();
        handle.disconnect();
        let mut state = client.watch_state();
        state
            .wait_for(|s| *s == crate::sync::client::SyncState::Disabled)
            .await
            .unwrap();
        assert!(!client.is_connected());
    }
}
