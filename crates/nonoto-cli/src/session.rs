//! The `nonoto play` session loop.

use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use nonoto_core::sync::{json_lines, LoopbackHandle};
use nonoto_core::{
    content_channel, ClientEvent, DoubleBufferedContentScheduler, LoopbackAuthority, PlayStart,
    PlaybackConfig, PlaybackManager, SyncClient, SynchronizedPlayback,
};
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;

use crate::demo;
use crate::sink::LoggingSink;

/// Interval between two scheduling ticks.
const SCHEDULE_TICK: Duration = Duration::from_millis(10);

/// Interval between two status lines.
const STATUS_EVERY: Duration = Duration::from_secs(2);

/// Where the session gets its tempo from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SyncMode {
    Off,
    Loopback,
    Remote(String),
}

#[derive(Clone, Debug)]
pub struct SessionOptions {
    pub config: PlaybackConfig,
    pub bars: u32,
    pub regenerate_every: Duration,
    pub run_for: Option<Duration>,
    pub sync: SyncMode,
}

fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

fn lookahead(manager: &Mutex<PlaybackManager>) -> Duration {
    manager
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .lookahead()
}

async fn until(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Log what the sync client reports until it goes away.
async fn report_client_events(mut events: broadcast::Receiver<ClientEvent>) {
    loop {
        match events.recv().await {
            Ok(ClientEvent::Notice(notice)) => log::info!("[SESSION] {}", notice.message),
            Ok(ClientEvent::TempoChanged(bpm)) => log::info!("[SESSION] Session tempo {} BPM", bpm),
            Ok(ClientEvent::Downbeat) => log::debug!("[SESSION] Downbeat"),
            Ok(ClientEvent::Disconnected) => log::warn!("[SESSION] Tempo authority disconnected"),
            Ok(other) => log::debug!("[SESSION] {:?}", other),
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Open the sync channel for `mode`.
///
/// An unreachable remote authority is not fatal: the session falls back to
/// an idle loopback and plays on the local clock.
async fn open_channel(
    mode: &SyncMode,
    config: &PlaybackConfig,
) -> (nonoto_core::SyncChannel, Option<LoopbackHandle>, bool) {
    if let SyncMode::Remote(addr) = mode {
        match json_lines::connect(addr.as_str()).await {
            Ok(channel) => return (channel, None, true),
            Err(e) => log::warn!(
                "[SESSION] Could not reach tempo authority at {}: {}, playing locally",
                addr,
                e
            ),
        }
    }
    let (channel, handle) = LoopbackAuthority::spawn(config.initial_tempo, config.quantum);
    (channel, Some(handle), *mode == SyncMode::Loopback)
}

pub async fn run(options: SessionOptions) -> Result<()> {
    let SessionOptions {
        config,
        bars,
        regenerate_every,
        run_for,
        sync,
    } = options;

    log::info!(
        "[SESSION] {} BPM, {} bar loop, {:?} latency",
        config.initial_tempo,
        bars,
        config.initial_latency_mode
    );
    let manager = PlaybackManager::from_config(&config).context("Failed to create playback manager")?;
    let transport = manager.transport().clone();

    // the loopback handle must outlive the session
    let (channel, _loopback, synchronize) = open_channel(&sync, &config).await;
    let client = SyncClient::spawn(channel, &config);
    let reporter = tokio::spawn(report_client_events(client.subscribe()));
    let mut playback = SynchronizedPlayback::new(manager, client, &config);
    if synchronize {
        if let Err(e) = playback.enable_sync().await {
            log::warn!("[SESSION] Synchronization failed, continuing with local tempo: {}", e);
        }
    }

    let (publisher, feed) = content_channel();
    let mut buffer = DoubleBufferedContentScheduler::with_config(transport.clone(), &config);
    buffer.attach_feed(feed);
    let producer = tokio::spawn(demo::run_producer(
        publisher,
        regenerate_every,
        bars,
        config.time_signature(),
    ));

    let origin = now();
    let mut sink = LoggingSink::new(origin);
    match playback.play().context("Failed to start playback")? {
        PlayStart::Local => log::info!("[SESSION] Playing"),
        PlayStart::OnNextDownbeat => log::info!("[SESSION] Playing from the next downbeat"),
        PlayStart::Ignored => log::warn!("[SESSION] Playback is disabled"),
    }
    match run_for {
        Some(limit) => log::info!("[SESSION] Running for {:?}", limit),
        None => log::info!("[SESSION] Running... (Press Ctrl+C to exit)"),
    }

    let manager = playback.manager();
    let mut ticker = tokio::time::interval(SCHEDULE_TICK);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let deadline = run_for.map(|limit| tokio::time::Instant::now() + limit);
    let mut last_status = origin;
    let mut playing_generation = 0;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let now = now();
                buffer.tick(now, lookahead(&manager), &mut sink);

                let generation = buffer.active_generation().generation();
                if generation != playing_generation {
                    log::info!("[SESSION] Now playing generation {}", generation);
                    playing_generation = generation;
                }
                if now.duration_since(last_status) >= STATUS_EVERY {
                    let snapshot = transport.snapshot(now);
                    log::info!(
                        "[SESSION] {} | {:.1} BPM | loop {}..{} | {:>3.0}% | {}",
                        snapshot.bars_beats_ticks(),
                        snapshot.bpm,
                        snapshot.loop_start,
                        snapshot.loop_end,
                        snapshot.progress * 100.0,
                        if playback.is_synchronized() { "synced" } else { "local" }
                    );
                    last_status = now;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                log::info!("[SESSION] Interrupted by user (Ctrl+C)");
                break;
            }
            _ = until(deadline) => break,
        }
    }

    producer.abort();
    playback.stop();
    if playback.is_synchronized() {
        if let Err(e) = playback.disable_sync().await {
            log::warn!("[SESSION] Could not leave the session cleanly: {}", e);
        }
    }
    reporter.abort();

    log::info!(
        "[SESSION] Done: {} notes, {} note-offs, {} pedal changes, last generation {}",
        sink.notes(),
        sink.note_offs(),
        sink.pedals(),
        playing_generation
    );
    Ok(())
}
