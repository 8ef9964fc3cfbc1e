//! Client for an external tempo authority.
//!
//! Every request is a correlated future with its own deadline; inbound
//! events update the [`SyncSession`] and are republished on a broadcast
//! stream. Failures never propagate into playback: a timeout leaves the
//! state as it was, and losing the channel disables synchronization.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use tokio::sync::{broadcast, oneshot, watch};

use super::messages::{
    ClientEvent, InboundFrame, Notice, OutboundFrame, SyncChannel, SyncEvent, SyncRequest,
    SyncResponse,
};
use crate::config::PlaybackConfig;
use crate::error::{Error, Result};

/// How long user-facing notices stay visible.
const NOTICE_DURATION: Duration = Duration::from_millis(4000);

const EVENT_CAPACITY: usize = 256;

/// Protocol state of the client.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncState {
    Disabled,
    Enabling,
    Enabled,
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncState::Disabled => write!(f, "disabled"),
            SyncState::Enabling => write!(f, "enabling"),
            SyncState::Enabled => write!(f, "enabled"),
        }
    }
}

/// What the client knows about the shared session.
#[derive(Clone, Debug, PartialEq)]
pub struct SyncSession {
    pub enabled: bool,
    pub quantum: f64,
    pub peer_count: u32,
    pub last_known_external_tempo: Option<f64>,
}

struct Inner {
    outbound: tokio::sync::mpsc::UnboundedSender<OutboundFrame>,
    pending: Mutex<HashMap<u64, oneshot::Sender<SyncResponse>>>,
    next_id: AtomicU64,
    connected: AtomicBool,
    session: Mutex<SyncSession>,
    state_tx: watch::Sender<SyncState>,
    events_tx: broadcast::Sender<ClientEvent>,
    request_timeout: Duration,
}

/// Handle to the synchronization client. Cheap to clone.
#[derive(Clone)]
pub struct SyncClient {
    inner: Arc<Inner>,
}

impl SyncClient {
    /// Start the client on `channel`.
    ///
    /// Spawns the inbound dispatcher, so this must run inside a tokio runtime.
    pub fn spawn(channel: SyncChannel, config: &PlaybackConfig) -> Self {
        let SyncChannel {
            outbound,
            mut inbound,
        } = channel;
        let (state_tx, _) = watch::channel(SyncState::Disabled);
        let (events_tx, _) = broadcast::channel(EVENT_CAPACITY);
        let inner = Arc::new(Inner {
            outbound,
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            connected: AtomicBool::new(true),
            session: Mutex::new(SyncSession {
                enabled: false,
                quantum: config.quantum,
                peer_count: 0,
                last_known_external_tempo: None,
            }),
            state_tx,
            events_tx,
            request_timeout: config.request_timeout,
        });

        let weak: Weak<Inner> = Arc::downgrade(&inner);
        tokio::spawn(async move {
            while let Some(frame) = inbound.recv().await {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                inner.dispatch(frame);
            }
            if let Some(inner) = weak.upgrade() {
                inner.disconnected();
            }
        });

        Self { inner }
    }

    pub fn state(&self) -> SyncState {
        *self.inner.state_tx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<SyncState> {
        self.inner.state_tx.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.inner.events_tx.subscribe()
    }

    pub fn session(&self) -> SyncSession {
        self.inner.session().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::Acquire)
    }

    /// Ask the authority to include us in the session.
    ///
    /// On confirmation the client is `Enabled`, announces
    /// [`ClientEvent::SynchronizationStarted`] and pulls the session tempo.
    /// Any failure leaves the client `Disabled`. A confirmation arriving after
    /// [`disable`](Self::disable) was called is refused with `Cancelled`, and
    /// a second call while enabling waits for the first one.
    pub async fn enable(&self) -> Result<()> {
        match self.state() {
            SyncState::Enabled => return Ok(()),
            SyncState::Enabling => {
                log::debug!("[SYNC] Enable already in progress");
                return self.wait_for_enable().await;
            }
            SyncState::Disabled => {}
        }
        self.inner.set_state(SyncState::Enabling);

        match self.request(SyncRequest::Enable).await {
            Ok(SyncResponse::Enabled) => {}
            Ok(other) => {
                self.inner.leave_enabling(SyncState::Disabled);
                return Err(unexpected("enable", &other));
            }
            Err(e) => {
                log::warn!("[SYNC] Enable failed: {}", e);
                self.inner.leave_enabling(SyncState::Disabled);
                return Err(e);
            }
        }

        if !self.inner.leave_enabling(SyncState::Enabled) {
            log::info!("[SYNC] Enable confirmed after synchronization was turned off");
            return Err(Error::Cancelled("enable"));
        }
        self.inner.session().enabled = true;
        self.inner.emit(ClientEvent::SynchronizationStarted);

        if let Err(e) = self.request_tempo().await {
            log::warn!("[SYNC] Could not fetch session tempo after enabling: {}", e);
        }
        Ok(())
    }

    async fn wait_for_enable(&self) -> Result<()> {
        let mut state = self.watch_state();
        let settled = state
            .wait_for(|s| *s != SyncState::Enabling)
            .await
            .map(|s| *s);
        match settled {
            Ok(SyncState::Enabled) => Ok(()),
            Ok(_) => Err(Error::Cancelled("enable")),
            Err(_) => Err(Error::ProtocolDisconnected),
        }
    }

    /// Leave the session.
    ///
    /// Local state switches to `Disabled` immediately, which cancels pending
    /// downbeat waits; a failed disable request is only logged.
    pub async fn disable(&self) -> Result<()> {
        if self.state() == SyncState::Disabled {
            return Ok(());
        }
        self.inner.session().enabled = false;
        self.inner.set_state(SyncState::Disabled);
        self.inner.emit(ClientEvent::SynchronizationStopped);

        match self.request(SyncRequest::Disable).await {
            Ok(SyncResponse::Disabled) | Ok(SyncResponse::Ack) => {}
            Ok(other) => log::warn!("[SYNC] Unexpected reply to disable: {:?}", other),
            Err(e) => log::warn!("[SYNC] Disable request failed: {}", e),
        }
        Ok(())
    }

    pub async fn request_tempo(&self) -> Result<f64> {
        match self.request(SyncRequest::GetTempo).await? {
            SyncResponse::Tempo { bpm } => {
                self.inner.tempo_changed(bpm);
                Ok(bpm)
            }
            other => Err(unexpected("get-tempo", &other)),
        }
    }

    pub async fn request_quantum(&self) -> Result<f64> {
        match self.request(SyncRequest::GetQuantum).await? {
            SyncResponse::Quantum { quantum } => {
                self.inner.quantum_changed(quantum);
                Ok(quantum)
            }
            other => Err(unexpected("get-quantum", &other)),
        }
    }

    /// Beats elapsed in the authority's current quantum.
    pub async fn request_phase(&self) -> Result<f64> {
        match self.request(SyncRequest::GetPhase).await? {
            SyncResponse::Phase { phase } => Ok(phase),
            other => Err(unexpected("get-phase", &other)),
        }
    }

    pub async fn request_num_peers(&self) -> Result<u32> {
        match self.request(SyncRequest::GetNumPeers).await? {
            SyncResponse::NumPeers { count } => {
                self.inner.peers_changed(count);
                Ok(count)
            }
            other => Err(unexpected("get-num-peers", &other)),
        }
    }

    pub async fn set_tempo(&self, bpm: f64) -> Result<()> {
        if !(bpm.is_finite() && bpm > 0.0) {
            return Err(Error::InvalidTempo(bpm));
        }
        match self.request(SyncRequest::SetTempo { bpm }).await? {
            SyncResponse::Ack | SyncResponse::Tempo { .. } => {
                self.inner.session().last_known_external_tempo = Some(bpm);
                Ok(())
            }
            other => Err(unexpected("set-tempo", &other)),
        }
    }

    pub async fn set_quantum(&self, quantum: f64) -> Result<()> {
        if !(quantum.is_finite() && quantum > 0.0) {
            return Err(Error::InvalidConfig(format!("quantum must be positive, got {quantum}")));
        }
        match self.request(SyncRequest::SetQuantum { quantum }).await? {
            SyncResponse::Ack | SyncResponse::Quantum { .. } => {
                self.inner.session().quantum = quantum;
                Ok(())
            }
            other => Err(unexpected("set-quantum", &other)),
        }
    }

    /// Round-trip time to the authority.
    pub async fn ping(&self) -> Result<Duration> {
        let sent = tokio::time::Instant::now();
        match self.request(SyncRequest::Ping).await? {
            SyncResponse::Pong => Ok(sent.elapsed()),
            other => Err(unexpected("ping", &other)),
        }
    }

    /// Wait for the next downbeat, at most `wait`.
    ///
    /// Fails with `Cancelled` if synchronization is turned off meanwhile and
    /// with `ProtocolDisconnected` if the channel goes away.
    pub async fn next_downbeat(&self, wait: Duration) -> Result<()> {
        let mut events = self.subscribe();
        if !self.is_connected() {
            return Err(Error::ProtocolDisconnected);
        }
        if self.state() != SyncState::Enabled {
            return Err(Error::Cancelled("downbeat"));
        }

        let waiting = async {
            loop {
                match events.recv().await {
                    Ok(ClientEvent::Downbeat) => return Ok(()),
                    Ok(ClientEvent::Disconnected) => return Err(Error::ProtocolDisconnected),
                    Ok(ClientEvent::SynchronizationStopped) => {
                        return Err(Error::Cancelled("downbeat"))
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        log::debug!("[SYNC] Downbeat waiter lagged by {} events", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(Error::ProtocolDisconnected)
                    }
                }
            }
        };
        match tokio::time::timeout(wait, waiting).await {
            Ok(result) => result,
            Err(_) => Err(Error::ProtocolTimeout {
                request: "downbeat",
                timeout: wait,
            }),
        }
    }

    async fn request(&self, request: SyncRequest) -> Result<SyncResponse> {
        let inner = &self.inner;
        let name = request.name();
        if !inner.connected.load(Ordering::Acquire) {
            return Err(Error::ProtocolDisconnected);
        }

        let id = inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        inner.pending().insert(id, tx);
        log::trace!("[SYNC] -> {} #{}", name, id);

        if inner.outbound.send(OutboundFrame { id, request }).is_err() {
            inner.pending().remove(&id);
            inner.disconnected();
            return Err(Error::ProtocolDisconnected);
        }

        match tokio::time::timeout(inner.request_timeout, rx).await {
            Ok(Ok(SyncResponse::Error { message })) => Err(Error::UnexpectedResponse {
                request: name,
                response: message,
            }),
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(Error::ProtocolDisconnected),
            Err(_) => {
                inner.pending().remove(&id);
                log::warn!(
                    "[SYNC] Request '{}' timed out after {:?}",
                    name,
                    inner.request_timeout
                );
                Err(Error::ProtocolTimeout {
                    request: name,
                    timeout: inner.request_timeout,
                })
            }
        }
    }
}

impl fmt::Debug for SyncClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncClient")
            .field("state", &self.state())
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

fn unexpected(request: &'static str, response: &SyncResponse) -> Error {
    Error::UnexpectedResponse {
        request,
        response: format!("{response:?}"),
    }
}

impl Inner {
    fn pending(&self) -> std::sync::MutexGuard<'_, HashMap<u64, oneshot::Sender<SyncResponse>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn session(&self) -> std::sync::MutexGuard<'_, SyncSession> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: ClientEvent) {
        // no subscribers is fine
        let _ = self.events_tx.send(event);
    }

    fn notice(&self, message: String) {
        log::info!("[SYNC] {}", message);
        self.emit(ClientEvent::Notice(Notice {
            message,
            display_for: NOTICE_DURATION,
        }));
    }

    fn set_state(&self, state: SyncState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            log::info!("[SYNC] {} -> {}", previous, state);
        }
    }

    /// Settle an `Enabling` client on `state`. Returns false when something
    /// else (disable, disconnection) already moved it on.
    fn leave_enabling(&self, state: SyncState) -> bool {
        let settled = self.state_tx.send_if_modified(|current| {
            if *current == SyncState::Enabling {
                *current = state;
                true
            } else {
                false
            }
        });
        if settled {
            log::info!("[SYNC] {} -> {}", SyncState::Enabling, state);
        }
        settled
    }

    fn dispatch(&self, frame: InboundFrame) {
        match frame {
            InboundFrame::Response { id, response } => match self.pending().remove(&id) {
                Some(tx) => {
                    // the requester may have timed out already
                    let _ = tx.send(response);
                }
                None => log::debug!("[SYNC] Dropping late response #{}", id),
            },
            InboundFrame::Event { event } => self.handle_event(event),
        }
    }

    fn handle_event(&self, event: SyncEvent) {
        match event {
            SyncEvent::Tempo { bpm } => self.tempo_changed(bpm),
            SyncEvent::Quantum { quantum } => self.quantum_changed(quantum),
            SyncEvent::NumPeers { count } => self.peers_changed(count),
            SyncEvent::Downbeat => {
                log::trace!("[SYNC] Downbeat");
                self.emit(ClientEvent::Downbeat);
            }
            SyncEvent::Pong => self.emit(ClientEvent::Pong),
        }
    }

    fn tempo_changed(&self, bpm: f64) {
        if !(bpm.is_finite() && bpm > 0.0) {
            log::warn!("[SYNC] Ignoring invalid tempo {}", bpm);
            return;
        }
        let previous = self.session().last_known_external_tempo.replace(bpm);
        if previous != Some(bpm) {
            log::debug!("[SYNC] Session tempo {} BPM", bpm);
            self.emit(ClientEvent::TempoChanged(bpm));
        }
    }

    fn quantum_changed(&self, quantum: f64) {
        if !(quantum.is_finite() && quantum > 0.0) {
            log::warn!("[SYNC] Ignoring invalid quantum {}", quantum);
            return;
        }
        let previous = std::mem::replace(&mut self.session().quantum, quantum);
        if previous != quantum {
            self.emit(ClientEvent::QuantumChanged(quantum));
        }
    }

    fn peers_changed(&self, count: u32) {
        let (previous, enabled) = {
            let mut session = self.session();
            (std::mem::replace(&mut session.peer_count, count), session.enabled)
        };
        if previous == count {
            return;
        }
        self.emit(ClientEvent::PeersChanged(count));
        if enabled {
            self.notice(format!("Number of peers changed, now {count} peer(s)"));
        }
    }

    /// The channel is gone: fail pending requests and switch off.
    fn disconnected(&self) {
        if !self.connected.swap(false, Ordering::AcqRel) {
            return;
        }
        let dropped = {
            let mut pending = self.pending();
            let count = pending.len();
            pending.clear();
            count
        };
        log::warn!(
            "[SYNC] Channel to tempo authority lost ({} pending requests failed)",
            dropped
        );
        self.session().enabled = false;
        self.set_state(SyncState::Disabled);
        self.emit(ClientEvent::Disconnected);
        self.notice("Lost connection to the tempo authority, continuing with local tempo".into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::messages::AuthorityEnd;

    fn init_logger() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn config() -> PlaybackConfig {
        PlaybackConfig {
            request_timeout: Duration::from_millis(100),
            ..Default::default()
        }
    }

    /// Answers every request the way a cooperative authority would.
    async fn serve(mut authority: AuthorityEnd, bpm: f64) {
        while let Some(frame) = authority.requests.recv().await {
            let response = match frame.request {
                SyncRequest::Enable => SyncResponse::Enabled,
                SyncRequest::Disable => SyncResponse::Disabled,
                SyncRequest::GetTempo => SyncResponse::Tempo { bpm },
                SyncRequest::GetQuantum => SyncResponse::Quantum { quantum: 4.0 },
                SyncRequest::GetPhase => SyncResponse::Phase { phase: 1.25 },
                SyncRequest::GetNumPeers => SyncResponse::NumPeers { count: 2 },
                SyncRequest::SetTempo { .. } | SyncRequest::SetQuantum { .. } => SyncResponse::Ack,
                SyncRequest::Ping => SyncResponse::Pong,
            };
            authority.respond(frame.id, response);
        }
    }

    #[tokio::test]
    async fn test_enable_pulls_tempo() {
        let (channel, authority) = SyncChannel::pair();
        tokio::spawn(serve(authority, 98.0));
        let client = SyncClient::spawn(channel, &config());
        let mut events = client.subscribe();

        client.enable().await.unwrap();
        assert_eq!(client.state(), SyncState::Enabled);
        assert_eq!(events.recv().await.unwrap(), ClientEvent::SynchronizationStarted);
        assert_eq!(events.recv().await.unwrap(), ClientEvent::TempoChanged(98.0));

        let session = client.session();
        assert!(session.enabled);
        assert_eq!(session.last_known_external_tempo, Some(98.0));

        assert!((client.request_phase().await.unwrap() - 1.25).abs() < 1e-9);
        assert_eq!(client.request_num_peers().await.unwrap(), 2);
        client.set_tempo(110.0).await.unwrap();
        assert_eq!(client.session().last_known_external_tempo, Some(110.0));
        assert!(client.set_tempo(-1.0).await.is_err());
        client.ping().await.unwrap();

        client.disable().await.unwrap();
        assert_eq!(client.state(), SyncState::Disabled);
        assert!(!client.session().enabled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_enable_timeout_falls_back_to_disabled() {
        init_logger();
        let (channel, _authority) = SyncChannel::pair();
        let client = SyncClient::spawn(channel, &config());

        let err = client.enable().await.unwrap_err();
        assert_eq!(
            err,
            Error::ProtocolTimeout {
                request: "enable",
                timeout: Duration::from_millis(100)
            }
        );
        assert_eq!(client.state(), SyncState::Disabled);
        assert!(client.is_connected());
    }

    #[tokio::test]
    async fn test_disconnect_is_implicit_disable() {
        init_logger();
        let (channel, authority) = SyncChannel::pair();
        let client = SyncClient::spawn(channel, &config());
        let mut events = client.subscribe();
        drop(authority);

        loop {
            match events.recv().await.unwrap() {
                ClientEvent::Disconnected => break,
                _ => continue,
            }
        }
        match events.recv().await.unwrap() {
            ClientEvent::Notice(notice) => assert_eq!(notice.display_for, NOTICE_DURATION),
            other => panic!("expected notice, got {other:?}"),
        }
        assert!(!client.is_connected());
        assert_eq!(client.state(), SyncState::Disabled);
        assert_eq!(client.request_tempo().await, Err(Error::ProtocolDisconnected));
    }

    #[tokio::test]
    async fn test_pending_request_fails_on_disconnect() {
        let (channel, mut authority) = SyncChannel::pair();
        let client = SyncClient::spawn(channel, &config());

        let waiter = {
            let client = client.clone();
            tokio::spawn(async move { client.request_tempo().await })
        };
        // take the request, then vanish without answering
        let _frame = authority.requests.recv().await.unwrap();
        drop(authority);

        assert_eq!(waiter.await.unwrap(), Err(Error::ProtocolDisconnected));
    }

    #[tokio::test]
    async fn test_peer_notice_while_enabled() {
        let (channel, mut authority) = SyncChannel::pair();
        let client = SyncClient::spawn(channel, &config());
        let mut events = client.subscribe();

        let enabling = {
            let client = client.clone();
            tokio::spawn(async move { client.enable().await })
        };
        let frame = authority.requests.recv().await.unwrap();
        authority.respond(frame.id, SyncResponse::Enabled);
        let frame = authority.requests.recv().await.unwrap();
        authority.respond(frame.id, SyncResponse::Tempo { bpm: 120.0 });
        enabling.await.unwrap().unwrap();

        authority.push(SyncEvent::NumPeers { count: 3 });
        let mut saw_notice = false;
        while let Ok(event) = events.recv().await {
            if let ClientEvent::Notice(notice) = event {
                assert_eq!(notice.message, "Number of peers changed, now 3 peer(s)");
                saw_notice = true;
                break;
            }
        }
        assert!(saw_notice);
        assert_eq!(client.session().peer_count, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_next_downbeat_outcomes() {
        let (channel, mut authority) = SyncChannel::pair();
        let client = SyncClient::spawn(channel, &config());

        // not enabled yet
        assert_eq!(
            client.next_downbeat(Duration::from_secs(1)).await,
            Err(Error::Cancelled("downbeat"))
        );

        let enabling = {
            let client = client.clone();
            tokio::spawn(async move { client.enable().await })
        };
        let frame = authority.requests.recv().await.unwrap();
        authority.respond(frame.id, SyncResponse::Enabled);
        let frame = authority.requests.recv().await.unwrap();
        authority.respond(frame.id, SyncResponse::Tempo { bpm: 120.0 });
        enabling.await.unwrap().unwrap();

        let waiter = {
            let client = client.clone();
            tokio::spawn(async move { client.next_downbeat(Duration::from_secs(1)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        authority.push(SyncEvent::Downbeat);
        assert_eq!(waiter.await.unwrap(), Ok(()));

        assert_eq!(
            client.next_downbeat(Duration::from_millis(300)).await,
            Err(Error::ProtocolTimeout {
                request: "downbeat",
                timeout: Duration::from_millis(300)
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_disable_while_enabling_refuses_late_confirmation() {
        init_logger();
        let (channel, mut authority) = SyncChannel::pair();
        let client = SyncClient::spawn(channel, &config());

        let enabling = {
            let client = client.clone();
            tokio::spawn(async move { client.enable().await })
        };
        let enable = authority.requests.recv().await.unwrap();
        assert_eq!(enable.request, SyncRequest::Enable);
        assert_eq!(client.state(), SyncState::Enabling);

        // a second enable joins the first one instead of asking again
        let joining = {
            let client = client.clone();
            tokio::spawn(async move { client.enable().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let disabling = {
            let client = client.clone();
            tokio::spawn(async move { client.disable().await })
        };
        let disable = authority.requests.recv().await.unwrap();
        assert_eq!(disable.request, SyncRequest::Disable);
        assert_eq!(client.state(), SyncState::Disabled);

        authority.respond(enable.id, SyncResponse::Enabled);
        authority.respond(disable.id, SyncResponse::Disabled);
        assert_eq!(enabling.await.unwrap(), Err(Error::Cancelled("enable")));
        assert_eq!(joining.await.unwrap(), Err(Error::Cancelled("enable")));
        disabling.await.unwrap().unwrap();

        assert_eq!(client.state(), SyncState::Disabled);
        assert!(!client.session().enabled);
        // no duplicate enable and no tempo pull after the refused confirmation
        assert!(authority.requests.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_disable_cancels_downbeat_wait() {
        init_logger();
        let (channel, authority) = SyncChannel::pair();
        tokio::spawn(serve(authority, 120.0));
        let client = SyncClient::spawn(channel, &config());
        client.enable().await.unwrap();

        let waiter = {
            let client = client.clone();
            tokio::spawn(async move { client.next_downbeat(Duration::from_secs(5)).await })
        };
        tokio::task::yield_now().await;
        client.disable().await.unwrap();
        assert_eq!(waiter.await.unwrap(), Err(Error::Cancelled("downbeat")));
    }
}
