//! Realtime connection control.
//!
//! The controller opens exactly one socket per active meeting session and
//! tears it down on the session's end edge. Outbound messages queue while
//! the socket is not open and flush FIFO on open, re-stamped to the current
//! session. Unexpected closes reconnect with exponential backoff as long as
//! the session is still active; deliberate closes (session end, credential
//! rotation) bump a connection epoch so their close events are never
//! mistaken for failures.

use crate::config::RealtimeConfig;
use crate::detector::MeetingEvent;
use crate::error::{RealtimeError, Result};
use crate::transport::{RealtimeSocket, RealtimeTransport, SocketEvent};
use chrono::Utc;
use sidekick_client_core::{CredentialBundle, CredentialEvent};
use sidekick_proto::{InboundMessage, OutboundMessage, parse_inbound, session_id_or_sentinel};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use url::Url;

const CONTROLLER_EVENT_CAPACITY: usize = 256;

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Open,
    Reconnecting,
}

/// Notification surfaced to the UI layer.
#[derive(Debug, Clone)]
pub enum ControllerEvent {
    StateChanged(ConnectionState),
    Inbound(InboundMessage),
    SessionEnded { session_id: String },
}

/// Backoff delay for 1-based attempt `n`: `base * 2^(n-1)`.
pub fn reconnect_delay(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1).min(16)))
}

#[derive(Debug, Clone)]
struct ActiveSession {
    session_id: String,
    title: Option<String>,
}

struct ControllerInner {
    state: ConnectionState,
    session: Option<ActiveSession>,
    access_token: Option<String>,
    subject_id: Option<String>,
    /// Set on `ReauthenticationRequired`; no dialing until a bundle appears.
    locked_out: bool,
    queue: VecDeque<OutboundMessage>,
    socket: Option<Arc<dyn RealtimeSocket>>,
    attempt: u32,
    /// Bumped on every deliberate close or fresh dial; socket events from an
    /// older epoch are stale and ignored.
    epoch: u64,
    backoff_timer: Option<JoinHandle<()>>,
    pump_task: Option<JoinHandle<()>>,
}

pub struct ConnectionController {
    endpoint: Url,
    config: RealtimeConfig,
    transport: Arc<dyn RealtimeTransport>,
    inner: Mutex<ControllerInner>,
    events_tx: broadcast::Sender<ControllerEvent>,
}

impl ConnectionController {
    pub fn new(
        endpoint: &str,
        transport: Arc<dyn RealtimeTransport>,
        config: RealtimeConfig,
    ) -> Result<Arc<Self>> {
        let endpoint = Url::parse(endpoint)?;
        if endpoint.scheme() != "ws" && endpoint.scheme() != "wss" {
            return Err(RealtimeError::InvalidUrl(format!(
                "URL must use ws:// or wss:// scheme, got: {}",
                endpoint.scheme()
            )));
        }

        let (events_tx, _) = broadcast::channel(CONTROLLER_EVENT_CAPACITY);
        Ok(Arc::new(Self {
            endpoint,
            config,
            transport,
            inner: Mutex::new(ControllerInner {
                state: ConnectionState::Idle,
                session: None,
                access_token: None,
                subject_id: None,
                locked_out: false,
                queue: VecDeque::new(),
                socket: None,
                attempt: 0,
                epoch: 0,
                backoff_timer: None,
                pump_task: None,
            }),
            events_tx,
        }))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ControllerEvent> {
        self.events_tx.subscribe()
    }

    pub async fn state(&self) -> ConnectionState {
        self.inner.lock().await.state
    }

    pub async fn reconnect_attempt(&self) -> u32 {
        self.inner.lock().await.attempt
    }

    pub async fn queue_len(&self) -> usize {
        self.inner.lock().await.queue.len()
    }

    pub async fn active_session_id(&self) -> Option<String> {
        self.inner
            .lock()
            .await
            .session
            .as_ref()
            .map(|session| session.session_id.clone())
    }

    /// Seed credentials from a store snapshot.
    pub async fn set_credentials(&self, access_token: Option<String>, subject_id: Option<String>) {
        let mut inner = self.inner.lock().await;
        inner.access_token = access_token;
        inner.subject_id = subject_id;
    }

    /// A meeting session began; open the socket for it.
    pub async fn handle_meeting_started(self: &Arc<Self>, session_id: String, title: Option<String>) {
        {
            let mut inner = self.inner.lock().await;
            inner.session = Some(ActiveSession { session_id, title });
            inner.attempt = 0;
        }
        self.connect().await;
    }

    /// The session ended: best-effort session-end notification (only if the
    /// socket is open; never queued), then force-close and go idle.
    pub async fn handle_meeting_ended(self: &Arc<Self>, session_id: &str) {
        let (socket, was_open, ended_id, state_changed) = {
            let mut inner = self.inner.lock().await;
            let Some(active) = inner.session.take() else {
                debug!("meeting end without an active session ignored");
                return;
            };
            if active.session_id != session_id {
                debug!(session_id, "stale meeting end ignored");
                inner.session = Some(active);
                return;
            }

            inner.epoch += 1;
            if let Some(timer) = inner.backoff_timer.take() {
                timer.abort();
            }
            if let Some(pump) = inner.pump_task.take() {
                pump.abort();
            }
            let was_open = inner.state == ConnectionState::Open;
            let state_changed = inner.state != ConnectionState::Idle;
            inner.state = ConnectionState::Idle;
            inner.attempt = 0;
            (inner.socket.take(), was_open, active.session_id, state_changed)
        };

        if let Some(socket) = socket {
            if was_open {
                let message =
                    OutboundMessage::session_end(ended_id.clone(), Utc::now().timestamp_millis());
                match message.encode() {
                    Ok(text) => {
                        if let Err(error) = socket.send_text(text).await {
                            debug!("session-end notification dropped: {error}");
                        }
                    }
                    Err(error) => debug!("session-end encode failed: {error}"),
                }
            }
            socket.close().await;
        }

        if state_changed {
            self.emit(ControllerEvent::StateChanged(ConnectionState::Idle));
        }
        self.emit(ControllerEvent::SessionEnded { session_id: ended_id });
    }

    /// A refresh produced a new access token. A socket dialed with the old
    /// token is not left running against a soon-to-be-invalid credential.
    pub async fn handle_credentials_refreshed(self: &Arc<Self>, access_token: String) {
        let reconnect = {
            let mut inner = self.inner.lock().await;
            inner.access_token = Some(access_token);
            inner.locked_out = false;
            inner.state == ConnectionState::Open
        };
        if reconnect {
            self.connect().await;
        }
    }

    /// Credentials are gone for good until a new bundle appears; stop dialing.
    pub async fn handle_reauthentication_required(&self) {
        let went_idle = {
            let mut inner = self.inner.lock().await;
            inner.locked_out = true;
            inner.access_token = None;
            if let Some(timer) = inner.backoff_timer.take() {
                timer.abort();
            }
            if matches!(
                inner.state,
                ConnectionState::Connecting | ConnectionState::Reconnecting
            ) {
                inner.state = ConnectionState::Idle;
                true
            } else {
                false
            }
        };
        if went_idle {
            self.emit(ControllerEvent::StateChanged(ConnectionState::Idle));
        }
    }

    /// A fresh bundle appeared (login or cross-context update).
    pub async fn handle_bundle_installed(self: &Arc<Self>, bundle: &CredentialBundle) {
        let reconnect = {
            let mut inner = self.inner.lock().await;
            inner.access_token = Some(bundle.access_token.clone());
            inner.subject_id = bundle.subject_id.clone();
            let was_locked = inner.locked_out;
            inner.locked_out = false;
            was_locked && inner.session.is_some()
        };
        if reconnect {
            self.connect().await;
        }
    }

    pub async fn handle_bundle_cleared(&self) {
        let mut inner = self.inner.lock().await;
        inner.access_token = None;
        inner.subject_id = None;
    }

    /// Send now if open, otherwise enqueue for the next flush.
    pub async fn send(self: &Arc<Self>, message: OutboundMessage) {
        self.send_now(message).await;
    }

    /// Silent no-op (not enqueued) when no session is active; for messages
    /// that carry no information outside a meeting.
    pub async fn send_if_active_session(self: &Arc<Self>, message: OutboundMessage) {
        let stamped = {
            let inner = self.inner.lock().await;
            let Some(session) = inner.session.as_ref() else {
                debug!("dropping {}: no active meeting session", message.kind());
                return;
            };
            let mut message = message;
            message.set_session_id(session.session_id.clone());
            message
        };
        self.send_now(stamped).await;
    }

    /// Forward one transcript line from the scraping layer.
    pub async fn send_transcript(
        self: &Arc<Self>,
        transcript_id: impl Into<String>,
        text: impl Into<String>,
        captured_at: i64,
    ) {
        let message = OutboundMessage::transcript_text(
            sidekick_proto::NO_SESSION_SENTINEL,
            transcript_id,
            text,
            captured_at,
            Utc::now().timestamp_millis(),
        );
        self.send_if_active_session(message).await;
    }

    /// Dial the realtime endpoint for the current session. Rejected (logged,
    /// not retried) without an active session; deferred without credentials.
    pub async fn connect(self: &Arc<Self>) {
        let (old_socket, url, epoch) = {
            let mut inner = self.inner.lock().await;
            if inner.locked_out {
                debug!("connect suppressed: reauthentication required");
                return;
            }
            let Some(session) = inner.session.clone() else {
                warn!(
                    "{}",
                    RealtimeError::ConnectNotPermitted("no active meeting session")
                );
                return;
            };
            let Some(access_token) = inner.access_token.clone() else {
                debug!("connect deferred: no access token");
                return;
            };

            // a fresh dial always carries current parameters; any live
            // socket with a stale query string goes away first
            let old_socket = inner.socket.take();
            if let Some(pump) = inner.pump_task.take() {
                pump.abort();
            }
            inner.epoch += 1;
            inner.state = ConnectionState::Connecting;
            let url = build_target_url(
                &self.endpoint,
                &access_token,
                inner.subject_id.as_deref(),
                Some(&session),
            );
            (old_socket, url, inner.epoch)
        };

        if let Some(socket) = old_socket {
            socket.close().await;
        }
        self.emit(ControllerEvent::StateChanged(ConnectionState::Connecting));

        match self.transport.connect(&url).await {
            Ok((socket, events)) => self.finish_connect(epoch, socket, events).await,
            Err(error) => {
                warn!("realtime connect failed: {error}");
                self.handle_socket_closed(epoch).await;
            }
        }
    }

    async fn finish_connect(
        self: &Arc<Self>,
        epoch: u64,
        socket: Arc<dyn RealtimeSocket>,
        mut events: mpsc::UnboundedReceiver<SocketEvent>,
    ) {
        let to_send = {
            let mut inner = self.inner.lock().await;
            let stale = inner.epoch != epoch || inner.session.is_none();
            if stale {
                // the session ended (or a newer dial superseded this one)
                // while the handshake was in flight
                drop(inner);
                socket.close().await;
                return;
            }

            inner.state = ConnectionState::Open;
            inner.attempt = 0;
            inner.socket = Some(Arc::clone(&socket));

            let session = inner.session.clone();
            let mut to_send = Vec::with_capacity(inner.queue.len() + 1);
            if let Some(session) = &session {
                to_send.push(OutboundMessage::session_start(
                    session.session_id.clone(),
                    session.title.clone(),
                    Utc::now().timestamp_millis(),
                ));
                // flush FIFO, re-stamped to the session that is live now
                while let Some(mut message) = inner.queue.pop_front() {
                    message.set_session_id(session.session_id.clone());
                    to_send.push(message);
                }
            }

            let controller = Arc::clone(self);
            inner.pump_task = Some(tokio::spawn(async move {
                while let Some(event) = events.recv().await {
                    match event {
                        SocketEvent::Message(text) => controller.handle_inbound_text(&text),
                        SocketEvent::Closed => {
                            controller.handle_socket_closed(epoch).await;
                            break;
                        }
                    }
                }
            }));
            to_send
        };

        self.emit(ControllerEvent::StateChanged(ConnectionState::Open));
        for message in to_send {
            if !self.send_now(message).await {
                break;
            }
        }
    }

    // Returns an explicitly-boxed `Send` future rather than using `async fn`:
    // this routine spawns `connect`, which is itself reachable back here (via
    // `finish_connect`'s pump task), forming a recursive cycle that defeats
    // `Send` auto-trait inference on an opaque return type. A declared `Send`
    // boxed future gives that cycle a terminating node.
    fn handle_socket_closed(
        self: &Arc<Self>,
        epoch: u64,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
        let new_state = {
            let mut inner = self.inner.lock().await;
            if inner.epoch != epoch {
                // deliberate close; already handled by whoever bumped the epoch
                return;
            }
            inner.socket = None;
            inner.pump_task = None;

            if inner.session.is_none() {
                inner.state = ConnectionState::Idle;
                ConnectionState::Idle
            } else {
                inner.attempt += 1;
                if inner.attempt > self.config.max_reconnect_attempts {
                    warn!(
                        attempts = inner.attempt - 1,
                        "reconnect attempts exhausted; idle until the next session edge"
                    );
                    inner.state = ConnectionState::Idle;
                    ConnectionState::Idle
                } else {
                    let delay = reconnect_delay(self.config.backoff_base, inner.attempt);
                    debug!(attempt = inner.attempt, ?delay, "scheduling reconnect");
                    inner.state = ConnectionState::Reconnecting;

                    let controller = Arc::clone(self);
                    let timer = tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        // dial on its own task so replacing the timer slot
                        // never cancels a dial already underway
                        let dialer = Arc::clone(&controller);
                        tokio::spawn(async move {
                            dialer.connect().await;
                        });
                    });
                    if let Some(previous) = inner.backoff_timer.replace(timer) {
                        previous.abort();
                    }
                    ConnectionState::Reconnecting
                }
            }
        };
        self.emit(ControllerEvent::StateChanged(new_state));
        })
    }

    fn handle_inbound_text(&self, text: &str) {
        match parse_inbound(text) {
            Ok(Some(message)) => self.emit(ControllerEvent::Inbound(message)),
            Ok(None) => debug!("unrecognized inbound message kind dropped"),
            Err(error) => warn!("malformed inbound message dropped: {error}"),
        }
    }

    async fn send_now(self: &Arc<Self>, message: OutboundMessage) -> bool {
        let socket = {
            let mut inner = self.inner.lock().await;
            match (inner.state, inner.socket.clone()) {
                (ConnectionState::Open, Some(socket)) => socket,
                _ => {
                    inner.queue.push_back(message);
                    return false;
                }
            }
        };

        let text = match message.encode() {
            Ok(text) => text,
            Err(error) => {
                warn!("outbound encode failed: {error}");
                return true;
            }
        };
        if let Err(error) = socket.send_text(text).await {
            warn!("outbound send failed, requeueing: {error}");
            self.inner.lock().await.queue.push_front(message);
            return false;
        }
        true
    }

    /// Wire detector edges, credential events, and store updates into the
    /// controller for the lifetime of the context.
    pub fn run_event_loop(
        self: &Arc<Self>,
        mut meetings: broadcast::Receiver<MeetingEvent>,
        mut credentials: broadcast::Receiver<CredentialEvent>,
        mut bundles: watch::Receiver<Option<CredentialBundle>>,
    ) -> JoinHandle<()> {
        let controller = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    meeting = meetings.recv() => match meeting {
                        Ok(MeetingEvent::Started { session_id, title }) => {
                            controller.handle_meeting_started(session_id, title).await;
                        }
                        Ok(MeetingEvent::Ended { session_id }) => {
                            controller.handle_meeting_ended(&session_id).await;
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!("meeting events lagged by {skipped}");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    credential = credentials.recv() => match credential {
                        Ok(CredentialEvent::Refreshed { access_token }) => {
                            controller.handle_credentials_refreshed(access_token).await;
                        }
                        Ok(CredentialEvent::ReauthenticationRequired) => {
                            controller.handle_reauthentication_required().await;
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!("credential events lagged by {skipped}");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    changed = bundles.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let snapshot = bundles.borrow_and_update().clone();
                        match snapshot {
                            Some(bundle) => controller.handle_bundle_installed(&bundle).await,
                            None => controller.handle_bundle_cleared().await,
                        }
                    }
                }
            }
        })
    }

    fn emit(&self, event: ControllerEvent) {
        if self.events_tx.send(event).is_err() {
            debug!("controller event dropped: no subscribers");
        }
    }
}

fn build_target_url(
    endpoint: &Url,
    access_token: &str,
    subject_id: Option<&str>,
    session: Option<&ActiveSession>,
) -> Url {
    let mut url = endpoint.clone();
    {
        let mut query = url.query_pairs_mut();
        query.append_pair("accessToken", access_token);
        query.append_pair("subjectId", subject_id.unwrap_or_default());
        query.append_pair(
            "sessionId",
            session_id_or_sentinel(session.map(|session| session.session_id.as_str())),
        );
        if let Some(title) = session.and_then(|session| session.title.as_deref()) {
            query.append_pair("title", title);
        }
    }
    url
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::sync::broadcast::error::TryRecvError;

    struct MockSocket {
        sent: StdMutex<Vec<String>>,
        closed: AtomicBool,
        events_tx: mpsc::UnboundedSender<SocketEvent>,
    }

    impl MockSocket {
        fn sent(&self) -> Vec<String> {
            self.sent
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .clone()
        }

        fn is_closed(&self) -> bool {
            self.closed.load(Ordering::Relaxed)
        }

        fn trigger_close(&self) {
            let _ = self.events_tx.send(SocketEvent::Closed);
        }

        fn push_inbound(&self, text: &str) {
            let _ = self.events_tx.send(SocketEvent::Message(text.to_string()));
        }
    }

    #[async_trait::async_trait]
    impl RealtimeSocket for MockSocket {
        async fn send_text(&self, text: String) -> Result<()> {
            if self.is_closed() {
                return Err(RealtimeError::NotConnected);
            }
            self.sent
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .push(text);
            Ok(())
        }

        async fn close(&self) {
            self.closed.store(true, Ordering::Relaxed);
        }
    }

    struct MockTransport {
        dialed_urls: StdMutex<Vec<Url>>,
        sockets: StdMutex<Vec<Arc<MockSocket>>>,
        refuse: AtomicBool,
        dials: AtomicUsize,
        dial_delay_ms: AtomicUsize,
    }

    impl MockTransport {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                dialed_urls: StdMutex::new(Vec::new()),
                sockets: StdMutex::new(Vec::new()),
                refuse: AtomicBool::new(false),
                dials: AtomicUsize::new(0),
                dial_delay_ms: AtomicUsize::new(0),
            })
        }

        fn dial_count(&self) -> usize {
            self.dials.load(Ordering::Relaxed)
        }

        fn socket(&self, index: usize) -> Arc<MockSocket> {
            let sockets = self
                .sockets
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            Arc::clone(&sockets[index])
        }

        fn dialed_url(&self, index: usize) -> Url {
            let urls = self
                .dialed_urls
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            urls[index].clone()
        }
    }

    #[async_trait::async_trait]
    impl RealtimeTransport for MockTransport {
        async fn connect(
            &self,
            url: &Url,
        ) -> Result<(Arc<dyn RealtimeSocket>, mpsc::UnboundedReceiver<SocketEvent>)> {
            self.dials.fetch_add(1, Ordering::Relaxed);
            self.dialed_urls
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .push(url.clone());
            let delay_ms = self.dial_delay_ms.load(Ordering::Relaxed);
            if delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(delay_ms as u64)).await;
            }
            if self.refuse.load(Ordering::Relaxed) {
                return Err(RealtimeError::WebSocket("connection refused".to_string()));
            }

            let (events_tx, events_rx) = mpsc::unbounded_channel();
            let socket = Arc::new(MockSocket {
                sent: StdMutex::new(Vec::new()),
                closed: AtomicBool::new(false),
                events_tx,
            });
            self.sockets
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .push(Arc::clone(&socket));
            Ok((socket, events_rx))
        }
    }

    fn controller_with(transport: Arc<MockTransport>) -> Arc<ConnectionController> {
        ConnectionController::new(
            "wss://realtime.example.com/ws",
            transport,
            RealtimeConfig::default(),
        )
        .expect("controller")
    }

    async fn authed_controller(transport: Arc<MockTransport>) -> Arc<ConnectionController> {
        let controller = controller_with(transport);
        controller
            .set_credentials(Some("token-1".to_string()), Some("subject-1".to_string()))
            .await;
        controller
    }

    async fn settle() {
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
    }

    fn message_types(sent: &[String]) -> Vec<String> {
        sent.iter()
            .map(|text| {
                serde_json::from_str::<serde_json::Value>(text)
                    .ok()
                    .and_then(|value| value.get("type").and_then(|kind| kind.as_str()).map(str::to_string))
                    .unwrap_or_default()
            })
            .collect()
    }

    #[tokio::test]
    async fn connect_without_session_is_rejected() {
        let transport = MockTransport::new();
        let controller = authed_controller(Arc::clone(&transport)).await;

        controller.connect().await;

        assert_eq!(transport.dial_count(), 0);
        assert_eq!(controller.state().await, ConnectionState::Idle);
    }

    #[tokio::test]
    async fn meeting_start_opens_and_announces_the_session() {
        let transport = MockTransport::new();
        let controller = authed_controller(Arc::clone(&transport)).await;

        controller
            .handle_meeting_started("m1".to_string(), Some("Standup".to_string()))
            .await;

        assert_eq!(controller.state().await, ConnectionState::Open);
        let url = transport.dialed_url(0);
        let query: Vec<(String, String)> = url
            .query_pairs()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        assert!(query.contains(&("accessToken".to_string(), "token-1".to_string())));
        assert!(query.contains(&("subjectId".to_string(), "subject-1".to_string())));
        assert!(query.contains(&("sessionId".to_string(), "m1".to_string())));
        assert!(query.contains(&("title".to_string(), "Standup".to_string())));

        let sent = transport.socket(0).sent();
        assert_eq!(message_types(&sent), vec!["SESSION_START"]);
        let start: serde_json::Value = serde_json::from_str(&sent[0]).expect("json");
        assert_eq!(start["sessionId"], "m1");
    }

    #[tokio::test]
    async fn queued_messages_flush_fifo_with_current_session_id() {
        let transport = MockTransport::new();
        let controller = authed_controller(Arc::clone(&transport)).await;

        // enqueued while idle, stamped with a session that will be stale
        controller
            .send(OutboundMessage::custom("a-old", json!({"n": 1}), 10))
            .await;
        controller
            .send(OutboundMessage::custom("a-old", json!({"n": 2}), 11))
            .await;
        assert_eq!(controller.queue_len().await, 2);

        controller.handle_meeting_started("b-new".to_string(), None).await;

        let sent = transport.socket(0).sent();
        assert_eq!(
            message_types(&sent),
            vec!["SESSION_START", "CUSTOM_MESSAGE", "CUSTOM_MESSAGE"]
        );
        for text in &sent[1..] {
            let value: serde_json::Value = serde_json::from_str(text).expect("json");
            assert_eq!(value["sessionId"], "b-new", "stale session id leaked: {text}");
        }
        let first: serde_json::Value = serde_json::from_str(&sent[1]).expect("json");
        assert_eq!(first["payload"]["n"], 1, "flush order not FIFO");
        assert_eq!(controller.queue_len().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn messages_sent_while_connecting_flush_on_open() {
        let transport = MockTransport::new();
        transport.dial_delay_ms.store(500, Ordering::Relaxed);
        let controller = authed_controller(Arc::clone(&transport)).await;

        let dialing = {
            let controller = Arc::clone(&controller);
            tokio::spawn(async move {
                controller.handle_meeting_started("m1".to_string(), None).await;
            })
        };
        settle().await;
        assert_eq!(controller.state().await, ConnectionState::Connecting);

        controller
            .send(OutboundMessage::custom("m1", json!({"x": 1}), 10))
            .await;
        assert_eq!(controller.queue_len().await, 1);

        dialing.await.expect("join");
        assert_eq!(controller.state().await, ConnectionState::Open);

        let sent = transport.socket(0).sent();
        assert_eq!(message_types(&sent), vec!["SESSION_START", "CUSTOM_MESSAGE"]);
        let flushed: serde_json::Value = serde_json::from_str(&sent[1]).expect("json");
        assert_eq!(flushed["sessionId"], "m1");
    }

    #[tokio::test]
    async fn send_if_active_session_drops_without_session() {
        let transport = MockTransport::new();
        let controller = authed_controller(Arc::clone(&transport)).await;

        controller
            .send_transcript("t-1", "hello", 5)
            .await;

        assert_eq!(controller.queue_len().await, 0);
        assert_eq!(transport.dial_count(), 0);
    }

    #[tokio::test]
    async fn transcripts_are_stamped_with_the_active_session() {
        let transport = MockTransport::new();
        let controller = authed_controller(Arc::clone(&transport)).await;

        controller.handle_meeting_started("m1".to_string(), None).await;
        controller.send_transcript("t-1", "hello", 5).await;

        let sent = transport.socket(0).sent();
        let transcript: serde_json::Value = serde_json::from_str(&sent[1]).expect("json");
        assert_eq!(transcript["type"], "TRANSCRIPT_TEXT");
        assert_eq!(transcript["sessionId"], "m1");
        assert_eq!(transcript["transcriptId"], "t-1");
    }

    #[tokio::test(start_paused = true)]
    async fn unexpected_close_reconnects_with_exponential_backoff() {
        let transport = MockTransport::new();
        let controller = authed_controller(Arc::clone(&transport)).await;

        controller.handle_meeting_started("m1".to_string(), None).await;
        assert_eq!(controller.state().await, ConnectionState::Open);

        transport.socket(0).trigger_close();
        settle().await;
        assert_eq!(controller.state().await, ConnectionState::Reconnecting);
        assert_eq!(controller.reconnect_attempt().await, 1);

        // first delay is exactly base: not reconnected just before it
        tokio::time::sleep(Duration::from_millis(900)).await;
        assert_eq!(transport.dial_count(), 1);
        tokio::time::sleep(Duration::from_millis(200)).await;
        settle().await;
        assert_eq!(transport.dial_count(), 2);
        assert_eq!(controller.state().await, ConnectionState::Open);
        // counter resets on every successful open
        assert_eq!(controller.reconnect_attempt().await, 0);

        // a second flap starts over at attempt 1
        transport.socket(1).trigger_close();
        settle().await;
        assert_eq!(controller.reconnect_attempt().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_redial_doubles_the_delay() {
        let transport = MockTransport::new();
        let controller = authed_controller(Arc::clone(&transport)).await;

        controller.handle_meeting_started("m1".to_string(), None).await;
        transport.refuse.store(true, Ordering::Relaxed);
        transport.socket(0).trigger_close();
        settle().await;
        assert_eq!(controller.reconnect_attempt().await, 1);

        // attempt 1 fires after base, fails, schedules attempt 2
        tokio::time::sleep(Duration::from_millis(1_100)).await;
        settle().await;
        assert_eq!(transport.dial_count(), 2);
        assert_eq!(controller.reconnect_attempt().await, 2);
        assert_eq!(controller.state().await, ConnectionState::Reconnecting);

        // attempt 2 waits 2x base: nothing at +1s, redial by +2s
        tokio::time::sleep(Duration::from_millis(1_000)).await;
        settle().await;
        assert_eq!(transport.dial_count(), 2);
        tokio::time::sleep(Duration::from_millis(1_100)).await;
        settle().await;
        assert_eq!(transport.dial_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_attempts_are_capped() {
        let transport = MockTransport::new();
        let controller = authed_controller(Arc::clone(&transport)).await;

        controller.handle_meeting_started("m1".to_string(), None).await;
        transport.refuse.store(true, Ordering::Relaxed);
        transport.socket(0).trigger_close();
        settle().await;

        // let every backoff window elapse; 8 redials then nothing
        tokio::time::sleep(Duration::from_secs(1 << 10)).await;
        settle().await;
        assert_eq!(transport.dial_count(), 1 + 8);
        assert_eq!(controller.state().await, ConnectionState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn meeting_end_while_reconnecting_goes_straight_to_idle() {
        let transport = MockTransport::new();
        let controller = authed_controller(Arc::clone(&transport)).await;
        let mut events = controller.subscribe();

        controller.handle_meeting_started("m1".to_string(), None).await;
        let socket = transport.socket(0);
        socket.trigger_close();
        settle().await;
        assert_eq!(controller.state().await, ConnectionState::Reconnecting);
        let dials_before = transport.dial_count();

        controller.handle_meeting_ended("m1").await;
        assert_eq!(controller.state().await, ConnectionState::Idle);

        // no further attempts, and no session-end for a session that never
        // reached open again
        tokio::time::sleep(Duration::from_secs(600)).await;
        settle().await;
        assert_eq!(transport.dial_count(), dials_before);
        assert!(!message_types(&socket.sent()).contains(&"SESSION_END".to_string()));

        let mut saw_session_ended = false;
        while let Ok(event) = events.try_recv() {
            if let ControllerEvent::SessionEnded { session_id } = event {
                assert_eq!(session_id, "m1");
                saw_session_ended = true;
            }
        }
        assert!(saw_session_ended);
    }

    #[tokio::test]
    async fn meeting_end_while_open_sends_best_effort_session_end() {
        let transport = MockTransport::new();
        let controller = authed_controller(Arc::clone(&transport)).await;

        controller.handle_meeting_started("m1".to_string(), None).await;
        controller.handle_meeting_ended("m1").await;

        let socket = transport.socket(0);
        let types = message_types(&socket.sent());
        assert_eq!(types.last().map(String::as_str), Some("SESSION_END"));
        assert!(socket.is_closed());
        assert_eq!(controller.state().await, ConnectionState::Idle);
        assert_eq!(controller.active_session_id().await, None);
    }

    #[tokio::test]
    async fn refreshed_credentials_redial_while_open() {
        let transport = MockTransport::new();
        let controller = authed_controller(Arc::clone(&transport)).await;

        controller.handle_meeting_started("m1".to_string(), None).await;
        controller
            .handle_credentials_refreshed("token-2".to_string())
            .await;
        settle().await;

        assert_eq!(transport.dial_count(), 2);
        assert!(transport.socket(0).is_closed());
        assert_eq!(controller.state().await, ConnectionState::Open);

        let fresh: Vec<(String, String)> = transport
            .dialed_url(1)
            .query_pairs()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        assert!(fresh.contains(&("accessToken".to_string(), "token-2".to_string())));
    }

    #[tokio::test]
    async fn refreshed_credentials_do_not_dial_while_idle() {
        let transport = MockTransport::new();
        let controller = authed_controller(Arc::clone(&transport)).await;

        controller
            .handle_credentials_refreshed("token-2".to_string())
            .await;

        assert_eq!(transport.dial_count(), 0);
        assert_eq!(controller.state().await, ConnectionState::Idle);
    }

    #[tokio::test]
    async fn reauthentication_lockout_blocks_dialing_until_new_bundle() {
        let transport = MockTransport::new();
        let controller = authed_controller(Arc::clone(&transport)).await;

        controller.handle_reauthentication_required().await;
        controller.handle_meeting_started("m1".to_string(), None).await;
        assert_eq!(transport.dial_count(), 0);
        assert_eq!(controller.state().await, ConnectionState::Idle);

        let bundle = CredentialBundle::new(
            "token-3",
            Some("refresh-1".to_string()),
            Some("subject-1".to_string()),
            Utc::now(),
        );
        controller.handle_bundle_installed(&bundle).await;

        assert_eq!(transport.dial_count(), 1);
        assert_eq!(controller.state().await, ConnectionState::Open);
        let url: Vec<(String, String)> = transport
            .dialed_url(0)
            .query_pairs()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        assert!(url.contains(&("accessToken".to_string(), "token-3".to_string())));
    }

    #[tokio::test]
    async fn inbound_messages_dispatch_by_kind() {
        let transport = MockTransport::new();
        let controller = authed_controller(Arc::clone(&transport)).await;
        let mut events = controller.subscribe();

        controller.handle_meeting_started("m1".to_string(), None).await;
        let socket = transport.socket(0);

        socket.push_inbound(
            &json!({
                "type": "CLASSIFICATION_RESULT",
                "transcriptId": "t-1",
                "aiAnswer": "answer",
                "classification": "question",
                "confidence": 0.9,
                "suggestions": [],
            })
            .to_string(),
        );
        socket.push_inbound(r#"{"type":"SOMETHING_NEW","x":1}"#);
        socket.push_inbound("not json at all");
        settle().await;

        let mut inbound = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let ControllerEvent::Inbound(message) = event {
                inbound.push(message);
            }
        }
        // unrecognized and malformed frames are dropped, never fatal
        assert_eq!(inbound.len(), 1);
        assert!(matches!(
            inbound[0],
            InboundMessage::ClassificationResult { .. }
        ));
        assert_eq!(controller.state().await, ConnectionState::Open);
    }

    #[test]
    fn backoff_delays_double_per_attempt() {
        let base = Duration::from_secs(1);
        assert_eq!(reconnect_delay(base, 1), Duration::from_secs(1));
        assert_eq!(reconnect_delay(base, 2), Duration::from_secs(2));
        assert_eq!(reconnect_delay(base, 3), Duration::from_secs(4));
        assert_eq!(reconnect_delay(base, 5), Duration::from_secs(16));
    }

    #[test]
    fn target_url_uses_sentinel_without_a_session() {
        let endpoint = Url::parse("wss://realtime.example.com/ws").expect("url");
        let url = build_target_url(&endpoint, "token", None, None);
        let query: Vec<(String, String)> = url
            .query_pairs()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        assert!(query.contains(&("sessionId".to_string(), "none".to_string())));
        assert!(query.contains(&("subjectId".to_string(), String::new())));
        assert!(!query.iter().any(|(key, _)| key == "title"));
    }

    #[tokio::test]
    async fn rejected_endpoint_scheme_fails_construction() {
        let result = ConnectionController::new(
            "https://realtime.example.com/ws",
            MockTransport::new(),
            RealtimeConfig::default(),
        );
        assert!(matches!(result, Err(RealtimeError::InvalidUrl(_))));
    }

    #[tokio::test]
    async fn event_loop_bridges_detector_and_credential_events() {
        let transport = MockTransport::new();
        let controller = authed_controller(Arc::clone(&transport)).await;

        let (meeting_tx, meeting_rx) = broadcast::channel(8);
        let (credential_tx, credential_rx) = broadcast::channel(8);
        let (_bundle_tx, bundle_rx) = watch::channel(None);
        let handle = controller.run_event_loop(meeting_rx, credential_rx, bundle_rx);

        meeting_tx
            .send(MeetingEvent::Started {
                session_id: "m1".to_string(),
                title: None,
            })
            .expect("send");
        settle().await;
        assert_eq!(controller.state().await, ConnectionState::Open);

        credential_tx
            .send(CredentialEvent::Refreshed {
                access_token: "token-2".to_string(),
            })
            .expect("send");
        settle().await;
        assert_eq!(transport.dial_count(), 2);

        meeting_tx
            .send(MeetingEvent::Ended {
                session_id: "m1".to_string(),
            })
            .expect("send");
        settle().await;
        assert_eq!(controller.state().await, ConnectionState::Idle);

        handle.abort();
    }

    #[tokio::test]
    async fn stale_close_after_meeting_end_does_not_reconnect() {
        let transport = MockTransport::new();
        let controller = authed_controller(Arc::clone(&transport)).await;
        let mut events = controller.subscribe();

        controller.handle_meeting_started("m1".to_string(), None).await;
        let socket = transport.socket(0);
        controller.handle_meeting_ended("m1").await;

        // the old socket's close event arrives late; its epoch is stale
        socket.trigger_close();
        settle().await;
        assert_eq!(controller.state().await, ConnectionState::Idle);
        assert_eq!(transport.dial_count(), 1);

        while let Ok(event) = events.try_recv() {
            assert!(
                !matches!(event, ControllerEvent::StateChanged(ConnectionState::Reconnecting)),
                "stale close triggered a reconnect"
            );
        }
        drop(events);
        assert!(matches!(
            controller.subscribe().try_recv(),
            Err(TryRecvError::Empty)
        ));
    }
}
