//! Stream Connection - Persistent event stream with automatic reconnection
//!
//! One driver task owns the transport, the subscription set, and every state
//! transition, so callbacks and the reconnect timer never race. The handle
//! side is non-blocking: commands flow over an unbounded channel and state is
//! published through a watch channel.

use super::transport::{CloseReason, Frame, Transport, TransportStream, WsTransport};
use dripline_common::config::StreamConfig;
use dripline_common::types::{EventPayload, Subscription};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Clean close requested by the client
pub const CLOSE_NORMAL: u16 = 1000;
/// Authentication token missing from the handshake
pub const CLOSE_AUTH_MISSING: u16 = 4001;
/// Authentication token invalid or expired
pub const CLOSE_AUTH_INVALID: u16 = 4002;
/// Server-side session not found
pub const CLOSE_SESSION_NOT_FOUND: u16 = 4003;
/// Internal server error (reported, but retried)
pub const CLOSE_INTERNAL_ERROR: u16 = 4500;

/// Stream failure surfaced to consumers
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StreamError {
    #[error("Authentication token missing")]
    AuthMissing,

    #[error("Authentication token invalid or expired")]
    AuthInvalid,

    #[error("Session not found")]
    SessionNotFound,

    #[error("Internal server error")]
    ServerError,

    #[error("Connection closed unexpectedly (code {0})")]
    UnexpectedClose(u16),

    #[error("Connection lost")]
    ConnectionLost,

    #[error("Transport error: {0}")]
    Transport(String),
}

impl StreamError {
    /// Fatal failures are retained and never retried
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            StreamError::AuthMissing | StreamError::AuthInvalid | StreamError::SessionNotFound
        )
    }
}

/// Connection lifecycle state.
///
/// Reconnection re-enters `Connecting`; there is no separate state for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Connecting,
    Open,
    Closed,
}

/// Receives inbound events and connection state changes.
///
/// Both callbacks are invoked from the driver task, in transport order.
pub trait EventConsumer: Send + Sync + 'static {
    fn on_event(&self, event: EventPayload);

    fn on_state_change(&self, _state: ConnectionState) {}
}

enum Command {
    Subscribe(Subscription),
    Unsubscribe(Subscription),
    Disconnect,
}

#[derive(Serialize)]
struct ActionMessage<'a> {
    action: &'a str,
    #[serde(flatten)]
    subscription: &'a Subscription,
}

/// Handle to the live event stream.
///
/// Dropping the handle disconnects the driver.
pub struct StreamConnection {
    commands: mpsc::UnboundedSender<Command>,
    state_rx: watch::Receiver<ConnectionState>,
    last_error: Arc<Mutex<Option<StreamError>>>,
}

impl StreamConnection {
    /// Open the stream over WebSocket and spawn the driver task
    pub fn connect(config: StreamConfig, consumer: Arc<dyn EventConsumer>) -> Self {
        Self::connect_with_transport(config, consumer, Arc::new(WsTransport))
    }

    /// Open the stream over a caller-supplied transport
    pub fn connect_with_transport(
        config: StreamConfig,
        consumer: Arc<dyn EventConsumer>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        let last_error = Arc::new(Mutex::new(None));

        let driver = Driver {
            config,
            transport,
            consumer,
            commands: command_rx,
            subscriptions: HashSet::new(),
            state_tx,
            last_error: Arc::clone(&last_error),
        };
        tokio::spawn(driver.run());

        Self {
            commands: command_tx,
            state_rx,
            last_error,
        }
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// Wait until the connection reaches the given state
    pub async fn wait_for_state(&self, target: ConnectionState) {
        let mut rx = self.state_rx.clone();
        loop {
            if *rx.borrow_and_update() == target {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Most recent transport error, if any
    pub fn last_error(&self) -> Option<StreamError> {
        self.last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Track a subscription and send it when open.
    ///
    /// Set semantics: duplicate subscriptions are no-ops. While not open the
    /// subscription is queued and replayed on the next successful open.
    pub fn subscribe(&self, subscription: Subscription) {
        let _ = self.commands.send(Command::Subscribe(subscription));
    }

    /// Stop tracking a subscription; an unsubscribe message is sent only
    /// when currently open
    pub fn unsubscribe(&self, subscription: Subscription) {
        let _ = self.commands.send(Command::Unsubscribe(subscription));
    }

    /// Close the connection and suppress any pending reconnect
    pub fn disconnect(&self) {
        let _ = self.commands.send(Command::Disconnect);
    }
}

enum Outcome {
    /// Client-initiated close (or handle dropped)
    Disconnected,
    /// Server closed cleanly
    Clean,
    /// Fatal failures stop the driver; everything else retries after the
    /// fixed delay
    Failed(StreamError),
}

struct Driver {
    config: StreamConfig,
    transport: Arc<dyn Transport>,
    consumer: Arc<dyn EventConsumer>,
    commands: mpsc::UnboundedReceiver<Command>,
    subscriptions: HashSet<Subscription>,
    state_tx: watch::Sender<ConnectionState>,
    last_error: Arc<Mutex<Option<StreamError>>>,
}

impl Driver {
    async fn run(mut self) {
        loop {
            self.set_state(ConnectionState::Connecting);

            let url = self.config.endpoint_url();
            match self.transport.open(&url).await {
                Ok(mut stream) => {
                    info!("Event stream connected");
                    self.set_error(None);
                    self.set_state(ConnectionState::Open);

                    let outcome = match self.replay_subscriptions(stream.as_mut()).await {
                        Ok(()) => self.drive(stream.as_mut()).await,
                        Err(e) => Outcome::Failed(e),
                    };

                    match outcome {
                        Outcome::Disconnected => {
                            let _ = stream.close().await;
                            self.set_state(ConnectionState::Closed);
                            return;
                        }
                        Outcome::Clean => {
                            info!("Event stream closed");
                            self.set_state(ConnectionState::Closed);
                            return;
                        }
                        Outcome::Failed(error) if error.is_fatal() => {
                            warn!("Event stream closed permanently: {}", error);
                            self.set_error(Some(error));
                            self.set_state(ConnectionState::Closed);
                            return;
                        }
                        Outcome::Failed(error) => {
                            warn!("Event stream lost: {}", error);
                            self.set_error(Some(error));
                        }
                    }
                }
                Err(e) => {
                    warn!("Event stream connect failed: {}", e);
                    self.set_error(Some(StreamError::Transport(e.to_string())));
                }
            }

            self.set_state(ConnectionState::Closed);
            if !self.wait_before_reconnect().await {
                return;
            }
        }
    }

    /// Serve commands and inbound frames until the session ends
    async fn drive(&mut self, stream: &mut dyn TransportStream) -> Outcome {
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Subscribe(subscription)) => {
                        if self.subscriptions.insert(subscription.clone()) {
                            if let Err(e) = send_action(stream, "subscribe", &subscription).await {
                                return Outcome::Failed(e);
                            }
                        }
                    }
                    Some(Command::Unsubscribe(subscription)) => {
                        if self.subscriptions.remove(&subscription) {
                            if let Err(e) = send_action(stream, "unsubscribe", &subscription).await {
                                return Outcome::Failed(e);
                            }
                        }
                    }
                    Some(Command::Disconnect) | None => return Outcome::Disconnected,
                },
                frame = stream.recv() => match frame {
                    Some(Frame::Text(text)) => self.dispatch(&text),
                    Some(Frame::Close(reason)) => return classify_close(reason),
                    None => return Outcome::Failed(StreamError::ConnectionLost),
                },
            }
        }
    }

    /// Re-send every tracked subscription, each exactly once
    async fn replay_subscriptions(
        &mut self,
        stream: &mut dyn TransportStream,
    ) -> Result<(), StreamError> {
        let subscriptions: Vec<Subscription> = self.subscriptions.iter().cloned().collect();
        for subscription in &subscriptions {
            send_action(stream, "subscribe", subscription).await?;
        }
        if !subscriptions.is_empty() {
            debug!("Replayed {} subscription(s)", subscriptions.len());
        }
        Ok(())
    }

    /// Deliver an inbound payload; malformed input is logged and dropped
    fn dispatch(&self, text: &str) {
        let value: serde_json::Value = match serde_json::from_str(text) {
            Ok(value) => value,
            Err(e) => {
                warn!("Dropping malformed event payload: {}", e);
                return;
            }
        };

        for event in EventPayload::parse_message(&value) {
            self.consumer.on_event(event);
        }
    }

    /// Wait the fixed reconnect delay, still applying subscription changes.
    ///
    /// Returns false when a disconnect arrives (or the handle is dropped), in
    /// which case the pending reconnect must not happen.
    async fn wait_before_reconnect(&mut self) -> bool {
        let delay = Duration::from_secs(self.config.reconnect_delay_secs);
        let deadline = Instant::now() + delay;
        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => return true,
                command = self.commands.recv() => match command {
                    Some(Command::Subscribe(subscription)) => {
                        self.subscriptions.insert(subscription);
                    }
                    Some(Command::Unsubscribe(subscription)) => {
                        self.subscriptions.remove(&subscription);
                    }
                    Some(Command::Disconnect) | None => return false,
                },
            }
        }
    }

    fn set_state(&self, state: ConnectionState) {
        let changed = *self.state_tx.borrow() != state;
        let _ = self.state_tx.send(state);
        if changed {
            self.consumer.on_state_change(state);
        }
    }

    fn set_error(&self, error: Option<StreamError>) {
        *self
            .last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = error;
    }
}

async fn send_action(
    stream: &mut dyn TransportStream,
    action: &str,
    subscription: &Subscription,
) -> Result<(), StreamError> {
    let message = ActionMessage {
        action,
        subscription,
    };
    let text = serde_json::to_string(&message)
        .map_err(|e| StreamError::Transport(format!("Failed to encode {} message: {}", action, e)))?;

    stream
        .send(text)
        .await
        .map_err(|e| StreamError::Transport(format!("Failed to send {} message: {}", action, e)))
}

/// Map a server close to the retry policy
fn classify_close(reason: Option<CloseReason>) -> Outcome {
    match reason {
        Some(reason) => match reason.code {
            CLOSE_NORMAL => Outcome::Clean,
            CLOSE_AUTH_MISSING => Outcome::Failed(StreamError::AuthMissing),
            CLOSE_AUTH_INVALID => Outcome::Failed(StreamError::AuthInvalid),
            CLOSE_SESSION_NOT_FOUND => Outcome::Failed(StreamError::SessionNotFound),
            CLOSE_INTERNAL_ERROR => Outcome::Failed(StreamError::ServerError),
            code => Outcome::Failed(StreamError::UnexpectedClose(code)),
        },
        None => Outcome::Failed(StreamError::ConnectionLost),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::aggregator::EventAggregator;
    use dripline_common::types::EventType;
    use pretty_assertions::assert_eq;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct MockTransport {
        sessions: Mutex<VecDeque<MockSession>>,
        attempts: AtomicUsize,
    }

    struct MockSession {
        frames: mpsc::UnboundedReceiver<Frame>,
        sent: Arc<Mutex<Vec<String>>>,
    }

    /// Test-side handle to one scripted session
    struct SessionHandle {
        frames: mpsc::UnboundedSender<Frame>,
        sent: Arc<Mutex<Vec<String>>>,
    }

    impl SessionHandle {
        fn sent_messages(&self) -> Vec<serde_json::Value> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .map(|text| serde_json::from_str(text).unwrap())
                .collect()
        }

        fn sent_count(&self) -> usize {
            self.sent.lock().unwrap().len()
        }
    }

    impl MockTransport {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                sessions: Mutex::new(VecDeque::new()),
                attempts: AtomicUsize::new(0),
            })
        }

        fn add_session(&self) -> SessionHandle {
            let (frame_tx, frame_rx) = mpsc::unbounded_channel();
            let sent = Arc::new(Mutex::new(Vec::new()));
            self.sessions.lock().unwrap().push_back(MockSession {
                frames: frame_rx,
                sent: Arc::clone(&sent),
            });
            SessionHandle {
                frames: frame_tx,
                sent,
            }
        }

        fn attempts(&self) -> usize {
            self.attempts.load(Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl Transport for MockTransport {
        async fn open(&self, _url: &str) -> dripline_common::Result<Box<dyn TransportStream>> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            match self.sessions.lock().unwrap().pop_front() {
                Some(session) => Ok(Box::new(session)),
                None => Err(dripline_common::Error::Transport(
                    "No session available".to_string(),
                )),
            }
        }
    }

    #[async_trait::async_trait]
    impl TransportStream for MockSession {
        async fn send(&mut self, text: String) -> dripline_common::Result<()> {
            self.sent.lock().unwrap().push(text);
            Ok(())
        }

        async fn recv(&mut self) -> Option<Frame> {
            self.frames.recv().await
        }

        async fn close(&mut self) -> dripline_common::Result<()> {
            Ok(())
        }
    }

    fn test_config() -> StreamConfig {
        StreamConfig {
            url: "ws://localhost/live".to_string(),
            token: "test-token".to_string(),
            reconnect_delay_secs: 3,
        }
    }

    fn connect(
        transport: &Arc<MockTransport>,
    ) -> (StreamConnection, Arc<EventAggregator>) {
        let aggregator = Arc::new(EventAggregator::new());
        let connection = StreamConnection::connect_with_transport(
            test_config(),
            aggregator.clone(),
            transport.clone() as Arc<dyn Transport>,
        );
        (connection, aggregator)
    }

    /// Poll until the condition holds; paused tokio time auto-advances
    async fn eventually(mut condition: impl FnMut() -> bool) {
        for _ in 0..400 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("Condition not met in time");
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_replays_subscriptions_once() {
        let transport = MockTransport::new();
        let session1 = transport.add_session();
        let session2 = transport.add_session();

        let (connection, _aggregator) = connect(&transport);

        // Duplicate subscribe: set semantics, sent at most once
        connection.subscribe(Subscription::campaign("c1"));
        connection.subscribe(Subscription::campaign("c1"));

        connection.wait_for_state(ConnectionState::Open).await;
        eventually(|| session1.sent_count() == 1).await;

        // Unexpected closure: stream just ends
        let sent2 = Arc::clone(&session2.sent);
        drop(session1);

        eventually(|| transport.attempts() == 2).await;
        connection.wait_for_state(ConnectionState::Open).await;
        eventually(|| sent2.lock().unwrap().len() == 1).await;

        // Settle, then confirm no duplicate replay ever arrived
        tokio::time::sleep(Duration::from_secs(1)).await;
        let messages = session2.sent_messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(
            messages[0],
            serde_json::json!({
                "action": "subscribe",
                "channel": "campaign",
                "campaignId": "c1",
            })
        );
        assert!(connection.last_error().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_close_does_not_retry() {
        let transport = MockTransport::new();
        let session1 = transport.add_session();
        // A second session exists but must never be opened
        let _session2 = transport.add_session();

        let (connection, _aggregator) = connect(&transport);
        connection.wait_for_state(ConnectionState::Open).await;

        session1
            .frames
            .send(Frame::Close(Some(CloseReason {
                code: CLOSE_AUTH_INVALID,
                reason: "expired".to_string(),
            })))
            .unwrap();

        connection.wait_for_state(ConnectionState::Closed).await;
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert_eq!(transport.attempts(), 1);
        assert_eq!(connection.state(), ConnectionState::Closed);
        assert_eq!(connection.last_error(), Some(StreamError::AuthInvalid));
    }

    #[tokio::test(start_paused = true)]
    async fn test_internal_error_close_is_reported_and_retried() {
        let transport = MockTransport::new();
        let session1 = transport.add_session();
        let _session2 = transport.add_session();

        let (connection, _aggregator) = connect(&transport);
        connection.wait_for_state(ConnectionState::Open).await;

        session1
            .frames
            .send(Frame::Close(Some(CloseReason {
                code: CLOSE_INTERNAL_ERROR,
                reason: String::new(),
            })))
            .unwrap();

        eventually(|| transport.attempts() == 2).await;
        connection.wait_for_state(ConnectionState::Open).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_suppresses_pending_reconnect() {
        let transport = MockTransport::new();
        let session1 = transport.add_session();
        let _session2 = transport.add_session();

        let (connection, _aggregator) = connect(&transport);
        connection.wait_for_state(ConnectionState::Open).await;

        // Lose the connection, then disconnect while the retry timer is
        // pending: the timer must no-op
        drop(session1);
        connection.wait_for_state(ConnectionState::Closed).await;
        connection.disconnect();

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(transport.attempts(), 1);
        assert_eq!(connection.state(), ConnectionState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clean_disconnect_does_not_retry() {
        let transport = MockTransport::new();
        let _session1 = transport.add_session();
        let _session2 = transport.add_session();

        let (connection, _aggregator) = connect(&transport);
        connection.wait_for_state(ConnectionState::Open).await;

        connection.disconnect();
        connection.wait_for_state(ConnectionState::Closed).await;

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(transport.attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsubscribe_removes_from_replay_set() {
        let transport = MockTransport::new();
        let session1 = transport.add_session();
        let session2 = transport.add_session();

        let (connection, _aggregator) = connect(&transport);
        connection.wait_for_state(ConnectionState::Open).await;

        connection.subscribe(Subscription::sub_campaign("c1", "s1"));
        eventually(|| session1.sent_count() == 1).await;
        connection.unsubscribe(Subscription::sub_campaign("c1", "s1"));
        eventually(|| session1.sent_count() == 2).await;

        let messages = session1.sent_messages();
        assert_eq!(messages[1]["action"], "unsubscribe");
        assert_eq!(messages[1]["subCampaignId"], "s1");

        // After reconnect nothing is replayed
        drop(session1);
        eventually(|| transport.attempts() == 2).await;
        connection.wait_for_state(ConnectionState::Open).await;
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(session2.sent_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_events_reach_consumer_and_clear_on_loss() {
        let transport = MockTransport::new();
        let session1 = transport.add_session();
        let _session2 = transport.add_session();

        let (connection, aggregator) = connect(&transport);
        connection.wait_for_state(ConnectionState::Open).await;

        session1
            .frames
            .send(Frame::Text(
                r#"{"email":"a@example.com","event":"delivered","date":"2026-08-27T10:00:00Z"}"#
                    .to_string(),
            ))
            .unwrap();
        session1
            .frames
            .send(Frame::Text(
                r#"[{"email":"b@example.com","event":"sent"},{"email":"c@example.com","event":"opened"}]"#
                    .to_string(),
            ))
            .unwrap();
        // Malformed payloads are dropped without stalling the stream
        session1.frames.send(Frame::Text("not json".to_string())).unwrap();
        session1
            .frames
            .send(Frame::Text(r#"{"unrelated":true}"#.to_string()))
            .unwrap();

        eventually(|| aggregator.stats().total == 3).await;
        assert_eq!(connection.state(), ConnectionState::Open);
        let stats = aggregator.stats();
        assert_eq!(stats.counts[&EventType::from("delivered")], 1);
        assert_eq!(stats.counts[&EventType::from("sent")], 1);
        assert_eq!(stats.counts[&EventType::from("opened")], 1);

        // Stale aggregates are cleared the moment the connection drops
        drop(session1);
        eventually(|| aggregator.stats().total == 0).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribe_while_disconnected_is_queued() {
        let transport = MockTransport::new();
        // No session yet: first attempt fails, subscription lands in the set
        let (connection, _aggregator) = connect(&transport);

        eventually(|| transport.attempts() >= 1).await;
        connection.subscribe(Subscription::campaign("c9"));

        let session = transport.add_session();
        let sent = Arc::clone(&session.sent);
        connection.wait_for_state(ConnectionState::Open).await;
        eventually(|| sent.lock().unwrap().len() == 1).await;

        let messages = session.sent_messages();
        assert_eq!(messages[0]["action"], "subscribe");
        assert_eq!(messages[0]["campaignId"], "c9");
    }

    #[test]
    fn test_classify_close() {
        let close = |code| {
            classify_close(Some(CloseReason {
                code,
                reason: String::new(),
            }))
        };
        assert!(matches!(close(CLOSE_NORMAL), Outcome::Clean));
        assert!(matches!(close(CLOSE_AUTH_MISSING), Outcome::Failed(e) if e.is_fatal()));
        assert!(matches!(close(CLOSE_AUTH_INVALID), Outcome::Failed(e) if e.is_fatal()));
        assert!(matches!(close(CLOSE_SESSION_NOT_FOUND), Outcome::Failed(e) if e.is_fatal()));
        assert!(matches!(close(CLOSE_INTERNAL_ERROR), Outcome::Failed(e) if !e.is_fatal()));
        assert!(matches!(close(1006), Outcome::Failed(StreamError::UnexpectedClose(1006))));
        assert!(matches!(
            classify_close(None),
            Outcome::Failed(StreamError::ConnectionLost)
        ));
    }
}
