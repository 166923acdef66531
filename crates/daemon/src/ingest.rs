//! Ingest server
//!
//! One WebSocket connection per broadcast. The connection driver is written against
//! plain `Stream`/`Sink` types so it can run over an in-memory transport; the axum
//! handler only adapts WebSocket messages to [`Inbound`]/[`Outbound`].
//!
//! Per connection:
//! 1. wait for one JSON handshake (binary first, malformed or late: close 4000)
//! 2. register the session and start its supervisor, then send `ready`
//! 3. route binary messages into the supervisor until the peer closes, the
//!    session is stopped, the transcoder ends, or a ping goes unanswered
//! 4. tear down and close with a code describing why

use crate::protocol::{close_code, parse_handshake, HandshakeError, SessionConfig, ServerEvent};
use crate::registry::SharedRegistry;
use crate::session::{SessionId, SessionState, StopReason};
use crate::supervisor::{ExitAction, Supervisor, SupervisorEvent, SupervisorSettings, Termination};
use crate::transcode::Transcoder;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures::{future, Sink, SinkExt, Stream, StreamExt};
use live_relay_config::Config;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

/// Message received from the encoder
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Text(String),
    Binary(Vec<u8>),
    Pong,
    Close,
}

/// Message sent to the encoder
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    Ping,
    Close { code: u16, reason: String },
}

impl Outbound {
    fn event(event: &ServerEvent) -> Self {
        Outbound::Text(event.to_json())
    }

    fn into_message(self) -> Message {
        match self {
            Outbound::Text(text) => Message::Text(text),
            Outbound::Ping => Message::Ping(Vec::new()),
            Outbound::Close { code, reason } => Message::Close(Some(CloseFrame {
                code,
                reason: reason.into(),
            })),
        }
    }
}

/// Everything a connection handler needs
#[derive(Clone)]
pub struct IngestState {
    pub registry: SharedRegistry,
    pub transcoder: Arc<dyn Transcoder>,
    pub settings: Arc<SupervisorSettings>,
    pub ping_interval: Duration,
    pub handshake_timeout: Duration,
    pub max_message_bytes: usize,
}

impl IngestState {
    pub fn from_config(
        config: &Config,
        registry: SharedRegistry,
        transcoder: Arc<dyn Transcoder>,
        rtmps_supported: bool,
    ) -> Self {
        Self {
            registry,
            transcoder,
            settings: Arc::new(SupervisorSettings::from_config(config, rtmps_supported)),
            ping_interval: Duration::from_secs(config.server.ping_interval_secs),
            handshake_timeout: Duration::from_secs(config.server.handshake_timeout_secs),
            max_message_bytes: config.server.max_message_bytes,
        }
    }
}

/// How a connection ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionEnd {
    /// `None` when the connection never got past the handshake or admission
    pub session_id: Option<SessionId>,
    pub state: Option<SessionState>,
    pub code: u16,
}

/// Router serving the ingest endpoint at `path`
pub fn router(path: &str, state: IngestState) -> Router {
    Router::new()
        .route(path, get(ingest_handler))
        .with_state(state)
}

async fn ingest_handler(
    ws: WebSocketUpgrade,
    State(state): State<IngestState>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
) -> impl IntoResponse {
    let remote = connect_info.map(|ConnectInfo(addr)| addr);
    ws.max_message_size(state.max_message_bytes)
        .on_upgrade(move |socket| handle_socket(socket, state, remote))
}

async fn handle_socket(socket: WebSocket, state: IngestState, remote: Option<SocketAddr>) {
    let (sink, stream) = socket.split();

    let inbound = stream.filter_map(|msg| {
        future::ready(match msg {
            Ok(Message::Text(text)) => Some(Inbound::Text(text)),
            Ok(Message::Binary(data)) => Some(Inbound::Binary(data)),
            Ok(Message::Pong(_)) => Some(Inbound::Pong),
            // axum answers pings itself
            Ok(Message::Ping(_)) => None,
            Ok(Message::Close(_)) => Some(Inbound::Close),
            Err(e) => {
                tracing::debug!(error = %e, "websocket receive error");
                Some(Inbound::Close)
            }
        })
    });
    let outbound = sink.with(|out: Outbound| future::ready(Ok::<_, axum::Error>(out.into_message())));

    serve_connection(outbound, inbound, state, remote).await;
}

/// Drive one ingest connection to completion
///
/// Every send to the encoder is bounded by the ping interval. An encoder that stops
/// reading is treated like one that stops answering pings.
pub async fn serve_connection<S, R>(
    sink: S,
    stream: R,
    state: IngestState,
    remote: Option<SocketAddr>,
) -> ConnectionEnd
where
    S: Sink<Outbound>,
    S::Error: std::fmt::Display,
    R: Stream<Item = Inbound>,
{
    let mut sink = std::pin::pin!(sink);
    let mut stream = std::pin::pin!(stream);
    let remote = remote.map(|a| a.to_string()).unwrap_or_else(|| "unknown".to_string());
    let send_limit = state.ping_interval;

    let config = match tokio::time::timeout(state.handshake_timeout, read_handshake(&mut stream)).await {
        Ok(Ok(config)) => config,
        Ok(Err(HandshakeError::Disconnected)) => {
            tracing::debug!(%remote, "connection closed before handshake");
            return ConnectionEnd {
                session_id: None,
                state: None,
                code: close_code::NORMAL,
            };
        }
        result => {
            let err = match result {
                Ok(Err(e)) => e,
                _ => HandshakeError::Timeout(state.handshake_timeout.as_secs()),
            };
            tracing::warn!(%remote, error = %err, "rejecting handshake");
            close(&mut sink, close_code::BAD_HANDSHAKE, &err.to_string(), send_limit).await;
            return ConnectionEnd {
                session_id: None,
                state: None,
                code: close_code::BAD_HANDSHAKE,
            };
        }
    };

    let session = match state.registry.register(config).await {
        Ok(session) => session,
        Err(e) => {
            tracing::warn!(%remote, error = %e, "rejecting session");
            let error = ServerEvent::Error {
                message: e.to_string(),
            };
            if deliver(&mut sink, Outbound::event(&error), send_limit).await.is_ok() {
                close(&mut sink, close_code::TRY_AGAIN_LATER, &e.to_string(), send_limit).await;
            }
            return ConnectionEnd {
                session_id: None,
                state: None,
                code: close_code::TRY_AGAIN_LATER,
            };
        }
    };
    let _registration = Registration {
        registry: state.registry.clone(),
        id: session.id,
    };
    let id = session.id;
    let mut stop_rx = session.subscribe_stop();

    tracing::info!(
        session_id = %id,
        %remote,
        input = session.config.input_format.as_str(),
        fps = session.config.fps,
        video_kbps = session.config.video_bitrate_kbps,
        resolution = %session.config.resolution(),
        "session started"
    );

    let (mut supervisor, mut events) =
        match Supervisor::start(session.clone(), state.transcoder.clone(), state.settings.clone()) {
            Ok(started) => started,
            Err(e) => {
                state.registry.remove(id).await;
                let message = e.to_string();
                let error = ServerEvent::Error {
                    message: message.clone(),
                };
                if deliver(&mut sink, Outbound::event(&error), send_limit).await.is_ok() {
                    close(&mut sink, e.close_code(), &message, send_limit).await;
                }
                return ConnectionEnd {
                    session_id: Some(id),
                    state: Some(session.state()),
                    code: e.close_code(),
                };
            }
        };

    let ready = ServerEvent::Ready {
        session_id: id.0,
        message: "transcoder started".to_string(),
    };
    let mut writable = true;
    if let Err(reason) = deliver(&mut sink, Outbound::event(&ready), send_limit).await {
        writable = reason != StopReason::Unresponsive;
        session.request_stop(reason);
    }

    let mut ping = tokio::time::interval_at(
        tokio::time::Instant::now() + state.ping_interval,
        state.ping_interval,
    );
    let mut awaiting_pong = false;

    let termination = loop {
        // A stop requested before subscribing is not reported by `changed`
        if let Some(reason) = session.stop_reason() {
            break supervisor.shutdown(reason).await;
        }

        let outgoing = tokio::select! {
            msg = stream.next() => {
                match msg {
                    Some(Inbound::Binary(data)) => {
                        supervisor.feed(data);
                    }
                    Some(Inbound::Text(_)) => {
                        tracing::debug!(session_id = %id, "ignoring text message after handshake");
                    }
                    Some(Inbound::Pong) => awaiting_pong = false,
                    Some(Inbound::Close) | None => {
                        session.request_stop(StopReason::PeerClosed);
                    }
                }
                None
            }
            _ = stop_rx.changed() => None,
            event = events.recv() => {
                let Some(event) = event else { continue };
                let fatal = event.is_fatal_diagnostic();
                match event {
                    SupervisorEvent::Diagnostic { line, .. } if fatal => {
                        break supervisor.fail_input(&line).await;
                    }
                    SupervisorEvent::Diagnostic { line, progress } => {
                        Some(Outbound::event(&ServerEvent::from_diagnostic(line, progress)))
                    }
                    SupervisorEvent::Exited { generation, outcome } => {
                        match supervisor.handle_exit(generation, outcome) {
                            ExitAction::Finished(termination) => break termination,
                            ExitAction::Reconnecting => Some(Outbound::event(&ServerEvent::Log {
                                message: format!("transcoder exited ({}), reconnecting", outcome),
                            })),
                            ExitAction::Ignored => None,
                        }
                    }
                    SupervisorEvent::Respawn { generation } => match supervisor.respawn(generation) {
                        Ok(true) => Some(Outbound::event(&ServerEvent::Log {
                            message: "transcoder restarted".to_string(),
                        })),
                        Ok(false) => None,
                        Err(e) => break Termination {
                            state: session.state(),
                            code: close_code::TRANSCODER_FAILED,
                            message: e.to_string(),
                        },
                    },
                }
            }
            _ = ping.tick() => {
                if awaiting_pong {
                    tracing::warn!(session_id = %id, "no pong since last ping, dropping connection");
                    session.request_stop(StopReason::Unresponsive);
                    None
                } else {
                    awaiting_pong = true;
                    Some(Outbound::Ping)
                }
            }
        };

        if let Some(out) = outgoing {
            if let Err(reason) = deliver(&mut sink, out, send_limit).await {
                if reason == StopReason::Unresponsive {
                    tracing::warn!(session_id = %id, "encoder stopped reading, dropping connection");
                    writable = false;
                }
                session.request_stop(reason);
            }
        }
    };

    let final_event = match termination.state {
        SessionState::Failed => ServerEvent::Error {
            message: termination.message.clone(),
        },
        _ => ServerEvent::Stopped {
            message: termination.message.clone(),
        },
    };
    state.registry.remove(id).await;
    if writable && deliver(&mut sink, Outbound::event(&final_event), send_limit).await.is_ok() {
        close(&mut sink, termination.code, &termination.message, send_limit).await;
    }

    tracing::info!(
        session_id = %id,
        state = %termination.state,
        code = termination.code,
        video_frames = session.video_frames(),
        audio_frames = session.audio_frames(),
        dropped_frames = session.dropped_frames(),
        "session ended"
    );

    ConnectionEnd {
        session_id: Some(id),
        state: Some(termination.state),
        code: termination.code,
    }
}

async fn read_handshake<R>(stream: &mut R) -> Result<SessionConfig, HandshakeError>
where
    R: Stream<Item = Inbound> + Unpin,
{
    loop {
        match stream.next().await {
            Some(Inbound::Text(text)) => return parse_handshake(&text),
            Some(Inbound::Binary(_)) => return Err(HandshakeError::BinaryBeforeHandshake),
            Some(Inbound::Pong) => continue,
            Some(Inbound::Close) | None => return Err(HandshakeError::Disconnected),
        }
    }
}

/// Send one message within `limit`
///
/// On failure returns how the session should stop: the peer is gone, or it stopped
/// reading and the send timed out.
async fn deliver<S>(sink: &mut S, out: Outbound, limit: Duration) -> Result<(), StopReason>
where
    S: Sink<Outbound> + Unpin,
    S::Error: std::fmt::Display,
{
    match tokio::time::timeout(limit, sink.send(out)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => {
            tracing::debug!(error = %e, "send to encoder failed");
            Err(StopReason::PeerClosed)
        }
        Err(_) => Err(StopReason::Unresponsive),
    }
}

async fn close<S>(sink: &mut S, code: u16, reason: &str, limit: Duration)
where
    S: Sink<Outbound> + Unpin,
{
    // Close frame reasons are limited to 123 bytes
    let mut end = reason.len().min(123);
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    let closing = async {
        let _ = sink
            .send(Outbound::Close {
                code,
                reason: reason[..end].to_string(),
            })
            .await;
        let _ = sink.close().await;
    };
    if tokio::time::timeout(limit, closing).await.is_err() {
        tracing::debug!(code, "close frame not delivered in time");
    }
}

/// Removes the session from the registry if the connection task is dropped early
struct Registration {
    registry: SharedRegistry,
    id: SessionId,
}

impl Drop for Registration {
    fn drop(&mut self) {
        let registry = self.registry.clone();
        let id = self.id;
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                registry.remove(id).await;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outbound::DEFAULT_ENDPOINT;
    use crate::registry::{Registry, RegistryError};
    use crate::transcode::fake::{FakeBehavior, FakeTranscoder};
    use futures::channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender};
    use live_relay_config::AdmissionPolicy;
    use tokio::task::JoinHandle;

    const HANDSHAKE: &str =
        r#"{"type":"start","server":"rtmp://live.example.com/app","streamKey":"abc123","fps":30}"#;

    struct Client {
        tx: UnboundedSender<Inbound>,
        rx: UnboundedReceiver<Outbound>,
        task: JoinHandle<ConnectionEnd>,
    }

    impl Client {
        fn connect(state: &IngestState) -> Self {
            let (tx, inbound) = unbounded();
            let (outbound, rx) = unbounded();
            let task = tokio::spawn(serve_connection(outbound, inbound, state.clone(), None));
            Self { tx, rx, task }
        }

        fn send(&self, msg: Inbound) {
            self.tx.unbounded_send(msg).unwrap();
        }

        async fn next(&mut self) -> Outbound {
            self.rx.next().await.expect("connection ended without closing")
        }

        async fn next_event(&mut self) -> ServerEvent {
            match self.next().await {
                Outbound::Text(text) => serde_json::from_str(&text).unwrap(),
                other => panic!("expected event, got {:?}", other),
            }
        }

        /// Skip events until the close frame
        async fn close_code(&mut self) -> u16 {
            loop {
                if let Outbound::Close { code, .. } = self.next().await {
                    return code;
                }
            }
        }

        async fn start(state: &IngestState) -> (Self, SessionId) {
            let mut client = Self::connect(state);
            client.send(Inbound::Text(HANDSHAKE.to_string()));
            match client.next_event().await {
                ServerEvent::Ready { session_id, .. } => (client, SessionId(session_id)),
                other => panic!("expected ready, got {:?}", other),
            }
        }
    }

    fn state_with(transcoder: &Arc<FakeTranscoder>, max_sessions: usize) -> IngestState {
        IngestState {
            registry: Registry::shared(max_sessions, AdmissionPolicy::Reject),
            transcoder: transcoder.clone(),
            settings: Arc::new(SupervisorSettings {
                preset: "veryfast".to_string(),
                default_endpoint: DEFAULT_ENDPOINT.to_string(),
                rtmps_supported: true,
                grace_period: Duration::from_secs(4),
                backpressure_limit: 4 * 1024 * 1024,
                max_reconnect_attempts: 0,
                reconnect_delay: Duration::from_secs(1),
            }),
            ping_interval: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(10),
            max_message_bytes: 8 * 1024 * 1024,
        }
    }

    fn fake() -> Arc<FakeTranscoder> {
        Arc::new(FakeTranscoder::new(FakeBehavior::default()))
    }

    async fn wait_until<F: Fn() -> bool>(condition: F) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_ready_precedes_media_and_one_process_per_session() {
        let transcoder = fake();
        let state = state_with(&transcoder, 10);

        let (client, id) = Client::start(&state).await;
        assert_eq!(transcoder.spawn_count(), 1);
        assert_eq!(
            transcoder.last_spec().unwrap().output_url,
            "rtmp://live.example.com/app/abc123"
        );

        client.send(Inbound::Binary(b"chunk-1".to_vec()));
        client.send(Inbound::Binary(b"chunk-2".to_vec()));
        let handle = transcoder.last().unwrap();
        wait_until(|| handle.received().len() == 14).await;
        assert_eq!(handle.received(), b"chunk-1chunk-2");

        let session = state.registry.get(id).await.unwrap();
        assert_eq!(session.state(), SessionState::Streaming);
        assert_eq!(session.video_frames(), 2);
        assert_eq!(transcoder.spawn_count(), 1);
    }

    #[tokio::test]
    async fn test_peer_close_tears_down_session() {
        let transcoder = fake();
        let state = state_with(&transcoder, 10);
        let (client, id) = Client::start(&state).await;

        client.send(Inbound::Close);
        let end = client.task.await.unwrap();

        assert_eq!(end.session_id, Some(id));
        assert_eq!(end.state, Some(SessionState::Closed));
        assert_eq!(end.code, close_code::NORMAL);
        assert_eq!(transcoder.last().unwrap().terminate_calls(), 1);
        assert!(state.registry.get(id).await.is_none());
    }

    #[tokio::test]
    async fn test_missing_key_never_spawns() {
        let transcoder = fake();
        let state = state_with(&transcoder, 10);
        let mut client = Client::connect(&state);

        client.send(Inbound::Text(r#"{"server":"rtmp://host/app"}"#.to_string()));

        assert_eq!(client.close_code().await, close_code::BAD_HANDSHAKE);
        assert_eq!(client.task.await.unwrap().session_id, None);
        assert_eq!(transcoder.spawn_count(), 0);
        assert!(state.registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_binary_before_handshake_rejected() {
        let transcoder = fake();
        let state = state_with(&transcoder, 10);
        let mut client = Client::connect(&state);

        client.send(Inbound::Binary(vec![0x1a, 0x45, 0xdf, 0xa3]));

        assert_eq!(client.close_code().await, close_code::BAD_HANDSHAKE);
        assert_eq!(transcoder.spawn_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_timeout() {
        let transcoder = fake();
        let state = state_with(&transcoder, 10);
        let mut client = Client::connect(&state);

        assert_eq!(client.close_code().await, close_code::BAD_HANDSHAKE);
        assert_eq!(transcoder.spawn_count(), 0);
    }

    #[tokio::test]
    async fn test_invalid_destination_reports_error() {
        let transcoder = fake();
        let state = state_with(&transcoder, 10);
        let mut client = Client::connect(&state);

        client.send(Inbound::Text(
            r#"{"server":"rtmp://host/app","streamKey":" \n\t "}"#.to_string(),
        ));

        assert!(matches!(client.next_event().await, ServerEvent::Error { .. }));
        assert_eq!(client.close_code().await, close_code::INVALID_DESTINATION);
        assert_eq!(transcoder.spawn_count(), 0);
        assert!(state.registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_spawn_failure_reports_error() {
        let transcoder = Arc::new(FakeTranscoder::new(FakeBehavior {
            fail_spawn: true,
            ..FakeBehavior::default()
        }));
        let state = state_with(&transcoder, 10);
        let mut client = Client::connect(&state);

        client.send(Inbound::Text(HANDSHAKE.to_string()));

        assert!(matches!(client.next_event().await, ServerEvent::Error { .. }));
        assert_eq!(client.close_code().await, close_code::SPAWN_FAILED);
        let end = client.task.await.unwrap();
        assert_eq!(end.state, Some(SessionState::Failed));
        wait_until_empty(&state).await;
    }

    async fn wait_until_empty(state: &IngestState) {
        for _ in 0..200 {
            if state.registry.is_empty().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("registry not drained");
    }

    #[tokio::test]
    async fn test_capacity_rejects_extra_session() {
        let transcoder = fake();
        let state = state_with(&transcoder, 1);
        let (_first, _) = Client::start(&state).await;

        let mut second = Client::connect(&state);
        second.send(Inbound::Text(HANDSHAKE.to_string()));

        assert!(matches!(second.next_event().await, ServerEvent::Error { .. }));
        assert_eq!(second.close_code().await, close_code::TRY_AGAIN_LATER);
        assert_eq!(transcoder.spawn_count(), 1);
    }

    #[tokio::test]
    async fn test_one_crash_leaves_other_sessions_streaming() {
        let transcoder = fake();
        let state = state_with(&transcoder, 10);

        let (a, id_a) = Client::start(&state).await;
        let (mut b, _) = Client::start(&state).await;
        let (c, id_c) = Client::start(&state).await;
        assert_eq!(state.registry.active_count().await, 3);

        for client in [&a, &b, &c] {
            client.send(Inbound::Binary(vec![1; 100]));
        }
        let handles = transcoder.handles();
        wait_until(|| handles.iter().all(|h| h.received().len() == 100)).await;

        handles[1].exit(1);
        assert_eq!(b.close_code().await, close_code::TRANSCODER_FAILED);
        assert_eq!(b.task.await.unwrap().state, Some(SessionState::Failed));
        wait_until_active(&state, 2).await;

        let session_a = state.registry.get(id_a).await.unwrap();
        let session_c = state.registry.get(id_c).await.unwrap();
        let before = (session_a.video_frames(), session_c.video_frames());
        a.send(Inbound::Binary(vec![2; 100]));
        c.send(Inbound::Binary(vec![2; 100]));
        wait_until(|| handles[0].received().len() == 200 && handles[2].received().len() == 200).await;

        assert!(session_a.video_frames() > before.0);
        assert!(session_c.video_frames() > before.1);
        assert_eq!(state.registry.active_count().await, 2);
    }

    async fn wait_until_active(state: &IngestState, expected: usize) {
        for _ in 0..200 {
            if state.registry.active_count().await == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("active count never reached {}", expected);
    }

    #[tokio::test]
    async fn test_admin_stop_closes_with_admin_code() {
        let transcoder = fake();
        let state = state_with(&transcoder, 10);
        let (mut client, id) = Client::start(&state).await;

        state.registry.stop(id, StopReason::Admin).await.unwrap();

        assert!(matches!(client.next_event().await, ServerEvent::Stopped { .. }));
        assert_eq!(client.close_code().await, close_code::ADMIN_STOPPED);
        assert_eq!(transcoder.last().unwrap().terminate_calls(), 1);
        assert_eq!(
            state.registry.stop(id, StopReason::Admin).await,
            Err(RegistryError::NotFound(id))
        );
    }

    #[tokio::test]
    async fn test_text_after_handshake_ignored() {
        let transcoder = fake();
        let state = state_with(&transcoder, 10);
        let (client, id) = Client::start(&state).await;

        client.send(Inbound::Text(HANDSHAKE.to_string()));
        client.send(Inbound::Binary(b"media".to_vec()));
        let handle = transcoder.last().unwrap();
        wait_until(|| handle.received() == b"media").await;

        assert_eq!(transcoder.spawn_count(), 1);
        assert_eq!(
            state.registry.get(id).await.unwrap().state(),
            SessionState::Streaming
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_ping_drops_connection() {
        let transcoder = fake();
        let state = state_with(&transcoder, 10);
        let (mut client, id) = Client::start(&state).await;

        assert_eq!(client.next().await, Outbound::Ping);
        // No pong: the next tick ends the session
        let code = client.close_code().await;

        assert_eq!(code, StopReason::Unresponsive.close_code());
        assert_eq!(transcoder.last().unwrap().terminate_calls(), 1);
        assert_eq!(client.task.await.unwrap().session_id, Some(id));
        assert!(state.registry.get(id).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_answered_ping_keeps_connection() {
        let transcoder = fake();
        let state = state_with(&transcoder, 10);
        let (mut client, id) = Client::start(&state).await;

        for _ in 0..3 {
            assert_eq!(client.next().await, Outbound::Ping);
            client.send(Inbound::Pong);
        }

        assert_eq!(
            state.registry.get(id).await.unwrap().state(),
            SessionState::Streaming
        );
        assert_eq!(transcoder.last().unwrap().terminate_calls(), 0);
    }

    #[tokio::test]
    async fn test_diagnostics_forwarded_as_events() {
        let transcoder = fake();
        let state = state_with(&transcoder, 10);
        let (mut client, _) = Client::start(&state).await;

        let handle = transcoder.last().unwrap();
        handle.emit("Input #0, matroska,webm, from 'pipe:0':").await;
        handle.emit("frame=   60 fps= 30 q=23.0 size=256kB time=00:00:02.00 bitrate=1048.6kbits/s speed=1.01x").await;

        assert!(matches!(client.next_event().await, ServerEvent::Log { .. }));
        match client.next_event().await {
            ServerEvent::Progress { frame, .. } => assert_eq!(frame, 60),
            other => panic!("expected progress, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unreadable_input_fails_session() {
        let transcoder = fake();
        let state = state_with(&transcoder, 10);
        let (mut client, id) = Client::start(&state).await;

        client.send(Inbound::Binary(b"not webm".to_vec()));
        let handle = transcoder.last().unwrap();
        handle.emit("[matroska,webm @ 0x55d5] EBML header parsing failed").await;

        match client.next_event().await {
            ServerEvent::Error { message } => assert!(message.contains("EBML header parsing failed")),
            other => panic!("expected error, got {:?}", other),
        }
        assert_eq!(client.close_code().await, close_code::TRANSCODER_FAILED);
        let end = client.task.await.unwrap();
        assert_eq!(end.state, Some(SessionState::Failed));
        assert_eq!(handle.terminate_calls(), 1);
        assert_eq!(transcoder.spawn_count(), 1);
        assert!(state.registry.get(id).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_respawn_ends_session() {
        let transcoder = fake();
        let mut state = state_with(&transcoder, 10);
        state.settings = Arc::new(SupervisorSettings {
            max_reconnect_attempts: 1,
            ..(*state.settings).clone()
        });
        let (mut client, id) = Client::start(&state).await;

        transcoder.set_behavior(FakeBehavior {
            fail_spawn: true,
            ..FakeBehavior::default()
        });
        let first = transcoder.last().unwrap();
        first.exit(1);

        match client.next_event().await {
            ServerEvent::Log { message } => assert!(message.contains("reconnecting")),
            other => panic!("expected log, got {:?}", other),
        }
        assert!(matches!(client.next_event().await, ServerEvent::Error { .. }));
        assert_eq!(client.close_code().await, close_code::TRANSCODER_FAILED);

        assert!(first.has_exited());
        assert_eq!(transcoder.spawn_count(), 1);
        assert_eq!(client.task.await.unwrap().state, Some(SessionState::Failed));
        assert!(state.registry.get(id).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_encoder_that_stops_reading_is_dropped() {
        let transcoder = fake();
        let state = state_with(&transcoder, 10);
        let (tx, inbound) = unbounded();
        // Room for two messages, and nothing ever reads them
        let (outbound, _unread) = futures::channel::mpsc::channel::<Outbound>(2);
        let task = tokio::spawn(serve_connection(outbound, inbound, state.clone(), None));

        tx.unbounded_send(Inbound::Text(HANDSHAKE.to_string())).unwrap();
        wait_until(|| transcoder.spawn_count() == 1).await;
        let handle = transcoder.last().unwrap();
        for n in 0..10 {
            handle.emit(&format!("[out#0/flv] muxing packet {}", n)).await;
        }

        let end = tokio::time::timeout(Duration::from_secs(600), task)
            .await
            .expect("stalled encoder held the connection open")
            .unwrap();

        assert_eq!(end.state, Some(SessionState::Closed));
        assert_eq!(end.code, StopReason::Unresponsive.close_code());
        assert_eq!(handle.terminate_calls(), 1);
        assert!(state.registry.is_empty().await);
        drop(tx);
    }
}
