//! Per-connection console protocol.
//!
//! A connection is bound to exactly one server. Once the token has been
//! verified the handler subscribes to the server's status, console and stats
//! events, pushes the current status, then reads frames until the client goes
//! away or a control action fails. All writes to the socket, whether they come
//! from event producers or from the read loop itself, go through one mutex.

use std::sync::Arc;

use futures::stream::{SplitSink, SplitStream};
use futures::{Sink, SinkExt, Stream, StreamExt};
use nix::sys::signal::Signal;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::error::ProtocolError;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, error, info, trace, warn, Instrument};
use uuid::Uuid;

use crate::auth::{TokenPayload, PERMISSION_SEND_COMMAND, PERMISSION_SEND_POWER};
use crate::events::{SubscriptionId, CONSOLE_OUTPUT_EVENT, STATS_EVENT, STATUS_EVENT};
use crate::server::{ProcessState, Server};
use crate::{AgentError, AgentResult};

pub const SET_STATE_EVENT: &str = "set state";
pub const SEND_LOGS_EVENT: &str = "send logs";
pub const SEND_COMMAND_EVENT: &str = "send command";

/// Upper bound on log data replayed for a `send logs` request.
const LOG_DUMP_MAX_BYTES: usize = 16 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebSocketMessage {
    pub event: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    /// Set for messages decoded off the wire. Never serialized.
    #[serde(skip)]
    inbound: bool,
}

impl WebSocketMessage {
    pub fn outbound(event: &str, arg: impl Into<String>) -> Self {
        Self {
            event: event.to_string(),
            args: vec![arg.into()],
            inbound: false,
        }
    }

    pub fn decode_inbound(data: &[u8]) -> Result<Self, serde_json::Error> {
        let mut message: Self = serde_json::from_slice(data)?;
        message.inbound = true;
        Ok(message)
    }

    pub fn is_inbound(&self) -> bool {
        self.inbound
    }

    fn joined_args(&self) -> String {
        self.args.concat()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PowerAction {
    Start,
    Stop,
    Restart,
    Kill,
}

impl PowerAction {
    fn parse(value: &str) -> Option<Self> {
        match value {
            "start" => Some(PowerAction::Start),
            "stop" => Some(PowerAction::Stop),
            "restart" => Some(PowerAction::Restart),
            "kill" => Some(PowerAction::Kill),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Active,
    Closing,
    Closed,
}

/// Serialized write half of a socket. Cloned into every event listener.
pub struct SocketWriter<S> {
    sink: Arc<Mutex<SplitSink<S, Message>>>,
}

impl<S> Clone for SocketWriter<S> {
    fn clone(&self) -> Self {
        Self {
            sink: self.sink.clone(),
        }
    }
}

impl<S> SocketWriter<S>
where
    S: Sink<Message, Error = WsError> + Unpin,
{
    fn new(sink: SplitSink<S, Message>) -> Self {
        Self {
            sink: Arc::new(Mutex::new(sink)),
        }
    }

    /// Blocks until the frame is written. There is no timeout: a slow client
    /// stalls whoever is trying to write to it.
    pub async fn send_json(&self, message: &WebSocketMessage) -> AgentResult<()> {
        let text = serde_json::to_string(message)?;
        let mut w = self.sink.lock().await;
        w.send(Message::Text(text.into())).await?;
        Ok(())
    }

    async fn close(&self) {
        let mut w = self.sink.lock().await;
        if let Err(err) = w.close().await {
            trace!("Socket close failed: {}", err);
        }
    }
}

/// Listener handles owned by one connection. Dropping it unsubscribes all of
/// them, so cleanup also happens when the connection task is cancelled.
struct Subscriptions {
    server: Arc<Server>,
    entries: Vec<(&'static str, SubscriptionId)>,
}

impl Drop for Subscriptions {
    fn drop(&mut self) {
        for (event, id) in self.entries.drain(..) {
            if !self.server.events().unsubscribe(event, id) {
                debug!("Subscription {:?} on {} was already gone", id, event);
            }
        }
    }
}

pub struct WebSocketHandler<S> {
    id: Uuid,
    server: Arc<Server>,
    token: TokenPayload,
    writer: SocketWriter<S>,
    state: ConnectionState,
}

/// Runs the console protocol for an upgraded socket until it closes.
///
/// Returns an error only when a control action failed; client disconnects of
/// any kind end with `Ok`.
pub async fn handle_connection<S>(server: Arc<Server>, token: TokenPayload, socket: S) -> AgentResult<()>
where
    S: Stream<Item = Result<Message, WsError>> + Sink<Message, Error = WsError> + Send + Unpin + 'static,
{
    let (write, read) = socket.split();
    let handler = WebSocketHandler::new(server, token, SocketWriter::new(write));
    let span = tracing::info_span!(
        "console",
        connection = %handler.id,
        server = %handler.server.uuid(),
        user = %handler.token.user_id,
    );
    handler.run(read).instrument(span).await
}

impl<S> WebSocketHandler<S>
where
    S: Stream<Item = Result<Message, WsError>> + Sink<Message, Error = WsError> + Send + Unpin + 'static,
{
    fn new(server: Arc<Server>, token: TokenPayload, writer: SocketWriter<S>) -> Self {
        Self {
            id: Uuid::new_v4(),
            server,
            token,
            writer,
            state: ConnectionState::Connecting,
        }
    }

    fn transition(&mut self, state: ConnectionState) {
        trace!("Connection {:?} -> {:?}", self.state, state);
        self.state = state;
    }

    async fn run(mut self, mut read: SplitStream<S>) -> AgentResult<()> {
        let subscriptions = self.subscribe();
        self.transition(ConnectionState::Active);
        info!("Console connection opened");

        let status = WebSocketMessage::outbound(STATUS_EVENT, self.server.state().as_str());
        if let Err(err) = self.writer.send_json(&status).await {
            debug!("Failed to push initial status: {}", err);
        }

        let result = self.read_loop(&mut read).await;

        self.transition(ConnectionState::Closing);
        drop(subscriptions);
        self.writer.close().await;
        self.transition(ConnectionState::Closed);
        info!("Console connection closed");

        result
    }

    fn subscribe(&self) -> Subscriptions {
        let mut entries = Vec::with_capacity(3);
        for event in [STATUS_EVENT, CONSOLE_OUTPUT_EVENT, STATS_EVENT] {
            let writer = self.writer.clone();
            let id = self.server.events().subscribe(event, move |payload| {
                let writer = writer.clone();
                async move {
                    let message = WebSocketMessage::outbound(event, payload);
                    if let Err(err) = writer.send_json(&message).await {
                        trace!("Dropping {} event for closed socket: {}", event, err);
                    }
                }
            });
            entries.push((event, id));
        }

        Subscriptions {
            server: self.server.clone(),
            entries,
        }
    }

    async fn read_loop(&self, read: &mut SplitStream<S>) -> AgentResult<()> {
        while let Some(frame) = read.next().await {
            let decoded = match frame {
                Ok(Message::Text(text)) => WebSocketMessage::decode_inbound(text.as_str().as_bytes()),
                Ok(Message::Binary(data)) => WebSocketMessage::decode_inbound(&data),
                Ok(Message::Close(frame)) => {
                    let code = frame.map(|f| f.code).unwrap_or(CloseCode::Status);
                    if !is_expected_close_code(code) {
                        error!(
                            "Console connection closed with unexpected code {}",
                            u16::from(code)
                        );
                    }
                    return Ok(());
                }
                Ok(_) => continue,
                Err(err) => {
                    if !is_expected_disconnect(&err) {
                        error!("Error handling websocket message: {}", err);
                    }
                    return Ok(());
                }
            };

            // A bad frame is dropped; it never costs the client its connection.
            let message = match decoded {
                Ok(message) => message,
                Err(err) => {
                    debug!("Discarding malformed frame: {}", err);
                    continue;
                }
            };

            if let Err(err) = self.handle_inbound(message).await {
                warn!("Error handling inbound websocket request: {}", err);
                return Err(err);
            }
        }

        Ok(())
    }

    /// Routes one decoded frame. Authorization problems are swallowed here;
    /// only failures of the environment itself come back as errors.
    pub async fn handle_inbound(&self, message: WebSocketMessage) -> AgentResult<()> {
        if !message.is_inbound() {
            return Err(AgentError::InvalidRequest(
                "Cannot handle an outbound message as a request".to_string(),
            ));
        }

        if let Err(err) = self.token.is_currently_valid(self.server.uuid()) {
            debug!("Token is no longer valid: {}", err);
            return Ok(());
        }

        match message.event.as_str() {
            SET_STATE_EVENT => {
                if !self.token.has_permission(PERMISSION_SEND_POWER) {
                    return Ok(());
                }
                self.set_state(&message.joined_args()).await
            }
            SEND_LOGS_EVENT => self.send_logs().await,
            SEND_COMMAND_EVENT => {
                if !self.token.has_permission(PERMISSION_SEND_COMMAND) {
                    return Ok(());
                }
                self.server
                    .environment()
                    .send_command(&message.joined_args())
                    .await
            }
            other => {
                debug!("Ignoring unknown event: {}", other);
                Ok(())
            }
        }
    }

    async fn set_state(&self, action: &str) -> AgentResult<()> {
        let environment = self.server.environment();
        match PowerAction::parse(action) {
            Some(PowerAction::Start) => {
                self.server.set_state(ProcessState::Starting).await;
                let result = environment.start().await;
                if result.is_err() {
                    self.server.set_state(ProcessState::Offline).await;
                }
                result
            }
            Some(PowerAction::Stop) => {
                self.server.set_state(ProcessState::Stopping).await;
                environment.stop().await
            }
            Some(PowerAction::Kill) => environment.terminate(Signal::SIGKILL).await,
            // Recognised but deliberately a no-op here.
            Some(PowerAction::Restart) => {
                debug!("Ignoring restart request; restart is not implemented on the console socket");
                Ok(())
            }
            None => {
                debug!("Ignoring unknown power action: {}", action);
                Ok(())
            }
        }
    }

    async fn send_logs(&self) -> AgentResult<()> {
        let environment = self.server.environment();
        if !environment.is_running().await.unwrap_or(false) {
            return Ok(());
        }

        let lines = environment.read_log(LOG_DUMP_MAX_BYTES).await?;
        for line in lines {
            let message = WebSocketMessage::outbound(CONSOLE_OUTPUT_EVENT, line);
            if let Err(err) = self.writer.send_json(&message).await {
                debug!("Stopped log replay: {}", err);
                break;
            }
        }

        Ok(())
    }
}

/// Close codes that mean the client simply went away.
fn is_expected_close_code(code: CloseCode) -> bool {
    matches!(
        code,
        CloseCode::Normal
            | CloseCode::Away
            | CloseCode::Status
            | CloseCode::Restart
            | CloseCode::Abnormal
    )
}

/// Transport errors that amount to an abnormal but unremarkable disconnect.
fn is_expected_disconnect(err: &WsError) -> bool {
    match err {
        WsError::ConnectionClosed | WsError::AlreadyClosed => true,
        WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => true,
        WsError::Io(io) => matches!(
            io.kind(),
            std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::ConnectionAborted
                | std::io::ErrorKind::BrokenPipe
                | std::io::ErrorKind::UnexpectedEof
        ),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{UserId, PERMISSION_CONNECT};
    use crate::environment::testing::MockEnvironment;
    use std::time::Duration;
    use tokio::io::DuplexStream;
    use tokio::task::JoinHandle;
    use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Role};
    use tokio_tungstenite::WebSocketStream;

    type Client = WebSocketStream<DuplexStream>;

    fn token(server_uuid: &str, permissions: &[&str]) -> TokenPayload {
        let now = chrono::Utc::now().timestamp();
        TokenPayload {
            not_before: now - 5,
            expires_at: now + 600,
            issued_at: None,
            user_id: UserId::Numeric(1),
            server_uuid: server_uuid.to_string(),
            permissions: permissions.iter().map(|p| p.to_string()).collect(),
        }
    }

    fn server_with(env: Arc<MockEnvironment>) -> Arc<Server> {
        Arc::new(Server::new("srv-a".to_string(), env, None))
    }

    async fn connect(server: Arc<Server>, token: TokenPayload) -> (Client, JoinHandle<AgentResult<()>>) {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let task = tokio::spawn(async move {
            let socket = WebSocketStream::from_raw_socket(server_io, Role::Server, None).await;
            handle_connection(server, token, socket).await
        });
        let client = WebSocketStream::from_raw_socket(client_io, Role::Client, None).await;
        (client, task)
    }

    async fn next_message(client: &mut Client) -> WebSocketMessage {
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(5), client.next())
                .await
                .expect("timed out waiting for a frame")
                .expect("socket closed")
                .expect("socket error");
            if let Message::Text(text) = frame {
                return serde_json::from_str(text.as_str()).unwrap();
            }
        }
    }

    async fn send(client: &mut Client, text: &str) {
        client.send(Message::Text(text.to_string().into())).await.unwrap();
    }

    async fn finish(task: JoinHandle<AgentResult<()>>) -> AgentResult<()> {
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("connection did not terminate")
            .unwrap()
    }

    fn listeners(server: &Server) -> [usize; 3] {
        [
            server.events().listener_count(STATUS_EVENT),
            server.events().listener_count(CONSOLE_OUTPUT_EVENT),
            server.events().listener_count(STATS_EVENT),
        ]
    }

    #[test]
    fn test_decoded_messages_are_inbound() {
        let message = WebSocketMessage::decode_inbound(br#"{"event":"send logs"}"#).unwrap();
        assert!(message.is_inbound());
        assert!(message.args.is_empty());
        assert!(!WebSocketMessage::outbound(STATUS_EVENT, "running").is_inbound());
        assert!(WebSocketMessage::decode_inbound(b"not json").is_err());
    }

    #[test]
    fn test_outbound_wire_shape() {
        let message = WebSocketMessage::outbound(CONSOLE_OUTPUT_EVENT, "hello");
        assert_eq!(
            serde_json::to_string(&message).unwrap(),
            r#"{"event":"console output","args":["hello"]}"#
        );
    }

    #[test]
    fn test_power_action_parse() {
        assert_eq!(PowerAction::parse("kill"), Some(PowerAction::Kill));
        assert_eq!(PowerAction::parse("restart"), Some(PowerAction::Restart));
        assert_eq!(PowerAction::parse("KILL"), None);
        assert_eq!(PowerAction::parse(""), None);
    }

    #[test]
    fn test_close_code_classification() {
        for code in [
            CloseCode::Normal,
            CloseCode::Away,
            CloseCode::Status,
            CloseCode::Restart,
            CloseCode::Abnormal,
        ] {
            assert!(is_expected_close_code(code));
        }
        assert!(!is_expected_close_code(CloseCode::Protocol));
        assert!(!is_expected_close_code(CloseCode::Policy));
        assert!(!is_expected_close_code(CloseCode::Library(4000)));

        assert!(is_expected_disconnect(&WsError::ConnectionClosed));
        assert!(is_expected_disconnect(&WsError::Protocol(
            ProtocolError::ResetWithoutClosingHandshake
        )));
        assert!(is_expected_disconnect(&WsError::Io(std::io::Error::from(
            std::io::ErrorKind::ConnectionReset
        ))));
        assert!(!is_expected_disconnect(&WsError::Io(std::io::Error::from(
            std::io::ErrorKind::PermissionDenied
        ))));
    }

    #[tokio::test]
    async fn test_initial_status_and_event_forwarding() {
        let env = Arc::new(MockEnvironment::new());
        let server = server_with(env);
        server.set_state(ProcessState::Running).await;

        let (mut client, _task) = connect(server.clone(), token("srv-a", &[PERMISSION_CONNECT])).await;

        let status = next_message(&mut client).await;
        assert_eq!(status.event, STATUS_EVENT);
        assert_eq!(status.args, vec!["running"]);
        assert_eq!(listeners(&server), [1, 1, 1]);

        server.events().emit(CONSOLE_OUTPUT_EVENT, "[INFO] Done").await;
        server.events().emit(STATS_EVENT, r#"{"memory_bytes":1}"#).await;
        server.set_state(ProcessState::Stopping).await;

        let console = next_message(&mut client).await;
        assert_eq!((console.event.as_str(), console.args[0].as_str()), (CONSOLE_OUTPUT_EVENT, "[INFO] Done"));
        let stats = next_message(&mut client).await;
        assert_eq!((stats.event.as_str(), stats.args[0].as_str()), (STATS_EVENT, r#"{"memory_bytes":1}"#));
        let status = next_message(&mut client).await;
        assert_eq!((status.event.as_str(), status.args[0].as_str()), (STATUS_EVENT, "stopping"));
    }

    #[tokio::test]
    async fn test_command_without_permission_is_ignored() {
        let env = Arc::new(MockEnvironment::new());
        env.set_running(true);
        *env.logs.lock() = vec!["barrier".to_string()];
        let server = server_with(env.clone());

        let (mut client, task) = connect(server, token("srv-a", &[PERMISSION_CONNECT])).await;
        next_message(&mut client).await;

        send(&mut client, r#"{"event":"send command","args":["stop"]}"#).await;
        send(&mut client, r#"{"event":"set state","args":["kill"]}"#).await;
        send(&mut client, r#"{"event":"send logs","args":[]}"#).await;

        let line = next_message(&mut client).await;
        assert_eq!(line.args, vec!["barrier"]);
        assert_eq!(env.calls(), vec![format!("read_log:{}", LOG_DUMP_MAX_BYTES)]);
        assert!(!task.is_finished());
    }

    #[tokio::test]
    async fn test_command_with_permission_joins_args() {
        let env = Arc::new(MockEnvironment::new());
        env.set_running(true);
        let server = server_with(env.clone());

        let (mut client, _task) = connect(
            server,
            token("srv-a", &[PERMISSION_CONNECT, PERMISSION_SEND_COMMAND]),
        )
        .await;
        next_message(&mut client).await;

        send(&mut client, r#"{"event":"send command","args":["say ","hello"]}"#).await;
        send(&mut client, r#"{"event":"send logs"}"#).await;
        // empty log dump; wait for the read_log call as a barrier
        for _ in 0..50 {
            if env.calls().len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(
            env.calls(),
            vec!["command:say hello".to_string(), format!("read_log:{}", LOG_DUMP_MAX_BYTES)]
        );
    }

    #[tokio::test]
    async fn test_failed_kill_closes_connection_and_unsubscribes() {
        let env = Arc::new(MockEnvironment::new());
        *env.fail_with.lock() = Some("no such container".to_string());
        let server = server_with(env.clone());

        let (mut client, task) = connect(
            server.clone(),
            token("srv-a", &[PERMISSION_CONNECT, PERMISSION_SEND_POWER]),
        )
        .await;
        next_message(&mut client).await;
        assert_eq!(listeners(&server), [1, 1, 1]);

        send(&mut client, r#"{"event":"set state","args":["kill"]}"#).await;

        let result = finish(task).await;
        assert!(matches!(result, Err(AgentError::ContainerError(_))));
        assert_eq!(env.calls(), vec!["terminate:SIGKILL"]);
        assert_eq!(listeners(&server), [0, 0, 0]);
    }

    #[tokio::test]
    async fn test_power_actions_dispatch() {
        let env = Arc::new(MockEnvironment::new());
        let server = server_with(env.clone());

        let (mut client, task) = connect(
            server,
            token("srv-a", &[PERMISSION_CONNECT, PERMISSION_SEND_POWER]),
        )
        .await;
        next_message(&mut client).await;

        for action in ["start", "restart", "reboot", "stop", "kill"] {
            send(&mut client, &format!(r#"{{"event":"set state","args":["{}"]}}"#, action)).await;
        }
        send(&mut client, r#"{"event":"set state","args":["ki","ll"]}"#).await;
        send(&mut client, r#"{"event":"unknown thing","args":["x"]}"#).await;

        client.close(None).await.unwrap();
        finish(task).await.unwrap();
        assert_eq!(
            env.calls(),
            vec!["start", "stop", "terminate:SIGKILL", "terminate:SIGKILL"]
        );
    }

    #[tokio::test]
    async fn test_power_actions_announce_transitions() {
        let env = Arc::new(MockEnvironment::new());
        let server = server_with(env.clone());

        let (mut client, _task) = connect(
            server.clone(),
            token("srv-a", &[PERMISSION_CONNECT, PERMISSION_SEND_POWER]),
        )
        .await;
        next_message(&mut client).await;

        send(&mut client, r#"{"event":"set state","args":["start"]}"#).await;
        assert_eq!(next_message(&mut client).await.args, vec!["starting"]);

        server.set_state(ProcessState::Running).await;
        assert_eq!(next_message(&mut client).await.args, vec!["running"]);

        send(&mut client, r#"{"event":"set state","args":["stop"]}"#).await;
        assert_eq!(next_message(&mut client).await.args, vec!["stopping"]);
        assert_eq!(env.calls(), vec!["start", "stop"]);
    }

    #[tokio::test]
    async fn test_failed_start_falls_back_to_offline() {
        let env = Arc::new(MockEnvironment::new());
        *env.fail_with.lock() = Some("image missing".to_string());
        let server = server_with(env.clone());

        let (mut client, task) = connect(
            server.clone(),
            token("srv-a", &[PERMISSION_CONNECT, PERMISSION_SEND_POWER]),
        )
        .await;
        next_message(&mut client).await;

        send(&mut client, r#"{"event":"set state","args":["start"]}"#).await;
        assert_eq!(next_message(&mut client).await.args, vec!["starting"]);
        assert_eq!(next_message(&mut client).await.args, vec!["offline"]);

        assert!(finish(task).await.is_err());
        assert_eq!(server.state(), ProcessState::Offline);
    }

    #[tokio::test]
    async fn test_malformed_frame_keeps_connection_open() {
        let env = Arc::new(MockEnvironment::new());
        env.set_running(true);
        *env.logs.lock() = vec!["line one".to_string(), "line two".to_string()];
        let server = server_with(env.clone());

        let (mut client, task) = connect(server, token("srv-a", &[PERMISSION_CONNECT])).await;
        next_message(&mut client).await;

        send(&mut client, "this is not json").await;
        send(&mut client, r#"{"event":42}"#).await;
        send(&mut client, r#"{"event":"send logs","args":[]}"#).await;

        let first = next_message(&mut client).await;
        let second = next_message(&mut client).await;
        assert_eq!(first.event, CONSOLE_OUTPUT_EVENT);
        assert_eq!(first.args, vec!["line one"]);
        assert_eq!(second.args, vec!["line two"]);
        assert!(!task.is_finished());
    }

    #[tokio::test]
    async fn test_send_logs_noop_when_offline() {
        let env = Arc::new(MockEnvironment::new());
        *env.logs.lock() = vec!["stale".to_string()];
        let server = server_with(env.clone());

        let (mut client, _task) = connect(server.clone(), token("srv-a", &[PERMISSION_CONNECT])).await;
        next_message(&mut client).await;

        send(&mut client, r#"{"event":"send logs"}"#).await;
        // let the frame be processed before the marker is emitted
        tokio::time::sleep(Duration::from_millis(100)).await;
        server.events().emit(CONSOLE_OUTPUT_EVENT, "marker").await;

        let next = next_message(&mut client).await;
        assert_eq!(next.args, vec!["marker"]);
        assert!(env.calls().is_empty());
    }

    #[tokio::test]
    async fn test_token_for_other_server_cannot_act() {
        let env = Arc::new(MockEnvironment::new());
        env.set_running(true);
        let server = server_with(env.clone());

        let (mut client, task) = connect(
            server,
            token("srv-b", &[PERMISSION_CONNECT, PERMISSION_SEND_POWER, PERMISSION_SEND_COMMAND]),
        )
        .await;
        next_message(&mut client).await;

        send(&mut client, r#"{"event":"set state","args":["stop"]}"#).await;
        send(&mut client, r#"{"event":"send command","args":["op me"]}"#).await;
        send(&mut client, r#"{"event":"send logs"}"#).await;

        client.close(None).await.unwrap();
        finish(task).await.unwrap();
        assert!(env.calls().is_empty());
    }

    #[tokio::test]
    async fn test_expired_token_is_ignored_but_connection_stays() {
        let env = Arc::new(MockEnvironment::new());
        let server = server_with(env.clone());
        let mut expired = token("srv-a", &[PERMISSION_CONNECT, PERMISSION_SEND_POWER]);
        expired.expires_at = chrono::Utc::now().timestamp() - 120;

        let (mut client, task) = connect(server.clone(), expired).await;
        next_message(&mut client).await;

        send(&mut client, r#"{"event":"set state","args":["start"]}"#).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        server.events().emit(STATUS_EVENT, "starting").await;

        let status = next_message(&mut client).await;
        assert_eq!(status.args, vec!["starting"]);
        assert!(env.calls().is_empty());
        assert!(!task.is_finished());
    }

    #[tokio::test]
    async fn test_client_close_cleans_up() {
        let env = Arc::new(MockEnvironment::new());
        let server = server_with(env);

        let (mut client, task) = connect(server.clone(), token("srv-a", &[PERMISSION_CONNECT])).await;
        next_message(&mut client).await;

        client
            .close(Some(CloseFrame {
                code: CloseCode::Away,
                reason: "bye".into(),
            }))
            .await
            .unwrap();

        finish(task).await.unwrap();
        assert_eq!(listeners(&server), [0, 0, 0]);
    }

    #[tokio::test]
    async fn test_outbound_message_rejected_as_request() {
        let env = Arc::new(MockEnvironment::new());
        let server = server_with(env.clone());
        let (client_io, _server_io) = tokio::io::duplex(1024);
        let socket = WebSocketStream::from_raw_socket(client_io, Role::Server, None).await;
        let (write, _read) = socket.split();
        let handler = WebSocketHandler::new(
            server,
            token("srv-a", &[PERMISSION_CONNECT, PERMISSION_SEND_POWER]),
            SocketWriter::new(write),
        );

        let message = WebSocketMessage::outbound(SET_STATE_EVENT, "kill");
        assert!(handler.handle_inbound(message).await.is_err());
        assert!(env.calls().is_empty());
    }
}
