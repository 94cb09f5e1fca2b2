use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use thiserror::Error;
use url::Url;

use crate::error::{classify_http_status, ErrorKind};
use crate::net::codec::{CodecError, TransportCodec};
use crate::net::sio::{
    encode_event, parse_engine, parse_socket, EnginePacket, Event, EventData, PendingBinary,
    SocketPacket, CONNECT_PACKET, DISCONNECT_PACKET, PONG_PACKET,
};
use crate::net::ws::{Connector, MessageRead, MessageWrite, WsError, WsMessage};

pub const EVENT_FIELD_ENTER: &str = "/field/enter/v3";
pub const EVENT_FIELD_OBJECTS: &str = "/field/objects/v4";
/// Synthetic event delivered when the channel drops without a local disconnect.
pub const EVENT_DISCONNECT: &str = "disconnect";

pub const CMD_FIELD_ENTER: &str = "/field/enter/v3";
pub const CMD_ZONE_ENTER: &str = "/zone/enter/list/v4";
pub const CMD_ZONE_LEAVE: &str = "/zone/leave/list/v2";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Entered,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("invalid field url: {0}")]
    Url(String),
    #[error("push channel connect failed: {0}")]
    Connect(#[source] WsError),
    #[error("push channel handshake failed: {0}")]
    Handshake(String),
    #[error("push channel rejected the session: {0}")]
    Rejected(String),
    #[error("push channel is not connected")]
    NotConnected,
    #[error("push channel write failed: {0}")]
    Write(#[source] WsError),
    #[error("payload encoding failed: {0}")]
    Codec(#[from] CodecError),
    #[error("session lock poisoned")]
    Poisoned,
    #[error("failed to start session reader: {0}")]
    Spawn(#[source] std::io::Error),
}

impl SessionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SessionError::Connect(WsError::Handshake { status, .. }) => {
                classify_http_status(*status)
            }
            SessionError::Rejected(reason) => {
                ErrorKind::from_known_code(reason).unwrap_or(ErrorKind::Unclassified)
            }
            _ => ErrorKind::Unclassified,
        }
    }
}

/// Command payload: sent as-is, or run through the session's codec first.
#[derive(Debug, Clone)]
pub enum Payload {
    Plain(Value),
    Encoded(Value),
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub handshake_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

pub type Handler = Arc<dyn Fn(&Event) + Send + Sync>;

type Handlers = Arc<Mutex<HashMap<String, Vec<Handler>>>>;
type SharedWriter = Arc<Mutex<Option<Box<dyn MessageWrite>>>>;

#[derive(Debug)]
struct SessionShared {
    state: SessionState,
    world_id: Option<i64>,
}

/// Push-channel URL for a field server: `<base>/socket.io/?token=..&EIO=4&transport=websocket`.
pub fn channel_url(field_url: &str, token: &str) -> Result<Url, SessionError> {
    let mut url = Url::parse(field_url).map_err(|err| SessionError::Url(err.to_string()))?;
    url.set_path("/socket.io/");
    url.query_pairs_mut()
        .clear()
        .append_pair("token", token)
        .append_pair("EIO", "4")
        .append_pair("transport", "websocket");
    Ok(url)
}

/// One connection to the field push channel.
pub struct SessionClient {
    connector: Arc<dyn Connector>,
    config: SessionConfig,
    codec: TransportCodec,
    handlers: Handlers,
    shared: Arc<Mutex<SessionShared>>,
    writer: SharedWriter,
    stop: Arc<AtomicBool>,
    reader: Option<thread::JoinHandle<()>>,
}

impl SessionClient {
    pub fn new(connector: Arc<dyn Connector>, config: SessionConfig, codec: TransportCodec) -> Self {
        Self {
            connector,
            config,
            codec,
            handlers: Arc::new(Mutex::new(HashMap::new())),
            shared: Arc::new(Mutex::new(SessionShared {
                state: SessionState::Disconnected,
                world_id: None,
            })),
            writer: Arc::new(Mutex::new(None)),
            stop: Arc::new(AtomicBool::new(false)),
            reader: None,
        }
    }

    /// Registers `handler` for `event`; handlers run on the reader thread.
    pub fn subscribe<F>(&self, event: &str, handler: F)
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        if let Ok(mut handlers) = self.handlers.lock() {
            handlers
                .entry(event.to_string())
                .or_default()
                .push(Arc::new(handler));
        }
    }

    pub fn state(&self) -> SessionState {
        self.shared
            .lock()
            .map(|shared| shared.state)
            .unwrap_or(SessionState::Disconnected)
    }

    pub fn world_id(&self) -> Option<i64> {
        self.shared.lock().ok().and_then(|shared| shared.world_id)
    }

    pub fn codec(&self) -> &TransportCodec {
        &self.codec
    }

    pub fn connect(&mut self, field_url: &str, token: &str) -> Result<(), SessionError> {
        self.disconnect();
        let url = channel_url(field_url, token)?;
        self.set_state(SessionState::Connecting);
        match self.open(&url) {
            Ok(()) => {
                self.set_state(SessionState::Connected);
                log::info!("push channel connected to {}", url.host_str().unwrap_or("?"));
                Ok(())
            }
            Err(err) => {
                self.set_state(SessionState::Disconnected);
                Err(err)
            }
        }
    }

    fn open(&mut self, url: &Url) -> Result<(), SessionError> {
        let (mut reader, mut writer) = self.connector.open(url).map_err(SessionError::Connect)?;
        let deadline = Instant::now() + self.config.handshake_timeout;

        wait_for(reader.as_mut(), writer.as_mut(), deadline, |packet| {
            matches!(packet, Handshake::Open)
        })?;
        writer
            .write_message(&WsMessage::Text(CONNECT_PACKET.to_string()))
            .map_err(SessionError::Write)?;
        wait_for(reader.as_mut(), writer.as_mut(), deadline, |packet| {
            matches!(packet, Handshake::Connected)
        })?;

        let writer = {
            let mut slot = self.writer.lock().map_err(|_| SessionError::Poisoned)?;
            *slot = Some(writer);
            Arc::clone(&self.writer)
        };
        self.stop = Arc::new(AtomicBool::new(false));
        let handlers = Arc::clone(&self.handlers);
        let shared = Arc::clone(&self.shared);
        let stop = Arc::clone(&self.stop);
        let handle = thread::Builder::new()
            .name("session-reader".to_string())
            .spawn(move || reader_loop(reader, writer, handlers, shared, stop))
            .map_err(SessionError::Spawn)?;
        self.reader = Some(handle);
        Ok(())
    }

    pub fn emit(&self, command: &str, payload: Payload) -> Result<(), SessionError> {
        let data = match payload {
            Payload::Plain(value) => value,
            Payload::Encoded(value) => Value::String(self.codec.encode(&value)?),
        };
        log::debug!("emit {command}");
        send(&self.writer, WsMessage::Text(encode_event(command, &data)))
    }

    /// Records the field entry acknowledged by the server.
    pub fn mark_entered(&self, world_id: i64) {
        if let Ok(mut shared) = self.shared.lock() {
            shared.state = SessionState::Entered;
            shared.world_id = Some(world_id);
        }
    }

    /// Closes the channel and joins the reader; safe to call in any state.
    pub fn disconnect(&mut self) {
        self.stop.store(true, Ordering::Release);
        let writer = self.writer.lock().ok().and_then(|mut slot| slot.take());
        if let Some(mut writer) = writer {
            let _ = writer.write_message(&WsMessage::Text(DISCONNECT_PACKET.to_string()));
            writer.close();
            log::info!("push channel disconnected");
        }
        if let Some(handle) = self.reader.take() {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
        if let Ok(mut shared) = self.shared.lock() {
            shared.state = SessionState::Disconnected;
            shared.world_id = None;
        }
    }

    fn set_state(&self, state: SessionState) {
        if let Ok(mut shared) = self.shared.lock() {
            shared.state = state;
        }
    }
}

impl Drop for SessionClient {
    fn drop(&mut self) {
        self.disconnect();
    }
}

enum Handshake {
    Open,
    Connected,
    Other,
}

fn wait_for(
    reader: &mut dyn MessageRead,
    writer: &mut dyn MessageWrite,
    deadline: Instant,
    done: impl Fn(&Handshake) -> bool,
) -> Result<(), SessionError> {
    loop {
        if Instant::now() >= deadline {
            return Err(SessionError::Handshake("timed out".to_string()));
        }
        let text = match reader.read_message() {
            Ok(WsMessage::Text(text)) => text,
            Ok(WsMessage::Ping(data)) => {
                writer
                    .write_message(&WsMessage::Pong(data))
                    .map_err(SessionError::Write)?;
                continue;
            }
            Ok(WsMessage::Close) => {
                return Err(SessionError::Handshake("closed by server".to_string()))
            }
            Ok(_) | Err(WsError::Timeout) => continue,
            Err(err) => return Err(SessionError::Handshake(err.to_string())),
        };
        let step = match parse_engine(&text) {
            Ok(EnginePacket::Open(_)) => Handshake::Open,
            Ok(EnginePacket::Ping(payload)) => {
                writer
                    .write_message(&WsMessage::Text(format!("{PONG_PACKET}{payload}")))
                    .map_err(SessionError::Write)?;
                Handshake::Other
            }
            Ok(EnginePacket::Close) => {
                return Err(SessionError::Handshake("closed by server".to_string()))
            }
            Ok(EnginePacket::Message(message)) => match parse_socket(&message) {
                Ok(SocketPacket::Connect(_)) => Handshake::Connected,
                Ok(SocketPacket::ConnectError(value)) => {
                    return Err(SessionError::Rejected(rejection_reason(&value)))
                }
                _ => Handshake::Other,
            },
            Ok(_) => Handshake::Other,
            Err(err) => return Err(SessionError::Handshake(err.to_string())),
        };
        if done(&step) {
            return Ok(());
        }
    }
}

fn rejection_reason(value: &Value) -> String {
    let field = value
        .get("message")
        .or_else(|| value.get("code"))
        .unwrap_or(value);
    match field {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

fn send(writer: &SharedWriter, message: WsMessage) -> Result<(), SessionError> {
    let mut slot = writer.lock().map_err(|_| SessionError::Poisoned)?;
    let writer = slot.as_mut().ok_or(SessionError::NotConnected)?;
    writer.write_message(&message).map_err(SessionError::Write)
}

fn dispatch(handlers: &Handlers, event: &Event) {
    let targets: Vec<Handler> = match handlers.lock() {
        Ok(handlers) => handlers.get(&event.name).cloned().unwrap_or_default(),
        Err(_) => return,
    };
    for handler in targets {
        handler(event);
    }
}

enum Flow {
    Continue,
    Closed(String),
}

fn reader_loop(
    mut reader: Box<dyn MessageRead>,
    writer: SharedWriter,
    handlers: Handlers,
    shared: Arc<Mutex<SessionShared>>,
    stop: Arc<AtomicBool>,
) {
    let mut pending: Option<PendingBinary> = None;
    let reason = loop {
        if stop.load(Ordering::Acquire) {
            return;
        }
        match reader.read_message() {
            Err(WsError::Timeout) => {}
            Err(err) => break err.to_string(),
            Ok(WsMessage::Close) => break "closed by server".to_string(),
            Ok(WsMessage::Ping(data)) => {
                let _ = send(&writer, WsMessage::Pong(data));
            }
            Ok(WsMessage::Pong(_)) => {}
            Ok(WsMessage::Binary(bytes)) => match pending.as_mut() {
                Some(event) => {
                    event.push(bytes);
                    if event.is_complete() {
                        if let Some(event) = pending.take() {
                            dispatch(&handlers, &event.finish());
                        }
                    }
                }
                None => log::debug!("dropping unexpected binary frame ({} bytes)", bytes.len()),
            },
            Ok(WsMessage::Text(text)) => {
                if let Flow::Closed(reason) = handle_text(&text, &writer, &handlers, &mut pending) {
                    break reason;
                }
            }
        }
    };

    if let Ok(mut shared) = shared.lock() {
        shared.state = SessionState::Disconnected;
    }
    if stop.load(Ordering::Acquire) {
        return;
    }
    log::warn!("push channel lost: {reason}");
    dispatch(
        &handlers,
        &Event {
            name: EVENT_DISCONNECT.to_string(),
            data: EventData::new(json!(reason)),
        },
    );
}

fn handle_text(
    text: &str,
    writer: &SharedWriter,
    handlers: &Handlers,
    pending: &mut Option<PendingBinary>,
) -> Flow {
    let message = match parse_engine(text) {
        Ok(EnginePacket::Ping(payload)) => {
            let _ = send(writer, WsMessage::Text(format!("{PONG_PACKET}{payload}")));
            return Flow::Continue;
        }
        Ok(EnginePacket::Close) => return Flow::Closed("engine close".to_string()),
        Ok(EnginePacket::Message(message)) => message,
        Ok(_) => return Flow::Continue,
        Err(err) => {
            log::debug!("ignoring engine packet: {err}");
            return Flow::Continue;
        }
    };
    match parse_socket(&message) {
        Ok(SocketPacket::Event { name, data }) => {
            dispatch(
                handlers,
                &Event {
                    name,
                    data: EventData::new(data),
                },
            );
        }
        Ok(SocketPacket::BinaryEvent {
            attachments,
            name,
            data,
        }) => {
            let event = PendingBinary::new(name, data, attachments);
            if event.is_complete() {
                dispatch(handlers, &event.finish());
            } else {
                *pending = Some(event);
            }
        }
        Ok(SocketPacket::Disconnect) => return Flow::Closed("namespace disconnected".to_string()),
        Ok(_) => {}
        Err(err) => log::debug!("ignoring socket packet: {err}"),
    }
    Flow::Continue
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FatalKind;
    use crate::net::testing::{FakeConnector, FakeServerOptions};
    use crate::net::xor::XorKey;
    use crossbeam_channel::unbounded;

    fn codec() -> TransportCodec {
        TransportCodec::new(XorKey::from_bytes(b"k").expect("key"))
    }

    #[test]
    fn channel_url_carries_token_and_transport() {
        let url = channel_url("https://field.example.com", "abc").expect("url");
        assert_eq!(
            url.as_str(),
            "https://field.example.com/socket.io/?token=abc&EIO=4&transport=websocket"
        );
        assert!(matches!(channel_url("not a url", "t"), Err(SessionError::Url(_))));
    }

    #[test]
    fn connect_emit_and_disconnect() {
        let connector = FakeConnector::new(codec(), FakeServerOptions::default());
        let log = connector.command_log();
        let mut client = SessionClient::new(Arc::new(connector), SessionConfig::default(), codec());
        assert_eq!(client.state(), SessionState::Disconnected);
        assert!(matches!(
            client.emit(CMD_ZONE_LEAVE, Payload::Plain(json!({}))),
            Err(SessionError::NotConnected)
        ));

        let (tx, rx) = unbounded();
        client.subscribe(EVENT_FIELD_ENTER, move |event| {
            let _ = tx.send(event.data.value.clone());
        });
        client.connect("ws://fake.local", "token").expect("connect");
        assert_eq!(client.state(), SessionState::Connected);

        client
            .emit(CMD_FIELD_ENTER, Payload::Encoded(json!({"token": "token"})))
            .expect("emit");
        let ack = rx.recv_timeout(Duration::from_secs(5)).expect("field enter ack");
        let loc = codec().decode(ack.as_str().expect("encoded ack")).expect("decode");
        assert_eq!(loc["loc"][0], 24);

        client.mark_entered(24);
        assert_eq!(client.state(), SessionState::Entered);
        assert_eq!(client.world_id(), Some(24));

        client.disconnect();
        client.disconnect();
        assert_eq!(client.state(), SessionState::Disconnected);
        assert!(log.commands().iter().any(|(name, _)| name == CMD_FIELD_ENTER));
    }

    #[test]
    fn lost_channel_emits_disconnect_event() {
        let connector = FakeConnector::new(codec(), FakeServerOptions {
            drop_after_enter: true,
            ..FakeServerOptions::default()
        });
        let mut client = SessionClient::new(Arc::new(connector), SessionConfig::default(), codec());
        let (tx, rx) = unbounded();
        client.subscribe(EVENT_DISCONNECT, move |_| {
            let _ = tx.send(());
        });
        client.connect("ws://fake.local", "token").expect("connect");
        client
            .emit(CMD_FIELD_ENTER, Payload::Encoded(json!({"token": "token"})))
            .expect("emit");
        rx.recv_timeout(Duration::from_secs(5)).expect("disconnect event");
        client.disconnect();
    }

    #[test]
    fn upgrade_status_maps_to_error_kind() {
        let connector = FakeConnector::new(codec(), FakeServerOptions {
            reject_status: Some(401),
            ..FakeServerOptions::default()
        });
        let mut client = SessionClient::new(Arc::new(connector), SessionConfig::default(), codec());
        let err = client.connect("ws://fake.local", "token").expect_err("rejected");
        assert_eq!(err.kind(), ErrorKind::Fatal(FatalKind::NoAuth));
        assert_eq!(client.state(), SessionState::Disconnected);
    }

    #[test]
    fn namespace_rejection_uses_service_code() {
        let connector = FakeConnector::new(codec(), FakeServerOptions {
            connect_error: Some("no_auth".to_string()),
            ..FakeServerOptions::default()
        });
        let mut client = SessionClient::new(Arc::new(connector), SessionConfig::default(), codec());
        let err = client.connect("ws://fake.local", "token").expect_err("rejected");
        assert!(matches!(&err, SessionError::Rejected(reason) if reason == "no_auth"));
        assert_eq!(err.kind(), ErrorKind::Fatal(FatalKind::NoAuth));
        assert_eq!(
            SessionError::Rejected("weird".to_string()).kind(),
            ErrorKind::Unclassified
        );
    }
}
