//! In-memory push-channel server for tests.

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use serde_json::{json, Value};
use url::Url;

use crate::net::codec::TransportCodec;
use crate::net::session::{
    CMD_FIELD_ENTER, CMD_ZONE_ENTER, CMD_ZONE_LEAVE, EVENT_FIELD_ENTER, EVENT_FIELD_OBJECTS,
};
use crate::net::sio::{encode_event, parse_socket, SocketPacket};
use crate::net::ws::{Connector, MessageRead, MessageWrite, WsError, WsMessage};
use crate::world::objects::OBJECT_CODE_KINGDOM;
use crate::world::zone::{ZoneId, ZoneIndex};

const FAKE_POLL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone)]
pub struct FakeKingdom {
    pub name: String,
    pub tile_x: u32,
    pub tile_y: u32,
}

impl FakeKingdom {
    /// Kingdom placed in the first tile of zone `(zone_x, zone_y)`.
    pub fn in_zone(name: &str, zone_x: u32, zone_y: u32) -> Self {
        Self {
            name: name.to_string(),
            tile_x: zone_x * 32,
            tile_y: zone_y * 32,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FakeServerOptions {
    pub world_id: i64,
    pub kingdoms: Vec<FakeKingdom>,
    pub reject_status: Option<u16>,
    pub connect_error: Option<String>,
    pub silent_enter: bool,
    /// Field entry is acked with this service error code instead of a location.
    pub enter_error: Option<String>,
    /// Every zone enter is answered with this service error code.
    pub objects_error: Option<String>,
    pub drop_after_enter: bool,
    /// Zone-enter commands (0 is the warm-up) answered with an undecodable snapshot.
    pub corrupt_enters: Vec<usize>,
    /// Zone-enter commands from this index on get no snapshot at all.
    pub stall_from_enter: Option<usize>,
}

impl Default for FakeServerOptions {
    fn default() -> Self {
        Self {
            world_id: 24,
            kingdoms: Vec::new(),
            reject_status: None,
            connect_error: None,
            silent_enter: false,
            enter_error: None,
            objects_error: None,
            drop_after_enter: false,
            corrupt_enters: Vec::new(),
            stall_from_enter: None,
        }
    }
}

/// Commands received by the fake server, payloads already decoded.
#[derive(Debug, Clone, Default)]
pub struct CommandLog(Arc<Mutex<Vec<(String, Value)>>>);

impl CommandLog {
    fn push(&self, name: String, data: Value) {
        if let Ok(mut commands) = self.0.lock() {
            commands.push((name, data));
        }
    }

    pub fn commands(&self) -> Vec<(String, Value)> {
        self.0.lock().map(|commands| commands.clone()).unwrap_or_default()
    }

    /// Zone enter/leave commands with their id lists, in arrival order.
    pub fn zone_commands(&self) -> Vec<(String, Vec<ZoneId>)> {
        self.commands()
            .into_iter()
            .filter(|(name, _)| name == CMD_ZONE_ENTER || name == CMD_ZONE_LEAVE)
            .map(|(name, data)| {
                let zones = zones_of(&data);
                (name, zones)
            })
            .collect()
    }
}

fn zones_of(data: &Value) -> Vec<ZoneId> {
    data.get("zones")
        .and_then(Value::as_str)
        .and_then(|text| serde_json::from_str(text).ok())
        .unwrap_or_default()
}

#[derive(Clone)]
pub struct FakeConnector {
    codec: TransportCodec,
    options: FakeServerOptions,
    log: CommandLog,
}

impl FakeConnector {
    pub fn new(codec: TransportCodec, options: FakeServerOptions) -> Self {
        Self {
            codec,
            options,
            log: CommandLog::default(),
        }
    }

    pub fn command_log(&self) -> CommandLog {
        self.log.clone()
    }
}

impl Connector for FakeConnector {
    fn open(&self, _url: &Url) -> Result<(Box<dyn MessageRead>, Box<dyn MessageWrite>), WsError> {
        if let Some(status) = self.options.reject_status {
            return Err(WsError::Handshake {
                status,
                reason: "Unauthorized".to_string(),
            });
        }
        let (to_client, client_rx) = unbounded();
        let (client_tx, from_client) = unbounded();
        let server = FakeServer {
            codec: self.codec.clone(),
            options: self.options.clone(),
            index: ZoneIndex::default(),
            enters: 0,
        };
        thread::spawn(move || server.run(to_client, from_client));
        Ok((
            Box::new(FakeReader { rx: client_rx }),
            Box::new(FakeWriter {
                tx: client_tx,
                codec: self.codec.clone(),
                log: self.log.clone(),
                closed: false,
            }),
        ))
    }
}

struct FakeReader {
    rx: Receiver<WsMessage>,
}

impl MessageRead for FakeReader {
    fn read_message(&mut self) -> Result<WsMessage, WsError> {
        match self.rx.recv_timeout(FAKE_POLL) {
            Ok(message) => Ok(message),
            Err(RecvTimeoutError::Timeout) => Err(WsError::Timeout),
            Err(RecvTimeoutError::Disconnected) => Err(WsError::Closed),
        }
    }
}

// Commands are logged as they are written so the log is complete once an emit returns.
struct FakeWriter {
    tx: Sender<WsMessage>,
    codec: TransportCodec,
    log: CommandLog,
    closed: bool,
}

impl MessageWrite for FakeWriter {
    fn write_message(&mut self, message: &WsMessage) -> Result<(), WsError> {
        if self.closed {
            return Err(WsError::Closed);
        }
        if let WsMessage::Text(text) = message {
            if let Some((name, data)) = command_of(text) {
                self.log.push(name, decode_command(&self.codec, data));
            }
        }
        self.tx.send(message.clone()).map_err(|_| WsError::Closed)
    }

    fn close(&mut self) {
        if !self.closed {
            let _ = self.tx.send(WsMessage::Close);
            self.closed = true;
        }
    }
}

fn command_of(text: &str) -> Option<(String, Value)> {
    match parse_socket(text.strip_prefix('4')?) {
        Ok(SocketPacket::Event { name, data }) => Some((name, data)),
        _ => None,
    }
}

fn decode_command(codec: &TransportCodec, data: Value) -> Value {
    if let Value::String(text) = &data {
        if let Ok(decoded) = codec.decode(text) {
            return decoded;
        }
    }
    data
}

fn refusal(code: &str) -> Value {
    json!({"result": false, "err": {"code": code}})
}

struct FakeServer {
    codec: TransportCodec,
    options: FakeServerOptions,
    index: ZoneIndex,
    enters: usize,
}

impl FakeServer {
    fn run(mut self, tx: Sender<WsMessage>, rx: Receiver<WsMessage>) {
        let open = "0{\"sid\":\"fake\",\"upgrades\":[],\"pingInterval\":25000,\"pingTimeout\":20000}";
        if tx.send(WsMessage::Text(open.to_string())).is_err() {
            return;
        }
        let _ = tx.send(WsMessage::Text("2".to_string()));
        while let Ok(message) = rx.recv() {
            let text = match message {
                WsMessage::Text(text) => text,
                WsMessage::Close => return,
                _ => continue,
            };
            match text.as_str() {
                "40" => {
                    let reply = match &self.options.connect_error {
                        Some(code) => format!("44{}", json!({"message": code})),
                        None => "40{\"sid\":\"fake-ns\"}".to_string(),
                    };
                    let _ = tx.send(WsMessage::Text(reply));
                    continue;
                }
                "41" => return,
                _ => {}
            }
            let Some((name, data)) = command_of(&text) else {
                continue;
            };
            if !self.handle(&tx, name, data) {
                return;
            }
        }
    }

    fn handle(&mut self, tx: &Sender<WsMessage>, name: String, data: Value) -> bool {
        let decoded = decode_command(&self.codec, data);
        match name.as_str() {
            CMD_FIELD_ENTER => {
                if self.options.drop_after_enter {
                    return false;
                }
                if !self.options.silent_enter {
                    let ack = match &self.options.enter_error {
                        Some(code) => refusal(code),
                        None => json!({"loc": [self.options.world_id, 1024, 1024]}),
                    };
                    if let Ok(encoded) = self.codec.encode(&ack) {
                        let _ = tx.send(WsMessage::Text(encode_event(
                            EVENT_FIELD_ENTER,
                            &Value::String(encoded),
                        )));
                    }
                }
            }
            CMD_ZONE_ENTER => {
                let idx = self.enters;
                self.enters += 1;
                if self.options.stall_from_enter.is_some_and(|from| idx >= from) {
                    return true;
                }
                if let Some(code) = &self.options.objects_error {
                    let _ = tx.send(WsMessage::Text(encode_event(EVENT_FIELD_OBJECTS, &refusal(code))));
                    return true;
                }
                let packs = if self.options.corrupt_enters.contains(&idx) {
                    b"definitely not gzip".to_vec()
                } else {
                    let snapshot = self.snapshot(&zones_of(&decoded));
                    match self.codec.encode_packed(&snapshot) {
                        Ok(packs) => packs,
                        Err(_) => return true,
                    }
                };
                let header = format!(
                    "451-{}",
                    json!([EVENT_FIELD_OBJECTS, {"packs": {"_placeholder": true, "num": 0}}])
                );
                let _ = tx.send(WsMessage::Text(header));
                let _ = tx.send(WsMessage::Binary(packs));
            }
            _ => {}
        }
        true
    }

    fn snapshot(&self, zones: &[ZoneId]) -> Value {
        let objects: Vec<Value> = self
            .options
            .kingdoms
            .iter()
            .enumerate()
            .filter(|(_, kingdom)| {
                let (x, y) = self.index.zone_of_tile(kingdom.tile_x, kingdom.tile_y);
                zones.contains(&self.index.to_zone_id(x, y))
            })
            .map(|(idx, kingdom)| {
                json!({
                    "_id": format!("k{idx}"),
                    "code": OBJECT_CODE_KINGDOM,
                    "loc": [self.options.world_id, kingdom.tile_x, kingdom.tile_y],
                    "occupied": {
                        "name": kingdom.name,
                        "allianceTag": "TST",
                        "worldId": self.options.world_id
                    }
                })
            })
            .collect();
        json!({ "objects": objects })
    }
}
