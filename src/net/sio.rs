use serde_json::{json, Value};
use thiserror::Error;

/// Socket.IO namespace connect request (Engine.IO message + Socket.IO CONNECT).
pub const CONNECT_PACKET: &str = "40";
pub const DISCONNECT_PACKET: &str = "41";
pub const PONG_PACKET: &str = "3";

#[derive(Debug, Error)]
pub enum SioError {
    #[error("empty packet")]
    Empty,
    #[error("unknown packet type '{0}'")]
    UnknownType(char),
    #[error("malformed packet: {0}")]
    Malformed(String),
    #[error("packet payload is not json: {0}")]
    Json(#[from] serde_json::Error),
}

/// Transport-level (Engine.IO v4) text packet.
#[derive(Debug, Clone, PartialEq)]
pub enum EnginePacket {
    Open(Value),
    Close,
    Ping(String),
    Pong(String),
    Message(String),
    Upgrade,
    Noop,
}

pub fn parse_engine(text: &str) -> Result<EnginePacket, SioError> {
    let mut chars = text.chars();
    let kind = chars.next().ok_or(SioError::Empty)?;
    let rest = chars.as_str();
    match kind {
        '0' => Ok(EnginePacket::Open(serde_json::from_str(rest)?)),
        '1' => Ok(EnginePacket::Close),
        '2' => Ok(EnginePacket::Ping(rest.to_string())),
        '3' => Ok(EnginePacket::Pong(rest.to_string())),
        '4' => Ok(EnginePacket::Message(rest.to_string())),
        '5' => Ok(EnginePacket::Upgrade),
        '6' => Ok(EnginePacket::Noop),
        other => Err(SioError::UnknownType(other)),
    }
}

/// Socket.IO v5 packet carried inside an Engine.IO message.
#[derive(Debug, Clone, PartialEq)]
pub enum SocketPacket {
    Connect(Value),
    Disconnect,
    Event { name: String, data: Value },
    Ack { id: Option<u64> },
    ConnectError(Value),
    /// Event whose binary parts follow as `attachments` separate frames.
    BinaryEvent {
        attachments: usize,
        name: String,
        data: Value,
    },
}

struct TextCursor<'a> {
    text: &'a str,
    pos: usize,
}

impl<'a> TextCursor<'a> {
    fn new(text: &'a str) -> Self {
        Self { text, pos: 0 }
    }

    fn peek(&self) -> Option<u8> {
        self.text.as_bytes().get(self.pos).copied()
    }

    fn next(&mut self) -> Option<u8> {
        let byte = self.peek()?;
        self.pos += 1;
        Some(byte)
    }

    fn read_number(&mut self) -> Option<u64> {
        let start = self.pos;
        while self.peek().is_some_and(|byte| byte.is_ascii_digit()) {
            self.pos += 1;
        }
        self.text[start..self.pos].parse().ok()
    }

    fn skip_namespace(&mut self) {
        if self.peek() != Some(b'/') {
            return;
        }
        match self.text[self.pos..].find(',') {
            Some(offset) => self.pos += offset + 1,
            None => self.pos = self.text.len(),
        }
    }

    fn rest(&self) -> &'a str {
        &self.text[self.pos..]
    }
}

pub fn parse_socket(text: &str) -> Result<SocketPacket, SioError> {
    let mut cursor = TextCursor::new(text);
    let kind = cursor.next().ok_or(SioError::Empty)?;

    let mut attachments = 0usize;
    if kind == b'5' || kind == b'6' {
        attachments = cursor
            .read_number()
            .ok_or_else(|| SioError::Malformed("missing attachment count".to_string()))?
            as usize;
        if cursor.next() != Some(b'-') {
            return Err(SioError::Malformed("missing attachment separator".to_string()));
        }
    }
    cursor.skip_namespace();
    let ack = cursor.read_number();
    let payload = cursor.rest();
    let value = if payload.is_empty() {
        Value::Null
    } else {
        serde_json::from_str(payload)?
    };

    match kind {
        b'0' => Ok(SocketPacket::Connect(value)),
        b'1' => Ok(SocketPacket::Disconnect),
        b'2' => {
            let (name, data) = split_event(value)?;
            Ok(SocketPacket::Event { name, data })
        }
        b'3' | b'6' => Ok(SocketPacket::Ack { id: ack }),
        b'4' => Ok(SocketPacket::ConnectError(value)),
        b'5' => {
            let (name, data) = split_event(value)?;
            Ok(SocketPacket::BinaryEvent {
                attachments,
                name,
                data,
            })
        }
        other => Err(SioError::UnknownType(other as char)),
    }
}

fn split_event(value: Value) -> Result<(String, Value), SioError> {
    let Value::Array(mut args) = value else {
        return Err(SioError::Malformed("event payload is not an array".to_string()));
    };
    if args.is_empty() {
        return Err(SioError::Malformed("event without a name".to_string()));
    }
    let name = match args.remove(0) {
        Value::String(name) => name,
        other => return Err(SioError::Malformed(format!("event name {other} is not a string"))),
    };
    let data = if args.is_empty() {
        Value::Null
    } else {
        args.remove(0)
    };
    Ok((name, data))
}

/// `42["name",data]`: an Engine.IO message carrying a Socket.IO event.
pub fn encode_event(name: &str, data: &Value) -> String {
    format!("42{}", json!([name, data]))
}

/// Event payload plus the binary attachments that arrived with it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventData {
    pub value: Value,
    pub attachments: Vec<Vec<u8>>,
}

impl EventData {
    pub fn new(value: Value) -> Self {
        Self {
            value,
            attachments: Vec::new(),
        }
    }

    /// Bytes stored under `key`: an attachment placeholder, a number array,
    /// or a serialized `{"type":"Buffer","data":[..]}`.
    pub fn bytes(&self, key: &str) -> Option<Vec<u8>> {
        let field = self.value.get(key)?;
        if field.get("_placeholder").and_then(Value::as_bool) == Some(true) {
            let num = field.get("num").and_then(Value::as_u64)? as usize;
            return self.attachments.get(num).cloned();
        }
        let array = match field {
            Value::Array(items) => items,
            Value::Object(map) if map.get("type").and_then(Value::as_str) == Some("Buffer") => {
                map.get("data").and_then(Value::as_array)?
            }
            _ => return None,
        };
        array
            .iter()
            .map(|item| item.as_u64().and_then(|byte| u8::try_from(byte).ok()))
            .collect()
    }
}

/// Event as handed to subscribers.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub name: String,
    pub data: EventData,
}

/// Binary event waiting for its attachment frames.
#[derive(Debug)]
pub struct PendingBinary {
    name: String,
    data: Value,
    expected: usize,
    attachments: Vec<Vec<u8>>,
}

impl PendingBinary {
    pub fn new(name: String, data: Value, expected: usize) -> Self {
        Self {
            name,
            data,
            expected,
            attachments: Vec::with_capacity(expected),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.attachments.len() >= self.expected
    }

    pub fn push(&mut self, attachment: Vec<u8>) {
        self.attachments.push(attachment);
    }

    pub fn finish(self) -> Event {
        Event {
            name: self.name,
            data: EventData {
                value: self.data,
                attachments: self.attachments,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_packets_by_type() {
        match parse_engine("0{\"sid\":\"x\",\"pingInterval\":25000}").expect("open") {
            EnginePacket::Open(value) => assert_eq!(value["sid"], "x"),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(parse_engine("2").expect("ping"), EnginePacket::Ping(String::new()));
        assert_eq!(
            parse_engine("42[\"a\"]").expect("message"),
            EnginePacket::Message("2[\"a\"]".to_string())
        );
        assert!(matches!(parse_engine(""), Err(SioError::Empty)));
        assert!(matches!(parse_engine("9"), Err(SioError::UnknownType('9'))));
    }

    #[test]
    fn socket_events_with_namespace_and_ack() {
        let packet = parse_socket("2/field,17[\"/field/enter/v3\",\"abc\"]").expect("event");
        assert_eq!(
            packet,
            SocketPacket::Event {
                name: "/field/enter/v3".to_string(),
                data: Value::String("abc".to_string())
            }
        );
        assert_eq!(parse_socket("0{\"sid\":\"s\"}").expect("connect"), SocketPacket::Connect(json!({"sid": "s"})));
        assert_eq!(parse_socket("1").expect("disconnect"), SocketPacket::Disconnect);
        assert_eq!(parse_socket("35[]").expect("ack"), SocketPacket::Ack { id: Some(5) });
    }

    #[test]
    fn binary_event_header() {
        let packet = parse_socket(
            "51-[\"/field/objects/v4\",{\"packs\":{\"_placeholder\":true,\"num\":0}}]",
        )
        .expect("binary event");
        let SocketPacket::BinaryEvent {
            attachments,
            name,
            data,
        } = packet
        else {
            panic!("expected binary event");
        };
        assert_eq!(attachments, 1);
        assert_eq!(name, "/field/objects/v4");

        let mut pending = PendingBinary::new(name, data, attachments);
        assert!(!pending.is_complete());
        pending.push(vec![1, 2, 3]);
        assert!(pending.is_complete());
        let event = pending.finish();
        assert_eq!(event.data.bytes("packs"), Some(vec![1, 2, 3]));
    }

    #[test]
    fn malformed_socket_packets() {
        assert!(matches!(parse_socket("5-[]"), Err(SioError::Malformed(_))));
        assert!(matches!(parse_socket("2{\"a\":1}"), Err(SioError::Malformed(_))));
        assert!(matches!(parse_socket("2[1]"), Err(SioError::Malformed(_))));
        assert!(matches!(parse_socket("2[\"x\""), Err(SioError::Json(_))));
    }

    #[test]
    fn inline_byte_shapes() {
        let data = EventData::new(json!({
            "array": [1, 2, 255],
            "buffer": {"type": "Buffer", "data": [9, 8]},
            "bad": [1, 300],
            "missing": {"_placeholder": true, "num": 3}
        }));
        assert_eq!(data.bytes("array"), Some(vec![1, 2, 255]));
        assert_eq!(data.bytes("buffer"), Some(vec![9, 8]));
        assert_eq!(data.bytes("bad"), None);
        assert_eq!(data.bytes("missing"), None);
        assert_eq!(data.bytes("absent"), None);
    }

    #[test]
    fn events_encode_as_engine_messages() {
        assert_eq!(
            encode_event("/zone/leave/list/v2", &json!({"world": 24, "zones": "[]"})),
            "42[\"/zone/leave/list/v2\",{\"world\":24,\"zones\":\"[]\"}]"
        );
    }
}
