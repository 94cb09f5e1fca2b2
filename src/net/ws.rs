use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64_ENGINE;
use base64::Engine as _;
use rand::RngCore;
use sha1::{Digest, Sha1};
use thiserror::Error;
use url::Url;

use crate::net::tls;

const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";
const MAX_RESPONSE_HEAD_BYTES: usize = 16 * 1024;
const READ_CHUNK_BYTES: usize = 8192;

pub const OPCODE_CONTINUATION: u8 = 0x0;
pub const OPCODE_TEXT: u8 = 0x1;
pub const OPCODE_BINARY: u8 = 0x2;
pub const OPCODE_CLOSE: u8 = 0x8;
pub const OPCODE_PING: u8 = 0x9;
pub const OPCODE_PONG: u8 = 0xa;

#[derive(Debug, Clone)]
pub struct WsConfig {
    pub connect_timeout: Duration,
    pub handshake_timeout: Duration,
    /// Read timeout while connected; bounds how long a reader holds the stream.
    pub poll_interval: Duration,
    pub max_payload: usize,
    pub headers: Vec<(String, String)>,
    pub ca_file: Option<PathBuf>,
}

impl Default for WsConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_millis(50),
            max_payload: 16 * 1024 * 1024,
            headers: default_headers(),
            ca_file: None,
        }
    }
}

/// Browser-like headers the field servers expect on the upgrade request.
pub fn default_headers() -> Vec<(String, String)> {
    [
        ("Accept", "*/*"),
        ("Accept-Language", "en-US,en;q=0.9"),
        ("Cache-Control", "no-cache"),
        ("Origin", "https://play.leagueofkingdoms.com"),
        ("Pragma", "no-cache"),
        (
            "User-Agent",
            "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:109.0) Gecko/20100101 Firefox/114.0",
        ),
    ]
    .into_iter()
    .map(|(name, value)| (name.to_string(), value.to_string()))
    .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WsMessage {
    Text(String),
    Binary(Vec<u8>),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close,
}

#[derive(Debug)]
struct WsFrame {
    fin: bool,
    opcode: u8,
    payload: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum WsError {
    #[error("websocket read timed out")]
    Timeout,
    #[error("websocket connection closed")]
    Closed,
    #[error("websocket io error: {0}")]
    Io(#[from] io::Error),
    #[error("websocket protocol error: {0}")]
    Protocol(String),
    #[error("websocket upgrade rejected with status {status}: {reason}")]
    Handshake { status: u16, reason: String },
    #[error("tls error: {0}")]
    Tls(String),
    #[error("unsupported push channel url: {0}")]
    Url(String),
}

pub trait MessageRead: Send {
    /// Blocks for at most the configured poll interval; `WsError::Timeout`
    /// means nothing arrived yet.
    fn read_message(&mut self) -> Result<WsMessage, WsError>;
}

pub trait MessageWrite: Send {
    fn write_message(&mut self, message: &WsMessage) -> Result<(), WsError>;
    fn close(&mut self);
}

/// Opens the message halves of one push-channel connection.
pub trait Connector: Send + Sync {
    fn open(&self, url: &Url) -> Result<(Box<dyn MessageRead>, Box<dyn MessageWrite>), WsError>;
}

pub trait Stream: Read + Write + Send {}

impl<T: Read + Write + Send> Stream for T {}

type SharedStream = Arc<Mutex<Box<dyn Stream>>>;

#[derive(Debug, Clone, Default)]
pub struct WsConnector {
    config: WsConfig,
}

impl WsConnector {
    pub fn new(config: WsConfig) -> Self {
        Self { config }
    }
}

impl Connector for WsConnector {
    fn open(&self, url: &Url) -> Result<(Box<dyn MessageRead>, Box<dyn MessageWrite>), WsError> {
        let (reader, writer) = connect(url, &self.config)?;
        Ok((Box::new(reader), Box::new(writer)))
    }
}

pub fn connect(url: &Url, config: &WsConfig) -> Result<(WsReader, WsWriter), WsError> {
    let secure = match url.scheme() {
        "ws" | "http" => false,
        "wss" | "https" => true,
        other => return Err(WsError::Url(format!("scheme '{other}' is not supported"))),
    };
    let host = url
        .host_str()
        .ok_or_else(|| WsError::Url(format!("'{url}' has no host")))?;
    let port = url
        .port()
        .unwrap_or(if secure { 443 } else { 80 });
    let addr = (host, port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| WsError::Url(format!("'{host}' did not resolve")))?;

    let tcp = TcpStream::connect_timeout(&addr, config.connect_timeout)?;
    tcp.set_nodelay(true)?;
    tcp.set_read_timeout(Some(config.handshake_timeout))?;
    tcp.set_write_timeout(Some(config.handshake_timeout))?;
    let socket = tcp.try_clone()?;

    let mut stream: Box<dyn Stream> = if secure {
        let tls_config = tls::client_config(config.ca_file.as_deref())?;
        Box::new(tls::wrap(tcp, host, tls_config)?)
    } else {
        Box::new(tcp)
    };
    let leftover = client_handshake(&mut stream, url, config)?;
    socket.set_read_timeout(Some(config.poll_interval))?;

    let shared: SharedStream = Arc::new(Mutex::new(stream));
    Ok((
        WsReader::new(Arc::clone(&shared), leftover, config.max_payload),
        WsWriter::new(shared),
    ))
}

fn client_handshake(
    stream: &mut Box<dyn Stream>,
    url: &Url,
    config: &WsConfig,
) -> Result<Vec<u8>, WsError> {
    let mut nonce = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut nonce);
    let key = BASE64_ENGINE.encode(nonce);

    let host = url.host_str().unwrap_or("localhost");
    let host_header = match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    };
    let mut target = url.path().to_string();
    if let Some(query) = url.query() {
        target.push('?');
        target.push_str(query);
    }

    let mut request = format!(
        "GET {target} HTTP/1.1\r\n\
Host: {host_header}\r\n\
Upgrade: websocket\r\n\
Connection: Upgrade\r\n\
Sec-WebSocket-Key: {key}\r\n\
Sec-WebSocket-Version: 13\r\n"
    );
    for (name, value) in &config.headers {
        request.push_str(&format!("{name}: {value}\r\n"));
    }
    request.push_str("\r\n");
    stream.write_all(request.as_bytes())?;
    stream.flush()?;

    let (head, leftover) = read_http_response(stream.as_mut())?;
    let (status, reason, headers) = parse_response_head(&head)?;
    if status != 101 {
        return Err(WsError::Handshake { status, reason });
    }
    let upgrade = headers
        .get("upgrade")
        .map(|value| value.to_ascii_lowercase())
        .unwrap_or_default();
    if upgrade != "websocket" {
        return Err(WsError::Protocol("upgrade response missing Upgrade: websocket".to_string()));
    }
    let accept = headers
        .get("sec-websocket-accept")
        .ok_or_else(|| WsError::Protocol("missing sec-websocket-accept".to_string()))?;
    if accept.trim() != accept_key(&key) {
        return Err(WsError::Protocol("sec-websocket-accept mismatch".to_string()));
    }
    Ok(leftover)
}

pub fn accept_key(key: &str) -> String {
    let mut sha1 = Sha1::new();
    sha1.update(key.trim().as_bytes());
    sha1.update(WS_GUID.as_bytes());
    BASE64_ENGINE.encode(sha1.finalize())
}

fn read_http_response(stream: &mut dyn Stream) -> Result<(String, Vec<u8>), WsError> {
    let mut data = Vec::new();
    let mut buf = [0u8; 512];
    loop {
        let read = stream.read(&mut buf).map_err(map_ws_read_error)?;
        if read == 0 {
            return Err(WsError::Closed);
        }
        data.extend_from_slice(&buf[..read]);
        if let Some(pos) = data.windows(4).position(|chunk| chunk == b"\r\n\r\n") {
            let leftover = data.split_off(pos + 4);
            return Ok((String::from_utf8_lossy(&data).to_string(), leftover));
        }
        if data.len() > MAX_RESPONSE_HEAD_BYTES {
            return Err(WsError::Protocol("upgrade response exceeded max bytes".to_string()));
        }
    }
}

fn parse_response_head(head: &str) -> Result<(u16, String, HashMap<String, String>), WsError> {
    let mut lines = head.split("\r\n");
    let status_line = lines
        .next()
        .ok_or_else(|| WsError::Protocol("empty upgrade response".to_string()))?;
    let mut parts = status_line.splitn(3, ' ');
    let version = parts.next().unwrap_or("");
    if !version.starts_with("HTTP/1.") {
        return Err(WsError::Protocol(format!("unexpected status line '{status_line}'")));
    }
    let status = parts
        .next()
        .and_then(|code| code.parse::<u16>().ok())
        .ok_or_else(|| WsError::Protocol(format!("unexpected status line '{status_line}'")))?;
    let reason = parts.next().unwrap_or("").trim().to_string();

    let mut headers = HashMap::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((key, value)) = line.split_once(':') {
            headers.insert(key.trim().to_ascii_lowercase(), value.trim().to_string());
        }
    }
    Ok((status, reason, headers))
}

/// Parses one frame from the front of `buf`; `None` means more bytes are needed.
fn parse_frame(buf: &[u8], max_payload: usize) -> Result<Option<(WsFrame, usize)>, WsError> {
    if buf.len() < 2 {
        return Ok(None);
    }
    let fin = (buf[0] & 0x80) != 0;
    let opcode = buf[0] & 0x0f;
    let masked = (buf[1] & 0x80) != 0;
    let mut len = (buf[1] & 0x7f) as u64;
    let mut offset = 2;
    if len == 126 {
        if buf.len() < 4 {
            return Ok(None);
        }
        len = u16::from_be_bytes([buf[2], buf[3]]) as u64;
        offset = 4;
    } else if len == 127 {
        if buf.len() < 10 {
            return Ok(None);
        }
        let mut ext = [0u8; 8];
        ext.copy_from_slice(&buf[2..10]);
        len = u64::from_be_bytes(ext);
        offset = 10;
    }

    if opcode >= 0x8 && (len > 125 || !fin) {
        return Err(WsError::Protocol("invalid control frame".to_string()));
    }
    if len > max_payload as u64 {
        return Err(WsError::Protocol(format!(
            "websocket payload {} exceeds max {}",
            len, max_payload
        )));
    }

    let mut mask = None;
    if masked {
        if buf.len() < offset + 4 {
            return Ok(None);
        }
        mask = Some([buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]]);
        offset += 4;
    }

    let len = len as usize;
    if buf.len() < offset + len {
        return Ok(None);
    }
    let mut payload = buf[offset..offset + len].to_vec();
    if let Some(mask) = mask {
        for (idx, byte) in payload.iter_mut().enumerate() {
            *byte ^= mask[idx % 4];
        }
    }
    Ok(Some((WsFrame { fin, opcode, payload }, offset + len)))
}

fn encode_frame(opcode: u8, payload: &[u8], mask: Option<[u8; 4]>) -> Vec<u8> {
    let len = payload.len();
    let mut frame = Vec::with_capacity(len + 14);
    frame.push(0x80 | (opcode & 0x0f));
    let mask_bit = if mask.is_some() { 0x80 } else { 0 };
    if len < 126 {
        frame.push(mask_bit | len as u8);
    } else if len <= u16::MAX as usize {
        frame.push(mask_bit | 126);
        frame.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        frame.push(mask_bit | 127);
        frame.extend_from_slice(&(len as u64).to_be_bytes());
    }
    match mask {
        Some(mask) => {
            frame.extend_from_slice(&mask);
            frame.extend(payload.iter().enumerate().map(|(idx, byte)| byte ^ mask[idx % 4]));
        }
        None => frame.extend_from_slice(payload),
    }
    frame
}

pub struct WsReader {
    stream: SharedStream,
    buf: Vec<u8>,
    max_payload: usize,
    fragments: Option<(u8, Vec<u8>)>,
}

impl WsReader {
    fn new(stream: SharedStream, buf: Vec<u8>, max_payload: usize) -> Self {
        Self {
            stream,
            buf,
            max_payload,
            fragments: None,
        }
    }

    fn fill(&mut self) -> Result<(), WsError> {
        let mut chunk = [0u8; READ_CHUNK_BYTES];
        let read = {
            let mut stream = self
                .stream
                .lock()
                .map_err(|_| WsError::Protocol("stream lock poisoned".to_string()))?;
            stream.read(&mut chunk)
        };
        match read {
            Ok(0) => Err(WsError::Closed),
            Ok(read) => {
                self.buf.extend_from_slice(&chunk[..read]);
                Ok(())
            }
            Err(err) => Err(map_ws_read_error(err)),
        }
    }

    fn assemble(&mut self, frame: WsFrame) -> Result<Option<WsMessage>, WsError> {
        match frame.opcode {
            OPCODE_PING => Ok(Some(WsMessage::Ping(frame.payload))),
            OPCODE_PONG => Ok(Some(WsMessage::Pong(frame.payload))),
            OPCODE_CLOSE => Ok(Some(WsMessage::Close)),
            OPCODE_TEXT | OPCODE_BINARY if frame.fin => {
                data_message(frame.opcode, frame.payload).map(Some)
            }
            OPCODE_TEXT | OPCODE_BINARY => {
                self.fragments = Some((frame.opcode, frame.payload));
                Ok(None)
            }
            OPCODE_CONTINUATION => {
                let Some((opcode, mut data)) = self.fragments.take() else {
                    return Err(WsError::Protocol("unexpected continuation frame".to_string()));
                };
                data.extend_from_slice(&frame.payload);
                if data.len() > self.max_payload {
                    return Err(WsError::Protocol("fragmented message too large".to_string()));
                }
                if frame.fin {
                    data_message(opcode, data).map(Some)
                } else {
                    self.fragments = Some((opcode, data));
                    Ok(None)
                }
            }
            other => Err(WsError::Protocol(format!("unknown opcode {other:#x}"))),
        }
    }
}

impl MessageRead for WsReader {
    fn read_message(&mut self) -> Result<WsMessage, WsError> {
        loop {
            if let Some((frame, used)) = parse_frame(&self.buf, self.max_payload)? {
                self.buf.drain(..used);
                if let Some(message) = self.assemble(frame)? {
                    return Ok(message);
                }
                continue;
            }
            self.fill()?;
        }
    }
}

pub struct WsWriter {
    stream: SharedStream,
    closed: bool,
}

impl WsWriter {
    fn new(stream: SharedStream) -> Self {
        Self {
            stream,
            closed: false,
        }
    }

    fn write_frame(&mut self, opcode: u8, payload: &[u8]) -> Result<(), WsError> {
        let mut mask = [0u8; 4];
        rand::thread_rng().fill_bytes(&mut mask);
        let frame = encode_frame(opcode, payload, Some(mask));
        let mut stream = self
            .stream
            .lock()
            .map_err(|_| WsError::Protocol("stream lock poisoned".to_string()))?;
        stream.write_all(&frame)?;
        stream.flush()?;
        Ok(())
    }
}

impl MessageWrite for WsWriter {
    fn write_message(&mut self, message: &WsMessage) -> Result<(), WsError> {
        if self.closed {
            return Err(WsError::Closed);
        }
        match message {
            WsMessage::Text(text) => self.write_frame(OPCODE_TEXT, text.as_bytes()),
            WsMessage::Binary(data) => self.write_frame(OPCODE_BINARY, data),
            WsMessage::Ping(data) => self.write_frame(OPCODE_PING, data),
            WsMessage::Pong(data) => self.write_frame(OPCODE_PONG, data),
            WsMessage::Close => {
                let result = self.write_frame(OPCODE_CLOSE, &1000u16.to_be_bytes());
                self.closed = true;
                result
            }
        }
    }

    fn close(&mut self) {
        if !self.closed {
            let _ = self.write_message(&WsMessage::Close);
        }
    }
}

fn data_message(opcode: u8, payload: Vec<u8>) -> Result<WsMessage, WsError> {
    if opcode == OPCODE_TEXT {
        String::from_utf8(payload)
            .map(WsMessage::Text)
            .map_err(|_| WsError::Protocol("text frame is not utf-8".to_string()))
    } else {
        Ok(WsMessage::Binary(payload))
    }
}

fn map_ws_read_error(err: io::Error) -> WsError {
    match err.kind() {
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => {
            WsError::Timeout
        }
        io::ErrorKind::UnexpectedEof
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted => WsError::Closed,
        _ => WsError::Io(err),
    }
}
