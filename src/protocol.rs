//! Pipe protocol between the capture process and the landmark worker.
//!
//! Requests arrive either length-prefixed (`[u32 LE len][JSON header][payload]`)
//! or as JSON lines. Every request gets exactly one JSON response line,
//! flushed as soon as it is written.

use std::io;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures::SinkExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Decoder, FramedRead, FramedWrite, LinesCodec, LinesCodecError};

use crate::config::{DetectorConfigPatch, ProtocolConfig};
use crate::error::{WorkerError, WorkerResult};
use crate::pose::crop::{CoordinateSpace, CropDescriptor};
use crate::signals::{HandResult, PoseResult};

const LENGTH_PREFIX: usize = 4;

/// How requests are delimited on the input stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Framing {
    /// `[u32 LE header length][JSON header][optional raw image bytes]`
    Binary,
    /// One JSON header per line, images inline as base64.
    Lines,
}

// --- Inbound ---

/// One decoded unit from the input stream.
#[derive(Debug)]
pub enum Message {
    Request {
        header: Value,
        payload: Option<Bytes>,
    },
    /// Consumed from the stream but unusable; answered with an error and skipped.
    Malformed(WorkerError),
}

enum DecodeState {
    Length,
    Header { len: usize },
    Payload { header: Value, len: usize },
    Discard { remaining: usize, error: WorkerError },
}

/// Decoder for the length-prefixed framing.
///
/// A truncated length, header or payload at end of stream is not an error:
/// `decode_eof` drops it and the stream simply ends. An unusable
/// `data_length` on a binary frame is an I/O error, since the payload that
/// follows cannot be skipped.
pub struct BinaryCodec {
    state: DecodeState,
    limits: ProtocolConfig,
}

impl BinaryCodec {
    pub fn new(limits: ProtocolConfig) -> Self {
        Self {
            state: DecodeState::Length,
            limits,
        }
    }
}

/// Payload size announced by a header, if it carries a binary image.
///
/// Integral floats (`4.0`) are accepted since JSON producers often emit them.
fn declared_payload(header: &Value) -> WorkerResult<Option<usize>> {
    let is_frame = header.get("type").and_then(Value::as_str) == Some("process_frame");
    let is_binary = header.get("format").and_then(Value::as_str) == Some("binary");
    if !(is_frame && is_binary) {
        return Ok(None);
    }
    match header.get("data_length") {
        None | Some(Value::Null) => Ok(Some(0)),
        Some(value) => value
            .as_u64()
            .or_else(|| {
                value
                    .as_f64()
                    .filter(|n| *n >= 0.0 && n.fract() == 0.0 && *n < u64::MAX as f64)
                    .map(|n| n as u64)
            })
            .and_then(|n| usize::try_from(n).ok())
            .map(Some)
            .ok_or_else(|| WorkerError::InvalidDataLength(value.to_string())),
    }
}

impl Decoder for BinaryCodec {
    type Item = Message;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> io::Result<Option<Message>> {
        loop {
            match std::mem::replace(&mut self.state, DecodeState::Length) {
                DecodeState::Length => {
                    if src.len() < LENGTH_PREFIX {
                        return Ok(None);
                    }
                    let len = src.get_u32_le() as usize;
                    if len > self.limits.max_header_bytes {
                        self.state = DecodeState::Discard {
                            remaining: len,
                            error: WorkerError::TooLarge {
                                what: "header",
                                size: len as u64,
                                limit: self.limits.max_header_bytes as u64,
                            },
                        };
                    } else {
                        src.reserve(len);
                        self.state = DecodeState::Header { len };
                    }
                }
                DecodeState::Header { len } => {
                    if src.len() < len {
                        self.state = DecodeState::Header { len };
                        return Ok(None);
                    }
                    let raw = src.split_to(len);
                    let header: Value = match serde_json::from_slice(&raw) {
                        Ok(header) => header,
                        Err(e) => {
                            return Ok(Some(Message::Malformed(WorkerError::InvalidHeader(
                                e.to_string(),
                            ))))
                        }
                    };
                    match declared_payload(&header) {
                        // Payload boundary unknown: the stream cannot be resynchronized
                        Err(e) => return Err(io::Error::new(io::ErrorKind::InvalidData, e.to_string())),
                        Ok(None) => {
                            return Ok(Some(Message::Request {
                                header,
                                payload: None,
                            }))
                        }
                        Ok(Some(n)) if n > self.limits.max_payload_bytes => {
                            self.state = DecodeState::Discard {
                                remaining: n,
                                error: WorkerError::TooLarge {
                                    what: "image payload",
                                    size: n as u64,
                                    limit: self.limits.max_payload_bytes as u64,
                                },
                            };
                        }
                        Ok(Some(n)) => {
                            src.reserve(n);
                            self.state = DecodeState::Payload { header, len: n };
                        }
                    }
                }
                DecodeState::Payload { header, len } => {
                    if src.len() < len {
                        self.state = DecodeState::Payload { header, len };
                        return Ok(None);
                    }
                    let payload = src.split_to(len).freeze();
                    return Ok(Some(Message::Request {
                        header,
                        payload: Some(payload),
                    }));
                }
                DecodeState::Discard { remaining, error } => {
                    let n = remaining.min(src.len());
                    src.advance(n);
                    let remaining = remaining - n;
                    if remaining > 0 {
                        self.state = DecodeState::Discard { remaining, error };
                        return Ok(None);
                    }
                    return Ok(Some(Message::Malformed(error)));
                }
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> io::Result<Option<Message>> {
        if let Some(message) = self.decode(buf)? {
            return Ok(Some(message));
        }
        if !buf.is_empty() || !matches!(self.state, DecodeState::Length) {
            log::debug!(
                "input closed mid-frame, dropping {} buffered bytes",
                buf.len()
            );
            buf.clear();
            self.state = DecodeState::Length;
        }
        Ok(None)
    }
}

/// Decoder for the JSON-lines framing.
pub struct LineCodec {
    inner: LinesCodec,
    max_length: usize,
}

impl LineCodec {
    pub fn new(limits: ProtocolConfig) -> Self {
        // base64 inflates the image by 4/3
        let max_length = limits
            .max_header_bytes
            .saturating_add(limits.max_payload_bytes / 3 * 4 + 4);
        Self {
            inner: LinesCodec::new_with_max_length(max_length),
            max_length,
        }
    }

    fn lift(&self, decoded: Result<Option<String>, LinesCodecError>) -> io::Result<Option<Message>> {
        match decoded {
            Ok(Some(line)) => Ok(Some(parse_line(&line))),
            Ok(None) => Ok(None),
            Err(LinesCodecError::MaxLineLengthExceeded) => Ok(Some(Message::Malformed(
                WorkerError::LineTooLong(self.max_length),
            ))),
            Err(LinesCodecError::Io(e)) if e.kind() == io::ErrorKind::InvalidData => Ok(Some(
                Message::Malformed(WorkerError::InvalidHeader("line is not valid UTF-8".into())),
            )),
            Err(LinesCodecError::Io(e)) => Err(e),
        }
    }
}

fn parse_line(line: &str) -> Message {
    match serde_json::from_str(line) {
        Ok(header) => Message::Request {
            header,
            payload: None,
        },
        Err(e) => Message::Malformed(WorkerError::InvalidHeader(e.to_string())),
    }
}

impl Decoder for LineCodec {
    type Item = Message;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> io::Result<Option<Message>> {
        loop {
            let decoded = self.inner.decode(src);
            if matches!(&decoded, Ok(Some(line)) if line.trim().is_empty()) {
                continue;
            }
            return self.lift(decoded);
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> io::Result<Option<Message>> {
        loop {
            let decoded = self.inner.decode_eof(buf);
            if matches!(&decoded, Ok(Some(line)) if line.trim().is_empty()) {
                continue;
            }
            return self.lift(decoded);
        }
    }
}

/// Either framing behind one decoder type.
pub enum WireCodec {
    Binary(BinaryCodec),
    Lines(LineCodec),
}

impl WireCodec {
    pub fn new(framing: Framing, limits: ProtocolConfig) -> Self {
        match framing {
            Framing::Binary => WireCodec::Binary(BinaryCodec::new(limits)),
            Framing::Lines => WireCodec::Lines(LineCodec::new(limits)),
        }
    }
}

impl Decoder for WireCodec {
    type Item = Message;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> io::Result<Option<Message>> {
        match self {
            WireCodec::Binary(codec) => codec.decode(src),
            WireCodec::Lines(codec) => codec.decode(src),
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> io::Result<Option<Message>> {
        match self {
            WireCodec::Binary(codec) => codec.decode_eof(buf),
            WireCodec::Lines(codec) => codec.decode_eof(buf),
        }
    }
}

pub type RequestStream<R> = FramedRead<R, WireCodec>;

pub fn request_stream<R: AsyncRead>(reader: R, framing: Framing, limits: ProtocolConfig) -> RequestStream<R> {
    FramedRead::new(reader, WireCodec::new(framing, limits))
}

/// Build one length-prefixed message. `header` must already carry
/// `data_length` when a payload is attached.
pub fn encode_binary_message(header: &Value, payload: Option<&[u8]>) -> anyhow::Result<BytesMut> {
    let header = serde_json::to_vec(header)?;
    let len = u32::try_from(header.len())?;
    let payload = payload.unwrap_or_default();
    let mut out = BytesMut::with_capacity(LENGTH_PREFIX + header.len() + payload.len());
    out.put_u32_le(len);
    out.put_slice(&header);
    out.put_slice(payload);
    Ok(out)
}

// --- Commands ---

/// Header fields of a `process_frame` request.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct FrameRequest {
    #[serde(default)]
    pub format: Option<String>,
    #[serde(default)]
    pub image_data: Option<String>,
    #[serde(default)]
    pub crop_info: Option<CropDescriptor>,
    #[serde(default)]
    pub roi_info: Option<CropDescriptor>,
    #[serde(default)]
    pub coordinates: Option<CoordinateSpace>,
}

impl FrameRequest {
    /// Encoded image bytes, from the binary payload or the inline base64 field.
    pub fn image_bytes(&self, payload: Option<Bytes>) -> WorkerResult<Bytes> {
        let bytes = match self.format.as_deref() {
            Some("binary") => payload.ok_or(WorkerError::MissingImage)?,
            Some("base64") | None => {
                let data = self.image_data.as_deref().ok_or(WorkerError::MissingImage)?;
                Bytes::from(BASE64.decode(data.trim())?)
            }
            Some(other) => return Err(WorkerError::UnsupportedFormat(other.to_string())),
        };
        if bytes.is_empty() {
            return Err(WorkerError::EmptyImage);
        }
        Ok(bytes)
    }
}

#[derive(Debug)]
pub enum Command {
    ProcessFrame(FrameRequest),
    Ping,
    Config(DetectorConfigPatch),
}

impl Command {
    pub fn from_header(header: Value) -> WorkerResult<Self> {
        match header.get("type").and_then(Value::as_str) {
            Some("process_frame") => Ok(Command::ProcessFrame(serde_json::from_value(header)?)),
            Some("ping") => Ok(Command::Ping),
            Some("config") => {
                let patch = match header.get("config") {
                    None | Some(Value::Null) => DetectorConfigPatch::default(),
                    Some(config) => serde_json::from_value(config.clone())?,
                };
                Ok(Command::Config(patch))
            }
            _ => {
                let kind = match header.get("type") {
                    Some(Value::String(s)) => s.clone(),
                    Some(other) => other.to_string(),
                    None => "null".to_string(),
                };
                Err(WorkerError::UnknownCommand(kind))
            }
        }
    }
}

// --- Outbound ---

/// One response line.
#[derive(Debug, Serialize)]
pub struct Response {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hands: Option<Vec<HandResult>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pose: Option<PoseResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Wall-clock time in fractional seconds since the Unix epoch.
pub fn timestamp() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

impl Response {
    fn blank(success: bool) -> Self {
        Self {
            success,
            message: None,
            hands: None,
            pose: None,
            timestamp: None,
            error: None,
        }
    }

    pub fn pong() -> Self {
        Self {
            message: Some("pong"),
            ..Self::blank(true)
        }
    }

    pub fn config_updated() -> Self {
        Self {
            message: Some("config updated"),
            ..Self::blank(true)
        }
    }

    pub fn hands(hands: Vec<HandResult>) -> Self {
        Self {
            hands: Some(hands),
            timestamp: Some(timestamp()),
            ..Self::blank(true)
        }
    }

    pub fn pose(pose: PoseResult) -> Self {
        Self {
            pose: Some(pose),
            timestamp: Some(timestamp()),
            ..Self::blank(true)
        }
    }

    pub fn error(error: impl std::fmt::Display) -> Self {
        Self {
            error: Some(error.to_string()),
            timestamp: Some(timestamp()),
            ..Self::blank(false)
        }
    }

    pub fn fatal(error: impl std::fmt::Display) -> Self {
        Self::error(format!("Fatal error: {:#}", error))
    }
}

pub type ResponseSink<W> = FramedWrite<W, LinesCodec>;

pub fn response_sink<W: AsyncWrite>(writer: W) -> ResponseSink<W> {
    FramedWrite::new(writer, LinesCodec::new())
}

/// Serialize and write one response line, flushing immediately.
pub async fn send_response<W: AsyncWrite + Unpin>(
    sink: &mut ResponseSink<W>,
    response: &Response,
) -> anyhow::Result<()> {
    let line = serde_json::to_string(response)?;
    sink.send(line).await?;
    Ok(())
}
