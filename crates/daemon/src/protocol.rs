//! Ingest wire protocol
//!
//! One JSON handshake text message, then binary media chunks. The server answers with
//! JSON events and finishes with a close code that tells the encoder why it ended.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::transcode::Progress;

/// Close codes sent on the ingest connection
pub mod close_code {
    /// Stream ended normally (peer finished or transcoder exited cleanly)
    pub const NORMAL: u16 = 1000;
    /// Server is shutting down
    pub const GOING_AWAY: u16 = 1001;
    /// Fleet is at capacity, retry later
    pub const TRY_AGAIN_LATER: u16 = 1013;
    /// Handshake missing, malformed, or preceded by binary data
    pub const BAD_HANDSHAKE: u16 = 4000;
    /// Destination endpoint or stream key unusable
    pub const INVALID_DESTINATION: u16 = 4002;
    /// Transcoder could not be started
    pub const SPAWN_FAILED: u16 = 4003;
    /// Transcoder failed mid-stream
    pub const TRANSCODER_FAILED: u16 = 4004;
    /// Stopped through the control API
    pub const ADMIN_STOPPED: u16 = 4005;
}

/// First byte marking an audio chunk on an `h264` session
pub const AUDIO_TAG: u8 = 0x01;

const DEFAULT_FPS: u32 = 30;
const DEFAULT_VIDEO_KBPS: u32 = 2500;
const DEFAULT_AUDIO_KBPS: u32 = 128;
const MAX_FPS: u32 = 120;
const MAX_DIMENSION: u32 = 8192;

/// Error type for handshake validation
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("handshake is not valid JSON: {0}")]
    Malformed(String),

    #[error("unexpected handshake type '{0}', expected 'start'")]
    WrongType(String),

    #[error("missing required field '{0}'")]
    MissingField(&'static str),

    #[error("invalid value for '{field}': {reason}")]
    InvalidField { field: &'static str, reason: String },

    #[error("binary data received before handshake")]
    BinaryBeforeHandshake,

    #[error("no handshake received within {0}s")]
    Timeout(u64),

    #[error("connection closed before handshake")]
    Disconnected,
}

/// Media container the encoder sends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum InputFormat {
    /// Muxed WebM from a browser media recorder
    #[default]
    Webm,
    /// Annex-B H.264 elementary stream
    H264,
    /// Concatenated JPEG images from a page renderer
    Mjpeg,
}

impl InputFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            InputFormat::Webm => "webm",
            InputFormat::H264 => "h264",
            InputFormat::Mjpeg => "mjpeg",
        }
    }
}

/// Bitrate as sent by clients: a bare number of kbps or a string like "2500k"
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum BitrateValue {
    Number(f64),
    Text(String),
}

/// Raw handshake message as it appears on the wire
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawHandshake {
    #[serde(rename = "type")]
    kind: Option<String>,
    #[serde(alias = "endpoint")]
    server: Option<String>,
    stream_key: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    fps: Option<u32>,
    video_bitrate: Option<BitrateValue>,
    audio_bitrate: Option<BitrateValue>,
    input_format: Option<InputFormat>,
}

/// Validated, immutable per-session configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionConfig {
    #[serde(skip)]
    pub endpoint: String,
    #[serde(skip)]
    pub stream_key: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub fps: u32,
    pub video_bitrate_kbps: u32,
    pub audio_bitrate_kbps: u32,
    pub input_format: InputFormat,
}

impl SessionConfig {
    /// "WxH", or "source" when the stream is not rescaled
    pub fn resolution(&self) -> String {
        match (self.width, self.height) {
            (Some(w), Some(h)) => format!("{}x{}", w, h),
            _ => "source".to_string(),
        }
    }
}

/// Parse and validate a handshake text message
pub fn parse_handshake(text: &str) -> Result<SessionConfig, HandshakeError> {
    let raw: RawHandshake =
        serde_json::from_str(text).map_err(|e| HandshakeError::Malformed(e.to_string()))?;

    if let Some(kind) = raw.kind.as_deref() {
        if kind != "start" {
            return Err(HandshakeError::WrongType(kind.to_string()));
        }
    }

    let endpoint = raw
        .server
        .filter(|s| !s.trim().is_empty())
        .ok_or(HandshakeError::MissingField("server"))?;
    // A whitespace-only key is present; the normalizer rejects it later as a
    // credential error rather than a handshake error.
    let stream_key = raw
        .stream_key
        .filter(|s| !s.is_empty())
        .ok_or(HandshakeError::MissingField("streamKey"))?;

    let fps = raw.fps.unwrap_or(DEFAULT_FPS);
    if fps == 0 || fps > MAX_FPS {
        return Err(HandshakeError::InvalidField {
            field: "fps",
            reason: format!("must be between 1 and {}", MAX_FPS),
        });
    }

    let (width, height) = match (raw.width, raw.height) {
        (Some(w), Some(h)) => {
            for (field, value) in [("width", w), ("height", h)] {
                if value < 2 || value > MAX_DIMENSION || value % 2 != 0 {
                    return Err(HandshakeError::InvalidField {
                        field,
                        reason: format!("must be an even number between 2 and {}", MAX_DIMENSION),
                    });
                }
            }
            (Some(w), Some(h))
        }
        (None, None) => (None, None),
        (Some(_), None) => return Err(HandshakeError::MissingField("height")),
        (None, Some(_)) => return Err(HandshakeError::MissingField("width")),
    };

    let video_bitrate_kbps = match raw.video_bitrate {
        Some(value) => parse_bitrate("videoBitrate", &value)?,
        None => DEFAULT_VIDEO_KBPS,
    };
    let audio_bitrate_kbps = match raw.audio_bitrate {
        Some(value) => parse_bitrate("audioBitrate", &value)?,
        None => DEFAULT_AUDIO_KBPS,
    };

    Ok(SessionConfig {
        endpoint,
        stream_key,
        width,
        height,
        fps,
        video_bitrate_kbps,
        audio_bitrate_kbps,
        input_format: raw.input_format.unwrap_or_default(),
    })
}

fn parse_bitrate(field: &'static str, value: &BitrateValue) -> Result<u32, HandshakeError> {
    let invalid = |reason: &str| HandshakeError::InvalidField {
        field,
        reason: reason.to_string(),
    };

    let kbps = match value {
        BitrateValue::Number(n) => *n,
        BitrateValue::Text(s) => {
            let s = s.trim();
            let (digits, multiplier) = if let Some(d) = s.strip_suffix(['k', 'K']) {
                (d, 1.0)
            } else if let Some(d) = s.strip_suffix(['m', 'M']) {
                (d, 1000.0)
            } else {
                (s, 1.0)
            };
            digits
                .trim()
                .parse::<f64>()
                .map_err(|_| invalid("expected a number with optional k/M suffix"))?
                * multiplier
        }
    };

    if !kbps.is_finite() || kbps < 1.0 || kbps > 100_000.0 {
        return Err(invalid("must be between 1 and 100000 kbps"));
    }
    Ok(kbps.round() as u32)
}

/// Kind of a binary media chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Video,
    Audio,
}

/// Classify a binary chunk for the given input format
///
/// Only `h264` sessions multiplex tagged audio onto the connection; for the other
/// formats every chunk is part of one container stream.
pub fn classify_frame(format: InputFormat, data: &[u8]) -> FrameKind {
    match (format, data.first()) {
        (InputFormat::H264, Some(&AUDIO_TAG)) => FrameKind::Audio,
        _ => FrameKind::Video,
    }
}

/// Events sent to the encoder as JSON text messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerEvent {
    /// Transcoder started; binary media may flow
    #[serde(rename_all = "camelCase")]
    Ready { session_id: u64, message: String },
    /// A transcoder status line
    #[serde(rename_all = "camelCase")]
    Progress {
        message: String,
        frame: u64,
        fps: f32,
        bitrate_kbps: Option<f32>,
        speed: Option<f32>,
    },
    /// Any other transcoder diagnostic line
    Log { message: String },
    Error { message: String },
    /// Final message before the connection closes
    Stopped { message: String },
}

impl ServerEvent {
    pub fn from_diagnostic(line: String, progress: Option<Progress>) -> Self {
        match progress {
            Some(p) => ServerEvent::Progress {
                message: line,
                frame: p.frame,
                fps: p.fps,
                bitrate_kbps: p.bitrate_kbps,
                speed: p.speed,
            },
            None => ServerEvent::Log { message: line },
        }
    }

    pub fn to_json(&self) -> String {
        // Serializing these variants cannot fail; fall back to a bare error event anyway
        serde_json::to_string(self)
            .unwrap_or_else(|_| r#"{"type":"error","message":"event encoding failed"}"#.to_string())
    }
}
