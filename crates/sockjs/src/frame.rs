//! SockJS 0.3 frame codec.
//!
//! Server → client frames: `o` open, `h` heartbeat, `a<array>` message
//! batch, `m<json-string>` single message, `c[code,"reason"]` close.
//! Client → server frames are bare JSON arrays of strings.

use serde::Deserialize;

/// Close code the session layer uses for a deliberate shutdown.
pub const CLOSE_GO_AWAY: u16 = 3000;

/// Close code sent when a second receiving connection shows up for a
/// polling session.
pub const CLOSE_STILL_OPEN: u16 = 2010;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("empty frame")]
    Empty,
    #[error("unknown frame type {0:?}")]
    UnknownType(char),
    #[error("malformed payload: {0}")]
    Malformed(String),
}

/// One server → client SockJS frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Open,
    Heartbeat,
    /// `a` and `m` frames both decode to message batches; `m` yields a
    /// single-element batch.
    Messages(Vec<String>),
    Close { code: u16, reason: String },
}

impl Frame {
    pub fn parse(raw: &str) -> Result<Frame, FrameError> {
        let raw = raw.trim_end_matches('\n');
        let mut chars = raw.chars();
        let tag = chars.next().ok_or(FrameError::Empty)?;
        let rest = chars.as_str();
        match tag {
            'o' => Ok(Frame::Open),
            'h' => Ok(Frame::Heartbeat),
            'a' => serde_json::from_str::<Vec<String>>(rest)
                .map(Frame::Messages)
                .map_err(|e| FrameError::Malformed(e.to_string())),
            'm' => serde_json::from_str::<String>(rest)
                .map(|m| Frame::Messages(vec![m]))
                .map_err(|e| FrameError::Malformed(e.to_string())),
            'c' => {
                #[derive(Deserialize)]
                struct ClosePayload(u16, String);
                let ClosePayload(code, reason) = serde_json::from_str(rest)
                    .map_err(|e| FrameError::Malformed(e.to_string()))?;
                Ok(Frame::Close { code, reason })
            }
            other => Err(FrameError::UnknownType(other)),
        }
    }

    pub fn encode(&self) -> String {
        match self {
            Frame::Open => "o".to_string(),
            Frame::Heartbeat => "h".to_string(),
            Frame::Messages(msgs) => {
                let mut out = String::from("a");
                out.push_str(&serde_json::to_string(msgs).unwrap_or_else(|_| "[]".into()));
                out
            }
            Frame::Close { code, reason } => {
                format!("c[{code},{}]", serde_json::to_string(reason).unwrap_or_default())
            }
        }
    }
}

/// Encode a client → server frame: a JSON array of message strings.
pub fn encode_client_frame(messages: &[String]) -> String {
    serde_json::to_string(messages).unwrap_or_else(|_| "[]".into())
}

/// Decode a client → server frame. Accepts both the array form and a
/// bare JSON string, which some transports emit for single messages.
pub fn decode_client_frame(raw: &str) -> Result<Vec<String>, FrameError> {
    if raw.is_empty() {
        return Err(FrameError::Empty);
    }
    if let Ok(batch) = serde_json::from_str::<Vec<String>>(raw) {
        return Ok(batch);
    }
    serde_json::from_str::<String>(raw)
        .map(|one| vec![one])
        .map_err(|e| FrameError::Malformed(e.to_string()))
}
