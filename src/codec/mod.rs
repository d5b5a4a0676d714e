use serde::Serialize;
use serde_json::Value;
use std::fmt;

/// Every frame on the wire is a JSON text followed by exactly one NUL byte.
pub const FRAME_DELIMITER: u8 = 0x00;

#[derive(Debug)]
pub enum FrameError {
    Encode(serde_json::Error),
    Decode { raw: String, source: serde_json::Error },
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Encode(err) => write!(f, "encode failed: {err}"),
            Self::Decode { raw, source } => write!(f, "decode failed: {source} (frame: {raw:?})"),
        }
    }
}

impl std::error::Error for FrameError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Encode(err) => Some(err),
            Self::Decode { source, .. } => Some(source),
        }
    }
}

pub fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>, FrameError> {
    let mut buf = serde_json::to_vec(message).map_err(FrameError::Encode)?;
    buf.push(FRAME_DELIMITER);
    Ok(buf)
}

/// Streaming decoder for one socket. Bytes after the last delimiter stay
/// pending until the next `feed`.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    pending: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Splits `bytes` on the delimiter. Each closed frame yields its own
    /// result so a corrupt frame never affects its neighbours.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<Result<Value, FrameError>> {
        let mut frames = Vec::new();
        let mut rest = bytes;
        while let Some(pos) = rest.iter().position(|b| *b == FRAME_DELIMITER) {
            self.pending.extend_from_slice(&rest[..pos]);
            frames.push(decode_frame(&self.pending));
            self.pending.clear();
            rest = &rest[pos + 1..];
        }
        self.pending.extend_from_slice(rest);
        frames
    }

    pub fn pending(&self) -> &[u8] {
        &self.pending
    }

    pub fn reset(&mut self) {
        self.pending.clear();
    }
}

fn decode_frame(raw: &[u8]) -> Result<Value, FrameError> {
    serde_json::from_slice(raw).map_err(|source| FrameError::Decode {
        raw: String::from_utf8_lossy(raw).into_owned(),
        source,
    })
}
