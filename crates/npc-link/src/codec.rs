//! # Frame Codec
//!
//! One envelope per frame, encoded as a JSON object:
//!
//! ```text
//! {"typ": 1, "id": 7, "method": "echo", "param": "hi"}
//! ```
//!
//! `typ` is the numeric envelope kind, absent `method`/`param`/`error` are
//! omitted, unknown fields are ignored on decode.

use std::fmt;

use npc::Envelope;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// The frame is not a valid envelope.
    Malformed(String),
    /// The frame exceeds the configured maximum length.
    FrameTooLarge { len: usize, max: usize },
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Malformed(msg) => write!(f, "Malformed frame: {}", msg),
            Self::FrameTooLarge { len, max } => write!(f, "Frame of {} bytes exceeds limit of {}", len, max),
        }
    }
}

impl std::error::Error for CodecError {}

impl From<serde_json::Error> for CodecError {
    fn from(e: serde_json::Error) -> Self {
        Self::Malformed(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CodecError>;

#[derive(Debug, Clone, Copy)]
pub struct Codec {
    max_frame_len: usize,
}

impl Codec {
    pub fn new(max_frame_len: usize) -> Self {
        Self { max_frame_len }
    }

    pub fn max_frame_len(&self) -> usize {
        self.max_frame_len
    }

    pub fn encode(&self, envelope: &Envelope) -> Result<Vec<u8>> {
        let frame = serde_json::to_vec(envelope)?;
        self.check(frame.len())?;
        Ok(frame)
    }

    pub fn decode(&self, frame: &[u8]) -> Result<Envelope> {
        self.check(frame.len())?;
        Ok(serde_json::from_slice(frame)?)
    }

    fn check(&self, len: usize) -> Result<()> {
        if len > self.max_frame_len {
            return Err(CodecError::FrameTooLarge { len, max: self.max_frame_len });
        }
        Ok(())
    }
}
