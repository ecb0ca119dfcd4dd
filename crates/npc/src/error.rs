//! # Error Definitions
//!
//! Two families live here:
//!
//! - [`Reason`]: the terminal outcomes the engine itself synthesizes. These travel
//!   in the `error` slot of a reply, exactly like an application error would.
//! - [`InvalidEnvelope`]: structural failures when an envelope is read from an
//!   untrusted representation (e.g. the wire).

use std::fmt;

use crate::envelope::Kind;
use crate::Payload;

/// Outcomes produced by the engine rather than by a remote handler.
///
/// On the wire each reason is a plain string payload, so peers written in other
/// languages see `"timedout"` and friends.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Reason {
    /// No transport is installed, or the engine was disconnected while the call was pending.
    Disconnected,
    /// The local timer for the call elapsed before an ack arrived.
    Timedout,
    /// The caller invoked the cancel handle before an ack arrived.
    Cancelled,
    /// The receiving peer has no handler registered for the method.
    Unimplemented,
}

impl Reason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Reason::Disconnected => "disconnected",
            Reason::Timedout => "timedout",
            Reason::Cancelled => "cancelled",
            Reason::Unimplemented => "unimplemented",
        }
    }

    pub fn into_payload(self) -> Payload {
        Payload::String(self.as_str().to_string())
    }

    /// Recognizes a reason carried in an `error` payload.
    ///
    /// Returns `None` for anything that is not one of the four reason strings,
    /// which means the error came from application code.
    pub fn from_payload(payload: &Payload) -> Option<Self> {
        match payload.as_str()? {
            "disconnected" => Some(Reason::Disconnected),
            "timedout" => Some(Reason::Timedout),
            "cancelled" => Some(Reason::Cancelled),
            "unimplemented" => Some(Reason::Unimplemented),
            _ => None,
        }
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<Reason> for Payload {
    fn from(reason: Reason) -> Self {
        reason.into_payload()
    }
}

/// Failure to build an [`Envelope`](crate::Envelope) from an external representation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidEnvelope {
    /// The numeric kind tag is not one of the five known kinds.
    UnknownKind(u8),
    /// Emit and Deliver envelopes must name a method.
    MissingMethod(Kind),
    /// Notify, Ack and Cancel envelopes must not name a method.
    UnexpectedMethod(Kind),
}

impl fmt::Display for InvalidEnvelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownKind(tag) => write!(f, "unknown envelope kind: {}", tag),
            Self::MissingMethod(kind) => write!(f, "{} envelope is missing its method", kind),
            Self::UnexpectedMethod(kind) => write!(f, "{} envelope must not carry a method", kind),
        }
    }
}

impl std::error::Error for InvalidEnvelope {}

pub type Result<T> = std::result::Result<T, InvalidEnvelope>;
