//! # Envelope
//!
//! The immutable message value exchanged between two peers.
//!
//! ## Invariants
//! - **Closed kinds**: [`Kind`] is exhaustive; an unknown tag cannot be constructed.
//! - **Method iff call**: Emit and Deliver carry a method, Notify/Ack/Cancel never do.
//!   The constructors make the other shapes unrepresentable, and deserialization
//!   rejects them.
//!
//! ## Serialized shape
//! A flat map: `typ` (numeric kind), `id`, then `method`, `param` and `error`
//! when present. A missing `id` reads as 0.
//!
//! A JSON `null` payload is the same as an absent one: constructors store it as
//! `None`, so it is never written and always reads back as `None`.

use std::fmt;

use serde::Deserialize;
use serde::Serialize;

use crate::error::InvalidEnvelope;
use crate::error::Result;
use crate::Payload;

/// Correlation id tying a Deliver to its Notify/Ack/Cancel traffic.
pub type CallId = i32;

/// The five envelope kinds. The discriminant is the wire tag.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Kind {
    Emit = 0,
    Deliver = 1,
    Notify = 2,
    Ack = 3,
    Cancel = 4,
}

impl Kind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Kind::Emit => "emit",
            Kind::Deliver => "deliver",
            Kind::Notify => "notify",
            Kind::Ack => "ack",
            Kind::Cancel => "cancel",
        }
    }

    /// Whether envelopes of this kind name a target method.
    pub fn has_method(&self) -> bool {
        matches!(self, Kind::Emit | Kind::Deliver)
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<Kind> for u8 {
    fn from(kind: Kind) -> u8 {
        kind as u8
    }
}

impl TryFrom<u8> for Kind {
    type Error = InvalidEnvelope;

    fn try_from(tag: u8) -> Result<Self> {
        match tag {
            0 => Ok(Kind::Emit),
            1 => Ok(Kind::Deliver),
            2 => Ok(Kind::Notify),
            3 => Ok(Kind::Ack),
            4 => Ok(Kind::Cancel),
            _ => Err(InvalidEnvelope::UnknownKind(tag)),
        }
    }
}

/// A single protocol message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawEnvelope")]
pub struct Envelope {
    #[serde(rename = "typ")]
    kind: Kind,
    id: CallId,
    #[serde(skip_serializing_if = "Option::is_none")]
    method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    param: Option<Payload>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<Payload>,
}

impl Envelope {
    /// A one-way call. The id is meaningless for emits; locally built ones use 0.
    pub fn emit(method: impl Into<String>, param: Option<Payload>) -> Self {
        Self { kind: Kind::Emit, id: 0, method: Some(method.into()), param: present(param), error: None }
    }

    pub fn deliver(id: CallId, method: impl Into<String>, param: Option<Payload>) -> Self {
        Self { kind: Kind::Deliver, id, method: Some(method.into()), param: present(param), error: None }
    }

    pub fn notify(id: CallId, param: Option<Payload>) -> Self {
        Self { kind: Kind::Notify, id, method: None, param: present(param), error: None }
    }

    /// The terminal reply. A failing ack carries `error`; `param` is normally unset then.
    pub fn ack(id: CallId, param: Option<Payload>, error: Option<Payload>) -> Self {
        Self { kind: Kind::Ack, id, method: None, param: present(param), error: present(error) }
    }

    pub fn cancel(id: CallId) -> Self {
        Self { kind: Kind::Cancel, id, method: None, param: None, error: None }
    }

    pub fn kind(&self) -> Kind {
        self.kind
    }

    pub fn id(&self) -> CallId {
        self.id
    }

    pub fn method(&self) -> Option<&str> {
        self.method.as_deref()
    }

    pub fn param(&self) -> Option<&Payload> {
        self.param.as_ref()
    }

    pub fn error(&self) -> Option<&Payload> {
        self.error.as_ref()
    }

    /// Splits the envelope into its owned fields: `(kind, id, method, param, error)`.
    pub fn into_parts(self) -> (Kind, CallId, Option<String>, Option<Payload>, Option<Payload>) {
        (self.kind, self.id, self.method, self.param, self.error)
    }
}

impl fmt::Display for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{typ: {}, id: {}", self.kind, self.id)?;
        if let Some(method) = &self.method {
            write!(f, ", method: {}", method)?;
        }
        if let Some(param) = &self.param {
            write!(f, ", param: {}", param)?;
        }
        if let Some(error) = &self.error {
            write!(f, ", error: {}", error)?;
        }
        f.write_str("}")
    }
}

fn present(payload: Option<Payload>) -> Option<Payload> {
    payload.filter(|payload| !payload.is_null())
}

/// Unchecked mirror of [`Envelope`] used only while deserializing.
#[derive(Deserialize)]
struct RawEnvelope {
    typ: Kind,
    #[serde(default)]
    id: CallId,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    param: Option<Payload>,
    #[serde(default)]
    error: Option<Payload>,
}

impl TryFrom<RawEnvelope> for Envelope {
    type Error = InvalidEnvelope;

    fn try_from(raw: RawEnvelope) -> Result<Self> {
        match (raw.typ.has_method(), raw.method.is_some()) {
            (true, false) => return Err(InvalidEnvelope::MissingMethod(raw.typ)),
            (false, true) => return Err(InvalidEnvelope::UnexpectedMethod(raw.typ)),
            _ => {}
        }

        Ok(Self {
            kind: raw.typ,
            id: raw.id,
            method: raw.method,
            param: raw.param,
            error: raw.error,
        })
    }
}
