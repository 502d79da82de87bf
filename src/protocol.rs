//! Wire protocol for manager/worker communication.
//!
//! A frame is `kind (u8)` + `id (u64 LE)` + a JSON body + the fixed
//! [`BOUNDARY`] marker. The boundary is a resynchronization point, not a
//! length prefix: readers that fail to decode a body skip to the boundary
//! and carry on at the next frame.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Boundary marker emitted after every frame body, in either direction.
///
/// The byte sequence is not valid UTF-8, so it can never occur inside a
/// JSON-encoded body.
pub const BOUNDARY: [u8; 10] = [0x79, 0x8E, 0x8E, 0xF5, 0x6E, 0x9B, 0x2E, 0x97, 0xD5, 0x7D];

/// Correlation id used by frames that never expect a reply.
pub const NO_REPLY_ID: u64 = 0;

/// Frame kinds understood by both ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    /// Manager -> worker: invoke a function, reply expected.
    Call = 0x01,
    /// Manager -> worker: invoke a function, no reply.
    Cast = 0x02,
    /// Manager -> worker: cancel the most recently started call. Used where
    /// the OS cannot route an interrupt signal to the child on its own.
    Interrupt = 0x14,
    /// Worker -> manager: call returned normally.
    Result = 0x50,
    /// Worker -> manager: call raised.
    Failure = 0x51,
    /// Never sent on the wire: the receive side rewrites a frame whose body
    /// failed to deserialize to this kind before waking the waiter.
    BadPayload = 0x64,
}

impl FrameKind {
    /// Decode a kind byte. Unknown bytes are preserved by the caller for
    /// logging rather than mapped onto a variant.
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Self::Call),
            0x02 => Some(Self::Cast),
            0x14 => Some(Self::Interrupt),
            0x50 => Some(Self::Result),
            0x51 => Some(Self::Failure),
            0x64 => Some(Self::BadPayload),
            _ => None,
        }
    }
}

/// Body of a `Call`/`Cast` frame.
///
/// Serialized as a 4-tuple (a JSON array), so field order is authoritative:
/// `[function, positional, named, discard_result]`. `discard_result` asks the
/// worker to reply with `null` instead of the produced value; for casts the
/// field travels but is ignored.
#[derive(Debug, Clone, PartialEq)]
pub struct CallRequest {
    pub function: String,
    pub args: Vec<Value>,
    pub named: Map<String, Value>,
    pub discard: bool,
}

impl CallRequest {
    pub fn new(function: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            function: function.into(),
            args,
            named: Map::new(),
            discard: false,
        }
    }

    /// Request the unit value back instead of the call's result.
    pub fn discarding(mut self) -> Self {
        self.discard = true;
        self
    }

    /// Attach named arguments.
    pub fn with_named(mut self, named: Map<String, Value>) -> Self {
        self.named = named;
        self
    }

    /// Serialize to body bytes.
    pub fn to_body(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(&(&self.function, &self.args, &self.named, self.discard))
    }

    /// Deserialize from a decoded body value.
    pub fn from_body(body: &Value) -> Result<Self, String> {
        let (function, args, named, discard): (String, Vec<Value>, Map<String, Value>, bool) =
            serde_json::from_value(body.clone())
                .map_err(|e| format!("malformed call payload: {}", e))?;
        Ok(Self {
            function,
            args,
            named,
            discard,
        })
    }
}

/// Error object carried by `Failure` frames and rethrown into the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteError {
    /// Machine-readable category, e.g. `"RemoteException"` or `"Interrupted"`.
    pub kind: String,
    /// Human-readable description.
    pub message: String,
}

impl RemoteError {
    pub const EXCEPTION: &'static str = "RemoteException";
    pub const INTERRUPTED: &'static str = "Interrupted";
    pub const SERIALIZATION: &'static str = "SerializationFailure";
    pub const UNDEFINED_FUNCTION: &'static str = "UndefinedFunction";
    pub const UNDEFINED_VARIABLE: &'static str = "UndefinedVariable";
    pub const EVAL: &'static str = "EvalError";
    pub const CHANNEL: &'static str = "ChannelError";

    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }

    /// A value raised by user code.
    pub fn exception(message: impl Into<String>) -> Self {
        Self::new(Self::EXCEPTION, message)
    }

    /// The call was cancelled by an interrupt.
    pub fn interrupted() -> Self {
        Self::new(Self::INTERRUPTED, "call was interrupted")
    }

    /// A frame body could not be deserialized.
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::new(Self::SERIALIZATION, message)
    }

    /// The requested function is not registered on the worker.
    pub fn undefined_function(name: &str) -> Self {
        Self::new(
            Self::UNDEFINED_FUNCTION,
            format!("no function named {:?} is registered", name),
        )
    }

    pub fn is_interrupt(&self) -> bool {
        self.kind == Self::INTERRUPTED
    }

    pub fn is_serialization(&self) -> bool {
        self.kind == Self::SERIALIZATION
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Outcome of a remote call, as handed from the receive thread to the waiter.
#[derive(Debug, Clone)]
pub enum WorkerResult {
    /// The call returned this value (`null` when the caller asked to discard).
    Ok(Value),
    /// The call raised; the error is rethrown into the caller.
    Raise(RemoteError),
}

impl WorkerResult {
    /// Convert into the caller-facing result, mapping serialization failures
    /// onto their own error variant.
    pub fn into_result(self) -> crate::Result<Value> {
        match self {
            WorkerResult::Ok(v) => Ok(v),
            WorkerResult::Raise(e) if e.is_serialization() => {
                Err(crate::SkiffError::Serialization(e.message))
            }
            WorkerResult::Raise(e) => Err(crate::SkiffError::Remote(e)),
        }
    }
}
