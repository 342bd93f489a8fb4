//! Transfer descriptors and call argument preparation.
//!
//! A [`TransferDescriptor`] marks a value as carrying buffers that should be
//! moved to the other side of the channel rather than copied. In-memory
//! transports move the buffer's `Arc`; stream transports serialize the bytes.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::error::{Error, Result};

/// A shared byte buffer that can be handed to the worker without copying.
#[derive(Clone, PartialEq, Eq)]
pub struct Transferable(Arc<[u8]>);

impl Transferable {
    /// Wrap a buffer.
    pub fn new(bytes: impl Into<Arc<[u8]>>) -> Self {
        Self(bytes.into())
    }

    /// Buffer contents.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Whether both handles point at the same allocation.
    pub fn same_buffer(&self, other: &Transferable) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl From<Vec<u8>> for Transferable {
    fn from(bytes: Vec<u8>) -> Self {
        Self::new(bytes)
    }
}

impl fmt::Debug for Transferable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Transferable({} bytes)", self.0.len())
    }
}

impl Serialize for Transferable {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.0)
    }
}

impl<'de> Deserialize<'de> for Transferable {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        Vec::<u8>::deserialize(deserializer).map(Self::from)
    }
}

/// A value plus the buffers it carries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferDescriptor {
    /// The value itself. Never inspected by the controller.
    pub payload: Value,
    /// Buffers to move along with the value.
    pub transferables: Vec<Transferable>,
}

impl TransferDescriptor {
    pub fn new(payload: Value, transferables: Vec<Transferable>) -> Self {
        Self {
            payload,
            transferables,
        }
    }

    /// Transfer a single buffer with no accompanying value.
    pub fn buffer(buffer: Transferable) -> Self {
        Self::new(Value::Null, vec![buffer])
    }
}

/// An argument or result crossing the channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Payload {
    /// A value wrapped in a transfer descriptor.
    Transfer {
        #[serde(rename = "$transfer")]
        transfer: TransferDescriptor,
    },
    /// A plain value, copied across the channel.
    Value(Value),
}

impl Payload {
    /// Serialize any value into a plain payload.
    pub fn value(value: impl Serialize) -> Result<Self> {
        serde_json::to_value(value)
            .map(Self::Value)
            .map_err(|e| Error::Serialization(format!("Failed to encode argument: {}", e)))
    }

    /// The plain value, or the descriptor's payload.
    pub fn as_value(&self) -> &Value {
        match self {
            Self::Value(value) => value,
            Self::Transfer { transfer } => &transfer.payload,
        }
    }

    /// Strip any transfer descriptor down to its value.
    pub fn into_value(self) -> Value {
        match self {
            Self::Value(value) => value,
            Self::Transfer { transfer } => transfer.payload,
        }
    }

    /// Buffers carried by this payload. Empty for plain values.
    pub fn transferables(&self) -> &[Transferable] {
        match self {
            Self::Value(_) => &[],
            Self::Transfer { transfer } => &transfer.transferables,
        }
    }

    pub fn is_transfer(&self) -> bool {
        matches!(self, Self::Transfer { .. })
    }
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        Self::Value(value)
    }
}

impl From<TransferDescriptor> for Payload {
    fn from(transfer: TransferDescriptor) -> Self {
        Self::Transfer { transfer }
    }
}

/// Call arguments split into values and the buffers to transfer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PreparedArguments {
    /// Arguments in call order. Descriptors are kept wrapped.
    pub args: Vec<Payload>,
    /// Buffers of every descriptor, in argument order.
    pub transferables: Vec<Transferable>,
}

/// Split raw call arguments into the argument list and the transfer list.
///
/// No deduplication is done: a buffer listed by two descriptors appears twice.
pub fn prepare_arguments(raw_args: Vec<Payload>) -> PreparedArguments {
    let mut prepared = PreparedArguments {
        args: Vec::with_capacity(raw_args.len()),
        transferables: Vec::new(),
    };

    for arg in raw_args {
        prepared
            .transferables
            .extend(arg.transferables().iter().cloned());
        prepared.args.push(arg);
    }

    prepared
}
