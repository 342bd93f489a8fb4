//! Messages exchanged between a thread controller and its worker.
//!
//! Stream transports use length-prefixed JSON frames.
//! Format: 4-byte length (u32 LE) + serde_json-encoded message.

use std::io::{Read, Write};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::task::TaskId;
use crate::transfer::Payload;

/// Largest frame accepted by [`read_message`].
pub const MAX_FRAME_LEN: usize = 100 * 1024 * 1024;

/// Message sent from the controller to the worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControllerMessage {
    /// Run an exposed method.
    Run {
        /// Task the reply must be tagged with.
        uid: TaskId,
        /// Method name as announced by the worker.
        method: String,
        /// Call arguments, transfer descriptors kept wrapped.
        args: Vec<Payload>,
    },

    /// Shut the worker down.
    Terminate,
}

/// Message sent from the worker to the controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    /// Worker is ready and exposes these methods.
    Init {
        method_names: Vec<String>,
    },

    /// A task completed.
    Result {
        uid: TaskId,
        result: Payload,
    },

    /// A task failed.
    Error {
        uid: TaskId,
        error_message: String,
    },

    /// The worker failed outside of any task.
    UncaughtError {
        error_message: String,
    },
}

impl WorkerMessage {
    /// Short name of the message kind, for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Init { .. } => "init",
            Self::Result { .. } => "result",
            Self::Error { .. } => "error",
            Self::UncaughtError { .. } => "uncaught_error",
        }
    }
}

/// Write a message to a writer using length-prefixed JSON encoding.
pub fn write_message<W: Write>(writer: &mut W, message: &impl Serialize) -> Result<()> {
    let bytes = serde_json::to_vec(message)
        .map_err(|e| Error::Serialization(format!("Failed to encode IPC message: {}", e)))?;

    let len = u32::try_from(bytes.len())
        .map_err(|_| Error::Ipc(format!("IPC message too large: {} bytes", bytes.len())))?;
    writer
        .write_all(&len.to_le_bytes())
        .map_err(|e| Error::Ipc(format!("Failed to write IPC message length: {}", e)))?;
    writer
        .write_all(&bytes)
        .map_err(|e| Error::Ipc(format!("Failed to write IPC message body: {}", e)))?;
    writer
        .flush()
        .map_err(|e| Error::Ipc(format!("Failed to flush IPC stream: {}", e)))?;

    Ok(())
}

/// Read a message from a reader using length-prefixed JSON encoding.
///
/// Returns `Ok(None)` when the stream ends cleanly before a new frame.
pub fn read_message<R: Read, T: DeserializeOwned>(reader: &mut R) -> Result<Option<T>> {
    let mut len_bytes = [0u8; 4];
    match reader.read_exact(&mut len_bytes) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => {
            return Err(Error::Ipc(format!(
                "Failed to read IPC message length: {}",
                e
            )));
        }
    }
    let len = u32::from_le_bytes(len_bytes) as usize;

    if len > MAX_FRAME_LEN {
        return Err(Error::Ipc(format!("IPC message too large: {} bytes", len)));
    }

    let mut bytes = vec![0u8; len];
    reader
        .read_exact(&mut bytes)
        .map_err(|e| Error::Ipc(format!("Failed to read IPC message body: {}", e)))?;

    let message = serde_json::from_slice(&bytes)
        .map_err(|e| Error::Serialization(format!("Failed to decode IPC message: {}", e)))?;

    Ok(Some(message))
}
