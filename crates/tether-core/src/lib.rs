//! Core engine for Tether worker threads.
//!
//! This crate provides:
//! - The thread controller that performs the worker handshake and
//!   correlates calls with their replies
//! - Method proxies built from the worker's announced method names
//! - The message protocol and stream framing
//! - Transfer descriptors for zero-copy buffers
//! - In-memory and child-process transports

pub mod channel;
pub mod config;
pub mod error;
pub mod interface;
pub mod process;
pub mod protocol;
pub mod task;
pub mod thread;
pub mod transfer;

pub use channel::{
    ControllerPort, InProcessWorker, MessageChannel, Port, SharedChannelWorker, WorkerPort,
};
pub use config::{ThreadConfig, UncaughtErrorPolicy};
pub use error::{Error, Result};
pub use interface::{
    DedicatedWorker, Listener, ListenerId, MessageEvent, MessagePort, WorkerInterface, WorkerKind,
};
pub use process::ProcessWorker;
pub use protocol::{ControllerMessage, WorkerMessage, read_message, write_message};
pub use task::{TaskId, TaskPromise};
pub use thread::{MethodProxy, ThreadController, ThreadId, ThreadState};
pub use transfer::{
    Payload, PreparedArguments, TransferDescriptor, Transferable, prepare_arguments,
};
