//! The communication interface a controller drives.
//!
//! A worker is reached through exactly one interface: a way to post messages
//! plus a set of message listeners. Two forms exist. A dedicated worker is
//! its own interface and is owned by the controller. A shared worker is
//! reached through a port that must be started, and outlives the controller.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::error::Result;
use crate::protocol::{ControllerMessage, WorkerMessage};
use crate::transfer::Transferable;

/// A message as delivered to a listener.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageEvent<T = WorkerMessage> {
    /// The message.
    pub data: T,
    /// Buffers moved along with the message.
    pub transfer: Vec<Transferable>,
}

impl<T> MessageEvent<T> {
    pub fn new(data: T, transfer: Vec<Transferable>) -> Self {
        Self { data, transfer }
    }
}

/// Identifies a registered listener for later removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Callback invoked for every inbound message.
pub type Listener<T = WorkerMessage> = Arc<dyn Fn(&MessageEvent<T>) + Send + Sync>;

/// Controller side of a worker connection.
pub trait WorkerInterface: Send + Sync {
    /// Send a message, moving `transfer` along with it.
    fn post_message(&self, message: ControllerMessage, transfer: Vec<Transferable>) -> Result<()>;

    /// Register a listener for inbound messages.
    fn add_listener(&self, listener: Listener) -> ListenerId;

    /// Unregister a listener. Unknown ids are ignored.
    fn remove_listener(&self, id: ListenerId);
}

/// A worker owned by one controller.
pub trait DedicatedWorker: WorkerInterface {
    /// Release the worker. Messages after this point are not delivered.
    fn terminate(&self) -> Result<()>;
}

/// A port into a worker that other controllers may share.
pub trait MessagePort: WorkerInterface {
    /// Begin delivering queued and future messages to listeners.
    fn start(&self);
}

/// The worker a controller is spawned on.
#[derive(Clone)]
pub enum WorkerKind {
    /// Dedicated worker, terminated together with its controller.
    Dedicated(Arc<dyn DedicatedWorker>),
    /// Port into a shared worker, left running on termination.
    Shared(Arc<dyn MessagePort>),
}

impl WorkerKind {
    pub fn is_shared(&self) -> bool {
        matches!(self, Self::Shared(_))
    }
}

impl WorkerInterface for WorkerKind {
    fn post_message(&self, message: ControllerMessage, transfer: Vec<Transferable>) -> Result<()> {
        match self {
            Self::Dedicated(worker) => worker.post_message(message, transfer),
            Self::Shared(port) => port.post_message(message, transfer),
        }
    }

    fn add_listener(&self, listener: Listener) -> ListenerId {
        match self {
            Self::Dedicated(worker) => worker.add_listener(listener),
            Self::Shared(port) => port.add_listener(listener),
        }
    }

    fn remove_listener(&self, id: ListenerId) {
        match self {
            Self::Dedicated(worker) => worker.remove_listener(id),
            Self::Shared(port) => port.remove_listener(id),
        }
    }
}

impl std::fmt::Debug for WorkerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Dedicated(_) => f.write_str("WorkerKind::Dedicated"),
            Self::Shared(_) => f.write_str("WorkerKind::Shared"),
        }
    }
}

/// Listener registry shared by the transports.
pub struct ListenerSet<T = WorkerMessage> {
    next_id: AtomicU64,
    listeners: Mutex<Vec<(ListenerId, Listener<T>)>>,
}

impl<T> ListenerSet<T> {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(0),
            listeners: Mutex::new(Vec::new()),
        }
    }

    pub fn add(&self, listener: Listener<T>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, listener));
        id
    }

    pub fn remove(&self, id: ListenerId) {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|(existing, _)| *existing != id);
    }

    pub fn clear(&self) {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn len(&self) -> usize {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver an event to every listener registered right now.
    ///
    /// The registry lock is released before any listener runs, so listeners
    /// may add or remove listeners. A panicking listener is logged and the
    /// remaining listeners still run.
    pub fn dispatch(&self, event: &MessageEvent<T>) {
        let snapshot: Vec<Listener<T>> = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();

        for listener in snapshot {
            if catch_unwind(AssertUnwindSafe(|| listener(event))).is_err() {
                tracing::error!("Listener panicked while handling a message");
            }
        }
    }
}

impl<T> Default for ListenerSet<T> {
    fn default() -> Self {
        Self::new()
    }
}
