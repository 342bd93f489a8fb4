//! In-memory message channels between a controller and a worker.
//!
//! A [`MessageChannel`] is a pair of connected ports. Posting on one port
//! queues the message on the other. A port delivers its queue to listeners on
//! its own pump thread once started; until then messages wait in the queue.
//! Buffers in a message's transfer list move by reference, never by copy.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::thread::JoinHandle;

use crate::error::{Error, Result};
use crate::interface::{
    DedicatedWorker, Listener, ListenerId, ListenerSet, MessageEvent, MessagePort, WorkerInterface,
};
use crate::protocol::{ControllerMessage, WorkerMessage};
use crate::transfer::Transferable;

type Slot<T> = Arc<Mutex<Option<Sender<MessageEvent<T>>>>>;

/// One end of a [`MessageChannel`]. Sends `Out`, receives `In`.
pub struct Port<Out, In> {
    label: &'static str,
    outbound: Slot<Out>,
    /// Sender feeding this port's own queue, dropped on close.
    inbound_sender: Slot<In>,
    inbound: Mutex<Option<Receiver<MessageEvent<In>>>>,
    listeners: Arc<ListenerSet<In>>,
    pump: Mutex<Option<JoinHandle<()>>>,
    closed: Arc<AtomicBool>,
}

/// Port held by the controller.
pub type ControllerPort = Port<ControllerMessage, WorkerMessage>;

/// Port held by the worker.
pub type WorkerPort = Port<WorkerMessage, ControllerMessage>;

impl<Out, In> Port<Out, In>
where
    Out: Send + 'static,
    In: Send + 'static,
{
    /// Queue a message on the other end.
    pub fn post(&self, message: Out, transfer: Vec<Transferable>) -> Result<()> {
        let outbound = self.outbound.lock().unwrap_or_else(PoisonError::into_inner);
        let sender = outbound
            .as_ref()
            .ok_or_else(|| Error::Ipc(format!("{} port is closed", self.label)))?;
        sender
            .send(MessageEvent::new(message, transfer))
            .map_err(|_| Error::Ipc(format!("{} port is closed", self.label)))
    }

    pub fn add_listener(&self, listener: Listener<In>) -> ListenerId {
        self.listeners.add(listener)
    }

    pub fn remove_listener(&self, id: ListenerId) {
        self.listeners.remove(id);
    }

    /// Start delivering messages. Calling it again does nothing.
    pub fn start(&self) {
        let Some(rx) = self
            .inbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            return;
        };

        let listeners = self.listeners.clone();
        let closed = self.closed.clone();
        let spawned = std::thread::Builder::new()
            .name(format!("tether-{}-port", self.label))
            .spawn(move || {
                for event in rx {
                    if closed.load(Ordering::SeqCst) {
                        break;
                    }
                    listeners.dispatch(&event);
                }
                // Listeners often hold their own port; release them with the pump.
                listeners.clear();
            });

        match spawned {
            Ok(handle) => {
                *self.pump.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
            }
            Err(e) => tracing::error!("Failed to start {} port: {}", self.label, e),
        }
    }

    /// Close both ends of the channel. Queued messages are discarded.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.outbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.inbound_sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        tracing::debug!("Closed {} port", self.label);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Whether the pump thread has been started and has not exited.
    pub fn is_running(&self) -> bool {
        self.pump
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }
}

impl WorkerInterface for ControllerPort {
    fn post_message(&self, message: ControllerMessage, transfer: Vec<Transferable>) -> Result<()> {
        self.post(message, transfer)
    }

    fn add_listener(&self, listener: Listener) -> ListenerId {
        Port::add_listener(self, listener)
    }

    fn remove_listener(&self, id: ListenerId) {
        Port::remove_listener(self, id);
    }
}

impl MessagePort for ControllerPort {
    fn start(&self) {
        Port::start(self);
    }
}

/// A connected pair of ports.
pub struct MessageChannel {
    pub controller: Arc<ControllerPort>,
    pub worker: Arc<WorkerPort>,
}

impl MessageChannel {
    pub fn new() -> Self {
        let (to_worker, worker_rx) = mpsc::channel();
        let (to_controller, controller_rx) = mpsc::channel();
        let to_worker: Slot<ControllerMessage> = Arc::new(Mutex::new(Some(to_worker)));
        let to_controller: Slot<WorkerMessage> = Arc::new(Mutex::new(Some(to_controller)));
        let closed = Arc::new(AtomicBool::new(false));

        let controller = Arc::new(Port {
            label: "controller",
            outbound: to_worker.clone(),
            inbound_sender: to_controller.clone(),
            inbound: Mutex::new(Some(controller_rx)),
            listeners: Arc::new(ListenerSet::new()),
            pump: Mutex::new(None),
            closed: closed.clone(),
        });
        let worker = Arc::new(Port {
            label: "worker",
            outbound: to_controller,
            inbound_sender: to_worker,
            inbound: Mutex::new(Some(worker_rx)),
            listeners: Arc::new(ListenerSet::new()),
            pump: Mutex::new(None),
            closed,
        });

        Self { controller, worker }
    }
}

impl Default for MessageChannel {
    fn default() -> Self {
        Self::new()
    }
}

/// A dedicated worker living in this process.
///
/// The worker side runs on its port's pump thread. The controller side starts
/// delivering as soon as the first listener is attached.
pub struct InProcessWorker {
    port: Arc<ControllerPort>,
}

impl InProcessWorker {
    /// Create a channel and hand its worker end to `setup`.
    ///
    /// `setup` typically registers the worker's listener, starts the port and
    /// posts the init message.
    pub fn spawn(setup: impl FnOnce(Arc<WorkerPort>)) -> Arc<Self> {
        let channel = MessageChannel::new();
        setup(channel.worker);
        Arc::new(Self {
            port: channel.controller,
        })
    }

    pub fn is_terminated(&self) -> bool {
        self.port.is_closed()
    }
}

impl WorkerInterface for InProcessWorker {
    fn post_message(&self, message: ControllerMessage, transfer: Vec<Transferable>) -> Result<()> {
        self.port.post(message, transfer)
    }

    fn add_listener(&self, listener: Listener) -> ListenerId {
        let id = self.port.add_listener(listener);
        self.port.start();
        id
    }

    fn remove_listener(&self, id: ListenerId) {
        self.port.remove_listener(id);
    }
}

impl DedicatedWorker for InProcessWorker {
    fn terminate(&self) -> Result<()> {
        self.port.close();
        Ok(())
    }
}

impl Drop for InProcessWorker {
    fn drop(&mut self) {
        // The worker side holds its own port; closing lets its pump exit.
        self.port.close();
    }
}

type ConnectFn = dyn Fn(Arc<WorkerPort>) + Send + Sync;

/// A worker that many controllers can connect to.
///
/// Every connection gets its own channel; the worker side of each one is
/// set up by the same function.
pub struct SharedChannelWorker {
    on_connect: Box<ConnectFn>,
    connections: Mutex<Vec<Weak<ControllerPort>>>,
}

impl SharedChannelWorker {
    pub fn new(on_connect: impl Fn(Arc<WorkerPort>) + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            on_connect: Box::new(on_connect),
            connections: Mutex::new(Vec::new()),
        })
    }

    /// Open a new connection. The returned port is not started.
    pub fn connect(&self) -> Arc<ControllerPort> {
        let channel = MessageChannel::new();
        (self.on_connect)(channel.worker);

        let mut connections = self.connections.lock().unwrap_or_else(PoisonError::into_inner);
        connections.retain(|port| port.strong_count() > 0);
        connections.push(Arc::downgrade(&channel.controller));
        channel.controller
    }

    /// Number of connections that are still open.
    pub fn connection_count(&self) -> usize {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|port| !port.is_closed())
            .count()
    }

    /// Close every connection.
    pub fn shutdown(&self) {
        let connections = std::mem::take(
            &mut *self.connections.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for port in connections.iter().filter_map(Weak::upgrade) {
            port.close();
        }
    }
}
