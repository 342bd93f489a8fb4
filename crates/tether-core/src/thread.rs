//! Thread controller: calls worker methods as local async functions.
//!
//! A [`ThreadController`] owns one worker interface. On spawn it waits for the
//! worker to announce its methods, builds a [`MethodProxy`] per method and
//! binds a dispatch listener that routes every reply to the task it belongs to.
//!
//! # Example
//!
//! ```no_run
//! # async fn demo(worker: tether_core::WorkerKind) -> tether_core::Result<()> {
//! use serde_json::json;
//! use tether_core::{Payload, ThreadController};
//!
//! let thread = ThreadController::spawn(worker).await?;
//! let sum = thread
//!     .call("add", vec![Payload::from(json!(2)), Payload::from(json!(3))])?
//!     .await?;
//! assert_eq!(sum.into_value(), json!(5));
//! thread.terminate().await?;
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use rustc_hash::FxHashMap;
use tokio::sync::{Notify, oneshot};
use uuid::Uuid;

use crate::config::{ThreadConfig, UncaughtErrorPolicy};
use crate::error::{Error, Result};
use crate::interface::{Listener, ListenerId, MessageEvent, WorkerInterface, WorkerKind};
use crate::protocol::{ControllerMessage, WorkerMessage};
use crate::task::{TaskId, TaskPromise, TaskRecord};
use crate::transfer::{Payload, PreparedArguments, prepare_arguments};

/// Diagnostic identifier of a controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ThreadId(Uuid);

impl ThreadId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Lifecycle of a controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// Interface attached, no listener yet.
    Spawning,
    /// Waiting for the worker's method announcement.
    Handshaking,
    /// Proxies built, dispatch listener attached.
    Ready,
    /// Waiting for pending tasks before shutting the worker down.
    Terminating,
    /// Dispatch listener detached, worker released.
    Terminated,
}

/// State shared between the controller, its proxies and its dispatch listener.
struct ThreadShared {
    thread_id: ThreadId,
    worker: WorkerKind,
    tasks: Mutex<FxHashMap<TaskId, TaskRecord>>,
    /// Woken every time tasks leave the table.
    settled: Notify,
    state: Mutex<ThreadState>,
    uncaught_errors: UncaughtErrorPolicy,
    /// Most recent uncaught error reported after the handshake.
    last_uncaught: Mutex<Option<String>>,
}

impl ThreadShared {
    fn tasks(&self) -> MutexGuard<'_, FxHashMap<TaskId, TaskRecord>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn state(&self) -> MutexGuard<'_, ThreadState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: ThreadState) {
        *self.state() = state;
        tracing::debug!(thread_id = %self.thread_id, ?state, "Thread state changed");
    }

    /// Send a run request and register its task.
    fn submit(&self, method: &str, raw_args: Vec<Payload>) -> Result<TaskPromise> {
        if *self.state() == ThreadState::Terminated {
            return Err(Error::Terminated);
        }

        let PreparedArguments {
            args,
            transferables,
        } = prepare_arguments(raw_args);
        let (task_id, record, promise) = TaskRecord::create(method);

        // Registered before sending: replies may arrive on another thread
        // before post_message returns.
        self.tasks().insert(task_id, record);

        let message = ControllerMessage::Run {
            uid: task_id,
            method: method.to_string(),
            args,
        };
        if let Err(e) = self.worker.post_message(message, transferables) {
            self.tasks().remove(&task_id);
            self.settled.notify_waiters();
            return Err(e);
        }

        tracing::trace!(thread_id = %self.thread_id, %task_id, method, "Submitted task");
        Ok(promise)
    }

    /// Remove a task and settle it. Returns `false` for unknown ids.
    fn settle(&self, task_id: TaskId, outcome: Result<Payload>) -> bool {
        let settled = {
            let mut tasks = self.tasks();
            match tasks.remove(&task_id) {
                Some(record) => {
                    tracing::trace!(thread_id = %self.thread_id, %task_id, method = %record.method, ok = outcome.is_ok(), "Settled task");
                    match outcome {
                        Ok(value) => record.resolve(value),
                        Err(error) => record.reject(error),
                    }
                    true
                }
                None => false,
            }
        };

        if settled {
            self.settled.notify_waiters();
        }
        settled
    }

    fn fail_pending(&self, message: &str) {
        let drained: Vec<TaskRecord> = self.tasks().drain().map(|(_, record)| record).collect();
        if drained.is_empty() {
            return;
        }

        tracing::warn!(thread_id = %self.thread_id, count = drained.len(), "Failing pending tasks after uncaught worker error");
        for record in drained {
            record.reject(Error::WorkerCrashed(message.to_string()));
        }
        self.settled.notify_waiters();
    }

    /// Route one inbound message to the task it belongs to.
    fn dispatch(&self, event: &MessageEvent) -> Result<()> {
        match &event.data {
            WorkerMessage::Result { uid, result } => {
                if !self.settle(*uid, Ok(result.clone())) {
                    return Err(Error::Ipc(format!(
                        "Received result for invalid task with UID {}",
                        uid
                    )));
                }
            }
            WorkerMessage::Error { uid, error_message } => {
                if !self.settle(*uid, Err(Error::Task(error_message.clone()))) {
                    return Err(Error::Ipc(format!(
                        "Received error for invalid task with UID {}",
                        uid
                    )));
                }
            }
            WorkerMessage::UncaughtError { error_message } => {
                *self
                    .last_uncaught
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner) = Some(error_message.clone());
                if self.uncaught_errors == UncaughtErrorPolicy::FailPending {
                    self.fail_pending(error_message);
                }
                return Err(Error::WorkerCrashed(error_message.clone()));
            }
            WorkerMessage::Init { .. } => {
                tracing::debug!(thread_id = %self.thread_id, "Ignoring repeated init message");
            }
        }
        Ok(())
    }
}

type HandshakeReply = oneshot::Sender<Result<Vec<String>>>;

/// Build the controller's only listener.
///
/// Until the worker announces its methods the listener completes the
/// handshake; every later message goes through [`ThreadShared::dispatch`].
/// Both phases share one registration, so nothing the worker sends right
/// after its announcement can fall between them. Failures are logged, never
/// propagated.
fn thread_listener(shared: &Arc<ThreadShared>, handshake: HandshakeReply) -> Listener {
    let shared = Arc::downgrade(shared);
    let handshake = Mutex::new(Some(handshake));

    Arc::new(move |event: &MessageEvent| {
        {
            let mut pending = handshake.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(reply) = pending.take() {
                let outcome = match &event.data {
                    WorkerMessage::Init { method_names } => Ok(method_names.clone()),
                    WorkerMessage::UncaughtError { error_message } => {
                        Err(Error::Init(error_message.clone()))
                    }
                    other => {
                        tracing::debug!(kind = other.kind(), "Ignoring message during handshake");
                        *pending = Some(reply);
                        return;
                    }
                };
                let _ = reply.send(outcome);
                return;
            }
        }

        let Some(shared) = shared.upgrade() else {
            return;
        };
        match shared.dispatch(event) {
            Ok(()) => {}
            Err(e @ Error::WorkerCrashed(_)) => {
                tracing::error!(thread_id = %shared.thread_id, "{}", e);
            }
            Err(e) => {
                tracing::warn!(thread_id = %shared.thread_id, "{}", e);
            }
        }
    })
}

/// Callable stand-in for one worker method.
#[derive(Clone)]
pub struct MethodProxy {
    name: Arc<str>,
    shared: Arc<ThreadShared>,
}

impl MethodProxy {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Invoke the method.
    ///
    /// Returns immediately; the promise settles when the worker replies.
    /// Fails only if the run request could not be sent.
    pub fn call(&self, args: Vec<Payload>) -> Result<TaskPromise> {
        self.shared.submit(&self.name, args)
    }
}

impl fmt::Debug for MethodProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodProxy")
            .field("name", &self.name)
            .field("thread_id", &self.shared.thread_id)
            .finish()
    }
}

/// Controller for one worker.
pub struct ThreadController {
    shared: Arc<ThreadShared>,
    method_names: Vec<String>,
    methods: FxHashMap<String, MethodProxy>,
    dispatch_listener: Mutex<Option<ListenerId>>,
}

impl ThreadController {
    /// Spawn a controller with the default configuration.
    pub async fn spawn(worker: WorkerKind) -> Result<Self> {
        Self::spawn_with_config(worker, ThreadConfig::default()).await
    }

    /// Perform the handshake and return a ready controller.
    ///
    /// Fails with [`Error::Init`] if the worker reports an uncaught error
    /// before announcing its methods.
    pub async fn spawn_with_config(worker: WorkerKind, config: ThreadConfig) -> Result<Self> {
        let shared = Arc::new(ThreadShared {
            thread_id: ThreadId::new(),
            worker,
            tasks: Mutex::new(FxHashMap::default()),
            settled: Notify::new(),
            state: Mutex::new(ThreadState::Spawning),
            uncaught_errors: config.uncaught_errors,
            last_uncaught: Mutex::new(None),
        });
        tracing::debug!(thread_id = %shared.thread_id, shared_worker = shared.worker.is_shared(), "Spawning thread");

        let (listener_id, method_names) = Self::handshake(&shared, &config).await?;

        let methods = method_names
            .iter()
            .map(|name| {
                let proxy = MethodProxy {
                    name: Arc::from(name.as_str()),
                    shared: shared.clone(),
                };
                (name.clone(), proxy)
            })
            .collect();

        shared.set_state(ThreadState::Ready);
        tracing::debug!(thread_id = %shared.thread_id, methods = ?method_names, "Thread ready");

        Ok(Self {
            shared,
            method_names,
            methods,
            dispatch_listener: Mutex::new(Some(listener_id)),
        })
    }

    /// Attach the listener and wait for the worker's method announcement.
    ///
    /// On success the listener stays attached and routes replies from then on.
    async fn handshake(
        shared: &Arc<ThreadShared>,
        config: &ThreadConfig,
    ) -> Result<(ListenerId, Vec<String>)> {
        let (tx, rx) = oneshot::channel();

        shared.set_state(ThreadState::Handshaking);
        let listener_id = shared.worker.add_listener(thread_listener(shared, tx));
        if let WorkerKind::Shared(port) = &shared.worker {
            port.start();
        }

        let received = match config.handshake_timeout {
            Some(timeout) => match tokio::time::timeout(timeout, rx).await {
                Ok(received) => received,
                Err(_) => {
                    shared.worker.remove_listener(listener_id);
                    return Err(Error::HandshakeTimeout(timeout));
                }
            },
            None => rx.await,
        };

        let announced = received
            .map_err(|_| Error::Ipc("Worker interface closed during handshake".to_string()))
            .and_then(|outcome| outcome);
        match announced {
            Ok(method_names) => Ok((listener_id, method_names)),
            Err(e) => {
                shared.worker.remove_listener(listener_id);
                Err(e)
            }
        }
    }

    pub fn thread_id(&self) -> ThreadId {
        self.shared.thread_id
    }

    pub fn state(&self) -> ThreadState {
        *self.shared.state()
    }

    /// Method names in the order the worker announced them.
    pub fn method_names(&self) -> &[String] {
        &self.method_names
    }

    /// Proxy for an announced method.
    pub fn method(&self, name: &str) -> Option<&MethodProxy> {
        self.methods.get(name)
    }

    /// Call a method by name.
    pub fn call(&self, method: &str, args: Vec<Payload>) -> Result<TaskPromise> {
        self.methods
            .get(method)
            .ok_or_else(|| Error::UnknownMethod(method.to_string()))?
            .call(args)
    }

    /// The last uncaught error the worker reported since the handshake.
    pub fn last_uncaught_error(&self) -> Option<String> {
        self.shared
            .last_uncaught
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of calls still waiting for a reply.
    pub fn pending_count(&self) -> usize {
        self.shared.tasks().len()
    }

    /// Wait until every task pending right now has settled.
    ///
    /// Tasks submitted after this call starts are not waited for.
    pub async fn settled(&self) {
        let mut waiting: Vec<TaskId> = self.shared.tasks().keys().copied().collect();

        loop {
            let mut notified = std::pin::pin!(self.shared.settled.notified());
            notified.as_mut().enable();

            {
                let tasks = self.shared.tasks();
                waiting.retain(|task_id| tasks.contains_key(task_id));
            }
            if waiting.is_empty() {
                return;
            }

            notified.await;
        }
    }

    /// Shut the worker down once all pending tasks have settled.
    ///
    /// Sends the terminate message, detaches the dispatch listener and, for a
    /// dedicated worker, terminates it. Calling this again is a no-op.
    pub async fn terminate(&self) -> Result<()> {
        {
            let mut state = self.shared.state();
            if *state == ThreadState::Terminated {
                return Ok(());
            }
            *state = ThreadState::Terminating;
        }
        tracing::debug!(thread_id = %self.shared.thread_id, pending = self.pending_count(), "Terminating thread");

        self.settled().await;

        let Some(listener_id) = self
            .dispatch_listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            return Ok(());
        };

        let posted = self
            .shared
            .worker
            .post_message(ControllerMessage::Terminate, Vec::new());
        self.shared.worker.remove_listener(listener_id);

        // Stopping a process may wait on the child and its reader thread.
        let released = match &self.shared.worker {
            WorkerKind::Dedicated(worker) => {
                let worker = worker.clone();
                tokio::task::spawn_blocking(move || worker.terminate())
                    .await
                    .unwrap_or_else(|e| Err(Error::Ipc(format!("Worker shutdown failed: {}", e))))
            }
            WorkerKind::Shared(_) => Ok(()),
        };
        self.shared.set_state(ThreadState::Terminated);

        posted.and(released)
    }
}

impl fmt::Debug for ThreadController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadController")
            .field("thread_id", &self.shared.thread_id)
            .field("state", &self.state())
            .field("methods", &self.method_names)
            .field("pending", &self.pending_count())
            .finish()
    }
}

impl Drop for ThreadController {
    fn drop(&mut self) {
        let listener_id = self
            .dispatch_listener
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(listener_id) = listener_id {
            self.shared.worker.remove_listener(listener_id);
            tracing::debug!(thread_id = %self.shared.thread_id, "Thread dropped without terminate");
        }
    }
}
