//! Method table exposed by a worker.

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tether_core::{ControllerMessage, Payload, Transferable, WorkerMessage};

use crate::error::{Error, Result};

type Handler = Arc<dyn Fn(Vec<Payload>) -> Result<Payload> + Send + Sync>;

/// What the worker does in response to a controller message.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// Post this message, moving the listed buffers with it.
    Post(WorkerMessage, Vec<Transferable>),
    /// Stop serving.
    Terminate,
}

/// Named methods a worker exposes to its controller.
#[derive(Clone, Default)]
pub struct WorkerModule {
    methods: BTreeMap<String, Handler>,
}

impl WorkerModule {
    pub fn new() -> Self {
        Self::default()
    }

    /// Expose a method working on raw payloads.
    pub fn method<F>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Vec<Payload>) -> Result<Payload> + Send + Sync + 'static,
    {
        self.methods.insert(name.into(), Arc::new(handler));
        self
    }

    /// Expose a method with typed arguments.
    ///
    /// The argument list is decoded as a JSON array into `A` (usually a tuple)
    /// and the return value is encoded back to JSON. Transfer descriptors are
    /// reduced to their payload.
    pub fn method_typed<A, R, E, F>(self, name: impl Into<String>, handler: F) -> Self
    where
        A: DeserializeOwned,
        R: Serialize,
        E: fmt::Display,
        F: Fn(A) -> std::result::Result<R, E> + Send + Sync + 'static,
    {
        let name = name.into();
        let method = name.clone();
        self.method(name, move |args: Vec<Payload>| {
            let values = Value::Array(args.into_iter().map(Payload::into_value).collect());
            let decoded: A =
                serde_json::from_value(values).map_err(|e| Error::InvalidArguments {
                    method: method.clone(),
                    message: e.to_string(),
                })?;
            let result = handler(decoded).map_err(|e| Error::Handler(e.to_string()))?;
            Ok(Payload::value(result)?)
        })
    }

    /// Exposed method names, sorted.
    pub fn method_names(&self) -> Vec<String> {
        self.methods.keys().cloned().collect()
    }

    /// The announcement sent before any call is served.
    pub fn init_message(&self) -> WorkerMessage {
        WorkerMessage::Init {
            method_names: self.method_names(),
        }
    }

    /// Run a method. Panics are caught and returned as [`Error::Panic`].
    pub fn invoke(&self, method: &str, args: Vec<Payload>) -> Result<Payload> {
        let handler = self
            .methods
            .get(method)
            .ok_or_else(|| Error::UnknownMethod(method.to_string()))?;

        catch_unwind(AssertUnwindSafe(|| handler(args))).unwrap_or_else(|panic| {
            Err(Error::Panic {
                method: method.to_string(),
                message: panic_message(panic.as_ref()),
            })
        })
    }

    /// Turn one controller message into the worker's reply.
    pub fn handle(&self, message: ControllerMessage) -> Reply {
        match message {
            ControllerMessage::Run { uid, method, args } => {
                match self.invoke(&method, args) {
                    Ok(result) => {
                        let transfer = result.transferables().to_vec();
                        tracing::trace!(%uid, method, "Task completed");
                        Reply::Post(WorkerMessage::Result { uid, result }, transfer)
                    }
                    Err(e) => {
                        tracing::debug!(%uid, method, "Task failed: {}", e);
                        Reply::Post(
                            WorkerMessage::Error {
                                uid,
                                error_message: e.to_string(),
                            },
                            Vec::new(),
                        )
                    }
                }
            }
            ControllerMessage::Terminate => Reply::Terminate,
        }
    }
}

impl fmt::Debug for WorkerModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerModule")
            .field("methods", &self.method_names())
            .finish()
    }
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
