//! Pending task records and their result handles.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::transfer::Payload;

/// Correlation key for one in-flight call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    /// Generate a fresh random id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Settling side of a task, held in the controller's pending table.
pub(crate) struct TaskRecord {
    pub(crate) method: String,
    settle: oneshot::Sender<Result<Payload>>,
}

impl TaskRecord {
    /// Create a record and the handle it settles.
    pub(crate) fn create(method: &str) -> (TaskId, Self, TaskPromise) {
        let task_id = TaskId::new();
        let (settle, rx) = oneshot::channel();
        let record = Self {
            method: method.to_string(),
            settle,
        };
        (task_id, record, TaskPromise { task_id, rx })
    }

    pub(crate) fn resolve(self, value: Payload) {
        // The caller may have dropped its handle; nothing to do then.
        let _ = self.settle.send(Ok(value));
    }

    pub(crate) fn reject(self, error: Error) {
        let _ = self.settle.send(Err(error));
    }
}

/// Result handle returned by a method proxy.
///
/// Resolves with the worker's result, or fails with [`Error::Task`] carrying
/// the worker's error message. Fails with [`Error::Canceled`] if the
/// controller state is dropped while the task is still pending.
#[derive(Debug)]
#[must_use = "a task promise does nothing unless awaited"]
pub struct TaskPromise {
    task_id: TaskId,
    rx: oneshot::Receiver<Result<Payload>>,
}

impl TaskPromise {
    pub fn task_id(&self) -> TaskId {
        self.task_id
    }
}

impl Future for TaskPromise {
    type Output = Result<Payload>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            Poll::Ready(Err(_)) => Poll::Ready(Err(Error::Canceled)),
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustc_hash::FxHashSet;
    use serde_json::json;

    #[test]
    fn test_task_ids_are_unique() {
        let ids: FxHashSet<TaskId> = (0..10_000).map(|_| TaskId::new()).collect();
        assert_eq!(ids.len(), 10_000);
    }

    #[tokio::test]
    async fn test_resolve() {
        let (task_id, record, promise) = TaskRecord::create("add");
        assert_eq!(promise.task_id(), task_id);
        assert_eq!(record.method, "add");

        record.resolve(json!(5).into());
        assert_eq!(promise.await.unwrap(), Payload::from(json!(5)));
    }

    #[tokio::test]
    async fn test_reject_keeps_worker_message() {
        let (_, record, promise) = TaskRecord::create("div");
        record.reject(Error::Task("division by zero".to_string()));

        let err = promise.await.unwrap_err();
        assert_eq!(err.to_string(), "division by zero");
    }

    #[tokio::test]
    async fn test_dropped_record_cancels() {
        let (_, record, promise) = TaskRecord::create("add");
        drop(record);
        assert!(matches!(promise.await, Err(Error::Canceled)));
    }

    #[test]
    fn test_settle_after_handle_dropped() {
        let (_, record, promise) = TaskRecord::create("add");
        drop(promise);
        record.resolve(json!(1).into());
    }
}
