//! Integration tests for a controller talking to a hand-written worker over an
//! in-memory channel.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tether_core::{
    ControllerMessage, Error, InProcessWorker, MessageEvent, Payload, SharedChannelWorker,
    ThreadConfig, ThreadController, ThreadState, UncaughtErrorPolicy, WorkerKind, WorkerMessage,
    WorkerPort,
};

/// Worker that doubles numbers and crashes on request.
fn serve_doubler(port: Arc<WorkerPort>) {
    let replies = port.clone();
    port.add_listener(Arc::new(move |event: &MessageEvent<ControllerMessage>| {
        match &event.data {
            ControllerMessage::Run { uid, method, args } => {
                let reply = match (method.as_str(), args.first().map(Payload::as_value)) {
                    ("double", Some(value)) if value.is_i64() => WorkerMessage::Result {
                        uid: *uid,
                        result: json!(value.as_i64().unwrap_or_default() * 2).into(),
                    },
                    ("crash", _) => WorkerMessage::UncaughtError {
                        error_message: "worker lost its state".to_string(),
                    },
                    _ => WorkerMessage::Error {
                        uid: *uid,
                        error_message: format!("cannot {} that", method),
                    },
                };
                let _ = replies.post(reply, Vec::new());
            }
            ControllerMessage::Terminate => replies.close(),
        }
    }));
    port.start();
    port.post(
        WorkerMessage::Init {
            method_names: vec!["double".to_string(), "crash".to_string()],
        },
        Vec::new(),
    )
    .unwrap();
}

#[tokio::test]
async fn test_dedicated_channel_worker() {
    let worker = InProcessWorker::spawn(serve_doubler);
    let thread = ThreadController::spawn(WorkerKind::Dedicated(worker.clone()))
        .await
        .unwrap();
    assert_eq!(thread.method_names(), ["double", "crash"]);

    let doubled = thread
        .call("double", vec![json!(21).into()])
        .unwrap()
        .await
        .unwrap();
    assert_eq!(doubled.into_value(), json!(42));

    let err = thread
        .call("double", vec![json!("x").into()])
        .unwrap()
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "cannot double that");

    thread.terminate().await.unwrap();
    assert_eq!(thread.state(), ThreadState::Terminated);
    assert!(worker.is_terminated());
}

#[tokio::test]
async fn test_uncaught_error_fails_pending_when_asked() {
    let worker = InProcessWorker::spawn(serve_doubler);
    let config = ThreadConfig::new().with_uncaught_errors(UncaughtErrorPolicy::FailPending);
    let thread = ThreadController::spawn_with_config(WorkerKind::Dedicated(worker), config)
        .await
        .unwrap();

    let err = tokio::time::timeout(
        Duration::from_secs(2),
        thread.call("crash", Vec::new()).unwrap(),
    )
    .await
    .unwrap()
    .unwrap_err();
    assert!(matches!(err, Error::WorkerCrashed(ref message) if message == "worker lost its state"));
    assert_eq!(thread.pending_count(), 0);

    // Nothing pending, so terminate returns straight away.
    thread.terminate().await.unwrap();
}

#[tokio::test]
async fn test_shared_channel_worker_connections_are_independent() {
    let shared = SharedChannelWorker::new(serve_doubler);

    let first = ThreadController::spawn(WorkerKind::Shared(shared.connect()))
        .await
        .unwrap();
    let second = ThreadController::spawn(WorkerKind::Shared(shared.connect()))
        .await
        .unwrap();
    assert_ne!(first.thread_id(), second.thread_id());

    let a = first.call("double", vec![json!(1).into()]).unwrap();
    let b = second.call("double", vec![json!(2).into()]).unwrap();
    assert_eq!(b.await.unwrap().into_value(), json!(4));
    assert_eq!(a.await.unwrap().into_value(), json!(2));

    first.terminate().await.unwrap();
    second.terminate().await.unwrap();
}
