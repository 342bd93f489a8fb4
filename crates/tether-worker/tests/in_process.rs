//! Integration tests for controllers driving in-process workers.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::join_all;
use serde_json::{Value, json};
use tether_core::{
    Error, Payload, ThreadConfig, ThreadController, ThreadState, TransferDescriptor, Transferable,
    WorkerKind,
};
use tether_worker::{
    WorkerModule, buffer_arg, math_module, spawn_shared_worker, spawn_worker, spawn_worker_with,
};

fn args(values: &[Value]) -> Vec<Payload> {
    values.iter().cloned().map(Payload::from).collect()
}

async fn math_thread() -> ThreadController {
    ThreadController::spawn(WorkerKind::Dedicated(spawn_worker(math_module())))
        .await
        .unwrap()
}

#[tokio::test]
async fn test_add_through_proxy() {
    let thread = math_thread().await;

    assert_eq!(
        thread.method_names(),
        ["add", "byte_len", "div", "echo", "mul", "sleep", "sub"]
    );

    let add = thread.method("add").unwrap();
    let sum = add.call(args(&[json!(2), json!(3)])).unwrap().await.unwrap();
    assert_eq!(sum.into_value(), json!(5));

    thread.terminate().await.unwrap();
}

#[tokio::test]
async fn test_job_error_keeps_worker_message() {
    let thread = math_thread().await;

    let err = thread
        .call("div", args(&[json!(1), json!(0)]))
        .unwrap()
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Task(ref message) if message == "division by zero"));
    assert_eq!(err.to_string(), "division by zero");

    // The thread keeps working after a failed call.
    let quotient = thread.call("div", args(&[json!(8), json!(2)])).unwrap().await.unwrap();
    assert_eq!(quotient.into_value(), json!(4));

    thread.terminate().await.unwrap();
}

#[tokio::test]
async fn test_unknown_method_is_rejected_locally() {
    let thread = math_thread().await;

    let err = thread.call("pow", args(&[json!(2)])).unwrap_err();
    assert!(matches!(err, Error::UnknownMethod(ref name) if name == "pow"));
    assert_eq!(thread.pending_count(), 0);

    thread.terminate().await.unwrap();
}

#[tokio::test]
async fn test_concurrent_calls_settle_to_their_own_results() {
    let thread = math_thread().await;

    let promises: Vec<_> = (0..50)
        .map(|i| thread.call("mul", args(&[json!(i), json!(i)])).unwrap())
        .collect();
    let results = join_all(promises).await;

    for (i, result) in results.into_iter().enumerate() {
        assert_eq!(result.unwrap().into_value(), json!(i * i));
    }
    assert_eq!(thread.pending_count(), 0);

    thread.terminate().await.unwrap();
}

#[tokio::test]
async fn test_transferred_buffer_is_not_copied() {
    let original = Transferable::from(vec![7u8; 1024]);
    let received: Arc<Mutex<Option<Transferable>>> = Arc::new(Mutex::new(None));

    let seen = received.clone();
    let module = WorkerModule::new().method("keep", move |args: Vec<Payload>| {
        let buffer = args[0].transferables()[0].clone();
        let len = buffer.len();
        *seen.lock().unwrap() = Some(buffer);
        Ok(Payload::from(json!(len)))
    });

    let thread = ThreadController::spawn(WorkerKind::Dedicated(spawn_worker(module)))
        .await
        .unwrap();

    let descriptor = TransferDescriptor::new(json!("frame"), vec![original.clone()]);
    let len = thread
        .call("keep", vec![descriptor.into()])
        .unwrap()
        .await
        .unwrap();
    assert_eq!(len.into_value(), json!(1024));

    let received = received.lock().unwrap().take().unwrap();
    assert!(received.same_buffer(&original));

    thread.terminate().await.unwrap();
}

#[tokio::test]
async fn test_byte_len_sums_buffers() {
    let thread = math_thread().await;

    let total = thread
        .call("byte_len", vec![buffer_arg(vec![1; 10]), buffer_arg(vec![2; 6])])
        .unwrap()
        .await
        .unwrap();
    assert_eq!(total.into_value(), json!(16));

    thread.terminate().await.unwrap();
}

#[tokio::test]
async fn test_init_failure_fails_spawn() {
    let worker = spawn_worker_with(|| Err::<WorkerModule, _>("model weights missing"));
    let err = ThreadController::spawn(WorkerKind::Dedicated(worker))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Init(ref message) if message == "model weights missing"));
    assert_eq!(
        err.to_string(),
        "worker failed to initialize: model weights missing"
    );
}

#[tokio::test]
async fn test_init_panic_fails_spawn() {
    let worker = spawn_worker_with(|| -> Result<WorkerModule, String> { panic!("boom") });
    let err = ThreadController::spawn(WorkerKind::Dedicated(worker))
        .await
        .unwrap_err();

    assert_eq!(err.worker_message(), Some("boom"));
}

#[tokio::test]
async fn test_slow_init_still_hands_shakes() {
    let worker = spawn_worker_with(|| {
        std::thread::sleep(Duration::from_millis(20));
        Ok::<_, String>(math_module())
    });
    let config = ThreadConfig::new().with_handshake_timeout(Duration::from_secs(5));
    let thread = ThreadController::spawn_with_config(WorkerKind::Dedicated(worker), config)
        .await
        .unwrap();

    assert_eq!(thread.state(), ThreadState::Ready);
    thread.terminate().await.unwrap();
}

#[tokio::test]
async fn test_handshake_timeout() {
    let worker = spawn_worker_with(|| {
        std::thread::sleep(Duration::from_millis(500));
        Ok::<_, String>(math_module())
    });
    let config = ThreadConfig::new().with_handshake_timeout(Duration::from_millis(20));
    let err = ThreadController::spawn_with_config(WorkerKind::Dedicated(worker), config)
        .await
        .unwrap_err();

    assert!(matches!(err, Error::HandshakeTimeout(_)));
}

#[tokio::test]
async fn test_terminate_waits_for_pending_calls() {
    let worker = spawn_worker(math_module());
    let thread = ThreadController::spawn(WorkerKind::Dedicated(worker.clone()))
        .await
        .unwrap();

    let slow = thread.call("sleep", args(&[json!(50)])).unwrap();
    thread.terminate().await.unwrap();

    assert_eq!(thread.state(), ThreadState::Terminated);
    assert!(worker.is_terminated());
    // Settled before terminate returned.
    assert_eq!(slow.await.unwrap().into_value(), json!(50));

    let err = thread.call("add", args(&[json!(1), json!(1)])).unwrap_err();
    assert!(matches!(err, Error::Terminated));
    thread.terminate().await.unwrap();
}

#[tokio::test]
async fn test_shared_worker_serves_each_connection() {
    let shared = spawn_shared_worker(math_module());

    let first = ThreadController::spawn(WorkerKind::Shared(shared.connect()))
        .await
        .unwrap();
    let second = ThreadController::spawn(WorkerKind::Shared(shared.connect()))
        .await
        .unwrap();
    assert_eq!(shared.connection_count(), 2);

    let a = first.call("add", args(&[json!(1), json!(2)])).unwrap();
    let b = second.call("sub", args(&[json!(1), json!(2)])).unwrap();
    assert_eq!(a.await.unwrap().into_value(), json!(3));
    assert_eq!(b.await.unwrap().into_value(), json!(-1));

    first.terminate().await.unwrap();

    // The other connection is unaffected.
    let c = second.call("echo", args(&[json!("still here")])).unwrap();
    assert_eq!(c.await.unwrap().into_value(), json!("still here"));

    second.terminate().await.unwrap();
    shared.shutdown();
    assert_eq!(shared.connection_count(), 0);
}
