//! Serving loops that connect a [`WorkerModule`] to a controller.
//!
//! Every transport follows the same sequence: announce the methods with an
//! init message, answer run messages in arrival order, stop on terminate.

use std::fmt;
use std::io::{BufReader, BufWriter, Read, Write};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use tether_core::{
    ControllerMessage, InProcessWorker, MessageEvent, SharedChannelWorker, WorkerMessage,
    WorkerPort, read_message, write_message,
};

use crate::error::Result;
use crate::module::{Reply, WorkerModule, panic_message};

/// Serve `module` on the worker end of an in-memory channel.
///
/// Calls run on the port's pump thread, one at a time.
pub fn serve_port(module: Arc<WorkerModule>, port: Arc<WorkerPort>) -> Result<()> {
    let init = module.init_message();

    // The listener holds its own port; the pump releases it once the port closes.
    let replies = port.clone();
    port.add_listener(Arc::new(move |event: &MessageEvent<ControllerMessage>| {
        // Events are shared by every listener, so the message is cloned once
        // here; buffers inside it are reference counted.
        match module.handle(event.data.clone()) {
            Reply::Post(message, transfer) => {
                if let Err(e) = replies.post(message, transfer) {
                    tracing::warn!("Failed to post reply: {}", e);
                }
            }
            Reply::Terminate => {
                tracing::debug!("Worker received terminate");
                replies.close();
            }
        }
    }));
    port.start();

    port.post(init, Vec::new())?;
    Ok(())
}

/// Serve `module` over a framed byte stream until terminate or end of input.
pub fn serve_stream<R: Read, W: Write>(module: &WorkerModule, input: R, output: W) -> Result<()> {
    let mut input = BufReader::new(input);
    let mut output = BufWriter::new(output);

    write_message(&mut output, &module.init_message())?;
    tracing::debug!(methods = ?module.method_names(), "Worker announced methods");

    while let Some(message) = read_message::<_, ControllerMessage>(&mut input)? {
        match module.handle(message) {
            // Buffers travel inside the frame on a byte stream.
            Reply::Post(reply, _transfer) => write_message(&mut output, &reply)?,
            Reply::Terminate => {
                tracing::debug!("Worker received terminate");
                return Ok(());
            }
        }
    }

    tracing::debug!("Controller closed the stream");
    Ok(())
}

/// Serve `module` on this process's stdin and stdout.
pub fn serve_stdio(module: &WorkerModule) -> Result<()> {
    serve_stream(module, std::io::stdin().lock(), std::io::stdout().lock())
}

/// Run `module` as a dedicated in-process worker.
pub fn spawn_worker(module: WorkerModule) -> Arc<InProcessWorker> {
    let module = Arc::new(module);
    InProcessWorker::spawn(move |port| {
        if let Err(e) = serve_port(module, port.clone()) {
            report_uncaught(&port, e.to_string());
        }
    })
}

/// Run a dedicated in-process worker whose module is built on its own thread.
///
/// A failing or panicking `init` is reported to the controller as an
/// uncaught error, which fails the handshake.
pub fn spawn_worker_with<F, E>(init: F) -> Arc<InProcessWorker>
where
    F: FnOnce() -> std::result::Result<WorkerModule, E> + Send + 'static,
    E: fmt::Display,
{
    InProcessWorker::spawn(move |port| {
        let setup_port = port.clone();
        let spawned = std::thread::Builder::new()
            .name("tether-worker-init".to_string())
            .spawn(move || {
                let outcome = match catch_unwind(AssertUnwindSafe(init)) {
                    Ok(Ok(module)) => serve_port(Arc::new(module), setup_port.clone())
                        .map_err(|e| e.to_string()),
                    Ok(Err(e)) => Err(e.to_string()),
                    Err(panic) => Err(panic_message(panic.as_ref())),
                };
                if let Err(message) = outcome {
                    report_uncaught(&setup_port, message);
                }
            });

        if let Err(e) = spawned {
            report_uncaught(&port, format!("failed to start worker thread: {}", e));
        }
    })
}

/// Run `module` as a shared worker. Every connection is served separately.
pub fn spawn_shared_worker(module: WorkerModule) -> Arc<SharedChannelWorker> {
    let module = Arc::new(module);
    SharedChannelWorker::new(move |port| {
        if let Err(e) = serve_port(module.clone(), port.clone()) {
            report_uncaught(&port, e.to_string());
        }
    })
}

fn report_uncaught(port: &WorkerPort, error_message: String) {
    tracing::error!("Worker failed: {}", error_message);
    let _ = port.post(WorkerMessage::UncaughtError { error_message }, Vec::new());
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tether_core::{Payload, TaskId};

    fn module() -> WorkerModule {
        WorkerModule::new().method_typed("add", |(a, b): (i64, i64)| Ok::<_, String>(a + b))
    }

    fn frames(messages: &[ControllerMessage]) -> Vec<u8> {
        let mut buf = Vec::new();
        for message in messages {
            write_message(&mut buf, message).unwrap();
        }
        buf
    }

    fn replies(output: &[u8]) -> Vec<WorkerMessage> {
        let mut cursor = std::io::Cursor::new(output);
        let mut out = Vec::new();
        while let Some(message) = read_message(&mut cursor).unwrap() {
            out.push(message);
        }
        out
    }

    #[test]
    fn test_stream_announces_then_answers() {
        let uid = TaskId::new();
        let input = frames(&[
            ControllerMessage::Run {
                uid,
                method: "add".to_string(),
                args: vec![Payload::from(json!(2)), Payload::from(json!(3))],
            },
            ControllerMessage::Terminate,
            // Never read.
            ControllerMessage::Run {
                uid: TaskId::new(),
                method: "add".to_string(),
                args: Vec::new(),
            },
        ]);

        let mut output = Vec::new();
        serve_stream(&module(), input.as_slice(), &mut output).unwrap();

        assert_eq!(
            replies(&output),
            [
                WorkerMessage::Init {
                    method_names: vec!["add".to_string()]
                },
                WorkerMessage::Result {
                    uid,
                    result: json!(5).into()
                },
            ]
        );
    }

    #[test]
    fn test_stream_ends_with_input() {
        let mut output = Vec::new();
        serve_stream(&module(), std::io::empty(), &mut output).unwrap();
        assert_eq!(replies(&output).len(), 1);
    }

    #[test]
    fn test_truncated_input_is_an_error() {
        let mut input = frames(&[ControllerMessage::Terminate]);
        input.truncate(input.len() - 1);

        let mut output = Vec::new();
        assert!(serve_stream(&module(), input.as_slice(), &mut output).is_err());
    }
}
