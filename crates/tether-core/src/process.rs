//! Dedicated worker running in a child process.
//!
//! Messages travel as length-prefixed JSON frames over the child's stdin and
//! stdout. A reader thread decodes worker frames and hands them to listeners.
//! Transferred buffers are serialized into the frame, so they are copied
//! rather than moved.

use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::interface::{DedicatedWorker, Listener, ListenerId, ListenerSet, MessageEvent, WorkerInterface};
use crate::protocol::{ControllerMessage, WorkerMessage, read_message, write_message};
use crate::transfer::Transferable;

/// Environment variable overriding the worker binary location.
pub const WORKER_PATH_ENV: &str = "TETHER_WORKER_PATH";

const WORKER_BINARY: &str = if cfg!(windows) {
    "tether-worker.exe"
} else {
    "tether-worker"
};

/// Handle to a worker process.
pub struct ProcessWorker {
    /// The child process.
    child: Mutex<Child>,
    /// Buffered stdin writer.
    stdin: Mutex<BufWriter<ChildStdin>>,
    listeners: Arc<ListenerSet>,
    /// Stdout until the reader starts on the first listener.
    stdout: Mutex<Option<ChildStdout>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    /// Whether the worker has been terminated.
    killed: Arc<AtomicBool>,
    pid: u32,
}

impl ProcessWorker {
    /// Spawn `tether-worker` as found by [`ProcessWorker::find_worker_binary`].
    pub fn spawn_default() -> Result<Arc<Self>> {
        let path = Self::find_worker_binary()?;
        Self::spawn(&path, &[] as &[&str])
    }

    /// Spawn a worker binary with arguments.
    pub fn spawn(path: &Path, args: &[impl AsRef<std::ffi::OsStr>]) -> Result<Arc<Self>> {
        let mut child = Command::new(path)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit()) // Let worker stderr pass through for debugging
            .spawn()
            .map_err(|e| {
                Error::Ipc(format!(
                    "Failed to spawn worker process '{}': {}",
                    path.display(),
                    e
                ))
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Ipc("Failed to get worker stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Ipc("Failed to get worker stdout".to_string()))?;

        let pid = child.id();
        tracing::debug!(pid, path = %path.display(), "Spawned worker process");

        Ok(Arc::new(Self {
            child: Mutex::new(child),
            stdin: Mutex::new(BufWriter::new(stdin)),
            listeners: Arc::new(ListenerSet::new()),
            stdout: Mutex::new(Some(stdout)),
            reader: Mutex::new(None),
            killed: Arc::new(AtomicBool::new(false)),
            pid,
        }))
    }

    /// Start reading worker frames. Frames wait in the pipe until then.
    fn start_reader(&self) {
        let Some(stdout) = self
            .stdout
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            return;
        };

        let listeners = self.listeners.clone();
        let killed = self.killed.clone();
        let pid = self.pid;
        let spawned = std::thread::Builder::new()
            .name(format!("tether-worker-{}-reader", pid))
            .spawn(move || {
                let mut stdout = BufReader::new(stdout);
                let ended = loop {
                    match read_message::<_, WorkerMessage>(&mut stdout) {
                        Ok(Some(message)) => {
                            listeners.dispatch(&MessageEvent::new(message, Vec::new()));
                        }
                        Ok(None) => break "worker process exited unexpectedly".to_string(),
                        Err(e) => break format!("worker stream failed: {}", e),
                    }
                };

                if !killed.load(Ordering::SeqCst) {
                    tracing::warn!(pid, "{}", ended);
                    listeners.dispatch(&MessageEvent::new(
                        WorkerMessage::UncaughtError {
                            error_message: ended,
                        },
                        Vec::new(),
                    ));
                }
                listeners.clear();
            });

        match spawned {
            Ok(handle) => {
                *self.reader.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
            }
            Err(e) => tracing::error!(pid, "Failed to start worker reader: {}", e),
        }
    }

    /// Find the `tether-worker` binary, honouring `TETHER_WORKER_PATH`.
    pub fn find_worker_binary() -> Result<PathBuf> {
        locate_worker_binary(std::env::var_os(WORKER_PATH_ENV).map(PathBuf::from))
    }

    /// Get the process ID of the worker.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Check if the worker process is still running.
    pub fn is_alive(&self) -> bool {
        if self.killed.load(Ordering::SeqCst) {
            return false;
        }
        matches!(
            self.child
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .try_wait(),
            Ok(None)
        )
    }

    /// Kill the worker process and reap it.
    ///
    /// Blocks until the child has exited and the reader thread has joined.
    fn kill(&self) -> Result<()> {
        if self.killed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let mut child = self.child.lock().unwrap_or_else(PoisonError::into_inner);

        // Give it a moment to exit on its own after the terminate message
        for _ in 0..10 {
            if matches!(child.try_wait(), Ok(Some(_))) {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }

        if let Err(e) = child.kill() {
            // Process already exited, which is fine
            if e.kind() != std::io::ErrorKind::InvalidInput {
                tracing::warn!(pid = self.pid, "Failed to kill worker: {}", e);
            }
        }

        // Wait to reap zombie
        let _ = child.wait();
        drop(child);

        if let Some(reader) = self
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            && reader.thread().id() != std::thread::current().id()
        {
            // The reader ends once the child's stdout closes.
            let _ = reader.join();
        }

        tracing::debug!(pid = self.pid, "Worker process terminated");
        Ok(())
    }
}

/// Resolve the worker binary. A configured path must exist to be used; the
/// remaining candidates are the running executable's directory, `PATH` and
/// this workspace's build output, first match wins.
fn locate_worker_binary(configured: Option<PathBuf>) -> Result<PathBuf> {
    if let Some(path) = configured {
        if path.is_file() {
            return Ok(path);
        }
        tracing::warn!(path = %path.display(), "{} does not name a file, searching elsewhere", WORKER_PATH_ENV);
    }

    let beside_exe = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(WORKER_BINARY)));
    let on_path = which::which(WORKER_BINARY).ok();
    let workspace_target = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../target");
    let built = ["debug", "release"].map(|profile| workspace_target.join(profile).join(WORKER_BINARY));

    beside_exe
        .into_iter()
        .chain(on_path)
        .chain(built)
        .find(|path| path.is_file())
        .map(|path| path.canonicalize().unwrap_or(path))
        .ok_or_else(|| {
            Error::Ipc(format!(
                "Could not find {} binary. Set {} or put it on PATH.",
                WORKER_BINARY, WORKER_PATH_ENV
            ))
        })
}

impl WorkerInterface for ProcessWorker {
    fn post_message(&self, message: ControllerMessage, transfer: Vec<Transferable>) -> Result<()> {
        if self.killed.load(Ordering::SeqCst) {
            return Err(Error::Ipc("Worker has been killed".to_string()));
        }
        if !transfer.is_empty() {
            tracing::trace!(pid = self.pid, buffers = transfer.len(), "Copying transferred buffers into frame");
        }
        let mut stdin = self.stdin.lock().unwrap_or_else(PoisonError::into_inner);
        write_message(&mut *stdin, &message)
    }

    fn add_listener(&self, listener: Listener) -> ListenerId {
        let id = self.listeners.add(listener);
        self.start_reader();
        id
    }

    fn remove_listener(&self, id: ListenerId) {
        self.listeners.remove(id);
    }
}

impl DedicatedWorker for ProcessWorker {
    fn terminate(&self) -> Result<()> {
        self.kill()
    }
}

impl Drop for ProcessWorker {
    fn drop(&mut self) {
        // Ensure worker is killed when handle is dropped
        let _ = self.kill();
    }
}
