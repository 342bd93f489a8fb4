//! Choosing and starting the worker a command talks to.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Args;
use tether_core::{ProcessWorker, ThreadConfig, ThreadController, WorkerKind};
use tether_worker::{math_module, spawn_shared_worker, spawn_worker};

/// Where the worker runs.
#[derive(Debug, Clone, Args)]
pub struct WorkerOptions {
    /// Run this worker binary in a child process
    #[arg(long, global = true, value_name = "PATH", conflicts_with_all = ["process", "shared"])]
    pub worker: Option<PathBuf>,

    /// Run the default tether-worker binary in a child process
    #[arg(long, global = true, conflicts_with = "shared")]
    pub process: bool,

    /// Connect to an in-process shared worker instead of a dedicated one
    #[arg(long, global = true)]
    pub shared: bool,

    /// Give up if the worker has not announced its methods in time
    #[arg(long, global = true, value_name = "MILLIS")]
    pub handshake_timeout_ms: Option<u64>,
}

impl WorkerOptions {
    fn config(&self) -> ThreadConfig {
        let config = ThreadConfig::new();
        match self.handshake_timeout_ms {
            Some(ms) => config.with_handshake_timeout(Duration::from_millis(ms)),
            None => config,
        }
    }

    fn worker(&self) -> anyhow::Result<WorkerKind> {
        if let Some(path) = &self.worker {
            let worker = ProcessWorker::spawn(path, &[] as &[&str])
                .with_context(|| format!("Failed to start worker {}", path.display()))?;
            return Ok(WorkerKind::Dedicated(worker));
        }
        if self.process {
            return Ok(WorkerKind::Dedicated(ProcessWorker::spawn_default()?));
        }
        if self.shared {
            return Ok(WorkerKind::Shared(spawn_shared_worker(math_module()).connect()));
        }
        Ok(WorkerKind::Dedicated(spawn_worker(math_module())))
    }
}

/// Start the selected worker and complete the handshake.
pub async fn open_thread(options: &WorkerOptions) -> anyhow::Result<ThreadController> {
    let worker = options.worker()?;
    tracing::debug!(?worker, "Starting thread");
    let thread = ThreadController::spawn_with_config(worker, options.config()).await?;
    Ok(thread)
}
