//! Worker side of a Tether thread.
//!
//! A [`WorkerModule`] holds the methods a worker exposes. The serving
//! functions connect a module to a controller over an in-memory channel or a
//! framed byte stream, and the `tether-worker` binary serves the demo
//! [`math_module`] on stdio.

pub mod error;
pub mod math;
pub mod module;
pub mod serve;

pub use error::{Error, Result};
pub use math::{buffer_arg, math_module};
pub use module::{Reply, WorkerModule};
pub use serve::{
    serve_port, serve_stdio, serve_stream, spawn_shared_worker, spawn_worker, spawn_worker_with,
};
