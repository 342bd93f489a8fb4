//! Methods command implementation for Tether CLI.
//!
//! Lists the methods the worker announced during the handshake.

use crate::colors;
use crate::worker::{WorkerOptions, open_thread};

/// Print the worker's methods, one per line.
pub async fn execute(options: &WorkerOptions) -> anyhow::Result<()> {
    let thread = open_thread(options).await?;

    println!(
        "{}Methods{} {}(thread {}){}",
        colors::BOLD,
        colors::RESET,
        colors::DIM,
        thread.thread_id(),
        colors::RESET
    );
    for name in thread.method_names() {
        println!("{}  ◆{} {}", colors::CYAN, colors::RESET, name);
    }

    thread.terminate().await?;
    Ok(())
}
