//! Tether worker - serves the demo math module over stdin and stdout.

use clap::Parser;
use tether_worker::{WorkerModule, math_module, serve_stdio};

#[derive(Parser)]
#[command(name = "tether-worker")]
#[command(about = "Worker process for Tether threads")]
#[command(version)]
struct Args {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Report this message as an initialization failure instead of serving
    #[arg(long, value_name = "MESSAGE")]
    fail_init: Option<String>,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Stdout carries frames, so logs go to stderr.
    let filter = if args.verbose {
        tracing_subscriber::EnvFilter::from_default_env()
            .add_directive(tracing::Level::DEBUG.into())
    } else {
        tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into())
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    if let Some(error_message) = args.fail_init {
        return report_init_failure(error_message);
    }

    let module: WorkerModule = math_module();
    tracing::debug!(pid = std::process::id(), "Worker started");
    serve_stdio(&module)?;
    Ok(())
}

fn report_init_failure(error_message: String) -> anyhow::Result<()> {
    tracing::error!("Worker failed to initialize: {}", error_message);
    let mut stdout = std::io::stdout().lock();
    tether_core::write_message(
        &mut stdout,
        &tether_core::WorkerMessage::UncaughtError { error_message },
    )?;
    Ok(())
}
