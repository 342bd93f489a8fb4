//! Tether CLI - call worker methods from the command line.

mod call;
mod colors;
mod methods;
mod worker;

use clap::{Parser, Subcommand};

use crate::worker::WorkerOptions;

#[derive(Parser)]
#[command(name = "tether")]
#[command(about = "Call methods on Tether worker threads")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[command(flatten)]
    worker: WorkerOptions,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// List the methods the worker exposes
    Methods,

    /// Call a worker method and print its result as JSON
    Call {
        /// Method name
        method: String,

        /// Arguments, parsed as JSON or taken as strings
        #[arg(allow_negative_numbers = true)]
        args: Vec<String>,

        /// Send this text as a transferred buffer (repeatable)
        #[arg(long = "buffer", value_name = "TEXT")]
        buffers: Vec<String>,

        /// Pretty-print the result
        #[arg(long)]
        pretty: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
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

    match cli.command {
        Commands::Methods => methods::execute(&cli.worker).await?,

        Commands::Call {
            method,
            args,
            buffers,
            pretty,
        } => {
            call::execute(&cli.worker, &method, &args, &buffers, pretty).await?;
        }
    }

    Ok(())
}
