//! Call command implementation for Tether CLI.
//!
//! Calls one worker method and prints its result as JSON.

use serde_json::Value;
use tether_core::Payload;
use tether_worker::buffer_arg;

use crate::worker::{WorkerOptions, open_thread};

/// Call `method` with the given arguments.
///
/// Each argument is parsed as JSON and falls back to a plain string.
/// Buffers are appended after the arguments as transfer descriptors.
pub async fn execute(
    options: &WorkerOptions,
    method: &str,
    args: &[String],
    buffers: &[String],
    pretty: bool,
) -> anyhow::Result<()> {
    let thread = open_thread(options).await?;

    let mut payloads: Vec<Payload> = args.iter().map(|arg| parse_arg(arg).into()).collect();
    payloads.extend(buffers.iter().map(|buf| buffer_arg(buf.as_bytes().to_vec())));

    tracing::debug!(method, args = payloads.len(), "Calling worker method");
    let outcome = match thread.call(method, payloads) {
        Ok(promise) => promise.await,
        Err(e) => Err(e),
    };

    // Shut the worker down before reporting, whatever the outcome.
    thread.terminate().await?;

    let value = outcome?.into_value();
    let rendered = if pretty {
        serde_json::to_string_pretty(&value)?
    } else {
        serde_json::to_string(&value)?
    };
    println!("{}", rendered);
    Ok(())
}

fn parse_arg(arg: &str) -> Value {
    serde_json::from_str(arg).unwrap_or_else(|_| Value::String(arg.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_arg() {
        assert_eq!(parse_arg("5"), json!(5));
        assert_eq!(parse_arg("-2.5"), json!(-2.5));
        assert_eq!(parse_arg("[1,2]"), json!([1, 2]));
        assert_eq!(parse_arg("\"quoted\""), json!("quoted"));
        assert_eq!(parse_arg("hello"), json!("hello"));
        assert_eq!(parse_arg("{broken"), json!("{broken"));
    }
}
