//! Demo module used by the `tether-worker` binary and the CLI.

use std::time::Duration;

use serde_json::{Number, Value};
use tether_core::{Payload, TransferDescriptor};

use crate::error::Error;
use crate::module::WorkerModule;

/// Arithmetic and buffer helpers.
///
/// | method     | arguments          | result                          |
/// |------------|--------------------|---------------------------------|
/// | `add`      | two numbers        | sum                             |
/// | `sub`      | two numbers        | difference                      |
/// | `mul`      | two numbers        | product                         |
/// | `div`      | two numbers        | quotient, fails on zero divisor |
/// | `echo`     | anything           | the first argument, unchanged   |
/// | `byte_len` | transfer buffers   | total length of the buffers     |
/// | `sleep`    | milliseconds       | the same number, after waiting  |
pub fn math_module() -> WorkerModule {
    WorkerModule::new()
        .method_typed("add", |(a, b): (Number, Number)| {
            arithmetic(&a, &b, i64::checked_add, |a, b| a + b)
        })
        .method_typed("sub", |(a, b): (Number, Number)| {
            arithmetic(&a, &b, i64::checked_sub, |a, b| a - b)
        })
        .method_typed("mul", |(a, b): (Number, Number)| {
            arithmetic(&a, &b, i64::checked_mul, |a, b| a * b)
        })
        .method_typed("div", |(a, b): (Number, Number)| divide(&a, &b))
        .method("echo", |args: Vec<Payload>| {
            Ok(args.into_iter().next().unwrap_or(Payload::Value(Value::Null)))
        })
        .method("byte_len", |args: Vec<Payload>| {
            let total: usize = args
                .iter()
                .flat_map(|arg| arg.transferables())
                .map(|buf| buf.len())
                .sum();
            Ok(Payload::from(Value::from(total)))
        })
        .method_typed("sleep", |(millis,): (u64,)| {
            std::thread::sleep(Duration::from_millis(millis));
            Ok::<_, Error>(millis)
        })
}

/// Integer math when both sides are integers and the result fits, float otherwise.
fn arithmetic(
    a: &Number,
    b: &Number,
    int: fn(i64, i64) -> Option<i64>,
    float: fn(f64, f64) -> f64,
) -> Result<Value, String> {
    if let (Some(a), Some(b)) = (a.as_i64(), b.as_i64())
        && let Some(result) = int(a, b)
    {
        return Ok(Value::from(result));
    }
    float_value(float(to_f64(a)?, to_f64(b)?))
}

fn divide(a: &Number, b: &Number) -> Result<Value, String> {
    let divisor = to_f64(b)?;
    if divisor == 0.0 {
        return Err("division by zero".to_string());
    }

    if let (Some(a), Some(b)) = (a.as_i64(), b.as_i64())
        && a.checked_rem(b) == Some(0)
        && let Some(result) = a.checked_div(b)
    {
        return Ok(Value::from(result));
    }
    float_value(to_f64(a)? / divisor)
}

fn to_f64(n: &Number) -> Result<f64, String> {
    n.as_f64().ok_or_else(|| format!("not a finite number: {}", n))
}

fn float_value(value: f64) -> Result<Value, String> {
    Number::from_f64(value)
        .map(Value::Number)
        .ok_or_else(|| format!("result is not finite: {}", value))
}

/// Wrap raw bytes so they are moved to the worker rather than copied.
pub fn buffer_arg(bytes: Vec<u8>) -> Payload {
    TransferDescriptor::buffer(bytes.into()).into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn call(method: &str, args: &[Value]) -> crate::error::Result<Value> {
        math_module()
            .invoke(method, args.iter().cloned().map(Payload::from).collect())
            .map(Payload::into_value)
    }

    #[test]
    fn test_integer_arithmetic() {
        assert_eq!(call("add", &[json!(2), json!(3)]).unwrap(), json!(5));
        assert_eq!(call("sub", &[json!(2), json!(3)]).unwrap(), json!(-1));
        assert_eq!(call("mul", &[json!(4), json!(-3)]).unwrap(), json!(-12));
        assert_eq!(call("div", &[json!(9), json!(3)]).unwrap(), json!(3));
    }

    #[test]
    fn test_float_arithmetic() {
        assert_eq!(call("add", &[json!(0.5), json!(2)]).unwrap(), json!(2.5));
        assert_eq!(call("div", &[json!(7), json!(2)]).unwrap(), json!(3.5));
        // Overflowing integers fall back to floats.
        assert!(call("mul", &[json!(i64::MAX), json!(2)]).unwrap().is_f64());
    }

    #[test]
    fn test_division_by_zero() {
        let err = call("div", &[json!(1), json!(0)]).unwrap_err();
        assert_eq!(err.to_string(), "division by zero");

        let err = call("div", &[json!(1.5), json!(0.0)]).unwrap_err();
        assert_eq!(err.to_string(), "division by zero");
    }

    #[test]
    fn test_wrong_arity() {
        assert!(matches!(
            call("add", &[json!(1)]),
            Err(Error::InvalidArguments { .. })
        ));
    }

    #[test]
    fn test_echo() {
        let value = json!({"nested": [1, "two", null]});
        assert_eq!(call("echo", &[value.clone()]).unwrap(), value);
        assert_eq!(call("echo", &[]).unwrap(), Value::Null);
    }

    #[test]
    fn test_byte_len_counts_transferred_buffers() {
        let result = math_module()
            .invoke(
                "byte_len",
                vec![buffer_arg(vec![0; 3]), json!(1).into(), buffer_arg(vec![0; 5])],
            )
            .unwrap();
        assert_eq!(result.into_value(), json!(8));
    }

    #[test]
    fn test_sleep_returns_its_argument() {
        assert_eq!(call("sleep", &[json!(1)]).unwrap(), json!(1));
    }
}
