//! Built-in functions a `native` unit can export.

use std::time::Duration;

use isolet::registry::{ErrorValue, Function, Iter, Promise, Value};

/// Names accepted in a native unit's `exports` list.
pub const NAMES: &[&str] = &[
    "add", "mul", "concat", "echo", "delay", "range", "apply", "fail",
];

/// Upper bound for `range`, so a typo cannot allocate forever.
const MAX_RANGE: u64 = 1 << 20;

fn numbers(name: &str, args: &[Value]) -> Result<Vec<f64>, Value> {
    args.iter()
        .map(|arg| {
            arg.as_f64().ok_or_else(|| {
                Value::Error(ErrorValue::type_error(format!(
                    "{name} expects numbers, got {}",
                    arg.type_name()
                )))
            })
        })
        .collect()
}

pub fn lookup(name: &str) -> Option<Function> {
    let function = match name {
        "add" => Function::from_fn("add", 2, |_, args| async move {
            Ok(Value::Number(numbers("add", &args)?.into_iter().sum()))
        }),
        "mul" => Function::from_fn("mul", 2, |_, args| async move {
            Ok(Value::Number(numbers("mul", &args)?.into_iter().product()))
        }),
        "concat" => Function::from_fn("concat", 0, |_, args| async move {
            Ok(Value::String(args.iter().map(Value::to_string).collect()))
        }),
        "echo" => Function::from_fn("echo", 1, |_, args| async move {
            Ok(args.into_iter().next().unwrap_or_default())
        }),
        // delay(ms, value): a promise settling with `value` after `ms`.
        "delay" => Function::from_fn("delay", 2, |_, args| async move {
            let mut args = args.into_iter();
            let ms = args.next().and_then(|v| v.as_f64()).unwrap_or(0.0).max(0.0);
            let value = args.next().unwrap_or_default();
            Ok(Value::Promise(Promise::spawn(async move {
                tokio::time::sleep(Duration::from_millis(ms as u64)).await;
                Ok(value)
            })))
        }),
        "range" => Function::from_fn("range", 1, |_, args| async move {
            let end = args.first().and_then(Value::as_f64).unwrap_or(0.0).max(0.0) as u64;
            if end > MAX_RANGE {
                return Err(Value::Error(ErrorValue::new(
                    "RangeError",
                    format!("range is limited to {MAX_RANGE} items"),
                )));
            }
            Ok(Value::Iter(Iter::from_values((0..end).map(Value::from))))
        }),
        // apply(fn, ...args): calls back into whoever passed `fn`.
        "apply" => Function::from_fn("apply", 1, |_, args| async move {
            let mut args = args.into_iter();
            let Some(Value::Function(callback)) = args.next() else {
                return Err(Value::Error(ErrorValue::type_error(
                    "apply expects a function as its first argument",
                )));
            };
            callback.call(Value::Undefined, args.collect()).await
        }),
        "fail" => Function::from_fn("fail", 1, |_, args| async move {
            let message = args.first().map(Value::to_string).unwrap_or_default();
            Err(Value::Error(ErrorValue::error(message)))
        }),
        _ => return None,
    };
    Some(function)
}
