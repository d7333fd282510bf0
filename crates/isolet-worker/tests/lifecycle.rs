//! Drives the real worker binary through the controller.

use std::sync::Arc;
use std::time::Duration;

use isolet::bridge::codec::Framing;
use isolet::registry::{Function, Mapping, Object, Promise, ResponseMapping};
use isolet::{
    CallOptions, CommandSpawner, CreateError, ExitKind, InvokeError, StdioMode, Value, Worker,
    WorkerConfig, WorkerEvent,
};
use serde_json::json;

fn config() -> WorkerConfig {
    WorkerConfig::new()
        .with_spawner(Arc::new(CommandSpawner::new(env!("CARGO_BIN_EXE_isolet-worker"))))
        .with_stderr(StdioMode::Piped)
        .with_handshake_timeout(Duration::from_secs(10))
}

fn units() -> Vec<serde_json::Value> {
    vec![
        json!({
            "type": "native",
            "id": "math",
            "exports": ["add", "mul", "delay", "range", "apply", "echo", "fail"]
        }),
        json!({"type": "json", "id": "settings", "source": r#"{"retries": 3}"#}),
    ]
}

async fn start() -> Worker {
    Worker::create(units(), config()).await.unwrap()
}

fn link() -> CallOptions {
    CallOptions::new()
        .with_mapping(Mapping::Link)
        .with_response_mapping(ResponseMapping::Link)
}

#[tokio::test]
async fn add_then_kill() {
    let worker = start().await;
    let mut events = worker.subscribe();

    let sum = worker
        .invoke("math", "add", Value::Null, vec![2.into(), 3.into()], link())
        .await
        .unwrap();
    assert_eq!(sum, Value::Number(5.0));

    worker.kill();
    let err = worker
        .invoke("math", "add", Value::Null, vec![2.into(), 3.into()], link())
        .await
        .unwrap_err();
    assert!(matches!(err, InvokeError::WorkerExited(ref r) if r.kind == ExitKind::Kill));

    let reason = tokio::time::timeout(Duration::from_secs(5), worker.wait())
        .await
        .unwrap();
    assert_eq!(reason.kind, ExitKind::Kill);
    assert!(matches!(events.recv().await, Ok(WorkerEvent::Exit(r)) if r.kind == ExitKind::Kill));
}

#[tokio::test]
async fn lines_framing_works_too() {
    let worker = Worker::create(units(), config().with_serialization(Framing::Lines))
        .await
        .unwrap();
    let product = worker
        .invoke("math", "mul", Value::Null, vec![6.into(), 7.into()], link())
        .await
        .unwrap();
    assert_eq!(product, Value::Number(42.0));
}

#[tokio::test]
async fn json_units_and_json_mapping() {
    let worker = start().await;
    let options = CallOptions::new()
        .with_mapping(Mapping::Json)
        .with_response_mapping(ResponseMapping::Json);
    let retries = worker
        .invoke("settings", "retries", Value::Null, vec![], options)
        .await
        .unwrap();
    assert_eq!(retries, Value::Number(3.0));
}

#[tokio::test]
async fn application_errors_reject() {
    let worker = start().await;
    let err = worker
        .invoke("math", "fail", Value::Null, vec!["boom".into()], link())
        .await
        .unwrap_err()
        .into_value();
    let error = err.as_error().unwrap();
    assert_eq!((error.name.as_str(), error.message.as_str()), ("Error", "boom"));

    let err = worker
        .invoke("nope", "add", Value::Null, vec![], link())
        .await
        .unwrap_err()
        .into_value();
    assert_eq!(
        err.as_error().map(|e| e.message.as_str()),
        Some("Can not call method of unknown unit: nope")
    );
    // Rejections leave the worker usable.
    assert!(worker.exit_reason().is_none());
}

#[tokio::test]
async fn callbacks_run_in_the_controller() {
    let worker = start().await;
    let double = Function::from_fn("double", 1, |_, args| async move {
        Ok(Value::Number(args[0].as_f64().unwrap_or_default() * 2.0))
    });
    let result = worker
        .invoke("math", "apply", Value::Null, vec![double.into(), 21.into()], link())
        .await
        .unwrap();
    assert_eq!(result, Value::Number(42.0));
}

#[tokio::test]
async fn iterators_and_promises_cross_the_boundary() {
    let worker = start().await;

    let iter = worker
        .invoke("math", "range", Value::Null, vec![3.into()], link())
        .await
        .unwrap();
    let items = iter.as_iter().unwrap().collect().await.unwrap();
    assert_eq!(items, vec![Value::from(0), Value::from(1), Value::from(2)]);

    let late = worker
        .invoke("math", "delay", Value::Null, vec![20.into(), "late".into()], link())
        .await
        .unwrap();
    assert_eq!(late, Value::from("late"));

    let (promise, resolver) = Promise::pending();
    let holder = Object::from_entries([("p", Value::from(promise))]);
    let echoed = worker
        .invoke("math", "echo", Value::Null, vec![holder.into()], link())
        .await
        .unwrap();
    let shadow = echoed.member("p").unwrap();
    let shadow = shadow.as_promise().unwrap().clone();
    resolver.resolve(7);
    let settled = tokio::time::timeout(Duration::from_secs(5), shadow.wait())
        .await
        .unwrap();
    assert_eq!(settled, Ok(Value::Number(7.0)));
}

#[tokio::test]
async fn bad_units_fail_creation() {
    let units = vec![json!({"type": "native", "id": "x", "exports": ["eval"]})];
    let err = Worker::create(units, config()).await.unwrap_err();
    assert!(matches!(err, CreateError::Modules(_)));
    insta::assert_snapshot!(err.to_string(), @"unit x exports unknown native function eval");
}
