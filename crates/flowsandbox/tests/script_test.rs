use flowsandbox::script::{evaluate, FailureKind, ScriptOptions};
use flowsandbox::Bindings;
use serde_json::json;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::{Duration, Instant};

fn bindings(value: serde_json::Value) -> Bindings {
    value.as_object().cloned().unwrap_or_default()
}

#[test]
fn test_output_binding_is_the_result() {
    let outcome = evaluate(
        "output.sum = inputs.a + b\noutput.items = { 'x', 'y' }",
        &bindings(json!({ "a": 2, "b": 3 })),
        &ScriptOptions::default(),
    )
    .unwrap();

    assert_eq!(outcome.output["sum"], json!(5));
    assert_eq!(outcome.output["items"], json!(["x", "y"]));
}

#[test]
fn test_print_is_captured() {
    let outcome = evaluate(
        "print('hello', 42)\nprint(nil)",
        &Bindings::new(),
        &ScriptOptions::default(),
    )
    .unwrap();

    assert_eq!(outcome.logs, vec!["hello\t42".to_string(), "nil".to_string()]);
    assert!(outcome.output.is_empty());
}

#[test]
fn test_only_scoped_capabilities_are_visible() {
    let outcome = evaluate(
        r#"
        output.io = io == nil
        output.os = os == nil
        output.debug = debug == nil
        output.package = package == nil
        output.load = load == nil
        output.dofile = dofile == nil
        output.require = require == nil
        output.string = string ~= nil
        output.math = math ~= nil
        "#,
        &Bindings::new(),
        &ScriptOptions::default(),
    )
    .unwrap();

    for (name, visible) in &outcome.output {
        assert_eq!(visible, &json!(true), "capability check failed for {}", name);
    }
}

#[test]
fn test_bindings_do_not_shadow_libraries() {
    let outcome = evaluate(
        "output.kind = type(string)",
        &bindings(json!({ "string": "shadow" })),
        &ScriptOptions::default(),
    )
    .unwrap();
    assert_eq!(outcome.output["kind"], json!("table"));
}

#[test]
fn test_division_by_zero_is_an_error() {
    let failure = evaluate(
        "print('before')\nlocal x = inputs.value // 0\noutput.x = x",
        &bindings(json!({ "value": 10 })),
        &ScriptOptions::default(),
    )
    .unwrap_err();

    assert_eq!(failure.kind, FailureKind::Error);
    assert!(failure.message.contains("n//0"), "message: {}", failure.message);
    assert_eq!(failure.logs, vec!["before".to_string()]);
}

#[test]
fn test_float_division_by_zero_is_an_error() {
    let failure = evaluate(
        "output.x = inputs.value / 0",
        &bindings(json!({ "value": 10 })),
        &ScriptOptions::default(),
    )
    .unwrap_err();

    assert_eq!(failure.kind, FailureKind::Error);
    assert!(failure.message.contains("non-finite"), "message: {}", failure.message);
    assert!(failure.message.contains("output.x"), "message: {}", failure.message);
}

#[test]
fn test_nan_nested_in_output_is_an_error() {
    let failure = evaluate(
        "output.stats = { mean = 0 / 0 }\noutput.self = output",
        &Bindings::new(),
        &ScriptOptions::default(),
    )
    .unwrap_err();

    assert!(failure.message.contains("output.stats.mean"), "message: {}", failure.message);
}

#[test]
fn test_syntax_error() {
    let failure = evaluate("output.x = ", &Bindings::new(), &ScriptOptions::default()).unwrap_err();
    assert_eq!(failure.kind, FailureKind::Error);
}

#[test]
fn test_deadline_stops_busy_loop() {
    let options = ScriptOptions {
        deadline: Some(Instant::now() + Duration::from_millis(200)),
        ..ScriptOptions::default()
    };
    let started = Instant::now();
    let failure = evaluate("while true do end", &Bindings::new(), &options).unwrap_err();

    assert_eq!(failure.kind, FailureKind::DeadlineExceeded);
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[test]
fn test_interrupt_flag() {
    let options = ScriptOptions {
        interrupt: Some(Arc::new(AtomicBool::new(true))),
        ..ScriptOptions::default()
    };
    let failure = evaluate("while true do end", &Bindings::new(), &options).unwrap_err();
    assert_eq!(failure.kind, FailureKind::Interrupted);
}

#[test]
fn test_scalar_output_is_wrapped() {
    let outcome = evaluate("output = 7", &Bindings::new(), &ScriptOptions::default()).unwrap();
    assert_eq!(outcome.output["result"], json!(7));
}
