//! Function table resolution, argument decoding, and result bindings.

use roam::engine::child::{OUTCOME_MARKER, execute, parse_output};
use roam::model::{FailureKind, JobStatus};
use roam::payload::{FunctionRef, Payload, PayloadBuilder};
use roam::registry::{CallError, FunctionRegistry, builtin};
use serde_json::json;

fn payload(function: &str) -> PayloadBuilder {
    PayloadBuilder::new(FunctionRef::new(function))
}

#[test]
fn standard_functions_produce_expected_values() {
    let registry = builtin::standard();

    let two = registry.invoke(&payload("add_numbers").build().unwrap()).unwrap();
    assert_eq!(two, json!(2));

    let twelve = registry
        .invoke(&payload("multiply").kwarg("a", &3).kwarg("b", &4).build().unwrap())
        .unwrap();
    assert_eq!(twelve, json!(12));

    let greeting = registry
        .invoke(&payload("greet").arg("World").kwarg("greeting", "Hi").build().unwrap())
        .unwrap();
    assert_eq!(greeting, json!("Hi, World!"));

    let default_greeting = registry
        .invoke(&payload("greet").arg("World").build().unwrap())
        .unwrap();
    assert_eq!(default_greeting, json!("Hello, World!"));

    let fib = registry
        .invoke(&payload("fibonacci").arg(&10).build().unwrap())
        .unwrap();
    assert_eq!(fib, json!(55));
}

#[test]
fn division_by_zero_is_a_call_error() {
    let registry = builtin::standard();
    let err = registry
        .invoke(&payload("divide").arg(&1).arg(&0).build().unwrap())
        .unwrap_err();
    assert!(err.message.contains("division by zero"));
    assert!(err.trace.is_some());
}

#[test]
fn missing_and_mistyped_arguments_are_reported() {
    let registry = builtin::standard();

    let err = registry
        .invoke(&payload("multiply").arg(&3).build().unwrap())
        .unwrap_err();
    assert!(err.message.contains("missing required argument `b`"), "{}", err.message);

    let err = registry
        .invoke(&payload("fibonacci").arg("ten").build().unwrap())
        .unwrap_err();
    assert!(err.message.contains("wrong type"), "{}", err.message);
}

#[test]
fn unknown_function_and_version_are_rejected() {
    let registry = builtin::standard();
    let err = registry
        .invoke(&payload("does_not_exist").build().unwrap())
        .unwrap_err();
    assert!(err.message.contains("not registered"));

    let mut old = payload("add_numbers").build().unwrap();
    old.version = 99;
    let err = registry.invoke(&old).unwrap_err();
    assert!(err.message.contains("encoding version 99"));
}

#[test]
fn slot_binding_extracts_the_named_value() {
    let registry = builtin::standard();
    let mean = registry
        .invoke(
            &payload("describe")
                .arg(&[2.0, 4.0, 9.0])
                .bind_result("mean")
                .build()
                .unwrap(),
        )
        .unwrap();
    assert_eq!(mean, json!(5.0));

    let err = registry
        .invoke(
            &payload("describe")
                .arg(&[1.0])
                .bind_result("median")
                .build()
                .unwrap(),
        )
        .unwrap_err();
    assert_eq!(err.message, "result slot `median` was never assigned");
}

#[test]
fn custom_registrations_replace_previous_definitions() {
    let mut registry = FunctionRegistry::empty();
    registry.register("answer", |_| Ok(json!(41)));
    registry.register("answer", |_| Ok(json!(42)));
    registry.register("nope", |_| Err(CallError::new("refused")));

    assert_eq!(registry.names().collect::<Vec<_>>(), vec!["answer", "nope"]);
    let answer = registry.invoke(&payload("answer").build().unwrap()).unwrap();
    assert_eq!(answer, json!(42));
}

#[test]
fn in_process_execution_turns_panics_into_failures() {
    let mut registry = FunctionRegistry::empty();
    registry.register("explode", |_| panic!("kaboom"));

    let outcome = execute(&registry, &payload("explode").build().unwrap());
    assert!(!outcome.success);
    assert_eq!(outcome.kind, Some(FailureKind::UserError));
    assert_eq!(outcome.error.as_deref(), Some("panicked: kaboom"));
    assert!(outcome.trace.as_ref().unwrap().contains("kaboom"));
    assert_eq!(outcome.status(), JobStatus::Failed);
}

#[test]
fn in_process_execution_success_and_failure() {
    let registry = builtin::standard();
    let ok = execute(&registry, &payload("add_numbers").build().unwrap());
    assert!(ok.success);
    assert_eq!(ok.return_value, Some(json!(2)));
    assert_eq!(ok.status(), JobStatus::Completed);

    let bad: Payload = payload("divide").arg(&1).arg(&0).build().unwrap();
    let failed = execute(&registry, &bad);
    assert!(!failed.success);
    assert_eq!(failed.error.as_deref(), Some("division by zero"));
}

#[test]
fn outcome_line_is_found_after_user_output() {
    let stdout = format!(
        "hello\n{OUTCOME_MARKER}not json\nmore\n\n{OUTCOME_MARKER}{}\n",
        json!({"success": true, "return_value": 2})
    );
    let (user, outcome) = parse_output(&stdout).unwrap();
    assert_eq!(user, format!("hello\n{OUTCOME_MARKER}not json\nmore\n"));
    assert_eq!(outcome.return_value, Some(json!(2)));

    assert!(parse_output("just text\n").is_none());
    assert!(parse_output(&format!("\n{OUTCOME_MARKER}{{broken\n")).is_none());
}
