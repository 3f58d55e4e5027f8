//! Content errors look the same whichever mode ran the code

mod common;

use common::*;
use confine::protection::builtin::{DenyCalls, DenyNames};
use confine::value::MAX_NESTING;
use confine::{
    Args, Code, ExecutionCoordinator, Namespace, Protection, ProtectionContext, ProtectionError,
    SandboxConfig, SandboxError, Value,
};

fn modes(configure: impl Fn(SandboxConfig) -> SandboxConfig) -> Vec<(&'static str, ExecutionCoordinator)> {
    [
        ("in-process", in_process_config()),
        ("persistent", persistent_config()),
        ("single-use", single_use_config()),
    ]
    .into_iter()
    .map(|(label, config)| {
        let coordinator = ExecutionCoordinator::with_registry(configure(config), registry()).unwrap();
        (label, coordinator)
    })
    .collect()
}

/// Run `check` against every mode and require identical rendered errors
fn same_everywhere(
    configure: impl Fn(SandboxConfig) -> SandboxConfig,
    check: impl Fn(&ExecutionCoordinator) -> SandboxError,
) -> String {
    let rendered: Vec<(&str, String)> = modes(configure)
        .iter()
        .map(|(label, coordinator)| (*label, check(coordinator).to_string()))
        .collect();
    let (_, expected) = &rendered[0];
    for (label, message) in &rendered[1..] {
        assert_eq!(message, expected, "{} disagrees with in-process", label);
    }
    expected.clone()
}

fn run(coordinator: &ExecutionCoordinator, source: &str) -> SandboxError {
    let mut globals = Namespace::new();
    coordinator
        .execute(&Code::parse(source).unwrap(), Some(&mut globals), None)
        .unwrap_err()
}

#[test]
fn raised_errors_keep_kind_and_message() {
    let rendered = same_everywhere(|c| c, |c| run(c, "raise LookupError('no such row: 7')"));
    assert_eq!(rendered, "LookupError: no such row: 7");
}

#[test]
fn evaluation_errors_match() {
    let cases = [
        ("x = missing", "NameError: name 'missing' is not defined"),
        ("x = 1 // 0", "ZeroDivisionError"),
        ("x = [1, 2][5]", "IndexError"),
        ("x = {'a': 1}['b']", "KeyError"),
        ("x = len(3)", "TypeError"),
        ("x = int('nope')", "ValueError"),
    ];
    for (source, prefix) in cases {
        let rendered = same_everywhere(|c| c, |c| run(c, source));
        assert!(rendered.starts_with(prefix), "{}: {}", source, rendered);
    }
}

#[test]
fn native_function_errors_match() {
    let rendered = same_everywhere(
        |c| c,
        |c| c.call(&REJECT, &Args::new().arg("quota")).unwrap_err(),
    );
    assert_eq!(rendered, "ValueError: bad input: quota");

    let rendered = same_everywhere(|c| c, |c| c.call(&ADD, &Args::new().arg(1)).unwrap_err());
    assert!(rendered.starts_with("TypeError: add() takes 2"), "{}", rendered);
}

#[test]
fn panics_match() {
    let rendered = same_everywhere(|c| c, |c| c.call(&EXPLODE, &Args::new()).unwrap_err());
    assert_eq!(rendered, "Panic: native function exploded");
}

#[test]
fn access_denials_match() {
    let rendered = same_everywhere(
        |c| c.with_policy(DenyNames::dunder()),
        |c| c.call(&INTROSPECT, &Args::new().arg("text")).unwrap_err(),
    );
    assert!(rendered.starts_with("AccessDenied"), "{}", rendered);

    let rendered = same_everywhere(
        |c| c.with_policy(DenyCalls::new(["add"])),
        |c| run(c, "x = add(1, 2)"),
    );
    assert!(rendered.starts_with("AccessDenied"), "{}", rendered);
}

#[derive(Debug)]
struct Unavailable;

impl Protection for Unavailable {
    fn name(&self) -> &str {
        "unavailable"
    }

    fn enable(&self, _: &mut ProtectionContext<'_>) -> Result<(), ProtectionError> {
        Err(ProtectionError::new("backing service is down"))
    }

    fn disable(&self, _: &mut ProtectionContext<'_>) -> Result<(), ProtectionError> {
        Ok(())
    }
}

#[test]
fn protection_failures_match() {
    let rendered = same_everywhere(
        |c| c.with_policy(Unavailable),
        |c| c.call(&ADD, &Args::new().arg(1).arg(2)).unwrap_err(),
    );
    assert_eq!(rendered, "Protection 'unavailable' failed: backing service is down");
}

#[test]
fn syntax_errors_surface_before_dispatch() {
    let err = Code::parse("x = (1 +").unwrap_err();
    assert_eq!(err.kind, "SyntaxError");
    assert!(err.message.starts_with("line 1"), "{}", err.message);
}

#[test]
fn oversized_allocations_are_memory_errors_everywhere() {
    let cases = [
        "s = 'ab' * 4611686018427387904",
        "l = [0] * 1000000000000000000",
        "l = [] * 9223372036854775807 + [0] * 1000000000000000000",
        "r = range(1000000000000000000)",
    ];
    for source in cases {
        let rendered = same_everywhere(|c| c, |c| run(c, source));
        assert!(rendered.starts_with("MemoryError"), "{}: {}", source, rendered);
    }
}

#[test]
fn persistent_worker_survives_resource_errors() {
    let coordinator = ExecutionCoordinator::with_registry(persistent_config(), registry()).unwrap();
    let pid = as_pid(coordinator.call(&GETPID, &no_args()).unwrap());

    let err = run(&coordinator, "s = 'ab' * 100000000000000");
    assert!(matches!(err, SandboxError::Confined(ref e) if e.kind == "MemoryError"), "{}", err);
    assert_eq!(as_pid(coordinator.call(&GETPID, &no_args()).unwrap()), pid);
}

fn sum_of_ones(terms: usize) -> String {
    format!("x = {}", vec!["1"; terms].join(" + "))
}

#[test]
fn long_expressions_agree_up_to_the_nesting_cap() {
    let code = Code::parse(&sum_of_ones(MAX_NESTING)).unwrap();
    for (label, coordinator) in modes(|c| c) {
        let mut globals = Namespace::new();
        coordinator
            .execute(&code, Some(&mut globals), None)
            .unwrap_or_else(|e| panic!("{}: {}", label, e));
        assert_eq!(globals.get("x"), Some(&Value::Int(MAX_NESTING as i64)), "{}", label);
    }

    let err = Code::parse(&sum_of_ones(80)).unwrap_err();
    assert_eq!(err.kind, "SyntaxError");
}

fn nested_list(levels: usize) -> Value {
    let mut value = Value::Int(0);
    for _ in 1..levels {
        value = Value::List(vec![value]);
    }
    value
}

#[test]
fn deepest_allowed_globals_cross_the_boundary() {
    for (label, coordinator) in modes(|c| c) {
        let mut globals = Namespace::new();
        globals.insert("deep", nested_list(MAX_NESTING));
        coordinator
            .execute(&Code::parse("copy = deep").unwrap(), Some(&mut globals), None)
            .unwrap_or_else(|e| panic!("{}: {}", label, e));
        assert_eq!(globals.get("copy"), Some(&nested_list(MAX_NESTING)), "{}", label);
    }
}

#[test]
fn overly_deep_globals_are_refused_without_losing_the_worker() {
    let coordinator = ExecutionCoordinator::with_registry(persistent_config(), registry()).unwrap();
    let pid = as_pid(coordinator.call(&GETPID, &no_args()).unwrap());

    let mut globals = Namespace::new();
    globals.insert("deep", nested_list(70));
    let err = coordinator
        .execute(&Code::parse("y = 1").unwrap(), Some(&mut globals), None)
        .unwrap_err();
    assert!(matches!(err, SandboxError::Transmission(_)), "{}", err);
    assert_eq!(as_pid(coordinator.call(&GETPID, &no_args()).unwrap()), pid);

    // Values built too deep inside the worker are refused on the way back.
    let mut globals = Namespace::new();
    let source = std::iter::once("a = 1".to_string())
        .chain((0..MAX_NESTING).map(|_| "a = [a]".to_string()))
        .collect::<Vec<_>>()
        .join("\n");
    let err = coordinator
        .execute(&Code::parse(&source).unwrap(), Some(&mut globals), None)
        .unwrap_err();
    assert!(matches!(err, SandboxError::Transmission(_)), "{}", err);
    assert_eq!(as_pid(coordinator.call(&GETPID, &no_args()).unwrap()), pid);
}
