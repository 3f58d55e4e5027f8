//! Proxies handed to confined code: transparent reads, intercepted escapes

mod common;

use common::*;
use confine::capability::{AccessGuard, Proxy};
use confine::protection::builtin::DenyNames;
use confine::{
    Args, CallArgs, CallContext, Code, ConfinedError, ExecutionCoordinator, Function, Namespace,
    Value,
};
use std::collections::BTreeMap;

fn record() -> Value {
    let mut entries = BTreeMap::new();
    entries.insert("name".to_string(), Value::from("ada"));
    entries.insert("__secret".to_string(), Value::from("token"));
    entries.insert(
        "scores".to_string(),
        Value::List(vec![Value::Int(3), Value::Int(4)]),
    );
    Value::Map(entries)
}

#[test]
fn reads_are_transparent_and_escapes_are_blocked() {
    let mut guard = AccessGuard::new();
    guard.deny_prefix("__");
    let value = record();
    let proxy = Proxy::new(&value, &guard);

    assert_eq!(proxy.type_name(), "map");
    assert_eq!(proxy.len(), Some(3));
    assert_eq!(proxy.attr("name").unwrap().as_str(), Some("ada"));
    let scores: Vec<i64> = proxy
        .item(&Value::from("scores"))
        .unwrap()
        .iter()
        .unwrap()
        .filter_map(|p| p.as_int())
        .collect();
    assert_eq!(scores, [3, 4]);

    assert_eq!(proxy.attr("__secret").unwrap_err().kind, "AccessDenied");
    assert_eq!(
        proxy.item(&Value::from("__secret")).unwrap_err().kind,
        "AccessDenied"
    );
    // map keys themselves stay plain strings
    let keys: Vec<&str> = proxy.entries().unwrap().map(|(key, _)| key).collect();
    assert!(keys.contains(&"__secret"));
}

fn total(_: &CallContext<'_>, args: &CallArgs<'_>) -> Result<Value, ConfinedError> {
    let mut sum = 0;
    for item in args.require(0)?.iter()? {
        sum += item.as_int().unwrap_or(0);
    }
    if let Some(bonus) = args.keyword("bonus") {
        sum += bonus.as_int().unwrap_or(0);
    }
    Ok(Value::Int(sum))
}

#[test]
fn native_functions_see_proxied_arguments_in_every_mode() {
    let total = Function::new("total", total);
    for config in [in_process_config(), single_use_config()] {
        let mut registry = registry();
        registry.register(total);
        let coordinator = ExecutionCoordinator::with_registry(config, registry).unwrap();
        let args = Args::new()
            .arg(Value::List(vec![Value::Int(1), Value::Int(2), Value::Int(3)]))
            .kwarg("bonus", 10);
        assert_eq!(coordinator.call(&total, &args).unwrap(), Value::Int(16));
    }
}

#[test]
fn code_blocks_cannot_reach_denied_names() {
    for config in [in_process_config(), persistent_config()] {
        let coordinator = ExecutionCoordinator::with_registry(
            config.with_policy(DenyNames::new(["password"]).with_prefix("__")),
            registry(),
        )
        .unwrap();
        let mut globals = Namespace::new();
        globals.insert("user", record());

        coordinator
            .execute(&Code::parse("name = user.name").unwrap(), Some(&mut globals), None)
            .unwrap();
        assert_eq!(globals.get("name"), Some(&Value::from("ada")));

        for source in ["x = user.__secret", "x = user['__secret']", "x = {'password': 1}.password"] {
            let err = coordinator
                .execute(&Code::parse(source).unwrap(), Some(&mut globals), None)
                .unwrap_err();
            assert_eq!(err.as_confined().unwrap().kind, "AccessDenied", "{}", source);
        }
        assert!(!globals.contains_key("x"));
    }
}

#[test]
fn sealed_entries_reject_interior_mutation_in_workers_too() {
    let coordinator = ExecutionCoordinator::with_registry(persistent_config(), registry()).unwrap();
    let mut globals = Namespace::new();
    globals.insert("user", record());

    let err = coordinator
        .execute(&Code::parse("user.name = 'eve'").unwrap(), Some(&mut globals), None)
        .unwrap_err();
    assert_eq!(err.as_confined().unwrap().kind, "AccessDenied");
    assert_eq!(globals.get("user"), Some(&record()));

    // names created by the block itself stay mutable within it
    coordinator
        .execute(
            &Code::parse("copy = {'name': user.name}; copy.name = 'eve'").unwrap(),
            Some(&mut globals),
            None,
        )
        .unwrap();
    let mut expected = BTreeMap::new();
    expected.insert("name".to_string(), Value::from("eve"));
    assert_eq!(globals.get("copy"), Some(&Value::Map(expected)));
}
