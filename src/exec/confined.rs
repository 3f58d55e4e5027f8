use crate::config::types::{ConfinedError, Result, SandboxConfig};
use crate::exec::builtins;
use crate::exec::function::{Args, CallContext, Function, FunctionRegistry};
use crate::exec::interpreter::{Frame, Interpreter, BUILTINS_NAME};
use crate::exec::script::Code;
use crate::protection::{Confinement, ProtectionStack, Site};
use crate::value::{Namespace, Value};

/// Run one function call under the config's protection stack.
///
/// This is the whole confined path for calls: the coordinator takes it
/// directly in-process and workers take it for every `Call` task.
pub fn run_call(config: &SandboxConfig, site: Site, function: &Function, args: &Args) -> Result<Value> {
    let confinement = Confinement::new(site, function.name());
    ProtectionStack::new(config, &confinement).run(|confinement, guard| {
        if guard.is_call_denied(function.name()) {
            return Err(ConfinedError::access_denied(format!(
                "call to '{}' is blocked",
                function.name()
            )));
        }
        let ctx = CallContext::new(confinement, config, guard);
        let call_args = args.proxied(guard);
        function.invoke(&ctx, &call_args)
    })
}

/// Run a code block against `globals` and `locals`, in place.
///
/// `__builtins__` is bound for the duration of the run and is gone again when
/// this returns, so callers never observe it in their namespaces.
pub fn run_code(
    config: &SandboxConfig,
    site: Site,
    registry: &FunctionRegistry,
    code: &Code,
    globals: &mut Namespace,
    locals: Option<&mut Namespace>,
) -> Result<()> {
    let confinement = Confinement::new(site, "execute");
    let mut frame = Frame::new(globals, locals);
    frame.inject(BUILTINS_NAME, callable_names(registry));

    ProtectionStack::new(config, &confinement).run(|confinement, guard| {
        let ctx = CallContext::new(confinement, config, guard);
        Interpreter::new(&ctx, registry).run(code, &mut frame)
    })
}

/// Names callable from a code block, builtins first
pub fn callable_names(registry: &FunctionRegistry) -> Value {
    Value::List(
        builtins::names()
            .chain(registry.names().filter(|name| builtins::lookup(name).is_none()))
            .map(Value::from)
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::SandboxError;
    use crate::exec::function::CallArgs;
    use crate::protection::builtin::{DenyCalls, DenyNames};

    fn site_label(ctx: &CallContext<'_>, _: &CallArgs<'_>) -> std::result::Result<Value, ConfinedError> {
        Ok(Value::from(ctx.confinement().site().to_string()))
    }

    fn registry() -> FunctionRegistry {
        [Function::new("site_label", site_label)].into_iter().collect()
    }

    #[test]
    fn call_receives_the_confinement_token() {
        let config = SandboxConfig::in_process();
        let value = run_call(
            &config,
            Site::InProcess,
            &Function::new("site_label", site_label),
            &Args::new(),
        )
        .unwrap();
        assert_eq!(value, Value::from("in-process"));
    }

    #[test]
    fn denied_direct_call_is_rejected() {
        let config = SandboxConfig::in_process().with_policy(DenyCalls::new(["site_label"]));
        let err = run_call(
            &config,
            Site::InProcess,
            &Function::new("site_label", site_label),
            &Args::new(),
        )
        .unwrap_err();
        assert_eq!(err.as_confined().unwrap().kind, "AccessDenied");
    }

    #[test]
    fn builtins_binding_is_visible_during_run_only() {
        let config = SandboxConfig::in_process();
        let mut globals = Namespace::new();
        let code = Code::parse("names = __builtins__; where = site_label()").unwrap();

        run_code(&config, Site::InProcess, &registry(), &code, &mut globals, None).unwrap();

        assert!(!globals.contains_key(BUILTINS_NAME));
        let Some(Value::List(names)) = globals.get("names") else {
            panic!("expected a list of names");
        };
        assert!(names.contains(&Value::from("len")));
        assert!(names.contains(&Value::from("site_label")));
        assert_eq!(globals.get("where"), Some(&Value::from("in-process")));
    }

    #[test]
    fn protection_failure_leaves_namespace_untouched() {
        let config = SandboxConfig::in_process().with_policy(DenyCalls::new([""]));
        let mut globals = Namespace::new();
        globals.insert("x", 1);
        let code = Code::parse("x = 2").unwrap();

        let err = run_code(&config, Site::InProcess, &registry(), &code, &mut globals, None).unwrap_err();
        assert!(matches!(err, SandboxError::Protection { .. }));
        assert_eq!(globals.get("x"), Some(&Value::Int(1)));
        assert!(!globals.contains_key(BUILTINS_NAME));
    }

    #[test]
    fn dunder_policy_blocks_builtins_handle_attributes() {
        let config = SandboxConfig::in_process().with_policy(DenyNames::dunder());
        let mut globals = Namespace::new();
        globals.insert("obj", Value::map());
        let code = Code::parse("obj.__globals__").unwrap();

        let err = run_code(&config, Site::InProcess, &registry(), &code, &mut globals, None).unwrap_err();
        assert_eq!(err.as_confined().unwrap().kind, "AccessDenied");
    }
}
