use crate::capability::{AccessGuard, Proxy};
use crate::config::types::{ConfinedError, SandboxConfig};
use crate::protection::Confinement;
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Body of a function callable under confinement.
///
/// Only plain `fn` items fit this type. A closure that captures its defining
/// scope does not, so nothing a function needs can stay behind when the call
/// is shipped to a worker: every input arrives through [`CallArgs`].
pub type NativeFn = fn(&CallContext<'_>, &CallArgs<'_>) -> Result<Value, ConfinedError>;

/// A named native function
#[derive(Clone, Copy)]
pub struct Function {
    name: &'static str,
    body: NativeFn,
}

impl Function {
    pub const fn new(name: &'static str, body: NativeFn) -> Self {
        Self { name, body }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn invoke(&self, ctx: &CallContext<'_>, args: &CallArgs<'_>) -> Result<Value, ConfinedError> {
        (self.body)(ctx, args)
    }
}

impl fmt::Debug for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Function").field("name", &self.name).finish()
    }
}

/// Functions a coordinator can ship to its workers, by name.
///
/// Workers are forked from the coordinator and inherit this table, so a task
/// only has to carry the function's name.
#[derive(Clone, Debug, Default)]
pub struct FunctionRegistry {
    functions: BTreeMap<&'static str, Function>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `function`, returning any function previously bound to its name
    pub fn register(&mut self, function: Function) -> Option<Function> {
        self.functions.insert(function.name(), function)
    }

    pub fn get(&self, name: &str) -> Option<&Function> {
        self.functions.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.functions.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}

impl FromIterator<Function> for FunctionRegistry {
    fn from_iter<I: IntoIterator<Item = Function>>(iter: I) -> Self {
        let mut registry = Self::new();
        for function in iter {
            registry.register(function);
        }
        registry
    }
}

/// Arguments of a call, owned by the caller
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Args {
    pub positional: Vec<Value>,
    pub keywords: BTreeMap<String, Value>,
}

impl Args {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.positional.push(value.into());
        self
    }

    pub fn kwarg(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.keywords.insert(name.into(), value.into());
        self
    }

    /// Proxy every argument for one confined call; keyword names stay plain
    pub fn proxied<'a>(&'a self, guard: &'a AccessGuard) -> CallArgs<'a> {
        CallArgs {
            positional: self
                .positional
                .iter()
                .map(|value| Proxy::new(value, guard))
                .collect(),
            keywords: self
                .keywords
                .iter()
                .map(|(name, value)| (name.as_str(), Proxy::new(value, guard)))
                .collect(),
        }
    }
}

impl<V: Into<Value>> FromIterator<V> for Args {
    fn from_iter<I: IntoIterator<Item = V>>(iter: I) -> Self {
        Self {
            positional: iter.into_iter().map(Into::into).collect(),
            keywords: BTreeMap::new(),
        }
    }
}

/// Arguments as seen by a native function: read-only proxies
#[derive(Debug, Default)]
pub struct CallArgs<'a> {
    positional: Vec<Proxy<'a>>,
    keywords: BTreeMap<&'a str, Proxy<'a>>,
}

impl<'a> CallArgs<'a> {
    pub(crate) fn from_parts(
        positional: Vec<Proxy<'a>>,
        keywords: BTreeMap<&'a str, Proxy<'a>>,
    ) -> Self {
        Self {
            positional,
            keywords,
        }
    }

    pub fn len(&self) -> usize {
        self.positional.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positional.is_empty() && self.keywords.is_empty()
    }

    pub fn positional(&self) -> &[Proxy<'a>] {
        &self.positional
    }

    pub fn get(&self, index: usize) -> Option<Proxy<'a>> {
        self.positional.get(index).copied()
    }

    pub fn keyword(&self, name: &str) -> Option<Proxy<'a>> {
        self.keywords.get(name).copied()
    }

    pub fn keywords(&self) -> impl Iterator<Item = (&'a str, Proxy<'a>)> + '_ {
        self.keywords.iter().map(|(name, value)| (*name, *value))
    }

    pub fn require(&self, index: usize) -> Result<Proxy<'a>, ConfinedError> {
        self.get(index).ok_or_else(|| {
            ConfinedError::type_error(format!("missing required positional argument #{}", index))
        })
    }

    pub fn int(&self, index: usize) -> Result<i64, ConfinedError> {
        let arg = self.require(index)?;
        arg.as_int().ok_or_else(|| {
            ConfinedError::type_error(format!(
                "argument #{} must be int, not {}",
                index,
                arg.type_name()
            ))
        })
    }

    pub fn float(&self, index: usize) -> Result<f64, ConfinedError> {
        let arg = self.require(index)?;
        arg.as_float().ok_or_else(|| {
            ConfinedError::type_error(format!(
                "argument #{} must be a number, not {}",
                index,
                arg.type_name()
            ))
        })
    }

    pub fn str(&self, index: usize) -> Result<&'a str, ConfinedError> {
        let arg = self.require(index)?;
        arg.as_str().ok_or_else(|| {
            ConfinedError::type_error(format!(
                "argument #{} must be str, not {}",
                index,
                arg.type_name()
            ))
        })
    }

    /// Fail with `TypeError` unless exactly `count` positional arguments were passed
    pub fn expect_len(&self, function: &str, count: usize) -> Result<(), ConfinedError> {
        if self.positional.len() != count {
            return Err(ConfinedError::type_error(format!(
                "{}() takes {} positional argument(s) but {} were given",
                function,
                count,
                self.positional.len()
            )));
        }
        Ok(())
    }
}

/// Context handed to a native function during a confined call
pub struct CallContext<'a> {
    confinement: &'a Confinement,
    config: &'a SandboxConfig,
    guard: &'a AccessGuard,
}

impl<'a> CallContext<'a> {
    pub(crate) fn new(
        confinement: &'a Confinement,
        config: &'a SandboxConfig,
        guard: &'a AccessGuard,
    ) -> Self {
        Self {
            confinement,
            config,
            guard,
        }
    }

    pub fn confinement(&self) -> &'a Confinement {
        self.confinement
    }

    pub fn config(&self) -> &'a SandboxConfig {
        self.config
    }

    pub fn guard(&self) -> &'a AccessGuard {
        self.guard
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn add(_: &CallContext<'_>, args: &CallArgs<'_>) -> Result<Value, ConfinedError> {
        Ok(Value::Int(args.int(0)? + args.int(1)?))
    }

    #[test]
    fn registry_resolves_by_name() {
        let registry: FunctionRegistry = [Function::new("add", add)].into_iter().collect();
        assert!(registry.contains("add"));
        assert_eq!(registry.names().collect::<Vec<_>>(), vec!["add"]);
        assert!(registry.get("sub").is_none());
    }

    #[test]
    fn proxied_args_expose_reads_only() {
        let args = Args::new().arg(2).arg("two").kwarg("scale", 1.5);
        let guard = AccessGuard::new();
        let call_args = args.proxied(&guard);

        assert_eq!(call_args.len(), 2);
        assert_eq!(call_args.int(0).unwrap(), 2);
        assert_eq!(call_args.str(1).unwrap(), "two");
        assert_eq!(call_args.keyword("scale").unwrap().as_float(), Some(1.5));
        assert_eq!(call_args.int(1).unwrap_err().kind, "TypeError");
        assert_eq!(call_args.require(5).unwrap_err().kind, "TypeError");
    }

    #[test]
    fn args_collect_from_values() {
        let args: Args = vec![Value::Int(1), Value::Int(2)].into_iter().collect();
        assert_eq!(args, Args::new().arg(1).arg(2));
    }
}
