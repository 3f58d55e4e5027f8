use crate::config::types::ConfinedError;
use crate::value::{Namespace, Value};
use std::collections::BTreeSet;

/// A caller-owned namespace proxied in place for one confined run.
///
/// No copy is made: confined code reads and rebinds entries of the very map
/// the caller holds. Entries present when the run starts are sealed, so their
/// contents cannot be mutated through item or attribute assignment; confined
/// code may still rebind or delete the name, which drops the seal. Bindings
/// injected for the run are stripped when the proxy is dropped.
pub struct SealedNamespace<'n> {
    ns: &'n mut Namespace,
    sealed: BTreeSet<String>,
    injected: Vec<String>,
}

impl<'n> SealedNamespace<'n> {
    pub fn seal_in_place(ns: &'n mut Namespace) -> Self {
        let sealed = ns.keys().map(str::to_string).collect();
        Self {
            ns,
            sealed,
            injected: Vec::new(),
        }
    }

    pub fn lookup(&self, name: &str) -> Option<&Value> {
        self.ns.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.ns.contains_key(name)
    }

    pub fn is_sealed(&self, name: &str) -> bool {
        self.sealed.contains(name)
    }

    /// Bind `name` to a value created inside confinement
    pub fn bind(&mut self, name: &str, value: Value) {
        self.sealed.remove(name);
        self.injected.retain(|injected| injected != name);
        self.ns.insert(name, value);
    }

    pub fn unbind(&mut self, name: &str) -> Option<Value> {
        self.sealed.remove(name);
        self.injected.retain(|injected| injected != name);
        self.ns.remove(name)
    }

    /// Mutable access for in-place item/attribute assignment.
    ///
    /// Returns `Ok(None)` when the name is unbound and `AccessDenied` when the
    /// entry belongs to the caller.
    pub fn target_mut(&mut self, name: &str) -> Result<Option<&mut Value>, ConfinedError> {
        if self.sealed.contains(name) {
            return Err(ConfinedError::access_denied(format!(
                "'{}' is read-only inside confinement",
                name
            )));
        }
        Ok(self.ns.get_mut(name))
    }

    /// Bind a transient run-scoped value unless the caller already bound `name`
    pub fn inject(&mut self, name: &str, value: Value) {
        if !self.ns.contains_key(name) {
            self.ns.insert(name, value);
            self.injected.push(name.to_string());
        }
    }

    fn strip_injected(&mut self) {
        for name in self.injected.drain(..) {
            self.ns.remove(&name);
        }
    }
}

impl Drop for SealedNamespace<'_> {
    fn drop(&mut self) {
        self.strip_injected();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn caller_entries_are_read_only_until_rebound() {
        let mut ns = Namespace::new();
        ns.insert("data", Value::List(vec![Value::Int(1)]));
        {
            let mut sealed = SealedNamespace::seal_in_place(&mut ns);
            assert_eq!(sealed.target_mut("data").unwrap_err().kind, "AccessDenied");

            sealed.bind("data", Value::List(vec![]));
            assert!(sealed.target_mut("data").unwrap().is_some());
            assert!(sealed.target_mut("missing").unwrap().is_none());
        }
        assert_eq!(ns.get("data"), Some(&Value::List(vec![])));
    }

    #[test]
    fn injected_bindings_are_stripped_on_drop() {
        let mut ns = Namespace::new();
        ns.insert("keep", 1);
        {
            let mut sealed = SealedNamespace::seal_in_place(&mut ns);
            sealed.inject("__builtins__", Value::List(vec![]));
            sealed.bind("made", Value::Int(2));
            assert!(sealed.contains("__builtins__"));
        }
        assert!(!ns.contains_key("__builtins__"));
        assert_eq!(ns.len(), 2);
    }

    #[test]
    fn caller_binding_is_never_overwritten_by_injection() {
        let mut ns = Namespace::new();
        ns.insert("__builtins__", "caller");
        {
            let mut sealed = SealedNamespace::seal_in_place(&mut ns);
            sealed.inject("__builtins__", Value::List(vec![]));
        }
        assert_eq!(ns.get("__builtins__"), Some(&Value::from("caller")));
    }

    #[test]
    fn rebinding_an_injected_name_keeps_it() {
        let mut ns = Namespace::new();
        {
            let mut sealed = SealedNamespace::seal_in_place(&mut ns);
            sealed.inject("__builtins__", Value::None);
            sealed.bind("__builtins__", Value::Int(7));
        }
        assert_eq!(ns.get("__builtins__"), Some(&Value::Int(7)));
    }
}
