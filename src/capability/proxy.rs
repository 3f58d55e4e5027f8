use crate::capability::guard::AccessGuard;
use crate::config::types::ConfinedError;
use crate::value::Value;
use std::collections::btree_map;
use std::fmt;
use std::slice;

/// Read-only view of a value handed to confined code.
///
/// A proxy borrows both the value and the run's [`AccessGuard`], so it cannot
/// outlive the confined call that created it. Reads and iteration pass
/// through; attribute and item lookups are checked against the guard and the
/// results are proxied again. There is no way to obtain `&mut` to the target.
#[derive(Clone, Copy)]
pub struct Proxy<'a> {
    value: &'a Value,
    guard: &'a AccessGuard,
}

impl<'a> Proxy<'a> {
    pub fn new(value: &'a Value, guard: &'a AccessGuard) -> Self {
        Self { value, guard }
    }

    pub(crate) fn target(&self) -> &'a Value {
        self.value
    }

    pub fn guard(&self) -> &'a AccessGuard {
        self.guard
    }

    pub fn type_name(&self) -> &'static str {
        self.value.type_name()
    }

    pub fn is_none(&self) -> bool {
        matches!(self.value, Value::None)
    }

    pub fn is_truthy(&self) -> bool {
        self.value.is_truthy()
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self.value {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self.value {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Numeric value, widening ints
    pub fn as_float(&self) -> Option<f64> {
        match self.value {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&'a str> {
        match self.value {
            Value::Str(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&'a [u8]> {
        match self.value {
            Value::Bytes(b) => Some(b.as_slice()),
            _ => None,
        }
    }

    /// Length of strings, bytes, lists, and maps
    pub fn len(&self) -> Option<usize> {
        match self.value {
            Value::Str(s) => Some(s.chars().count()),
            Value::Bytes(b) => Some(b.len()),
            Value::List(items) => Some(items.len()),
            Value::Map(entries) => Some(entries.len()),
            _ => None,
        }
    }

    /// Deep copy of the target; the copy is owned by the caller of this method
    pub fn to_value(&self) -> Value {
        self.value.clone()
    }

    /// Attribute lookup; attributes of a map are its keys
    pub fn attr(&self, name: &str) -> Result<Proxy<'a>, ConfinedError> {
        self.check_name(name)?;
        match self.value {
            Value::Map(entries) => entries
                .get(name)
                .map(|value| Proxy::new(value, self.guard))
                .ok_or_else(|| {
                    ConfinedError::new(
                        "AttributeError",
                        format!("'map' object has no attribute '{}'", name),
                    )
                }),
            other => Err(ConfinedError::new(
                "AttributeError",
                format!("'{}' object has no attribute '{}'", other.type_name(), name),
            )),
        }
    }

    /// Item lookup: list index (negative counts from the end) or map key
    pub fn item(&self, key: &Value) -> Result<Proxy<'a>, ConfinedError> {
        match (self.value, key) {
            (Value::List(items), Value::Int(index)) => resolve_index(*index, items.len())
                .map(|i| Proxy::new(&items[i], self.guard))
                .ok_or_else(|| ConfinedError::new("IndexError", "list index out of range")),
            (Value::Map(entries), Value::Str(name)) => {
                self.check_name(name)?;
                entries
                    .get(name.as_str())
                    .map(|value| Proxy::new(value, self.guard))
                    .ok_or_else(|| ConfinedError::new("KeyError", format!("{:?}", name)))
            }
            (Value::List(_), other) => Err(ConfinedError::type_error(format!(
                "list indices must be integers, not {}",
                other.type_name()
            ))),
            (Value::Map(_), other) => Err(ConfinedError::type_error(format!(
                "map keys must be str, not {}",
                other.type_name()
            ))),
            (other, _) => Err(ConfinedError::type_error(format!(
                "'{}' object is not subscriptable",
                other.type_name()
            ))),
        }
    }

    /// Iterate list elements as proxies
    pub fn iter(&self) -> Result<ProxyIter<'a>, ConfinedError> {
        match self.value {
            Value::List(items) => Ok(ProxyIter {
                inner: items.iter(),
                guard: self.guard,
            }),
            other => Err(ConfinedError::type_error(format!(
                "'{}' object is not iterable",
                other.type_name()
            ))),
        }
    }

    /// Iterate map entries; keys are plain strings, values are proxies.
    /// Entries whose key is denied by the guard are skipped.
    pub fn entries(&self) -> Result<ProxyEntries<'a>, ConfinedError> {
        match self.value {
            Value::Map(entries) => Ok(ProxyEntries {
                inner: entries.iter(),
                guard: self.guard,
            }),
            other => Err(ConfinedError::type_error(format!(
                "'{}' object has no entries",
                other.type_name()
            ))),
        }
    }

    fn check_name(&self, name: &str) -> Result<(), ConfinedError> {
        if self.guard.is_name_denied(name) {
            return Err(ConfinedError::access_denied(format!(
                "access to '{}' is blocked",
                name
            )));
        }
        Ok(())
    }
}

impl fmt::Debug for Proxy<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Proxy").field(self.value).finish()
    }
}

impl fmt::Display for Proxy<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self.value, f)
    }
}

impl PartialEq<Value> for Proxy<'_> {
    fn eq(&self, other: &Value) -> bool {
        self.value == other
    }
}

pub(crate) fn resolve_index(index: i64, len: usize) -> Option<usize> {
    let len = len as i64;
    let resolved = if index < 0 { len + index } else { index };
    if (0..len).contains(&resolved) {
        Some(resolved as usize)
    } else {
        None
    }
}

/// Iterator over the elements of a proxied list
pub struct ProxyIter<'a> {
    inner: slice::Iter<'a, Value>,
    guard: &'a AccessGuard,
}

impl<'a> Iterator for ProxyIter<'a> {
    type Item = Proxy<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next().map(|value| Proxy::new(value, self.guard))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

/// Iterator over the visible entries of a proxied map
pub struct ProxyEntries<'a> {
    inner: btree_map::Iter<'a, String, Value>,
    guard: &'a AccessGuard,
}

impl<'a> Iterator for ProxyEntries<'a> {
    type Item = (&'a str, Proxy<'a>);

    fn next(&mut self) -> Option<Self::Item> {
        for (key, value) in self.inner.by_ref() {
            if !self.guard.is_name_denied(key) {
                return Some((key.as_str(), Proxy::new(value, self.guard)));
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn sample() -> Value {
        let mut inner = BTreeMap::new();
        inner.insert("visible".to_string(), Value::Int(1));
        inner.insert("__class__".to_string(), Value::from("host-object"));
        Value::List(vec![Value::Map(inner), Value::from("tail")])
    }

    #[test]
    fn reads_pass_through() {
        let value = sample();
        let guard = AccessGuard::new();
        let proxy = Proxy::new(&value, &guard);

        assert_eq!(proxy.len(), Some(2));
        assert_eq!(proxy.item(&Value::Int(-1)).unwrap().as_str(), Some("tail"));
        let first = proxy.iter().unwrap().next().unwrap();
        assert_eq!(first.attr("visible").unwrap().as_int(), Some(1));
    }

    #[test]
    fn denied_names_are_intercepted_recursively() {
        let value = sample();
        let mut guard = AccessGuard::new();
        guard.deny_prefix("__");
        let proxy = Proxy::new(&value, &guard);
        let first = proxy.item(&Value::Int(0)).unwrap();

        let err = first.attr("__class__").unwrap_err();
        assert_eq!(err.kind, "AccessDenied");
        let err = first.item(&Value::from("__class__")).unwrap_err();
        assert_eq!(err.kind, "AccessDenied");

        let keys: Vec<&str> = first.entries().unwrap().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["visible"]);
    }

    #[test]
    fn lookup_errors_have_script_kinds() {
        let value = sample();
        let guard = AccessGuard::new();
        let proxy = Proxy::new(&value, &guard);

        assert_eq!(proxy.item(&Value::Int(5)).unwrap_err().kind, "IndexError");
        assert_eq!(proxy.item(&Value::from("x")).unwrap_err().kind, "TypeError");
        assert_eq!(proxy.attr("len").unwrap_err().kind, "AttributeError");
        let first = proxy.item(&Value::Int(0)).unwrap();
        assert_eq!(first.item(&Value::from("missing")).unwrap_err().kind, "KeyError");
    }

    #[test]
    fn resolve_index_handles_negatives() {
        assert_eq!(resolve_index(-1, 3), Some(2));
        assert_eq!(resolve_index(3, 3), None);
        assert_eq!(resolve_index(-4, 3), None);
    }
}
