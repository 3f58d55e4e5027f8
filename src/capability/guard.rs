use std::collections::BTreeMap;

/// Names with the number of protections currently denying each
type DenyCounts = BTreeMap<String, usize>;

fn add_denial(set: &mut DenyCounts, name: String) {
    *set.entry(name).or_insert(0) += 1;
}

/// Drop one denial of `name`; it stays denied while another holder remains
fn lift_denial(set: &mut DenyCounts, name: &str) {
    if let Some(count) = set.get_mut(name) {
        *count -= 1;
        if *count == 0 {
            set.remove(name);
        }
    }
}

/// Block-list consulted by every proxy access.
///
/// Protections fill it during `enable`; proxies created afterwards for the
/// same confined run read it on each attribute, item, or call lookup. Each
/// `deny_*` is undone by one matching `allow_*`, so two protections denying
/// the same name do not lift each other's block.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AccessGuard {
    denied_names: DenyCounts,
    denied_prefixes: DenyCounts,
    denied_calls: DenyCounts,
}

impl AccessGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deny attribute/item access to exactly `name`
    pub fn deny_name(&mut self, name: impl Into<String>) {
        add_denial(&mut self.denied_names, name.into());
    }

    /// Deny attribute/item access to every name starting with `prefix`
    pub fn deny_prefix(&mut self, prefix: impl Into<String>) {
        add_denial(&mut self.denied_prefixes, prefix.into());
    }

    /// Deny calling the function or builtin `name`
    pub fn deny_call(&mut self, name: impl Into<String>) {
        add_denial(&mut self.denied_calls, name.into());
    }

    pub fn allow_name(&mut self, name: &str) {
        lift_denial(&mut self.denied_names, name);
    }

    pub fn allow_prefix(&mut self, prefix: &str) {
        lift_denial(&mut self.denied_prefixes, prefix);
    }

    pub fn allow_call(&mut self, name: &str) {
        lift_denial(&mut self.denied_calls, name);
    }

    pub fn is_name_denied(&self, name: &str) -> bool {
        self.denied_names.contains_key(name)
            || self
                .denied_prefixes
                .keys()
                .any(|prefix| name.starts_with(prefix.as_str()))
    }

    pub fn is_call_denied(&self, name: &str) -> bool {
        self.denied_calls.contains_key(name)
    }

    pub fn is_empty(&self) -> bool {
        self.denied_names.is_empty() && self.denied_prefixes.is_empty() && self.denied_calls.is_empty()
    }
}
