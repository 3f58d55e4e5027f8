use crate::config::types::ProtectionError;
use crate::protection::{Protection, ProtectionContext};

/// Blocks attribute and item access to the listed names and prefixes
#[derive(Clone, Debug, Default)]
pub struct DenyNames {
    names: Vec<String>,
    prefixes: Vec<String>,
}

impl DenyNames {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            names: names.into_iter().map(Into::into).collect(),
            prefixes: Vec::new(),
        }
    }

    /// Blocks every `__dunder` name
    pub fn dunder() -> Self {
        Self::default().with_prefix("__")
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefixes.push(prefix.into());
        self
    }
}

impl Protection for DenyNames {
    fn name(&self) -> &str {
        "deny-names"
    }

    fn enable(&self, ctx: &mut ProtectionContext<'_>) -> Result<(), ProtectionError> {
        let guard = ctx.guard_mut();
        for name in &self.names {
            guard.deny_name(name.clone());
        }
        for prefix in &self.prefixes {
            guard.deny_prefix(prefix.clone());
        }
        Ok(())
    }

    fn disable(&self, ctx: &mut ProtectionContext<'_>) -> Result<(), ProtectionError> {
        let guard = ctx.guard_mut();
        for name in &self.names {
            guard.allow_name(name);
        }
        for prefix in &self.prefixes {
            guard.allow_prefix(prefix);
        }
        Ok(())
    }
}

/// Blocks calling the listed functions or builtins
#[derive(Clone, Debug, Default)]
pub struct DenyCalls {
    calls: Vec<String>,
}

impl DenyCalls {
    pub fn new<I, S>(calls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            calls: calls.into_iter().map(Into::into).collect(),
        }
    }
}

impl Protection for DenyCalls {
    fn name(&self) -> &str {
        "deny-calls"
    }

    fn enable(&self, ctx: &mut ProtectionContext<'_>) -> Result<(), ProtectionError> {
        if self.calls.iter().any(String::is_empty) {
            return Err(ProtectionError::new("empty function name in block-list"));
        }
        let guard = ctx.guard_mut();
        for call in &self.calls {
            guard.deny_call(call.clone());
        }
        Ok(())
    }

    fn disable(&self, ctx: &mut ProtectionContext<'_>) -> Result<(), ProtectionError> {
        let guard = ctx.guard_mut();
        for call in &self.calls {
            guard.allow_call(call);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::SandboxConfig;
    use crate::protection::{Confinement, ProtectionStack, Site};

    #[test]
    fn guard_is_populated_while_body_runs() {
        let config = SandboxConfig::in_process()
            .with_policy(DenyNames::new(["secret"]).with_prefix("__"))
            .with_policy(DenyCalls::new(["exit"]));
        let confinement = Confinement::new(Site::InProcess, "test");

        let (name, prefixed, call) = ProtectionStack::new(&config, &confinement)
            .run(|_, guard| {
                Ok((
                    guard.is_name_denied("secret"),
                    guard.is_name_denied("__dict__"),
                    guard.is_call_denied("exit"),
                ))
            })
            .unwrap();
        assert!(name && prefixed && call);
    }

    #[test]
    fn empty_call_name_fails_enable() {
        let config = SandboxConfig::in_process().with_policy(DenyCalls::new([""]));
        let confinement = Confinement::new(Site::InProcess, "test");
        let err = ProtectionStack::new(&config, &confinement)
            .run(|_, _| Ok(()))
            .unwrap_err();
        assert!(err.to_string().contains("deny-calls"));
    }
}
