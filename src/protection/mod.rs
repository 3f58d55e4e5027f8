//! Protection stack.
//!
//! A [`Protection`] is an external plugin with exactly two hooks. The stack
//! enables the configured protections in order right before confined code
//! runs and disables them in reverse order right after, whether the code
//! succeeded, failed, or panicked. The same bracket is used in-process and
//! inside workers.

pub mod builtin;

use crate::capability::AccessGuard;
use crate::config::types::{ConfinedError, ProtectionError, Result, SandboxConfig, SandboxError};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};

/// One restriction enforced around confined code
pub trait Protection: Send + Sync + fmt::Debug {
    /// Stable identifier; also used to check a worker runs the same stack
    fn name(&self) -> &str;

    fn enable(&self, ctx: &mut ProtectionContext<'_>) -> std::result::Result<(), ProtectionError>;

    fn disable(&self, ctx: &mut ProtectionContext<'_>) -> std::result::Result<(), ProtectionError>;
}

/// Process in which a confined run takes place
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Site {
    InProcess,
    Worker { pid: u32 },
}

impl fmt::Display for Site {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Site::InProcess => f.write_str("in-process"),
            Site::Worker { pid } => write!(f, "worker {}", pid),
        }
    }
}

/// Token threaded through one confined run.
///
/// Holding a `&Confinement` is how code learns it runs under confinement;
/// nothing inspects the call stack.
#[derive(Clone, Debug)]
pub struct Confinement {
    site: Site,
    label: String,
}

impl Confinement {
    pub fn new(site: Site, label: impl Into<String>) -> Self {
        Self {
            site,
            label: label.into(),
        }
    }

    pub fn site(&self) -> Site {
        self.site
    }

    /// Short description of what is being run, for diagnostics
    pub fn label(&self) -> &str {
        &self.label
    }
}

/// What a protection sees while enabling or disabling
pub struct ProtectionContext<'a> {
    config: &'a SandboxConfig,
    confinement: &'a Confinement,
    guard: &'a mut AccessGuard,
}

impl<'a> ProtectionContext<'a> {
    pub fn config(&self) -> &SandboxConfig {
        self.config
    }

    pub fn confinement(&self) -> &Confinement {
        self.confinement
    }

    /// Block-list used by the proxies of this run
    pub fn guard_mut(&mut self) -> &mut AccessGuard {
        self.guard
    }
}

/// Runs bodies between the enable and disable hooks of a config's policies
pub struct ProtectionStack<'a> {
    config: &'a SandboxConfig,
    confinement: &'a Confinement,
}

impl<'a> ProtectionStack<'a> {
    pub fn new(config: &'a SandboxConfig, confinement: &'a Confinement) -> Self {
        Self {
            config,
            confinement,
        }
    }

    /// Enable all protections, run `body`, disable in reverse.
    ///
    /// Error precedence: an enable failure wins (the body never runs), then
    /// the body's own error, then the first disable failure. Disable failures
    /// that lose to a body error are logged.
    pub fn run<T>(
        &self,
        body: impl FnOnce(&Confinement, &AccessGuard) -> std::result::Result<T, ConfinedError>,
    ) -> Result<T> {
        let mut guard = AccessGuard::new();

        let mut enabled = 0;
        for protection in &self.config.policies {
            let mut ctx = self.context(&mut guard);
            if let Err(err) = protection.enable(&mut ctx) {
                log::warn!(
                    "protection '{}' failed to enable ({}): {}",
                    protection.name(),
                    self.confinement.label(),
                    err
                );
                if let Some((name, rollback)) = self.disable_first_n(enabled, &mut guard) {
                    log::error!(
                        "protection '{}' failed to disable during rollback: {}",
                        name,
                        rollback
                    );
                }
                return Err(SandboxError::Protection {
                    name: protection.name().to_string(),
                    message: err.to_string(),
                });
            }
            enabled += 1;
        }

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| body(self.confinement, &guard)))
            .unwrap_or_else(|payload| Err(ConfinedError::panic(panic_message(payload.as_ref()))));

        let disable_failure = self.disable_first_n(enabled, &mut guard);

        match (outcome, disable_failure) {
            (Err(err), Some((name, disable_err))) => {
                log::error!(
                    "protection '{}' failed to disable after a confined error: {}",
                    name,
                    disable_err
                );
                Err(err.into())
            }
            (Err(err), None) => Err(err.into()),
            (Ok(_), Some((name, disable_err))) => Err(SandboxError::Protection {
                name,
                message: disable_err.to_string(),
            }),
            (Ok(value), None) => Ok(value),
        }
    }

    fn context<'g>(&self, guard: &'g mut AccessGuard) -> ProtectionContext<'g>
    where
        'a: 'g,
    {
        ProtectionContext {
            config: self.config,
            confinement: self.confinement,
            guard,
        }
    }

    /// Disable the first `count` protections in reverse order; every one is
    /// attempted and the first failure (in disable order) is returned.
    fn disable_first_n(
        &self,
        count: usize,
        guard: &mut AccessGuard,
    ) -> Option<(String, ProtectionError)> {
        let mut first_failure = None;
        for protection in self.config.policies[..count].iter().rev() {
            let mut ctx = self.context(guard);
            if let Err(err) = protection.disable(&mut ctx) {
                if first_failure.is_none() {
                    first_failure = Some((protection.name().to_string(), err));
                } else {
                    log::error!("protection '{}' failed to disable: {}", protection.name(), err);
                }
            }
        }
        first_failure
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "confined code panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Debug)]
    struct Recorder {
        name: &'static str,
        journal: Arc<Mutex<Vec<String>>>,
        fail_enable: bool,
        fail_disable: bool,
    }

    impl Recorder {
        fn new(name: &'static str, journal: &Arc<Mutex<Vec<String>>>) -> Self {
            Self {
                name,
                journal: Arc::clone(journal),
                fail_enable: false,
                fail_disable: false,
            }
        }
    }

    impl Protection for Recorder {
        fn name(&self) -> &str {
            self.name
        }

        fn enable(&self, _ctx: &mut ProtectionContext<'_>) -> std::result::Result<(), ProtectionError> {
            self.journal.lock().unwrap().push(format!("enable {}", self.name));
            if self.fail_enable {
                return Err(ProtectionError::new("refused"));
            }
            Ok(())
        }

        fn disable(&self, _ctx: &mut ProtectionContext<'_>) -> std::result::Result<(), ProtectionError> {
            self.journal.lock().unwrap().push(format!("disable {}", self.name));
            if self.fail_disable {
                return Err(ProtectionError::new("stuck"));
            }
            Ok(())
        }
    }

    fn journal() -> Arc<Mutex<Vec<String>>> {
        Arc::new(Mutex::new(Vec::new()))
    }

    fn entries(journal: &Arc<Mutex<Vec<String>>>) -> Vec<String> {
        journal.lock().unwrap().clone()
    }

    #[test]
    fn brackets_body_in_order_and_reverse() {
        let log = journal();
        let config = SandboxConfig::in_process()
            .with_policy(Recorder::new("a", &log))
            .with_policy(Recorder::new("b", &log));
        let confinement = Confinement::new(Site::InProcess, "test");

        let value = ProtectionStack::new(&config, &confinement)
            .run(|_, _| {
                log.lock().unwrap().push("body".to_string());
                Ok(42)
            })
            .unwrap();

        assert_eq!(value, 42);
        assert_eq!(
            entries(&log),
            vec!["enable a", "enable b", "body", "disable b", "disable a"]
        );
    }

    #[test]
    fn disables_after_body_error() {
        let log = journal();
        let config = SandboxConfig::in_process()
            .with_policy(Recorder::new("a", &log))
            .with_policy(Recorder::new("b", &log));
        let confinement = Confinement::new(Site::InProcess, "test");

        let err = ProtectionStack::new(&config, &confinement)
            .run::<()>(|_, _| Err(ConfinedError::new("ValueError", "boom")))
            .unwrap_err();

        assert_eq!(err.as_confined().unwrap().kind, "ValueError");
        assert_eq!(entries(&log), vec!["enable a", "enable b", "disable b", "disable a"]);
    }

    #[test]
    fn partial_enable_rolls_back_enabled_protections() {
        let log = journal();
        let mut failing = Recorder::new("c", &log);
        failing.fail_enable = true;
        let config = SandboxConfig::in_process()
            .with_policy(Recorder::new("a", &log))
            .with_policy(Recorder::new("b", &log))
            .with_policy(failing)
            .with_policy(Recorder::new("d", &log));
        let confinement = Confinement::new(Site::InProcess, "test");

        let err = ProtectionStack::new(&config, &confinement)
            .run(|_, _| {
                log.lock().unwrap().push("body".to_string());
                Ok(())
            })
            .unwrap_err();

        assert!(matches!(err, SandboxError::Protection { ref name, .. } if name == "c"));
        assert_eq!(
            entries(&log),
            vec!["enable a", "enable b", "enable c", "disable b", "disable a"]
        );
    }

    #[test]
    fn body_error_takes_precedence_over_disable_error() {
        let log = journal();
        let mut stuck = Recorder::new("a", &log);
        stuck.fail_disable = true;
        let config = SandboxConfig::in_process().with_policy(stuck);
        let confinement = Confinement::new(Site::InProcess, "test");

        let err = ProtectionStack::new(&config, &confinement)
            .run::<()>(|_, _| Err(ConfinedError::new("KeyError", "'x'")))
            .unwrap_err();
        assert_eq!(err.as_confined().unwrap().kind, "KeyError");

        let err = ProtectionStack::new(&config, &confinement)
            .run(|_, _| Ok(()))
            .unwrap_err();
        assert!(matches!(err, SandboxError::Protection { ref message, .. } if message == "stuck"));
    }

    #[test]
    fn panics_become_confined_errors() {
        let config = SandboxConfig::in_process();
        let confinement = Confinement::new(Site::InProcess, "test");
        let err = ProtectionStack::new(&config, &confinement)
            .run::<()>(|_, _| panic!("native code blew up"))
            .unwrap_err();
        let confined = err.as_confined().unwrap();
        assert_eq!(confined.kind, "Panic");
        assert_eq!(confined.message, "native code blew up");
    }
}
