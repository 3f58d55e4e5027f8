//! confine: confined execution of functions and code blocks
//! Runs untrusted calls either in the calling process or in an isolated,
//! memory-capped worker process, with the same error surface in both.
//!
//! # Architecture
//!
//! ## Values ([`value`])
//! - [`value::Value`]: owned dynamic values; nothing in them points back into the caller
//! - [`value::Namespace`]: globals/locals maps updated in place by `execute`
//!
//! ## Capabilities ([`capability`])
//! - [`capability::proxy`]: read-only views that intercept attribute and item access
//! - [`capability::namespace`]: in-place sealing of caller namespaces
//! - [`capability::guard`]: block-lists populated by protections
//!
//! ## Protections ([`protection`])
//! - [`protection::ProtectionStack`]: enable in order, disable in reverse
//! - [`protection::builtin`]: generic `DenyNames` / `DenyCalls` plugins
//!
//! ## Execution ([`exec`])
//! - [`exec::function`]: registered native functions and their arguments
//! - [`exec::script`]: the code block language
//! - [`exec::interpreter`]: evaluation through proxies
//! - [`exec::confined`]: the guarded path shared by every execution mode
//!
//! ## Process model ([`core`])
//! - [`core::coordinator`]: mode selection and worker lifecycle
//! - [`core::worker`]: forked worker processes and their serving loop
//! - [`core::channel`]: framed JSON over pipes
//! - [`core::supervisor`]: SIGTERM/SIGKILL escalation and reaping
//!
//! ## Kernel primitives ([`kernel`])
//! - [`kernel::process`]: fork, reap, signal
//! - [`kernel::fd`]: close-on-exec pipes and inherited fd cleanup
//! - [`kernel::rlimit`]: RLIMIT_AS
//!
//! ## Observability ([`observability`])
//! - [`observability::audit`]: structured worker lifecycle events
//!
//! ## Configuration ([`config`])
//! - [`config::types`]: config, wire snapshot, and error taxonomy
//! - [`config::validator`]: config validation
//!
//! # Design Principles
//!
//! 1. **Confinement is a token** - code learns it is confined from an explicit [`protection::Confinement`]
//! 2. **Same errors everywhere** - content errors carry kind and message as data
//! 3. **Data only across the boundary** - tasks carry values and parsed code, never closures
//! 4. **Explicit teardown** - workers are closed and reaped; `Drop` is only a safety net

// Values and capabilities
pub mod capability;
pub mod value;

// Protections
pub mod protection;

// Execution Control
pub mod exec;

// Kernel Primitives
pub mod kernel;

// Coordinator and workers
pub mod core;

// Observability
pub mod observability;

// Configuration & Policy
pub mod config;

// CLI entrypoint wiring for the confine binary.
pub mod cli;

// Re-export commonly used types for convenience
pub use crate::config::types::*;
pub use crate::core::coordinator::{Callback, ExecutionCoordinator};
pub use crate::exec::{Args, CallArgs, CallContext, Code, Function, FunctionRegistry, NativeFn};
pub use crate::protection::{Confinement, Protection, ProtectionContext, ProtectionStack, Site};
pub use crate::value::{Namespace, Value};
