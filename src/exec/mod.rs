//! Confined execution
//!
//! Native functions, the code-block language, and the single guarded path
//! ([`confined`]) both execution modes go through.

pub mod builtins;
pub mod confined;
pub mod function;
pub mod interpreter;
mod lexer;
pub mod script;

pub use confined::{run_call, run_code};
pub use function::{Args, CallArgs, CallContext, Function, FunctionRegistry, NativeFn};
pub use script::Code;
