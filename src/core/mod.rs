//! Coordinator and worker process model.
//!
//! The coordinator decides where a task runs, the worker serves tasks in a
//! forked process, and the supervisor tears workers down. Tasks and results
//! cross between them as framed JSON over a pair of pipes.

pub mod channel;
pub mod coordinator;
pub mod supervisor;
pub mod types;
pub mod worker;
