//! Thin wrappers around the process primitives workers are built from.
//!
//! All `unsafe` code is concentrated here with explicit SAFETY comments.

pub mod fd;
pub mod process;
pub mod rlimit;
