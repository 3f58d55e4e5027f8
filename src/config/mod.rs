//! Configuration and policy
//!
//! Confinement config, its wire snapshot, the error taxonomy, and validation.

pub mod types;
pub mod validator;
