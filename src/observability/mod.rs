//! Observability
//!
//! Structured audit events for worker lifecycle visibility.

pub mod audit;
