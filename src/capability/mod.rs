//! Capability proxies.
//!
//! Values crossing into confined execution are wrapped so confined code can
//! read and iterate them but cannot follow a live reference back into
//! caller-owned state, and cannot reach names the active protections block.

pub mod guard;
pub mod namespace;
pub mod proxy;

pub use guard::AccessGuard;
pub use namespace::SealedNamespace;
pub use proxy::{Proxy, ProxyEntries, ProxyIter};
