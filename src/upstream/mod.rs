//! Upstream connection tracking.
//!
//! Keeps this node's registered upstream connections per tenant and
//! chooses which of them to shed when the node is overloaded.

mod registry;
mod victims;

pub use registry::{ConnectionId, ConnectionRegistry, RegistryError, UpstreamConn, Victim};
pub use victims::{allocate, sample};

#[cfg(test)]
pub(crate) use registry::tests::{fill, SlowConn, TestConn};
