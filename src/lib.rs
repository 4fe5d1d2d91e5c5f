//! Cluster-aware upstream rebalancing for reverse-proxy nodes.
//!
//! Each node gossips its local upstream connection count, keeps a view of
//! every peer's count and sheds a damped share of its own connections when
//! it sits well above the cluster average.

pub mod cluster;
pub mod config;
pub mod health;
pub mod logging;
pub mod node;
pub mod rebalance;
pub mod upstream;
