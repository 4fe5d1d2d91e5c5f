//! Load rebalancing.
//!
//! Each node compares its own upstream count against the cluster average
//! and, when it is over tolerance, closes a few connections per tick so
//! their clients reconnect elsewhere.

mod policy;
mod rebalancer;

pub use policy::{evaluate, Evaluation, RebalanceConfig, SkipReason};
pub use rebalancer::{RebalanceDecision, Rebalancer, RebalancerState, RebalancerStats, TickOutcome};
