//! Shedding policy: how many connections to close this tick.
//!
//! The per-tick cap is a fraction of the cluster average rather than of
//! the local count, so every overloaded node sheds at a comparable
//! absolute rate. Counts only propagate on the next gossip round, so the
//! policy is open loop: it damps each step and relies on later ticks to
//! finish the correction instead of trying to converge in one go.

use std::fmt;
use std::time::Duration;

use serde::Serialize;

use crate::cluster::LoadAverage;

/// Tunables of the rebalancer.
#[derive(Debug, Clone, PartialEq)]
pub struct RebalanceConfig {
    /// Tolerated fraction above the cluster average. Zero disables
    /// rebalancing entirely.
    pub threshold: f64,
    /// Fraction of the cluster average that may be shed per tick (0-1).
    pub shed_rate: f64,
    /// Local connection floor below which the node never sheds.
    pub min_conns: usize,
    pub tick: Duration,
    /// Skip shedding while this node's own published count is stale.
    pub suppress_when_stale: bool,
}

impl RebalanceConfig {
    pub fn is_disabled(&self) -> bool {
        self.threshold == 0.0
    }
}

impl Default for RebalanceConfig {
    fn default() -> Self {
        Self {
            threshold: 0.0,
            shed_rate: 0.005,
            min_conns: 100,
            tick: Duration::from_secs(1),
            suppress_when_stale: true,
        }
    }
}

/// Why a tick did not shed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SkipReason {
    Disabled,
    /// No fresh entry at all; the average is undefined.
    NoFreshData,
    /// Fewer than two fresh nodes; nothing to balance against.
    SingleNode,
    /// This node has not published recently.
    LocalStale,
    BelowFloor,
    WithinTolerance,
    /// Over tolerance, but the cap or rounding leaves nothing to shed.
    ZeroShed { would_shed: usize },
}

impl SkipReason {
    /// Stable key used when counting skips.
    pub fn label(&self) -> &'static str {
        match self {
            SkipReason::Disabled => "disabled",
            SkipReason::NoFreshData => "no_fresh_data",
            SkipReason::SingleNode => "single_node",
            SkipReason::LocalStale => "local_stale",
            SkipReason::BelowFloor => "below_floor",
            SkipReason::WithinTolerance => "within_tolerance",
            SkipReason::ZeroShed { .. } => "zero_shed",
        }
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::Disabled => write!(f, "disabled"),
            SkipReason::NoFreshData => write!(f, "no fresh data"),
            SkipReason::SingleNode => write!(f, "single node"),
            SkipReason::LocalStale => write!(f, "local state stale"),
            SkipReason::BelowFloor => write!(f, "below floor"),
            SkipReason::WithinTolerance => write!(f, "within tolerance"),
            SkipReason::ZeroShed { would_shed } => write!(f, "zero shed (would shed {})", would_shed),
        }
    }
}

/// Result of evaluating one tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Evaluation {
    Skip(SkipReason),
    Shed {
        /// Connections above `avg * (1 + threshold)`.
        excess: f64,
        /// Per-tick cap, `ceil(avg * shed_rate)`.
        cap: usize,
        /// `floor(min(excess, cap))`, always at least one.
        shed: usize,
    },
}

/// Decides how many connections to shed given the cluster average and the
/// current local count.
///
/// Never sheds more than the excess, so the local count cannot drop below
/// `avg * (1 + threshold)`, let alone below the average.
pub fn evaluate(config: &RebalanceConfig, average: &LoadAverage, local: usize) -> Evaluation {
    if config.is_disabled() {
        return Evaluation::Skip(SkipReason::Disabled);
    }
    if average.fresh_node_count == 0 {
        return Evaluation::Skip(SkipReason::NoFreshData);
    }
    if average.fresh_node_count < 2 {
        return Evaluation::Skip(SkipReason::SingleNode);
    }
    if config.suppress_when_stale && !average.local_fresh {
        return Evaluation::Skip(SkipReason::LocalStale);
    }
    if local < config.min_conns {
        return Evaluation::Skip(SkipReason::BelowFloor);
    }

    let excess = local as f64 - average.avg * (1.0 + config.threshold);
    if excess <= 0.0 {
        return Evaluation::Skip(SkipReason::WithinTolerance);
    }

    let cap = (average.avg * config.shed_rate).ceil().max(0.0) as usize;
    let shed = excess.min(cap as f64).floor().max(0.0) as usize;
    if shed == 0 {
        return Evaluation::Skip(SkipReason::ZeroShed {
            would_shed: excess.floor() as usize,
        });
    }

    Evaluation::Shed { excess, cap, shed }
}
