//! Periodic shedding of excess upstream connections.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::policy::{evaluate, Evaluation, RebalanceConfig, SkipReason};
use crate::cluster::ClusterDirectory;
use crate::upstream::{ConnectionRegistry, Victim};

/// Lifecycle of the rebalancer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum RebalancerState {
    /// Threshold is zero; never leaves this state.
    Disabled = 0,
    Idle = 1,
    Evaluating = 2,
    Shedding = 3,
}

impl RebalancerState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => RebalancerState::Disabled,
            2 => RebalancerState::Evaluating,
            3 => RebalancerState::Shedding,
            _ => RebalancerState::Idle,
        }
    }
}

/// What one tick decided to shed.
#[derive(Debug, Clone)]
pub struct RebalanceDecision {
    pub excess: f64,
    pub shed_this_tick: usize,
    pub victims: Vec<Victim>,
}

/// Result of a single [`Rebalancer::tick`].
#[derive(Debug)]
pub enum TickOutcome {
    Disabled,
    /// A previous tick is still evaluating or shedding.
    Busy,
    Skipped(SkipReason),
    Shed {
        decision: RebalanceDecision,
        /// Victims this tick actually removed from the registry.
        closed: usize,
    },
}

/// Counters exposed on the status endpoint.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RebalancerStats {
    pub ticks: u64,
    pub skipped: u64,
    pub busy: u64,
    pub shed_ticks: u64,
    pub shed_total: u64,
    pub last_would_shed: u64,
    pub last_skip: Option<SkipReason>,
    pub skipped_by_reason: BTreeMap<&'static str, u64>,
}

#[derive(Default)]
struct SkipLog {
    last: Option<SkipReason>,
    by_reason: BTreeMap<&'static str, u64>,
}

/// Resets the state to `Idle` when a tick ends, including when its future
/// is dropped mid-shed.
struct InFlight<'a>(&'a AtomicU8);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(RebalancerState::Idle as u8, Ordering::Release);
    }
}

/// Compares the local connection count against the cluster average on
/// every tick and closes a damped share of the excess.
///
/// At most one evaluation is in flight at a time; a tick that finds one
/// running is skipped.
pub struct Rebalancer {
    config: RebalanceConfig,
    directory: Arc<ClusterDirectory>,
    registry: Arc<ConnectionRegistry>,
    state: AtomicU8,
    ticks: AtomicU64,
    skipped: AtomicU64,
    busy: AtomicU64,
    shed_ticks: AtomicU64,
    shed_total: AtomicU64,
    last_would_shed: AtomicU64,
    skips: Mutex<SkipLog>,
}

impl Rebalancer {
    pub fn new(
        config: RebalanceConfig,
        directory: Arc<ClusterDirectory>,
        registry: Arc<ConnectionRegistry>,
    ) -> Self {
        let state = if config.is_disabled() {
            RebalancerState::Disabled
        } else {
            RebalancerState::Idle
        };
        Self {
            config,
            directory,
            registry,
            state: AtomicU8::new(state as u8),
            ticks: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
            busy: AtomicU64::new(0),
            shed_ticks: AtomicU64::new(0),
            shed_total: AtomicU64::new(0),
            last_would_shed: AtomicU64::new(0),
            skips: Mutex::new(SkipLog::default()),
        }
    }

    pub fn config(&self) -> &RebalanceConfig {
        &self.config
    }

    pub fn state(&self) -> RebalancerState {
        RebalancerState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn stats(&self) -> RebalancerStats {
        let skips = self.skips.lock();
        RebalancerStats {
            ticks: self.ticks.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            busy: self.busy.load(Ordering::Relaxed),
            shed_ticks: self.shed_ticks.load(Ordering::Relaxed),
            shed_total: self.shed_total.load(Ordering::Relaxed),
            last_would_shed: self.last_would_shed.load(Ordering::Relaxed),
            last_skip: skips.last,
            skipped_by_reason: skips.by_reason.clone(),
        }
    }

    /// Runs one evaluation and, if warranted, sheds connections.
    pub async fn tick(&self) -> TickOutcome {
        self.tick_until(None).await
    }

    /// Like [`tick`](Self::tick), but stops picking further victims once
    /// `cancel` fires. A close already under way still completes.
    async fn tick_until(&self, cancel: Option<&CancellationToken>) -> TickOutcome {
        if self
            .state
            .compare_exchange(
                RebalancerState::Idle as u8,
                RebalancerState::Evaluating as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            if self.state() == RebalancerState::Disabled {
                return TickOutcome::Disabled;
            }
            self.busy.fetch_add(1, Ordering::Relaxed);
            tracing::debug!("rebalance tick skipped, previous tick still running");
            return TickOutcome::Busy;
        }
        let _in_flight = InFlight(&self.state);
        self.ticks.fetch_add(1, Ordering::Relaxed);

        let average = self.directory.average();
        let local = self.registry.local_count();

        let (excess, shed) = match evaluate(&self.config, &average, local) {
            Evaluation::Skip(reason) => {
                self.skipped.fetch_add(1, Ordering::Relaxed);
                let would_shed = match reason {
                    SkipReason::ZeroShed { would_shed } => would_shed as u64,
                    _ => 0,
                };
                self.last_would_shed.store(would_shed, Ordering::Relaxed);
                {
                    let mut skips = self.skips.lock();
                    skips.last = Some(reason);
                    *skips.by_reason.entry(reason.label()).or_insert(0) += 1;
                }
                tracing::debug!(
                    local,
                    avg = average.avg,
                    fresh_nodes = average.fresh_node_count,
                    %reason,
                    "rebalance skipped"
                );
                return TickOutcome::Skipped(reason);
            }
            Evaluation::Shed { excess, shed, .. } => (excess, shed),
        };

        self.state
            .store(RebalancerState::Shedding as u8, Ordering::Release);
        self.skips.lock().last = None;
        self.last_would_shed.store(shed as u64, Ordering::Relaxed);

        let victims = self.registry.select_victims(shed);
        tracing::info!(
            local,
            avg = average.avg,
            excess,
            shed,
            selected = victims.len(),
            "shedding upstream connections"
        );

        let mut closed = 0;
        for victim in &victims {
            if cancel.is_some_and(|c| c.is_cancelled()) {
                tracing::debug!(closed, selected = victims.len(), "shedding cancelled");
                break;
            }
            if self.registry.close(victim).await {
                closed += 1;
                self.shed_total.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.shed_ticks.fetch_add(1, Ordering::Relaxed);

        TickOutcome::Shed {
            decision: RebalanceDecision {
                excess,
                shed_this_tick: shed,
                victims,
            },
            closed,
        }
    }

    /// Ticks every `config.tick` until `cancel` fires. Missed ticks are
    /// dropped rather than bunched up. Cancellation stops a shedding tick
    /// between victims, never in the middle of a close.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        if self.state() == RebalancerState::Disabled {
            tracing::info!("rebalancing disabled (threshold 0)");
            return;
        }

        let mut interval = tokio::time::interval(self.config.tick);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }
            self.tick_until(Some(&cancel)).await;
        }
        tracing::debug!("rebalancer stopped");
    }
}
