//! Startup membership protocol.
//!
//! `Bootstrapping -> Joining -> Joined | Aborted`. Targets are resolved on
//! every attempt so DNS names pick up new addresses between retries. The
//! deadline is hard: an attempt still in flight when it passes is dropped.

use std::collections::BTreeSet;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use super::transport::GossipTransport;

/// Membership state of this node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinState {
    Bootstrapping,
    Joining,
    Joined,
    Aborted,
}

impl fmt::Display for JoinState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JoinState::Bootstrapping => write!(f, "bootstrapping"),
            JoinState::Joining => write!(f, "joining"),
            JoinState::Joined => write!(f, "joined"),
            JoinState::Aborted => write!(f, "aborted"),
        }
    }
}

/// Parameters of one startup join.
#[derive(Debug, Clone)]
pub struct JoinAttempt {
    /// `host:port` entries; hosts may be literal IPs or DNS names.
    pub targets: Vec<String>,
    pub timeout: Duration,
    pub abort_on_failure: bool,
}

/// How the node came to be `Joined`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    /// No targets configured; single-node cluster.
    Solo,
    /// Admitted through at least one target.
    Joined { admitted: usize, attempts: u32 },
    /// No target answered before the deadline; running as a new cluster.
    Isolated { attempts: u32 },
}

/// Fatal join failure.
#[derive(Debug, thiserror::Error)]
pub enum JoinError {
    #[error("failed to join cluster via {targets:?} within {timeout:?}")]
    Aborted {
        targets: Vec<String>,
        timeout: Duration,
    },
}

/// Exponential backoff between join attempts.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    /// Returns the delay before the next attempt and doubles it for the
    /// one after, up to `max`.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(100), Duration::from_secs(5))
    }
}

/// Drives the startup join to `Joined` or `Aborted`.
pub struct JoinCoordinator {
    transport: Arc<dyn GossipTransport>,
    attempt: JoinAttempt,
    backoff: Backoff,
    state: JoinState,
}

impl JoinCoordinator {
    pub fn new(transport: Arc<dyn GossipTransport>, attempt: JoinAttempt) -> Self {
        Self {
            transport,
            attempt,
            backoff: Backoff::default(),
            state: JoinState::Bootstrapping,
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn state(&self) -> JoinState {
        self.state
    }

    /// Runs the join protocol to completion.
    ///
    /// Without targets the node is immediately `Joined` as a single-node
    /// cluster. If the deadline passes with no admission the node aborts
    /// only when more than one distinct target was configured and
    /// `abort_on_failure` is set; a lone unreachable target means this is
    /// the first node.
    pub async fn run(&mut self) -> Result<JoinOutcome, JoinError> {
        let targets: Vec<String> = self
            .attempt
            .targets
            .iter()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        if targets.is_empty() {
            self.state = JoinState::Joined;
            info!("no join targets configured; running as a single-node cluster");
            return Ok(JoinOutcome::Solo);
        }

        self.state = JoinState::Joining;
        info!(targets = ?targets, timeout = ?self.attempt.timeout, "joining cluster");

        let mut attempts = 0u32;
        let joined = tokio::time::timeout(
            self.attempt.timeout,
            join_until_admitted(
                self.transport.as_ref(),
                &targets,
                &mut self.backoff,
                &mut attempts,
            ),
        )
        .await;

        match joined {
            Ok(admitted) => {
                self.state = JoinState::Joined;
                info!(admitted, attempts, "joined cluster");
                Ok(JoinOutcome::Joined { admitted, attempts })
            }
            Err(_) if targets.len() > 1 && self.attempt.abort_on_failure => {
                self.state = JoinState::Aborted;
                error!(
                    targets = ?targets,
                    attempts,
                    "failed to join cluster before deadline; aborting"
                );
                Err(JoinError::Aborted {
                    targets,
                    timeout: self.attempt.timeout,
                })
            }
            Err(_) => {
                self.state = JoinState::Joined;
                warn!(
                    targets = ?targets,
                    attempts,
                    "no join target reachable before deadline; starting a new cluster"
                );
                Ok(JoinOutcome::Isolated { attempts })
            }
        }
    }
}

async fn join_until_admitted(
    transport: &dyn GossipTransport,
    targets: &[String],
    backoff: &mut Backoff,
    attempts: &mut u32,
) -> usize {
    loop {
        *attempts += 1;
        let addrs = resolve_targets(targets).await;
        if addrs.is_empty() {
            debug!(attempt = *attempts, "no join target resolved");
        } else {
            match transport.join(&addrs).await {
                Ok(admitted) => return admitted,
                Err(e) => debug!(attempt = *attempts, error = %e, "join attempt failed"),
            }
        }
        tokio::time::sleep(backoff.next_delay()).await;
    }
}

/// Resolves every target, skipping those that fail. Duplicates collapse.
pub async fn resolve_targets(targets: &[String]) -> Vec<SocketAddr> {
    let mut resolved = BTreeSet::new();
    for target in targets {
        match tokio::net::lookup_host(target.as_str()).await {
            Ok(addrs) => resolved.extend(addrs),
            Err(e) => debug!(target = %target, error = %e, "failed to resolve join target"),
        }
    }
    resolved.into_iter().collect()
}
