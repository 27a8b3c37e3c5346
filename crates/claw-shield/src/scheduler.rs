//! Periodic expiry sweep.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::enforcement::{EnforcementController, ReconcileReport, ReleaseReport};
use crate::filter::PacketFilter;

/// Result of one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepSummary {
    /// Expired blocks lifted and failures (None if the pass errored).
    pub release: Option<ReleaseReport>,
    /// Filter reconciliation (None if the pass errored).
    pub reconcile: Option<ReconcileReport>,
}

/// Lifts expired blocks on a fixed interval.
#[derive(Debug)]
pub struct ExpiryScheduler<F: PacketFilter> {
    controller: Arc<EnforcementController<F>>,
    interval: Duration,
}

impl<F: PacketFilter> ExpiryScheduler<F> {
    /// Create a scheduler ticking every `interval`.
    pub fn new(controller: Arc<EnforcementController<F>>, interval: Duration) -> Self {
        Self {
            controller,
            interval,
        }
    }

    /// Run one sweep: release expired view entries, then expired records the
    /// view does not hold, then reconcile the filter.
    ///
    /// Errors are logged; a failing pass never prevents the next one.
    pub async fn sweep_once(&self) -> SweepSummary {
        let release = match self.controller.release_expired().await {
            Ok(report) => Some(report),
            Err(e) => {
                warn!(error = %e, "expiry pass failed");
                None
            }
        };

        let reconcile = match self.controller.reconcile().await {
            Ok(report) => Some(report),
            Err(e) => {
                warn!(error = %e, "filter reconciliation failed");
                None
            }
        };

        SweepSummary { release, reconcile }
    }

    /// Spawn the sweep loop on the current runtime.
    pub fn spawn(self) -> SchedulerHandle {
        let token = CancellationToken::new();
        let child = token.child_token();
        let join = tokio::spawn(async move { self.run(child).await });
        SchedulerHandle { token, join }
    }

    /// Spawn the sweep loop, stopping when `token` is cancelled.
    pub fn spawn_with_token(self, token: &CancellationToken) -> SchedulerHandle {
        let token = token.child_token();
        let child = token.clone();
        let join = tokio::spawn(async move { self.run(child).await });
        SchedulerHandle { token, join }
    }

    async fn run(self, token: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval_ms = self.interval.as_millis(), "expiry scheduler started");

        loop {
            tokio::select! {
                () = token.cancelled() => break,
                _ = ticker.tick() => {
                    let summary = self.sweep_once().await;
                    debug!(?summary, "sweep finished");
                }
            }
        }

        info!("expiry scheduler stopped");
    }
}

/// Handle to a running [`ExpiryScheduler`].
#[derive(Debug)]
pub struct SchedulerHandle {
    token: CancellationToken,
    join: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Ask the loop to stop without waiting.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Whether the loop has exited.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Stop the loop and wait for the in-flight sweep to finish.
    pub async fn shutdown(self) {
        self.token.cancel();
        if let Err(e) = self.join.await {
            warn!(error = %e, "expiry scheduler task failed");
        }
    }
}
