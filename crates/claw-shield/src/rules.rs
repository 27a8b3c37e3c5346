//! Threshold rule evaluation and escalating block durations.
//!
//! Every attempt is persisted first; the sliding-window count is then taken
//! from the store, anchored on the attempt's own timestamp so late or
//! out-of-order events are judged against the window they belong to.
//! Concurrent crossings for one address yield a single block.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tracing::{debug, info, warn};

use crate::config::{EscalationPolicy, ShieldConfig};
use crate::enforcement::{BlockOutcome, EnforcementController};
use crate::error::ShieldResult;
use crate::filter::PacketFilter;
use crate::store::SqliteStore;
use crate::types::AttemptEvent;

/// Block duration for an address with `prior_offenses` earlier blocks.
///
/// `min(max, base * multiplier ^ prior_offenses)`; the cap applies even to
/// the first offense.
#[must_use]
pub fn escalated_duration(policy: &EscalationPolicy, prior_offenses: u32) -> Duration {
    let exponent = i32::try_from(prior_offenses).unwrap_or(i32::MAX);
    let scaled = policy.base.as_secs_f64() * policy.multiplier.powi(exponent);

    if !scaled.is_finite() || scaled >= policy.max.as_secs_f64() {
        return policy.max;
    }
    Duration::try_from_secs_f64(scaled).unwrap_or(policy.max)
}

/// Inputs of the threshold rule.
#[derive(Debug, Clone, PartialEq)]
pub struct RulePolicy {
    /// Attempts within the window that trigger a block.
    pub threshold: u32,
    /// Sliding window length.
    pub time_window: Duration,
    /// Reason recorded on blocks issued by this rule.
    pub rule_name: String,
    /// Block duration growth.
    pub escalation: EscalationPolicy,
}

impl RulePolicy {
    /// Extract the rule policy from the configuration.
    #[must_use]
    pub fn from_config(config: &ShieldConfig) -> Self {
        Self {
            threshold: config.rules.threshold,
            time_window: config.time_window(),
            rule_name: config.rules.rule_name.clone(),
            escalation: config.escalation(),
        }
    }

    fn window_start(&self, at: DateTime<Utc>) -> DateTime<Utc> {
        TimeDelta::from_std(self.time_window)
            .ok()
            .and_then(|window| at.checked_sub_signed(window))
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }
}

/// What happened to one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// Recorded; the address is still under the threshold.
    Recorded {
        /// Attempts in the current window, this one included.
        recent: u32,
        /// Configured threshold.
        threshold: u32,
    },
    /// Recorded; the address was already blocked.
    AlreadyBlocked,
    /// Threshold crossed and the address is now blocked.
    Blocked {
        /// Duration of the new block.
        duration: Duration,
        /// Number of prior blocks that drove the escalation.
        offense: u32,
    },
    /// Threshold crossed but enforcement did not succeed.
    BlockFailed,
}

/// Turns attempts into block decisions.
#[derive(Debug)]
pub struct RuleEvaluator<F: PacketFilter> {
    policy: RulePolicy,
    store: SqliteStore,
    controller: Arc<EnforcementController<F>>,
}

impl<F: PacketFilter> RuleEvaluator<F> {
    /// Create an evaluator sharing the controller's store.
    pub fn new(policy: RulePolicy, controller: Arc<EnforcementController<F>>) -> Self {
        Self {
            policy,
            store: controller.store().clone(),
            controller,
        }
    }

    /// The active policy.
    pub const fn policy(&self) -> &RulePolicy {
        &self.policy
    }

    /// Convenience wrapper over [`Self::process_attempt`].
    pub async fn deliver(&self, event: AttemptEvent) -> ShieldResult<AttemptOutcome> {
        self.process_attempt(event.address, event.occurred_at, event.detail)
            .await
    }

    /// Record one attempt and block the address if it crossed the threshold.
    ///
    /// A store failure while recording aborts the decision and is returned;
    /// the attempt is then treated as never having happened.
    pub async fn process_attempt(
        &self,
        address: IpAddr,
        timestamp: DateTime<Utc>,
        detail: impl Into<String>,
    ) -> ShieldResult<AttemptOutcome> {
        let event = AttemptEvent::new(address, timestamp, detail);
        self.store.log_attempt(&event).await?;

        if self.controller.is_blocked(address).await {
            debug!(address = %address, "attempt from blocked address");
            return Ok(AttemptOutcome::AlreadyBlocked);
        }

        let recent = self
            .store
            .count_attempts(address, self.policy.window_start(timestamp), timestamp)
            .await?;
        if recent < self.policy.threshold {
            debug!(address = %address, recent, threshold = self.policy.threshold, "attempt recorded");
            return Ok(AttemptOutcome::Recorded {
                recent,
                threshold: self.policy.threshold,
            });
        }

        let offense = self.store.offense_count(address).await?;
        let duration = escalated_duration(&self.policy.escalation, offense);
        info!(
            address = %address,
            recent,
            offense,
            duration_secs = duration.as_secs(),
            "threshold crossed"
        );

        match self
            .controller
            .block_new(address, duration, &self.policy.rule_name)
            .await
        {
            BlockOutcome::Applied => Ok(AttemptOutcome::Blocked { duration, offense }),
            BlockOutcome::AlreadyBlocked => {
                debug!(address = %address, "blocked by a concurrent attempt");
                Ok(AttemptOutcome::AlreadyBlocked)
            }
            BlockOutcome::Failed => {
                warn!(address = %address, "threshold crossed but block not applied");
                Ok(AttemptOutcome::BlockFailed)
            }
        }
    }
}
