//! Read-mostly facade for operators.
//!
//! Queries go straight to the store; manual block and unblock go through the
//! enforcement controller like every other decision.

use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::info;

use crate::config::minutes;
use crate::enforcement::EnforcementController;
use crate::error::{FilterResult, ShieldResult};
use crate::filter::PacketFilter;
use crate::types::{AttemptRecord, BlockRecord, BlockStats};

/// Reason recorded on operator-issued blocks.
pub const MANUAL_REASON: &str = "manual";

/// Default length of a manual block, in minutes.
pub const DEFAULT_MANUAL_BLOCK_MINUTES: u64 = 60;

/// Operator view over the shield state.
#[derive(Debug, Clone)]
pub struct Dashboard<F: PacketFilter> {
    controller: Arc<EnforcementController<F>>,
}

impl<F: PacketFilter> Dashboard<F> {
    /// Create a dashboard over `controller`.
    pub const fn new(controller: Arc<EnforcementController<F>>) -> Self {
        Self { controller }
    }

    /// Latest attempts across all addresses.
    pub async fn recent_attempts(&self, limit: u32) -> ShieldResult<Vec<AttemptRecord>> {
        self.controller.store().recent_attempts(limit).await
    }

    /// Latest attempts from one address.
    pub async fn attempts_for(&self, address: IpAddr, limit: u32) -> ShieldResult<Vec<AttemptRecord>> {
        self.controller.store().attempts_for(address, limit).await
    }

    /// Active block records.
    pub async fn active_blocks(&self) -> ShieldResult<Vec<BlockRecord>> {
        self.controller.store().active_blocks().await
    }

    /// Block history, newest first.
    pub async fn block_history(
        &self,
        address: Option<IpAddr>,
        limit: u32,
    ) -> ShieldResult<Vec<BlockRecord>> {
        self.controller.store().block_history(address, limit).await
    }

    /// Addresses currently in the packet filter.
    pub async fn filter_members(&self) -> FilterResult<BTreeSet<IpAddr>> {
        self.controller.filter_members().await
    }

    /// Live view held by the controller.
    pub async fn live_blocks(&self) -> BTreeMap<IpAddr, DateTime<Utc>> {
        self.controller.live_blocks().await
    }

    /// Aggregate statistics.
    pub async fn stats(&self) -> ShieldResult<BlockStats> {
        self.controller.store().stats().await
    }

    /// Block `address` for `duration_minutes`, recorded as a manual block.
    pub async fn block(&self, address: IpAddr, duration_minutes: u64) -> bool {
        info!(address = %address, duration_minutes, "manual block requested");
        self.controller
            .block(address, minutes(duration_minutes), MANUAL_REASON)
            .await
    }

    /// Lift any block on `address`.
    pub async fn unblock(&self, address: IpAddr) -> bool {
        info!(address = %address, "manual unblock requested");
        self.controller.unblock(address).await
    }
}
