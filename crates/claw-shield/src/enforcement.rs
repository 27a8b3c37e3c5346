//! Enforcement controller.
//!
//! Owns the live block view and is the only component that mutates the packet
//! filter. Every block/unblock decision runs with the view lock held for the
//! whole critical section (store write and filter command included), so two
//! concurrent callers can never both decide to block, or both decide to
//! unblock, the same address.
//!
//! Ordering: a block record is written before the filter is touched, and an
//! unblock removes the address from the filter before clearing the record.
//! A crash in between is repaired by [`EnforcementController::restore`] and
//! the periodic [`EnforcementController::reconcile`].
//!
//! One-shot commands run their own controller against the same store and
//! filter. The store wins: reconcile drops view entries whose record was
//! cleared elsewhere and follows records replaced elsewhere.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::IpAddr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::ShieldConfig;
use crate::error::{FilterResult, ShieldResult};
use crate::filter::PacketFilter;
use crate::store::SqliteStore;
use crate::types::{BlockRecord, expiry_after};

/// Static inputs of the controller.
#[derive(Debug, Clone, Default)]
pub struct ControllerOptions {
    /// Addresses that are never blocked.
    pub allowlist: BTreeSet<IpAddr>,
    /// Expiry assumed for filter members with no active block record.
    pub unknown_block_default: Duration,
}

impl ControllerOptions {
    /// Extract controller options from the configuration.
    #[must_use]
    pub fn from_config(config: &ShieldConfig) -> Self {
        Self {
            allowlist: config.blocking.allowlist.clone(),
            unknown_block_default: config.unknown_block_default(),
        }
    }

    fn is_allowlisted(&self, address: IpAddr) -> bool {
        self.allowlist.contains(&address)
    }
}

/// One view entry. `record` is `None` for adopted filter members.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct LiveBlock {
    expires_at: DateTime<Utc>,
    record: Option<i64>,
}

impl LiveBlock {
    fn from_record(record: &BlockRecord) -> Self {
        Self {
            expires_at: record.expires_at,
            record: Some(record.id),
        }
    }

    const fn adopted(expires_at: DateTime<Utc>) -> Self {
        Self {
            expires_at,
            record: None,
        }
    }
}

/// In-memory cache over active block records.
#[derive(Debug, Default)]
struct LiveBlockView {
    entries: HashMap<IpAddr, LiveBlock>,
    /// Lifted blocks whose record could not be cleared, `address -> record id`.
    pending_clear: HashMap<IpAddr, i64>,
}

impl LiveBlockView {
    fn get(&self, address: IpAddr) -> Option<DateTime<Utc>> {
        self.entries.get(&address).map(|block| block.expires_at)
    }

    fn entry(&self, address: IpAddr) -> Option<LiveBlock> {
        self.entries.get(&address).copied()
    }

    fn insert(&mut self, address: IpAddr, block: LiveBlock) {
        self.entries.insert(address, block);
    }

    fn remove(&mut self, address: IpAddr) {
        self.entries.remove(&address);
    }

    fn expired(&self, now: DateTime<Utc>) -> Vec<IpAddr> {
        self.entries
            .iter()
            .filter(|(_, block)| block.expires_at <= now)
            .map(|(address, _)| *address)
            .collect()
    }

    fn unexpired(&self, now: DateTime<Utc>) -> Vec<(IpAddr, LiveBlock)> {
        self.entries
            .iter()
            .filter(|(_, block)| block.expires_at > now)
            .map(|(address, block)| (*address, *block))
            .collect()
    }
}

/// Outcome of [`EnforcementController::block_new`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockOutcome {
    /// A new block was recorded and applied.
    Applied,
    /// An unexpired block was already in force; nothing was written.
    AlreadyBlocked,
    /// The block was refused or could not be fully applied.
    Failed,
}

/// Outcome of [`EnforcementController::restore`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RestoreReport {
    /// Unexpired blocks re-applied to the filter.
    pub restored: usize,
    /// Blocks that lapsed while the daemon was down, now cleared.
    pub expired: usize,
    /// Records cleared because their address is now allow-listed.
    pub allowlisted: usize,
    /// Blocks whose filter re-application failed (retried by reconcile).
    pub failed: usize,
}

/// Outcome of [`EnforcementController::reconcile`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Live blocks re-added to the filter.
    pub reapplied: usize,
    /// View entries dropped because their block was lifted elsewhere.
    pub dropped: usize,
    /// Record clears that failed earlier and succeeded now.
    pub cleared: usize,
    /// Allow-listed addresses removed from the filter.
    pub removed: usize,
    /// Filter members adopted into the view.
    pub adopted: usize,
    /// Filter commands or record clears that failed.
    pub failed: usize,
}

/// Outcome of [`EnforcementController::release_expired`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReleaseReport {
    /// Expired blocks lifted.
    pub released: usize,
    /// Expired blocks that could not be lifted this time.
    pub failed: usize,
}

/// Applies and lifts blocks, keeping view, store and filter consistent.
#[derive(Debug)]
pub struct EnforcementController<F: PacketFilter> {
    store: SqliteStore,
    filter: F,
    view: Mutex<LiveBlockView>,
    options: ControllerOptions,
}

impl<F: PacketFilter> EnforcementController<F> {
    /// Create a controller with an empty view. Call [`Self::restore`] before use.
    pub fn new(store: SqliteStore, filter: F, options: ControllerOptions) -> Self {
        Self {
            store,
            filter,
            view: Mutex::new(LiveBlockView::default()),
            options,
        }
    }

    /// The persistent store.
    pub const fn store(&self) -> &SqliteStore {
        &self.store
    }

    /// The packet filter.
    pub const fn filter(&self) -> &F {
        &self.filter
    }

    /// Whether `address` is exempt from blocking.
    pub fn is_allowlisted(&self, address: IpAddr) -> bool {
        self.options.is_allowlisted(address)
    }

    /// Block `address` for `duration` from now.
    ///
    /// Returns `true` when the address ends up blocked at least until the
    /// requested expiry. A longer existing block is kept untouched.
    pub async fn block(&self, address: IpAddr, duration: Duration, reason: &str) -> bool {
        if self.options.is_allowlisted(address) {
            warn!(address = %address, reason, "refusing to block allow-listed address");
            return false;
        }

        let now = Utc::now();
        let requested = expiry_after(now, duration);
        let mut view = self.view.lock().await;

        let existing = match view.entry(address) {
            Some(block) => Some(block),
            None => match self.store.active_block(address).await {
                Ok(record) => record.as_ref().map(LiveBlock::from_record),
                Err(e) => {
                    error!(address = %address, error = %e, "store lookup failed, block aborted");
                    return false;
                }
            },
        };

        if let Some(block) = existing.filter(|block| block.expires_at > requested) {
            view.insert(address, block);
            debug!(address = %address, expires_at = %block.expires_at, "longer block already in force");
            return true;
        }

        self.block_locked(&mut view, address, duration, reason, now)
            .await
    }

    /// Block `address` unless an unexpired block record is already active.
    ///
    /// The check and the block share one lock acquisition, so concurrent
    /// threshold crossings for one address write a single record.
    pub async fn block_new(
        &self,
        address: IpAddr,
        duration: Duration,
        reason: &str,
    ) -> BlockOutcome {
        if self.options.is_allowlisted(address) {
            warn!(address = %address, reason, "refusing to block allow-listed address");
            return BlockOutcome::Failed;
        }

        let now = Utc::now();
        let mut view = self.view.lock().await;

        match self.store.active_block(address).await {
            Ok(Some(record)) if !record.is_expired_at(now) => {
                view.insert(address, LiveBlock::from_record(&record));
                debug!(
                    address = %address,
                    offense = record.offense_count,
                    expires_at = %record.expires_at,
                    "block already in force"
                );
                return BlockOutcome::AlreadyBlocked;
            }
            Ok(_) => {}
            Err(e) => {
                error!(address = %address, error = %e, "store lookup failed, block aborted");
                return BlockOutcome::Failed;
            }
        }

        if self
            .block_locked(&mut view, address, duration, reason, now)
            .await
        {
            BlockOutcome::Applied
        } else {
            BlockOutcome::Failed
        }
    }

    /// Record a new block, then add it to the filter.
    async fn block_locked(
        &self,
        view: &mut LiveBlockView,
        address: IpAddr,
        duration: Duration,
        reason: &str,
        now: DateTime<Utc>,
    ) -> bool {
        let requested = expiry_after(now, duration);
        let record = match self.store.log_block(address, reason, now, requested).await {
            Ok(record) => record,
            Err(e) => {
                error!(address = %address, error = %e, "failed to persist block, filter untouched");
                return false;
            }
        };
        // The new record supersedes any record still waiting to be cleared.
        view.pending_clear.remove(&address);
        view.insert(address, LiveBlock::from_record(&record));

        if let Err(e) = self.filter.add(address).await {
            error!(
                address = %address,
                error = %e,
                "filter add failed, block recorded and will be retried"
            );
            return false;
        }

        info!(
            address = %address,
            reason,
            offense = record.offense_count,
            duration_secs = duration.as_secs(),
            expires_at = %record.expires_at,
            "address blocked"
        );
        true
    }

    /// Lift any block on `address`.
    ///
    /// Returns `false` when nothing was blocked or the filter could not be
    /// updated (state is then left for the next sweep).
    pub async fn unblock(&self, address: IpAddr) -> bool {
        let mut view = self.view.lock().await;
        let active = match self.store.active_block(address).await {
            Ok(active) => active,
            Err(e) => {
                error!(address = %address, error = %e, "store lookup failed, unblock aborted");
                return false;
            }
        };
        self.unblock_locked(&mut view, address, active).await
    }

    /// Remove `address` from the filter, then clear its record.
    ///
    /// When the record cannot be cleared the address stays unblocked and the
    /// clear is retried by [`Self::reconcile`]. The retry is held in memory
    /// only: if the process exits first, [`Self::restore`] re-applies the
    /// still-active record.
    async fn unblock_locked(
        &self,
        view: &mut LiveBlockView,
        address: IpAddr,
        active: Option<BlockRecord>,
    ) -> bool {
        if view.get(address).is_none() && active.is_none() {
            match self.filter.contains(address).await {
                Ok(true) => {}
                Ok(false) => {
                    debug!(address = %address, "unblock requested for unblocked address");
                    return false;
                }
                Err(e) => {
                    warn!(address = %address, error = %e, "filter query failed during unblock");
                    return false;
                }
            }
        }

        if let Err(e) = self.filter.remove(address).await {
            error!(address = %address, error = %e, "filter remove failed, unblock will be retried");
            return false;
        }
        view.remove(address);

        let mut cleared = true;
        if let Some(record) = active {
            if let Err(e) = self.store.deactivate_record(record.id, Utc::now()).await {
                error!(
                    address = %address,
                    error = %e,
                    "failed to clear block record, will be retried"
                );
                view.pending_clear.insert(address, record.id);
                cleared = false;
            }
        }

        info!(address = %address, "address unblocked");
        cleared
    }

    /// Whether traffic from `address` is currently being dropped.
    ///
    /// Consults the view first; on a miss the filter is authoritative and the
    /// view is repaired from the store (or a default expiry) when it holds the
    /// address. An entry lifted by another process is dropped by the next
    /// [`Self::reconcile`].
    pub async fn is_blocked(&self, address: IpAddr) -> bool {
        let now = Utc::now();
        let mut view = self.view.lock().await;
        if let Some(expires) = view.get(address) {
            return expires > now;
        }

        match self.filter.contains(address).await {
            Ok(true) => {}
            Ok(false) => return false,
            Err(e) => {
                warn!(address = %address, error = %e, "filter query failed, assuming not blocked");
                return false;
            }
        }

        self.adopt_locked(&mut view, address, now).await > now
    }

    /// Insert a filter member that the view did not know about.
    async fn adopt_locked(
        &self,
        view: &mut LiveBlockView,
        address: IpAddr,
        now: DateTime<Utc>,
    ) -> DateTime<Utc> {
        let block = match self.store.active_block(address).await {
            Ok(Some(record)) => LiveBlock::from_record(&record),
            Ok(None) => {
                // A lapsed block left in the filter is released by the next sweep.
                if let Ok(Some(last)) = self
                    .store
                    .block_history(Some(address), 1)
                    .await
                    .map(|history| history.into_iter().next())
                {
                    if last.is_expired_at(now) {
                        debug!(address = %address, expired_at = %last.expires_at, "lapsed block still in filter");
                        view.insert(address, LiveBlock::adopted(last.expires_at));
                        return last.expires_at;
                    }
                }
                let expires = expiry_after(now, self.options.unknown_block_default);
                warn!(
                    address = %address,
                    expires_at = %expires,
                    "address in filter without block record, adopting with default expiry"
                );
                LiveBlock::adopted(expires)
            }
            Err(e) => {
                let expires = expiry_after(now, self.options.unknown_block_default);
                warn!(
                    address = %address,
                    error = %e,
                    expires_at = %expires,
                    "store lookup failed, adopting filter member with default expiry"
                );
                LiveBlock::adopted(expires)
            }
        };
        view.insert(address, block);
        block.expires_at
    }

    /// Re-apply persisted blocks after a restart.
    ///
    /// Unexpired active records are added to the filter and the view; records
    /// that lapsed while the daemon was down are cleared without touching the
    /// filter. Store failures are fatal here.
    pub async fn restore(&self) -> ShieldResult<RestoreReport> {
        let now = Utc::now();
        let records = self.store.active_blocks().await?;
        let mut view = self.view.lock().await;
        let mut report = RestoreReport::default();

        for record in records {
            if self.options.is_allowlisted(record.address) {
                self.store.deactivate_record(record.id, now).await?;
                report.allowlisted += 1;
                continue;
            }
            if record.is_expired_at(now) {
                self.store.deactivate_record(record.id, now).await?;
                report.expired += 1;
                continue;
            }

            view.insert(record.address, LiveBlock::from_record(&record));
            match self.filter.add(record.address).await {
                Ok(()) => report.restored += 1,
                Err(e) => {
                    warn!(address = %record.address, error = %e, "failed to re-apply block");
                    report.failed += 1;
                }
            }
        }

        info!(
            restored = report.restored,
            expired = report.expired,
            allowlisted = report.allowlisted,
            failed = report.failed,
            "block state restored"
        );
        Ok(report)
    }
    /// Lift every block whose expiry has passed.
    ///
    /// Covers expired view entries first, then expired active records the
    /// view does not know about.
    pub async fn release_expired(&self) -> ShieldResult<ReleaseReport> {
        let mut report = ReleaseReport::default();

        let due = self.view.lock().await.expired(Utc::now());
        for address in due {
            match self.release_view_entry(address).await {
                Some(true) => report.released += 1,
                Some(false) => report.failed += 1,
                None => {}
            }
        }

        for record in self.store.expired_active_blocks(Utc::now()).await? {
            match self.release_record(record).await {
                Some(true) => report.released += 1,
                Some(false) => report.failed += 1,
                None => {}
            }
        }

        if report.released > 0 || report.failed > 0 {
            debug!(released = report.released, failed = report.failed, "expired blocks processed");
        }
        Ok(report)
    }

    /// Unblock `address` if its view entry is still expired once locked.
    async fn release_view_entry(&self, address: IpAddr) -> Option<bool> {
        let mut view = self.view.lock().await;
        if view.get(address).is_none_or(|expires| expires > Utc::now()) {
            return None;
        }
        let active = match self.store.active_block(address).await {
            Ok(active) => active,
            Err(e) => {
                error!(address = %address, error = %e, "store lookup failed during sweep");
                return Some(false);
            }
        };
        Some(self.unblock_locked(&mut view, address, active).await)
    }

    /// Unblock an expired record unless it was superseded meanwhile.
    async fn release_record(&self, record: BlockRecord) -> Option<bool> {
        let mut view = self.view.lock().await;
        if view.get(record.address).is_some() {
            return None;
        }
        let active = match self.store.active_block(record.address).await {
            Ok(Some(active)) if active.id == record.id => active,
            Ok(_) => return None,
            Err(e) => {
                error!(address = %record.address, error = %e, "store lookup failed during sweep");
                return Some(false);
            }
        };
        Some(self.unblock_locked(&mut view, record.address, Some(active)).await)
    }

    /// Bring the view and the filter back in line with the store.
    ///
    /// Retries record clears that failed earlier, then walks the unexpired
    /// view entries: an entry follows its active record and is re-added to
    /// the filter if missing, an entry whose record was cleared elsewhere is
    /// lifted, and an adopted entry that left the filter is dropped. Finally
    /// allow-listed members are removed and unknown members are adopted.
    pub async fn reconcile(&self) -> ShieldResult<ReconcileReport> {
        let now = Utc::now();
        let mut view = self.view.lock().await;
        let mut report = ReconcileReport::default();

        let pending: Vec<(IpAddr, i64)> = view
            .pending_clear
            .iter()
            .map(|(address, id)| (*address, *id))
            .collect();
        for (address, id) in pending {
            match self.store.deactivate_record(id, now).await {
                Ok(_) => {
                    view.pending_clear.remove(&address);
                    info!(address = %address, record = id, "cleared block record");
                    report.cleared += 1;
                }
                Err(e) => {
                    warn!(address = %address, error = %e, "block record still cannot be cleared");
                    report.failed += 1;
                }
            }
        }

        let active: HashMap<IpAddr, BlockRecord> = self
            .store
            .active_blocks()
            .await?
            .into_iter()
            .map(|record| (record.address, record))
            .collect();
        let mut members = self.filter.list().await?;

        for (address, block) in view.unexpired(now) {
            match active.get(&address) {
                Some(record) => {
                    view.insert(address, LiveBlock::from_record(record));
                    if record.is_expired_at(now)
                        || members.contains(&address)
                        || self.options.is_allowlisted(address)
                    {
                        continue;
                    }
                    match self.filter.add(address).await {
                        Ok(()) => {
                            info!(address = %address, "re-applied missing block");
                            members.insert(address);
                            report.reapplied += 1;
                        }
                        Err(e) => {
                            warn!(address = %address, error = %e, "failed to re-apply block");
                            report.failed += 1;
                        }
                    }
                }
                None if block.record.is_some() => match self.filter.remove(address).await {
                    Ok(()) => {
                        info!(address = %address, "block lifted elsewhere, dropped from view");
                        members.remove(&address);
                        view.remove(address);
                        report.dropped += 1;
                    }
                    Err(e) => {
                        warn!(address = %address, error = %e, "failed to remove block lifted elsewhere");
                        report.failed += 1;
                    }
                },
                None if !members.contains(&address) => {
                    debug!(address = %address, "adopted member left the filter");
                    view.remove(address);
                    report.dropped += 1;
                }
                None => {}
            }
        }

        for &address in &members {
            if self.options.is_allowlisted(address) {
                match self.filter.remove(address).await {
                    Ok(()) => {
                        warn!(address = %address, "removed allow-listed address from filter");
                        view.remove(address);
                        if let Err(e) = self.store.deactivate(address, now).await {
                            error!(address = %address, error = %e, "failed to clear block record");
                        }
                        report.removed += 1;
                    }
                    Err(e) => {
                        warn!(address = %address, error = %e, "failed to remove allow-listed address");
                        report.failed += 1;
                    }
                }
            } else if view.get(address).is_none() {
                self.adopt_locked(&mut view, address, now).await;
                report.adopted += 1;
            }
        }

        Ok(report)
    }

    /// Snapshot of the live view, `address -> expires_at`.
    pub async fn live_blocks(&self) -> BTreeMap<IpAddr, DateTime<Utc>> {
        self.view
            .lock()
            .await
            .entries
            .iter()
            .map(|(address, block)| (*address, block.expires_at))
            .collect()
    }

    /// Current members of the packet filter.
    pub async fn filter_members(&self) -> FilterResult<BTreeSet<IpAddr>> {
        self.filter.list().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::MemoryFilter;
    use chrono::TimeDelta;

    fn addr(s: &str) -> IpAddr {
        s.parse().expect("valid address")
    }

    async fn controller_with(
        filter: MemoryFilter,
        allow: &[&str],
    ) -> EnforcementController<MemoryFilter> {
        let store = SqliteStore::open_in_memory().await.expect("store");
        let options = ControllerOptions {
            allowlist: allow.iter().map(|s| addr(s)).collect(),
            unknown_block_default: Duration::from_secs(24 * 3600),
        };
        EnforcementController::new(store, filter, options)
    }

    #[tokio::test]
    async fn test_block_writes_record_then_filter() {
        let filter = MemoryFilter::new();
        let controller = controller_with(filter.clone(), &[]).await;
        let ip = addr("10.0.0.5");

        assert!(controller.block(ip, Duration::from_secs(600), "auth-failure").await);
        assert!(filter.contains_now(ip));
        assert!(controller.is_blocked(ip).await);

        let record = controller.store().active_block(ip).await.expect("q").expect("record");
        assert_eq!(record.reason, "auth-failure");
        assert_eq!(record.offense_count, 1);
    }

    #[tokio::test]
    async fn test_allowlisted_address_is_never_blocked() {
        let filter = MemoryFilter::new();
        let controller = controller_with(filter.clone(), &["127.0.0.1"]).await;
        let ip = addr("127.0.0.1");

        assert!(!controller.block(ip, Duration::from_secs(600), "manual").await);
        assert_eq!(filter.add_count(), 0);
        assert_eq!(controller.store().offense_count(ip).await.expect("q"), 0);
        assert!(!controller.is_blocked(ip).await);
    }

    #[tokio::test]
    async fn test_longer_block_is_not_shortened() {
        let filter = MemoryFilter::new();
        let controller = controller_with(filter.clone(), &[]).await;
        let ip = addr("10.0.0.5");

        assert!(controller.block(ip, Duration::from_secs(3600), "manual").await);
        let before = controller.live_blocks().await[&ip];

        assert!(controller.block(ip, Duration::from_secs(60), "auth-failure").await);
        assert_eq!(controller.live_blocks().await[&ip], before);
        assert_eq!(controller.store().offense_count(ip).await.expect("q"), 1);
    }

    #[tokio::test]
    async fn test_shorter_existing_block_is_extended() {
        let controller = controller_with(MemoryFilter::new(), &[]).await;
        let ip = addr("10.0.0.5");

        assert!(controller.block(ip, Duration::from_secs(60), "auth-failure").await);
        assert!(controller.block(ip, Duration::from_secs(3600), "manual").await);

        let active = controller.store().active_blocks().await.expect("q");
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].reason, "manual");
        assert_eq!(active[0].offense_count, 2);
    }

    #[tokio::test]
    async fn test_unblock_twice() {
        let filter = MemoryFilter::new();
        let controller = controller_with(filter.clone(), &[]).await;
        let ip = addr("10.0.0.5");

        controller.block(ip, Duration::from_secs(600), "manual").await;
        assert!(controller.unblock(ip).await);
        assert!(!filter.contains_now(ip));
        assert!(controller.store().active_block(ip).await.expect("q").is_none());

        let removes = filter.remove_count();
        assert!(!controller.unblock(ip).await);
        assert_eq!(filter.remove_count(), removes);
    }

    #[tokio::test]
    async fn test_unblock_filter_only_member() {
        let filter = MemoryFilter::with_members([addr("10.9.9.9")]);
        let controller = controller_with(filter.clone(), &[]).await;

        assert!(controller.unblock(addr("10.9.9.9")).await);
        assert!(filter.snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_unblock_filter_failure_keeps_state() {
        let filter = MemoryFilter::new();
        let controller = controller_with(filter.clone(), &[]).await;
        let ip = addr("10.0.0.5");
        controller.block(ip, Duration::from_secs(600), "manual").await;

        filter.set_fail_mutations(true);
        assert!(!controller.unblock(ip).await);
        assert!(controller.live_blocks().await.contains_key(&ip));
        assert!(controller.store().active_block(ip).await.expect("q").is_some());

        filter.set_fail_mutations(false);
        assert!(controller.unblock(ip).await);
    }

    #[tokio::test]
    async fn test_filter_failure_on_block_keeps_record() {
        let filter = MemoryFilter::new();
        filter.set_fail_mutations(true);
        let controller = controller_with(filter.clone(), &[]).await;
        let ip = addr("10.0.0.5");

        assert!(!controller.block(ip, Duration::from_secs(600), "auth-failure").await);
        assert!(controller.store().active_block(ip).await.expect("q").is_some());
        assert!(controller.live_blocks().await.contains_key(&ip));

        filter.set_fail_mutations(false);
        let report = controller.reconcile().await.expect("reconcile");
        assert_eq!(report.reapplied, 1);
        assert!(filter.contains_now(ip));
    }

    #[tokio::test]
    async fn test_is_blocked_adopts_unknown_filter_member() {
        let ip = addr("10.1.1.1");
        let filter = MemoryFilter::with_members([ip]);
        let controller = controller_with(filter, &[]).await;

        assert!(controller.is_blocked(ip).await);
        let expires = controller.live_blocks().await[&ip];
        assert!(expires > Utc::now() + TimeDelta::hours(23));
    }

    #[tokio::test]
    async fn test_expired_view_entry_reports_unblocked() {
        let filter = MemoryFilter::new();
        let controller = controller_with(filter.clone(), &[]).await;
        let ip = addr("10.0.0.5");

        controller.block(ip, Duration::ZERO, "auth-failure").await;
        assert!(filter.contains_now(ip));
        assert!(!controller.is_blocked(ip).await);

        let report = controller.release_expired().await.expect("sweep");
        assert_eq!(report.released, 1);
        assert!(!filter.contains_now(ip));
        assert!(controller.live_blocks().await.is_empty());
    }

    #[tokio::test]
    async fn test_release_expired_store_record_missing_from_view() {
        let filter = MemoryFilter::with_members([addr("10.0.0.7")]);
        let controller = controller_with(filter.clone(), &[]).await;
        let now = Utc::now();
        controller
            .store()
            .log_block(addr("10.0.0.7"), "auth-failure", now - TimeDelta::hours(2), now - TimeDelta::hours(1))
            .await
            .expect("record");

        let report = controller.release_expired().await.expect("sweep");
        assert_eq!(report.released, 1);
        assert!(filter.snapshot().is_empty());
        assert!(controller.store().active_blocks().await.expect("q").is_empty());
    }

    #[tokio::test]
    async fn test_restore_reapplies_and_expires() {
        let filter = MemoryFilter::new();
        let controller = controller_with(filter.clone(), &["127.0.0.1"]).await;
        let store = controller.store();
        let now = Utc::now();

        store
            .log_block(addr("10.0.0.1"), "r", now, now + TimeDelta::hours(1))
            .await
            .expect("live");
        store
            .log_block(addr("10.0.0.2"), "r", now - TimeDelta::hours(2), now - TimeDelta::hours(1))
            .await
            .expect("lapsed");
        store
            .log_block(addr("127.0.0.1"), "r", now, now + TimeDelta::hours(1))
            .await
            .expect("allow-listed");

        let report = controller.restore().await.expect("restore");
        assert_eq!(
            report,
            RestoreReport {
                restored: 1,
                expired: 1,
                allowlisted: 1,
                failed: 0
            }
        );
        assert_eq!(filter.snapshot().into_iter().collect::<Vec<_>>(), [addr("10.0.0.1")]);
        assert!(controller.is_blocked(addr("10.0.0.1")).await);
        assert_eq!(store.active_blocks().await.expect("q").len(), 1);
    }

    #[tokio::test]
    async fn test_lapsed_block_left_in_filter_is_released() {
        let ip = addr("10.0.0.2");
        let filter = MemoryFilter::with_members([ip]);
        let controller = controller_with(filter.clone(), &[]).await;
        let now = Utc::now();
        controller
            .store()
            .log_block(ip, "r", now - TimeDelta::hours(2), now - TimeDelta::hours(1))
            .await
            .expect("lapsed");

        let report = controller.restore().await.expect("restore");
        assert_eq!(report.expired, 1);
        assert!(filter.contains_now(ip));

        assert_eq!(controller.reconcile().await.expect("reconcile").adopted, 1);
        assert!(!controller.is_blocked(ip).await);

        let released = controller.release_expired().await.expect("sweep");
        assert_eq!(released.released, 1);
        assert!(!filter.contains_now(ip));
    }

    #[tokio::test]
    async fn test_reconcile_removes_allowlisted_members() {
        let filter = MemoryFilter::with_members([addr("127.0.0.1"), addr("10.3.3.3")]);
        let controller = controller_with(filter.clone(), &["127.0.0.1"]).await;

        let report = controller.reconcile().await.expect("reconcile");
        assert_eq!(report.removed, 1);
        assert_eq!(report.adopted, 1);
        assert!(!filter.contains_now(addr("127.0.0.1")));
        assert!(controller.live_blocks().await.contains_key(&addr("10.3.3.3")));
    }

    #[tokio::test]
    async fn test_store_failure_aborts_block() {
        let filter = MemoryFilter::new();
        let controller = controller_with(filter.clone(), &[]).await;
        controller.store().close().await;

        assert!(!controller.block(addr("10.0.0.5"), Duration::from_secs(60), "r").await);
        assert_eq!(filter.add_count(), 0);
        assert!(controller.restore().await.is_err());
    }

    #[tokio::test]
    async fn test_block_new_leaves_live_block_alone() {
        let filter = MemoryFilter::new();
        let controller = controller_with(filter.clone(), &["127.0.0.1"]).await;
        let ip = addr("10.0.0.6");

        assert_eq!(
            controller.block_new(ip, Duration::from_secs(600), "auth-failure").await,
            BlockOutcome::Applied
        );
        assert_eq!(
            controller.block_new(ip, Duration::from_secs(1200), "auth-failure").await,
            BlockOutcome::AlreadyBlocked
        );
        assert_eq!(controller.store().offense_count(ip).await.expect("q"), 1);
        assert_eq!(filter.add_count(), 1);

        assert_eq!(
            controller.block_new(addr("127.0.0.1"), Duration::from_secs(600), "auth-failure").await,
            BlockOutcome::Failed
        );
    }

    #[tokio::test]
    async fn test_block_new_replaces_lapsed_record() {
        let controller = controller_with(MemoryFilter::new(), &[]).await;
        let ip = addr("10.0.0.6");

        controller.block(ip, Duration::ZERO, "auth-failure").await;
        assert_eq!(
            controller.block_new(ip, Duration::from_secs(600), "auth-failure").await,
            BlockOutcome::Applied
        );
        let active = controller.store().active_block(ip).await.expect("q").expect("record");
        assert_eq!(active.offense_count, 2);
        assert!(controller.is_blocked(ip).await);
    }

    #[tokio::test]
    async fn test_unblock_by_another_controller_is_not_undone() {
        let filter = MemoryFilter::new();
        let daemon = controller_with(filter.clone(), &[]).await;
        let oneshot = EnforcementController::new(
            daemon.store().clone(),
            filter.clone(),
            ControllerOptions::default(),
        );
        let ip = addr("10.0.0.5");

        assert!(daemon.block(ip, Duration::from_secs(3600), "auth-failure").await);
        assert!(oneshot.unblock(ip).await);

        let report = daemon.reconcile().await.expect("reconcile");
        assert_eq!(report.reapplied, 0);
        assert_eq!(report.dropped, 1);
        assert!(!filter.contains_now(ip));
        assert!(!daemon.is_blocked(ip).await);
        assert!(daemon.live_blocks().await.is_empty());
    }

    #[tokio::test]
    async fn test_reconcile_follows_record_replaced_elsewhere() {
        let filter = MemoryFilter::new();
        let daemon = controller_with(filter.clone(), &[]).await;
        let oneshot = EnforcementController::new(
            daemon.store().clone(),
            filter.clone(),
            ControllerOptions::default(),
        );
        let ip = addr("10.0.0.5");

        assert!(daemon.block(ip, Duration::from_secs(600), "auth-failure").await);
        assert!(oneshot.block(ip, Duration::from_secs(7200), "manual").await);
        let replaced = daemon.store().active_block(ip).await.expect("q").expect("record");

        let report = daemon.reconcile().await.expect("reconcile");
        assert_eq!(report.dropped, 0);
        assert_eq!(daemon.live_blocks().await[&ip], replaced.expires_at);
        assert!(filter.contains_now(ip));
    }

    #[tokio::test]
    async fn test_adopted_member_removed_from_filter_is_dropped() {
        let ip = addr("10.1.1.1");
        let filter = MemoryFilter::with_members([ip]);
        let controller = controller_with(filter.clone(), &[]).await;
        assert!(controller.is_blocked(ip).await);

        filter.remove(ip).await.expect("remove");
        let report = controller.reconcile().await.expect("reconcile");
        assert_eq!(report.dropped, 1);
        assert_eq!(report.reapplied, 0);
        assert!(!controller.is_blocked(ip).await);
    }

    #[tokio::test]
    async fn test_failed_record_clear_is_retried() {
        let filter = MemoryFilter::new();
        let controller = controller_with(filter.clone(), &[]).await;
        let ip = addr("10.0.0.5");
        assert!(controller.block(ip, Duration::from_secs(3600), "manual").await);

        sqlx::query(
            "CREATE TRIGGER refuse_clear BEFORE UPDATE ON blocks WHEN NEW.active = 0
             BEGIN SELECT RAISE(ABORT, 'clear refused'); END",
        )
        .execute(controller.store().pool())
        .await
        .expect("create trigger");

        assert!(!controller.unblock(ip).await);
        assert!(!filter.contains_now(ip));
        assert!(!controller.is_blocked(ip).await);
        assert!(controller.store().active_block(ip).await.expect("q").is_some());

        let report = controller.reconcile().await.expect("reconcile");
        assert_eq!(report.cleared, 0);
        assert_eq!(report.failed, 1);
        assert_eq!(report.reapplied, 0);
        assert!(!filter.contains_now(ip));

        sqlx::query("DROP TRIGGER refuse_clear")
            .execute(controller.store().pool())
            .await
            .expect("drop trigger");
        let report = controller.reconcile().await.expect("reconcile");
        assert_eq!(report.cleared, 1);
        assert!(controller.store().active_block(ip).await.expect("q").is_none());
        assert!(!filter.contains_now(ip));
    }
}
