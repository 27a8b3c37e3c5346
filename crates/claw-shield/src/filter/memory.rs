//! In-process packet filter.
//!
//! Used as the `memory` dry-run backend and as the fake in tests. Clones share
//! state, so a test can keep a handle while the controller owns another.

use std::collections::BTreeSet;
use std::net::IpAddr;
use std::sync::Arc;

use parking_lot::Mutex;

use super::PacketFilter;
use crate::error::{FilterError, FilterResult};

#[derive(Debug, Default)]
struct MemoryState {
    members: BTreeSet<IpAddr>,
    fail_mutations: bool,
    fail_queries: bool,
    adds: u64,
    removes: u64,
}

/// A packet filter backed by a shared in-memory set.
#[derive(Debug, Clone, Default)]
pub struct MemoryFilter {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryFilter {
    /// Create an empty filter.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a filter that already holds `members`.
    #[must_use]
    pub fn with_members(members: impl IntoIterator<Item = IpAddr>) -> Self {
        let filter = Self::new();
        filter.state.lock().members.extend(members);
        filter
    }

    /// Make every subsequent `add`/`remove` fail until reset.
    pub fn set_fail_mutations(&self, fail: bool) {
        self.state.lock().fail_mutations = fail;
    }

    /// Make every subsequent `contains`/`list` fail until reset.
    pub fn set_fail_queries(&self, fail: bool) {
        self.state.lock().fail_queries = fail;
    }

    /// Insert a member directly, bypassing failure injection.
    pub fn insert_external(&self, address: IpAddr) {
        self.state.lock().members.insert(address);
    }

    /// Synchronous membership check.
    #[must_use]
    pub fn contains_now(&self, address: IpAddr) -> bool {
        self.state.lock().members.contains(&address)
    }

    /// Copy of the current members.
    #[must_use]
    pub fn snapshot(&self) -> BTreeSet<IpAddr> {
        self.state.lock().members.clone()
    }

    /// Successful `add` calls so far.
    #[must_use]
    pub fn add_count(&self) -> u64 {
        self.state.lock().adds
    }

    /// Successful `remove` calls so far.
    #[must_use]
    pub fn remove_count(&self) -> u64 {
        self.state.lock().removes
    }
}

impl PacketFilter for MemoryFilter {
    async fn add(&self, address: IpAddr) -> FilterResult<()> {
        let mut state = self.state.lock();
        if state.fail_mutations {
            return Err(FilterError::Injected(format!("add {address}")));
        }
        state.members.insert(address);
        state.adds += 1;
        Ok(())
    }

    async fn remove(&self, address: IpAddr) -> FilterResult<()> {
        let mut state = self.state.lock();
        if state.fail_mutations {
            return Err(FilterError::Injected(format!("remove {address}")));
        }
        state.members.remove(&address);
        state.removes += 1;
        Ok(())
    }

    async fn contains(&self, address: IpAddr) -> FilterResult<bool> {
        let state = self.state.lock();
        if state.fail_queries {
            return Err(FilterError::Injected(format!("contains {address}")));
        }
        Ok(state.members.contains(&address))
    }

    async fn list(&self) -> FilterResult<BTreeSet<IpAddr>> {
        let state = self.state.lock();
        if state.fail_queries {
            return Err(FilterError::Injected("list".to_string()));
        }
        Ok(state.members.clone())
    }
}
