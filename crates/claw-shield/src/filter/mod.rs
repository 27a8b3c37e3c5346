//! Packet-filter backends.
//!
//! The enforcement layer only ever talks to a [`PacketFilter`]: a set of
//! addresses whose traffic is dropped. Every mutation is idempotent, so
//! retries after partial failures are always safe.

mod memory;
mod nftables;

use std::collections::BTreeSet;
use std::net::IpAddr;

use tracing::info;

pub use memory::MemoryFilter;
pub use nftables::{NftablesFilter, parse_set_elements};

use crate::config::{FilterKind, ShieldConfig};
use crate::error::{FilterResult, ShieldResult};

/// A packet filter holding the set of blocked addresses.
#[allow(async_fn_in_trait)]
pub trait PacketFilter: Send + Sync + 'static {
    /// Start dropping traffic from `address`. Adding a member is a no-op.
    fn add(&self, address: IpAddr) -> impl std::future::Future<Output = FilterResult<()>> + Send;

    /// Stop dropping traffic from `address`. Removing a non-member is a no-op.
    fn remove(
        &self,
        address: IpAddr,
    ) -> impl std::future::Future<Output = FilterResult<()>> + Send;

    /// Whether `address` is currently in the set.
    fn contains(
        &self,
        address: IpAddr,
    ) -> impl std::future::Future<Output = FilterResult<bool>> + Send;

    /// All current members.
    fn list(&self) -> impl std::future::Future<Output = FilterResult<BTreeSet<IpAddr>>> + Send;
}

/// The backend selected by configuration.
#[derive(Debug, Clone)]
pub enum FilterBackend {
    /// nftables via the `nft` command.
    Nftables(NftablesFilter),
    /// In-process set (dry run).
    Memory(MemoryFilter),
}

impl FilterBackend {
    /// Build and prepare the backend named by `config.filter.backend`.
    ///
    /// For nftables this creates the table, sets and drop rules if missing.
    pub async fn from_config(config: &ShieldConfig) -> ShieldResult<Self> {
        match config.filter.backend {
            FilterKind::Nftables => {
                let filter =
                    NftablesFilter::new(config.filter.table.clone(), config.command_timeout());
                filter.setup().await?;
                info!(table = %config.filter.table, "nftables filter ready");
                Ok(Self::Nftables(filter))
            }
            FilterKind::Memory => {
                info!("memory filter selected, no traffic will be dropped");
                Ok(Self::Memory(MemoryFilter::new()))
            }
        }
    }

    /// Short backend name for logs and status output.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Nftables(_) => "nftables",
            Self::Memory(_) => "memory",
        }
    }
}

impl PacketFilter for FilterBackend {
    async fn add(&self, address: IpAddr) -> FilterResult<()> {
        match self {
            Self::Nftables(f) => f.add(address).await,
            Self::Memory(f) => f.add(address).await,
        }
    }

    async fn remove(&self, address: IpAddr) -> FilterResult<()> {
        match self {
            Self::Nftables(f) => f.remove(address).await,
            Self::Memory(f) => f.remove(address).await,
        }
    }

    async fn contains(&self, address: IpAddr) -> FilterResult<bool> {
        match self {
            Self::Nftables(f) => f.contains(address).await,
            Self::Memory(f) => f.contains(address).await,
        }
    }

    async fn list(&self) -> FilterResult<BTreeSet<IpAddr>> {
        match self {
            Self::Nftables(f) => f.list().await,
            Self::Memory(f) => f.list().await,
        }
    }
}
