//! # claw-shield
//!
//! Adaptive intrusion prevention for Clawbernetes hosts.
//!
//! Authentication failures are recorded, counted over a sliding window and,
//! once an address crosses the threshold, blocked at the packet filter for a
//! duration that grows with every repeat offense.
//!
//! ## Components
//!
//! - [`RuleEvaluator`] - Persists attempts and decides when to block
//! - [`EnforcementController`] - Single writer of the packet filter, owns the live block view
//! - [`ExpiryScheduler`] - Lifts expired blocks and reconciles the filter
//! - [`SqliteStore`] - Durable attempt and block history
//! - [`PacketFilter`] - Filter abstraction with nftables and in-memory backends
//! - [`Dashboard`] - Operator queries and manual block/unblock
//!
//! ## Configuration
//!
//! - [`ShieldConfig`] - TOML configuration, validated once at startup
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use chrono::Utc;
//! use claw_shield::prelude::*;
//!
//! # async fn demo() -> ShieldResult<()> {
//! let config = ShieldConfig::builder().threshold(3).build();
//! let store = SqliteStore::open_in_memory().await?;
//! let controller = Arc::new(EnforcementController::new(
//!     store,
//!     MemoryFilter::new(),
//!     ControllerOptions::from_config(&config),
//! ));
//! controller.restore().await?;
//!
//! let evaluator = RuleEvaluator::new(RulePolicy::from_config(&config), Arc::clone(&controller));
//! let ip = "203.0.113.9".parse().map_err(|_| ShieldError::InvalidAddress("203.0.113.9".into()))?;
//! match evaluator.process_attempt(ip, Utc::now(), "Failed password").await? {
//!     AttemptOutcome::Blocked { duration, .. } => println!("blocked for {duration:?}"),
//!     other => println!("{other:?}"),
//! }
//!
//! let sweeper = ExpiryScheduler::new(controller, Duration::from_secs(5)).spawn();
//! sweeper.shutdown().await;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod dashboard;
pub mod enforcement;
pub mod error;
pub mod filter;
pub mod rules;
pub mod scheduler;
pub mod store;
pub mod types;

// Re-export main types
pub use config::{
    BlockingConfig, DatabaseConfig, EscalationPolicy, FilterConfig, FilterKind, LogFormat,
    LoggingConfig, MonitoringConfig, RulesConfig, ShieldConfig, ShieldConfigBuilder,
};
pub use dashboard::{DEFAULT_MANUAL_BLOCK_MINUTES, Dashboard, MANUAL_REASON};
pub use enforcement::{
    BlockOutcome, ControllerOptions, EnforcementController, ReconcileReport, ReleaseReport,
    RestoreReport,
};
pub use error::{FilterError, FilterResult, ShieldError, ShieldResult};
pub use filter::{FilterBackend, MemoryFilter, NftablesFilter, PacketFilter};
pub use rules::{AttemptOutcome, RuleEvaluator, RulePolicy, escalated_duration};
pub use scheduler::{ExpiryScheduler, SchedulerHandle, SweepSummary};
pub use store::SqliteStore;
pub use types::{AttemptEvent, AttemptRecord, BlockRecord, BlockStats};

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::config::ShieldConfig;
    pub use crate::dashboard::Dashboard;
    pub use crate::enforcement::{ControllerOptions, EnforcementController};
    pub use crate::error::{ShieldError, ShieldResult};
    pub use crate::filter::{FilterBackend, MemoryFilter, PacketFilter};
    pub use crate::rules::{AttemptOutcome, RuleEvaluator, RulePolicy};
    pub use crate::scheduler::ExpiryScheduler;
    pub use crate::store::SqliteStore;
    pub use crate::types::AttemptEvent;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::net::IpAddr;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_basic_detection_flow() {
        let config = ShieldConfig::builder()
            .threshold(2)
            .filter_backend(FilterKind::Memory)
            .build();
        let filter = MemoryFilter::new();
        let store = SqliteStore::open_in_memory().await.expect("store");
        let controller = Arc::new(EnforcementController::new(
            store,
            filter.clone(),
            ControllerOptions::from_config(&config),
        ));
        let evaluator = RuleEvaluator::new(RulePolicy::from_config(&config), Arc::clone(&controller));
        let ip: IpAddr = "192.0.2.10".parse().expect("valid address");

        let first = evaluator
            .deliver(AttemptEvent::new(ip, Utc::now(), "Invalid user admin"))
            .await
            .expect("first");
        assert!(matches!(first, AttemptOutcome::Recorded { recent: 1, .. }));

        let second = evaluator
            .deliver(AttemptEvent::new(ip, Utc::now(), "Invalid user admin"))
            .await
            .expect("second");
        assert!(matches!(second, AttemptOutcome::Blocked { offense: 0, .. }));
        assert!(filter.contains_now(ip));

        let dashboard = Dashboard::new(controller);
        assert_eq!(dashboard.active_blocks().await.expect("active").len(), 1);
    }
}
