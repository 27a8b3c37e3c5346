//! Daemon wiring: bootstrap, workers and shutdown.

use std::sync::Arc;

use claw_shield::{
    AttemptEvent, AttemptOutcome, ControllerOptions, Dashboard, EnforcementController,
    ExpiryScheduler, FilterBackend, RestoreReport, RuleEvaluator, RulePolicy, SchedulerHandle,
    ShieldConfig, SqliteStore,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{DaemonError, DaemonResult};
use crate::journal::JournalSource;

/// Capacity of the attempt queue between the event source and the evaluator.
pub const EVENT_QUEUE: usize = 1024;

/// Controller over the configured filter backend.
pub type Controller = EnforcementController<FilterBackend>;

/// Long-lived components shared by the workers and the CLI.
#[derive(Debug)]
pub struct Services {
    /// Validated configuration.
    pub config: ShieldConfig,
    /// Enforcement controller (owns the store and the filter).
    pub controller: Arc<Controller>,
}

impl Services {
    /// Open the store and the filter without touching enforcement state.
    ///
    /// Used by one-shot CLI commands.
    pub async fn connect(config: ShieldConfig) -> DaemonResult<Self> {
        let store = SqliteStore::open(&config.database.path).await?;
        let filter = FilterBackend::from_config(&config).await?;
        let controller = Arc::new(EnforcementController::new(
            store,
            filter,
            ControllerOptions::from_config(&config),
        ));
        Ok(Self { config, controller })
    }

    /// Connect and re-apply persisted blocks. Any failure here is fatal.
    pub async fn bootstrap(config: ShieldConfig) -> DaemonResult<(Self, RestoreReport)> {
        let services = Self::connect(config).await?;
        let report = services.controller.restore().await?;
        info!(
            backend = services.controller.filter().name(),
            database = %services.config.database.path.display(),
            restored = report.restored,
            "shield bootstrapped"
        );
        Ok((services, report))
    }

    /// Operator facade over the controller.
    #[must_use]
    pub fn dashboard(&self) -> Dashboard<FilterBackend> {
        Dashboard::new(Arc::clone(&self.controller))
    }

    /// Close the store.
    pub async fn close(&self) {
        self.controller.store().close().await;
    }
}

/// Consume attempts until the queue closes or `token` is cancelled.
async fn ingest(
    evaluator: RuleEvaluator<FilterBackend>,
    mut events: mpsc::Receiver<AttemptEvent>,
    token: CancellationToken,
) -> usize {
    let mut processed = 0;

    loop {
        let event = tokio::select! {
            () = token.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        let address = event.address;
        match evaluator.deliver(event).await {
            Ok(AttemptOutcome::Recorded { recent, threshold }) => {
                debug!(address = %address, recent, threshold, "attempt below threshold");
            }
            Ok(AttemptOutcome::AlreadyBlocked) => {
                debug!(address = %address, "attempt from blocked address");
            }
            Ok(AttemptOutcome::Blocked { duration, offense }) => {
                info!(
                    address = %address,
                    offense,
                    duration_secs = duration.as_secs(),
                    "attempt triggered block"
                );
            }
            Ok(AttemptOutcome::BlockFailed) => {
                warn!(address = %address, "attempt crossed threshold, block not applied");
            }
            Err(e) => {
                error!(address = %address, error = %e, "failed to record attempt");
            }
        }
        processed += 1;
    }

    info!(processed, "ingestion worker stopped");
    processed
}

/// A started daemon.
#[derive(Debug)]
pub struct RunningDaemon {
    services: Services,
    token: CancellationToken,
    events: mpsc::Sender<AttemptEvent>,
    ingest: JoinHandle<usize>,
    journal: Option<JoinHandle<()>>,
    scheduler: SchedulerHandle,
}

impl RunningDaemon {
    /// Sender feeding the ingestion worker.
    #[must_use]
    pub fn events(&self) -> mpsc::Sender<AttemptEvent> {
        self.events.clone()
    }

    /// Shared components.
    #[must_use]
    pub const fn services(&self) -> &Services {
        &self.services
    }

    /// Token cancelling every worker.
    #[must_use]
    pub const fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Resolve when the journal source exits (never, if there is none).
    pub async fn journal_stopped(&mut self) {
        match self.journal.as_mut() {
            Some(handle) => {
                if let Err(e) = handle.await {
                    error!(error = %e, "journal task failed");
                }
                self.journal = None;
            }
            None => std::future::pending().await,
        }
    }

    /// Cancel every worker, wait for them, then close the store.
    ///
    /// Returns the number of attempts the ingestion worker processed.
    pub async fn shutdown(self) -> DaemonResult<usize> {
        info!("shutting down");
        self.token.cancel();
        drop(self.events);

        if let Some(journal) = self.journal {
            if let Err(e) = journal.await {
                warn!(error = %e, "journal task failed");
            }
        }
        let processed = self.ingest.await.unwrap_or_else(|e| {
            warn!(error = %e, "ingestion task failed");
            0
        });
        self.scheduler.shutdown().await;
        self.services.close().await;

        info!("shutdown complete");
        Ok(processed)
    }
}

/// Spawn the scheduler, the ingestion worker and (optionally) the journal source.
pub fn start(services: Services, journal: Option<JournalSource>) -> DaemonResult<RunningDaemon> {
    let token = CancellationToken::new();
    let (events, receiver) = mpsc::channel(EVENT_QUEUE);

    let evaluator = RuleEvaluator::new(
        RulePolicy::from_config(&services.config),
        Arc::clone(&services.controller),
    );
    let journal = journal
        .map(|source| source.spawn(events.clone(), token.child_token()))
        .transpose()?;

    let scheduler = ExpiryScheduler::new(
        Arc::clone(&services.controller),
        services.config.sweep_interval(),
    )
    .spawn_with_token(&token);
    let ingest = tokio::spawn(ingest(evaluator, receiver, token.child_token()));

    info!(
        threshold = services.config.rules.threshold,
        window_minutes = services.config.rules.time_window_minutes,
        sweep_secs = services.config.blocking.sweep_interval_secs,
        "daemon started"
    );

    Ok(RunningDaemon {
        services,
        token,
        events,
        ingest,
        journal,
        scheduler,
    })
}

/// Wait for Ctrl-C or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "cannot listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("received ctrl-c"),
        () = terminate => info!("received SIGTERM"),
    }
}

/// Run the daemon until a shutdown signal arrives or the journal source dies.
pub async fn run(config: ShieldConfig) -> DaemonResult<()> {
    let journal = JournalSource::from_config(&config.monitoring)?;
    let (services, _) = Services::bootstrap(config).await?;
    let mut daemon = start(services, Some(journal))?;

    let journal_died = tokio::select! {
        () = shutdown_signal() => false,
        () = daemon.journal_stopped() => true,
    };

    daemon.shutdown().await?;
    if journal_died {
        return Err(DaemonError::Journal(
            "journal source stopped unexpectedly".to_string(),
        ));
    }
    Ok(())
}
