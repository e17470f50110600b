//! The long-running supervisor of periodic sync runs.
//!
//! State machine: `starting -> idle <-> syncing; any -> error;
//! any -> stopping -> stopped`. At most one sync run is ever in flight:
//! runs execute inline in the daemon's main loop, and the HTTP trigger is
//! rejected with a conflict unless the daemon is idle. A tick arriving
//! while a run is in flight is dropped, not queued. The error state is
//! non-sticky; the next tick tries again.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use scribe_api::Error;
use scribe_tokio::ShutdownChannel;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::{
    http,
    orchestrator::Orchestrator,
    result::{CurrentSyncStatus, LastSyncSummary, StatusSnapshot, SyncOutcome},
};

/// How long shutdown waits for an in-flight run to finish cooperatively.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum DaemonState {
    Starting,
    Idle,
    Syncing,
    Error,
    Stopping,
    Stopped,
}

impl DaemonState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Idle => "idle",
            Self::Syncing => "syncing",
            Self::Error => "error",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for DaemonState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The sync engine as the daemon sees it. [`Orchestrator`] is the real
/// implementation; tests substitute their own.
#[async_trait]
pub trait SyncRunner: Send + Sync + 'static {
    async fn run(&self, cancel: ShutdownChannel)
        -> Result<SyncOutcome, Error>;

    /// Live progress of the in-flight run, if any.
    fn progress(&self) -> Option<CurrentSyncStatus>;

    /// Whether the installation is ready to sync (credentials on disk).
    fn is_ready(&self) -> bool;
}

#[async_trait]
impl SyncRunner for Orchestrator {
    async fn run(
        &self,
        cancel: ShutdownChannel,
    ) -> Result<SyncOutcome, Error> {
        self.sync(cancel).await
    }

    fn progress(&self) -> Option<CurrentSyncStatus> {
        Orchestrator::progress(self)
    }

    fn is_ready(&self) -> bool {
        Orchestrator::is_ready(self)
    }
}

#[derive(Clone, Debug)]
pub struct DaemonConfig {
    /// Periodic trigger interval.
    pub interval: Duration,
    /// Bind address for the HTTP control plane; `None` disables it.
    pub health_addr: Option<std::net::SocketAddr>,
    /// Run one sync immediately at startup.
    pub initial_sync: bool,
}

/// Mutable status guarded by one lock; snapshots copy fields under it.
pub(crate) struct StatusInner {
    pub state: DaemonState,
    pub error_message: Option<String>,
    pub last_sync_time: Option<DateTime<Utc>>,
    pub next_sync_time: Option<DateTime<Utc>>,
    pub last_sync_result: Option<LastSyncSummary>,
    /// Cancellation handle of the in-flight run.
    pub current_cancel: Option<ShutdownChannel>,
}

/// State shared with the HTTP control plane.
pub(crate) struct ControlShared {
    pub status: Mutex<StatusInner>,
    pub started_at: DateTime<Utc>,
    pub trigger_tx: mpsc::Sender<()>,
    pub runner: Arc<dyn SyncRunner>,
    /// Actual bound address of the control listener, once bound.
    pub bound_addr: Mutex<Option<std::net::SocketAddr>>,
}

impl ControlShared {
    pub fn snapshot(&self) -> StatusSnapshot {
        let status = self.status.lock().expect("status lock poisoned");
        let current_sync = (status.state == DaemonState::Syncing)
            .then(|| self.runner.progress())
            .flatten();
        StatusSnapshot {
            state: status.state.to_string(),
            uptime_seconds: (Utc::now() - self.started_at)
                .num_seconds()
                .max(0) as u64,
            last_sync_time: status.last_sync_time,
            next_sync_time: status.next_sync_time,
            error_message: status.error_message.clone(),
            current_sync,
            last_sync_result: status.last_sync_result.clone(),
        }
    }
}

pub struct Daemon {
    runner: Arc<dyn SyncRunner>,
    config: DaemonConfig,
    shared: Arc<ControlShared>,
    trigger_rx: mpsc::Receiver<()>,
}

impl Daemon {
    pub fn new(runner: Arc<dyn SyncRunner>, config: DaemonConfig) -> Self {
        let (trigger_tx, trigger_rx) = mpsc::channel(1);
        let shared = Arc::new(ControlShared {
            status: Mutex::new(StatusInner {
                state: DaemonState::Starting,
                error_message: None,
                last_sync_time: None,
                next_sync_time: None,
                last_sync_result: None,
                current_cancel: None,
            }),
            started_at: Utc::now(),
            trigger_tx,
            runner: Arc::clone(&runner),
            bound_addr: Mutex::new(None),
        });
        Self {
            runner,
            config,
            shared,
            trigger_rx,
        }
    }

    /// The control listener's bound address, once the daemon is running.
    pub fn bound_addr(&self) -> Option<std::net::SocketAddr> {
        *self.shared.bound_addr.lock().expect("addr lock poisoned")
    }

    pub fn state(&self) -> DaemonState {
        self.shared.status.lock().expect("status lock poisoned").state
    }

    #[cfg(test)]
    pub(crate) fn shared_for_test(&self) -> Arc<ControlShared> {
        Arc::clone(&self.shared)
    }

    /// Run until `shutdown` fires.
    pub async fn run(
        mut self,
        mut shutdown: ShutdownChannel,
    ) -> anyhow::Result<()> {
        info!(
            interval = ?self.config.interval,
            "Daemon starting"
        );

        let server_task = match self.config.health_addr {
            Some(addr) => {
                let listener = tokio::net::TcpListener::bind(addr)
                    .await
                    .with_context(|| {
                        format!("binding control listener on {addr}")
                    })?;
                let bound = listener
                    .local_addr()
                    .context("reading control listener address")?;
                *self
                    .shared
                    .bound_addr
                    .lock()
                    .expect("addr lock poisoned") = Some(bound);
                info!("Control API listening on {bound}");
                Some(http::spawn_control_server(
                    listener,
                    Arc::clone(&self.shared),
                    shutdown.clone(),
                ))
            }
            None => None,
        };

        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(
            tokio::time::MissedTickBehavior::Skip,
        );
        // An interval's first tick completes immediately; the startup sync
        // is governed by `initial_sync` instead.
        ticker.tick().await;

        self.set_state(DaemonState::Idle);
        self.set_next_sync_time();

        if self.config.initial_sync {
            self.run_sync(&mut shutdown).await;
        }

        loop {
            tokio::select! {
                biased;
                () = shutdown.recv() => break,
                _ = ticker.tick() => {
                    self.run_sync(&mut shutdown).await;
                    self.set_next_sync_time();
                }
                Some(()) = self.trigger_rx.recv() => {
                    info!("Sync triggered via control API");
                    self.run_sync(&mut shutdown).await;
                }
            }
        }

        self.set_state(DaemonState::Stopping);
        info!("Daemon stopping");
        if let Some(summary) = self
            .shared
            .status
            .lock()
            .expect("status lock poisoned")
            .last_sync_result
            .as_ref()
        {
            info!(
                success = summary.success_count,
                failed = summary.failure_count,
                "Last sync result at shutdown"
            );
        }
        if let Some(task) = server_task {
            if let Err(e) = task.await {
                warn!("Control server task failed: {e:#}");
            }
        }
        self.set_state(DaemonState::Stopped);
        info!("Daemon stopped");
        Ok(())
    }

    /// Execute one sync run inline, honoring shutdown with a bounded
    /// grace period. Reentry is impossible by construction (single loop),
    /// but the state machine still refuses it.
    async fn run_sync(&self, shutdown: &mut ShutdownChannel) {
        let cancel = ShutdownChannel::new();
        {
            let mut status =
                self.shared.status.lock().expect("status lock poisoned");
            if status.state == DaemonState::Syncing {
                warn!("Refusing reentrant sync");
                return;
            }
            if shutdown.try_recv() {
                return;
            }
            status.state = DaemonState::Syncing;
            status.current_cancel = Some(cancel.clone());
        }

        let sync_fut = self.runner.run(cancel.clone());
        tokio::pin!(sync_fut);

        let result = loop {
            tokio::select! {
                result = &mut sync_fut => break Some(result),
                () = shutdown.recv() => {
                    info!("Shutdown requested; cancelling in-flight sync");
                    cancel.send();
                    match tokio::time::timeout(SHUTDOWN_GRACE, &mut sync_fut)
                        .await
                    {
                        Ok(result) => break Some(result),
                        Err(_) => break None,
                    }
                }
            }
        };

        let mut status =
            self.shared.status.lock().expect("status lock poisoned");
        status.current_cancel = None;
        match result {
            Some(Ok(outcome)) => {
                status.last_sync_time = Some(outcome.ended_at);
                status.last_sync_result = Some(outcome.summary());
                status.error_message = None;
                status.state = DaemonState::Idle;
            }
            Some(Err(e)) => {
                error!("Sync run failed: {e:#}");
                status.error_message = Some(format!("{e:#}"));
                // Non-sticky: the next tick transitions back through here.
                status.state = DaemonState::Error;
            }
            None => {
                error!(
                    "Sync did not finish within the shutdown grace period"
                );
                status.error_message =
                    Some("sync did not stop in time".into());
                status.state = DaemonState::Error;
            }
        }
    }

    fn set_state(&self, state: DaemonState) {
        self.shared
            .status
            .lock()
            .expect("status lock poisoned")
            .state = state;
    }

    fn set_next_sync_time(&self) {
        let next = Utc::now()
            + chrono::Duration::from_std(self.config.interval)
                .unwrap_or_else(|_| chrono::Duration::seconds(0));
        self.shared
            .status
            .lock()
            .expect("status lock poisoned")
            .next_sync_time = Some(next);
    }
}
