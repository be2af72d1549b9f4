//! Idle container reaper.
//!
//! A single task sweeps all labeled containers of this installation on a fixed
//! period. Containers that stayed idle for the configured threshold get their files
//! flushed into the snapshot store and are removed afterwards. A container is never
//! removed when its files could not be persisted; it is simply tried again on the
//! next sweep.

use crate::config::ReaperConfig;
use crate::lifecycle::{LifecycleManager, LABEL_OWNER_ID};
use crate::runtime::ContainerSummary;
use async_trait::async_trait;
use codebox_common::{OwnerId, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Container id to the instant it was first seen idle
pub type IdleMap = HashMap<String, Instant>;

/// Decides whether someone is still using a container.
#[async_trait]
pub trait IdleProbe: Send + Sync {
    /// Must answer `true` when in doubt.
    async fn is_busy(&self, container_id: &str) -> bool;
}

/// Counts open IDE connections with a script shipped in the image.
pub struct ConnectionProbe {
    manager: Arc<LifecycleManager>,
    command: Vec<String>,
}

impl ConnectionProbe {
    pub fn new(manager: Arc<LifecycleManager>, command: Vec<String>) -> Self {
        Self { manager, command }
    }
}

#[async_trait]
impl IdleProbe for ConnectionProbe {
    async fn is_busy(&self, container_id: &str) -> bool {
        match self
            .manager
            .exec_in_container(container_id, &self.command, true)
            .await
        {
            Ok(output) => String::from_utf8_lossy(&output).trim() != "0",
            Err(e) => {
                warn!(%container_id, error = %e, "Connection probe failed, treating container as busy");
                true
            }
        }
    }
}

/// What a single sweep did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub inspected: usize,
    pub busy: usize,
    /// Idle, but below the threshold
    pub idle: usize,
    /// Flushed and removed
    pub reaped: Vec<String>,
    /// Removed without flush because the owner is gone
    pub discarded: Vec<String>,
    /// Reaping failed, retried next sweep
    pub failed: Vec<String>,
    pub cancelled: bool,
}

pub struct IdleReaper {
    manager: Arc<LifecycleManager>,
    probe: Arc<dyn IdleProbe>,
    config: ReaperConfig,
}

impl IdleReaper {
    pub fn new(
        manager: Arc<LifecycleManager>,
        probe: Arc<dyn IdleProbe>,
        config: ReaperConfig,
    ) -> Self {
        Self {
            manager,
            probe,
            config,
        }
    }

    /// Reaper using the [`ConnectionProbe`] with the configured command.
    pub fn with_connection_probe(manager: Arc<LifecycleManager>, config: ReaperConfig) -> Self {
        let probe = Arc::new(ConnectionProbe::new(
            manager.clone(),
            config.probe_command.clone(),
        ));
        Self::new(manager, probe, config)
    }

    /// Run one sweep over all running containers.
    ///
    /// `previous` is the map returned by the last sweep; the returned map replaces it
    /// entirely, so entries of busy or vanished containers are dropped. Cancellation
    /// is honoured between containers only.
    pub async fn sweep(
        &self,
        previous: IdleMap,
        cancel: &CancellationToken,
    ) -> (IdleMap, SweepReport) {
        let mut report = SweepReport::default();
        let filter = self
            .manager
            .instance_filter()
            .with_label_present(LABEL_OWNER_ID);
        let containers = match self.manager.runtime().list_containers(&filter).await {
            Ok(containers) => containers,
            Err(e) => {
                error!(error = %e, "Failed to list containers, skipping sweep");
                return (previous, report);
            }
        };

        let now = Instant::now();
        let threshold = self.config.idle_threshold();
        let mut next = IdleMap::new();
        for container in containers {
            if cancel.is_cancelled() {
                // keep what we knew about the containers not looked at
                if let Some(since) = previous.get(&container.id) {
                    next.insert(container.id.clone(), *since);
                }
                report.cancelled = true;
                continue;
            }
            report.inspected += 1;

            if self.probe.is_busy(&container.id).await {
                report.busy += 1;
                continue;
            }

            let since = previous.get(&container.id).copied().unwrap_or(now);
            let idle_for = now.saturating_duration_since(since);
            debug!(container_id = %container.id, ?idle_for, "Container is idle");
            if idle_for < threshold {
                report.idle += 1;
                next.insert(container.id, since);
                continue;
            }

            let outcome = self.reap(&container).await;
            match outcome {
                Ok(Reaped::Flushed) => report.reaped.push(container.id),
                Ok(Reaped::Discarded) => report.discarded.push(container.id),
                Ok(Reaped::Gone) => {}
                Err(e) => {
                    error!(container_id = %container.id, error = %e, "Failed to reap idle container, retrying next sweep");
                    next.insert(container.id.clone(), since);
                    report.failed.push(container.id);
                }
            }
        }
        (next, report)
    }

    async fn reap(&self, container: &ContainerSummary) -> Result<Reaped> {
        let owner_label = container.label(LABEL_OWNER_ID).unwrap_or_default();
        let owner = owner_label.parse::<OwnerId>().ok();
        let known = match &owner {
            Some(owner) => self.manager.store().owner_exists(owner).await?,
            None => false,
        };
        let Some(owner) = owner.filter(|_| known) else {
            warn!(container_id = %container.id, owner = %owner_label, "Owner not found, removing container without saving files");
            self.manager.stop_and_remove(&container.id).await?;
            return Ok(Reaped::Discarded);
        };

        let _guard = self.manager.lock_owner(&owner).await;
        // it may have been stopped or removed while we waited for the lock
        match self.manager.runtime().inspect_container(&container.id).await? {
            Some(current) if current.running => {}
            _ => {
                debug!(container_id = %container.id, %owner, "Container went away before it was reaped");
                return Ok(Reaped::Gone);
            }
        }
        let files = self.manager.flush_files(&owner).await?;
        self.manager.store().save_snapshot(&owner, files).await?;
        info!(container_id = %container.id, %owner, "Shutting down idle container");
        self.manager.stop_and_remove(&container.id).await?;
        Ok(Reaped::Flushed)
    }

    /// Sweep every check period until `cancel` fires. The first sweep happens one
    /// period after the start.
    pub async fn run(&self, cancel: CancellationToken) {
        let period = self.config.check_period();
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(?period, threshold = ?self.config.idle_threshold(), "Idle reaper started");

        let mut idle = IdleMap::new();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let (next, report) = self.sweep(std::mem::take(&mut idle), &cancel).await;
            idle = next;
            debug!(?report, tracked = idle.len(), "Sweep finished");
            if report.cancelled {
                break;
            }
        }
        info!("Idle reaper stopped");
    }

    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(cancel).await })
    }
}

enum Reaped {
    Flushed,
    Discarded,
    /// No longer running once the owner lock was held
    Gone,
}
