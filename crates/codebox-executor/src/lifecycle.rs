//! Per-owner dev container lifecycle.
//!
//! Containers are never tracked in memory: every operation asks the runtime for the
//! container labeled with the owner id and this installation's instance id. The
//! only state kept is a map of per-owner locks, so two concurrent
//! [`LifecycleManager::ensure_running`] calls for one owner never create two
//! containers.

use crate::archive;
use crate::config::LifecycleConfig;
use crate::runtime::{self, ContainerRuntime, ContainerSpec, ContainerSummary, LabelFilter};
use codebox_common::{CodeboxError, OwnerId, Result, SnapshotStore};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, error, info, instrument, warn};

pub const LABEL_OWNER_ID: &str = "org.codebox.owner-id";
pub const LABEL_INSTANCE_ID: &str = "org.codebox.instance-id";

/// Port the IDE listens on inside the container
pub const IDE_PORT: u16 = 3000;

/// Result of [`LifecycleManager::ensure_running`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerHandle {
    pub container_id: String,
    pub owner: OwnerId,
    pub url: String,
    /// Whether this call created (and prepared) the container
    pub created: bool,
}

pub struct LifecycleManager {
    runtime: Arc<dyn ContainerRuntime>,
    store: Arc<dyn SnapshotStore>,
    config: LifecycleConfig,
    owner_locks: DashMap<OwnerId, Arc<Mutex<()>>>,
}

/// Holds the lock of one owner. Dropping it releases the lock and forgets the entry
/// when nobody else is waiting for it.
pub struct OwnerGuard<'a> {
    manager: &'a LifecycleManager,
    owner: OwnerId,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for OwnerGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        // the map holds one reference, a waiter would hold another
        self.manager
            .owner_locks
            .remove_if(&self.owner, |_, lock| Arc::strong_count(lock) == 1);
    }
}

impl LifecycleManager {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        store: Arc<dyn SnapshotStore>,
        config: LifecycleConfig,
    ) -> Self {
        Self {
            runtime,
            store,
            config,
            owner_locks: DashMap::new(),
        }
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    pub fn runtime(&self) -> &Arc<dyn ContainerRuntime> {
        &self.runtime
    }

    pub fn store(&self) -> &Arc<dyn SnapshotStore> {
        &self.store
    }

    /// Serialize lifecycle work for one owner. Not reentrant.
    pub async fn lock_owner(&self, owner: &OwnerId) -> OwnerGuard<'_> {
        let lock = self
            .owner_locks
            .entry(*owner)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let guard = lock.lock_owned().await;
        OwnerGuard {
            manager: self,
            owner: *owner,
            guard: Some(guard),
        }
    }

    /// Number of owners with a live lock entry
    pub fn tracked_owners(&self) -> usize {
        self.owner_locks.len()
    }

    /// Pull the configured image according to the pull policy.
    pub async fn ensure_images(&self) -> Result<()> {
        runtime::ensure_image(
            self.runtime.as_ref(),
            &self.config.image,
            self.config.pull_policy,
        )
        .await
        .map_err(CodeboxError::from)
    }

    /// Running containers of this installation.
    pub fn instance_filter(&self) -> LabelFilter {
        LabelFilter::new().with_label(LABEL_INSTANCE_ID, self.config.instance_id.as_str())
    }

    /// The owner's container, stopped or running.
    pub async fn find_container(&self, owner: &OwnerId) -> Result<Option<ContainerSummary>> {
        let filter = self
            .instance_filter()
            .with_label(LABEL_OWNER_ID, owner.to_string())
            .include_stopped();
        let mut containers = self.runtime.list_containers(&filter).await?;
        if containers.len() > 1 {
            warn!(%owner, count = containers.len(), "Owner has more than one container");
            // prefer a running one
            containers.sort_by_key(|c| !c.running);
        }
        Ok(containers.into_iter().next())
    }

    async fn find_running_container(&self, owner: &OwnerId) -> Result<String> {
        match self.find_container(owner).await? {
            Some(container) if container.running => Ok(container.id),
            _ => Err(CodeboxError::ContainerNotFound(format!(
                "no running container for owner {owner}"
            ))),
        }
    }

    /// Make sure the owner has a running container and return how to reach it.
    ///
    /// A new container is seeded with the owner's last snapshot before it is handed
    /// out. A stopped one is only started again, its files are still in place.
    #[instrument(skip(self), fields(%owner))]
    pub async fn ensure_running(&self, owner: &OwnerId) -> Result<ContainerHandle> {
        let _guard = self.lock_owner(owner).await;

        let (container_id, created) = match self.find_container(owner).await? {
            Some(container) if container.running => {
                debug!(container_id = %container.id, "Container already running");
                (container.id, false)
            }
            Some(container) => {
                info!(container_id = %container.id, "Starting stopped container");
                self.runtime.start_container(&container.id).await?;
                (container.id, false)
            }
            None => {
                let container_id = self.create_container(owner).await?;
                if let Err(e) = self.start_and_prepare(&container_id, owner).await {
                    // a half prepared container must never be found again
                    self.discard_container(&container_id).await;
                    return Err(e);
                }
                info!(%container_id, "Container created and prepared");
                (container_id, true)
            }
        };

        Ok(ContainerHandle {
            container_id,
            owner: *owner,
            url: self.access_url(owner),
            created,
        })
    }

    async fn create_container(&self, owner: &OwnerId) -> Result<String> {
        let spec = ContainerSpec {
            image: self.config.image.clone(),
            labels: self.container_labels(owner),
            memory_bytes: self.config.memory_bytes,
            nano_cpus: self.config.nano_cpus(),
            // lsof inside the connection probe needs it
            cap_add: vec!["SYS_PTRACE".to_string()],
        };
        Ok(self.runtime.create_container(&spec).await?)
    }

    async fn start_and_prepare(&self, container_id: &str, owner: &OwnerId) -> Result<()> {
        if let Some(network) = &self.config.network {
            self.runtime.connect_network(container_id, network).await?;
        }
        self.runtime.start_container(container_id).await?;
        self.prepare_container(container_id, owner).await
    }

    /// Best effort removal of a container that failed preparation.
    async fn discard_container(&self, container_id: &str) {
        match self.runtime.remove_container(container_id).await {
            Ok(()) => warn!(%container_id, "Removed container after failed preparation"),
            Err(e) => {
                error!(%container_id, error = %e, "Failed to remove container after failed preparation")
            }
        }
    }

    /// Identity labels plus the routing labels the reverse proxy picks up.
    pub fn container_labels(&self, owner: &OwnerId) -> HashMap<String, String> {
        HashMap::from([
            (LABEL_INSTANCE_ID.to_string(), self.config.instance_id.clone()),
            (LABEL_OWNER_ID.to_string(), owner.to_string()),
            ("traefik.enable".to_string(), "true".to_string()),
            (
                "traefik.frontend.rule".to_string(),
                format!("PathPrefixStrip: /ide/{owner}/"),
            ),
            ("traefik.port".to_string(), IDE_PORT.to_string()),
            (
                "traefik.frontend.headers.customResponseHeaders".to_string(),
                "Access-Control-Allow-Origin:*".to_string(),
            ),
        ])
    }

    async fn prepare_container(&self, container_id: &str, owner: &OwnerId) -> Result<()> {
        self.copy_snapshot_in(container_id, owner).await?;
        let user = &self.config.container_user;
        self.exec_in_container(
            container_id,
            &[
                "chown".to_string(),
                "-R".to_string(),
                format!("{user}:{user}"),
                self.config.project_path.clone(),
            ],
            true,
        )
        .await?;
        Ok(())
    }

    async fn copy_snapshot_in(&self, container_id: &str, owner: &OwnerId) -> Result<bool> {
        let Some(snapshot) = self.store.load_snapshot(owner).await? else {
            debug!(%container_id, "No snapshot to restore");
            return Ok(false);
        };
        debug!(%container_id, bytes = snapshot.len(), "Copying snapshot into container");
        self.runtime
            .copy_archive_in(container_id, &self.config.project_path, snapshot)
            .await?;
        Ok(true)
    }

    /// Run `cmd` as root. Returns stdout and stderr combined.
    #[instrument(skip(self), fields(%container_id))]
    pub async fn exec_in_container(
        &self,
        container_id: &str,
        cmd: &[String],
        fail_on_non_zero: bool,
    ) -> Result<Vec<u8>> {
        let result = self.runtime.exec(container_id, cmd, "root").await?;
        if fail_on_non_zero && result.exit_code != 0 {
            let output = String::from_utf8_lossy(&result.output).into_owned();
            warn!(exit_code = result.exit_code, %output, "Command failed");
            return Err(CodeboxError::CommandExecutionFailed {
                command: cmd.join(" "),
                exit_code: result.exit_code,
                output,
            });
        }
        Ok(result.output)
    }

    /// Copy the project directory out of the owner's running container as a
    /// normalized tar. Does not take the owner lock.
    #[instrument(skip(self), fields(%owner))]
    pub async fn flush_files(&self, owner: &OwnerId) -> Result<Vec<u8>> {
        let container_id = self.find_running_container(owner).await?;
        let raw = self
            .runtime
            .copy_archive_out(&container_id, &self.config.project_path)
            .await?;
        let tar = tokio::task::spawn_blocking(move || {
            archive::normalize_tar(std::io::Cursor::new(raw), Vec::new())
        })
        .await
        .map_err(|e| CodeboxError::Internal(format!("flush task failed: {e}")))??;
        info!(%container_id, bytes = tar.len(), "Flushed container files");
        Ok(tar)
    }

    /// Flush and hand the files to the snapshot store.
    pub async fn save_files(&self, owner: &OwnerId) -> Result<()> {
        let _guard = self.lock_owner(owner).await;
        let tar = self.flush_files(owner).await?;
        self.store.save_snapshot(owner, tar).await
    }

    /// Re-seed the owner's running container from the stored snapshot, e.g. after
    /// the files were replaced through an upload. No-op without a running container.
    #[instrument(skip(self), fields(%owner))]
    pub async fn restore_files(&self, owner: &OwnerId) -> Result<bool> {
        let _guard = self.lock_owner(owner).await;
        let container_id = match self.find_running_container(owner).await {
            Ok(id) => id,
            Err(CodeboxError::ContainerNotFound(_)) => return Ok(false),
            Err(e) => return Err(e),
        };
        self.prepare_container(&container_id, owner).await?;
        Ok(true)
    }

    pub fn access_url(&self, owner: &OwnerId) -> String {
        format!(
            "{}/ide/{owner}/",
            self.config.proxy_base_url.trim_end_matches('/')
        )
    }

    /// Stop and remove a container. Anything not flushed before is lost.
    #[instrument(skip(self))]
    pub async fn stop_and_remove(&self, container_id: &str) -> Result<()> {
        self.runtime
            .stop_container(container_id, self.config.stop_grace())
            .await?;
        self.runtime.remove_container(container_id).await?;
        info!("Container removed");
        Ok(())
    }
}
