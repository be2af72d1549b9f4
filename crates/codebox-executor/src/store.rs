use async_trait::async_trait;
use codebox_common::{CodeboxError, OwnerId, Result, SnapshotStore};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::debug;

const SNAPSHOT_FILE: &str = "snapshot.tar";

/// Snapshots as plain files, `<root>/<owner>/snapshot.tar`.
///
/// An owner is known once its directory exists, either through
/// [`FsSnapshotStore::register_owner`] or the first save.
#[derive(Debug, Clone)]
pub struct FsSnapshotStore {
    root: PathBuf,
}

impl FsSnapshotStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub async fn register_owner(&self, owner: &OwnerId) -> Result<()> {
        tokio::fs::create_dir_all(self.owner_dir(owner))
            .await
            .map_err(persistence)
    }

    fn owner_dir(&self, owner: &OwnerId) -> PathBuf {
        self.root.join(owner.to_string())
    }

    fn snapshot_path(&self, owner: &OwnerId) -> PathBuf {
        self.owner_dir(owner).join(SNAPSHOT_FILE)
    }
}

fn persistence(err: std::io::Error) -> CodeboxError {
    CodeboxError::Persistence(err.to_string())
}

#[async_trait]
impl SnapshotStore for FsSnapshotStore {
    async fn load_snapshot(&self, owner: &OwnerId) -> Result<Option<Vec<u8>>> {
        match tokio::fs::read(self.snapshot_path(owner)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(persistence(e)),
        }
    }

    async fn save_snapshot(&self, owner: &OwnerId, snapshot: Vec<u8>) -> Result<()> {
        self.register_owner(owner).await?;
        let path = self.snapshot_path(owner);
        // readers never see a partially written snapshot
        let partial = path.with_extension("tar.partial");
        tokio::fs::write(&partial, &snapshot)
            .await
            .map_err(persistence)?;
        tokio::fs::rename(&partial, &path)
            .await
            .map_err(persistence)?;
        debug!(%owner, bytes = snapshot.len(), "Snapshot saved");
        Ok(())
    }

    async fn owner_exists(&self, owner: &OwnerId) -> Result<bool> {
        match tokio::fs::metadata(self.owner_dir(owner)).await {
            Ok(metadata) => Ok(metadata.is_dir()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(persistence(e)),
        }
    }
}
