// Re-export dependencies used in public interfaces of common types

use std::fmt::Display;
use std::str::FromStr;

use async_trait::async_trait;
pub use serde::{Deserialize, Serialize};
use thiserror::Error;
pub use uuid;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum CodeboxError {
    #[error("Container runtime unavailable: {0}")]
    RuntimeUnavailable(String),

    #[error("Container runtime error: {0}")]
    Runtime(String),

    #[error("Container not found: {0}")]
    ContainerNotFound(String),

    #[error("Command `{command}` failed with exit code {exit_code}")]
    CommandExecutionFailed {
        command: String,
        exit_code: i64,
        output: String,
    },

    #[error("Manifest {0} does not exist")]
    ManifestNotFound(String),

    #[error("Upload could not be processed: {0}")]
    UploadProcessingFailed(String),

    #[error("Archive Error: {0}")]
    Archive(String),

    #[error("Persistence Error: {0}")]
    Persistence(String),

    #[error("Configuration Error: {0}")]
    Config(String),

    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal Error: {0}")]
    Internal(String),
}

// Define the primary Result type for codebox operations
pub type Result<T> = std::result::Result<T, CodeboxError>;

/// Identifier of the entity a container is scoped to, e.g. a learner's answer to a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnerId(Uuid);

impl OwnerId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for OwnerId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for OwnerId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl FromStr for OwnerId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(Self)
    }
}

impl Display for OwnerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Persistence side of the file snapshots.
///
/// The store owns the tar-encoded file state of every owner. Containers are seeded from
/// `load_snapshot` and every flush ends in `save_snapshot`, which doubles as the
/// "files were persisted" notification for the owning application.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Last persisted snapshot of the owner, `None` if there is nothing to restore.
    async fn load_snapshot(&self, owner: &OwnerId) -> Result<Option<Vec<u8>>>;

    async fn save_snapshot(&self, owner: &OwnerId, snapshot: Vec<u8>) -> Result<()>;

    /// Whether the owning entity still exists. Flushed files of unknown owners have
    /// nowhere to go.
    async fn owner_exists(&self, owner: &OwnerId) -> Result<bool>;
}
