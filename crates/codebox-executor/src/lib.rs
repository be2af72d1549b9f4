//! Dev container lifecycle management and tar based file transfer.

// Re-export dependencies potentially needed by consumers (like the binary)
pub use bollard;
pub use codebox_common as common;

pub mod archive;
pub mod config;
pub mod lifecycle;
pub mod reaper;
pub mod runtime;
pub mod store;

pub use config::{CodeboxConfig, LifecycleConfig, ReaperConfig};
pub use lifecycle::{ContainerHandle, LifecycleManager, LABEL_INSTANCE_ID, LABEL_OWNER_ID};
pub use reaper::{ConnectionProbe, IdleMap, IdleProbe, IdleReaper, SweepReport};
pub use runtime::{ContainerRuntime, DockerRuntime, PullPolicy};
pub use store::FsSnapshotStore;
