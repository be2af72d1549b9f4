//! Container runtime abstraction.
//!
//! Everything the lifecycle manager and the reaper need from a container engine goes
//! through [`ContainerRuntime`]; [`DockerRuntime`] talks to a Docker daemon via bollard.

mod docker;

pub use docker::DockerRuntime;

use async_trait::async_trait;
use codebox_common::CodeboxError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("Container runtime unavailable: {0}")]
    Unavailable(String),
    #[error("No such object: {0}")]
    NotFound(String),
    #[error("Container runtime API error: {0}")]
    Api(String),
}

impl From<RuntimeError> for CodeboxError {
    fn from(err: RuntimeError) -> Self {
        match err {
            RuntimeError::Unavailable(msg) => CodeboxError::RuntimeUnavailable(msg),
            RuntimeError::NotFound(msg) => CodeboxError::ContainerNotFound(msg),
            RuntimeError::Api(msg) => CodeboxError::Runtime(msg),
        }
    }
}

pub type Result<T> = std::result::Result<T, RuntimeError>;

/// What a container listing reports about one container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSummary {
    pub id: String,
    pub labels: HashMap<String, String>,
    pub running: bool,
}

impl ContainerSummary {
    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }
}

/// Label query for [`ContainerRuntime::list_containers`].
///
/// Every condition must hold. A label given without value only has to be present.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelFilter {
    pub labels: Vec<(String, Option<String>)>,
    /// Also return stopped containers
    pub include_stopped: bool,
}

impl LabelFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.push((key.into(), Some(value.into())));
        self
    }

    pub fn with_label_present(mut self, key: impl Into<String>) -> Self {
        self.labels.push((key.into(), None));
        self
    }

    pub fn include_stopped(mut self) -> Self {
        self.include_stopped = true;
        self
    }

    pub fn matches(&self, summary: &ContainerSummary) -> bool {
        if !self.include_stopped && !summary.running {
            return false;
        }
        self.labels.iter().all(|(key, value)| match value {
            Some(value) => summary.label(key) == Some(value.as_str()),
            None => summary.labels.contains_key(key),
        })
    }
}

/// Everything needed to create a long-lived dev container.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContainerSpec {
    pub image: String,
    pub labels: HashMap<String, String>,
    pub memory_bytes: i64,
    pub nano_cpus: i64,
    pub cap_add: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    /// stdout and stderr, interleaved as produced
    pub output: Vec<u8>,
    pub exit_code: i64,
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn list_containers(&self, filter: &LabelFilter) -> Result<Vec<ContainerSummary>>;

    /// `None` if the container does not exist (anymore).
    async fn inspect_container(&self, id: &str) -> Result<Option<ContainerSummary>>;

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String>;

    async fn start_container(&self, id: &str) -> Result<()>;

    async fn stop_container(&self, id: &str, grace: Duration) -> Result<()>;

    /// Removes the container even if it is still running.
    async fn remove_container(&self, id: &str) -> Result<()>;

    async fn exec(&self, id: &str, cmd: &[String], user: &str) -> Result<ExecOutput>;

    /// Unpack a tar archive into `path` inside the container.
    async fn copy_archive_in(&self, id: &str, path: &str, tar: Vec<u8>) -> Result<()>;

    /// Tar archive of `path` inside the container. The contents of a directory are
    /// named `./...` or `<dir>/...` depending on the engine, callers normalize.
    async fn copy_archive_out(&self, id: &str, path: &str) -> Result<Vec<u8>>;

    async fn connect_network(&self, id: &str, network: &str) -> Result<()>;

    async fn image_exists(&self, image: &str) -> Result<bool>;

    async fn pull_image(&self, image: &str) -> Result<()>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PullPolicy {
    Always,
    #[default]
    IfNotPresent,
    Never,
}

impl std::str::FromStr for PullPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "always" => Ok(PullPolicy::Always),
            "if-not-present" | "ifnotpresent" => Ok(PullPolicy::IfNotPresent),
            "never" => Ok(PullPolicy::Never),
            other => Err(format!("unknown pull policy {other:?}")),
        }
    }
}

/// Make sure `image` is available according to `policy`.
pub async fn ensure_image(
    runtime: &dyn ContainerRuntime,
    image: &str,
    policy: PullPolicy,
) -> Result<()> {
    match policy {
        PullPolicy::Always => {
            info!(%image, "Pulling image");
            runtime.pull_image(image).await
        }
        PullPolicy::IfNotPresent => {
            if runtime.image_exists(image).await? {
                return Ok(());
            }
            info!(%image, "Image not present, pulling");
            runtime.pull_image(image).await
        }
        PullPolicy::Never => {
            if !runtime.image_exists(image).await? {
                warn!(%image, "Image is not present and pulling is disabled");
            }
            Ok(())
        }
    }
}
