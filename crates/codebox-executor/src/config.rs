//! Runtime configuration.
//!
//! Either read from a YAML file or assembled from `CODEBOX_*` environment
//! variables. Anything not given falls back to the defaults.

use crate::runtime::PullPolicy;
use codebox_common::{CodeboxError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CodeboxConfig {
    pub lifecycle: LifecycleConfig,
    pub reaper: ReaperConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// Image every dev container is created from
    pub image: String,
    pub pull_policy: PullPolicy,
    /// Memory cap per container. Swap is capped to the same value, i.e. disabled.
    pub memory_bytes: i64,
    pub cpus: f64,
    /// Network the reverse proxy can reach containers on
    pub network: Option<String>,
    /// Distinguishes containers of several installations sharing one engine
    pub instance_id: String,
    pub proxy_base_url: String,
    pub project_path: String,
    pub container_user: String,
    pub stop_grace_ms: u64,
    pub snapshot_dir: PathBuf,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            image: "codebox/ide:latest".to_string(),
            pull_policy: PullPolicy::IfNotPresent,
            memory_bytes: 2 * 1024 * 1024 * 1024,
            cpus: 1.0,
            network: None,
            instance_id: "default".to_string(),
            proxy_base_url: "http://localhost:8081".to_string(),
            project_path: "/home/coder/project".to_string(),
            container_user: "coder".to_string(),
            stop_grace_ms: 5_000,
            snapshot_dir: PathBuf::from("./data/snapshots"),
        }
    }
}

impl LifecycleConfig {
    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    /// CPU share in the engine's unit of 10^-9 CPUs
    pub fn nano_cpus(&self) -> i64 {
        (self.cpus * 1_000_000_000.0).round() as i64
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaperConfig {
    pub check_period_ms: u64,
    pub idle_threshold_ms: u64,
    /// Prints the number of open connections to the IDE
    pub probe_command: Vec<String>,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            check_period_ms: 60_000,
            idle_threshold_ms: 10 * 60_000,
            probe_command: vec!["/opt/codebox/num-active-connections.sh".to_string()],
        }
    }
}

impl ReaperConfig {
    pub fn check_period(&self) -> Duration {
        Duration::from_millis(self.check_period_ms)
    }

    pub fn idle_threshold(&self) -> Duration {
        Duration::from_millis(self.idle_threshold_ms)
    }
}

impl CodeboxConfig {
    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
            .map_err(|e| CodeboxError::Config(format!("{}: {e}", path.display())))
    }

    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let config: Self =
            serde_yaml::from_str(content).map_err(|e| CodeboxError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overridden by whichever `CODEBOX_*` variables are set.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        let lifecycle = &mut config.lifecycle;
        let reaper = &mut config.reaper;

        if let Some(v) = env_string("CODEBOX_IMAGE") {
            lifecycle.image = v;
        }
        if let Some(v) = env_parse("CODEBOX_PULL_POLICY")? {
            lifecycle.pull_policy = v;
        }
        if let Some(v) = env_parse("CODEBOX_MEMORY_BYTES")? {
            lifecycle.memory_bytes = v;
        }
        if let Some(v) = env_parse("CODEBOX_CPUS")? {
            lifecycle.cpus = v;
        }
        if let Some(v) = env_string("CODEBOX_NETWORK") {
            lifecycle.network = Some(v);
        }
        if let Some(v) = env_string("CODEBOX_INSTANCE_ID") {
            lifecycle.instance_id = v;
        }
        if let Some(v) = env_string("CODEBOX_PROXY_URL") {
            lifecycle.proxy_base_url = v;
        }
        if let Some(v) = env_string("CODEBOX_PROJECT_PATH") {
            lifecycle.project_path = v;
        }
        if let Some(v) = env_string("CODEBOX_USER") {
            lifecycle.container_user = v;
        }
        if let Some(v) = env_parse("CODEBOX_STOP_GRACE_MS")? {
            lifecycle.stop_grace_ms = v;
        }
        if let Some(v) = env_string("CODEBOX_SNAPSHOT_DIR") {
            lifecycle.snapshot_dir = PathBuf::from(v);
        }
        if let Some(v) = env_parse("CODEBOX_IDLE_CHECK_MS")? {
            reaper.check_period_ms = v;
        }
        if let Some(v) = env_parse("CODEBOX_IDLE_THRESHOLD_MS")? {
            reaper.idle_threshold_ms = v;
        }
        if let Some(v) = env_string("CODEBOX_PROBE_COMMAND") {
            reaper.probe_command = shell_words::split(&v)
                .map_err(|e| CodeboxError::Config(format!("CODEBOX_PROBE_COMMAND={v:?}: {e}")))?;
        }

        config.validate()?;
        debug!(?config, "Configuration resolved from environment");
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.lifecycle.image.trim().is_empty() {
            return Err(CodeboxError::Config("image must not be empty".to_string()));
        }
        if self.lifecycle.memory_bytes <= 0 {
            return Err(CodeboxError::Config("memory_bytes must be positive".to_string()));
        }
        if !(self.lifecycle.cpus > 0.0) {
            return Err(CodeboxError::Config("cpus must be positive".to_string()));
        }
        if self.reaper.check_period_ms == 0 {
            return Err(CodeboxError::Config("check_period_ms must be positive".to_string()));
        }
        if self.reaper.probe_command.is_empty() {
            return Err(CodeboxError::Config("probe_command must not be empty".to_string()));
        }
        Ok(())
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_parse<T>(key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    env_string(key)
        .map(|raw| {
            raw.parse()
                .map_err(|e| CodeboxError::Config(format!("{key}={raw:?}: {e}")))
        })
        .transpose()
}
