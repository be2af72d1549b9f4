use super::{
    ContainerRuntime, ContainerSpec, ContainerSummary, ExecOutput, LabelFilter, Result,
    RuntimeError,
};
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, DownloadFromContainerOptions, InspectContainerOptions,
    ListContainersOptions, LogOutput, RemoveContainerOptions, StartContainerOptions,
    StopContainerOptions, UploadToContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::models::{HostConfig, RestartPolicy, RestartPolicyNameEnum};
use bollard::network::ConnectNetworkOptions;
use bollard::Docker;
use futures::{StreamExt, TryStreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument};

/// [`ContainerRuntime`] backed by the Docker Engine API.
#[derive(Clone)]
pub struct DockerRuntime {
    docker: Arc<Docker>,
}

impl DockerRuntime {
    pub fn new(docker: Arc<Docker>) -> Self {
        Self { docker }
    }

    /// Connect through the local socket (or `DOCKER_HOST`).
    pub fn connect_local() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults().map_err(classify)?;
        Ok(Self::new(Arc::new(docker)))
    }

    pub fn docker(&self) -> &Arc<Docker> {
        &self.docker
    }
}

/// Map bollard errors onto the runtime taxonomy. Transport problems mean the engine
/// is unreachable, a 404 means the object is gone.
fn classify(err: BollardError) -> RuntimeError {
    match err {
        BollardError::DockerResponseServerError {
            status_code: 404,
            message,
        } => RuntimeError::NotFound(message),
        e @ (BollardError::IOError { .. }
        | BollardError::RequestTimeoutError
        | BollardError::HyperResponseError { .. }) => RuntimeError::Unavailable(e.to_string()),
        e => RuntimeError::Api(e.to_string()),
    }
}

fn label_filters(filter: &LabelFilter) -> HashMap<String, Vec<String>> {
    let labels = filter
        .labels
        .iter()
        .map(|(key, value)| match value {
            Some(value) => format!("{key}={value}"),
            None => key.clone(),
        })
        .collect();
    let mut filters = HashMap::from([("label".to_string(), labels)]);
    if !filter.include_stopped {
        filters.insert("status".to_string(), vec!["running".to_string()]);
    }
    filters
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn list_containers(&self, filter: &LabelFilter) -> Result<Vec<ContainerSummary>> {
        let options = ListContainersOptions {
            all: filter.include_stopped,
            filters: label_filters(filter),
            ..Default::default()
        };
        let containers = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(classify)?;

        Ok(containers
            .into_iter()
            .filter_map(|c| {
                Some(ContainerSummary {
                    id: c.id?,
                    labels: c.labels.unwrap_or_default(),
                    running: c.state.as_deref() == Some("running"),
                })
            })
            .collect())
    }

    async fn inspect_container(&self, id: &str) -> Result<Option<ContainerSummary>> {
        let response = match self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .map_err(classify)
        {
            Ok(response) => response,
            Err(RuntimeError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };

        Ok(Some(ContainerSummary {
            id: response.id.unwrap_or_else(|| id.to_string()),
            labels: response
                .config
                .and_then(|config| config.labels)
                .unwrap_or_default(),
            running: response
                .state
                .and_then(|state| state.running)
                .unwrap_or(false),
        }))
    }

    #[instrument(skip(self, spec), fields(image = %spec.image))]
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        let config = Config {
            image: Some(spec.image.clone()),
            labels: Some(spec.labels.clone()),
            host_config: Some(HostConfig {
                memory: Some(spec.memory_bytes),
                // same as memory: no swap on top
                memory_swap: Some(spec.memory_bytes),
                nano_cpus: Some(spec.nano_cpus),
                cap_add: Some(spec.cap_add.clone()),
                restart_policy: Some(RestartPolicy {
                    name: Some(RestartPolicyNameEnum::UNLESS_STOPPED),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        };

        let response = self
            .docker
            .create_container(None::<CreateContainerOptions<String>>, config)
            .await
            .map_err(classify)?;
        for warning in &response.warnings {
            debug!(container_id = %response.id, %warning, "Container created with warning");
        }
        Ok(response.id)
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(classify)
    }

    async fn stop_container(&self, id: &str, grace: Duration) -> Result<()> {
        let options = StopContainerOptions {
            t: grace.as_secs() as i64,
        };
        self.docker
            .stop_container(id, Some(options))
            .await
            .map_err(classify)
    }

    async fn remove_container(&self, id: &str) -> Result<()> {
        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };
        self.docker
            .remove_container(id, Some(options))
            .await
            .map_err(classify)
    }

    async fn exec(&self, id: &str, cmd: &[String], user: &str) -> Result<ExecOutput> {
        let options = CreateExecOptions {
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            user: Some(user.to_string()),
            cmd: Some(cmd.to_vec()),
            ..Default::default()
        };
        let exec = self
            .docker
            .create_exec(id, options)
            .await
            .map_err(classify)?;

        let mut output = Vec::new();
        match self.docker.start_exec(&exec.id, None).await.map_err(classify)? {
            StartExecResults::Attached {
                output: mut stream,
                ..
            } => {
                while let Some(chunk) = stream.next().await {
                    match chunk.map_err(classify)? {
                        LogOutput::StdOut { message } | LogOutput::StdErr { message } => {
                            output.extend_from_slice(&message);
                        }
                        _ => {}
                    }
                }
            }
            StartExecResults::Detached => {
                return Err(RuntimeError::Api(format!(
                    "exec {} was started detached",
                    exec.id
                )));
            }
        }

        let inspected = self.docker.inspect_exec(&exec.id).await.map_err(classify)?;
        Ok(ExecOutput {
            output,
            exit_code: inspected.exit_code.unwrap_or(-1),
        })
    }

    async fn copy_archive_in(&self, id: &str, path: &str, tar: Vec<u8>) -> Result<()> {
        let options = UploadToContainerOptions {
            path: path.to_string(),
            ..Default::default()
        };
        self.docker
            .upload_to_container(id, Some(options), tar.into())
            .await
            .map_err(classify)
    }

    async fn copy_archive_out(&self, id: &str, path: &str) -> Result<Vec<u8>> {
        // trailing "/." makes the engine archive the directory contents as "./..."
        let source = format!("{}/.", path.trim_end_matches('/'));
        let options = DownloadFromContainerOptions { path: source };
        let chunks: Vec<_> = self
            .docker
            .download_from_container(id, Some(options))
            .try_collect()
            .await
            .map_err(classify)?;
        Ok(chunks.concat())
    }

    async fn connect_network(&self, id: &str, network: &str) -> Result<()> {
        let options = ConnectNetworkOptions {
            container: id.to_string(),
            ..Default::default()
        };
        self.docker
            .connect_network(network, options)
            .await
            .map_err(classify)
    }

    async fn image_exists(&self, image: &str) -> Result<bool> {
        match self.docker.inspect_image(image).await.map_err(classify) {
            Ok(_) => Ok(true),
            Err(RuntimeError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        let options = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };
        let progress: Vec<_> = self
            .docker
            .create_image(Some(options), None, None)
            .try_collect()
            .await
            .map_err(classify)?;
        debug!(%image, updates = progress.len(), "Image pulled");
        Ok(())
    }
}
