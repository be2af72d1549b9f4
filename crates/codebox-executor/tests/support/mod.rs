//! In-memory doubles shared by the integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use codebox_common::{CodeboxError, OwnerId, SnapshotStore};
use codebox_executor::config::LifecycleConfig;
use codebox_executor::lifecycle::LifecycleManager;
use codebox_executor::reaper::IdleProbe;
use codebox_executor::runtime::{
    ContainerRuntime, ContainerSpec, ContainerSummary, ExecOutput, LabelFilter, Result,
    RuntimeError,
};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

#[derive(Debug, Clone)]
pub struct MockContainer {
    pub spec: ContainerSpec,
    pub running: bool,
    pub networks: Vec<String>,
    /// Tar of the project directory
    pub files: Option<Vec<u8>>,
}

#[derive(Debug, Default)]
pub struct RuntimeState {
    pub containers: HashMap<String, MockContainer>,
    pub next_id: usize,
    pub created: usize,
    pub started: usize,
    pub removed: Vec<String>,
    pub execs: Vec<(String, Vec<String>, String)>,
    pub copied_in: Vec<(String, String)>,
    /// Keyed by the command joined with spaces
    pub exec_responses: HashMap<String, ExecOutput>,
    pub fail_copy_in: bool,
    pub fail_copy_out: bool,
    pub fail_stop: bool,
    pub fail_list: bool,
}

/// Container engine double. Every call yields once so concurrent callers interleave.
#[derive(Clone, Default)]
pub struct MockRuntime {
    pub state: Arc<Mutex<RuntimeState>>,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn created(&self) -> usize {
        self.state.lock().await.created
    }

    pub async fn live_containers(&self) -> usize {
        self.state.lock().await.containers.len()
    }

    pub async fn is_running(&self, id: &str) -> bool {
        self.state
            .lock()
            .await
            .containers
            .get(id)
            .is_some_and(|c| c.running)
    }

    pub async fn set_exec_response(&self, cmd: &str, output: &str, exit_code: i64) {
        self.state.lock().await.exec_responses.insert(
            cmd.to_string(),
            ExecOutput {
                output: output.as_bytes().to_vec(),
                exit_code,
            },
        );
    }

    pub async fn set_files(&self, id: &str, tar: Vec<u8>) {
        if let Some(container) = self.state.lock().await.containers.get_mut(id) {
            container.files = Some(tar);
        }
    }

    pub async fn stop(&self, id: &str) {
        if let Some(container) = self.state.lock().await.containers.get_mut(id) {
            container.running = false;
        }
    }

    /// Add a container that was not created through the manager.
    pub async fn insert_container(&self, labels: &[(&str, &str)], running: bool) -> String {
        let mut state = self.state.lock().await;
        state.next_id += 1;
        let id = format!("container-{}", state.next_id);
        state.containers.insert(
            id.clone(),
            MockContainer {
                spec: ContainerSpec {
                    labels: labels
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                    ..Default::default()
                },
                running,
                networks: Vec::new(),
                files: None,
            },
        );
        id
    }

    pub async fn update<F: FnOnce(&mut RuntimeState)>(&self, f: F) {
        f(&mut *self.state.lock().await);
    }

    fn summary(id: &str, container: &MockContainer) -> ContainerSummary {
        ContainerSummary {
            id: id.to_string(),
            labels: container.spec.labels.clone(),
            running: container.running,
        }
    }
}

fn missing(id: &str) -> RuntimeError {
    RuntimeError::NotFound(format!("No such container: {id}"))
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn list_containers(&self, filter: &LabelFilter) -> Result<Vec<ContainerSummary>> {
        tokio::task::yield_now().await;
        let state = self.state.lock().await;
        if state.fail_list {
            return Err(RuntimeError::Unavailable("connection refused".to_string()));
        }
        let mut containers: Vec<_> = state
            .containers
            .iter()
            .map(|(id, c)| Self::summary(id, c))
            .filter(|c| filter.matches(c))
            .collect();
        containers.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(containers)
    }

    async fn inspect_container(&self, id: &str) -> Result<Option<ContainerSummary>> {
        tokio::task::yield_now().await;
        let state = self.state.lock().await;
        Ok(state.containers.get(id).map(|c| Self::summary(id, c)))
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        tokio::task::yield_now().await;
        let mut state = self.state.lock().await;
        state.next_id += 1;
        state.created += 1;
        let id = format!("container-{}", state.next_id);
        state.containers.insert(
            id.clone(),
            MockContainer {
                spec: spec.clone(),
                running: false,
                networks: Vec::new(),
                files: None,
            },
        );
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        tokio::task::yield_now().await;
        let mut state = self.state.lock().await;
        state.started += 1;
        let container = state.containers.get_mut(id).ok_or_else(|| missing(id))?;
        container.running = true;
        Ok(())
    }

    async fn stop_container(&self, id: &str, _grace: Duration) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.fail_stop {
            return Err(RuntimeError::Api("stop failed".to_string()));
        }
        let container = state.containers.get_mut(id).ok_or_else(|| missing(id))?;
        container.running = false;
        Ok(())
    }

    async fn remove_container(&self, id: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state.containers.remove(id).ok_or_else(|| missing(id))?;
        state.removed.push(id.to_string());
        Ok(())
    }

    async fn exec(&self, id: &str, cmd: &[String], user: &str) -> Result<ExecOutput> {
        tokio::task::yield_now().await;
        let mut state = self.state.lock().await;
        if !state.containers.get(id).is_some_and(|c| c.running) {
            return Err(RuntimeError::Api(format!("Container {id} is not running")));
        }
        state
            .execs
            .push((id.to_string(), cmd.to_vec(), user.to_string()));
        Ok(state
            .exec_responses
            .get(&cmd.join(" "))
            .cloned()
            .unwrap_or_default())
    }

    async fn copy_archive_in(&self, id: &str, path: &str, tar: Vec<u8>) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.fail_copy_in {
            return Err(RuntimeError::Api("copy failed".to_string()));
        }
        let container = state.containers.get_mut(id).ok_or_else(|| missing(id))?;
        container.files = Some(tar);
        state.copied_in.push((id.to_string(), path.to_string()));
        Ok(())
    }

    async fn copy_archive_out(&self, id: &str, _path: &str) -> Result<Vec<u8>> {
        let state = self.state.lock().await;
        if state.fail_copy_out {
            return Err(RuntimeError::Api("copy failed".to_string()));
        }
        let container = state.containers.get(id).ok_or_else(|| missing(id))?;
        Ok(container.files.clone().unwrap_or_else(empty_tar))
    }

    async fn connect_network(&self, id: &str, network: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        let container = state.containers.get_mut(id).ok_or_else(|| missing(id))?;
        container.networks.push(network.to_string());
        Ok(())
    }

    async fn image_exists(&self, _image: &str) -> Result<bool> {
        Ok(true)
    }

    async fn pull_image(&self, _image: &str) -> Result<()> {
        Ok(())
    }
}

/// Snapshot store keeping everything in memory.
#[derive(Clone, Default)]
pub struct MemoryStore {
    pub owners: Arc<Mutex<HashSet<OwnerId>>>,
    pub snapshots: Arc<Mutex<HashMap<OwnerId, Vec<u8>>>>,
    pub saves: Arc<Mutex<usize>>,
    pub fail_save: Arc<Mutex<bool>>,
}

impl MemoryStore {
    pub async fn add_owner(&self, owner: OwnerId) {
        self.owners.lock().await.insert(owner);
    }

    pub async fn put_snapshot(&self, owner: OwnerId, tar: Vec<u8>) {
        self.add_owner(owner).await;
        self.snapshots.lock().await.insert(owner, tar);
    }

    pub async fn snapshot(&self, owner: &OwnerId) -> Option<Vec<u8>> {
        self.snapshots.lock().await.get(owner).cloned()
    }

    pub async fn saves(&self) -> usize {
        *self.saves.lock().await
    }
}

#[async_trait]
impl SnapshotStore for MemoryStore {
    async fn load_snapshot(&self, owner: &OwnerId) -> codebox_common::Result<Option<Vec<u8>>> {
        Ok(self.snapshots.lock().await.get(owner).cloned())
    }

    async fn save_snapshot(&self, owner: &OwnerId, snapshot: Vec<u8>) -> codebox_common::Result<()> {
        if *self.fail_save.lock().await {
            return Err(CodeboxError::Persistence("disk full".to_string()));
        }
        self.snapshots.lock().await.insert(*owner, snapshot);
        *self.saves.lock().await += 1;
        Ok(())
    }

    async fn owner_exists(&self, owner: &OwnerId) -> codebox_common::Result<bool> {
        Ok(self.owners.lock().await.contains(owner))
    }
}

/// Probe answering from a fixed set of busy container ids.
#[derive(Clone, Default)]
pub struct ScriptedProbe {
    pub busy: Arc<Mutex<HashSet<String>>>,
}

impl ScriptedProbe {
    pub async fn set_busy(&self, id: &str, busy: bool) {
        let mut set = self.busy.lock().await;
        if busy {
            set.insert(id.to_string());
        } else {
            set.remove(id);
        }
    }
}

#[async_trait]
impl IdleProbe for ScriptedProbe {
    async fn is_busy(&self, container_id: &str) -> bool {
        self.busy.lock().await.contains(container_id)
    }
}

pub fn empty_tar() -> Vec<u8> {
    tar::Builder::new(Vec::new())
        .into_inner()
        .unwrap_or_default()
}

fn engine_header(name: &str, size: u64, kind: tar::EntryType) -> tar::Header {
    let mut header = tar::Header::new_gnu();
    {
        let raw = header.as_old_mut();
        let name = format!("./{name}");
        raw.name[..name.len()].copy_from_slice(name.as_bytes());
    }
    header.set_size(size);
    header.set_mode(0o644);
    header.set_entry_type(kind);
    header
}

/// Tar with `./`-prefixed names, the way an engine archives a directory
pub fn engine_tar(files: &[(&str, &str)]) -> Vec<u8> {
    engine_tar_with_links(files, &[])
}

/// [`engine_tar`] followed by `(name, target, kind)` link entries
pub fn engine_tar_with_links(
    files: &[(&str, &str)],
    links: &[(&str, &str, tar::EntryType)],
) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for (name, content) in files {
        let mut header = engine_header(name, content.len() as u64, tar::EntryType::Regular);
        header.set_cksum();
        builder.append(&header, content.as_bytes()).unwrap();
    }
    for (name, target, kind) in links {
        let mut header = engine_header(name, 0, *kind);
        header.set_link_name(target).unwrap();
        header.set_cksum();
        builder.append(&header, std::io::empty()).unwrap();
    }
    builder.into_inner().unwrap()
}

/// Name, entry type and link target of every entry
pub fn entry_kinds(tar: &[u8]) -> Vec<(String, tar::EntryType, Option<String>)> {
    let mut archive = tar::Archive::new(std::io::Cursor::new(tar));
    archive
        .entries()
        .unwrap()
        .map(|e| {
            let e = e.unwrap();
            let name = e.path().unwrap().to_string_lossy().into_owned();
            let target = e
                .link_name()
                .unwrap()
                .map(|t| t.to_string_lossy().into_owned());
            (name, e.header().entry_type(), target)
        })
        .collect()
}

pub fn file_names(tar: &[u8]) -> Vec<String> {
    let mut archive = tar::Archive::new(std::io::Cursor::new(tar));
    archive
        .entries()
        .unwrap()
        .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
        .collect()
}

pub fn test_config() -> LifecycleConfig {
    LifecycleConfig {
        image: "codebox/ide:test".to_string(),
        network: Some("proxy".to_string()),
        proxy_base_url: "http://ide.test/".to_string(),
        ..Default::default()
    }
}

pub fn manager(runtime: &MockRuntime, store: &MemoryStore) -> Arc<LifecycleManager> {
    Arc::new(LifecycleManager::new(
        Arc::new(runtime.clone()),
        Arc::new(store.clone()),
        test_config(),
    ))
}
