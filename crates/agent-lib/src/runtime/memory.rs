//! In-process runtime used by tests and local demos
//!
//! Containers, images and registry digests live in memory. Every gateway
//! call is appended to a call log (`stop:web`, `create:web`, ...) so tests
//! can assert on ordering, and individual calls can be made to fail once.

use super::{LogStream, RegistryLookup, RuntimeGateway};
use crate::error::{RegistryError, RuntimeError};
use crate::models::{ContainerFilter, ContainerRecord, ContainerStatus};
use crate::service::{CreateDirective, ImageRef, ServiceSpec};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::StreamExt;

/// Builder for a seeded container
#[derive(Debug, Clone)]
pub struct MemoryContainer {
    name: String,
    image: String,
    digest: Option<String>,
    status: ContainerStatus,
    depends_on: Vec<String>,
    is_self: bool,
}

impl MemoryContainer {
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            digest: None,
            status: ContainerStatus::Running,
            depends_on: Vec::new(),
            is_self: false,
        }
    }

    pub fn digest(mut self, digest: impl Into<String>) -> Self {
        self.digest = Some(digest.into());
        self
    }

    pub fn status(mut self, status: ContainerStatus) -> Self {
        self.status = status;
        self
    }

    pub fn depends_on<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = names.into_iter().map(Into::into).collect();
        self
    }

    /// Mark as the agent's own container
    pub fn agent(mut self) -> Self {
        self.is_self = true;
        self
    }
}

#[derive(Debug, Clone)]
struct ImageEntry {
    id: String,
    digest: Option<String>,
}

#[derive(Default)]
struct State {
    /// Scan order
    containers: Vec<ContainerRecord>,
    images: HashMap<String, ImageEntry>,
    latest: HashMap<String, String>,
    registry_failures: HashSet<String>,
    failures: Vec<(String, String)>,
    list_failures: usize,
    calls: Vec<String>,
    /// Position and spec of removed containers, reused on create
    removed: HashMap<String, (usize, ServiceSpec)>,
    directives: HashMap<String, CreateDirective>,
    logs: HashMap<String, Vec<Vec<u8>>>,
    feeds: HashMap<String, mpsc::UnboundedReceiver<Vec<u8>>>,
    next_id: u64,
}

impl State {
    fn position(&self, id: &str) -> Option<usize> {
        self.containers
            .iter()
            .position(|c| c.id == id || c.name == id)
    }

    fn name_of(&self, id: &str) -> String {
        self.position(id)
            .map(|i| self.containers[i].name.clone())
            .unwrap_or_else(|| id.to_string())
    }

    fn take_failure(&mut self, op: &str, target: &str) -> bool {
        match self
            .failures
            .iter()
            .position(|(o, t)| o == op && t == target)
        {
            Some(i) => {
                self.failures.remove(i);
                true
            }
            None => false,
        }
    }

    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}-{}", self.next_id)
    }
}

/// Runtime gateway and registry held entirely in memory
#[derive(Clone, Default)]
pub struct MemoryRuntime {
    state: Arc<Mutex<State>>,
    stop_gate: Arc<Mutex<Option<Arc<Notify>>>>,
}

impl MemoryRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Seed a container; its image is registered locally with the given digest
    pub fn add_container(&self, container: MemoryContainer) -> String {
        let mut state = self.state();
        let id = state.next_id(&container.name);
        let image_id = format!("sha256:{}-image", container.name);
        state.images.insert(
            container.image.clone(),
            ImageEntry {
                id: image_id.clone(),
                digest: container.digest.clone(),
            },
        );
        state.images.insert(
            image_id.clone(),
            ImageEntry {
                id: image_id.clone(),
                digest: container.digest.clone(),
            },
        );

        let spec = ServiceSpec {
            name: container.name.clone(),
            image: container.image.clone(),
            depends_on: container.depends_on,
            ..Default::default()
        };
        state.containers.push(ContainerRecord {
            id: id.clone(),
            name: container.name,
            image: container.image,
            image_id,
            current_digest: container.digest,
            status: container.status,
            spec,
            is_self: container.is_self,
        });
        id
    }

    /// Publish `digest` as the newest version of `image`
    pub fn set_latest(&self, image: &str, digest: impl Into<String>) {
        let key = ImageRef::parse(image).tagged();
        self.state().latest.insert(key, digest.into());
    }

    /// Make registry lookups for `image` fail
    pub fn fail_registry(&self, image: &str) {
        let key = ImageRef::parse(image).tagged();
        self.state().registry_failures.insert(key);
    }

    /// Fail the next `op` (`stop`, `remove`, `create`, `start`, `pull`) on
    /// `target` (container name, or image reference for `pull`)
    pub fn fail_once(&self, op: &str, target: &str) {
        self.state()
            .failures
            .push((op.to_string(), target.to_string()));
    }

    /// Fail the next `count` list calls
    pub fn fail_list(&self, count: usize) {
        self.state().list_failures = count;
    }

    /// Make every stop wait until the returned handle is notified
    pub fn hold_stops(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self
            .stop_gate
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(gate.clone());
        gate
    }

    /// Finite log output for `name`
    pub fn set_logs(&self, name: &str, chunks: Vec<&[u8]>) {
        self.state().logs.insert(
            name.to_string(),
            chunks.into_iter().map(<[u8]>::to_vec).collect(),
        );
    }

    /// Live log feed for `name`; the stream ends when the sender is dropped
    pub fn open_log_feed(&self, name: &str) -> mpsc::UnboundedSender<Vec<u8>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state().feeds.insert(name.to_string(), rx);
        tx
    }

    /// Drop a container without going through the gateway
    pub fn delete_container(&self, name: &str) {
        self.state().containers.retain(|c| c.name != name);
    }

    pub fn calls(&self) -> Vec<String> {
        self.state().calls.clone()
    }

    pub fn container(&self, name: &str) -> Option<ContainerRecord> {
        self.state()
            .containers
            .iter()
            .find(|c| c.name == name)
            .cloned()
    }

    pub fn last_directive(&self, name: &str) -> Option<CreateDirective> {
        self.state().directives.get(name).cloned()
    }
}

#[async_trait]
impl RuntimeGateway for MemoryRuntime {
    async fn list_containers(
        &self,
        filter: &ContainerFilter,
    ) -> Result<Vec<ContainerRecord>, RuntimeError> {
        let mut state = self.state();
        state.calls.push("list".to_string());
        if state.list_failures > 0 {
            state.list_failures -= 1;
            return Err(RuntimeError::Transport("connection refused".to_string()));
        }
        Ok(state
            .containers
            .iter()
            .filter(|c| filter.matches(&c.name, &c.image))
            .cloned()
            .collect())
    }

    async fn inspect(&self, id: &str) -> Result<ContainerRecord, RuntimeError> {
        let state = self.state();
        state
            .position(id)
            .map(|i| state.containers[i].clone())
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))
    }

    async fn stream_logs(
        &self,
        id: &str,
        _follow: bool,
        _tail: &str,
    ) -> Result<LogStream, RuntimeError> {
        let mut state = self.state();
        let name = match state.position(id) {
            Some(i) => state.containers[i].name.clone(),
            None => return Err(RuntimeError::NotFound(id.to_string())),
        };
        if let Some(feed) = state.feeds.remove(&name) {
            return Ok(Box::pin(UnboundedReceiverStream::new(feed).map(Ok)));
        }
        let chunks = state.logs.get(&name).cloned().unwrap_or_default();
        Ok(Box::pin(tokio_stream::iter(chunks.into_iter().map(Ok))))
    }

    async fn stop(&self, id: &str, _grace: Duration) -> Result<(), RuntimeError> {
        let gate = self
            .stop_gate
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        {
            let mut state = self.state();
            let name = state.name_of(id);
            state.calls.push(format!("stop:{name}"));
        }
        if let Some(gate) = gate {
            gate.notified().await;
        }

        let mut state = self.state();
        let name = state.name_of(id);
        if state.take_failure("stop", &name) {
            return Err(RuntimeError::Api {
                status: 500,
                message: format!("cannot stop {name}"),
            });
        }
        match state.position(id) {
            Some(i) => {
                state.containers[i].status = ContainerStatus::Stopped;
                Ok(())
            }
            None => Err(RuntimeError::NotFound(id.to_string())),
        }
    }

    async fn remove(&self, id: &str) -> Result<(), RuntimeError> {
        let mut state = self.state();
        let name = state.name_of(id);
        state.calls.push(format!("remove:{name}"));
        if state.take_failure("remove", &name) {
            return Err(RuntimeError::Api {
                status: 500,
                message: format!("cannot remove {name}"),
            });
        }
        let index = state
            .position(id)
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))?;
        let record = state.containers.remove(index);
        state.removed.insert(record.name, (index, record.spec));
        Ok(())
    }

    async fn create(
        &self,
        name: &str,
        directive: &CreateDirective,
    ) -> Result<String, RuntimeError> {
        let mut state = self.state();
        state.calls.push(format!("create:{name}"));
        if state.take_failure("create", name) {
            return Err(RuntimeError::Api {
                status: 500,
                message: format!("cannot create {name}"),
            });
        }
        if state.position(name).is_some() {
            return Err(RuntimeError::Api {
                status: 409,
                message: format!("container name {name} is already in use"),
            });
        }
        let image = directive.process.image.clone();
        let entry = state
            .images
            .get(&image)
            .cloned()
            .ok_or_else(|| RuntimeError::NotFound(format!("no such image: {image}")))?;

        let (index, spec) = state.removed.remove(name).unwrap_or_else(|| {
            (
                usize::MAX,
                ServiceSpec {
                    name: name.to_string(),
                    ..Default::default()
                },
            )
        });
        let id = state.next_id(name);
        let record = ContainerRecord {
            id: id.clone(),
            name: name.to_string(),
            image: image.clone(),
            image_id: entry.id,
            current_digest: entry.digest,
            status: ContainerStatus::Stopped,
            spec: spec.with_image(image),
            is_self: false,
        };
        let index = index.min(state.containers.len());
        state.containers.insert(index, record);
        state.directives.insert(name.to_string(), directive.clone());
        Ok(id)
    }

    async fn start(&self, id: &str) -> Result<(), RuntimeError> {
        let mut state = self.state();
        let name = state.name_of(id);
        state.calls.push(format!("start:{name}"));
        if state.take_failure("start", &name) {
            return Err(RuntimeError::Api {
                status: 500,
                message: format!("cannot start {name}"),
            });
        }
        let index = state
            .position(id)
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))?;
        state.containers[index].status = ContainerStatus::Running;
        Ok(())
    }

    async fn pull_image(&self, image: &str) -> Result<(), RuntimeError> {
        let mut state = self.state();
        state.calls.push(format!("pull:{image}"));
        if state.take_failure("pull", image) {
            return Err(RuntimeError::Api {
                status: 500,
                message: format!("cannot pull {image}"),
            });
        }
        let digest = state
            .latest
            .get(&ImageRef::parse(image).tagged())
            .cloned()
            .ok_or_else(|| RuntimeError::NotFound(format!("manifest for {image}")))?;
        let id = format!("sha256:{}", digest.trim_start_matches("sha256:"));
        state.images.insert(
            image.to_string(),
            ImageEntry {
                id: id.clone(),
                digest: Some(digest.clone()),
            },
        );
        state.images.insert(
            id.clone(),
            ImageEntry {
                id,
                digest: Some(digest),
            },
        );
        Ok(())
    }
}

#[async_trait]
impl RegistryLookup for MemoryRuntime {
    async fn latest_digest(&self, image: &str) -> Result<String, RegistryError> {
        let key = ImageRef::parse(image).tagged();
        let state = self.state();
        if state.registry_failures.contains(&key) {
            return Err(RegistryError::Lookup {
                image: image.to_string(),
                message: "registry unavailable".to_string(),
            });
        }
        state
            .latest
            .get(&key)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(image.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::compile;

    #[tokio::test]
    async fn test_recreate_keeps_scan_position() {
        let runtime = MemoryRuntime::new();
        runtime.add_container(MemoryContainer::new("a", "img-a"));
        let b = runtime.add_container(MemoryContainer::new("b", "img-b"));
        runtime.add_container(MemoryContainer::new("c", "img-c"));

        let spec = runtime.container("b").unwrap().spec;
        runtime.remove(&b).await.unwrap();
        runtime.create("b", &compile(&spec)).await.unwrap();

        let names: Vec<_> = runtime
            .list_containers(&ContainerFilter::default())
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.name)
            .collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_pull_registers_latest_digest() {
        let runtime = MemoryRuntime::new();
        runtime.set_latest("nginx:1.25", "sha256:new");
        runtime.pull_image("nginx:1.25").await.unwrap();
        assert!(runtime.pull_image("redis").await.is_err());
        assert_eq!(
            runtime.calls(),
            vec!["pull:nginx:1.25".to_string(), "pull:redis".to_string()]
        );
    }

    #[tokio::test]
    async fn test_failures_fire_once() {
        let runtime = MemoryRuntime::new();
        let id = runtime.add_container(MemoryContainer::new("web", "nginx"));
        runtime.fail_once("start", "web");
        assert!(runtime.start(&id).await.is_err());
        assert!(runtime.start(&id).await.is_ok());
    }
}
