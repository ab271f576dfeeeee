//! Container runtime and registry gateways
//!
//! The engine and the broadcaster only talk to containers through these
//! traits. `DockerEngine` drives the Docker Engine through `bollard`, and
//! `MemoryRuntime` keeps everything in process for tests.

mod docker;
mod memory;

pub use docker::{DockerEngine, AGENT_LABEL, DEPENDS_ON_LABEL};
pub use memory::{MemoryContainer, MemoryRuntime};

use crate::error::{RegistryError, RuntimeError};
use crate::models::{ContainerFilter, ContainerRecord};
use crate::service::CreateDirective;
use async_trait::async_trait;
use futures::Stream;
use std::pin::Pin;
use std::time::Duration;

/// Raw log bytes from a container, already demultiplexed
pub type LogStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>, RuntimeError>> + Send>>;

#[async_trait]
pub trait RuntimeGateway: Send + Sync {
    /// Containers matching `filter`, in engine order
    async fn list_containers(
        &self,
        filter: &ContainerFilter,
    ) -> Result<Vec<ContainerRecord>, RuntimeError>;

    /// Look up a single container by id or name
    async fn inspect(&self, id: &str) -> Result<ContainerRecord, RuntimeError>;

    async fn stream_logs(&self, id: &str, follow: bool, tail: &str)
        -> Result<LogStream, RuntimeError>;

    async fn stop(&self, id: &str, grace: Duration) -> Result<(), RuntimeError>;

    async fn remove(&self, id: &str) -> Result<(), RuntimeError>;

    /// Create a container and return its id
    async fn create(&self, name: &str, directive: &CreateDirective)
        -> Result<String, RuntimeError>;

    async fn start(&self, id: &str) -> Result<(), RuntimeError>;

    async fn pull_image(&self, image: &str) -> Result<(), RuntimeError>;
}

#[async_trait]
pub trait RegistryLookup: Send + Sync {
    /// Digest currently published for `image`
    async fn latest_digest(&self, image: &str) -> Result<String, RegistryError>;
}
