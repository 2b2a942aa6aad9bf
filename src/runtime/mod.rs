use std::net::Ipv4Addr;

use async_trait::async_trait;
use thiserror::Error;

use crate::wg::Cidr;

pub mod docker;
pub mod lxd;
pub use docker::DockerRuntime;
pub use lxd::LxdRuntime;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("{0} already exists")]
    AlreadyExists(String),
    /// The object is already running / already stopped.
    #[error("{0} already in requested state")]
    AlreadyInState(String),
    #[error("`{command}` failed: {stderr}")]
    Command { command: String, stderr: String },
    #[error("docker: {0}")]
    Docker(#[from] bollard::errors::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("unexpected runtime response: {0}")]
    Unexpected(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerStatus {
    Running,
    Stopped,
}

/// Everything needed to create one user's container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    pub name: String,
    pub hostname: String,
    pub image: String,
    pub volume: String,
    pub network: String,
    pub address: Ipv4Addr,
}

/// Mount point of the user's volume inside the container.
pub const VOLUME_MOUNT: &str = "/data";

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// `None` when no such container exists.
    async fn container_status(&self, name: &str) -> Result<Option<ContainerStatus>, RuntimeError>;

    async fn container_exists(&self, name: &str) -> Result<bool, RuntimeError> {
        Ok(self.container_status(name).await?.is_some())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<(), RuntimeError>;

    /// (Re)apply the pinned address and the data volume to an existing
    /// container.  Must be idempotent: it runs on every provisioning
    /// attempt so a create that died halfway is completed on retry.
    /// Backends whose create applies the whole spec atomically keep the
    /// default.
    async fn configure_container(&self, _spec: &ContainerSpec) -> Result<(), RuntimeError> {
        Ok(())
    }

    async fn start_container(&self, name: &str) -> Result<(), RuntimeError>;
    async fn stop_container(&self, name: &str) -> Result<(), RuntimeError>;
    async fn delete_container(&self, name: &str) -> Result<(), RuntimeError>;
    async fn create_volume(&self, name: &str) -> Result<(), RuntimeError>;
    async fn delete_volume(&self, name: &str) -> Result<(), RuntimeError>;
    async fn pull_image(&self, reference: &str) -> Result<(), RuntimeError>;
    /// Bridge network carrying `cidr`, with the gateway on the host.
    async fn create_bridge_network(&self, name: &str, cidr: Cidr) -> Result<(), RuntimeError>;
    async fn create_storage_pool(&self, name: &str) -> Result<(), RuntimeError>;
}
