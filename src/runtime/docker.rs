//! Docker backend, for hosts without LXD.  Storage pools have no Docker
//! equivalent; volumes live in the daemon's default volume driver.

use std::collections::HashMap;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, RemoveContainerOptions, StartContainerOptions,
    StopContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::image::CreateImageOptions;
use bollard::models::{
    EndpointIpamConfig, EndpointSettings, HostConfig, Ipam, IpamConfig,
};
use bollard::network::CreateNetworkOptions;
use bollard::volume::{CreateVolumeOptions, RemoveVolumeOptions};
use bollard::Docker;
use futures_util::stream::TryStreamExt;
use log::{debug, info};

use super::{ContainerRuntime, ContainerSpec, ContainerStatus, RuntimeError, VOLUME_MOUNT};
use crate::wg::Cidr;

/// Seconds Docker waits before killing a container on stop.
const STOP_GRACE_SECS: i64 = 10;

pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    pub fn connect() -> Result<Self, RuntimeError> {
        // Local daemon socket on Linux.
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Self { docker })
    }

    /// Confirms the daemon answers; used as the startup reachability check.
    pub async fn ping(&self) -> Result<(), RuntimeError> {
        self.docker.ping().await?;
        Ok(())
    }
}

/// Fold Docker's HTTP status codes into the runtime error kinds.
fn classify(subject: &str, err: DockerError) -> RuntimeError {
    match err {
        DockerError::DockerResponseServerError { status_code: 404, .. } => {
            RuntimeError::NotFound(subject.to_string())
        }
        DockerError::DockerResponseServerError { status_code: 409, .. } => {
            RuntimeError::AlreadyExists(subject.to_string())
        }
        DockerError::DockerResponseServerError { status_code: 304, .. } => {
            RuntimeError::AlreadyInState(subject.to_string())
        }
        other => RuntimeError::Docker(other),
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn container_status(&self, name: &str) -> Result<Option<ContainerStatus>, RuntimeError> {
        match self.docker.inspect_container(name, None).await {
            Ok(detail) => {
                let running = detail
                    .state
                    .and_then(|s| s.running)
                    .unwrap_or(false);
                Ok(Some(if running {
                    ContainerStatus::Running
                } else {
                    ContainerStatus::Stopped
                }))
            }
            Err(e) => match classify(name, e) {
                RuntimeError::NotFound(_) => Ok(None),
                other => Err(other),
            },
        }
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<(), RuntimeError> {
        let mut endpoints = HashMap::new();
        endpoints.insert(
            spec.network.clone(),
            EndpointSettings {
                ipam_config: Some(EndpointIpamConfig {
                    ipv4_address: Some(spec.address.to_string()),
                    ..Default::default()
                }),
                ..Default::default()
            },
        );
        let config = Config {
            image: Some(spec.image.clone()),
            hostname: Some(spec.hostname.clone()),
            tty: Some(true),
            host_config: Some(HostConfig {
                binds: Some(vec![format!("{}:{}", spec.volume, VOLUME_MOUNT)]),
                network_mode: Some(spec.network.clone()),
                ..Default::default()
            }),
            networking_config: Some(bollard::container::NetworkingConfig {
                endpoints_config: endpoints,
            }),
            ..Default::default()
        };
        let opts = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };
        self.docker
            .create_container(Some(opts), config)
            .await
            .map_err(|e| classify(&spec.name, e))?;
        debug!("Created container {} at {}", spec.name, spec.address);
        Ok(())
    }

    async fn start_container(&self, name: &str) -> Result<(), RuntimeError> {
        self.docker
            .start_container(name, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| classify(name, e))
    }

    async fn stop_container(&self, name: &str) -> Result<(), RuntimeError> {
        self.docker
            .stop_container(name, Some(StopContainerOptions { t: STOP_GRACE_SECS }))
            .await
            .map_err(|e| classify(name, e))
    }

    async fn delete_container(&self, name: &str) -> Result<(), RuntimeError> {
        let opts = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        self.docker
            .remove_container(name, Some(opts))
            .await
            .map_err(|e| classify(name, e))
    }

    async fn create_volume(&self, name: &str) -> Result<(), RuntimeError> {
        // Creating an existing volume is a no-op in Docker.
        let opts = CreateVolumeOptions {
            name: name.to_string(),
            ..Default::default()
        };
        self.docker
            .create_volume(opts)
            .await
            .map_err(|e| classify(name, e))?;
        Ok(())
    }

    async fn delete_volume(&self, name: &str) -> Result<(), RuntimeError> {
        self.docker
            .remove_volume(name, None::<RemoveVolumeOptions>)
            .await
            .map_err(|e| classify(name, e))
    }

    async fn pull_image(&self, reference: &str) -> Result<(), RuntimeError> {
        let opts = CreateImageOptions {
            from_image: reference.to_string(),
            ..Default::default()
        };
        let mut stream = self.docker.create_image(Some(opts), None, None);
        while let Some(progress) = stream.try_next().await.map_err(|e| classify(reference, e))? {
            if let Some(status) = progress.status {
                debug!("pull {}: {}", reference, status);
            }
        }
        info!("Image {} available", reference);
        Ok(())
    }

    async fn create_bridge_network(&self, name: &str, cidr: Cidr) -> Result<(), RuntimeError> {
        let opts = CreateNetworkOptions {
            name: name.to_string(),
            driver: "bridge".to_string(),
            ipam: Ipam {
                config: Some(vec![IpamConfig {
                    subnet: Some(cidr.to_string()),
                    gateway: Some(cidr.gateway().to_string()),
                    ..Default::default()
                }]),
                ..Default::default()
            },
            ..Default::default()
        };
        self.docker
            .create_network(opts)
            .await
            .map_err(|e| classify(name, e))?;
        Ok(())
    }

    async fn create_storage_pool(&self, name: &str) -> Result<(), RuntimeError> {
        debug!("Docker has no storage pools; skipping {}", name);
        Ok(())
    }
}
