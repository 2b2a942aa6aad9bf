//! Instance lifecycle against the container runtime.
//!
//! The controller is the only writer of instance state.  Every operation
//! reads the recorded state and the runtime's view before acting, so a
//! redelivered or reordered command converges instead of failing.
//! Teardown is a fixed sequence of individually idempotent steps: stop
//! the container, unpeer, release the lease, delete container and volume,
//! drop the record.  A crash anywhere in between leaves a state that the
//! next `kill` delivery finishes.

use std::net::Ipv4Addr;
use std::sync::Arc;

use log::{debug, info, warn};
use thiserror::Error;

use crate::runtime::{ContainerRuntime, ContainerSpec, ContainerStatus, RuntimeError};
use crate::store::{InstanceStore, StoreError};
use crate::types::{volume_for_container, Instance, InstanceState};
use crate::wg::{AddressAllocator, AllocError, Cidr, TunnelError, TunnelPeerManager};

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Alloc(#[from] AllocError),
    #[error(transparent)]
    Tunnel(#[from] TunnelError),
    #[error("instance {uid} cannot go from {from} to {to}")]
    InvalidTransition {
        uid: i64,
        from: InstanceState,
        to: InstanceState,
    },
}

/// What a runtime call is meant to achieve.  Only the errors saying
/// that this particular goal already holds count as success; a
/// `NotFound` from `create` (missing image, pool or network) is a real
/// failure.
#[derive(Debug, Clone, Copy)]
enum Goal {
    Created,
    Running,
    Stopped,
    Removed,
}

impl Goal {
    fn reached(self, err: &RuntimeError) -> bool {
        matches!(
            (self, err),
            (Goal::Created, RuntimeError::AlreadyExists(_))
                | (Goal::Running, RuntimeError::AlreadyInState(_))
                | (Goal::Stopped, RuntimeError::AlreadyInState(_))
                | (Goal::Stopped, RuntimeError::NotFound(_))
                | (Goal::Removed, RuntimeError::NotFound(_))
        )
    }
}

trait Settle {
    fn settle(self, goal: Goal) -> Result<(), RuntimeError>;
}

impl Settle for Result<(), RuntimeError> {
    fn settle(self, goal: Goal) -> Result<(), RuntimeError> {
        match self {
            Err(e) if goal.reached(&e) => {
                debug!("{} ({:?} already holds)", e, goal);
                Ok(())
            }
            other => other,
        }
    }
}

pub struct ControllerSettings {
    pub image: String,
    pub network: String,
    pub storage_pool: String,
}

pub struct InstanceController {
    runtime: Arc<dyn ContainerRuntime>,
    store: Arc<dyn InstanceStore>,
    allocator: Arc<AddressAllocator>,
    peers: Arc<TunnelPeerManager>,
    settings: ControllerSettings,
}

impl InstanceController {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        store: Arc<dyn InstanceStore>,
        allocator: Arc<AddressAllocator>,
        peers: Arc<TunnelPeerManager>,
        settings: ControllerSettings,
    ) -> Self {
        Self {
            runtime,
            store,
            allocator,
            peers,
            settings,
        }
    }

    /// One-time runtime preparation: image, bridge network, storage pool.
    pub async fn prepare(&self, cidr: Cidr) -> Result<(), ControllerError> {
        self.runtime.pull_image(&self.settings.image).await?;
        self.runtime
            .create_bridge_network(&self.settings.network, cidr)
            .await
            .settle(Goal::Created)?;
        self.runtime
            .create_storage_pool(&self.settings.storage_pool)
            .await
            .settle(Goal::Created)?;
        info!(
            "Runtime prepared: image {}, network {}, pool {}",
            self.settings.image, self.settings.network, self.settings.storage_pool
        );
        Ok(())
    }

    pub async fn exists(&self, name: &str) -> Result<bool, ControllerError> {
        Ok(self.runtime.container_exists(name).await?)
    }

    /// Refuse to deploy while a teardown for `uid` is unfinished.  Called
    /// before any address or peer is touched.
    pub async fn ensure_deployable(&self, uid: i64) -> Result<(), ControllerError> {
        match self.recorded_state(uid).await? {
            InstanceState::Deleting => Err(ControllerError::InvalidTransition {
                uid,
                from: InstanceState::Deleting,
                to: InstanceState::Running,
            }),
            _ => Ok(()),
        }
    }

    async fn transition(
        &self,
        uid: i64,
        from: InstanceState,
        to: InstanceState,
    ) -> Result<(), ControllerError> {
        if !from.can_transition(to) {
            return Err(ControllerError::InvalidTransition { uid, from, to });
        }
        if from != to {
            self.store.set_state(uid, to).await?;
            debug!("instance {}: {} -> {}", uid, from, to);
        }
        Ok(())
    }

    /// Bring `uid`'s sandbox to Running at `address`, creating what is
    /// missing and restarting what is stopped.
    pub async fn deploy(
        &self,
        uid: i64,
        username: &str,
        address: Ipv4Addr,
    ) -> Result<Instance, ControllerError> {
        let mut instance = Instance::new(uid, username, address);
        let recorded = self.store.get(uid).await?;
        let status = self.runtime.container_status(&instance.container_name).await?;

        match (recorded.as_ref().map(|r| r.state), status) {
            (Some(InstanceState::Running), Some(ContainerStatus::Running)) => {
                debug!("{} already running", instance.container_name);
                instance.state = InstanceState::Running;
                return Ok(instance);
            }
            (Some(from @ (InstanceState::Stopped | InstanceState::Running)), Some(_)) => {
                // restart reuses the existing container and volume
                self.start(uid, &instance.container_name).await?;
                debug!("{} restarted from {}", instance.container_name, from);
                instance.state = InstanceState::Running;
                return Ok(instance);
            }
            (Some(InstanceState::Deleting), _) => {
                return Err(ControllerError::InvalidTransition {
                    uid,
                    from: InstanceState::Deleting,
                    to: InstanceState::Running,
                });
            }
            (Some(from @ (InstanceState::Stopped | InstanceState::Running)), None) => {
                warn!(
                    "{} recorded as {} but missing from runtime, reprovisioning",
                    instance.container_name, from
                );
                self.transition(uid, from, InstanceState::Failed).await?;
            }
            _ => {}
        }

        self.create(&mut instance).await?;
        Ok(instance)
    }

    /// Provision volume and container and start it.  Marks the record
    /// Failed when a step errors so the next delivery resumes from there.
    pub async fn create(&self, instance: &mut Instance) -> Result<(), ControllerError> {
        let from = self
            .store
            .get(instance.uid)
            .await?
            .map(|r| r.state)
            .unwrap_or(InstanceState::Unprovisioned);
        if !from.can_transition(InstanceState::Provisioning) {
            return Err(ControllerError::InvalidTransition {
                uid: instance.uid,
                from,
                to: InstanceState::Provisioning,
            });
        }
        instance.state = InstanceState::Provisioning;
        self.store.upsert(instance).await?;
        self.store
            .set_state(instance.uid, InstanceState::Provisioning)
            .await?;

        if let Err(e) = self.provision(instance).await {
            warn!("Provisioning {} failed: {}", instance.container_name, e);
            if let Err(se) = self.store.set_state(instance.uid, InstanceState::Failed).await {
                warn!("Could not mark {} failed: {}", instance.container_name, se);
            }
            return Err(e);
        }

        self.transition(instance.uid, InstanceState::Provisioning, InstanceState::Running)
            .await?;
        instance.state = InstanceState::Running;
        info!(
            "Instance {} running at {}",
            instance.container_name, instance.address
        );
        Ok(())
    }

    async fn provision(&self, instance: &Instance) -> Result<(), ControllerError> {
        self.runtime
            .create_volume(&instance.volume_name)
            .await
            .settle(Goal::Created)?;
        let spec = ContainerSpec {
            name: instance.container_name.clone(),
            hostname: instance.username.clone(),
            image: self.settings.image.clone(),
            volume: instance.volume_name.clone(),
            network: self.settings.network.clone(),
            address: instance.address,
        };
        if self.exists(&spec.name).await? {
            debug!("{} left by an earlier attempt, reapplying config", spec.name);
        } else {
            self.runtime
                .create_container(&spec)
                .await
                .settle(Goal::Created)?;
        }
        // re-run every time: a create that died halfway left no devices
        self.runtime.configure_container(&spec).await?;
        self.runtime
            .start_container(&instance.container_name)
            .await
            .settle(Goal::Running)?;
        Ok(())
    }

    pub async fn start(&self, uid: i64, name: &str) -> Result<(), ControllerError> {
        let from = self.recorded_state(uid).await?;
        if !from.can_transition(InstanceState::Running) {
            return Err(ControllerError::InvalidTransition {
                uid,
                from,
                to: InstanceState::Running,
            });
        }
        self.runtime
            .start_container(name)
            .await
            .settle(Goal::Running)?;
        self.transition(uid, from, InstanceState::Running).await
    }

    /// Stop the container.  The lease and peer stay so a later deploy
    /// restarts with the same tunnel identity.
    pub async fn stop(&self, uid: i64, name: &str) -> Result<(), ControllerError> {
        let from = self.recorded_state(uid).await?;
        match from {
            InstanceState::Unprovisioned | InstanceState::Stopped => {
                debug!("{} already stopped", name);
                return Ok(());
            }
            InstanceState::Deleting => {
                return Err(ControllerError::InvalidTransition {
                    uid,
                    from,
                    to: InstanceState::Stopped,
                });
            }
            InstanceState::Running | InstanceState::Provisioning | InstanceState::Failed => {}
        }
        self.runtime
            .stop_container(name)
            .await
            .settle(Goal::Stopped)?;
        self.transition(uid, from, InstanceState::Stopped).await?;
        info!("Instance {} stopped", name);
        Ok(())
    }

    /// Tear down everything owned by `uid`: stop, unpeer, release the
    /// lease, delete container and volume, drop the record.
    pub async fn delete(&self, uid: i64, name: &str) -> Result<(), ControllerError> {
        let recorded = self.store.get(uid).await?;
        if let Some(rec) = &recorded {
            self.transition(uid, rec.state, InstanceState::Deleting).await?;
        }

        self.runtime
            .stop_container(name)
            .await
            .settle(Goal::Stopped)?;

        if let Some(lease) = self.allocator.lease(uid).await? {
            self.peers.remove_peer(lease.address).await?;
        }
        self.allocator.deallocate(uid).await?;

        self.runtime
            .delete_container(name)
            .await
            .settle(Goal::Removed)?;
        let volume = recorded
            .as_ref()
            .map(|r| r.volume_name.clone())
            .or_else(|| volume_for_container(name));
        if let Some(volume) = volume {
            self.runtime
                .delete_volume(&volume)
                .await
                .settle(Goal::Removed)?;
        }

        if recorded.is_some() {
            self.store.delete(uid).await?;
        }
        info!("Instance {} deleted", name);
        Ok(())
    }

    async fn recorded_state(&self, uid: i64) -> Result<InstanceState, ControllerError> {
        Ok(self
            .store
            .get(uid)
            .await?
            .map(|r| r.state)
            .unwrap_or(InstanceState::Unprovisioned))
    }
}
