//! LXD backend driving the `lxc` client.

use async_trait::async_trait;
use log::debug;
use serde::Deserialize;
use tokio::process::Command;

use super::{ContainerRuntime, ContainerSpec, ContainerStatus, RuntimeError, VOLUME_MOUNT};
use crate::wg::Cidr;

pub struct LxdRuntime {
    storage_pool: String,
}

#[derive(Debug, Deserialize)]
struct InstanceInfo {
    status: String,
}

impl LxdRuntime {
    pub fn new(storage_pool: impl Into<String>) -> Self {
        Self {
            storage_pool: storage_pool.into(),
        }
    }

    async fn lxc(subject: &str, args: &[&str]) -> Result<String, RuntimeError> {
        debug!("exec lxc {}", args.join(" "));
        let out = Command::new("lxc").args(args).output().await?;
        if out.status.success() {
            return Ok(String::from_utf8_lossy(&out.stdout).into_owned());
        }
        let stderr = String::from_utf8_lossy(&out.stderr).trim().to_string();
        Err(classify(subject, &format!("lxc {}", args.join(" ")), stderr))
    }
}

/// Map `lxc` error text onto the runtime error kinds the controller
/// treats as benign.
fn classify(subject: &str, command: &str, stderr: String) -> RuntimeError {
    let lower = stderr.to_lowercase();
    if lower.contains("not found") {
        RuntimeError::NotFound(subject.to_string())
    } else if lower.contains("already exists") || lower.contains("already in use") {
        RuntimeError::AlreadyExists(subject.to_string())
    } else if lower.contains("already running")
        || lower.contains("is not running")
        || lower.contains("already stopped")
    {
        RuntimeError::AlreadyInState(subject.to_string())
    } else {
        RuntimeError::Command {
            command: command.to_string(),
            stderr,
        }
    }
}

/// `key=value` settings of the user's data disk device.
fn disk_device(pool: &str, volume: &str) -> (String, String, String) {
    (
        format!("pool={}", pool),
        format!("source={}", volume),
        format!("path={}", VOLUME_MOUNT),
    )
}

fn parse_status(raw: &str) -> Result<ContainerStatus, RuntimeError> {
    let info: InstanceInfo =
        serde_json::from_str(raw).map_err(|e| RuntimeError::Unexpected(e.to_string()))?;
    Ok(match info.status.as_str() {
        "Running" => ContainerStatus::Running,
        _ => ContainerStatus::Stopped,
    })
}

#[async_trait]
impl ContainerRuntime for LxdRuntime {
    async fn container_status(&self, name: &str) -> Result<Option<ContainerStatus>, RuntimeError> {
        let path = format!("/1.0/instances/{}", name);
        match Self::lxc(name, &["query", &path]).await {
            Ok(raw) => parse_status(&raw).map(Some),
            Err(RuntimeError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<(), RuntimeError> {
        Self::lxc(
            &spec.name,
            &[
                "init",
                &spec.image,
                &spec.name,
                "--storage",
                &self.storage_pool,
                "--network",
                &spec.network,
            ],
        )
        .await
        .map(|_| ())
    }

    async fn configure_container(&self, spec: &ContainerSpec) -> Result<(), RuntimeError> {
        let address = spec.address.to_string();
        Self::lxc(
            &spec.name,
            &["config", "device", "set", &spec.name, "eth0", "ipv4.address", &address],
        )
        .await?;
        let (pool, source, path) = disk_device(&self.storage_pool, &spec.volume);
        match Self::lxc(
            &spec.name,
            &["config", "device", "add", &spec.name, "data", "disk", &pool, &source, &path],
        )
        .await
        {
            // left by an earlier attempt; make sure it points at this volume
            Err(RuntimeError::AlreadyExists(_)) => {
                Self::lxc(
                    &spec.name,
                    &["config", "device", "set", &spec.name, "data", &pool, &source, &path],
                )
                .await?;
            }
            other => {
                other?;
            }
        }
        Ok(())
    }

    async fn start_container(&self, name: &str) -> Result<(), RuntimeError> {
        Self::lxc(name, &["start", name]).await.map(|_| ())
    }

    async fn stop_container(&self, name: &str) -> Result<(), RuntimeError> {
        Self::lxc(name, &["stop", name]).await.map(|_| ())
    }

    async fn delete_container(&self, name: &str) -> Result<(), RuntimeError> {
        Self::lxc(name, &["delete", name, "--force"]).await.map(|_| ())
    }

    async fn create_volume(&self, name: &str) -> Result<(), RuntimeError> {
        Self::lxc(name, &["storage", "volume", "create", &self.storage_pool, name])
            .await
            .map(|_| ())
    }

    async fn delete_volume(&self, name: &str) -> Result<(), RuntimeError> {
        Self::lxc(name, &["storage", "volume", "delete", &self.storage_pool, name])
            .await
            .map(|_| ())
    }

    async fn pull_image(&self, reference: &str) -> Result<(), RuntimeError> {
        // Cached under its fingerprint; `init` with the same reference reuses it.
        Self::lxc(reference, &["image", "copy", reference, "local:", "--auto-update"])
            .await
            .map(|_| ())
    }

    async fn create_bridge_network(&self, name: &str, cidr: Cidr) -> Result<(), RuntimeError> {
        let ipv4 = format!("ipv4.address={}/{}", cidr.gateway(), cidr.prefix());
        Self::lxc(
            name,
            &["network", "create", name, &ipv4, "ipv4.nat=true", "ipv6.address=none"],
        )
        .await
        .map(|_| ())
    }

    async fn create_storage_pool(&self, name: &str) -> Result<(), RuntimeError> {
        Self::lxc(name, &["storage", "create", name, "dir"])
            .await
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_benign_errors() {
        let c = |s: &str| classify("x", "lxc", s.to_string());
        assert!(matches!(c("Error: Instance not found"), RuntimeError::NotFound(_)));
        assert!(matches!(
            c("Error: Failed creating instance record: Instance \"x\" already exists"),
            RuntimeError::AlreadyExists(_)
        ));
        assert!(matches!(
            c("Error: The instance is already running"),
            RuntimeError::AlreadyInState(_)
        ));
        assert!(matches!(
            c("Error: The instance is already stopped"),
            RuntimeError::AlreadyInState(_)
        ));
        assert!(matches!(
            c("Error: Get \"http://unix.socket/1.0\": dial unix: connection refused"),
            RuntimeError::Command { .. }
        ));
    }

    #[test]
    fn data_disk_mounts_the_volume() {
        let (pool, source, path) = disk_device("kws_storage", "1-testuser_volume");
        assert_eq!(pool, "pool=kws_storage");
        assert_eq!(source, "source=1-testuser_volume");
        assert_eq!(path, format!("path={}", VOLUME_MOUNT));
    }

    #[test]
    fn reads_instance_status() {
        let raw = r#"{"name":"1-testuser-instance","status":"Running","type":"container"}"#;
        assert_eq!(parse_status(raw).unwrap(), ContainerStatus::Running);
        let raw = r#"{"name":"1-testuser-instance","status":"Stopped"}"#;
        assert_eq!(parse_status(raw).unwrap(), ContainerStatus::Stopped);
        assert!(parse_status("{}").is_err());
    }
}
