//! Data structures used throughout the daemon.
//!
//! Commands are read off the broker as JSON and are immutable once
//! received.  Instances and leases mirror the rows kept by the durable
//! store; the naming helpers here are the only place container and
//! volume names are derived.

use std::fmt;
use std::net::Ipv4Addr;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What a command asks the daemon to do for a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Deploy,
    Stop,
    Kill,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Action::Deploy => "deploy",
            Action::Stop => "stop",
            Action::Kill => "kill",
        };
        f.write_str(s)
    }
}

/// A unit of work delivered by the broker.
///
/// Unknown fields are ignored.  `public_key` optionally names the
/// WireGuard key of the user's device; without it the daemon generates a
/// keypair for the lease.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    pub action: Action,
    pub uid: i64,
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
}

impl Command {
    /// Decode and validate a broker payload.  Any error here makes the
    /// message poison: retrying it can never succeed.
    pub fn parse(body: &[u8]) -> Result<Self, String> {
        let cmd: Command =
            serde_json::from_slice(body).map_err(|e| format!("invalid payload: {}", e))?;
        cmd.validate()?;
        Ok(cmd)
    }

    fn validate(&self) -> Result<(), String> {
        if self.uid < 0 {
            return Err(format!("uid must be non-negative, got {}", self.uid));
        }
        if self.username.is_empty() {
            return Err("username is empty".into());
        }
        // Names end up in container, volume and hostname positions.
        if !self
            .username
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-')
        {
            return Err(format!("username {:?} has invalid characters", self.username));
        }
        if let Some(key) = &self.public_key {
            validate_public_key(key)?;
        }
        Ok(())
    }
}

/// WireGuard keys are 32 raw bytes, base64 encoded.
pub fn validate_public_key(key: &str) -> Result<(), String> {
    match STANDARD.decode(key) {
        Ok(bytes) if bytes.len() == 32 => Ok(()),
        Ok(bytes) => Err(format!("public key is {} bytes, expected 32", bytes.len())),
        Err(e) => Err(format!("public key is not base64: {}", e)),
    }
}

pub fn container_name(uid: i64, username: &str) -> String {
    format!("{}-{}-instance", uid, username)
}

pub fn volume_name(uid: i64, username: &str) -> String {
    format!("{}-{}_volume", uid, username)
}

/// Inverse of [`container_name`] for the volume, used when tearing down a
/// container whose record is already gone.
pub fn volume_for_container(container: &str) -> Option<String> {
    container
        .strip_suffix("-instance")
        .filter(|stem| !stem.is_empty())
        .map(|stem| format!("{}_volume", stem))
}

/// Lifecycle of a user's sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceState {
    Unprovisioned,
    Provisioning,
    Running,
    Stopped,
    Deleting,
    Failed,
}

impl InstanceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceState::Unprovisioned => "unprovisioned",
            InstanceState::Provisioning => "provisioning",
            InstanceState::Running => "running",
            InstanceState::Stopped => "stopped",
            InstanceState::Deleting => "deleting",
            InstanceState::Failed => "failed",
        }
    }

    /// Whether the controller may move an instance from `self` to `next`.
    /// Staying in the same state is always allowed so handlers can be
    /// re-driven after a redelivery.
    pub fn can_transition(self, next: InstanceState) -> bool {
        use InstanceState::*;
        if self == next {
            return true;
        }
        matches!(
            (self, next),
            (Unprovisioned, Provisioning)
                | (Provisioning, Running)
                | (Provisioning, Failed)
                | (Failed, Provisioning)
                | (Failed, Running)
                | (Failed, Deleting)
                | (Failed, Stopped)
                | (Provisioning, Stopped)
                | (Running, Stopped)
                | (Running, Failed)
                | (Stopped, Running)
                | (Stopped, Failed)
                | (Running, Deleting)
                | (Stopped, Deleting)
                | (Provisioning, Deleting)
        )
    }
}

impl std::str::FromStr for InstanceState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unprovisioned" => Ok(InstanceState::Unprovisioned),
            "provisioning" => Ok(InstanceState::Provisioning),
            "running" => Ok(InstanceState::Running),
            "stopped" => Ok(InstanceState::Stopped),
            "deleting" => Ok(InstanceState::Deleting),
            "failed" => Ok(InstanceState::Failed),
            other => Err(format!("unknown instance state {:?}", other)),
        }
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One user's sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instance {
    pub uid: i64,
    pub username: String,
    pub container_name: String,
    pub volume_name: String,
    pub address: Ipv4Addr,
    pub state: InstanceState,
}

impl Instance {
    pub fn new(uid: i64, username: &str, address: Ipv4Addr) -> Self {
        Self {
            uid,
            username: username.to_string(),
            container_name: container_name(uid, username),
            volume_name: volume_name(uid, username),
            address,
            state: InstanceState::Unprovisioned,
        }
    }
}

/// A durable binding of one tunnel address to one user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub uid: i64,
    pub address: Ipv4Addr,
    pub public_key: Option<String>,
    /// Present when the daemon generated the peer's keypair.
    pub private_key: Option<String>,
    pub allocated_at: DateTime<Utc>,
}
