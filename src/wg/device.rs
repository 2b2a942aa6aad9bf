//! Kernel networking boundary for the WireGuard interface.
//!
//! [`WgTools`] drives the stock `ip` and `wg` utilities and writes the
//! forwarding sysctl directly; the rest of the daemon only sees the
//! [`TunnelDevice`] trait.

use std::net::Ipv4Addr;
use std::process::Stdio;

use async_trait::async_trait;
use log::debug;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

const IP_FORWARD: &str = "/proc/sys/net/ipv4/ip_forward";

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("interface {0} already exists")]
    InterfaceExists(String),
    #[error("invalid key: {0}")]
    InvalidKey(String),
    #[error("`{program}` failed: {stderr}")]
    Command { program: String, stderr: String },
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// A peer keypair generated on behalf of a user's device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPair {
    pub private_key: String,
    pub public_key: String,
}

/// One peer as currently programmed into the kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerEntry {
    pub public_key: String,
    pub allowed_ips: Vec<Ipv4Addr>,
}

#[async_trait]
pub trait TunnelDevice: Send + Sync {
    /// Create the interface; [`TunnelError::InterfaceExists`] if it is already there.
    async fn create_interface(&self) -> Result<(), TunnelError>;
    async fn configure(
        &self,
        private_key: &str,
        listen_port: u16,
        address: Ipv4Addr,
        prefix: u8,
    ) -> Result<(), TunnelError>;
    async fn set_forwarding(&self, enabled: bool) -> Result<(), TunnelError>;
    async fn generate_keypair(&self) -> Result<KeyPair, TunnelError>;
    async fn peers(&self) -> Result<Vec<PeerEntry>, TunnelError>;
    /// Create or replace a peer so it routes exactly `allowed`.
    async fn set_peer(&self, public_key: &str, allowed: Ipv4Addr) -> Result<(), TunnelError>;
    async fn remove_peer(&self, public_key: &str) -> Result<(), TunnelError>;
}

pub struct WgTools {
    interface: String,
}

impl WgTools {
    pub fn new(interface: impl Into<String>) -> Self {
        Self {
            interface: interface.into(),
        }
    }

    async fn run(program: &str, args: &[&str], stdin: Option<&str>) -> Result<String, TunnelError> {
        debug!("exec {} {}", program, args.join(" "));
        let mut child = Command::new(program)
            .args(args)
            .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(input.as_bytes()).await?;
            // closing stdin lets `wg` read to EOF
            drop(pipe);
        }

        let out = child.wait_with_output().await?;
        if !out.status.success() {
            return Err(TunnelError::Command {
                program: program.to_string(),
                stderr: String::from_utf8_lossy(&out.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&out.stdout).into_owned())
    }
}

#[async_trait]
impl TunnelDevice for WgTools {
    async fn create_interface(&self) -> Result<(), TunnelError> {
        match Self::run(
            "ip",
            &["link", "add", "dev", &self.interface, "type", "wireguard"],
            None,
        )
        .await
        {
            Err(TunnelError::Command { stderr, .. }) if stderr.contains("File exists") => {
                Err(TunnelError::InterfaceExists(self.interface.clone()))
            }
            other => other.map(|_| ()),
        }
    }

    async fn configure(
        &self,
        private_key: &str,
        listen_port: u16,
        address: Ipv4Addr,
        prefix: u8,
    ) -> Result<(), TunnelError> {
        let port = listen_port.to_string();
        Self::run(
            "wg",
            &[
                "set",
                &self.interface,
                "listen-port",
                &port,
                "private-key",
                "/dev/stdin",
            ],
            Some(private_key),
        )
        .await?;
        let cidr = format!("{}/{}", address, prefix);
        Self::run(
            "ip",
            &["address", "replace", &cidr, "dev", &self.interface],
            None,
        )
        .await?;
        Self::run("ip", &["link", "set", "up", "dev", &self.interface], None).await?;
        Ok(())
    }

    async fn set_forwarding(&self, enabled: bool) -> Result<(), TunnelError> {
        tokio::fs::write(IP_FORWARD, if enabled { "1\n" } else { "0\n" }).await?;
        Ok(())
    }

    async fn generate_keypair(&self) -> Result<KeyPair, TunnelError> {
        let private_key = Self::run("wg", &["genkey"], None).await?.trim().to_string();
        let public_key = Self::run("wg", &["pubkey"], Some(&private_key))
            .await?
            .trim()
            .to_string();
        Ok(KeyPair {
            private_key,
            public_key,
        })
    }

    async fn peers(&self) -> Result<Vec<PeerEntry>, TunnelError> {
        let out = Self::run("wg", &["show", &self.interface, "allowed-ips"], None).await?;
        Ok(parse_allowed_ips(&out))
    }

    async fn set_peer(&self, public_key: &str, allowed: Ipv4Addr) -> Result<(), TunnelError> {
        let allowed = format!("{}/32", allowed);
        Self::run(
            "wg",
            &[
                "set",
                &self.interface,
                "peer",
                public_key,
                "allowed-ips",
                &allowed,
            ],
            None,
        )
        .await?;
        Ok(())
    }

    async fn remove_peer(&self, public_key: &str) -> Result<(), TunnelError> {
        Self::run(
            "wg",
            &["set", &self.interface, "peer", public_key, "remove"],
            None,
        )
        .await?;
        Ok(())
    }
}

/// Parse `wg show <iface> allowed-ips`: one peer per line, the key
/// followed by whitespace separated CIDRs or `(none)`.  Only IPv4 host
/// routes are kept since leases are single addresses.
pub fn parse_allowed_ips(out: &str) -> Vec<PeerEntry> {
    out.lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let key = fields.next()?;
            let allowed_ips = fields
                .filter_map(|f| f.strip_suffix("/32"))
                .filter_map(|a| a.parse().ok())
                .collect();
            Some(PeerEntry {
                public_key: key.to_string(),
                allowed_ips,
            })
        })
        .collect()
}
