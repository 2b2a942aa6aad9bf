//! Reflects the lease table into the kernel's WireGuard peer list.
//!
//! Nothing here is persisted.  Every call reads the live peer list from
//! the device and converges it towards the requested state, so repeating
//! a call is always harmless.
//!
//! Routing: the bridge network owns the connected route for the tunnel
//! subnet.  The tunnel interface only carries the gateway as a host
//! address and each peer is confined to its lease by a /32 allowed-ip,
//! so the two interfaces never compete for the same prefix.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;

use log::{debug, info, warn};
use tokio::sync::Mutex;

use super::cidr::Cidr;
use super::device::{KeyPair, TunnelDevice, TunnelError};
use crate::types::{validate_public_key, Lease};

/// Prefix of the gateway address on the tunnel interface.
const INTERFACE_PREFIX: u8 = 32;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileReport {
    pub added: usize,
    pub removed: usize,
}

pub struct TunnelPeerManager {
    device: Arc<dyn TunnelDevice>,
    cidr: Cidr,
    listen_port: u16,
    // read-modify-write on the peer list
    lock: Mutex<()>,
}

impl TunnelPeerManager {
    pub fn new(device: Arc<dyn TunnelDevice>, cidr: Cidr, listen_port: u16) -> Self {
        Self {
            device,
            cidr,
            listen_port,
            lock: Mutex::new(()),
        }
    }

    /// Bring up the main tunnel interface with the server key.  An
    /// interface left over from a previous run is reused.
    pub async fn configure_interface(&self, private_key: &str) -> Result<(), TunnelError> {
        validate_public_key(private_key).map_err(TunnelError::InvalidKey)?;
        match self.device.create_interface().await {
            Ok(()) => info!("Created tunnel interface"),
            Err(TunnelError::InterfaceExists(name)) => {
                info!("Tunnel interface {} already exists, reusing it", name)
            }
            Err(e) => return Err(e),
        }
        self.device
            .configure(
                private_key,
                self.listen_port,
                self.cidr.gateway(),
                INTERFACE_PREFIX,
            )
            .await
    }

    pub async fn set_forward_bit(&self, enabled: bool) -> Result<(), TunnelError> {
        self.device.set_forwarding(enabled).await?;
        info!("IPv4 forwarding {}", if enabled { "enabled" } else { "disabled" });
        Ok(())
    }

    /// Fresh keypair for a user who did not bring their own device key.
    pub async fn generate_keypair(&self) -> Result<KeyPair, TunnelError> {
        let pair = self.device.generate_keypair().await?;
        validate_public_key(&pair.public_key).map_err(TunnelError::InvalidKey)?;
        debug!("Generated peer key {}", pair.public_key);
        Ok(pair)
    }

    /// Make `public_key` the only peer routing `address`.
    pub async fn add_peer(&self, address: Ipv4Addr, public_key: &str) -> Result<(), TunnelError> {
        validate_public_key(public_key).map_err(TunnelError::InvalidKey)?;
        let _guard = self.lock.lock().await;

        let peers = self.device.peers().await?;
        if peers
            .iter()
            .any(|p| p.public_key == public_key && p.allowed_ips == [address])
        {
            return Ok(());
        }
        for stale in peers
            .iter()
            .filter(|p| p.public_key != public_key && p.allowed_ips.contains(&address))
        {
            warn!("Evicting stale peer {} holding {}", stale.public_key, address);
            self.device.remove_peer(&stale.public_key).await?;
        }
        self.device.set_peer(public_key, address).await?;
        info!("Peer for {} configured", address);
        Ok(())
    }

    /// Remove whichever peer routes `address`.  No peer is not an error.
    pub async fn remove_peer(&self, address: Ipv4Addr) -> Result<(), TunnelError> {
        let _guard = self.lock.lock().await;
        for peer in self
            .device
            .peers()
            .await?
            .iter()
            .filter(|p| p.allowed_ips.contains(&address))
        {
            self.device.remove_peer(&peer.public_key).await?;
            info!("Peer for {} removed", address);
        }
        Ok(())
    }

    /// Converge the kernel peer list onto `leases`: one peer per lease,
    /// nothing else.  A lease whose key was never bound (a deploy that
    /// died between allocation and keying) is left for that deploy's
    /// redelivery to finish.
    pub async fn reconcile(&self, leases: &[Lease]) -> Result<ReconcileReport, TunnelError> {
        let _guard = self.lock.lock().await;
        let mut desired: HashMap<&str, Ipv4Addr> = HashMap::with_capacity(leases.len());
        for lease in leases {
            match lease.public_key.as_deref() {
                Some(key) => {
                    desired.insert(key, lease.address);
                }
                None => warn!(
                    "Lease {} for uid {} has no key yet, skipping",
                    lease.address, lease.uid
                ),
            }
        }

        let mut report = ReconcileReport::default();
        let current = self.device.peers().await?;
        for peer in &current {
            let wanted = desired.get(peer.public_key.as_str());
            if wanted.map(|a| peer.allowed_ips == [*a]) != Some(true) {
                self.device.remove_peer(&peer.public_key).await?;
                report.removed += 1;
            }
        }
        for (key, address) in &desired {
            let present = current
                .iter()
                .any(|p| p.public_key == *key && p.allowed_ips == [*address]);
            if !present {
                self.device.set_peer(key, *address).await?;
                report.added += 1;
            }
        }
        info!(
            "Peer reconciliation: {} added, {} removed",
            report.added, report.removed
        );
        Ok(report)
    }
}
