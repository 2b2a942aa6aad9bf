//! Tunnel address leases.
//!
//! Leases live in the durable store, which enforces uniqueness of both
//! uid and address.  Allocation picks the lowest free host, attempts an
//! insert-if-absent, and moves on to the next candidate when another
//! allocator won the race for that address.  A process-local lock keeps
//! this daemon's own workers from contending with each other; the store
//! constraint covers everyone else.  The cache is written through after
//! the store and only ever serves `lookup`.

use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::Arc;

use log::{debug, info, warn};
use thiserror::Error;
use tokio::sync::Mutex;

use super::cidr::Cidr;
use super::device::KeyPair;
use crate::store::{InsertOutcome, LeaseCache, LeaseStore, StoreError};
use crate::types::Lease;

#[derive(Debug, Error)]
pub enum AllocError {
    #[error("address pool {0} exhausted")]
    Exhausted(Cidr),
    #[error("{0} is outside {1}")]
    OutOfRange(Ipv4Addr, Cidr),
    #[error("invalid address {0:?}")]
    Parse(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct AddressAllocator {
    cidr: Cidr,
    store: Arc<dyn LeaseStore>,
    cache: Arc<dyn LeaseCache>,
    lock: Mutex<()>,
}

impl AddressAllocator {
    pub fn new(cidr: Cidr, store: Arc<dyn LeaseStore>, cache: Arc<dyn LeaseCache>) -> Self {
        Self {
            cidr,
            store,
            cache,
            lock: Mutex::new(()),
        }
    }

    pub fn cidr(&self) -> Cidr {
        self.cidr
    }

    /// Lease an address to `uid`, or return the lease it already holds.
    pub async fn allocate(&self, uid: i64) -> Result<Lease, AllocError> {
        let _guard = self.lock.lock().await;

        if let Some(existing) = self.store.lease_for(uid).await? {
            debug!("uid {} already leases {}", uid, existing.address);
            self.mirror(uid, existing.address).await;
            return Ok(existing);
        }

        // Each pass either succeeds or learns that one more address is
        // taken, so the loop is bounded by the size of the range.
        let mut lost: HashSet<Ipv4Addr> = HashSet::new();
        loop {
            let taken: HashSet<Ipv4Addr> = self.store.leased_addresses().await?.into_iter().collect();
            let candidate = self
                .cidr
                .hosts()
                .find(|a| !taken.contains(a) && !lost.contains(a))
                .ok_or(AllocError::Exhausted(self.cidr))?;

            match self.store.insert_lease(uid, candidate).await? {
                InsertOutcome::Inserted(lease) => {
                    info!("Leased {} to uid {}", lease.address, uid);
                    self.mirror(uid, lease.address).await;
                    return Ok(lease);
                }
                InsertOutcome::UidTaken(lease) => {
                    self.mirror(uid, lease.address).await;
                    return Ok(lease);
                }
                InsertOutcome::AddressTaken => {
                    debug!("{} taken concurrently, trying next", candidate);
                    lost.insert(candidate);
                }
            }
        }
    }

    /// Drop the lease held by `uid`.  Absent leases are not an error.
    ///
    /// A failed eviction is returned rather than logged: `lookup` trusts
    /// cache hits, so a stale entry must not outlive the lease.  Calling
    /// again after the store row is gone just retries the eviction.
    pub async fn deallocate(&self, uid: i64) -> Result<(), AllocError> {
        let _guard = self.lock.lock().await;
        let removed = self.store.delete_lease(uid).await?;
        if removed {
            info!("Released lease for uid {}", uid);
        }
        self.cache.remove(uid).await.map_err(|e| {
            warn!("Failed to evict cached lease for uid {}: {}", uid, e);
            AllocError::Store(e)
        })
    }

    /// Cache-first read of the address held by `uid`.
    pub async fn lookup(&self, uid: i64) -> Result<Option<Ipv4Addr>, AllocError> {
        match self.cache.get(uid).await {
            Ok(Some(raw)) => match self.parse(&raw) {
                Ok(addr) => return Ok(Some(addr)),
                // a stale or garbled entry is a miss
                Err(e) => debug!("Ignoring cached lease for uid {}: {}", uid, e),
            },
            Ok(None) => {}
            Err(e) => warn!("Lease cache unavailable for uid {}: {}", uid, e),
        }
        let lease = self.store.lease_for(uid).await?;
        if let Some(lease) = &lease {
            self.mirror(uid, lease.address).await;
        }
        Ok(lease.map(|l| l.address))
    }

    pub async fn lease(&self, uid: i64) -> Result<Option<Lease>, AllocError> {
        Ok(self.store.lease_for(uid).await?)
    }

    pub async fn leases(&self) -> Result<Vec<Lease>, AllocError> {
        Ok(self.store.list_leases().await?)
    }

    /// Record the user's own device key on a lease.
    pub async fn bind_key(&self, uid: i64, key: &str) -> Result<bool, AllocError> {
        Ok(self.store.set_keys(uid, Some(key), None).await?)
    }

    /// Record a keypair generated for the user.
    pub async fn bind_keypair(&self, uid: i64, pair: &KeyPair) -> Result<bool, AllocError> {
        Ok(self
            .store
            .set_keys(uid, Some(&pair.public_key), Some(&pair.private_key))
            .await?)
    }

    pub fn is_in_subnet(&self, addr: Ipv4Addr) -> bool {
        self.cidr.contains(addr)
    }

    /// Parse and range-check an address before it is written anywhere.
    pub fn parse(&self, raw: &str) -> Result<Ipv4Addr, AllocError> {
        let addr: Ipv4Addr = raw
            .trim()
            .parse()
            .map_err(|_| AllocError::Parse(raw.to_string()))?;
        if !self.is_in_subnet(addr) {
            return Err(AllocError::OutOfRange(addr, self.cidr));
        }
        Ok(addr)
    }

    async fn mirror(&self, uid: i64, addr: Ipv4Addr) {
        if !self.is_in_subnet(addr) {
            warn!("Lease {} for uid {} is outside {}, not caching it", addr, uid, self.cidr);
            return;
        }
        if let Err(e) = self.cache.put(uid, addr).await {
            warn!("Failed to mirror lease {} for uid {}: {}", addr, uid, e);
        }
    }
}
