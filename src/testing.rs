//! In-memory stand-ins for the external systems, shared by unit tests.
//!
//! They mimic the behaviour the daemon relies on: the store enforces
//! uid and address uniqueness, the runtime reports "already in state"
//! conditions, and every mutating call is written to a shared
//! [`Journal`] so tests can assert ordering across systems.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::Utc;

use crate::runtime::{ContainerRuntime, ContainerSpec, ContainerStatus, RuntimeError};
use crate::store::{InsertOutcome, InstanceStore, LeaseCache, LeaseStore, StoreError};
use crate::types::{Instance, InstanceState, Lease};
use crate::wg::device::{KeyPair, PeerEntry, TunnelDevice, TunnelError};
use crate::wg::Cidr;

pub const KEY_A: &str = "xTIBA5rboUvnH4htodjb6e697QjLERt1NAB4mZqp8Dg=";
pub const KEY_B: &str = "TrMvSoP4jYQlY6RIzBgbssQqY3vxI2Pi+y71lOWWXX0=";

#[derive(Default, Clone)]
pub struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    pub fn push(&self, entry: impl Into<String>) {
        self.0.lock().unwrap().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.0.lock().unwrap().clear();
    }
}

#[derive(Default)]
pub struct MemoryStore {
    leases: Mutex<HashMap<i64, Lease>>,
    instances: Mutex<HashMap<i64, Instance>>,
    steal: Mutex<Option<Ipv4Addr>>,
    phantom_uid: AtomicI64,
    pub journal: Journal,
}

impl MemoryStore {
    pub fn with_journal(journal: Journal) -> Self {
        Self {
            journal,
            ..Default::default()
        }
    }

    /// Have another (simulated) allocator grab `addr` just before the
    /// next insert lands.
    pub fn steal_next_insert(&self, addr: Ipv4Addr) {
        *self.steal.lock().unwrap() = Some(addr);
    }

    pub fn instance(&self, uid: i64) -> Option<Instance> {
        self.instances.lock().unwrap().get(&uid).cloned()
    }
}

#[async_trait]
impl LeaseStore for MemoryStore {
    async fn lease_for(&self, uid: i64) -> Result<Option<Lease>, StoreError> {
        Ok(self.leases.lock().unwrap().get(&uid).cloned())
    }

    async fn leased_addresses(&self) -> Result<Vec<Ipv4Addr>, StoreError> {
        tokio::task::yield_now().await;
        Ok(self.leases.lock().unwrap().values().map(|l| l.address).collect())
    }

    async fn list_leases(&self) -> Result<Vec<Lease>, StoreError> {
        let mut leases: Vec<Lease> = self.leases.lock().unwrap().values().cloned().collect();
        leases.sort_by_key(|l| l.uid);
        Ok(leases)
    }

    async fn insert_lease(&self, uid: i64, address: Ipv4Addr) -> Result<InsertOutcome, StoreError> {
        tokio::task::yield_now().await;
        let mut leases = self.leases.lock().unwrap();
        if let Some(stolen) = self.steal.lock().unwrap().take() {
            let phantom = -1 - self.phantom_uid.fetch_add(1, Ordering::SeqCst);
            leases.insert(
                phantom,
                Lease {
                    uid: phantom,
                    address: stolen,
                    public_key: None,
                    private_key: None,
                    allocated_at: Utc::now(),
                },
            );
        }
        if let Some(existing) = leases.get(&uid) {
            return Ok(InsertOutcome::UidTaken(existing.clone()));
        }
        if leases.values().any(|l| l.address == address) {
            return Ok(InsertOutcome::AddressTaken);
        }
        let lease = Lease {
            uid,
            address,
            public_key: None,
            private_key: None,
            allocated_at: Utc::now(),
        };
        leases.insert(uid, lease.clone());
        self.journal.push(format!("lease.insert {}", uid));
        Ok(InsertOutcome::Inserted(lease))
    }

    async fn set_keys(
        &self,
        uid: i64,
        public_key: Option<&str>,
        private_key: Option<&str>,
    ) -> Result<bool, StoreError> {
        match self.leases.lock().unwrap().get_mut(&uid) {
            Some(lease) => {
                lease.public_key = public_key.map(str::to_string);
                lease.private_key = private_key.map(str::to_string);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete_lease(&self, uid: i64) -> Result<bool, StoreError> {
        let removed = self.leases.lock().unwrap().remove(&uid).is_some();
        if removed {
            self.journal.push(format!("lease.release {}", uid));
        }
        Ok(removed)
    }
}

#[async_trait]
impl InstanceStore for MemoryStore {
    async fn get(&self, uid: i64) -> Result<Option<Instance>, StoreError> {
        Ok(self.instance(uid))
    }

    async fn upsert(&self, instance: &Instance) -> Result<(), StoreError> {
        let mut map = self.instances.lock().unwrap();
        match map.get_mut(&instance.uid) {
            Some(existing) => {
                let state = existing.state;
                *existing = instance.clone();
                existing.state = state;
            }
            None => {
                map.insert(instance.uid, instance.clone());
            }
        }
        Ok(())
    }

    async fn set_state(&self, uid: i64, state: InstanceState) -> Result<(), StoreError> {
        if let Some(inst) = self.instances.lock().unwrap().get_mut(&uid) {
            inst.state = state;
        }
        Ok(())
    }

    async fn delete(&self, uid: i64) -> Result<(), StoreError> {
        self.instances.lock().unwrap().remove(&uid);
        self.journal.push(format!("instance.delete {}", uid));
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryCache {
    map: Mutex<HashMap<i64, String>>,
    fail_remove: AtomicBool,
}

impl MemoryCache {
    /// Plant an arbitrary cache entry, as a stale or foreign writer would.
    pub fn plant(&self, uid: i64, raw: &str) {
        self.map.lock().unwrap().insert(uid, raw.to_string());
    }

    /// Make the next eviction fail as if the cache were unreachable.
    pub fn fail_next_remove(&self) {
        self.fail_remove.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl LeaseCache for MemoryCache {
    async fn get(&self, uid: i64) -> Result<Option<String>, StoreError> {
        Ok(self.map.lock().unwrap().get(&uid).cloned())
    }

    async fn put(&self, uid: i64, address: Ipv4Addr) -> Result<(), StoreError> {
        self.map.lock().unwrap().insert(uid, address.to_string());
        Ok(())
    }

    async fn remove(&self, uid: i64) -> Result<(), StoreError> {
        if self.fail_remove.swap(false, Ordering::SeqCst) {
            return Err(StoreError::Corrupt("cache unreachable".into()));
        }
        self.map.lock().unwrap().remove(&uid);
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeDevice {
    peers: Mutex<BTreeMap<String, Vec<Ipv4Addr>>>,
    exists: AtomicBool,
    configured: Mutex<Option<(Ipv4Addr, u8)>>,
    forwarding: AtomicBool,
    set_calls: AtomicUsize,
    generated: AtomicUsize,
    pub journal: Journal,
}

impl FakeDevice {
    pub fn with_journal(journal: Journal) -> Self {
        Self {
            journal,
            ..Default::default()
        }
    }

    pub fn preexisting_interface(&self) {
        self.exists.store(true, Ordering::SeqCst);
    }

    pub fn configured(&self) -> Option<(Ipv4Addr, u8)> {
        *self.configured.lock().unwrap()
    }

    pub fn forwarding(&self) -> bool {
        self.forwarding.load(Ordering::SeqCst)
    }

    pub fn peer_map(&self) -> HashMap<String, Vec<Ipv4Addr>> {
        self.peers
            .lock()
            .unwrap()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn routed(&self) -> HashSet<Ipv4Addr> {
        self.peers.lock().unwrap().values().flatten().copied().collect()
    }

    pub fn set_calls(&self) -> usize {
        self.set_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TunnelDevice for FakeDevice {
    async fn create_interface(&self) -> Result<(), TunnelError> {
        if self.exists.swap(true, Ordering::SeqCst) {
            return Err(TunnelError::InterfaceExists("wg0".into()));
        }
        Ok(())
    }

    async fn configure(
        &self,
        _private_key: &str,
        _listen_port: u16,
        address: Ipv4Addr,
        prefix: u8,
    ) -> Result<(), TunnelError> {
        *self.configured.lock().unwrap() = Some((address, prefix));
        Ok(())
    }

    async fn set_forwarding(&self, enabled: bool) -> Result<(), TunnelError> {
        self.forwarding.store(enabled, Ordering::SeqCst);
        Ok(())
    }

    async fn generate_keypair(&self) -> Result<KeyPair, TunnelError> {
        // distinct, well-formed keys; the private half is only a stand-in
        let n = self.generated.fetch_add(1, Ordering::SeqCst) as u8;
        Ok(KeyPair {
            private_key: STANDARD.encode([n; 32]),
            public_key: STANDARD.encode([n.wrapping_add(128); 32]),
        })
    }

    async fn peers(&self) -> Result<Vec<PeerEntry>, TunnelError> {
        Ok(self
            .peers
            .lock()
            .unwrap()
            .iter()
            .map(|(k, v)| PeerEntry {
                public_key: k.clone(),
                allowed_ips: v.clone(),
            })
            .collect())
    }

    async fn set_peer(&self, public_key: &str, allowed: Ipv4Addr) -> Result<(), TunnelError> {
        self.set_calls.fetch_add(1, Ordering::SeqCst);
        self.peers
            .lock()
            .unwrap()
            .insert(public_key.to_string(), vec![allowed]);
        self.journal.push(format!("peer.set {}", allowed));
        Ok(())
    }

    async fn remove_peer(&self, public_key: &str) -> Result<(), TunnelError> {
        if let Some(ips) = self.peers.lock().unwrap().remove(public_key) {
            for ip in ips {
                self.journal.push(format!("peer.remove {}", ip));
            }
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeRuntime {
    containers: Mutex<HashMap<String, ContainerStatus>>,
    volumes: Mutex<HashSet<String>>,
    specs: Mutex<Vec<ContainerSpec>>,
    configured: Mutex<HashMap<String, ContainerSpec>>,
    fail_once: Mutex<Option<(&'static str, RuntimeError)>>,
    pub journal: Journal,
}

impl FakeRuntime {
    pub fn with_journal(journal: Journal) -> Self {
        Self {
            journal,
            ..Default::default()
        }
    }

    /// Make the next call to `op` fail with a transient error.
    pub fn fail_once(&self, op: &'static str) {
        self.fail_once_with(
            op,
            RuntimeError::Command {
                command: op.to_string(),
                stderr: "transient failure".into(),
            },
        );
    }

    /// Make the next call to `op` fail with `err`, without side effects.
    pub fn fail_once_with(&self, op: &'static str, err: RuntimeError) {
        *self.fail_once.lock().unwrap() = Some((op, err));
    }

    pub fn status(&self, name: &str) -> Option<ContainerStatus> {
        self.containers.lock().unwrap().get(name).copied()
    }

    pub fn has_volume(&self, name: &str) -> bool {
        self.volumes.lock().unwrap().contains(name)
    }

    pub fn created(&self) -> Vec<ContainerSpec> {
        self.specs.lock().unwrap().clone()
    }

    /// Spec last applied to the container's devices.
    pub fn configured(&self, name: &str) -> Option<ContainerSpec> {
        self.configured.lock().unwrap().get(name).cloned()
    }

    /// Remove a container behind the daemon's back.
    pub fn vanish(&self, name: &str) {
        self.containers.lock().unwrap().remove(name);
        self.configured.lock().unwrap().remove(name);
    }

    fn record(&self, op: &'static str, name: &str) -> Result<(), RuntimeError> {
        let mut fail = self.fail_once.lock().unwrap();
        if fail.as_ref().map(|(o, _)| *o) == Some(op) {
            if let Some((_, err)) = fail.take() {
                return Err(err);
            }
        }
        self.journal.push(format!("runtime.{} {}", op, name));
        Ok(())
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn container_status(&self, name: &str) -> Result<Option<ContainerStatus>, RuntimeError> {
        Ok(self.status(name))
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<(), RuntimeError> {
        self.record("create", &spec.name)?;
        let mut containers = self.containers.lock().unwrap();
        if containers.contains_key(&spec.name) {
            return Err(RuntimeError::AlreadyExists(spec.name.clone()));
        }
        containers.insert(spec.name.clone(), ContainerStatus::Stopped);
        self.specs.lock().unwrap().push(spec.clone());
        Ok(())
    }

    async fn configure_container(&self, spec: &ContainerSpec) -> Result<(), RuntimeError> {
        self.record("configure", &spec.name)?;
        if !self.containers.lock().unwrap().contains_key(&spec.name) {
            return Err(RuntimeError::NotFound(spec.name.clone()));
        }
        self.configured
            .lock()
            .unwrap()
            .insert(spec.name.clone(), spec.clone());
        Ok(())
    }

    async fn start_container(&self, name: &str) -> Result<(), RuntimeError> {
        self.record("start", name)?;
        match self.containers.lock().unwrap().get_mut(name) {
            Some(ContainerStatus::Running) => Err(RuntimeError::AlreadyInState(name.into())),
            Some(s) => {
                *s = ContainerStatus::Running;
                Ok(())
            }
            None => Err(RuntimeError::NotFound(name.into())),
        }
    }

    async fn stop_container(&self, name: &str) -> Result<(), RuntimeError> {
        self.record("stop", name)?;
        match self.containers.lock().unwrap().get_mut(name) {
            Some(ContainerStatus::Stopped) => Err(RuntimeError::AlreadyInState(name.into())),
            Some(s) => {
                *s = ContainerStatus::Stopped;
                Ok(())
            }
            None => Err(RuntimeError::NotFound(name.into())),
        }
    }

    async fn delete_container(&self, name: &str) -> Result<(), RuntimeError> {
        self.record("delete", name)?;
        self.configured.lock().unwrap().remove(name);
        match self.containers.lock().unwrap().remove(name) {
            Some(_) => Ok(()),
            None => Err(RuntimeError::NotFound(name.into())),
        }
    }

    async fn create_volume(&self, name: &str) -> Result<(), RuntimeError> {
        self.record("create_volume", name)?;
        if !self.volumes.lock().unwrap().insert(name.to_string()) {
            return Err(RuntimeError::AlreadyExists(name.into()));
        }
        Ok(())
    }

    async fn delete_volume(&self, name: &str) -> Result<(), RuntimeError> {
        self.record("delete_volume", name)?;
        if !self.volumes.lock().unwrap().remove(name) {
            return Err(RuntimeError::NotFound(name.into()));
        }
        Ok(())
    }

    async fn pull_image(&self, reference: &str) -> Result<(), RuntimeError> {
        self.record("pull", reference)
    }

    async fn create_bridge_network(&self, name: &str, _cidr: Cidr) -> Result<(), RuntimeError> {
        self.record("network", name)?;
        Err(RuntimeError::AlreadyExists(name.into()))
    }

    async fn create_storage_pool(&self, name: &str) -> Result<(), RuntimeError> {
        self.record("storage_pool", name)
    }
}
