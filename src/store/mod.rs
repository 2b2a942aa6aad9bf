//! Persistence boundary.
//!
//! The durable store is the only authority for leases and instance
//! records; it must enforce address and uid uniqueness itself.  The cache
//! mirrors leases for the read path and is never consulted when deciding
//! whether an address is free.

use std::net::Ipv4Addr;

use async_trait::async_trait;
use thiserror::Error;

use crate::types::{Instance, InstanceState, Lease};

pub mod postgres;
pub mod redis;

pub use self::postgres::PostgresStore;
pub use self::redis::RedisLeaseCache;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database: {0}")]
    Database(#[from] sqlx::Error),
    #[error("cache: {0}")]
    Cache(#[from] ::redis::RedisError),
    #[error("corrupt record: {0}")]
    Corrupt(String),
}

/// Result of an atomic insert-if-absent on the lease table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted(Lease),
    /// Another uid holds this address.
    AddressTaken,
    /// This uid already holds a lease (returned as stored).
    UidTaken(Lease),
}

#[async_trait]
pub trait LeaseStore: Send + Sync {
    async fn lease_for(&self, uid: i64) -> Result<Option<Lease>, StoreError>;
    async fn leased_addresses(&self) -> Result<Vec<Ipv4Addr>, StoreError>;
    async fn list_leases(&self) -> Result<Vec<Lease>, StoreError>;
    async fn insert_lease(&self, uid: i64, address: Ipv4Addr) -> Result<InsertOutcome, StoreError>;
    /// Bind the peer key to a lease.  `private_key` is only set when the
    /// daemon generated the pair itself.
    async fn set_keys(
        &self,
        uid: i64,
        public_key: Option<&str>,
        private_key: Option<&str>,
    ) -> Result<bool, StoreError>;
    /// Returns whether a lease was removed.
    async fn delete_lease(&self, uid: i64) -> Result<bool, StoreError>;
}

#[async_trait]
pub trait LeaseCache: Send + Sync {
    /// Raw cached address; callers validate it before trusting it.
    async fn get(&self, uid: i64) -> Result<Option<String>, StoreError>;
    async fn put(&self, uid: i64, address: Ipv4Addr) -> Result<(), StoreError>;
    async fn remove(&self, uid: i64) -> Result<(), StoreError>;
}

#[async_trait]
pub trait InstanceStore: Send + Sync {
    async fn get(&self, uid: i64) -> Result<Option<Instance>, StoreError>;
    /// Insert or refresh the record, keeping the stored state if present.
    async fn upsert(&self, instance: &Instance) -> Result<(), StoreError>;
    async fn set_state(&self, uid: i64, state: InstanceState) -> Result<(), StoreError>;
    async fn delete(&self, uid: i64) -> Result<(), StoreError>;
}
