//! Redis mirror of the lease table.

use std::net::Ipv4Addr;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use super::{LeaseCache, StoreError};

const KEY_PREFIX: &str = "kws:lease:";

#[derive(Clone)]
pub struct RedisLeaseCache {
    conn: ConnectionManager,
}

impl RedisLeaseCache {
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)?;
        let conn = client.get_connection_manager().await?;
        Ok(Self { conn })
    }

    fn key(uid: i64) -> String {
        format!("{}{}", KEY_PREFIX, uid)
    }
}

#[async_trait]
impl LeaseCache for RedisLeaseCache {
    async fn get(&self, uid: i64) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn.clone();
        Ok(conn.get(Self::key(uid)).await?)
    }

    async fn put(&self, uid: i64, address: Ipv4Addr) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = conn.set(Self::key(uid), address.to_string()).await?;
        Ok(())
    }

    async fn remove(&self, uid: i64) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(Self::key(uid)).await?;
        Ok(())
    }
}
