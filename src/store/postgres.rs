//! PostgreSQL-backed durable store for leases and instance records.
//!
//! `leases.uid` is the primary key and `leases.address` carries a UNIQUE
//! constraint, so concurrent allocators racing for the same address are
//! arbitrated by the database rather than by application locks.

use std::net::Ipv4Addr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use super::{InsertOutcome, InstanceStore, LeaseStore, StoreError};
use crate::types::{Instance, InstanceState, Lease};

#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Apply the bundled migrations.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.into()))
    }
}

#[derive(Debug, sqlx::FromRow)]
struct LeaseRow {
    uid: i64,
    address: String,
    public_key: Option<String>,
    private_key: Option<String>,
    allocated_at: DateTime<Utc>,
}

impl TryFrom<LeaseRow> for Lease {
    type Error = StoreError;

    fn try_from(row: LeaseRow) -> Result<Self, Self::Error> {
        Ok(Lease {
            uid: row.uid,
            address: parse_addr(&row.address)?,
            public_key: row.public_key,
            private_key: row.private_key,
            allocated_at: row.allocated_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct InstanceRow {
    uid: i64,
    username: String,
    container_name: String,
    volume_name: String,
    address: String,
    state: String,
}

impl TryFrom<InstanceRow> for Instance {
    type Error = StoreError;

    fn try_from(row: InstanceRow) -> Result<Self, Self::Error> {
        Ok(Instance {
            uid: row.uid,
            username: row.username,
            container_name: row.container_name,
            volume_name: row.volume_name,
            address: parse_addr(&row.address)?,
            state: row.state.parse().map_err(StoreError::Corrupt)?,
        })
    }
}

fn parse_addr(raw: &str) -> Result<Ipv4Addr, StoreError> {
    raw.parse()
        .map_err(|_| StoreError::Corrupt(format!("bad address {:?}", raw)))
}

#[async_trait]
impl LeaseStore for PostgresStore {
    async fn lease_for(&self, uid: i64) -> Result<Option<Lease>, StoreError> {
        let row = sqlx::query_as::<_, LeaseRow>(
            r#"
            SELECT uid, address, public_key, private_key, allocated_at
            FROM leases
            WHERE uid = $1
            "#,
        )
        .bind(uid)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Lease::try_from).transpose()
    }

    async fn leased_addresses(&self) -> Result<Vec<Ipv4Addr>, StoreError> {
        let rows: Vec<(String,)> = sqlx::query_as("SELECT address FROM leases")
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(|(a,)| parse_addr(a)).collect()
    }

    async fn list_leases(&self) -> Result<Vec<Lease>, StoreError> {
        let rows = sqlx::query_as::<_, LeaseRow>(
            r#"
            SELECT uid, address, public_key, private_key, allocated_at
            FROM leases
            ORDER BY uid
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Lease::try_from).collect()
    }

    async fn insert_lease(&self, uid: i64, address: Ipv4Addr) -> Result<InsertOutcome, StoreError> {
        // DO NOTHING without a target covers both the uid and address constraints.
        let inserted = sqlx::query_as::<_, LeaseRow>(
            r#"
            INSERT INTO leases (uid, address, allocated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT DO NOTHING
            RETURNING uid, address, public_key, private_key, allocated_at
            "#,
        )
        .bind(uid)
        .bind(address.to_string())
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = inserted {
            return Ok(InsertOutcome::Inserted(row.try_into()?));
        }
        match self.lease_for(uid).await? {
            Some(existing) => Ok(InsertOutcome::UidTaken(existing)),
            None => Ok(InsertOutcome::AddressTaken),
        }
    }

    async fn set_keys(
        &self,
        uid: i64,
        public_key: Option<&str>,
        private_key: Option<&str>,
    ) -> Result<bool, StoreError> {
        let result =
            sqlx::query("UPDATE leases SET public_key = $2, private_key = $3 WHERE uid = $1")
                .bind(uid)
                .bind(public_key)
                .bind(private_key)
                .execute(&self.pool)
                .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn delete_lease(&self, uid: i64) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM leases WHERE uid = $1")
            .bind(uid)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl InstanceStore for PostgresStore {
    async fn get(&self, uid: i64) -> Result<Option<Instance>, StoreError> {
        let row = sqlx::query_as::<_, InstanceRow>(
            r#"
            SELECT uid, username, container_name, volume_name, address, state
            FROM instances
            WHERE uid = $1
            "#,
        )
        .bind(uid)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Instance::try_from).transpose()
    }

    async fn upsert(&self, instance: &Instance) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO instances (uid, username, container_name, volume_name, address, state, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, NOW())
            ON CONFLICT (uid) DO UPDATE
            SET username = EXCLUDED.username,
                container_name = EXCLUDED.container_name,
                volume_name = EXCLUDED.volume_name,
                address = EXCLUDED.address,
                updated_at = NOW()
            "#,
        )
        .bind(instance.uid)
        .bind(&instance.username)
        .bind(&instance.container_name)
        .bind(&instance.volume_name)
        .bind(instance.address.to_string())
        .bind(instance.state.as_str())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn set_state(&self, uid: i64, state: InstanceState) -> Result<(), StoreError> {
        sqlx::query("UPDATE instances SET state = $2, updated_at = NOW() WHERE uid = $1")
            .bind(uid)
            .bind(state.as_str())
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn delete(&self, uid: i64) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM instances WHERE uid = $1")
            .bind(uid)
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}
