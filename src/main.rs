//! kwsd daemon entry point.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use lapin::{Connection, ConnectionProperties};
use log::{error, info};
use sqlx::postgres::PgPoolOptions;
use tokio::signal;

mod config;
mod consumer;
mod error;
mod instance;
mod mq;
mod runtime;
mod store;
#[cfg(test)]
mod testing;
mod types;
mod wg;

use config::{Config, RuntimeKind};
use consumer::Orchestrator;
use instance::{ControllerSettings, InstanceController};
use mq::{queue, ChannelPool, Topic};
use runtime::{ContainerRuntime, DockerRuntime, LxdRuntime};
use store::{PostgresStore, RedisLeaseCache};
use wg::{AddressAllocator, TunnelPeerManager, WgTools};

/// Bound a startup step so an unreachable dependency fails fast.
async fn within<T, E>(
    limit: Duration,
    what: &str,
    fut: impl Future<Output = Result<T, E>>,
) -> anyhow::Result<T>
where
    E: std::fmt::Display,
{
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| anyhow::anyhow!("{} timed out after {:?}", what, limit))?
        .map_err(|e| anyhow::anyhow!("{} failed: {}", what, e))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let cfg = Config::load()?;
    info!(
        "Starting kwsd: broker {}, network {}, runtime {:?}",
        cfg.redacted_amqp_url(),
        cfg.cidr,
        cfg.runtime
    );
    if cfg.wg_private_key.is_empty() {
        anyhow::bail!("wg_private_key is not set (KWSD_WG_PRIVATE_KEY or KWSD_WG_PRIVATE_KEY_FILE)");
    }
    let cidr = cfg.network()?;
    let limit = cfg.startup_timeout();

    // Broker
    let conn = within(
        limit,
        "broker connection",
        Connection::connect(&cfg.amqp_url, ConnectionProperties::default()),
    )
    .await?;
    let pool = within(
        limit,
        "channel pool",
        ChannelPool::create(
            cfg.channel_pool_size,
            cfg.channel_pool_retries,
            cfg.channel_retry_delay(),
            conn,
        ),
    )
    .await?;
    let mut topologies = Vec::with_capacity(Topic::ALL.len());
    for topic in Topic::ALL {
        let channel = pool.get_free_channel().await?;
        topologies.push(
            within(
                limit,
                "queue declaration",
                queue::declare(&channel, topic, cfg.retry_ttl_ms),
            )
            .await?,
        );
    }

    // Durable store and cache
    let pg = within(
        limit,
        "database connection",
        PgPoolOptions::new()
            .max_connections(10)
            .connect(&cfg.database_url),
    )
    .await?;
    let store = Arc::new(PostgresStore::new(pg));
    within(limit, "database migration", store.migrate()).await?;
    let cache = within(
        limit,
        "redis connection",
        RedisLeaseCache::connect(&cfg.redis_url),
    )
    .await?;
    let allocator = Arc::new(AddressAllocator::new(cidr, store.clone(), Arc::new(cache)));
    info!(
        "Address pool {}: {} leasable hosts",
        allocator.cidr(),
        allocator.cidr().capacity()
    );

    // Tunnel
    let device = Arc::new(WgTools::new(cfg.wg_interface.clone()));
    let peers = Arc::new(TunnelPeerManager::new(device, cidr, cfg.wg_listen_port));
    peers.configure_interface(&cfg.wg_private_key).await?;
    peers.set_forward_bit(true).await?;
    let report = peers.reconcile(&allocator.leases().await?).await?;
    info!(
        "Tunnel peers reconciled: {} added, {} removed",
        report.added, report.removed
    );

    // Container runtime
    let runtime: Arc<dyn ContainerRuntime> = match cfg.runtime {
        RuntimeKind::Lxd => Arc::new(LxdRuntime::new(cfg.storage_pool.clone())),
        RuntimeKind::Docker => {
            let docker = DockerRuntime::connect()?;
            within(limit, "docker ping", docker.ping()).await?;
            Arc::new(docker)
        }
    };
    let controller = Arc::new(InstanceController::new(
        runtime,
        store,
        allocator.clone(),
        peers.clone(),
        ControllerSettings {
            image: cfg.image.clone(),
            network: cfg.bridge_network.clone(),
            storage_pool: cfg.storage_pool.clone(),
        },
    ));
    controller.prepare(cidr).await?;

    // Consumers
    let orchestrator = Arc::new(Orchestrator::new(
        allocator,
        peers,
        controller,
        cfg.max_redeliveries,
    ));
    let mut workers = Vec::with_capacity(topologies.len());
    for topology in topologies {
        let channel = pool.get_free_channel().await?;
        let tag = format!("kwsd-{}", topology.topic);
        let deliveries =
            queue::create_consumer(&channel, &topology.main, &tag, cfg.prefetch).await?;
        let orchestrator = Arc::clone(&orchestrator);
        let pool = Arc::clone(&pool);
        let topic = topology.topic;
        info!(
            "{}: consuming {}, retries via {}",
            topic,
            topology.main.name(),
            topology.retry.name()
        );
        workers.push(tokio::spawn(async move {
            // the consuming channel stays checked out while the worker runs
            let _channel = channel;
            if let Err(e) = consumer::run(orchestrator, pool, topic, deliveries).await {
                error!("{} consumer stopped: {}", topic, e);
            }
        }));
    }
    info!("kwsd ready");

    // Graceful Shutdown
    let mut failed = false;
    tokio::select! {
        res = signal::ctrl_c() => match res {
            Ok(()) => info!("Received Ctrl+C, shutting down..."),
            Err(err) => error!("Unable to listen for shutdown signal: {}", err),
        },
        _ = futures_util::future::select_all(workers.iter_mut()) => {
            error!("A consumer exited, shutting down");
            failed = true;
        }
    }

    for worker in &workers {
        worker.abort();
    }

    info!("Shutdown complete.");
    if failed {
        anyhow::bail!("consumer exited unexpectedly");
    }
    Ok(())
}
