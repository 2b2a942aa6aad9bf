//! Command consumption: decode, dispatch, acknowledge.
//!
//! [`Orchestrator::process`] turns one delivery into a [`Disposition`];
//! [`settle`] applies it to the broker.  Success acks, a transient failure
//! nacks without requeue so the main queue dead-letters the message into
//! its retry queue, and poison (or a message over the redelivery cap) is
//! parked on the topic's `.dead` queue and then acked.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::message::Delivery;
use lapin::options::BasicAckOptions;
use lapin::Consumer;
use log::{debug, error, info, warn};

use crate::error::Error;
use crate::instance::InstanceController;
use crate::mq::{queue, AmqpPool, MqError, Topic};
use crate::types::{container_name, Action, Command, Lease};
use crate::wg::{AddressAllocator, TunnelPeerManager};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    Retry,
    DeadLetter(String),
}

pub struct Orchestrator {
    allocator: Arc<AddressAllocator>,
    peers: Arc<TunnelPeerManager>,
    instances: Arc<InstanceController>,
    max_redeliveries: u64,
}

impl Orchestrator {
    pub fn new(
        allocator: Arc<AddressAllocator>,
        peers: Arc<TunnelPeerManager>,
        instances: Arc<InstanceController>,
        max_redeliveries: u64,
    ) -> Self {
        Self {
            allocator,
            peers,
            instances,
            max_redeliveries,
        }
    }

    /// Decide what happens to one delivery.  `redeliveries` is how many
    /// times the message already went through the retry queue.
    pub async fn process(&self, topic: Topic, body: &[u8], redeliveries: u64) -> Disposition {
        if self.max_redeliveries > 0 && redeliveries >= self.max_redeliveries {
            warn!(
                "Giving up on {} message after {} redeliveries",
                topic, redeliveries
            );
            return Disposition::DeadLetter(format!(
                "gave up after {} redeliveries",
                redeliveries
            ));
        }

        let cmd = match Command::parse(body) {
            Ok(cmd) => cmd,
            Err(reason) => {
                warn!("Rejecting {} message: {}", topic, reason);
                return Disposition::DeadLetter(Error::Poison(reason).to_string());
            }
        };

        let result = match topic {
            Topic::Instance => self.handle_instance(&cmd).await,
            Topic::Tunnel => self.handle_tunnel(&cmd).await,
        };
        match result {
            Ok(()) => {
                debug!("{} {} for uid {} done", topic, cmd.action, cmd.uid);
                Disposition::Ack
            }
            Err(e) if e.is_poison() => {
                warn!(
                    "Rejecting {} {} for uid {}: {}",
                    topic, cmd.action, cmd.uid, e
                );
                Disposition::DeadLetter(e.to_string())
            }
            Err(e) if e.is_pool_exhausted() => {
                error!(
                    "{} {} for uid {} deferred, no tunnel addresses left: {}",
                    topic, cmd.action, cmd.uid, e
                );
                Disposition::Retry
            }
            Err(e) => {
                warn!(
                    "{} {} for uid {} failed (redelivery {}), will retry: {}",
                    topic, cmd.action, cmd.uid, redeliveries, e
                );
                Disposition::Retry
            }
        }
    }

    async fn handle_instance(&self, cmd: &Command) -> Result<(), Error> {
        let name = container_name(cmd.uid, &cmd.username);
        match cmd.action {
            Action::Deploy => {
                self.instances.ensure_deployable(cmd.uid).await?;
                let lease = self.bring_up_peer(cmd).await?;
                self.instances
                    .deploy(cmd.uid, &cmd.username, lease.address)
                    .await?;
            }
            Action::Stop => match self.allocator.lookup(cmd.uid).await? {
                Some(_) => self.instances.stop(cmd.uid, &name).await?,
                None => info!("Nothing to stop for uid {}", cmd.uid),
            },
            Action::Kill => self.instances.delete(cmd.uid, &name).await?,
        }
        Ok(())
    }

    /// The tunnel topic manages the user's address and peer without a
    /// container.  The lease is shared with the instance topic, so a
    /// tunnel `kill` runs the same teardown: an instance cannot keep an
    /// address that has been released.
    async fn handle_tunnel(&self, cmd: &Command) -> Result<(), Error> {
        match cmd.action {
            Action::Deploy => {
                self.instances.ensure_deployable(cmd.uid).await?;
                let lease = self.bring_up_peer(cmd).await?;
                info!("Tunnel for uid {} at {}", cmd.uid, lease.address);
            }
            // like an instance stop, the peer stays for a fast resume
            Action::Stop => debug!("Tunnel for uid {} left up", cmd.uid),
            Action::Kill => {
                let name = container_name(cmd.uid, &cmd.username);
                self.instances.delete(cmd.uid, &name).await?;
                info!("Tunnel for uid {} closed", cmd.uid);
            }
        }
        Ok(())
    }

    /// Lease an address and make sure exactly one peer routes it.  The
    /// peer key is the command's, else the one already bound to the
    /// lease, else a freshly generated pair.
    async fn bring_up_peer(&self, cmd: &Command) -> Result<Lease, Error> {
        let lease = self.allocator.allocate(cmd.uid).await?;
        let key = match (cmd.public_key.as_deref(), lease.public_key.as_deref()) {
            (Some(given), Some(bound)) if given == bound => given.to_string(),
            (Some(given), _) => {
                self.allocator.bind_key(cmd.uid, given).await?;
                given.to_string()
            }
            (None, Some(bound)) => bound.to_string(),
            (None, None) => {
                let pair = self.peers.generate_keypair().await?;
                self.allocator.bind_keypair(cmd.uid, &pair).await?;
                info!("Generated tunnel key for uid {}", cmd.uid);
                pair.public_key
            }
        };
        self.peers.add_peer(lease.address, &key).await?;
        Ok(lease)
    }
}

/// Broker side of settling one delivery.
#[async_trait]
pub trait Settlement: Send + Sync {
    async fn ack(&self) -> Result<(), MqError>;
    /// Nack without requeue; the main queue dead-letters into retry.
    async fn retry(&self) -> Result<(), MqError>;
    /// Publish the message to the topic's `.dead` queue.
    async fn park(&self, reason: &str) -> Result<(), MqError>;
}

/// Apply `disposition` to a delivery.  A dead letter is acked only once
/// it is safely parked; if parking fails it goes through retry instead
/// so it is never lost.
pub async fn settle<S: Settlement + ?Sized>(
    topic: Topic,
    delivery: &S,
    disposition: Disposition,
) -> Result<(), MqError> {
    match disposition {
        Disposition::Ack => delivery.ack().await,
        Disposition::Retry => delivery.retry().await,
        Disposition::DeadLetter(reason) => match delivery.park(&reason).await {
            Ok(()) => delivery.ack().await,
            Err(e) => {
                error!("Could not park {} message: {}", topic, e);
                delivery.retry().await
            }
        },
    }
}

struct AmqpDelivery<'a> {
    delivery: &'a Delivery,
    pool: &'a Arc<AmqpPool>,
    topic: Topic,
}

#[async_trait]
impl Settlement for AmqpDelivery<'_> {
    async fn ack(&self) -> Result<(), MqError> {
        self.delivery.acker.ack(BasicAckOptions::default()).await?;
        Ok(())
    }

    async fn retry(&self) -> Result<(), MqError> {
        self.delivery.acker.nack(queue::retry_options()).await?;
        Ok(())
    }

    async fn park(&self, reason: &str) -> Result<(), MqError> {
        let channel = self.pool.get_free_channel().await?;
        debug!(
            "Parking {} message ({} channels in use)",
            self.topic,
            self.pool.in_use()
        );
        let published =
            queue::publish_dead_letter(&channel, self.topic.dead(), &self.delivery.data, reason)
                .await;
        if published.is_err() {
            // the broker closes a channel after a failed publish
            channel.discard();
        }
        published
    }
}

/// Consume `topic` until the broker closes the consumer.
pub async fn run(
    orchestrator: Arc<Orchestrator>,
    pool: Arc<AmqpPool>,
    topic: Topic,
    mut consumer: Consumer,
) -> Result<(), MqError> {
    debug!("Consumer loop started for {}", topic.main());
    while let Some(delivery) = consumer.next().await {
        let delivery = delivery?;
        let redeliveries =
            queue::redelivery_count(delivery.properties.headers().as_ref(), topic.main());

        let disposition = orchestrator
            .process(topic, &delivery.data, redeliveries)
            .await;
        let amqp = AmqpDelivery {
            delivery: &delivery,
            pool: &pool,
            topic,
        };
        settle(topic, &amqp, disposition).await?;
    }
    Err(MqError::Closed)
}
