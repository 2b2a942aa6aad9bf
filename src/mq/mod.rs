//! Broker plumbing: the channel pool and the main/retry queue topology.

use thiserror::Error;

pub mod pool;
pub mod queue;

pub use pool::{ChannelFactory, ChannelPool, PooledChannel};
pub use queue::{Topic, Topology};

/// The pool used in production: lapin channels over one connection.
pub type AmqpPool = ChannelPool<lapin::Connection>;

#[derive(Debug, Error)]
pub enum MqError {
    #[error("amqp: {0}")]
    Amqp(#[from] lapin::Error),
    #[error("channel pool exhausted ({size} channels busy after {attempts} attempts)")]
    PoolExhausted { size: usize, attempts: u32 },
    #[error("broker connection closed")]
    Closed,
}
