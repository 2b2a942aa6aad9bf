//! Main/retry queue pairs.
//!
//! Every topic owns a direct exchange and queue named `<topic>.main`, a
//! retry pair named `<topic>.retry`, and a parking queue `<topic>.dead`.
//! Rejecting a delivery on the main queue dead-letters it into the retry
//! queue.  Nothing consumes the retry queue: its message TTL expires and
//! the broker dead-letters the message back into the main exchange, which
//! gives a fixed redelivery delay without any timer in this process.

use lapin::options::{
    BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable, LongString};
use lapin::{BasicProperties, Channel, Consumer, ExchangeKind, Queue};
use log::{debug, info};

use super::MqError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    Instance,
    Tunnel,
}

impl Topic {
    pub const ALL: [Topic; 2] = [Topic::Instance, Topic::Tunnel];

    pub fn main(&self) -> &'static str {
        match self {
            Topic::Instance => "instance.main",
            Topic::Tunnel => "tunnel.main",
        }
    }

    pub fn retry(&self) -> &'static str {
        match self {
            Topic::Instance => "instance.retry",
            Topic::Tunnel => "tunnel.retry",
        }
    }

    pub fn dead(&self) -> &'static str {
        match self {
            Topic::Instance => "instance.dead",
            Topic::Tunnel => "tunnel.dead",
        }
    }
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Topic::Instance => f.write_str("instance"),
            Topic::Tunnel => f.write_str("tunnel"),
        }
    }
}

/// Declared queues for one topic.
pub struct Topology {
    pub topic: Topic,
    pub main: Queue,
    pub retry: Queue,
}

const REASON_HEADER: &str = "x-kws-reason";

pub fn main_queue_args(retry: &str) -> FieldTable {
    let mut args = FieldTable::default();
    args.insert(
        "x-dead-letter-exchange".into(),
        AMQPValue::LongString(retry.into()),
    );
    args.insert(
        "x-dead-letter-routing-key".into(),
        AMQPValue::LongString(retry.into()),
    );
    args
}

pub fn retry_queue_args(main: &str, ttl_ms: u32) -> FieldTable {
    let mut args = FieldTable::default();
    args.insert("x-message-ttl".into(), AMQPValue::LongUInt(ttl_ms));
    args.insert(
        "x-dead-letter-exchange".into(),
        AMQPValue::LongString(main.into()),
    );
    args.insert(
        "x-dead-letter-routing-key".into(),
        AMQPValue::LongString(main.into()),
    );
    args
}

async fn declare_bound(
    channel: &Channel,
    name: &str,
    args: FieldTable,
) -> Result<Queue, MqError> {
    channel
        .exchange_declare(
            name,
            ExchangeKind::Direct,
            ExchangeDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await?;
    let queue = channel
        .queue_declare(
            name,
            QueueDeclareOptions {
                durable: true,
                ..Default::default()
            },
            args,
        )
        .await?;
    channel
        .queue_bind(
            name,
            name,
            name,
            QueueBindOptions::default(),
            FieldTable::default(),
        )
        .await?;
    Ok(queue)
}

/// Declare the main queue, dead-lettering rejected messages into `retry`.
pub async fn create_queue(channel: &Channel, main: &str, retry: &str) -> Result<Queue, MqError> {
    let queue = declare_bound(channel, main, main_queue_args(retry)).await?;
    debug!("Declared {} ({} messages ready)", main, queue.message_count());
    Ok(queue)
}

/// Declare the retry queue: messages expire after `ttl_ms` back into `main`.
pub async fn create_retry_queue(
    channel: &Channel,
    retry: &str,
    main: &str,
    ttl_ms: u32,
) -> Result<Queue, MqError> {
    let queue = declare_bound(channel, retry, retry_queue_args(main, ttl_ms)).await?;
    debug!("Declared {} with {}ms TTL", retry, ttl_ms);
    Ok(queue)
}

/// Declare the permanent parking queue on the default exchange.
pub async fn create_dead_letter_queue(channel: &Channel, dead: &str) -> Result<Queue, MqError> {
    Ok(channel
        .queue_declare(
            dead,
            QueueDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await?)
}

/// Declare the full topology for a topic.
pub async fn declare(channel: &Channel, topic: Topic, ttl_ms: u32) -> Result<Topology, MqError> {
    let main = create_queue(channel, topic.main(), topic.retry()).await?;
    let retry = create_retry_queue(channel, topic.retry(), topic.main(), ttl_ms).await?;
    create_dead_letter_queue(channel, topic.dead()).await?;
    info!("Topology ready for {} topic", topic);
    Ok(Topology { topic, main, retry })
}

/// Start delivery from `queue`, at most `prefetch` unacknowledged at a time.
pub async fn create_consumer(
    channel: &Channel,
    queue: &Queue,
    tag: &str,
    prefetch: u16,
) -> Result<Consumer, MqError> {
    channel
        .basic_qos(prefetch, BasicQosOptions::default())
        .await?;
    Ok(channel
        .basic_consume(
            queue.name().as_str(),
            tag,
            BasicConsumeOptions::default(),
            FieldTable::default(),
        )
        .await?)
}

/// Park a message on the dead-letter sink with the reason attached.
pub async fn publish_dead_letter(
    channel: &Channel,
    dead: &str,
    body: &[u8],
    reason: &str,
) -> Result<(), MqError> {
    let mut headers = FieldTable::default();
    headers.insert(
        REASON_HEADER.into(),
        AMQPValue::LongString(reason.into()),
    );
    channel
        .basic_publish(
            "",
            dead,
            BasicPublishOptions::default(),
            body,
            BasicProperties::default()
                .with_delivery_mode(2)
                .with_headers(headers),
        )
        .await?
        .await?;
    Ok(())
}

/// How many times the broker has bounced this message off `queue`,
/// according to the `x-death` history it maintains.
pub fn redelivery_count(headers: Option<&FieldTable>, queue: &str) -> u64 {
    let Some(headers) = headers else {
        return 0;
    };
    let deaths = headers
        .inner()
        .iter()
        .find(|(k, _)| k.as_str() == "x-death")
        .map(|(_, v)| v);
    let Some(AMQPValue::FieldArray(deaths)) = deaths else {
        return 0;
    };
    let wanted = LongString::from(queue);
    deaths
        .as_slice()
        .iter()
        .filter_map(|entry| match entry {
            AMQPValue::FieldTable(t) => Some(t),
            _ => None,
        })
        .filter(|t| {
            t.inner()
                .iter()
                .any(|(k, v)| k.as_str() == "queue" && *v == AMQPValue::LongString(wanted.clone()))
        })
        .filter_map(|t| {
            t.inner()
                .iter()
                .find(|(k, _)| k.as_str() == "count")
                .and_then(|(_, v)| as_count(v))
        })
        .sum()
}

fn as_count(v: &AMQPValue) -> Option<u64> {
    match v {
        AMQPValue::LongLongInt(n) => u64::try_from(*n).ok(),
        AMQPValue::LongInt(n) => u64::try_from(*n).ok(),
        AMQPValue::LongUInt(n) => Some(*n as u64),
        AMQPValue::ShortInt(n) => u64::try_from(*n).ok(),
        AMQPValue::ShortUInt(n) => Some(*n as u64),
        _ => None,
    }
}

pub fn retry_options() -> BasicNackOptions {
    BasicNackOptions {
        requeue: false,
        ..Default::default()
    }
}
