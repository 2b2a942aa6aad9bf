//! Fixed-size pool of broker channels multiplexed over one connection.
//!
//! Callers check a channel out with [`ChannelPool::get_free_channel`] and
//! get it back automatically when the [`PooledChannel`] guard drops.  A
//! channel that is no longer usable (closed by the broker after an error)
//! is discarded on return and its slot is reopened on a later checkout.

use std::ops::Deref;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use lapin::Connection;
use log::{debug, warn};
use tokio::time::sleep;

use super::MqError;

/// Something that can open broker channels.
#[async_trait]
pub trait ChannelFactory: Send + Sync + 'static {
    type Channel: Send + Sync + 'static;

    async fn open(&self) -> Result<Self::Channel, MqError>;

    fn is_usable(channel: &Self::Channel) -> bool;
}

#[async_trait]
impl ChannelFactory for Connection {
    type Channel = lapin::Channel;

    async fn open(&self) -> Result<lapin::Channel, MqError> {
        Ok(self.create_channel().await?)
    }

    fn is_usable(channel: &lapin::Channel) -> bool {
        channel.status().connected()
    }
}

struct Slots<C> {
    idle: Vec<C>,
    /// Channels currently open, idle or checked out.
    open: usize,
}

pub struct ChannelPool<F: ChannelFactory> {
    factory: F,
    size: usize,
    retry_factor: u32,
    retry_delay: Duration,
    slots: Mutex<Slots<F::Channel>>,
}

impl<F: ChannelFactory> ChannelPool<F> {
    /// Open `size` channels up front.  Failing to do so is fatal at startup.
    pub async fn create(
        size: usize,
        retry_factor: u32,
        retry_delay: Duration,
        factory: F,
    ) -> Result<Arc<Self>, MqError> {
        let mut idle = Vec::with_capacity(size);
        for _ in 0..size {
            idle.push(factory.open().await?);
        }
        debug!("Opened {} broker channels", size);
        Ok(Arc::new(Self {
            factory,
            size,
            retry_factor,
            retry_delay,
            slots: Mutex::new(Slots { open: idle.len(), idle }),
        }))
    }

    fn slots(&self) -> MutexGuard<'_, Slots<F::Channel>> {
        // A panic while holding this lock leaves the counters intact.
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Check out a channel, waiting and retrying up to `retry_factor`
    /// times when every channel is busy.
    pub async fn get_free_channel(self: &Arc<Self>) -> Result<PooledChannel<F>, MqError> {
        for attempt in 0..=self.retry_factor {
            let reserved = {
                let mut slots = self.slots();
                loop {
                    match slots.idle.pop() {
                        Some(ch) if F::is_usable(&ch) => {
                            return Ok(PooledChannel::new(self.clone(), ch));
                        }
                        Some(_) => {
                            debug!("Dropping closed broker channel");
                            slots.open -= 1;
                        }
                        None => break,
                    }
                }
                if slots.open < self.size {
                    slots.open += 1;
                    true
                } else {
                    false
                }
            };

            if reserved {
                match self.factory.open().await {
                    Ok(ch) => return Ok(PooledChannel::new(self.clone(), ch)),
                    Err(e) => {
                        warn!("Failed to open replacement channel: {}", e);
                        self.slots().open -= 1;
                    }
                }
            }

            if attempt < self.retry_factor {
                sleep(self.retry_delay * (attempt + 1)).await;
            }
        }

        Err(MqError::PoolExhausted {
            size: self.size,
            attempts: self.retry_factor + 1,
        })
    }

    /// Number of channels checked out right now.
    pub fn in_use(&self) -> usize {
        let slots = self.slots();
        slots.open - slots.idle.len()
    }

    fn give_back(&self, channel: F::Channel, discard: bool) {
        let mut slots = self.slots();
        if discard || !F::is_usable(&channel) {
            slots.open -= 1;
        } else {
            slots.idle.push(channel);
        }
    }
}

/// A checked-out channel; returns itself to the pool on drop.
pub struct PooledChannel<F: ChannelFactory> {
    pool: Arc<ChannelPool<F>>,
    channel: Option<F::Channel>,
    discard: bool,
}

impl<F: ChannelFactory> PooledChannel<F> {
    fn new(pool: Arc<ChannelPool<F>>, channel: F::Channel) -> Self {
        Self {
            pool,
            channel: Some(channel),
            discard: false,
        }
    }

    /// Mark the channel as broken so it is replaced instead of reused.
    pub fn discard(mut self) {
        self.discard = true;
    }
}

impl<F: ChannelFactory> Deref for PooledChannel<F> {
    type Target = F::Channel;

    fn deref(&self) -> &F::Channel {
        // Only taken in Drop.
        match &self.channel {
            Some(ch) => ch,
            None => unreachable!("pooled channel used after release"),
        }
    }
}

impl<F: ChannelFactory> Drop for PooledChannel<F> {
    fn drop(&mut self) {
        if let Some(ch) = self.channel.take() {
            self.pool.give_back(ch, self.discard);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct FakeChannel {
        id: usize,
        alive: Arc<AtomicBool>,
    }

    #[derive(Default)]
    struct FakeConnection {
        opened: AtomicUsize,
        refuse: AtomicBool,
    }

    #[async_trait]
    impl ChannelFactory for FakeConnection {
        type Channel = FakeChannel;

        async fn open(&self) -> Result<FakeChannel, MqError> {
            if self.refuse.load(Ordering::SeqCst) {
                return Err(MqError::Closed);
            }
            let id = self.opened.fetch_add(1, Ordering::SeqCst);
            Ok(FakeChannel {
                id,
                alive: Arc::new(AtomicBool::new(true)),
            })
        }

        fn is_usable(channel: &FakeChannel) -> bool {
            channel.alive.load(Ordering::SeqCst)
        }
    }

    async fn pool(size: usize, retries: u32) -> Arc<ChannelPool<FakeConnection>> {
        ChannelPool::create(size, retries, Duration::from_millis(1), FakeConnection::default())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn hands_out_distinct_channels() {
        let pool = pool(3, 0).await;
        let a = pool.get_free_channel().await.unwrap();
        let b = pool.get_free_channel().await.unwrap();
        let c = pool.get_free_channel().await.unwrap();
        let mut ids = vec![a.id, b.id, c.id];
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 3);
        assert_eq!(pool.in_use(), 3);
    }

    #[tokio::test]
    async fn exhaustion_after_retries() {
        let pool = pool(1, 2).await;
        let _held = pool.get_free_channel().await.unwrap();
        match pool.get_free_channel().await {
            Err(MqError::PoolExhausted { size, attempts }) => {
                assert_eq!(size, 1);
                assert_eq!(attempts, 3);
            }
            Err(e) => panic!("unexpected error {}", e),
            Ok(_) => panic!("pool handed out a busy channel"),
        }
    }

    #[tokio::test]
    async fn returned_channel_is_reused() {
        let pool = pool(1, 0).await;
        let first = pool.get_free_channel().await.unwrap().id;
        let again = pool.get_free_channel().await.unwrap().id;
        assert_eq!(first, again);
        assert_eq!(pool.in_use(), 0);
    }

    #[tokio::test]
    async fn waiter_gets_channel_released_during_retry() {
        let pool = ChannelPool::create(1, 5, Duration::from_millis(20), FakeConnection::default())
            .await
            .unwrap();
        let held = pool.get_free_channel().await.unwrap();
        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.get_free_channel().await.map(|c| c.id) })
        };
        sleep(Duration::from_millis(5)).await;
        let id = held.id;
        drop(held);
        assert_eq!(waiter.await.unwrap().unwrap(), id);
    }

    #[tokio::test]
    async fn broken_channels_are_replaced() {
        let pool = pool(1, 0).await;
        let ch = pool.get_free_channel().await.unwrap();
        let old = ch.id;
        ch.alive.store(false, Ordering::SeqCst);
        drop(ch);
        let fresh = pool.get_free_channel().await.unwrap();
        assert_ne!(fresh.id, old);
        drop(fresh);

        let ch = pool.get_free_channel().await.unwrap();
        let kept = ch.id;
        ch.discard();
        assert_ne!(pool.get_free_channel().await.unwrap().id, kept);
    }

    #[tokio::test]
    async fn open_failure_frees_the_slot() {
        let pool = pool(1, 1).await;
        let ch = pool.get_free_channel().await.unwrap();
        ch.alive.store(false, Ordering::SeqCst);
        drop(ch);
        pool.factory.refuse.store(true, Ordering::SeqCst);
        assert!(pool.get_free_channel().await.is_err());
        pool.factory.refuse.store(false, Ordering::SeqCst);
        assert!(pool.get_free_channel().await.is_ok());
    }
}
