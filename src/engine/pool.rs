use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use anyhow::{bail, Result};
use async_trait::async_trait;
use tokio::sync::Mutex;

/// An item that can live in a pool: it is wiped between borrowers and torn
/// down when the pool lets go of it.
#[async_trait]
pub trait Recyclable: Send + Sync + 'static {
    async fn reset(&self) -> Result<()>;
    async fn destroy(&self);
}

#[async_trait]
pub trait ItemBuilder: Send + Sync + 'static {
    type Item: Recyclable;

    async fn build(&self) -> Result<Self::Item>;
}

/// Bounded LIFO pool. `acquire` pops the most recently returned item or
/// builds a fresh one; `release` resets and returns it, destroying it if the
/// reset fails; `shutdown` drains everything and poisons further acquires.
pub struct Pool<B: ItemBuilder> {
    builder: B,
    free: Mutex<Vec<B::Item>>,
    closed: AtomicBool,
    live: AtomicUsize,
}

impl<B: ItemBuilder> Pool<B> {
    pub fn new(builder: B) -> Self {
        Self {
            builder,
            free: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            live: AtomicUsize::new(0),
        }
    }

    pub async fn acquire(&self) -> Result<B::Item> {
        if self.closed.load(Ordering::Acquire) {
            bail!("pool is shut down");
        }
        if let Some(item) = self.free.lock().await.pop() {
            return Ok(item);
        }
        // no lock held while building
        let item = self.builder.build().await?;
        self.live.fetch_add(1, Ordering::AcqRel);
        Ok(item)
    }

    pub async fn release(&self, item: B::Item) {
        if let Err(err) = item.reset().await {
            tracing::warn!(error = %err, "pool item reset failed, destroying");
            self.discard(item).await;
            return;
        }
        let mut free = self.free.lock().await;
        if self.closed.load(Ordering::Acquire) {
            drop(free);
            self.discard(item).await;
            return;
        }
        free.push(item);
    }

    pub async fn discard(&self, item: B::Item) {
        item.destroy().await;
        self.live.fetch_sub(1, Ordering::AcqRel);
    }

    /// Builds `n` items up front so the first requests do not pay the
    /// construction latency.
    pub async fn prefork(&self, n: usize) -> Result<()> {
        let mut warmed = Vec::with_capacity(n);
        for _ in 0..n {
            warmed.push(self.acquire().await?);
        }
        for item in warmed {
            self.release(item).await;
        }
        Ok(())
    }

    pub async fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        let drained = std::mem::take(&mut *self.free.lock().await);
        for item in drained {
            self.discard(item).await;
        }
    }

    /// Items built and not yet destroyed, idle or borrowed.
    pub fn live_count(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    pub async fn idle_count(&self) -> usize {
        self.free.lock().await.len()
    }
}
