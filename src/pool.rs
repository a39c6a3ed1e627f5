// Copyright 2024 Cloudflare, Inc.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The base reuse-or-create channel store

use crate::channel::{close_channel, Channel, ChannelId, Connector, HealthCheck, PoolObserver};
use crate::channel::{NoopObserver, OpenCheck};
use crate::error::{CHANNEL_NOT_OWNED, POOL_FULL};
use async_trait::async_trait;
use log::{debug, warn};
use parking_lot::Mutex;
use pingora_error::{Error, Result};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

/// The capability shared by every pool flavor.
///
/// [crate::BoundedPool] composes a [SimplePool] behind this interface instead of
/// specializing it, and [crate::PoolRegistry] manages any implementor.
#[async_trait]
pub trait ChannelPool<C: Channel>: Send + Sync {
    /// Hand out a ready-to-use channel, reusing an idle one when possible.
    async fn acquire(&self) -> Result<C>;

    /// Return a previously acquired channel.
    ///
    /// `Ok(true)` means the channel went back to the idle store, `Ok(false)` means it
    /// was released but discarded as unhealthy.
    async fn release(&self, channel: C) -> Result<bool>;

    /// Drain the pool and close the idle channels.
    async fn close(&self);
}

/// In which order idle channels are handed back out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorePolicy {
    /// Most recently released first. Favors warm connections.
    Lifo,
    /// Least recently released first. Favors even usage across connections.
    Fifo,
}

/// The options to configure a [SimplePool]
pub struct PoolOptions<C: Channel> {
    /// The order idle channels are reused in.
    pub store_policy: StorePolicy,
    /// Health check a channel before storing it back for reuse.
    ///
    /// When disabled, released channels are stored unconditionally.
    pub check_on_release: bool,
    /// How many idle channels the store keeps. `None` means unbounded.
    pub max_idle: Option<usize>,
    /// Decides whether an idle channel is still usable.
    pub health: Arc<dyn HealthCheck<C>>,
    /// Lifecycle hooks.
    pub observer: Arc<dyn PoolObserver<C>>,
}

impl<C: Channel> Default for PoolOptions<C> {
    fn default() -> Self {
        PoolOptions {
            store_policy: StorePolicy::Lifo,
            check_on_release: true,
            max_idle: None,
            health: Arc::new(OpenCheck),
            observer: Arc::new(NoopObserver),
        }
    }
}

struct PoolInner<C: Channel> {
    connector: Arc<dyn Connector<C>>,
    opts: PoolOptions<C>,
    store: Mutex<VecDeque<C>>,
    // the owner markers: IDs of the channels this pool handed out and not yet took back
    owned: Mutex<HashSet<ChannelId>>,
}

/// The base reusable channel store: acquire reuses an idle channel or establishes a new
/// one, release health-gates the channel back into the store.
///
/// [SimplePool] is a cheap handle; clones share the same store.
pub struct SimplePool<C: Channel> {
    inner: Arc<PoolInner<C>>,
}

impl<C: Channel> Clone for SimplePool<C> {
    fn clone(&self) -> Self {
        SimplePool {
            inner: self.inner.clone(),
        }
    }
}

impl<C: Channel> SimplePool<C> {
    /// Create a new [SimplePool] with default [PoolOptions].
    pub fn new(connector: Arc<dyn Connector<C>>) -> Self {
        Self::with_options(connector, PoolOptions::default())
    }

    /// Create a new [SimplePool] with the given [PoolOptions].
    pub fn with_options(connector: Arc<dyn Connector<C>>, opts: PoolOptions<C>) -> Self {
        SimplePool {
            inner: Arc::new(PoolInner {
                connector,
                opts,
                store: Mutex::new(VecDeque::new()),
                owned: Mutex::new(HashSet::new()),
            }),
        }
    }

    /// How many idle channels are currently stored.
    pub fn idle_count(&self) -> usize {
        self.inner.store.lock().len()
    }

    fn pop_idle(&self) -> Option<C> {
        let mut store = self.inner.store.lock();
        match self.inner.opts.store_policy {
            StorePolicy::Lifo => store.pop_back(),
            StorePolicy::Fifo => store.pop_front(),
        }
    }

    fn mark_owned(&self, channel: &C) {
        self.inner.owned.lock().insert(channel.id());
    }

    // Clear the owner marker. Returns false if this pool does not own the channel, which
    // also catches two callers racing to release the same channel: only one of them can
    // remove the marker.
    fn unmark_owned(&self, channel: &C) -> bool {
        self.inner.owned.lock().remove(&channel.id())
    }

    /// Hand out a ready-to-use channel: reuse a healthy idle one, or establish a new
    /// one on a miss. Stale idle channels are closed and transparently skipped.
    pub async fn acquire(&self) -> Result<C> {
        loop {
            let Some(channel) = self.pop_idle() else {
                let channel = self.inner.connector.connect().await?;
                self.mark_owned(&channel);
                self.inner.opts.observer.created(&channel);
                debug!("established new channel {}", channel.id());
                return Ok(channel);
            };
            match self.inner.opts.health.check(&channel).await {
                Ok(true) => {
                    self.mark_owned(&channel);
                    self.inner.opts.observer.acquired(&channel);
                    debug!("reusing idle channel {}", channel.id());
                    return Ok(channel);
                }
                Ok(false) => {
                    debug!("idle channel {} went stale, discarding", channel.id());
                    close_channel(&channel).await;
                }
                Err(e) => {
                    warn!("health check failed on channel {}: {}", channel.id(), e);
                    close_channel(&channel).await;
                }
            }
            // retry with the next idle channel, or a fresh connect
        }
    }

    /// Return a previously acquired channel to the idle store.
    ///
    /// `Ok(false)` means the channel was released but discarded as unhealthy. Releasing
    /// a channel this pool does not own fails with [CHANNEL_NOT_OWNED] and force closes
    /// the channel.
    pub async fn release(&self, channel: C) -> Result<bool> {
        if !self.unmark_owned(&channel) {
            warn!(
                "channel {} released to a pool that does not own it, closing it",
                channel.id()
            );
            close_channel(&channel).await;
            return Error::e_explain(CHANNEL_NOT_OWNED, "channel is not owned by this pool");
        }
        if self.inner.opts.check_on_release {
            let healthy = self.inner.opts.health.check(&channel).await;
            match healthy {
                Ok(true) => (),
                Ok(false) => {
                    debug!("released channel {} is unhealthy, closing", channel.id());
                    close_channel(&channel).await;
                    return Ok(false);
                }
                Err(e) => {
                    warn!(
                        "health check failed on released channel {}: {}",
                        channel.id(),
                        e
                    );
                    close_channel(&channel).await;
                    return Ok(false);
                }
            }
        }
        {
            let mut store = self.inner.store.lock();
            let full = self
                .inner
                .opts
                .max_idle
                .is_some_and(|max| store.len() >= max);
            if !full {
                self.inner.opts.observer.released(&channel);
                store.push_back(channel);
                return Ok(true);
            }
        }
        warn!("idle store is full, closing channel {}", channel.id());
        close_channel(&channel).await;
        Error::e_explain(POOL_FULL, "idle store is at capacity")
    }

    /// Drain the store and close every idle channel, ignoring individual close errors.
    pub async fn close(&self) {
        let drained: Vec<C> = {
            let mut store = self.inner.store.lock();
            store.drain(..).collect()
        };
        for channel in drained {
            close_channel(&channel).await;
        }
    }
}

#[async_trait]
impl<C: Channel> ChannelPool<C> for SimplePool<C> {
    async fn acquire(&self) -> Result<C> {
        SimplePool::acquire(self).await
    }

    async fn release(&self, channel: C) -> Result<bool> {
        SimplePool::release(self, channel).await
    }

    async fn close(&self) {
        SimplePool::close(self).await
    }
}
