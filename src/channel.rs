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

//! The contracts between the pools and the transport layer

use async_trait::async_trait;
use log::debug;
use pingora_error::Result;
use std::io;

/// The unique ID of a channel, assigned by the transport layer.
pub type ChannelId = u64;

/// An established network connection that can be stored in a pool.
///
/// The pool only needs identity, liveness and a way to tear the connection down; the
/// actual I/O surface stays with the transport layer.
#[async_trait]
pub trait Channel: Send + Sync + 'static {
    /// The unique ID of this channel. IDs must not be reused while the channel is alive.
    fn id(&self) -> ChannelId;

    /// Whether the underlying transport is still open.
    fn is_open(&self) -> bool;

    /// Close the underlying transport.
    async fn close(&self) -> io::Result<()>;
}

/// Establishes brand new [Channel]s for a pool on acquire misses.
#[async_trait]
pub trait Connector<C: Channel>: Send + Sync {
    async fn connect(&self) -> Result<C>;
}

/// Decides whether an idle [Channel] is still usable.
///
/// `Ok(false)` and `Err(_)` are both treated as "discard this channel": during acquire
/// the pool closes it and transparently retries, during release the channel is closed
/// and not returned to the idle store.
#[async_trait]
pub trait HealthCheck<C: Channel>: Send + Sync {
    async fn check(&self, channel: &C) -> Result<bool>;
}

/// The default [HealthCheck]: a channel is healthy iff its transport is open.
pub struct OpenCheck;

#[async_trait]
impl<C: Channel> HealthCheck<C> for OpenCheck {
    async fn check(&self, channel: &C) -> Result<bool> {
        Ok(channel.is_open())
    }
}

/// Synchronous, fire-and-forget hooks into the lifecycle of pooled channels.
///
/// All hooks default to no-ops. They run inline on the pool's call path, so
/// implementations should be cheap and must not block.
pub trait PoolObserver<C: Channel>: Send + Sync {
    /// A brand new channel was established on behalf of an acquire.
    fn created(&self, _channel: &C) {}
    /// An idle channel passed its health check and is being handed out.
    fn acquired(&self, _channel: &C) {}
    /// A channel was returned to the idle store.
    fn released(&self, _channel: &C) {}
}

/// The default [PoolObserver] that observes nothing.
pub struct NoopObserver;

impl<C: Channel> PoolObserver<C> for NoopObserver {}

/// Close a channel, ignoring individual close errors.
pub(crate) async fn close_channel<C: Channel>(channel: &C) {
    if let Err(e) = channel.close().await {
        debug!("error closing channel {}: {}", channel.id(), e);
    }
}
