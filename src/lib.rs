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

//! Bounded channel pooling with backpressure
//!
//! This crate provides reuse of established channels (connections) so that callers can
//! acquire a ready-to-use channel without paying the full connect cost on every request.
//! [SimplePool] is the base reuse-or-create store, [BoundedPool] adds a hard cap on
//! concurrently acquired channels plus a bounded FIFO of waiting acquires, and
//! [PoolRegistry] multiplexes many independent pools under one key space.

#![warn(clippy::all)]
#![allow(clippy::new_without_default)]

mod bounded;
mod channel;
mod error;
mod pool;
mod registry;

pub use bounded::{BoundedOptions, BoundedPool, TimeoutPolicy};
pub use channel::{
    Channel, ChannelId, Connector, HealthCheck, NoopObserver, OpenCheck, PoolObserver,
};
pub use error::{
    ACQUIRE_TIMEDOUT, CHANNEL_NOT_OWNED, INVALID_POOL_CONFIG, POOL_CLOSED, POOL_FULL,
    TOO_MANY_PENDING_ACQUIRES,
};
pub use pool::{ChannelPool, PoolOptions, SimplePool, StorePolicy};
pub use registry::PoolRegistry;

#[cfg(test)]
pub(crate) mod test_support;
