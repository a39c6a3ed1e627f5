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

//! Key to pool mapping with atomic lazy creation

use crate::channel::Channel;
use crate::pool::ChannelPool;
use log::debug;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::hash::Hash;
use std::marker::PhantomData;

/// A key to pool registry that lazily creates exactly one pool per key.
///
/// All channels under the same key are poolable against each other; different keys get
/// fully independent pools. Two tasks racing on the first access of a key both observe
/// the same pool: the loser's freshly built candidate is closed and never exposed.
pub struct PoolRegistry<K, C, P> {
    pools: RwLock<HashMap<K, P>>,
    _channel: PhantomData<fn() -> C>,
}

impl<K, C, P> PoolRegistry<K, C, P>
where
    K: Hash + Eq + Clone,
    C: Channel,
    P: ChannelPool<C> + Clone + 'static,
{
    /// Create a new empty [PoolRegistry].
    pub fn new() -> Self {
        PoolRegistry {
            pools: RwLock::new(HashMap::new()),
            _channel: PhantomData,
        }
    }

    /// Get the pool for `key`, building it via `new_pool` on first access.
    pub fn get(&self, key: &K, new_pool: impl FnOnce() -> P) -> P {
        {
            let pools = self.pools.read();
            if let Some(pool) = pools.get(key) {
                return pool.clone();
            }
        } // read lock released here

        let candidate = new_pool();
        {
            // write lock section
            let mut pools = self.pools.write();
            // check again since another task might have already added it
            if let Some(winner) = pools.get(key) {
                let winner = winner.clone();
                drop(pools);
                // the candidate was never exposed, dispose it off the caller's path
                debug!("lost the pool creation race, disposing the candidate");
                tokio::spawn(async move { candidate.close().await });
                return winner;
            }
            pools.insert(key.clone(), candidate.clone());
            candidate
        }
    }

    /// Detach the pool under `key` and close it asynchronously.
    ///
    /// The close is dispatched to a task of its own, it never blocks the caller.
    /// Returns whether a pool was present.
    pub fn remove(&self, key: &K) -> bool {
        let removed = self.pools.write().remove(key);
        match removed {
            Some(pool) => {
                tokio::spawn(async move { pool.close().await });
                true
            }
            None => false,
        }
    }

    /// Whether a pool exists under `key`.
    pub fn contains(&self, key: &K) -> bool {
        self.pools.read().contains_key(key)
    }

    /// How many pools are currently registered.
    pub fn len(&self) -> usize {
        self.pools.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pools.read().is_empty()
    }

    /// Remove and close every registered pool.
    pub async fn close(&self) {
        let drained: Vec<P> = {
            let mut pools = self.pools.write();
            pools.drain().map(|(_, pool)| pool).collect()
        };
        for pool in drained {
            pool.close().await;
        }
    }
}
