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

//! Bounded pool with a hard cap on acquired channels and backpressure on acquire

use crate::channel::{close_channel, Channel, Connector};
use crate::error::{ACQUIRE_TIMEDOUT, INVALID_POOL_CONFIG, POOL_CLOSED, TOO_MANY_PENDING_ACQUIRES};
use crate::error::CHANNEL_NOT_OWNED;
use crate::pool::{ChannelPool, PoolOptions, SimplePool};
use async_trait::async_trait;
use log::debug;
use parking_lot::Mutex;
use pingora_error::{Error, Result};
use pingora_timeout::sleep;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

// The timer wheel buckets deadlines at a 10ms resolution. A waiter whose deadline is
// within one bucket of now belongs to the firing that woke us up.
const TIMER_SLACK: Duration = Duration::from_millis(10);

/// What happens to a queued acquire once its timeout fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutPolicy {
    /// Fail the waiting acquire with [ACQUIRE_TIMEDOUT].
    Fail,
    /// Stop waiting for a slot and establish a new channel for the waiter instead.
    ///
    /// This takes a slot without waiting for one to free, so the acquired count can
    /// transiently exceed `max_connections` until the extra channels are released.
    NewConnection,
}

/// The options to configure a [BoundedPool]
pub struct BoundedOptions<C: Channel> {
    /// Options for the underlying channel store.
    pub pool: PoolOptions<C>,
    /// Hard cap on concurrently acquired channels. Must be at least 1.
    pub max_connections: usize,
    /// How many acquires may wait for a free slot. `None` means unbounded.
    pub max_pending_acquires: Option<usize>,
    /// How long a queued acquire may wait. `None` means wait forever.
    pub acquire_timeout: Option<Duration>,
    /// What to do when a queued acquire times out. Required iff a timeout is set.
    pub timeout_policy: Option<TimeoutPolicy>,
}

impl<C: Channel> BoundedOptions<C> {
    /// Create [BoundedOptions] with the given cap, no acquire timeout and an unbounded
    /// pending queue.
    pub fn new(max_connections: usize) -> Self {
        BoundedOptions {
            pool: PoolOptions::default(),
            max_connections,
            max_pending_acquires: None,
            acquire_timeout: None,
            timeout_policy: None,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.max_connections == 0 {
            return Error::e_explain(INVALID_POOL_CONFIG, "max_connections must be at least 1");
        }
        if self.max_pending_acquires == Some(0) {
            return Error::e_explain(
                INVALID_POOL_CONFIG,
                "max_pending_acquires must be at least 1",
            );
        }
        if self.acquire_timeout.is_some() && self.timeout_policy.is_none() {
            return Error::e_explain(
                INVALID_POOL_CONFIG,
                "acquire_timeout requires a timeout_policy",
            );
        }
        if self.timeout_policy.is_some() && self.acquire_timeout.is_none() {
            return Error::e_explain(
                INVALID_POOL_CONFIG,
                "timeout_policy requires an acquire_timeout",
            );
        }
        Ok(())
    }
}

// A not-yet-serviced acquire waiting for a free slot.
struct Waiter<C> {
    promise: oneshot::Sender<Result<C>>,
    deadline: Option<Instant>,
    // the scheduled timeout. Aborting an already finished task is a no-op, so
    // cancellation is idempotent.
    timer: Option<JoinHandle<()>>,
}

impl<C> Waiter<C> {
    fn cancel_timer(&self) {
        if let Some(timer) = &self.timer {
            timer.abort();
        }
    }
}

struct State<C> {
    acquired: usize,
    // serviced strictly in enqueue order; deadlines are non-decreasing by construction
    waiters: VecDeque<Waiter<C>>,
    closed: bool,
}

struct BoundedInner<C: Channel> {
    pool: SimplePool<C>,
    max_connections: usize,
    max_pending_acquires: Option<usize>,
    // validated together: a deadline only ever exists along with a policy
    acquire_timeout: Option<(Duration, TimeoutPolicy)>,
    state: Mutex<State<C>>,
}

/// A pool with a hard cap on concurrently acquired channels.
///
/// Once `max_connections` channels are out, further acquires queue up (bounded by
/// `max_pending_acquires`) and are serviced strictly in FIFO order as releases free
/// slots. A queued acquire can optionally time out, either failing or cutting its wait
/// short with a brand new connection, per [TimeoutPolicy].
///
/// [BoundedPool] is a cheap handle; clones share the same pool.
pub struct BoundedPool<C: Channel> {
    inner: Arc<BoundedInner<C>>,
}

impl<C: Channel> std::fmt::Debug for BoundedPool<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundedPool").finish_non_exhaustive()
    }
}

impl<C: Channel> Clone for BoundedPool<C> {
    fn clone(&self) -> Self {
        BoundedPool {
            inner: self.inner.clone(),
        }
    }
}

impl<C: Channel> BoundedPool<C> {
    /// Create a new [BoundedPool].
    ///
    /// Fails with [INVALID_POOL_CONFIG] on an invalid option combination, see
    /// [BoundedOptions].
    pub fn new(connector: Arc<dyn Connector<C>>, opts: BoundedOptions<C>) -> Result<Self> {
        opts.validate()?;
        let BoundedOptions {
            pool,
            max_connections,
            max_pending_acquires,
            acquire_timeout,
            timeout_policy,
        } = opts;
        Ok(BoundedPool {
            inner: Arc::new(BoundedInner {
                pool: SimplePool::with_options(connector, pool),
                max_connections,
                max_pending_acquires,
                acquire_timeout: acquire_timeout.zip(timeout_policy),
                state: Mutex::new(State {
                    acquired: 0,
                    waiters: VecDeque::new(),
                    closed: false,
                }),
            }),
        })
    }

    /// How many channels are currently acquired from this pool.
    pub fn acquired_count(&self) -> usize {
        self.inner.state.lock().acquired
    }

    /// How many acquires are currently queued waiting for a slot.
    pub fn pending_acquire_count(&self) -> usize {
        self.inner.state.lock().waiters.len()
    }

    /// How many idle channels are stored for reuse.
    pub fn idle_count(&self) -> usize {
        self.inner.pool.idle_count()
    }

    /// Hand out a channel, waiting for a free slot if the pool is at capacity.
    pub async fn acquire(&self) -> Result<C> {
        let waiting = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return Error::e_explain(POOL_CLOSED, "acquire on a closed pool");
            }
            if state.acquired < self.inner.max_connections {
                state.acquired += 1;
                None
            } else {
                if let Some(max) = self.inner.max_pending_acquires {
                    if state.waiters.len() >= max {
                        return Error::e_explain(
                            TOO_MANY_PENDING_ACQUIRES,
                            "pending acquire queue is at capacity",
                        );
                    }
                }
                let (promise, waiting) = oneshot::channel();
                let deadline;
                let timer;
                match self.inner.acquire_timeout {
                    Some((timeout, _)) => {
                        deadline = Some(Instant::now() + timeout);
                        let pool = self.clone();
                        timer = Some(tokio::spawn(async move {
                            sleep(timeout).await;
                            pool.expire_waiters();
                        }));
                    }
                    None => {
                        deadline = None;
                        timer = None;
                    }
                }
                state.waiters.push_back(Waiter {
                    promise,
                    deadline,
                    timer,
                });
                Some(waiting)
            }
        }; // state lock released here

        match waiting {
            None => self.acquire_with_slot().await,
            Some(waiting) => match waiting.await {
                Ok(result) => result,
                // the promise can only disappear unfulfilled if the pool was dropped
                Err(_) => Error::e_explain(POOL_CLOSED, "pool went away while waiting"),
            },
        }
    }

    /// Return a previously acquired channel and wake up the next waiter if its slot
    /// freed up.
    pub async fn release(&self, channel: C) -> Result<bool> {
        if self.inner.state.lock().closed {
            // closing always wins over a racing release
            close_channel(&channel).await;
            return Error::e_explain(POOL_CLOSED, "release on a closed pool");
        }
        let result = self.inner.pool.release(channel).await;
        match &result {
            // re-pooled, discarded as unhealthy, or closed because the store was
            // full: the slot is free either way
            Ok(_) => self.free_slot(),
            Err(e) if e.etype() == &CHANNEL_NOT_OWNED => (), // the caller held no slot
            Err(_) => self.free_slot(),
        }
        if self.inner.state.lock().closed {
            // the pool closed while the channel was on its way back, do not let it
            // linger in the idle store
            self.inner.pool.close().await;
            return Error::e_explain(POOL_CLOSED, "pool closed during release");
        }
        result
    }

    /// Close the pool: fail all queued acquires, reset the acquired count and close all
    /// idle channels. Closing an already closed pool is a no-op.
    pub async fn close(&self) {
        let waiters = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.acquired = 0;
            std::mem::take(&mut state.waiters)
        };
        for waiter in waiters {
            waiter.cancel_timer();
            let _ = waiter
                .promise
                .send(Error::e_explain(POOL_CLOSED, "pool closed"));
        }
        self.inner.pool.close().await;
    }

    // Acquire from the base pool with a slot already reserved. A failure hands the slot
    // back and wakes a waiter: the freed slot may let a queued acquire through.
    async fn acquire_with_slot(&self) -> Result<C> {
        match self.inner.pool.acquire().await {
            Ok(channel) => Ok(channel),
            Err(e) => {
                self.free_slot();
                Err(e)
            }
        }
    }

    fn free_slot(&self) {
        {
            let mut state = self.inner.state.lock();
            if state.closed {
                return; // close already reset the counters
            }
            state.acquired = state.acquired.saturating_sub(1);
        }
        self.service_waiters();
    }

    // Hand freed slots to queued acquires, strictly in FIFO order.
    fn service_waiters(&self) {
        let mut serviced = Vec::new();
        {
            let mut state = self.inner.state.lock();
            if state.closed {
                return;
            }
            while state.acquired < self.inner.max_connections {
                let Some(waiter) = state.waiters.pop_front() else {
                    break;
                };
                waiter.cancel_timer();
                state.acquired += 1;
                serviced.push(waiter.promise);
            }
        }
        for promise in serviced {
            self.acquire_for(promise);
        }
    }

    // Run an acquire on a waiter's behalf and bridge the result into its promise.
    fn acquire_for(&self, promise: oneshot::Sender<Result<C>>) {
        let pool = self.clone();
        tokio::spawn(async move {
            let result = pool.acquire_with_slot().await;
            if let Err(result) = promise.send(result) {
                // the waiter gave up on its acquire future; hand the channel back so
                // neither it nor the slot leaks
                if let Ok(channel) = result {
                    debug!("waiter went away, recycling channel {}", channel.id());
                    let _ = pool.release(channel).await;
                }
            }
        });
    }

    // A timeout fired: deal with every waiter whose deadline has passed. Waiters are
    // queued with non-decreasing deadlines, so scanning stops at the first one still in
    // time.
    fn expire_waiters(&self) {
        let now = Instant::now() + TIMER_SLACK;
        let mut timed_out = Vec::new();
        let mut renewed = Vec::new();
        {
            let mut state = self.inner.state.lock();
            if state.closed {
                return;
            }
            while let Some(waiter) = state.waiters.front() {
                match waiter.deadline {
                    Some(deadline) if deadline <= now => {
                        // unwrap is safe, front() just returned it
                        let waiter = state.waiters.pop_front().unwrap();
                        waiter.cancel_timer();
                        // the deadline only exists together with the policy
                        match self.inner.acquire_timeout {
                            Some((_, TimeoutPolicy::Fail)) => timed_out.push(waiter.promise),
                            Some((_, TimeoutPolicy::NewConnection)) => {
                                state.acquired += 1;
                                renewed.push(waiter.promise);
                            }
                            None => break,
                        }
                    }
                    _ => break,
                }
            }
        }
        for promise in timed_out {
            debug!("queued acquire timed out");
            let _ = promise.send(Error::e_explain(
                ACQUIRE_TIMEDOUT,
                "timed out waiting for a free slot",
            ));
        }
        for promise in renewed {
            debug!("queued acquire timed out, establishing a new channel for it");
            self.acquire_for(promise);
        }
    }
}

#[async_trait]
impl<C: Channel> ChannelPool<C> for BoundedPool<C> {
    async fn acquire(&self) -> Result<C> {
        BoundedPool::acquire(self).await
    }

    async fn release(&self, channel: C) -> Result<bool> {
        BoundedPool::release(self, channel).await
    }

    async fn close(&self) {
        BoundedPool::close(self).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{TestChannel, TestConnector};
    use pingora_error::ErrorType;
    use tokio::time::sleep as test_sleep;
    use tokio_test::{assert_err, assert_ok};

    fn bounded(opts: BoundedOptions<TestChannel>) -> (BoundedPool<TestChannel>, Arc<TestConnector>)
    {
        let connector = Arc::new(TestConnector::new());
        let pool = BoundedPool::new(connector.clone(), opts).unwrap();
        (pool, connector)
    }

    #[test]
    fn test_option_validation() {
        let connector = Arc::new(TestConnector::new());

        let err = BoundedPool::new(connector.clone(), BoundedOptions::new(0)).unwrap_err();
        assert_eq!(err.etype(), &INVALID_POOL_CONFIG);

        let mut opts = BoundedOptions::new(1);
        opts.max_pending_acquires = Some(0);
        let err = BoundedPool::new(connector.clone(), opts).unwrap_err();
        assert_eq!(err.etype(), &INVALID_POOL_CONFIG);

        let mut opts = BoundedOptions::new(1);
        opts.acquire_timeout = Some(Duration::from_millis(100));
        let err = BoundedPool::new(connector.clone(), opts).unwrap_err();
        assert_eq!(err.etype(), &INVALID_POOL_CONFIG);

        let mut opts = BoundedOptions::new(1);
        opts.timeout_policy = Some(TimeoutPolicy::Fail);
        let err = BoundedPool::new(connector.clone(), opts).unwrap_err();
        assert_eq!(err.etype(), &INVALID_POOL_CONFIG);

        let mut opts = BoundedOptions::new(1);
        opts.acquire_timeout = Some(Duration::from_millis(100));
        opts.timeout_policy = Some(TimeoutPolicy::Fail);
        assert!(BoundedPool::new(connector, opts).is_ok());
    }

    #[tokio::test]
    async fn test_capacity_cap() {
        let (pool, connector) = bounded(BoundedOptions::new(2));

        let c1 = assert_ok!(pool.acquire().await);
        let c2 = assert_ok!(pool.acquire().await);
        assert_eq!(pool.acquired_count(), 2);
        assert_eq!(connector.connected(), 2);

        assert_ok!(pool.release(c1).await);
        assert_eq!(pool.acquired_count(), 1);
        let c3 = assert_ok!(pool.acquire().await);
        assert_eq!(pool.acquired_count(), 2);
        assert_eq!(connector.connected(), 2); // c3 is a reuse, the cap held

        assert_ok!(pool.release(c2).await);
        assert_ok!(pool.release(c3).await);
        assert_eq!(pool.acquired_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_backpressure() {
        let mut opts = BoundedOptions::new(1);
        opts.max_pending_acquires = Some(1);
        let (pool, _) = bounded(opts);

        let c1 = assert_ok!(pool.acquire().await);
        let id1 = c1.id();

        // second acquire pends on the single slot
        let pending = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await })
        };
        while pool.pending_acquire_count() == 0 {
            test_sleep(Duration::from_millis(10)).await;
        }

        // third acquire overflows the pending queue
        let err = assert_err!(pool.acquire().await);
        assert_eq!(err.etype(), &TOO_MANY_PENDING_ACQUIRES);

        // releasing the held channel services the queued acquire with the same channel
        assert_ok!(pool.release(c1).await);
        let c2 = assert_ok!(pending.await.unwrap());
        assert_eq!(c2.id(), id1);
        assert_eq!(pool.acquired_count(), 1);
        assert_eq!(pool.pending_acquire_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_timeout_fail() {
        let mut opts = BoundedOptions::new(1);
        opts.acquire_timeout = Some(Duration::from_millis(200));
        opts.timeout_policy = Some(TimeoutPolicy::Fail);
        let (pool, _) = bounded(opts);

        let _held = assert_ok!(pool.acquire().await);

        let start = Instant::now();
        let err = assert_err!(pool.acquire().await);
        assert_eq!(err.etype(), &ACQUIRE_TIMEDOUT);
        assert!(start.elapsed() >= Duration::from_millis(150));
        // the failed waiter did not touch the slot count
        assert_eq!(pool.acquired_count(), 1);
        assert_eq!(pool.pending_acquire_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_timeout_new_connection() {
        let mut opts = BoundedOptions::new(1);
        opts.acquire_timeout = Some(Duration::from_millis(200));
        opts.timeout_policy = Some(TimeoutPolicy::NewConnection);
        let (pool, connector) = bounded(opts);

        let held = assert_ok!(pool.acquire().await);

        // the slot never frees, so the timeout cuts the wait short with a new channel
        let c2 = assert_ok!(pool.acquire().await);
        assert_ne!(c2.id(), held.id());
        assert_eq!(connector.connected(), 2);
        // the cap is transiently exceeded until the extra channel is released
        assert_eq!(pool.acquired_count(), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_close_drains_pending() {
        let (pool, _) = bounded(BoundedOptions::new(1));

        let held = assert_ok!(pool.acquire().await);
        let pending = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await })
        };
        while pool.pending_acquire_count() == 0 {
            test_sleep(Duration::from_millis(10)).await;
        }

        pool.close().await;
        let err = assert_err!(pending.await.unwrap());
        assert_eq!(err.etype(), &POOL_CLOSED);
        assert_eq!(pool.acquired_count(), 0);
        assert_eq!(pool.pending_acquire_count(), 0);

        // acquire and release after close both fail
        let err = assert_err!(pool.acquire().await);
        assert_eq!(err.etype(), &POOL_CLOSED);
        let flag = held.open_flag();
        let err = assert_err!(pool.release(held).await);
        assert_eq!(err.etype(), &POOL_CLOSED);
        assert!(!flag.load(std::sync::atomic::Ordering::Relaxed));
    }

    #[tokio::test]
    async fn test_close_idempotent() {
        let (pool, _) = bounded(BoundedOptions::new(1));
        pool.close().await;
        pool.close().await; // no-op
        assert_eq!(pool.acquired_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_connect_failure_frees_slot() {
        let (pool, connector) = bounded(BoundedOptions::new(1));

        connector.set_fail(true);
        let err = assert_err!(pool.acquire().await);
        assert_eq!(err.etype(), &ErrorType::ConnectError);
        // the failed acquire rolled its slot back
        assert_eq!(pool.acquired_count(), 0);

        connector.set_fail(false);
        let c = assert_ok!(pool.acquire().await);
        assert_eq!(pool.acquired_count(), 1);
        assert_ok!(pool.release(c).await);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_connect_failure_reaches_waiter() {
        let mut opts = BoundedOptions::new(1);
        opts.pool.check_on_release = false;
        let (pool, connector) = bounded(opts);

        let c1 = assert_ok!(pool.acquire().await);
        let pending = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await })
        };
        while pool.pending_acquire_count() == 0 {
            test_sleep(Duration::from_millis(10)).await;
        }

        // the released channel went stale, so the waiter needs a fresh connect, which
        // fails and must surface to the waiter
        c1.shut();
        connector.set_fail(true);
        let released = assert_ok!(pool.release(c1).await);
        assert!(released); // stored without a health check
        let err = assert_err!(pending.await.unwrap());
        assert_eq!(err.etype(), &ErrorType::ConnectError);
        assert_eq!(pool.acquired_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_fifo_waiter_order() {
        let (pool, _) = bounded(BoundedOptions::new(1));

        let held = assert_ok!(pool.acquire().await);
        let first = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await })
        };
        while pool.pending_acquire_count() < 1 {
            test_sleep(Duration::from_millis(10)).await;
        }
        let second = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await })
        };
        while pool.pending_acquire_count() < 2 {
            test_sleep(Duration::from_millis(10)).await;
        }

        // one release frees one slot: only the first waiter gets it
        assert_ok!(pool.release(held).await);
        let c = assert_ok!(first.await.unwrap());
        assert_eq!(pool.pending_acquire_count(), 1);

        assert_ok!(pool.release(c).await);
        let c = assert_ok!(second.await.unwrap());
        assert_eq!(pool.pending_acquire_count(), 0);
        assert_ok!(pool.release(c).await);
    }
}
