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

//! In-memory channel and connector fakes shared by the unit tests

use crate::channel::{Channel, ChannelId, Connector};
use async_trait::async_trait;
use pingora_error::{Error, ErrorType, Result};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering::Relaxed};
use std::sync::Arc;

#[derive(Debug)]
pub(crate) struct TestChannel {
    id: ChannelId,
    open: Arc<AtomicBool>,
}

impl TestChannel {
    pub fn new(id: ChannelId) -> Self {
        TestChannel {
            id,
            open: Arc::new(AtomicBool::new(true)),
        }
    }

    /// A handle to observe (or flip) the open state after the channel moved elsewhere.
    pub fn open_flag(&self) -> Arc<AtomicBool> {
        self.open.clone()
    }

    /// Simulate the peer dropping the connection.
    pub fn shut(&self) {
        self.open.store(false, Relaxed);
    }
}

#[async_trait]
impl Channel for TestChannel {
    fn id(&self) -> ChannelId {
        self.id
    }

    fn is_open(&self) -> bool {
        self.open.load(Relaxed)
    }

    async fn close(&self) -> io::Result<()> {
        self.open.store(false, Relaxed);
        Ok(())
    }
}

pub(crate) struct TestConnector {
    next_id: AtomicU64,
    connected: AtomicUsize,
    fail: AtomicBool,
}

impl TestConnector {
    pub fn new() -> Self {
        TestConnector {
            next_id: AtomicU64::new(1),
            connected: AtomicUsize::new(0),
            fail: AtomicBool::new(false),
        }
    }

    /// How many channels this connector has established so far.
    pub fn connected(&self) -> usize {
        self.connected.load(Relaxed)
    }

    /// Make subsequent connect calls fail (or succeed again).
    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Relaxed);
    }
}

#[async_trait]
impl Connector<TestChannel> for TestConnector {
    async fn connect(&self) -> Result<TestChannel> {
        if self.fail.load(Relaxed) {
            return Error::e_explain(ErrorType::ConnectError, "test connector set to fail");
        }
        let id = self.next_id.fetch_add(1, Relaxed);
        self.connected.fetch_add(1, Relaxed);
        Ok(TestChannel::new(id))
    }
}
