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

//! Error types raised by the pools

use pingora_error::ErrorType;

/// Acquire or release was attempted after (or while) the pool was closed.
pub const POOL_CLOSED: ErrorType = ErrorType::new("PoolClosed");

/// The pending acquire queue of a [crate::BoundedPool] is at capacity.
pub const TOO_MANY_PENDING_ACQUIRES: ErrorType = ErrorType::new("TooManyPendingAcquires");

/// A queued acquire aged past its deadline under [crate::TimeoutPolicy::Fail].
pub const ACQUIRE_TIMEDOUT: ErrorType = ErrorType::new("AcquireTimedout");

/// A channel was released to a pool that does not currently own it.
///
/// This is a caller bug. The channel is force closed so that it is not leaked.
pub const CHANNEL_NOT_OWNED: ErrorType = ErrorType::new("ChannelNotOwned");

/// The idle store rejected a released channel because it is at capacity.
///
/// The rejected channel is closed, never silently dropped back to the caller.
pub const POOL_FULL: ErrorType = ErrorType::new("PoolFull");

/// Pool construction was given an invalid combination of options.
pub const INVALID_POOL_CONFIG: ErrorType = ErrorType::new("InvalidPoolConfig");
