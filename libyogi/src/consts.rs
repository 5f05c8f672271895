// Copyright 2023 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::time;

/// Delay between connection attempts of the auto connecting client.
pub const RECONNECT_DELAY: time::Duration = time::Duration::from_secs(1);

/// An unassigned TCP connection is torn down after this long unless the
/// caller picked a different timeout.
pub const DEFAULT_HANDSHAKE_TIMEOUT: time::Duration = time::Duration::from_secs(10);

// A transport frame can never legitimately get much bigger than the
// largest payload plus its envelope.
pub const MAX_FRAME_SIZE: usize = yogi_protocol::MAX_MESSAGE_SIZE + 4096;

pub const MAX_THREAD_POOL_SIZE: usize = 64;
pub const DEFAULT_THREAD_POOL_SIZE: usize = 2;

/// Port the hub listens on for session clients unless configured
/// otherwise.
pub const DEFAULT_HUB_PORT: u16 = 13000;
