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

use yogi_protocol::{ChangeType, EndpointKind, TerminalInfo};

use crate::{
    endpoint::{Endpoint, EndpointInner},
    errors::Result,
    path::Path,
    scheduler::Scheduler,
};

/// An endpoint that accepts arbitrarily many connections and forwards
/// announcements and messages between them, so that every connected
/// endpoint observes the union of the others.
///
/// The connection graph among nodes is constrained to a tree; an
/// assignment that would close a loop fails.
///
/// Cloning yields another handle to the same node.
#[derive(Clone)]
pub struct Node {
    ep: Endpoint,
}

impl Node {
    pub fn new(scheduler: &Scheduler) -> Node {
        Node {
            ep: Endpoint {
                inner: EndpointInner::create(scheduler, EndpointKind::Node, None),
            },
        }
    }

    pub fn with_location(scheduler: &Scheduler, location: Path) -> Node {
        Node {
            ep: Endpoint {
                inner: EndpointInner::create(scheduler, EndpointKind::Node, Some(location)),
            },
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.ep
    }

    /// Snapshot of every terminal currently exposed by some reachable
    /// endpoint, in first-insertion order.
    pub fn get_known_terminals(&self) -> Vec<TerminalInfo> {
        self.ep.inner.known_terminals()
    }

    /// Await the next ADDED/REMOVED delta of the known-terminals set.
    /// Fires once; re-register to keep observing. Deltas that occur
    /// while no handler is registered are queued.
    pub fn async_await_known_terminals_change<F>(&self, handler: F) -> Result<()>
    where
        F: FnOnce(Result<(TerminalInfo, ChangeType)>) + Send + 'static,
    {
        self.ep.inner.async_await_known_change(Box::new(handler))
    }

    /// The outstanding wait, if any, completes with *canceled*.
    pub fn cancel_await_known_terminals_change(&self) {
        self.ep.inner.cancel_await_known_change();
    }
}

impl AsRef<Endpoint> for Node {
    fn as_ref(&self) -> &Endpoint {
        &self.ep
    }
}
