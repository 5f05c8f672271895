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

/*! Connections: bidirectional transports linking two endpoints.

A Local connection joins two endpoints of the same process without any
serialization; frames are handed straight from one endpoint's strand to
the other's. TCP connections live in [`tcp`].
*/

use std::sync::Arc;

use crate::{
    endpoint::{self, Endpoint, EndpointInner},
    errors::{Error, Result},
};

mod tcp;

pub use tcp::{AutoConnectingTcpClient, TcpClient, TcpConnection, TcpServer};

pub(crate) type DeathHandler = Box<dyn FnOnce(Error) + Send>;

/// An in-process zero-copy link between two endpoints. Open from
/// construction; both sides see each other's announcements
/// immediately.
pub struct LocalConnection {
    a: Arc<EndpointInner>,
    conn_a: u32,
    b: Arc<EndpointInner>,
    conn_b: u32,
}

impl LocalConnection {
    pub fn new<EA, EB>(a: &EA, b: &EB) -> Result<LocalConnection>
    where
        EA: AsRef<Endpoint>,
        EB: AsRef<Endpoint>,
    {
        let inner_a = Arc::clone(&a.as_ref().inner);
        let inner_b = Arc::clone(&b.as_ref().inner);
        let (conn_a, conn_b) = endpoint::attach_local_pair(&inner_a, &inner_b)?;
        Ok(LocalConnection { a: inner_a, conn_a, b: inner_b, conn_b })
    }

    pub fn description(&self) -> &'static str {
        "Local Connection"
    }

    pub fn remote_version(&self) -> &'static str {
        yogi_protocol::VERSION
    }

    pub fn remote_identification(&self) -> Option<&str> {
        None
    }
}

impl Drop for LocalConnection {
    fn drop(&mut self) {
        self.a.detach(self.conn_a);
        self.b.detach(self.conn_b);
    }
}

#[cfg(test)]
mod test {
    use yogi_protocol::Signature;

    use super::*;
    use crate::{
        endpoint::{Leaf, Node},
        scheduler::Scheduler,
        terminal::Terminal,
    };

    #[test]
    fn connecting_an_endpoint_to_itself_fails() {
        let scheduler = Scheduler::new();
        let leaf = Leaf::new(&scheduler);
        assert!(matches!(
            LocalConnection::new(&leaf, &leaf),
            Err(Error::AssignmentFailed(_))
        ));
    }

    #[test]
    fn leaf_accepts_exactly_one_connection() {
        let scheduler = Scheduler::new();
        let leaf = Leaf::new(&scheduler);
        let node_a = Node::new(&scheduler);
        let node_b = Node::new(&scheduler);

        let _conn = LocalConnection::new(&leaf, &node_a).expect("first connection");
        assert!(matches!(
            LocalConnection::new(&leaf, &node_b),
            Err(Error::AssignmentFailed(_))
        ));
    }

    #[test]
    fn node_graph_stays_a_tree() {
        let scheduler = Scheduler::new();
        let node_a = Node::new(&scheduler);
        let node_b = Node::new(&scheduler);
        let node_c = Node::new(&scheduler);

        let _ab = LocalConnection::new(&node_a, &node_b).expect("a-b");
        let _bc = LocalConnection::new(&node_b, &node_c).expect("b-c");

        // node ids propagate asynchronously through the announcement
        // strands; wait until a knows about c
        let t = Terminal::new(&node_c, yogi_protocol::TerminalKind::Producer, "x", Signature(0))
            .unwrap();
        crate::test_support::wait_until(|| {
            node_a.get_known_terminals().iter().any(|i| i.name == "x")
        });
        drop(t);

        assert!(matches!(
            LocalConnection::new(&node_a, &node_c),
            Err(Error::AssignmentFailed(_))
        ));
    }
}
