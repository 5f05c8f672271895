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

use std::fmt;

use anyhow::anyhow;
use serde_derive::{Deserialize, Serialize};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// The largest payload a terminal accepts, for publishes, scatters,
/// gathers, requests and responses alike.
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// The fourteen terminal variants.
///
/// The first four are the primitive variants; the remaining ten are
/// convenience variants that compose a primitive behavior with a fixed
/// built-in binding to their pair (e.g. a Consumer behaves like a
/// Deaf-Mute with a built-in binding to a same-named Producer).
#[derive(Serialize, Deserialize, Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum TerminalKind {
    DeafMute = 0,
    PublishSubscribe = 1,
    CachedPublishSubscribe = 2,
    ScatterGather = 3,
    Producer = 4,
    Consumer = 5,
    CachedProducer = 6,
    CachedConsumer = 7,
    Master = 8,
    Slave = 9,
    CachedMaster = 10,
    CachedSlave = 11,
    Service = 12,
    Client = 13,
}

impl TerminalKind {
    /// The primitive variants are the only ones that support explicit
    /// bindings.
    pub fn is_primitive(self) -> bool {
        use TerminalKind::*;
        matches!(self, DeafMute | PublishSubscribe | CachedPublishSubscribe | ScatterGather)
    }

    /// Cached variants retain the last published payload and replay it
    /// when a new binding gets established.
    pub fn is_cached(self) -> bool {
        use TerminalKind::*;
        matches!(
            self,
            CachedPublishSubscribe | CachedProducer | CachedConsumer | CachedMaster | CachedSlave
        )
    }

    /// Variants with a built-in binder side. These report a builtin
    /// binding state.
    pub fn is_binder(self) -> bool {
        use TerminalKind::*;
        matches!(
            self,
            Consumer | CachedConsumer | Master | Slave | CachedMaster | CachedSlave | Service
        )
    }

    /// Variants with a sender side that reports a subscription state.
    pub fn is_subscribable(self) -> bool {
        use TerminalKind::*;
        matches!(
            self,
            PublishSubscribe
                | CachedPublishSubscribe
                | ScatterGather
                | Producer
                | CachedProducer
                | Master
                | Slave
                | CachedMaster
                | CachedSlave
                | Client
        )
    }

    /// Variants that can publish broadcast messages.
    pub fn can_publish(self) -> bool {
        use TerminalKind::*;
        matches!(
            self,
            PublishSubscribe
                | CachedPublishSubscribe
                | Producer
                | CachedProducer
                | Master
                | Slave
                | CachedMaster
                | CachedSlave
        )
    }

    /// Variants that can receive published messages.
    pub fn can_receive_published(self) -> bool {
        use TerminalKind::*;
        matches!(
            self,
            PublishSubscribe
                | CachedPublishSubscribe
                | Consumer
                | CachedConsumer
                | Master
                | Slave
                | CachedMaster
                | CachedSlave
        )
    }

    /// Variants that can initiate a scatter-gather or request operation.
    pub fn can_scatter(self) -> bool {
        use TerminalKind::*;
        matches!(self, ScatterGather | Client)
    }

    /// Variants that can receive scattered messages or requests.
    pub fn can_receive_scattered(self) -> bool {
        use TerminalKind::*;
        matches!(self, ScatterGather | Service)
    }

    /// The target kind of the variant's built-in binding, if it has one.
    ///
    /// A terminal of this kind at the terminal's own name is what
    /// establishes the builtin binding, and what the terminal receives
    /// messages from.
    pub fn builtin_binding_target(self) -> Option<TerminalKind> {
        use TerminalKind::*;
        match self {
            Consumer => Some(Producer),
            CachedConsumer => Some(CachedProducer),
            Master => Some(Slave),
            Slave => Some(Master),
            CachedMaster => Some(CachedSlave),
            CachedSlave => Some(CachedMaster),
            Service => Some(Client),
            _ => None,
        }
    }

    /// The counterpart kind that makes a terminal of this kind count as
    /// bound for subscription purposes. For primitives this is the kind
    /// itself (explicit bindings pair same-kind terminals).
    pub fn counterpart(self) -> TerminalKind {
        use TerminalKind::*;
        match self {
            Producer => Consumer,
            Consumer => Producer,
            CachedProducer => CachedConsumer,
            CachedConsumer => CachedProducer,
            Master => Slave,
            Slave => Master,
            CachedMaster => CachedSlave,
            CachedSlave => CachedMaster,
            Service => Client,
            Client => Service,
            other => other,
        }
    }
}

impl TryFrom<u8> for TerminalKind {
    type Error = anyhow::Error;

    fn try_from(v: u8) -> anyhow::Result<Self> {
        use TerminalKind::*;
        match v {
            0 => Ok(DeafMute),
            1 => Ok(PublishSubscribe),
            2 => Ok(CachedPublishSubscribe),
            3 => Ok(ScatterGather),
            4 => Ok(Producer),
            5 => Ok(Consumer),
            6 => Ok(CachedProducer),
            7 => Ok(CachedConsumer),
            8 => Ok(Master),
            9 => Ok(Slave),
            10 => Ok(CachedMaster),
            11 => Ok(CachedSlave),
            12 => Ok(Service),
            13 => Ok(Client),
            _ => Err(anyhow!("unknown TerminalKind {}", v)),
        }
    }
}

impl fmt::Display for TerminalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use TerminalKind::*;
        let s = match self {
            DeafMute => "DeafMute",
            PublishSubscribe => "PublishSubscribe",
            CachedPublishSubscribe => "CachedPublishSubscribe",
            ScatterGather => "ScatterGather",
            Producer => "Producer",
            Consumer => "Consumer",
            CachedProducer => "CachedProducer",
            CachedConsumer => "CachedConsumer",
            Master => "Master",
            Slave => "Slave",
            CachedMaster => "CachedMaster",
            CachedSlave => "CachedSlave",
            Service => "Service",
            Client => "Client",
        };
        write!(f, "{s}")
    }
}

/// A 32 bit compatibility fingerprint. Two terminals must have identical
/// (kind, signature) to interoperate; the engine treats the value as
/// opaque.
#[derive(Serialize, Deserialize, Copy, Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Signature(pub u32);

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

/// The identity of a terminal as seen by the routing fabric.
///
/// Connections reference peer terminals only by this tuple, never by
/// their endpoint-local ids.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash)]
pub struct TerminalInfo {
    pub kind: TerminalKind,
    pub signature: Signature,
    pub name: String,
}

impl fmt::Display for TerminalInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} '{}' [{}]", self.kind, self.name, self.signature)
    }
}

/// Observable state of a binding (explicit or builtin).
#[derive(Serialize, Deserialize, Copy, Clone, Debug, PartialEq, Eq)]
pub enum BindingState {
    Released = 0,
    Established = 1,
}

/// Observable state of the sender side of a subscribable terminal.
#[derive(Serialize, Deserialize, Copy, Clone, Debug, PartialEq, Eq)]
pub enum SubscriptionState {
    Unsubscribed = 0,
    Subscribed = 1,
}

/// Direction of a known-terminals delta.
#[derive(Serialize, Deserialize, Copy, Clone, Debug, PartialEq, Eq)]
pub enum ChangeType {
    Removed = 0,
    Added = 1,
}

/// Flag bits carried by every gather response.
pub mod gather_flags {
    /// This is the last response of the operation.
    pub const FINISHED: u8 = 1;
    /// The remote terminal ignored the scattered message.
    pub const IGNORED: u8 = 2;
    /// The fanout was empty at send time; nobody received the message.
    pub const DEAF: u8 = 4;
    /// The responder was destroyed before answering.
    pub const BINDING_DESTROYED: u8 = 8;
    /// The connection to the responder died mid-operation.
    pub const CONNECTION_LOST: u8 = 16;
}

/// Whether an endpoint talks to a single peer or forwards between many.
#[derive(Serialize, Deserialize, Copy, Clone, Debug, PartialEq, Eq)]
pub enum EndpointKind {
    Leaf,
    Node,
}

/// The first frame each side sends when a connection is assigned to an
/// endpoint. Identification is informative only; version strings with
/// different major components refuse to talk to each other.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Hello {
    pub version: String,
    pub endpoint_kind: EndpointKind,
    /// Unique per endpoint; nodes use it to refuse loop-forming
    /// assignments.
    pub node_id: u64,
    #[serde(default)]
    pub identification: Option<String>,
}

/// A batch of announcement deltas. The same shape is used for adds
/// (Announce) and removals (Retract).
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct Deltas {
    /// Terminals this side exposes. Drives binding states and the
    /// known-terminals set.
    #[serde(default)]
    pub terminals: Vec<TerminalInfo>,
    /// Terminal identities this side wants messages from, one per
    /// binding target (explicit or builtin). Drives subscription states
    /// and message routing.
    #[serde(default)]
    pub interests: Vec<TerminalInfo>,
    /// Node ids reachable through this side. Drives loop rejection.
    #[serde(default)]
    pub nodes: Vec<u64>,
}

impl Deltas {
    pub fn is_empty(&self) -> bool {
        self.terminals.is_empty() && self.interests.is_empty() && self.nodes.is_empty()
    }
}

/// A single multiplexed frame on a connection between two endpoints.
///
/// On the wire every frame is prefixed with a 4 byte little endian
/// unsigned length word.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub enum TransportMsg {
    Hello(Hello),
    Announce(Deltas),
    Retract(Deltas),
    /// A broadcast message from the terminal identified by `src`,
    /// delivered to every peer that announced a matching interest.
    /// `cached` marks a cache replay on binding establishment.
    Publish { src: TerminalInfo, payload: Vec<u8>, cached: bool },
    /// A scattered message or request from the terminal identified by
    /// `src`. `op` is scoped to the sending connection.
    Scatter { src: TerminalInfo, op: u32, payload: Vec<u8> },
    /// One response within a scatter-gather operation. `last` marks the
    /// final response this connection will produce for `op`.
    Gather { op: u32, flags: u8, payload: Vec<u8>, last: bool },
    /// This connection's subtree completed for `op` without a remaining
    /// undelivered response.
    GatherNone { op: u32 },
    /// The initiator lost interest in `op`; downstream bookkeeping can
    /// be dropped.
    GatherCancel { op: u32 },
    /// Keepalive, exchanged when the connection is otherwise idle.
    Heartbeat,
}

/// Request types of the session surface. Every request frame begins with
/// one of these as a single byte. Stable across versions.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SessionRequest {
    Version = 0,
    CurrentTime = 1,
    KnownTerminals = 2,
    KnownTerminalsSubtree = 3,
    FindKnownTerminals = 4,
    MonitorKnownTerminals = 5,
    ConnectionFactories = 6,
    Connections = 7,
    MonitorConnections = 8,
    ClientAddress = 9,
    StartDnsLookup = 10,
    CreateTerminal = 11,
    DestroyTerminal = 12,
    CreateBinding = 13,
    DestroyBinding = 14,
    MonitorBindingState = 15,
    MonitorBuiltinBindingState = 16,
    MonitorSubscriptionState = 17,
    PublishMessage = 18,
    MonitorReceivedPublishMessages = 19,
    ScatterGather = 20,
    MonitorReceivedScatterMessages = 21,
    RespondToScatteredMessage = 22,
    IgnoreScatteredMessage = 23,
}

impl TryFrom<u8> for SessionRequest {
    type Error = anyhow::Error;

    fn try_from(v: u8) -> anyhow::Result<Self> {
        use SessionRequest::*;
        match v {
            0 => Ok(Version),
            1 => Ok(CurrentTime),
            2 => Ok(KnownTerminals),
            3 => Ok(KnownTerminalsSubtree),
            4 => Ok(FindKnownTerminals),
            5 => Ok(MonitorKnownTerminals),
            6 => Ok(ConnectionFactories),
            7 => Ok(Connections),
            8 => Ok(MonitorConnections),
            9 => Ok(ClientAddress),
            10 => Ok(StartDnsLookup),
            11 => Ok(CreateTerminal),
            12 => Ok(DestroyTerminal),
            13 => Ok(CreateBinding),
            14 => Ok(DestroyBinding),
            15 => Ok(MonitorBindingState),
            16 => Ok(MonitorBuiltinBindingState),
            17 => Ok(MonitorSubscriptionState),
            18 => Ok(PublishMessage),
            19 => Ok(MonitorReceivedPublishMessages),
            20 => Ok(ScatterGather),
            21 => Ok(MonitorReceivedScatterMessages),
            22 => Ok(RespondToScatteredMessage),
            23 => Ok(IgnoreScatteredMessage),
            _ => Err(anyhow!("unknown SessionRequest {}", v)),
        }
    }
}

/// Response types of the session surface. The first nine are synchronous
/// statuses; the rest are asynchronous notifications pushed by the hub.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SessionResponse {
    Ok = 0,
    InternalServerError = 1,
    InvalidRequest = 2,
    ApiError = 3,
    AlreadyMonitoring = 4,
    InvalidTerminalId = 5,
    InvalidBindingId = 6,
    InvalidOperationId = 7,
    InvalidTerminalType = 8,

    DnsLookupFinished = 9,

    ConnectionChanged = 10,
    KnownTerminalsChanged = 11,
    BindingStateChanged = 12,
    BuiltinBindingStateChanged = 13,
    SubscriptionStateChanged = 14,
    PublishedMessageReceived = 15,
    CachedPublishedMessageReceived = 16,
    ScatteredMessageReceived = 17,
    GatheredMessageReceived = 18,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn terminal_kind_round_trip() {
        for v in 0u8..14 {
            let kind = TerminalKind::try_from(v).expect("kind to parse");
            assert_eq!(kind as u8, v);
        }
        assert!(TerminalKind::try_from(14).is_err());
    }

    #[test]
    fn capability_matrix() {
        use TerminalKind::*;

        // (kind, primitive, cached, binder, subscribable)
        let cases = vec![
            (DeafMute, true, false, false, false),
            (PublishSubscribe, true, false, false, true),
            (CachedPublishSubscribe, true, true, false, true),
            (ScatterGather, true, false, false, true),
            (Producer, false, false, false, true),
            (Consumer, false, false, true, false),
            (CachedProducer, false, true, false, true),
            (CachedConsumer, false, true, true, false),
            (Master, false, false, true, true),
            (Slave, false, false, true, true),
            (CachedMaster, false, true, true, true),
            (CachedSlave, false, true, true, true),
            (Service, false, false, true, false),
            (Client, false, false, false, true),
        ];

        for (kind, primitive, cached, binder, subscribable) in cases {
            assert_eq!(kind.is_primitive(), primitive, "{kind}");
            assert_eq!(kind.is_cached(), cached, "{kind}");
            assert_eq!(kind.is_binder(), binder, "{kind}");
            assert_eq!(kind.is_subscribable(), subscribable, "{kind}");
        }
    }

    #[test]
    fn builtin_binding_targets_pair_up() {
        use TerminalKind::*;

        for kind in [Consumer, CachedConsumer, Master, Slave, CachedMaster, CachedSlave, Service] {
            let target = kind.builtin_binding_target().expect("binder to have a target");
            assert_eq!(target, kind.counterpart());
        }

        for kind in [DeafMute, PublishSubscribe, CachedPublishSubscribe, ScatterGather] {
            assert_eq!(kind.builtin_binding_target(), None);
            assert_eq!(kind.counterpart(), kind);
        }
    }
}
