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

/*! Endpoints: the routing heart of the engine.

An endpoint owns a flat arena of terminal records keyed by a u32 id and
mediates all message I/O for them. A Leaf talks to exactly one peer
endpoint; a Node talks to many, forwards between them and maintains the
known-terminals set.

Everything an endpoint knows about the outside world arrives as
announcement deltas over its connections: the terminals a peer exposes
(driving binding states and the known-terminals set), the *interests* a
peer holds, i.e. the terminal identities it wants messages from
(driving subscription states and message routing), and the node ids
reachable through the peer (driving loop rejection).

All state lives behind a single mutex per endpoint. Incoming frames are
re-posted from I/O threads to the endpoint's strand; user callbacks are
collected under the lock and posted to the owning object's strand after
the lock is released, so no callback ever runs while an engine lock is
held.
*/

use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, Weak,
    },
    time,
};

use tracing::{debug, warn};
use yogi_protocol::{
    gather_flags, BindingState, ChangeType, Deltas, EndpointKind, SubscriptionState, TerminalInfo,
    TerminalKind, TransportMsg, MAX_MESSAGE_SIZE,
};

use crate::{
    errors::{Error, Result},
    path::Path,
    scheduler::{Scheduler, Strand},
    terminal::{ControlFlow, GatheredMessage, Message, ScatteredMessage},
};

mod leaf;
mod node;

pub use leaf::Leaf;
pub use node::Node;

pub(crate) type ReceiveHandler = Box<dyn FnOnce(Result<Message>) + Send>;
pub(crate) type ScatterReceiveHandler = Box<dyn FnOnce(Result<ScatteredMessage>) + Send>;
pub(crate) type GatherHandler = Box<dyn FnMut(Result<GatheredMessage>) -> ControlFlow + Send>;
pub(crate) type BindingStateHandler = Box<dyn FnOnce(Result<BindingState>) + Send>;
pub(crate) type SubscriptionStateHandler = Box<dyn FnOnce(Result<SubscriptionState>) + Send>;
pub(crate) type KnownTerminalsHandler =
    Box<dyn FnOnce(Result<(TerminalInfo, ChangeType)>) + Send>;

/// A handle to the shared part of a Leaf or Node. Terminal, binding and
/// connection constructors take anything that derefs to this.
#[derive(Clone)]
pub struct Endpoint {
    pub(crate) inner: Arc<EndpointInner>,
}

impl Endpoint {
    pub fn kind(&self) -> EndpointKind {
        self.inner.kind
    }

    pub fn location(&self) -> Option<&Path> {
        self.inner.location.as_ref()
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.inner.scheduler
    }
}

impl AsRef<Endpoint> for Endpoint {
    fn as_ref(&self) -> &Endpoint {
        self
    }
}

static NEXT_ENDPOINT_SEQ: AtomicU64 = AtomicU64::new(1);

// Endpoint ids must be unique across processes for the node graph loop
// check. A timestamp mixed with the pid and a process local counter is
// unique for any practical purpose.
fn next_endpoint_id() -> u64 {
    let nanos = time::SystemTime::now()
        .duration_since(time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    let seq = NEXT_ENDPOINT_SEQ.fetch_add(1, Ordering::Relaxed);
    nanos ^ (seq << 40) ^ ((std::process::id() as u64) << 24)
}

pub(crate) enum SeatTx {
    /// In-process zero-copy link: frames are handed straight to the
    /// peer endpoint's strand.
    Local { peer: Weak<EndpointInner>, peer_conn: u32 },
    /// Frames go to a connection writer thread.
    Channel(crossbeam_channel::Sender<TransportMsg>),
}

impl SeatTx {
    fn send(&self, msg: TransportMsg) {
        match self {
            SeatTx::Local { peer, peer_conn } => {
                if let Some(peer) = peer.upgrade() {
                    let conn = *peer_conn;
                    let target = Arc::clone(&peer);
                    peer.strand.post(move || EndpointInner::dispatch(&target, conn, msg));
                }
            }
            SeatTx::Channel(tx) => {
                // a dead writer means the connection is on its way
                // down; the detach will clean up
                let _ = tx.send(msg);
            }
        }
    }
}

struct Seat {
    tx: SeatTx,
    remote_terminals: HashSet<TerminalInfo>,
    remote_interests: HashSet<TerminalInfo>,
    remote_nodes: HashSet<u64>,
}

impl Seat {
    fn new(tx: SeatTx) -> Seat {
        Seat {
            tx,
            remote_terminals: HashSet::new(),
            remote_interests: HashSet::new(),
            remote_nodes: HashSet::new(),
        }
    }
}

struct TerminalRecord {
    info: TerminalInfo,
    strand: Strand,
    recv_queue: VecDeque<Message>,
    recv_handler: Option<ReceiveHandler>,
    scatter_handler: Option<ScatterReceiveHandler>,
    await_binding: Option<BindingStateHandler>,
    await_subscription: Option<SubscriptionStateHandler>,
    /// Last payload published by this terminal; replayed to new
    /// binders of cached variants.
    published_cache: Option<Vec<u8>>,
    /// Last payload this terminal published or received; what
    /// get_cached_message returns.
    seen_cache: Option<Vec<u8>>,
    /// Routed operation keys of scattered messages handed to the user
    /// but not yet answered.
    pending_scattered: HashSet<u32>,
}

struct BindingRecord {
    source: u32,
    target: TerminalInfo,
    strand: Strand,
    await_change: Option<BindingStateHandler>,
}

pub(crate) struct OpShared {
    handler: Mutex<GatherHandler>,
    dead: AtomicBool,
}

struct OpRecord {
    terminal: u32,
    shared: Arc<OpShared>,
    /// Connections whose subtree has not completed yet.
    pending_conns: HashSet<u32>,
}

/// Response accounting for a scatter that arrived over a connection and
/// fans out to local receivers and (on a node) other connections.
struct RoutedOp {
    upstream_conn: u32,
    upstream_op: u32,
    local_pending: HashSet<u32>,
    down_conns: HashSet<u32>,
}

#[derive(Default)]
struct State {
    terminals: HashMap<u32, TerminalRecord>,
    next_terminal_id: u32,
    /// Local terminals grouped by identity; one announced unit per
    /// distinct identity.
    local_infos: HashMap<TerminalInfo, HashSet<u32>>,
    /// Convenience terminals indexed by their builtin binding target.
    by_builtin_target: HashMap<TerminalInfo, HashSet<u32>>,
    /// Refcount of local binding targets (explicit and builtin).
    local_interests: HashMap<TerminalInfo, usize>,

    bindings: HashMap<u32, BindingRecord>,
    by_binding_target: HashMap<TerminalInfo, HashSet<u32>>,
    next_binding_id: u32,

    conns: HashMap<u32, Seat>,
    next_conn_id: u32,

    // aggregates over all seats
    remote_terminals: HashMap<TerminalInfo, usize>,
    remote_interests: HashMap<TerminalInfo, usize>,
    remote_nodes: HashMap<u64, usize>,

    /// Latest payload seen per cached-variant terminal identity, used
    /// to serve late binders without asking the owner again.
    replay_caches: HashMap<TerminalInfo, Vec<u8>>,
    /// Connections whose freshly announced interest could not be served
    /// from a cache yet.
    cache_waiters: HashMap<TerminalInfo, HashSet<u32>>,
    /// Local receivers waiting for a cache replay.
    local_cache_waiters: HashMap<TerminalInfo, HashSet<u32>>,

    // node only
    known_order: Vec<TerminalInfo>,
    known_count: HashMap<TerminalInfo, usize>,
    known_waiter: Option<KnownTerminalsHandler>,
    known_backlog: VecDeque<(TerminalInfo, ChangeType)>,

    ops: HashMap<u32, OpRecord>,
    routed: HashMap<u32, RoutedOp>,
    routed_by_upstream: HashMap<(u32, u32), u32>,
    next_op_id: u32,
}

impl State {
    fn term_sources(&self, info: &TerminalInfo) -> usize {
        let local = self.local_infos.get(info).map(|s| !s.is_empty()).unwrap_or(false) as usize;
        local + self.conns.values().filter(|s| s.remote_terminals.contains(info)).count()
    }

    fn interest_sources(&self, info: &TerminalInfo) -> usize {
        let local = (self.local_interests.get(info).copied().unwrap_or(0) > 0) as usize;
        local + self.conns.values().filter(|s| s.remote_interests.contains(info)).count()
    }

    fn node_sources(&self, own_id: Option<u64>, id: u64) -> usize {
        let local = (own_id == Some(id)) as usize;
        local + self.conns.values().filter(|s| s.remote_nodes.contains(&id)).count()
    }

    fn subscribed(&self, info: &TerminalInfo) -> bool {
        self.remote_interests.get(info).copied().unwrap_or(0) > 0
    }

    fn bound(&self, info: &TerminalInfo) -> bool {
        self.remote_terminals.get(info).copied().unwrap_or(0) > 0
    }
}

/// User callbacks collected under the state lock and posted to their
/// strands once the lock is released.
#[derive(Default)]
struct Effects {
    tasks: Vec<(Strand, Box<dyn FnOnce() + Send>)>,
}

impl Effects {
    fn post<F>(&mut self, strand: &Strand, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.tasks.push((strand.clone(), Box::new(f)));
    }

    fn run(self) {
        for (strand, task) in self.tasks {
            strand.post(task);
        }
    }
}

/// Per-connection delta batches built up during one dispatch step.
#[derive(Default)]
struct Outgoing {
    announce: HashMap<u32, Deltas>,
    retract: HashMap<u32, Deltas>,
}

impl Outgoing {
    fn announce(&mut self, conn: u32) -> &mut Deltas {
        self.announce.entry(conn).or_default()
    }

    fn retract(&mut self, conn: u32) -> &mut Deltas {
        self.retract.entry(conn).or_default()
    }

    fn flush(self, st: &State) {
        for (conn, deltas) in self.announce {
            if !deltas.is_empty() {
                if let Some(seat) = st.conns.get(&conn) {
                    seat.tx.send(TransportMsg::Announce(deltas));
                }
            }
        }
        for (conn, deltas) in self.retract {
            if !deltas.is_empty() {
                if let Some(seat) = st.conns.get(&conn) {
                    seat.tx.send(TransportMsg::Retract(deltas));
                }
            }
        }
    }
}

pub(crate) struct EndpointInner {
    pub(crate) scheduler: Scheduler,
    pub(crate) kind: EndpointKind,
    pub(crate) id: u64,
    pub(crate) location: Option<Path>,
    pub(crate) strand: Strand,
    state: Mutex<State>,
}

impl EndpointInner {
    pub(crate) fn create(
        scheduler: &Scheduler,
        kind: EndpointKind,
        location: Option<Path>,
    ) -> Arc<EndpointInner> {
        Arc::new(EndpointInner {
            scheduler: scheduler.clone(),
            kind,
            id: next_endpoint_id(),
            location,
            strand: Strand::new(scheduler),
            state: Mutex::new(State::default()),
        })
    }

    fn resolve_name(&self, name: &str) -> Result<Path> {
        let path = Path::new(name)?;
        if path.empty() {
            return Err(Error::InvalidPath(String::from(name)));
        }
        match (&self.location, path.is_absolute()) {
            (Some(location), false) => location.join(&path),
            _ => Ok(path),
        }
    }

    // ---------------------------------------------------------------
    // terminal lifecycle

    pub(crate) fn create_terminal(
        self: &Arc<Self>,
        kind: TerminalKind,
        name: &str,
        signature: yogi_protocol::Signature,
    ) -> Result<(u32, TerminalInfo)> {
        let resolved = self.resolve_name(name)?;
        let info =
            TerminalInfo { kind, signature, name: resolved.to_string() };

        let mut effects = Effects::default();
        let id;
        {
            let mut st = self.state.lock().unwrap();
            id = st.next_terminal_id;
            st.next_terminal_id += 1;

            let record = TerminalRecord {
                info: info.clone(),
                strand: Strand::new(&self.scheduler),
                recv_queue: VecDeque::new(),
                recv_handler: None,
                scatter_handler: None,
                await_binding: None,
                await_subscription: None,
                published_cache: None,
                seen_cache: None,
                pending_scattered: HashSet::new(),
            };
            st.terminals.insert(id, record);

            let mut out = Outgoing::default();
            self.local_terminal_added(&mut st, &mut effects, &mut out, id, &info);

            if let Some(target_kind) = kind.builtin_binding_target() {
                let target = TerminalInfo {
                    kind: target_kind,
                    signature,
                    name: info.name.clone(),
                };
                st.by_builtin_target.entry(target.clone()).or_default().insert(id);
                self.local_interest_added(&mut st, &mut effects, &mut out, &target, id);
            }
            out.flush(&st);
        }
        effects.run();

        debug!("created {} with id {}", info, id);
        Ok((id, info))
    }

    fn local_terminal_added(
        &self,
        st: &mut State,
        effects: &mut Effects,
        out: &mut Outgoing,
        id: u32,
        info: &TerminalInfo,
    ) {
        let sources_before = st.term_sources(info);
        let first_unit = !st.local_infos.contains_key(info);
        st.local_infos.entry(info.clone()).or_default().insert(id);

        if first_unit {
            let conn_ids: Vec<u32> = st.conns.keys().copied().collect();
            for conn in conn_ids {
                let contrib =
                    st.conns[&conn].remote_terminals.contains(info) as usize;
                if sources_before - contrib == 0 {
                    out.announce(conn).terminals.push(info.clone());
                }
            }
            if self.kind == EndpointKind::Node {
                self.known_add(st, effects, info);
            }
        }
    }

    fn local_interest_added(
        &self,
        st: &mut State,
        effects: &mut Effects,
        out: &mut Outgoing,
        target: &TerminalInfo,
        holder: u32,
    ) {
        // serve the cache straight away if a replay already came past
        if target.kind.is_cached() {
            if let Some(payload) = st.replay_caches.get(target).cloned() {
                self.enqueue_message(st, effects, holder, payload, true);
            } else {
                st.local_cache_waiters.entry(target.clone()).or_default().insert(holder);
            }
        }

        let sources_before = st.interest_sources(target);
        let count = st.local_interests.entry(target.clone()).or_insert(0);
        *count += 1;
        if *count == 1 {
            // first local unit; tell every connection that could not
            // see this interest yet
            let conn_ids: Vec<u32> = st.conns.keys().copied().collect();
            for conn in conn_ids {
                let contrib =
                    st.conns[&conn].remote_interests.contains(target) as usize;
                if sources_before - contrib == 0 {
                    out.announce(conn).interests.push(target.clone());
                }
            }
        }
    }

    fn local_interest_released(
        &self,
        st: &mut State,
        out: &mut Outgoing,
        target: &TerminalInfo,
        holder: u32,
    ) {
        if let Some(waiters) = st.local_cache_waiters.get_mut(target) {
            waiters.remove(&holder);
            if waiters.is_empty() {
                st.local_cache_waiters.remove(target);
            }
        }

        let Some(count) = st.local_interests.get_mut(target) else {
            return;
        };
        *count -= 1;
        if *count > 0 {
            return;
        }
        st.local_interests.remove(target);

        let sources_after = st.interest_sources(target);
        let conn_ids: Vec<u32> = st.conns.keys().copied().collect();
        for conn in conn_ids {
            let contrib = st.conns[&conn].remote_interests.contains(target) as usize;
            if sources_after - contrib == 0 {
                out.retract(conn).interests.push(target.clone());
            }
        }
        if sources_after == 0 {
            st.replay_caches.remove(target);
        }
    }

    pub(crate) fn destroy_terminal(self: &Arc<Self>, id: u32) {
        let mut inline: Vec<Box<dyn FnOnce() + Send>> = Vec::new();
        {
            let mut st = self.state.lock().unwrap();
            let Some(record) = st.terminals.remove(&id) else {
                return;
            };

            if let Some(handler) = record.recv_handler {
                inline.push(Box::new(move || handler(Err(Error::Canceled))));
            }
            if let Some(handler) = record.scatter_handler {
                inline.push(Box::new(move || handler(Err(Error::Canceled))));
            }
            if let Some(handler) = record.await_binding {
                inline.push(Box::new(move || handler(Err(Error::Canceled))));
            }
            if let Some(handler) = record.await_subscription {
                inline.push(Box::new(move || handler(Err(Error::Canceled))));
            }

            // operations initiated by this terminal complete canceled
            let op_ids: Vec<u32> =
                st.ops.iter().filter(|(_, o)| o.terminal == id).map(|(k, _)| *k).collect();
            for op in op_ids {
                let op_record = st.ops.remove(&op).unwrap();
                op_record.shared.dead.store(true, Ordering::SeqCst);
                for conn in &op_record.pending_conns {
                    if let Some(seat) = st.conns.get(conn) {
                        seat.tx.send(TransportMsg::GatherCancel { op });
                    }
                }
                let shared = op_record.shared;
                inline.push(Box::new(move || {
                    let mut handler = shared.handler.lock().unwrap();
                    let _ = (handler)(Err(Error::Canceled));
                }));
            }

            // unanswered scattered messages surface BINDING_DESTROYED
            // to their requesters
            for op in record.pending_scattered.iter().copied().collect::<Vec<_>>() {
                Self::finish_local_response(
                    &mut st,
                    op,
                    id,
                    gather_flags::BINDING_DESTROYED,
                    vec![],
                );
            }

            let mut out = Outgoing::default();
            let mut effects = Effects::default();

            if let Some(ids) = st.local_infos.get_mut(&record.info) {
                ids.remove(&id);
                if ids.is_empty() {
                    st.local_infos.remove(&record.info);
                    let sources_after = st.term_sources(&record.info);
                    let conn_ids: Vec<u32> = st.conns.keys().copied().collect();
                    for conn in conn_ids {
                        let contrib =
                            st.conns[&conn].remote_terminals.contains(&record.info) as usize;
                        if sources_after - contrib == 0 {
                            out.retract(conn).terminals.push(record.info.clone());
                        }
                    }
                    if self.kind == EndpointKind::Node {
                        self.known_remove(&mut st, &mut effects, &record.info);
                    }
                }
            }

            if let Some(target_kind) = record.info.kind.builtin_binding_target() {
                let target = TerminalInfo {
                    kind: target_kind,
                    signature: record.info.signature,
                    name: record.info.name.clone(),
                };
                if let Some(holders) = st.by_builtin_target.get_mut(&target) {
                    holders.remove(&id);
                    if holders.is_empty() {
                        st.by_builtin_target.remove(&target);
                    }
                }
                self.local_interest_released(&mut st, &mut out, &target, id);
            }

            out.flush(&st);
            effects.run();
        }

        // cancellations run on the destroying thread so that they have
        // completed before destruction returns
        for cancellation in inline {
            cancellation();
        }
    }

    // ---------------------------------------------------------------
    // bindings

    pub(crate) fn create_binding(
        self: &Arc<Self>,
        source: u32,
        targets: &str,
    ) -> Result<(u32, TerminalInfo)> {
        let resolved = self.resolve_name(targets).map_err(|_| {
            Error::InvalidTarget(String::from(targets))
        })?;

        let mut effects = Effects::default();
        let id;
        let target;
        {
            let mut st = self.state.lock().unwrap();
            let record = st.terminals.get(&source).ok_or(Error::Unknown)?;
            if !record.info.kind.is_primitive() {
                return Err(Error::WrongTerminalKind);
            }
            target = TerminalInfo {
                kind: record.info.kind,
                signature: record.info.signature,
                name: resolved.to_string(),
            };

            id = st.next_binding_id;
            st.next_binding_id += 1;
            st.bindings.insert(
                id,
                BindingRecord {
                    source,
                    target: target.clone(),
                    strand: Strand::new(&self.scheduler),
                    await_change: None,
                },
            );
            st.by_binding_target.entry(target.clone()).or_default().insert(id);

            let mut out = Outgoing::default();
            self.local_interest_added(&mut st, &mut effects, &mut out, &target, source);
            out.flush(&st);
        }
        effects.run();

        Ok((id, target))
    }

    pub(crate) fn destroy_binding(self: &Arc<Self>, id: u32) {
        let mut inline: Vec<Box<dyn FnOnce() + Send>> = Vec::new();
        {
            let mut st = self.state.lock().unwrap();
            let Some(record) = st.bindings.remove(&id) else {
                return;
            };
            if let Some(handler) = record.await_change {
                inline.push(Box::new(move || handler(Err(Error::Canceled))));
            }
            if let Some(ids) = st.by_binding_target.get_mut(&record.target) {
                ids.remove(&id);
                if ids.is_empty() {
                    st.by_binding_target.remove(&record.target);
                }
            }
            let mut out = Outgoing::default();
            self.local_interest_released(&mut st, &mut out, &record.target, record.source);
            out.flush(&st);
        }
        for cancellation in inline {
            cancellation();
        }
    }

    pub(crate) fn binding_state(&self, id: u32) -> Result<BindingState> {
        let st = self.state.lock().unwrap();
        let record = st.bindings.get(&id).ok_or(Error::Unknown)?;
        Ok(if st.bound(&record.target) {
            BindingState::Established
        } else {
            BindingState::Released
        })
    }

    pub(crate) fn async_await_binding_change(
        &self,
        id: u32,
        handler: BindingStateHandler,
    ) -> Result<()> {
        let mut st = self.state.lock().unwrap();
        let record = st.bindings.get_mut(&id).ok_or(Error::Unknown)?;
        if record.await_change.is_some() {
            return Err(Error::AlreadyAwaiting);
        }
        record.await_change = Some(handler);
        Ok(())
    }

    pub(crate) fn cancel_await_binding_change(&self, id: u32) {
        let taken = {
            let mut st = self.state.lock().unwrap();
            st.bindings.get_mut(&id).and_then(|r| r.await_change.take().map(|h| (r.strand.clone(), h)))
        };
        if let Some((strand, handler)) = taken {
            strand.post(move || handler(Err(Error::Canceled)));
        }
    }

    pub(crate) fn binding_strand(&self, id: u32) -> Option<Strand> {
        self.state.lock().unwrap().bindings.get(&id).map(|r| r.strand.clone())
    }

    // ---------------------------------------------------------------
    // publishing

    pub(crate) fn publish(&self, id: u32, payload: &[u8]) -> Result<()> {
        if payload.len() > MAX_MESSAGE_SIZE {
            return Err(Error::BufferTooSmall);
        }

        let st = &mut *self.state.lock().unwrap();
        let record = st.terminals.get_mut(&id).ok_or(Error::Unknown)?;
        if !record.info.kind.can_publish() {
            return Err(Error::WrongTerminalKind);
        }

        // the cache updates even when the publish fails with not-bound;
        // that is what makes the payload available for replay once a
        // binder shows up
        if record.info.kind.is_cached() {
            record.published_cache = Some(payload.to_vec());
            record.seen_cache = Some(payload.to_vec());
        }

        let info = record.info.clone();
        if !st.subscribed(&info) {
            return Err(Error::NotBound);
        }

        for seat in st.conns.values() {
            if seat.remote_interests.contains(&info) {
                seat.tx.send(TransportMsg::Publish {
                    src: info.clone(),
                    payload: payload.to_vec(),
                    cached: false,
                });
            }
        }
        Ok(())
    }

    pub(crate) fn get_cached(&self, id: u32) -> Result<Vec<u8>> {
        let st = self.state.lock().unwrap();
        let record = st.terminals.get(&id).ok_or(Error::Unknown)?;
        if !record.info.kind.is_cached() {
            return Err(Error::WrongTerminalKind);
        }
        record.seen_cache.clone().ok_or(Error::NoCache)
    }

    // ---------------------------------------------------------------
    // receiving published messages

    pub(crate) fn async_receive_message(&self, id: u32, handler: ReceiveHandler) -> Result<()> {
        let mut effects = Effects::default();
        {
            let mut st = self.state.lock().unwrap();
            let record = st.terminals.get_mut(&id).ok_or(Error::Unknown)?;
            if !record.info.kind.can_receive_published() {
                return Err(Error::WrongTerminalKind);
            }
            if record.recv_handler.is_some() {
                return Err(Error::AlreadyAwaiting);
            }
            match record.recv_queue.pop_front() {
                Some(message) => {
                    effects.post(&record.strand, move || handler(Ok(message)));
                }
                None => record.recv_handler = Some(handler),
            }
        }
        effects.run();
        Ok(())
    }

    pub(crate) fn cancel_receive_message(&self, id: u32) {
        let taken = {
            let mut st = self.state.lock().unwrap();
            st.terminals
                .get_mut(&id)
                .and_then(|r| r.recv_handler.take().map(|h| (r.strand.clone(), h)))
        };
        if let Some((strand, handler)) = taken {
            strand.post(move || handler(Err(Error::Canceled)));
        }
    }

    fn enqueue_message(
        &self,
        st: &mut State,
        effects: &mut Effects,
        id: u32,
        payload: Vec<u8>,
        cached: bool,
    ) {
        let Some(record) = st.terminals.get_mut(&id) else {
            return;
        };
        if record.info.kind.is_cached() {
            record.seen_cache = Some(payload.clone());
        }
        record.recv_queue.push_back(Message { payload, cached });
        if let Some(handler) = record.recv_handler.take() {
            let message = record.recv_queue.pop_front().unwrap();
            effects.post(&record.strand, move || handler(Ok(message)));
        }
    }

    // ---------------------------------------------------------------
    // binding / subscription observation on terminals

    pub(crate) fn builtin_binding_state(&self, id: u32) -> Result<BindingState> {
        let st = self.state.lock().unwrap();
        let record = st.terminals.get(&id).ok_or(Error::Unknown)?;
        let target = builtin_target(&record.info).ok_or(Error::WrongTerminalKind)?;
        Ok(if st.bound(&target) { BindingState::Established } else { BindingState::Released })
    }

    pub(crate) fn async_await_builtin_binding_change(
        &self,
        id: u32,
        handler: BindingStateHandler,
    ) -> Result<()> {
        let mut st = self.state.lock().unwrap();
        let record = st.terminals.get_mut(&id).ok_or(Error::Unknown)?;
        if builtin_target(&record.info).is_none() {
            return Err(Error::WrongTerminalKind);
        }
        if record.await_binding.is_some() {
            return Err(Error::AlreadyAwaiting);
        }
        record.await_binding = Some(handler);
        Ok(())
    }

    pub(crate) fn cancel_await_builtin_binding_change(&self, id: u32) {
        let taken = {
            let mut st = self.state.lock().unwrap();
            st.terminals
                .get_mut(&id)
                .and_then(|r| r.await_binding.take().map(|h| (r.strand.clone(), h)))
        };
        if let Some((strand, handler)) = taken {
            strand.post(move || handler(Err(Error::Canceled)));
        }
    }

    pub(crate) fn subscription_state(&self, id: u32) -> Result<SubscriptionState> {
        let st = self.state.lock().unwrap();
        let record = st.terminals.get(&id).ok_or(Error::Unknown)?;
        if !record.info.kind.is_subscribable() {
            return Err(Error::WrongTerminalKind);
        }
        Ok(if st.subscribed(&record.info) {
            SubscriptionState::Subscribed
        } else {
            SubscriptionState::Unsubscribed
        })
    }

    pub(crate) fn async_await_subscription_change(
        &self,
        id: u32,
        handler: SubscriptionStateHandler,
    ) -> Result<()> {
        let mut st = self.state.lock().unwrap();
        let record = st.terminals.get_mut(&id).ok_or(Error::Unknown)?;
        if !record.info.kind.is_subscribable() {
            return Err(Error::WrongTerminalKind);
        }
        if record.await_subscription.is_some() {
            return Err(Error::AlreadyAwaiting);
        }
        record.await_subscription = Some(handler);
        Ok(())
    }

    pub(crate) fn cancel_await_subscription_change(&self, id: u32) {
        let taken = {
            let mut st = self.state.lock().unwrap();
            st.terminals
                .get_mut(&id)
                .and_then(|r| r.await_subscription.take().map(|h| (r.strand.clone(), h)))
        };
        if let Some((strand, handler)) = taken {
            strand.post(move || handler(Err(Error::Canceled)));
        }
    }

    pub(crate) fn terminal_strand(&self, id: u32) -> Option<Strand> {
        self.state.lock().unwrap().terminals.get(&id).map(|r| r.strand.clone())
    }

    // ---------------------------------------------------------------
    // scatter-gather, initiator side

    pub(crate) fn async_scatter(
        self: &Arc<Self>,
        id: u32,
        payload: &[u8],
        handler: GatherHandler,
    ) -> Result<u32> {
        if payload.len() > MAX_MESSAGE_SIZE {
            return Err(Error::BufferTooSmall);
        }

        let mut effects = Effects::default();
        let op;
        {
            let st = &mut *self.state.lock().unwrap();
            let record = st.terminals.get(&id).ok_or(Error::Unknown)?;
            if !record.info.kind.can_scatter() {
                return Err(Error::WrongTerminalKind);
            }
            let info = record.info.clone();
            let strand = record.strand.clone();

            op = st.next_op_id;
            st.next_op_id += 1;
            let shared =
                Arc::new(OpShared { handler: Mutex::new(handler), dead: AtomicBool::new(false) });

            let fanout: Vec<u32> = st
                .conns
                .iter()
                .filter(|(_, s)| s.remote_interests.contains(&info))
                .map(|(c, _)| *c)
                .collect();

            if fanout.is_empty() {
                // nobody is listening; exactly one FINISHED|DEAF response
                let this = Arc::clone(self);
                let message = GatheredMessage {
                    operation_id: op,
                    flags: gather_flags::FINISHED | gather_flags::DEAF,
                    payload: vec![],
                };
                effects.post(&strand, move || {
                    Self::deliver_gather(&this, &shared, op, message);
                });
            } else {
                for conn in &fanout {
                    st.conns[conn].tx.send(TransportMsg::Scatter {
                        src: info.clone(),
                        op,
                        payload: payload.to_vec(),
                    });
                }
                st.ops.insert(
                    op,
                    OpRecord { terminal: id, shared, pending_conns: fanout.into_iter().collect() },
                );
            }
        }
        effects.run();
        Ok(op)
    }

    fn deliver_gather(this: &Arc<Self>, shared: &Arc<OpShared>, op: u32, msg: GatheredMessage) {
        if shared.dead.load(Ordering::SeqCst) {
            return;
        }
        let flow = {
            let mut handler = shared.handler.lock().unwrap();
            (handler)(Ok(msg))
        };
        if flow == ControlFlow::Stop {
            Self::cancel_operation(this, op, false);
        }
    }

    /// Tear down an initiated operation. With `notify` the handler
    /// fires once more with *canceled*.
    pub(crate) fn cancel_operation(this: &Arc<Self>, op: u32, notify: bool) {
        let mut post: Option<(Strand, Arc<OpShared>)> = None;
        {
            let st = &mut *this.state.lock().unwrap();
            let Some(record) = st.ops.remove(&op) else {
                return;
            };
            record.shared.dead.store(true, Ordering::SeqCst);
            for conn in &record.pending_conns {
                if let Some(seat) = st.conns.get(conn) {
                    seat.tx.send(TransportMsg::GatherCancel { op });
                }
            }
            if notify {
                if let Some(rec) = st.terminals.get(&record.terminal) {
                    post = Some((rec.strand.clone(), record.shared));
                }
            }
        }
        if let Some((strand, shared)) = post {
            strand.post(move || {
                let mut handler = shared.handler.lock().unwrap();
                let _ = (handler)(Err(Error::Canceled));
            });
        }
    }

    // ---------------------------------------------------------------
    // scatter-gather, responder side

    pub(crate) fn async_receive_scattered(
        &self,
        id: u32,
        handler: ScatterReceiveHandler,
    ) -> Result<()> {
        let mut st = self.state.lock().unwrap();
        let record = st.terminals.get_mut(&id).ok_or(Error::Unknown)?;
        if !record.info.kind.can_receive_scattered() {
            return Err(Error::WrongTerminalKind);
        }
        if record.scatter_handler.is_some() {
            return Err(Error::AlreadyAwaiting);
        }
        record.scatter_handler = Some(handler);
        Ok(())
    }

    pub(crate) fn cancel_receive_scattered(&self, id: u32) {
        let taken = {
            let mut st = self.state.lock().unwrap();
            st.terminals
                .get_mut(&id)
                .and_then(|r| r.scatter_handler.take().map(|h| (r.strand.clone(), h)))
        };
        if let Some((strand, handler)) = taken {
            strand.post(move || handler(Err(Error::Canceled)));
        }
    }

    pub(crate) fn respond_scattered(
        &self,
        terminal: u32,
        op: u32,
        payload: Vec<u8>,
        ignore: bool,
    ) -> Result<()> {
        if payload.len() > MAX_MESSAGE_SIZE {
            return Err(Error::BufferTooSmall);
        }

        let st = &mut *self.state.lock().unwrap();
        let record = st.terminals.get_mut(&terminal).ok_or(Error::Unknown)?;
        if !record.pending_scattered.remove(&op) {
            // the operation was canceled or already answered
            return Err(Error::Canceled);
        }
        let flags = if ignore { gather_flags::IGNORED } else { 0 };
        Self::finish_local_response(st, op, terminal, flags, payload);
        Ok(())
    }

    fn finish_local_response(
        st: &mut State,
        op: u32,
        terminal: u32,
        flags: u8,
        payload: Vec<u8>,
    ) {
        let Some(routed) = st.routed.get_mut(&op) else {
            return;
        };
        routed.local_pending.remove(&terminal);
        let remaining = routed.local_pending.len() + routed.down_conns.len();
        let upstream_conn = routed.upstream_conn;
        let upstream_op = routed.upstream_op;

        if let Some(seat) = st.conns.get(&upstream_conn) {
            seat.tx.send(TransportMsg::Gather {
                op: upstream_op,
                flags,
                payload,
                last: remaining == 0,
            });
        }
        if remaining == 0 {
            st.routed.remove(&op);
            st.routed_by_upstream.remove(&(upstream_conn, upstream_op));
        }
    }

    // ---------------------------------------------------------------
    // known terminals (node)

    pub(crate) fn known_terminals(&self) -> Vec<TerminalInfo> {
        self.state.lock().unwrap().known_order.clone()
    }

    pub(crate) fn async_await_known_change(&self, handler: KnownTerminalsHandler) -> Result<()> {
        let mut effects = Effects::default();
        {
            let mut st = self.state.lock().unwrap();
            match st.known_backlog.pop_front() {
                Some(delta) => effects.post(&self.strand, move || handler(Ok(delta))),
                None => {
                    if st.known_waiter.is_some() {
                        return Err(Error::AlreadyAwaiting);
                    }
                    st.known_waiter = Some(handler);
                }
            }
        }
        effects.run();
        Ok(())
    }

    pub(crate) fn cancel_await_known_change(&self) {
        let taken = self.state.lock().unwrap().known_waiter.take();
        if let Some(handler) = taken {
            self.strand.post(move || handler(Err(Error::Canceled)));
        }
    }

    fn known_add(&self, st: &mut State, effects: &mut Effects, info: &TerminalInfo) {
        let count = st.known_count.entry(info.clone()).or_insert(0);
        *count += 1;
        if *count == 1 {
            st.known_order.push(info.clone());
            self.known_delta(st, effects, info.clone(), ChangeType::Added);
        }
    }

    fn known_remove(&self, st: &mut State, effects: &mut Effects, info: &TerminalInfo) {
        let Some(count) = st.known_count.get_mut(info) else {
            return;
        };
        *count -= 1;
        if *count == 0 {
            st.known_count.remove(info);
            st.known_order.retain(|i| i != info);
            self.known_delta(st, effects, info.clone(), ChangeType::Removed);
        }
    }

    fn known_delta(
        &self,
        st: &mut State,
        effects: &mut Effects,
        info: TerminalInfo,
        change: ChangeType,
    ) {
        match st.known_waiter.take() {
            Some(handler) => {
                effects.post(&self.strand, move || handler(Ok((info, change))));
            }
            None => st.known_backlog.push_back((info, change)),
        }
    }

    // ---------------------------------------------------------------
    // connection attachment

    /// Install a seat for a remote (TCP) connection and send the
    /// initial announcement. The caller has already exchanged Hello
    /// frames.
    pub(crate) fn attach_remote(
        self: &Arc<Self>,
        tx: crossbeam_channel::Sender<TransportMsg>,
        peer_kind: EndpointKind,
        peer_node_id: u64,
    ) -> Result<u32> {
        let mut st = self.state.lock().unwrap();
        if self.kind == EndpointKind::Leaf && !st.conns.is_empty() {
            return Err(Error::AssignmentFailed(String::from(
                "the leaf already has a connection",
            )));
        }
        if self.kind == EndpointKind::Node
            && peer_kind == EndpointKind::Node
            && (peer_node_id == self.id || st.remote_nodes.contains_key(&peer_node_id))
        {
            return Err(Error::AssignmentFailed(String::from(
                "the connection would close a loop in the node graph",
            )));
        }

        let id = st.next_conn_id;
        st.next_conn_id += 1;

        let seat = Seat::new(SeatTx::Channel(tx));
        let deltas = self.initial_deltas(&st);
        if !deltas.is_empty() {
            seat.tx.send(TransportMsg::Announce(deltas));
        }
        st.conns.insert(id, seat);
        Ok(id)
    }

    fn initial_deltas(&self, st: &State) -> Deltas {
        let mut deltas = Deltas::default();
        for info in st.local_infos.keys() {
            deltas.terminals.push(info.clone());
        }
        for info in st.remote_terminals.keys() {
            if !st.local_infos.contains_key(info) {
                deltas.terminals.push(info.clone());
            }
        }
        for info in st.local_interests.keys() {
            deltas.interests.push(info.clone());
        }
        for info in st.remote_interests.keys() {
            if !st.local_interests.contains_key(info) {
                deltas.interests.push(info.clone());
            }
        }
        if self.kind == EndpointKind::Node {
            deltas.nodes.push(self.id);
        }
        for id in st.remote_nodes.keys() {
            deltas.nodes.push(*id);
        }
        deltas
    }

    /// Tear a seat down, retracting everything the peer announced and
    /// completing operations that depended on it.
    pub(crate) fn detach(self: &Arc<Self>, conn: u32) {
        let mut effects = Effects::default();
        {
            let st = &mut *self.state.lock().unwrap();
            let Some(seat) = st.conns.remove(&conn) else {
                return;
            };

            for waiters in st.cache_waiters.values_mut() {
                waiters.remove(&conn);
            }
            st.cache_waiters.retain(|_, w| !w.is_empty());

            let mut out = Outgoing::default();
            for info in &seat.remote_terminals {
                self.remote_terminal_dropped(st, &mut effects, &mut out, info);
            }
            for info in &seat.remote_interests {
                self.remote_interest_dropped(st, &mut effects, &mut out, info);
            }
            for id in &seat.remote_nodes {
                self.remote_node_dropped(st, &mut out, *id);
            }

            // pending subtrees of operations we initiated complete with
            // CONNECTION_LOST
            let op_ids: Vec<u32> = st
                .ops
                .iter()
                .filter(|(_, o)| o.pending_conns.contains(&conn))
                .map(|(k, _)| *k)
                .collect();
            for op in op_ids {
                let (finished, shared, terminal) = {
                    let record = st.ops.get_mut(&op).unwrap();
                    record.pending_conns.remove(&conn);
                    (record.pending_conns.is_empty(), Arc::clone(&record.shared), record.terminal)
                };
                let flags = gather_flags::CONNECTION_LOST
                    | if finished { gather_flags::FINISHED } else { 0 };
                if let Some(rec) = st.terminals.get(&terminal) {
                    let this = Arc::clone(self);
                    let message = GatheredMessage { operation_id: op, flags, payload: vec![] };
                    effects.post(&rec.strand, move || {
                        Self::deliver_gather(&this, &shared, op, message);
                    });
                }
                if finished {
                    st.ops.remove(&op);
                }
            }

            // routed operations that came in over this connection die
            let routed_in: Vec<u32> = st
                .routed
                .iter()
                .filter(|(_, r)| r.upstream_conn == conn)
                .map(|(k, _)| *k)
                .collect();
            for key in routed_in {
                let routed = st.routed.remove(&key).unwrap();
                st.routed_by_upstream.remove(&(routed.upstream_conn, routed.upstream_op));
                for terminal in &routed.local_pending {
                    if let Some(rec) = st.terminals.get_mut(terminal) {
                        rec.pending_scattered.remove(&key);
                    }
                }
                for down in &routed.down_conns {
                    if let Some(seat) = st.conns.get(down) {
                        seat.tx.send(TransportMsg::GatherCancel { op: key });
                    }
                }
            }

            // routed operations that were waiting on this connection
            // downstream report CONNECTION_LOST upstream
            let routed_out: Vec<u32> = st
                .routed
                .iter()
                .filter(|(_, r)| r.down_conns.contains(&conn))
                .map(|(k, _)| *k)
                .collect();
            for key in routed_out {
                let (upstream_conn, upstream_op, remaining) = {
                    let routed = st.routed.get_mut(&key).unwrap();
                    routed.down_conns.remove(&conn);
                    (
                        routed.upstream_conn,
                        routed.upstream_op,
                        routed.local_pending.len() + routed.down_conns.len(),
                    )
                };
                if let Some(seat) = st.conns.get(&upstream_conn) {
                    seat.tx.send(TransportMsg::Gather {
                        op: upstream_op,
                        flags: gather_flags::CONNECTION_LOST,
                        payload: vec![],
                        last: remaining == 0,
                    });
                }
                if remaining == 0 {
                    st.routed.remove(&key);
                    st.routed_by_upstream.remove(&(upstream_conn, upstream_op));
                }
            }

            out.flush(st);
        }
        effects.run();
    }

    fn remote_terminal_dropped(
        &self,
        st: &mut State,
        effects: &mut Effects,
        out: &mut Outgoing,
        info: &TerminalInfo,
    ) {
        if let Some(agg) = st.remote_terminals.get_mut(info) {
            *agg -= 1;
            if *agg == 0 {
                st.remote_terminals.remove(info);
                self.on_remote_terminal_vanished(st, effects, info);
            }
        }
        if self.kind == EndpointKind::Node {
            self.known_remove(st, effects, info);
        }
        let sources_after = st.term_sources(info);
        let conn_ids: Vec<u32> = st.conns.keys().copied().collect();
        for conn in conn_ids {
            let contrib = st.conns[&conn].remote_terminals.contains(info) as usize;
            if sources_after - contrib == 0 {
                out.retract(conn).terminals.push(info.clone());
            }
        }
    }

    fn remote_interest_dropped(
        &self,
        st: &mut State,
        effects: &mut Effects,
        out: &mut Outgoing,
        info: &TerminalInfo,
    ) {
        if let Some(agg) = st.remote_interests.get_mut(info) {
            *agg -= 1;
            if *agg == 0 {
                st.remote_interests.remove(info);
                self.on_unsubscribed(st, effects, info);
            }
        }
        let sources_after = st.interest_sources(info);
        let conn_ids: Vec<u32> = st.conns.keys().copied().collect();
        for conn in conn_ids {
            let contrib = st.conns[&conn].remote_interests.contains(info) as usize;
            if sources_after - contrib == 0 {
                out.retract(conn).interests.push(info.clone());
            }
        }
        if sources_after == 0 && !st.local_interests.contains_key(info) {
            st.replay_caches.remove(info);
        }
    }

    fn remote_node_dropped(&self, st: &mut State, out: &mut Outgoing, id: u64) {
        if let Some(agg) = st.remote_nodes.get_mut(&id) {
            *agg -= 1;
            if *agg == 0 {
                st.remote_nodes.remove(&id);
            }
        }
        let own = if self.kind == EndpointKind::Node { Some(self.id) } else { None };
        let sources_after = st.node_sources(own, id);
        let conn_ids: Vec<u32> = st.conns.keys().copied().collect();
        for conn in conn_ids {
            let contrib = st.conns[&conn].remote_nodes.contains(&id) as usize;
            if sources_after - contrib == 0 {
                out.retract(conn).nodes.push(id);
            }
        }
    }

    // ---------------------------------------------------------------
    // frame dispatch

    pub(crate) fn dispatch(this: &Arc<Self>, conn: u32, msg: TransportMsg) {
        let mut effects = Effects::default();
        {
            let st = &mut *this.state.lock().unwrap();
            if !st.conns.contains_key(&conn) {
                return;
            }
            match msg {
                TransportMsg::Announce(deltas) => {
                    Self::apply_deltas(this, st, &mut effects, conn, deltas, true)
                }
                TransportMsg::Retract(deltas) => {
                    Self::apply_deltas(this, st, &mut effects, conn, deltas, false)
                }
                TransportMsg::Publish { src, payload, cached } => {
                    Self::route_publish(this, st, &mut effects, conn, src, payload, cached)
                }
                TransportMsg::Scatter { src, op, payload } => {
                    Self::route_scatter(this, st, &mut effects, conn, src, op, payload)
                }
                TransportMsg::Gather { op, flags, payload, last } => {
                    Self::handle_gather(this, st, &mut effects, conn, op, flags, payload, last)
                }
                TransportMsg::GatherNone { op } => {
                    Self::handle_gather_none(this, st, &mut effects, conn, op)
                }
                TransportMsg::GatherCancel { op } => Self::handle_gather_cancel(st, conn, op),
                TransportMsg::Heartbeat => {}
                TransportMsg::Hello(_) => {
                    warn!("ignoring unexpected Hello frame on an open connection");
                }
            }
        }
        effects.run();
    }

    fn apply_deltas(
        this: &Arc<Self>,
        st: &mut State,
        effects: &mut Effects,
        conn: u32,
        deltas: Deltas,
        added: bool,
    ) {
        let mut out = Outgoing::default();

        for info in deltas.terminals {
            let sources_before = st.term_sources(&info);
            let changed = {
                let Some(seat) = st.conns.get_mut(&conn) else { return };
                if added {
                    seat.remote_terminals.insert(info.clone())
                } else {
                    seat.remote_terminals.remove(&info)
                }
            };
            if !changed {
                continue;
            }

            if added {
                let agg = st.remote_terminals.entry(info.clone()).or_insert(0);
                *agg += 1;
                if *agg == 1 {
                    this.on_remote_terminal_appeared(st, effects, &info);
                }
                if this.kind == EndpointKind::Node {
                    this.known_add(st, effects, &info);
                }
                let conn_ids: Vec<u32> =
                    st.conns.keys().copied().filter(|c| *c != conn).collect();
                for other in conn_ids {
                    let contrib = st.conns[&other].remote_terminals.contains(&info) as usize;
                    if sources_before - contrib == 0 {
                        out.announce(other).terminals.push(info.clone());
                    }
                }
            } else {
                this.remote_terminal_dropped(st, effects, &mut out, &info);
            }
        }

        for info in deltas.interests {
            let sources_before = st.interest_sources(&info);
            let changed = {
                let Some(seat) = st.conns.get_mut(&conn) else { return };
                if added {
                    seat.remote_interests.insert(info.clone())
                } else {
                    seat.remote_interests.remove(&info)
                }
            };
            if !changed {
                continue;
            }

            if added {
                let agg = st.remote_interests.entry(info.clone()).or_insert(0);
                *agg += 1;
                if *agg == 1 {
                    this.on_subscribed(st, effects, &info);
                }

                // a fresh interest in a cached variant gets the latest
                // payload replayed exactly once
                if info.kind.is_cached() {
                    this.serve_cache(st, conn, &info);
                }

                let conn_ids: Vec<u32> =
                    st.conns.keys().copied().filter(|c| *c != conn).collect();
                for other in conn_ids {
                    let contrib = st.conns[&other].remote_interests.contains(&info) as usize;
                    if sources_before - contrib == 0 {
                        out.announce(other).interests.push(info.clone());
                    }
                }
            } else {
                if let Some(waiters) = st.cache_waiters.get_mut(&info) {
                    waiters.remove(&conn);
                    if waiters.is_empty() {
                        st.cache_waiters.remove(&info);
                    }
                }
                this.remote_interest_dropped(st, effects, &mut out, &info);
            }
        }

        for id in deltas.nodes {
            let own = if this.kind == EndpointKind::Node { Some(this.id) } else { None };
            let sources_before = st.node_sources(own, id);
            let changed = {
                let Some(seat) = st.conns.get_mut(&conn) else { return };
                if added {
                    seat.remote_nodes.insert(id)
                } else {
                    seat.remote_nodes.remove(&id)
                }
            };
            if !changed {
                continue;
            }

            if added {
                *st.remote_nodes.entry(id).or_insert(0) += 1;
                let conn_ids: Vec<u32> =
                    st.conns.keys().copied().filter(|c| *c != conn).collect();
                for other in conn_ids {
                    let contrib = st.conns[&other].remote_nodes.contains(&id) as usize;
                    if sources_before - contrib == 0 {
                        out.announce(other).nodes.push(id);
                    }
                }
            } else {
                this.remote_node_dropped(st, &mut out, id);
            }
        }

        out.flush(st);
    }

    fn serve_cache(&self, st: &mut State, conn: u32, info: &TerminalInfo) {
        // a local owner's published payload wins over a forwarded copy
        let local_cache = st
            .local_infos
            .get(info)
            .and_then(|ids| {
                ids.iter().find_map(|id| {
                    st.terminals.get(id).and_then(|r| r.published_cache.clone())
                })
            })
            .or_else(|| st.replay_caches.get(info).cloned());

        match local_cache {
            Some(payload) => {
                if let Some(seat) = st.conns.get(&conn) {
                    seat.tx.send(TransportMsg::Publish {
                        src: info.clone(),
                        payload,
                        cached: true,
                    });
                }
            }
            None => {
                st.cache_waiters.entry(info.clone()).or_default().insert(conn);
            }
        }
    }

    fn on_remote_terminal_appeared(
        &self,
        st: &mut State,
        effects: &mut Effects,
        info: &TerminalInfo,
    ) {
        let binding_ids: Vec<u32> = st
            .by_binding_target
            .get(info)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default();
        for id in binding_ids {
            if let Some(record) = st.bindings.get_mut(&id) {
                if let Some(handler) = record.await_change.take() {
                    effects.post(&record.strand, move || handler(Ok(BindingState::Established)));
                }
            }
        }

        let terminal_ids: Vec<u32> = st
            .by_builtin_target
            .get(info)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default();
        for id in terminal_ids {
            if let Some(record) = st.terminals.get_mut(&id) {
                if let Some(handler) = record.await_binding.take() {
                    effects.post(&record.strand, move || handler(Ok(BindingState::Established)));
                }
            }
        }
    }

    fn on_remote_terminal_vanished(
        &self,
        st: &mut State,
        effects: &mut Effects,
        info: &TerminalInfo,
    ) {
        st.replay_caches.remove(info);

        let binding_ids: Vec<u32> = st
            .by_binding_target
            .get(info)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default();
        for id in binding_ids {
            if let Some(record) = st.bindings.get_mut(&id) {
                if let Some(handler) = record.await_change.take() {
                    effects.post(&record.strand, move || handler(Ok(BindingState::Released)));
                }
            }
        }

        let terminal_ids: Vec<u32> = st
            .by_builtin_target
            .get(info)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default();
        for id in terminal_ids {
            if let Some(record) = st.terminals.get_mut(&id) {
                if let Some(handler) = record.await_binding.take() {
                    effects.post(&record.strand, move || handler(Ok(BindingState::Released)));
                }
            }
        }
    }

    fn on_subscribed(&self, st: &mut State, effects: &mut Effects, info: &TerminalInfo) {
        let terminal_ids: Vec<u32> =
            st.local_infos.get(info).map(|s| s.iter().copied().collect()).unwrap_or_default();
        for id in terminal_ids {
            if let Some(record) = st.terminals.get_mut(&id) {
                if let Some(handler) = record.await_subscription.take() {
                    effects
                        .post(&record.strand, move || handler(Ok(SubscriptionState::Subscribed)));
                }
            }
        }
    }

    fn on_unsubscribed(&self, st: &mut State, effects: &mut Effects, info: &TerminalInfo) {
        let terminal_ids: Vec<u32> =
            st.local_infos.get(info).map(|s| s.iter().copied().collect()).unwrap_or_default();
        for id in terminal_ids {
            if let Some(record) = st.terminals.get_mut(&id) {
                if let Some(handler) = record.await_subscription.take() {
                    effects
                        .post(&record.strand, move || handler(Ok(SubscriptionState::Unsubscribed)));
                }
            }
        }
    }

    fn route_publish(
        this: &Arc<Self>,
        st: &mut State,
        effects: &mut Effects,
        conn: u32,
        src: TerminalInfo,
        payload: Vec<u8>,
        cached: bool,
    ) {
        if src.kind.is_cached() {
            st.replay_caches.insert(src.clone(), payload.clone());
        }

        if cached {
            // cache replays go only to whoever is still waiting for one
            let waiters = st.cache_waiters.remove(&src).unwrap_or_default();
            for other in waiters {
                if other == conn {
                    continue;
                }
                if let Some(seat) = st.conns.get(&other) {
                    seat.tx.send(TransportMsg::Publish {
                        src: src.clone(),
                        payload: payload.clone(),
                        cached: true,
                    });
                }
            }
            let local_waiters = st.local_cache_waiters.remove(&src).unwrap_or_default();
            for id in local_waiters {
                this.enqueue_message(st, effects, id, payload.clone(), true);
            }
        } else {
            // a live value supersedes any outstanding replay
            st.cache_waiters.remove(&src);
            st.local_cache_waiters.remove(&src);

            let conn_ids: Vec<u32> = st
                .conns
                .iter()
                .filter(|(c, s)| **c != conn && s.remote_interests.contains(&src))
                .map(|(c, _)| *c)
                .collect();
            for other in conn_ids {
                st.conns[&other].tx.send(TransportMsg::Publish {
                    src: src.clone(),
                    payload: payload.clone(),
                    cached: false,
                });
            }

            for id in Self::local_receivers(st, &src) {
                this.enqueue_message(st, effects, id, payload.clone(), false);
            }
        }
    }

    fn local_receivers(st: &State, src: &TerminalInfo) -> Vec<u32> {
        let mut ids = Vec::new();
        if let Some(binding_ids) = st.by_binding_target.get(src) {
            for b in binding_ids {
                if let Some(record) = st.bindings.get(b) {
                    ids.push(record.source);
                }
            }
        }
        if let Some(terminal_ids) = st.by_builtin_target.get(src) {
            ids.extend(terminal_ids.iter().copied());
        }
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    fn route_scatter(
        this: &Arc<Self>,
        st: &mut State,
        effects: &mut Effects,
        conn: u32,
        src: TerminalInfo,
        upstream_op: u32,
        payload: Vec<u8>,
    ) {
        let key = st.next_op_id;
        st.next_op_id += 1;

        let mut local_pending = HashSet::new();
        let mut ignored = 0usize;

        for id in Self::local_receivers(st, &src) {
            let Some(record) = st.terminals.get_mut(&id) else { continue };
            if !record.info.kind.can_receive_scattered() {
                continue;
            }
            match record.scatter_handler.take() {
                Some(handler) => {
                    record.pending_scattered.insert(key);
                    local_pending.insert(id);
                    let message = ScatteredMessage::new(
                        Arc::clone(this),
                        id,
                        key,
                        payload.clone(),
                    );
                    effects.post(&record.strand, move || handler(Ok(message)));
                }
                // nobody is listening on this terminal right now
                None => ignored += 1,
            }
        }

        let mut down_conns = HashSet::new();
        if this.kind == EndpointKind::Node {
            let targets: Vec<u32> = st
                .conns
                .iter()
                .filter(|(c, s)| **c != conn && s.remote_interests.contains(&src))
                .map(|(c, _)| *c)
                .collect();
            for other in targets {
                st.conns[&other].tx.send(TransportMsg::Scatter {
                    src: src.clone(),
                    op: key,
                    payload: payload.clone(),
                });
                down_conns.insert(other);
            }
        }

        let remaining = local_pending.len() + down_conns.len();
        let Some(seat) = st.conns.get(&conn) else { return };

        if ignored == 0 && remaining == 0 {
            seat.tx.send(TransportMsg::GatherNone { op: upstream_op });
            return;
        }

        for i in 0..ignored {
            seat.tx.send(TransportMsg::Gather {
                op: upstream_op,
                flags: gather_flags::IGNORED,
                payload: vec![],
                last: remaining == 0 && i == ignored - 1,
            });
        }

        if remaining > 0 {
            st.routed.insert(
                key,
                RoutedOp { upstream_conn: conn, upstream_op, local_pending, down_conns },
            );
            st.routed_by_upstream.insert((conn, upstream_op), key);
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn handle_gather(
        this: &Arc<Self>,
        st: &mut State,
        effects: &mut Effects,
        conn: u32,
        op: u32,
        flags: u8,
        payload: Vec<u8>,
        last: bool,
    ) {
        if st.ops.contains_key(&op) {
            let (finished, shared, terminal) = {
                let record = st.ops.get_mut(&op).unwrap();
                if !record.pending_conns.contains(&conn) {
                    return;
                }
                if last {
                    record.pending_conns.remove(&conn);
                }
                (record.pending_conns.is_empty(), Arc::clone(&record.shared), record.terminal)
            };

            let final_flags = flags | if finished { gather_flags::FINISHED } else { 0 };
            if let Some(rec) = st.terminals.get(&terminal) {
                let this = Arc::clone(this);
                let message =
                    GatheredMessage { operation_id: op, flags: final_flags, payload };
                effects.post(&rec.strand, move || {
                    Self::deliver_gather(&this, &shared, op, message);
                });
            }
            if finished {
                st.ops.remove(&op);
            }
        } else if st.routed.contains_key(&op) {
            let (upstream_conn, upstream_op, remaining) = {
                let routed = st.routed.get_mut(&op).unwrap();
                if !routed.down_conns.contains(&conn) {
                    return;
                }
                if last {
                    routed.down_conns.remove(&conn);
                }
                (
                    routed.upstream_conn,
                    routed.upstream_op,
                    routed.local_pending.len() + routed.down_conns.len(),
                )
            };
            if let Some(seat) = st.conns.get(&upstream_conn) {
                seat.tx.send(TransportMsg::Gather {
                    op: upstream_op,
                    flags,
                    payload,
                    last: remaining == 0,
                });
            }
            if remaining == 0 {
                st.routed.remove(&op);
                st.routed_by_upstream.remove(&(upstream_conn, upstream_op));
            }
        }
    }

    fn handle_gather_none(
        this: &Arc<Self>,
        st: &mut State,
        effects: &mut Effects,
        conn: u32,
        op: u32,
    ) {
        if st.ops.contains_key(&op) {
            let (finished, shared, terminal) = {
                let record = st.ops.get_mut(&op).unwrap();
                record.pending_conns.remove(&conn);
                (record.pending_conns.is_empty(), Arc::clone(&record.shared), record.terminal)
            };
            if finished {
                // every subtree completed without an undelivered
                // response left; synthesize the final marker
                if let Some(rec) = st.terminals.get(&terminal) {
                    let this = Arc::clone(this);
                    let message = GatheredMessage {
                        operation_id: op,
                        flags: gather_flags::FINISHED,
                        payload: vec![],
                    };
                    effects.post(&rec.strand, move || {
                        Self::deliver_gather(&this, &shared, op, message);
                    });
                }
                st.ops.remove(&op);
            }
        } else if st.routed.contains_key(&op) {
            let (upstream_conn, upstream_op, remaining) = {
                let routed = st.routed.get_mut(&op).unwrap();
                routed.down_conns.remove(&conn);
                (
                    routed.upstream_conn,
                    routed.upstream_op,
                    routed.local_pending.len() + routed.down_conns.len(),
                )
            };
            if remaining == 0 {
                if let Some(seat) = st.conns.get(&upstream_conn) {
                    seat.tx.send(TransportMsg::GatherNone { op: upstream_op });
                }
                st.routed.remove(&op);
                st.routed_by_upstream.remove(&(upstream_conn, upstream_op));
            }
        }
    }

    fn handle_gather_cancel(st: &mut State, conn: u32, op: u32) {
        let Some(key) = st.routed_by_upstream.remove(&(conn, op)) else {
            return;
        };
        let Some(routed) = st.routed.remove(&key) else {
            return;
        };
        for terminal in &routed.local_pending {
            if let Some(record) = st.terminals.get_mut(terminal) {
                record.pending_scattered.remove(&key);
            }
        }
        for down in &routed.down_conns {
            if let Some(seat) = st.conns.get(down) {
                seat.tx.send(TransportMsg::GatherCancel { op: key });
            }
        }
    }
}

fn builtin_target(info: &TerminalInfo) -> Option<TerminalInfo> {
    info.kind.builtin_binding_target().map(|kind| TerminalInfo {
        kind,
        signature: info.signature,
        name: info.name.clone(),
    })
}

/// Join two endpoints of the same process. Both seats are installed
/// under both locks (ordered by address), then the initial
/// announcements cross over through the endpoint strands.
pub(crate) fn attach_local_pair(
    a: &Arc<EndpointInner>,
    b: &Arc<EndpointInner>,
) -> Result<(u32, u32)> {
    if Arc::ptr_eq(a, b) {
        return Err(Error::AssignmentFailed(String::from(
            "cannot connect an endpoint to itself",
        )));
    }

    let (first, second) =
        if Arc::as_ptr(a) < Arc::as_ptr(b) { (a, b) } else { (b, a) };
    let mut guard_first = first.state.lock().unwrap();
    let mut guard_second = second.state.lock().unwrap();
    let (st_a, st_b) = if Arc::ptr_eq(first, a) {
        (&mut *guard_first, &mut *guard_second)
    } else {
        (&mut *guard_second, &mut *guard_first)
    };

    if a.kind == EndpointKind::Leaf && !st_a.conns.is_empty() {
        return Err(Error::AssignmentFailed(String::from("the leaf already has a connection")));
    }
    if b.kind == EndpointKind::Leaf && !st_b.conns.is_empty() {
        return Err(Error::AssignmentFailed(String::from("the leaf already has a connection")));
    }
    if a.kind == EndpointKind::Node
        && b.kind == EndpointKind::Node
        && (st_a.remote_nodes.contains_key(&b.id) || st_b.remote_nodes.contains_key(&a.id))
    {
        return Err(Error::AssignmentFailed(String::from(
            "the connection would close a loop in the node graph",
        )));
    }

    let conn_a = st_a.next_conn_id;
    st_a.next_conn_id += 1;
    let conn_b = st_b.next_conn_id;
    st_b.next_conn_id += 1;

    st_a.conns.insert(
        conn_a,
        Seat::new(SeatTx::Local { peer: Arc::downgrade(b), peer_conn: conn_b }),
    );
    st_b.conns.insert(
        conn_b,
        Seat::new(SeatTx::Local { peer: Arc::downgrade(a), peer_conn: conn_a }),
    );

    let deltas_a = a.initial_deltas(st_a);
    if !deltas_a.is_empty() {
        st_a.conns[&conn_a].tx.send(TransportMsg::Announce(deltas_a));
    }
    let deltas_b = b.initial_deltas(st_b);
    if !deltas_b.is_empty() {
        st_b.conns[&conn_b].tx.send(TransportMsg::Announce(deltas_b));
    }

    Ok((conn_a, conn_b))
}
