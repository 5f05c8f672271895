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

/*! One session per external hub client.

A session owns its own Leaf, locally connected to the hub's Node, plus
lookup tables mapping 32 bit monotonic session-local ids to terminals,
bindings and in-flight operations. Requests arrive as length prefixed
frames whose first byte is the request type; responses and
asynchronous notifications go back the same way.
*/

use std::{
    collections::HashMap,
    net::{TcpStream, ToSocketAddrs as _},
    sync::{Arc, Mutex, Weak},
    thread, time,
};

use byteorder::{ByteOrder as _, LittleEndian};
use tracing::{debug, info, instrument, warn};
use yogi_protocol::{SessionRequest, SessionResponse, Signature, TerminalKind};

use crate::{
    binding::Binding,
    connection::LocalConnection,
    endpoint::Leaf,
    errors::Error,
    hub::HubShared,
    terminal::{ControlFlow, Operation, ScatteredMessage, Terminal},
    wire,
};

struct TerminalEntry {
    terminal: Arc<Terminal>,
    monitoring_binding: bool,
    monitoring_subscription: bool,
    monitoring_messages: bool,
    monitoring_scattered: bool,
    operations: HashMap<u32, Operation>,
    scattered: HashMap<u32, ScatteredMessage>,
}

impl TerminalEntry {
    fn new(terminal: Terminal) -> TerminalEntry {
        TerminalEntry {
            terminal: Arc::new(terminal),
            monitoring_binding: false,
            monitoring_subscription: false,
            monitoring_messages: false,
            monitoring_scattered: false,
            operations: HashMap::new(),
            scattered: HashMap::new(),
        }
    }
}

struct BindingEntry {
    binding: Arc<Binding>,
    monitoring: bool,
}

struct SessionState {
    last_terminal_id: u32,
    terminals: HashMap<u32, TerminalEntry>,
    last_binding_id: u32,
    bindings: HashMap<u32, BindingEntry>,
    last_lookup_id: u32,
    monitoring_known_terminals: bool,
    monitoring_connections: bool,
}

pub(crate) struct SessionShared {
    hub: Arc<HubShared>,
    leaf: Leaf,
    _conn: LocalConnection,
    peer_addr: String,
    stream: Mutex<TcpStream>,
    state: Mutex<SessionState>,
}

impl SessionShared {
    pub fn monitoring_known_terminals(&self) -> bool {
        self.state.lock().unwrap().monitoring_known_terminals
    }

    pub fn monitoring_connections(&self) -> bool {
        self.state.lock().unwrap().monitoring_connections
    }

    /// Push an asynchronous notification frame to the client.
    pub fn notify(&self, kind: SessionResponse, body: &[u8]) {
        let mut frame = Vec::with_capacity(body.len() + 1);
        frame.push(kind as u8);
        frame.extend_from_slice(body);
        let mut stream = self.stream.lock().unwrap();
        if let Err(err) = wire::write_raw_frame(&mut *stream, &frame) {
            debug!("dropping notification for dead session: {:?}", err);
        }
    }
}

/// Serve one client until it hangs up. Terminals, bindings and
/// operations owned by the session die with it.
#[instrument(skip_all, fields(peer = %peer_addr))]
pub(crate) fn run(hub: Arc<HubShared>, stream: TcpStream, peer_addr: String) {
    let leaf = Leaf::new(hub.scheduler());
    let conn = match LocalConnection::new(&leaf, hub.node()) {
        Ok(conn) => conn,
        Err(err) => {
            warn!("could not join session leaf to the hub node: {}", err);
            return;
        }
    };

    let write_stream = match stream.try_clone() {
        Ok(s) => s,
        Err(err) => {
            warn!("could not clone session stream: {:?}", err);
            return;
        }
    };

    let session = Arc::new(SessionShared {
        hub: Arc::clone(&hub),
        leaf,
        _conn: conn,
        peer_addr,
        stream: Mutex::new(write_stream),
        state: Mutex::new(SessionState {
            last_terminal_id: 0,
            terminals: HashMap::new(),
            last_binding_id: 0,
            bindings: HashMap::new(),
            last_lookup_id: 0,
            monitoring_known_terminals: false,
            monitoring_connections: false,
        }),
    });

    info!("session started");
    let mut read_stream = stream;
    loop {
        let frame = match wire::read_raw_frame(&mut read_stream) {
            Ok(frame) => frame,
            Err(err) => {
                info!("session closed: {:#}", err);
                break;
            }
        };

        let (status, body) = handle_request(&session, &frame);
        let mut reply = Vec::with_capacity(body.len() + 1);
        reply.push(status as u8);
        reply.extend_from_slice(&body);
        let write_result = {
            let mut stream = session.stream.lock().unwrap();
            wire::write_raw_frame(&mut *stream, &reply)
        };
        if let Err(err) = write_result {
            info!("session closed while writing reply: {:?}", err);
            break;
        }
    }
    // dropping the session tears down its leaf, terminals and bindings
}

fn handle_request(session: &Arc<SessionShared>, frame: &[u8]) -> (SessionResponse, Vec<u8>) {
    let Some((&first, rest)) = frame.split_first() else {
        return (SessionResponse::InvalidRequest, vec![]);
    };
    let Ok(request) = SessionRequest::try_from(first) else {
        return (SessionResponse::InvalidRequest, vec![]);
    };

    match request {
        SessionRequest::Version => handle_version(),
        SessionRequest::CurrentTime => handle_current_time(),
        SessionRequest::KnownTerminals => (SessionResponse::Ok, session.hub.known().snapshot()),
        SessionRequest::KnownTerminalsSubtree => handle_known_terminals_subtree(session, rest),
        SessionRequest::FindKnownTerminals => handle_find_known_terminals(session, rest),
        SessionRequest::MonitorKnownTerminals => handle_monitor_known_terminals(session),
        SessionRequest::ConnectionFactories => {
            (SessionResponse::Ok, session.hub.factory_records())
        }
        SessionRequest::Connections => (SessionResponse::Ok, session.hub.connection_records()),
        SessionRequest::MonitorConnections => handle_monitor_connections(session),
        SessionRequest::ClientAddress => {
            let mut body = vec![];
            wire::put_cstring(&mut body, &session.peer_addr);
            (SessionResponse::Ok, body)
        }
        SessionRequest::StartDnsLookup => handle_start_dns_lookup(session, rest),
        SessionRequest::CreateTerminal => handle_create_terminal(session, rest),
        SessionRequest::DestroyTerminal => handle_destroy_terminal(session, rest),
        SessionRequest::CreateBinding => handle_create_binding(session, rest),
        SessionRequest::DestroyBinding => handle_destroy_binding(session, rest),
        SessionRequest::MonitorBindingState => handle_monitor_binding_state(session, rest),
        SessionRequest::MonitorBuiltinBindingState => {
            handle_monitor_builtin_binding_state(session, rest)
        }
        SessionRequest::MonitorSubscriptionState => {
            handle_monitor_subscription_state(session, rest)
        }
        SessionRequest::PublishMessage => handle_publish_message(session, rest),
        SessionRequest::MonitorReceivedPublishMessages => {
            handle_monitor_received_publish_messages(session, rest)
        }
        SessionRequest::ScatterGather => handle_scatter_gather(session, rest),
        SessionRequest::MonitorReceivedScatterMessages => {
            handle_monitor_received_scatter_messages(session, rest)
        }
        SessionRequest::RespondToScatteredMessage => {
            handle_respond_to_scattered_message(session, rest)
        }
        SessionRequest::IgnoreScatteredMessage => handle_ignore_scattered_message(session, rest),
    }
}

fn handle_version() -> (SessionResponse, Vec<u8>) {
    let mut body = vec![];
    wire::put_cstring(&mut body, yogi_protocol::VERSION);
    (SessionResponse::Ok, body)
}

fn handle_current_time() -> (SessionResponse, Vec<u8>) {
    let nanos = time::SystemTime::now()
        .duration_since(time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    (SessionResponse::Ok, nanos.to_le_bytes().to_vec())
}

fn handle_known_terminals_subtree(
    session: &Arc<SessionShared>,
    body: &[u8],
) -> (SessionResponse, Vec<u8>) {
    let Some((&absolute, path)) = body.split_first() else {
        return (SessionResponse::InvalidRequest, vec![]);
    };
    let path = trim_trailing_nul(path);
    let Ok(path) = std::str::from_utf8(path) else {
        return (SessionResponse::InvalidRequest, vec![]);
    };
    (SessionResponse::Ok, session.hub.known().subtree(absolute != 0, path))
}

fn handle_find_known_terminals(
    session: &Arc<SessionShared>,
    body: &[u8],
) -> (SessionResponse, Vec<u8>) {
    let Some((&case_sensitive, needle)) = body.split_first() else {
        return (SessionResponse::InvalidRequest, vec![]);
    };
    let needle = trim_trailing_nul(needle);
    let Ok(needle) = std::str::from_utf8(needle) else {
        return (SessionResponse::InvalidRequest, vec![]);
    };
    (SessionResponse::Ok, session.hub.known().find(needle, case_sensitive != 0))
}

fn handle_monitor_known_terminals(session: &Arc<SessionShared>) -> (SessionResponse, Vec<u8>) {
    {
        let mut st = session.state.lock().unwrap();
        if st.monitoring_known_terminals {
            return (SessionResponse::AlreadyMonitoring, vec![]);
        }
        st.monitoring_known_terminals = true;
    }
    session.hub.known().subscribe(session);
    (SessionResponse::Ok, session.hub.known().snapshot())
}

fn handle_monitor_connections(session: &Arc<SessionShared>) -> (SessionResponse, Vec<u8>) {
    {
        let mut st = session.state.lock().unwrap();
        if st.monitoring_connections {
            return (SessionResponse::AlreadyMonitoring, vec![]);
        }
        st.monitoring_connections = true;
    }
    session.hub.subscribe_connections(session);
    (SessionResponse::Ok, session.hub.connection_records())
}

fn handle_start_dns_lookup(
    session: &Arc<SessionShared>,
    body: &[u8],
) -> (SessionResponse, Vec<u8>) {
    let Ok((host, _)) = wire::get_cstring(body) else {
        return (SessionResponse::InvalidRequest, vec![]);
    };
    let host = String::from(host);

    let id = {
        let mut st = session.state.lock().unwrap();
        st.last_lookup_id += 1;
        st.last_lookup_id
    };

    let weak = Arc::downgrade(session);
    thread::spawn(move || {
        let result = (host.as_str(), 0u16).to_socket_addrs();
        let json = match result {
            Ok(addrs) => {
                let addresses: Vec<String> =
                    addrs.map(|a| a.ip().to_string()).collect();
                serde_json::json!({
                    "error": serde_json::Value::Null,
                    "addresses": addresses,
                    "hostname": host,
                })
            }
            Err(err) => serde_json::json!({
                "error": err.to_string(),
                "addresses": [],
                "hostname": host,
            }),
        };

        if let Some(session) = weak.upgrade() {
            let mut body = id.to_le_bytes().to_vec();
            wire::put_cstring(&mut body, &json.to_string());
            session.notify(SessionResponse::DnsLookupFinished, &body);
        }
    });

    (SessionResponse::Ok, id.to_le_bytes().to_vec())
}

fn handle_create_terminal(
    session: &Arc<SessionShared>,
    body: &[u8],
) -> (SessionResponse, Vec<u8>) {
    if body.len() < 6 {
        return (SessionResponse::InvalidRequest, vec![]);
    }
    let Ok(kind) = TerminalKind::try_from(body[0]) else {
        return (SessionResponse::InvalidTerminalType, vec![]);
    };
    let signature = Signature(LittleEndian::read_u32(&body[1..5]));
    let Ok((name, _)) = wire::get_cstring(&body[5..]) else {
        return (SessionResponse::InvalidRequest, vec![]);
    };

    debug!("creating {} terminal '{}' [{}]...", kind, name, signature);
    match Terminal::new(&session.leaf, kind, name, signature) {
        Ok(terminal) => {
            let mut st = session.state.lock().unwrap();
            st.last_terminal_id += 1;
            let id = st.last_terminal_id;
            st.terminals.insert(id, TerminalEntry::new(terminal));
            (SessionResponse::Ok, id.to_le_bytes().to_vec())
        }
        Err(err) => {
            warn!("could not create {} terminal '{}': {}", kind, name, err);
            api_error(err)
        }
    }
}

fn handle_destroy_terminal(
    session: &Arc<SessionShared>,
    body: &[u8],
) -> (SessionResponse, Vec<u8>) {
    let Some(id) = read_u32(body) else {
        return (SessionResponse::InvalidRequest, vec![]);
    };
    let removed = session.state.lock().unwrap().terminals.remove(&id);
    match removed {
        Some(_) => (SessionResponse::Ok, vec![]),
        None => (SessionResponse::InvalidTerminalId, vec![]),
    }
}

fn handle_create_binding(
    session: &Arc<SessionShared>,
    body: &[u8],
) -> (SessionResponse, Vec<u8>) {
    if body.len() < 5 {
        return (SessionResponse::InvalidRequest, vec![]);
    }
    let terminal_id = LittleEndian::read_u32(&body[..4]);
    let Ok((targets, _)) = wire::get_cstring(&body[4..]) else {
        return (SessionResponse::InvalidRequest, vec![]);
    };

    let mut st = session.state.lock().unwrap();
    let Some(entry) = st.terminals.get(&terminal_id) else {
        return (SessionResponse::InvalidTerminalId, vec![]);
    };
    if !entry.terminal.kind().is_primitive() {
        return (SessionResponse::InvalidTerminalType, vec![]);
    }

    match Binding::new(&entry.terminal, targets) {
        Ok(binding) => {
            st.last_binding_id += 1;
            let id = st.last_binding_id;
            st.bindings.insert(id, BindingEntry { binding: Arc::new(binding), monitoring: false });
            (SessionResponse::Ok, id.to_le_bytes().to_vec())
        }
        Err(err) => {
            warn!("could not create binding to '{}': {}", targets, err);
            api_error(err)
        }
    }
}

fn handle_destroy_binding(
    session: &Arc<SessionShared>,
    body: &[u8],
) -> (SessionResponse, Vec<u8>) {
    let Some(id) = read_u32(body) else {
        return (SessionResponse::InvalidRequest, vec![]);
    };
    let removed = session.state.lock().unwrap().bindings.remove(&id);
    match removed {
        Some(_) => (SessionResponse::Ok, vec![]),
        None => (SessionResponse::InvalidBindingId, vec![]),
    }
}

fn handle_monitor_binding_state(
    session: &Arc<SessionShared>,
    body: &[u8],
) -> (SessionResponse, Vec<u8>) {
    let Some(id) = read_u32(body) else {
        return (SessionResponse::InvalidRequest, vec![]);
    };

    let binding = {
        let mut st = session.state.lock().unwrap();
        let Some(entry) = st.bindings.get_mut(&id) else {
            return (SessionResponse::InvalidBindingId, vec![]);
        };
        if entry.monitoring {
            return (SessionResponse::AlreadyMonitoring, vec![]);
        }
        entry.monitoring = true;
        Arc::clone(&entry.binding)
    };

    // the monitor starts off with the current state
    if let Ok(state) = binding.get_binding_state() {
        session.notify(SessionResponse::BindingStateChanged, &state_body(id, state as u8));
    }
    pump_binding_state(Arc::downgrade(session), Arc::downgrade(&binding), id);
    (SessionResponse::Ok, vec![])
}

fn pump_binding_state(session: Weak<SessionShared>, binding: Weak<Binding>, id: u32) {
    let Some(strong) = binding.upgrade() else {
        return;
    };
    let result = strong.async_await_binding_state_change(move |res| {
        if let Ok(state) = res {
            if let Some(strong) = session.upgrade() {
                strong.notify(SessionResponse::BindingStateChanged, &state_body(id, state as u8));
                pump_binding_state(session, binding, id);
            }
        }
    });
    if let Err(err) = result {
        debug!("binding state pump for {} stopped: {}", id, err);
    }
}

fn handle_monitor_builtin_binding_state(
    session: &Arc<SessionShared>,
    body: &[u8],
) -> (SessionResponse, Vec<u8>) {
    let Some(id) = read_u32(body) else {
        return (SessionResponse::InvalidRequest, vec![]);
    };

    let terminal = {
        let mut st = session.state.lock().unwrap();
        let Some(entry) = st.terminals.get_mut(&id) else {
            return (SessionResponse::InvalidTerminalId, vec![]);
        };
        if !entry.terminal.kind().is_binder() {
            return (SessionResponse::InvalidTerminalType, vec![]);
        }
        if entry.monitoring_binding {
            return (SessionResponse::AlreadyMonitoring, vec![]);
        }
        entry.monitoring_binding = true;
        Arc::clone(&entry.terminal)
    };

    if let Ok(state) = terminal.get_binding_state() {
        session.notify(SessionResponse::BuiltinBindingStateChanged, &state_body(id, state as u8));
    }
    pump_builtin_binding_state(Arc::downgrade(session), Arc::downgrade(&terminal), id);
    (SessionResponse::Ok, vec![])
}

fn pump_builtin_binding_state(session: Weak<SessionShared>, terminal: Weak<Terminal>, id: u32) {
    let Some(strong) = terminal.upgrade() else {
        return;
    };
    let _ = strong.async_await_binding_state_change(move |res| {
        if let Ok(state) = res {
            if let Some(strong) = session.upgrade() {
                strong.notify(
                    SessionResponse::BuiltinBindingStateChanged,
                    &state_body(id, state as u8),
                );
                pump_builtin_binding_state(session, terminal, id);
            }
        }
    });
}

fn handle_monitor_subscription_state(
    session: &Arc<SessionShared>,
    body: &[u8],
) -> (SessionResponse, Vec<u8>) {
    let Some(id) = read_u32(body) else {
        return (SessionResponse::InvalidRequest, vec![]);
    };

    let terminal = {
        let mut st = session.state.lock().unwrap();
        let Some(entry) = st.terminals.get_mut(&id) else {
            return (SessionResponse::InvalidTerminalId, vec![]);
        };
        if !entry.terminal.kind().is_subscribable() {
            return (SessionResponse::InvalidTerminalType, vec![]);
        }
        if entry.monitoring_subscription {
            return (SessionResponse::AlreadyMonitoring, vec![]);
        }
        entry.monitoring_subscription = true;
        Arc::clone(&entry.terminal)
    };

    if let Ok(state) = terminal.get_subscription_state() {
        session.notify(SessionResponse::SubscriptionStateChanged, &state_body(id, state as u8));
    }
    pump_subscription_state(Arc::downgrade(session), Arc::downgrade(&terminal), id);
    (SessionResponse::Ok, vec![])
}

fn pump_subscription_state(session: Weak<SessionShared>, terminal: Weak<Terminal>, id: u32) {
    let Some(strong) = terminal.upgrade() else {
        return;
    };
    let _ = strong.async_await_subscription_state_change(move |res| {
        if let Ok(state) = res {
            if let Some(strong) = session.upgrade() {
                strong.notify(
                    SessionResponse::SubscriptionStateChanged,
                    &state_body(id, state as u8),
                );
                pump_subscription_state(session, terminal, id);
            }
        }
    });
}

fn handle_publish_message(
    session: &Arc<SessionShared>,
    body: &[u8],
) -> (SessionResponse, Vec<u8>) {
    if body.len() < 4 {
        return (SessionResponse::InvalidRequest, vec![]);
    }
    let id = LittleEndian::read_u32(&body[..4]);
    let payload = &body[4..];

    let terminal = {
        let st = session.state.lock().unwrap();
        let Some(entry) = st.terminals.get(&id) else {
            return (SessionResponse::InvalidTerminalId, vec![]);
        };
        if !entry.terminal.kind().can_publish() {
            return (SessionResponse::InvalidTerminalType, vec![]);
        }
        Arc::clone(&entry.terminal)
    };

    match terminal.publish(payload) {
        Ok(()) => (SessionResponse::Ok, vec![]),
        Err(err) => api_error(err),
    }
}

fn handle_monitor_received_publish_messages(
    session: &Arc<SessionShared>,
    body: &[u8],
) -> (SessionResponse, Vec<u8>) {
    let Some(id) = read_u32(body) else {
        return (SessionResponse::InvalidRequest, vec![]);
    };

    let terminal = {
        let mut st = session.state.lock().unwrap();
        let Some(entry) = st.terminals.get_mut(&id) else {
            return (SessionResponse::InvalidTerminalId, vec![]);
        };
        if !entry.terminal.kind().can_receive_published() {
            return (SessionResponse::InvalidTerminalType, vec![]);
        }
        if entry.monitoring_messages {
            return (SessionResponse::AlreadyMonitoring, vec![]);
        }
        entry.monitoring_messages = true;
        Arc::clone(&entry.terminal)
    };

    let cached_kind = terminal.kind().is_cached();
    pump_published_messages(Arc::downgrade(session), Arc::downgrade(&terminal), id, cached_kind);

    // cached variants report their current cache in the reply
    let mut reply = vec![];
    if cached_kind {
        match terminal.get_cached_message() {
            Ok(cache) => {
                reply.push(1);
                reply.extend_from_slice(&cache);
            }
            Err(_) => reply.push(0),
        }
    }
    (SessionResponse::Ok, reply)
}

fn pump_published_messages(
    session: Weak<SessionShared>,
    terminal: Weak<Terminal>,
    id: u32,
    cached_kind: bool,
) {
    let Some(strong) = terminal.upgrade() else {
        return;
    };
    let _ = strong.async_receive_message(move |res| {
        if let Ok(message) = res {
            if let Some(strong) = session.upgrade() {
                let mut body = id.to_le_bytes().to_vec();
                if cached_kind {
                    body.push(message.cached as u8);
                    body.extend_from_slice(&message.payload);
                    strong.notify(SessionResponse::CachedPublishedMessageReceived, &body);
                } else {
                    body.extend_from_slice(&message.payload);
                    strong.notify(SessionResponse::PublishedMessageReceived, &body);
                }
                pump_published_messages(session, terminal, id, cached_kind);
            }
        }
    });
}

fn handle_scatter_gather(
    session: &Arc<SessionShared>,
    body: &[u8],
) -> (SessionResponse, Vec<u8>) {
    if body.len() < 4 {
        return (SessionResponse::InvalidRequest, vec![]);
    }
    let id = LittleEndian::read_u32(&body[..4]);
    let payload = &body[4..];

    let mut st = session.state.lock().unwrap();
    let Some(entry) = st.terminals.get_mut(&id) else {
        return (SessionResponse::InvalidTerminalId, vec![]);
    };
    if !entry.terminal.kind().can_scatter() {
        return (SessionResponse::InvalidTerminalType, vec![]);
    }

    let weak = Arc::downgrade(session);
    let result = entry.terminal.async_scatter_gather(payload, move |res| match res {
        Ok(message) => {
            let Some(session) = weak.upgrade() else {
                return ControlFlow::Stop;
            };
            let finished = message.flags & yogi_protocol::gather_flags::FINISHED != 0;
            let mut body = id.to_le_bytes().to_vec();
            body.extend_from_slice(&message.operation_id.to_le_bytes());
            body.push(message.flags);
            body.extend_from_slice(&message.payload);
            session.notify(SessionResponse::GatheredMessageReceived, &body);

            if finished {
                let mut st = session.state.lock().unwrap();
                if let Some(entry) = st.terminals.get_mut(&id) {
                    entry.operations.remove(&message.operation_id);
                }
            }
            ControlFlow::Continue
        }
        Err(_) => ControlFlow::Stop,
    });

    match result {
        Ok(operation) => {
            let op_id = operation.operation_id();
            entry.operations.insert(op_id, operation);
            (SessionResponse::Ok, op_id.to_le_bytes().to_vec())
        }
        Err(err) => api_error(err),
    }
}

fn handle_monitor_received_scatter_messages(
    session: &Arc<SessionShared>,
    body: &[u8],
) -> (SessionResponse, Vec<u8>) {
    let Some(id) = read_u32(body) else {
        return (SessionResponse::InvalidRequest, vec![]);
    };

    let terminal = {
        let mut st = session.state.lock().unwrap();
        let Some(entry) = st.terminals.get_mut(&id) else {
            return (SessionResponse::InvalidTerminalId, vec![]);
        };
        if !entry.terminal.kind().can_receive_scattered() {
            return (SessionResponse::InvalidTerminalType, vec![]);
        }
        if entry.monitoring_scattered {
            return (SessionResponse::AlreadyMonitoring, vec![]);
        }
        entry.monitoring_scattered = true;
        Arc::clone(&entry.terminal)
    };

    pump_scattered_messages(Arc::downgrade(session), Arc::downgrade(&terminal), id);
    (SessionResponse::Ok, vec![])
}

fn pump_scattered_messages(session: Weak<SessionShared>, terminal: Weak<Terminal>, id: u32) {
    let Some(strong) = terminal.upgrade() else {
        return;
    };
    let _ = strong.async_receive_scattered_message(move |res| {
        if let Ok(message) = res {
            if let Some(strong) = session.upgrade() {
                let mut body = id.to_le_bytes().to_vec();
                body.extend_from_slice(&message.operation_id().to_le_bytes());
                body.extend_from_slice(message.payload());

                {
                    let mut st = strong.state.lock().unwrap();
                    if let Some(entry) = st.terminals.get_mut(&id) {
                        entry.scattered.insert(message.operation_id(), message);
                    }
                }

                strong.notify(SessionResponse::ScatteredMessageReceived, &body);
                pump_scattered_messages(session, terminal, id);
            }
        }
    });
}

fn handle_respond_to_scattered_message(
    session: &Arc<SessionShared>,
    body: &[u8],
) -> (SessionResponse, Vec<u8>) {
    if body.len() < 8 {
        return (SessionResponse::InvalidRequest, vec![]);
    }
    let id = LittleEndian::read_u32(&body[..4]);
    let op = LittleEndian::read_u32(&body[4..8]);
    let payload = body[8..].to_vec();

    let message = {
        let mut st = session.state.lock().unwrap();
        let Some(entry) = st.terminals.get_mut(&id) else {
            return (SessionResponse::InvalidTerminalId, vec![]);
        };
        match entry.scattered.remove(&op) {
            Some(message) => message,
            None => return (SessionResponse::InvalidOperationId, vec![]),
        }
    };

    match message.respond(&payload) {
        Ok(()) => (SessionResponse::Ok, vec![]),
        Err(err) => api_error(err),
    }
}

fn handle_ignore_scattered_message(
    session: &Arc<SessionShared>,
    body: &[u8],
) -> (SessionResponse, Vec<u8>) {
    if body.len() < 8 {
        return (SessionResponse::InvalidRequest, vec![]);
    }
    let id = LittleEndian::read_u32(&body[..4]);
    let op = LittleEndian::read_u32(&body[4..8]);

    let message = {
        let mut st = session.state.lock().unwrap();
        let Some(entry) = st.terminals.get_mut(&id) else {
            return (SessionResponse::InvalidTerminalId, vec![]);
        };
        match entry.scattered.remove(&op) {
            Some(message) => message,
            None => return (SessionResponse::InvalidOperationId, vec![]),
        }
    };

    match message.ignore() {
        Ok(()) => (SessionResponse::Ok, vec![]),
        Err(err) => api_error(err),
    }
}

fn api_error(err: Error) -> (SessionResponse, Vec<u8>) {
    if err == Error::WrongTerminalKind {
        return (SessionResponse::InvalidTerminalType, vec![]);
    }
    let mut body = vec![];
    wire::put_cstring(&mut body, &err.to_string());
    (SessionResponse::ApiError, body)
}

fn state_body(id: u32, state: u8) -> Vec<u8> {
    let mut body = id.to_le_bytes().to_vec();
    body.push(state);
    body
}

fn read_u32(body: &[u8]) -> Option<u32> {
    if body.len() < 4 {
        return None;
    }
    Some(LittleEndian::read_u32(&body[..4]))
}

fn trim_trailing_nul(buf: &[u8]) -> &[u8] {
    match buf.split_last() {
        Some((0, rest)) => rest,
        _ => buf,
    }
}

/// Record layout shared by the Connections response and the
/// ConnectionChanged notification.
pub(crate) fn connection_record(
    factory_kind: u8,
    factory_id: u32,
    connected: bool,
    description: &str,
) -> Vec<u8> {
    let mut body = vec![factory_kind];
    body.extend_from_slice(&factory_id.to_le_bytes());
    body.push(connected as u8);
    let mut record = body;
    wire::put_cstring(&mut record, description);
    record
}
