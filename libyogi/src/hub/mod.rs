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

/*! The hub daemon.

The hub owns the mesh side (TCP servers and auto connecting clients
attached to the process node) and the session surface: a TCP listener
where each external client gets its own session thread, its own Leaf
and a local connection into the node.
*/

use std::{
    collections::HashMap,
    net::TcpListener,
    sync::{Arc, Mutex, Weak},
    thread,
};

use anyhow::Context as _;
use tracing::{error, info, instrument, warn};
use yogi_protocol::SessionResponse;

use crate::{
    config::Configuration,
    connection::{AutoConnectingTcpClient, TcpConnection, TcpServer},
    consts,
    endpoint::Node,
    process::ProcessInterface,
    scheduler::Scheduler,
    wire,
};

mod known_terminals;
mod session;

use known_terminals::KnownTerminalsMonitor;
use session::SessionShared;

const FACTORY_TCP_CLIENT: u8 = 0;
const FACTORY_TCP_SERVER: u8 = 1;

struct Factory {
    kind: u8,
    host: String,
    port: u16,
    /// Live connections through this factory, by an internal id.
    live: Mutex<HashMap<u64, String>>,
}

impl Factory {
    fn new(kind: u8, host: &str, port: u16) -> Arc<Factory> {
        Arc::new(Factory {
            kind,
            host: String::from(host),
            port,
            live: Mutex::new(HashMap::new()),
        })
    }
}

pub(crate) struct HubShared {
    scheduler: Scheduler,
    node: Node,
    known: KnownTerminalsMonitor,
    factories: Vec<Arc<Factory>>,
    sessions: Mutex<Vec<Weak<SessionShared>>>,
}

impl HubShared {
    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn node(&self) -> &Node {
        &self.node
    }

    pub fn known(&self) -> &KnownTerminalsMonitor {
        &self.known
    }

    pub fn subscribe_connections(&self, session: &Arc<SessionShared>) {
        let mut sessions = self.sessions.lock().unwrap();
        sessions.retain(|weak| weak.strong_count() > 0);
        sessions.push(Arc::downgrade(session));
    }

    /// One record per factory: kind, port, host.
    pub fn factory_records(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        for factory in &self.factories {
            buf.push(factory.kind);
            buf.extend_from_slice(&(factory.port as u32).to_le_bytes());
            wire::put_cstring(&mut buf, &factory.host);
        }
        buf
    }

    /// One record per factory describing its current connection state.
    pub fn connection_records(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        for (id, factory) in self.factories.iter().enumerate() {
            let live = factory.live.lock().unwrap();
            let description = live.values().next().cloned().unwrap_or_default();
            buf.extend_from_slice(&session::connection_record(
                factory.kind,
                id as u32,
                !live.is_empty(),
                &description,
            ));
        }
        buf
    }

    fn broadcast_connection_changed(&self, factory_id: usize) {
        let factory = &self.factories[factory_id];
        let record = {
            let live = factory.live.lock().unwrap();
            let description = live.values().next().cloned().unwrap_or_default();
            session::connection_record(
                factory.kind,
                factory_id as u32,
                !live.is_empty(),
                &description,
            )
        };

        let sessions = {
            let mut sessions = self.sessions.lock().unwrap();
            sessions.retain(|weak| weak.strong_count() > 0);
            sessions.clone()
        };
        for weak in sessions {
            if let Some(session) = weak.upgrade() {
                if session.monitoring_connections() {
                    session.notify(SessionResponse::ConnectionChanged, &record);
                }
            }
        }
    }
}

struct ClientTarget {
    host: String,
    port: u16,
    identification: Option<String>,
}

struct ServerTarget {
    address: String,
    port: u16,
    identification: Option<String>,
}

fn client_targets(config: &Configuration) -> Vec<ClientTarget> {
    let mut targets = Vec::new();

    if let Some(target) = config.connection_target() {
        match parse_host_port(&target) {
            Some((host, port)) => targets.push(ClientTarget {
                host,
                port,
                identification: config.connection_identification(),
            }),
            None => warn!("ignoring unparsable yogi.connection.target '{}'", target),
        }
    }

    if let Ok(entries) = config.child("yogi.clients") {
        if let Some(list) = entries.as_array() {
            for entry in list {
                let Some(host) = entry.get("host").and_then(|v| v.as_str()) else {
                    continue;
                };
                let Some(port) = entry.get("port").and_then(|v| v.as_u64()) else {
                    continue;
                };
                targets.push(ClientTarget {
                    host: String::from(host),
                    port: port as u16,
                    identification: entry
                        .get("identification")
                        .and_then(|v| v.as_str())
                        .map(String::from),
                });
            }
        }
    }

    targets
}

fn server_targets(config: &Configuration) -> Vec<ServerTarget> {
    let mut targets = Vec::new();
    if let Ok(entries) = config.child("yogi.servers") {
        if let Some(list) = entries.as_array() {
            for entry in list {
                let address =
                    entry.get("address").and_then(|v| v.as_str()).unwrap_or("0.0.0.0");
                let Some(port) = entry.get("port").and_then(|v| v.as_u64()) else {
                    continue;
                };
                targets.push(ServerTarget {
                    address: String::from(address),
                    port: port as u16,
                    identification: entry
                        .get("identification")
                        .and_then(|v| v.as_str())
                        .map(String::from),
                });
            }
        }
    }
    targets
}

fn parse_host_port(target: &str) -> Option<(String, u16)> {
    let (host, port) = target.rsplit_once(':')?;
    Some((String::from(host), port.parse().ok()?))
}

/// Run the hub until the process exits: wire the mesh factories to the
/// process node and serve sessions.
#[instrument(skip_all)]
pub fn run(pi: &ProcessInterface, config: &Configuration) -> anyhow::Result<()> {
    let clients = client_targets(config);
    let servers = server_targets(config);

    let mut factories = Vec::new();
    for client in &clients {
        factories.push(Factory::new(FACTORY_TCP_CLIENT, &client.host, client.port));
    }
    for server in &servers {
        factories.push(Factory::new(FACTORY_TCP_SERVER, &server.address, server.port));
    }

    let shared = Arc::new(HubShared {
        scheduler: pi.scheduler().clone(),
        node: pi.node().clone(),
        known: KnownTerminalsMonitor::new(pi.node().clone()),
        factories,
        sessions: Mutex::new(Vec::new()),
    });
    shared.known().start();

    let timeout = config.connection_timeout();

    // the factory handles have to stay alive for the daemon's lifetime
    let mut running_clients = Vec::new();
    for (factory_id, client) in clients.iter().enumerate() {
        let auto = AutoConnectingTcpClient::new(
            pi.node(),
            &client.host,
            client.port,
            timeout,
            client.identification.clone(),
        );

        let connect_hub = Arc::clone(&shared);
        let connect_factory = factory_id;
        auto.set_connect_observer(move |result, connection| {
            if result.is_ok() {
                if let Some(connection) = connection {
                    let factory = &connect_hub.factories[connect_factory];
                    factory.live.lock().unwrap().insert(0, connection.description());
                }
                connect_hub.broadcast_connection_changed(connect_factory);
            }
        });
        let disconnect_hub = Arc::clone(&shared);
        auto.set_disconnect_observer(move |err| {
            info!("connection died: {}", err);
            let factory = &disconnect_hub.factories[connect_factory];
            factory.live.lock().unwrap().clear();
            disconnect_hub.broadcast_connection_changed(connect_factory);
        });

        auto.start().context("starting auto connecting client")?;
        running_clients.push(auto);
    }

    for (offset, server) in servers.iter().enumerate() {
        let factory_id = clients.len() + offset;
        let tcp_server = TcpServer::new(
            pi.scheduler(),
            &server.address,
            server.port,
            server.identification.clone(),
        )
        .with_context(|| format!("binding mesh server on {}:{}", server.address, server.port))?;
        info!("mesh server listening on {}:{}", server.address, server.port);

        let hub = Arc::clone(&shared);
        thread::spawn(move || serve_mesh(tcp_server, hub, factory_id));
    }

    let address =
        config.get_optional_string("hub.address").unwrap_or_else(|| String::from("127.0.0.1"));
    let port = config
        .get_optional_f64("hub.port")
        .map(|p| p as u16)
        .unwrap_or(consts::DEFAULT_HUB_PORT);
    let listener = TcpListener::bind((address.as_str(), port))
        .with_context(|| format!("binding session listener on {address}:{port}"))?;
    info!("session surface listening on {}:{}", address, port);

    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                let peer = stream
                    .peer_addr()
                    .map(|a| a.to_string())
                    .unwrap_or_else(|_| String::from("unknown"));
                info!("new session from {}", peer);
                let hub = Arc::clone(&shared);
                thread::spawn(move || session::run(hub, stream, peer));
            }
            Err(err) => {
                error!("accepting session stream: {:?}", err);
            }
        }
    }

    Ok(())
}

/// Accept mesh connections forever, assigning each to the hub node.
fn serve_mesh(server: TcpServer, hub: Arc<HubShared>, factory_id: usize) {
    let (tx, rx) = crossbeam_channel::bounded(1);
    let live: Arc<Mutex<HashMap<u64, TcpConnection>>> = Arc::new(Mutex::new(HashMap::new()));
    let mut next_id = 0u64;

    loop {
        let tx = tx.clone();
        let accepted = server.async_accept(Some(consts::DEFAULT_HANDSHAKE_TIMEOUT), move |res| {
            let _ = tx.send(res);
        });
        if accepted.is_err() {
            return;
        }

        let connection = match rx.recv() {
            Ok(Ok(connection)) => connection,
            Ok(Err(err)) => {
                warn!("accepting mesh connection: {}", err);
                continue;
            }
            Err(_) => return,
        };

        if let Err(err) = connection.assign(hub.node(), Some(consts::DEFAULT_HANDSHAKE_TIMEOUT)) {
            warn!("assigning mesh connection: {}", err);
            continue;
        }

        next_id += 1;
        let conn_id = next_id;
        info!("mesh connection {} established", connection.description());
        hub.factories[factory_id]
            .live
            .lock()
            .unwrap()
            .insert(conn_id, connection.description());

        let death_hub = Arc::clone(&hub);
        let death_live = Arc::clone(&live);
        let _ = connection.async_await_death(move |err| {
            info!("mesh connection died: {}", err);
            death_live.lock().unwrap().remove(&conn_id);
            death_hub.factories[factory_id].live.lock().unwrap().remove(&conn_id);
            death_hub.broadcast_connection_changed(factory_id);
        });

        live.lock().unwrap().insert(conn_id, connection);
        hub.broadcast_connection_changed(factory_id);
    }
}
