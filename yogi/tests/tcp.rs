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

use libyogi::{
    AutoConnectingTcpClient, BindingState, Error, Leaf, Node, Scheduler, Signature,
    SubscriptionState, TcpClient, TcpServer, Terminal, TerminalKind,
};
use ntest::timeout;

mod support;

use crate::support::{free_port, wait_until};

const RECV_TIMEOUT: time::Duration = time::Duration::from_secs(5);
const HANDSHAKE_TIMEOUT: Option<time::Duration> = Some(time::Duration::from_secs(5));

fn tcp_pair(
    scheduler: &Scheduler,
    server_endpoint: &impl AsRef<libyogi::Endpoint>,
    client_endpoint: &impl AsRef<libyogi::Endpoint>,
) -> (libyogi::TcpConnection, libyogi::TcpConnection) {
    let port = free_port();
    let server =
        TcpServer::new(scheduler, "127.0.0.1", port, Some(String::from("srv"))).expect("server");
    let client = TcpClient::new(scheduler, Some(String::from("cli")));

    let (accept_tx, accept_rx) = crossbeam_channel::bounded(1);
    server
        .async_accept(HANDSHAKE_TIMEOUT, move |res| accept_tx.send(res).unwrap())
        .expect("accept");

    let (connect_tx, connect_rx) = crossbeam_channel::bounded(1);
    client
        .async_connect("127.0.0.1", port, HANDSHAKE_TIMEOUT, move |res| {
            connect_tx.send(res).unwrap()
        })
        .expect("connect");

    let client_conn = connect_rx.recv_timeout(RECV_TIMEOUT).unwrap().expect("client conn");
    let server_conn = accept_rx.recv_timeout(RECV_TIMEOUT).unwrap().expect("server conn");

    // assignment completes the handshake on both sides
    let client_endpoint = client_endpoint.as_ref().clone();
    let assign_handle = std::thread::spawn(move || {
        client_conn.assign(&client_endpoint, HANDSHAKE_TIMEOUT).map(|()| client_conn)
    });
    server_conn.assign(server_endpoint, HANDSHAKE_TIMEOUT).expect("server assign");
    let client_conn = assign_handle.join().unwrap().expect("client assign");

    (server_conn, client_conn)
}

#[test]
#[timeout(30000)]
fn handshake_exchanges_version_and_identification() {
    let scheduler = Scheduler::new();
    let node = Node::new(&scheduler);
    let leaf = Leaf::new(&scheduler);

    let (server_conn, client_conn) = tcp_pair(&scheduler, &node, &leaf);

    assert_eq!(Some(String::from("cli")), server_conn.remote_identification());
    assert_eq!(Some(String::from("srv")), client_conn.remote_identification());
    assert_eq!(Some(String::from(yogi_protocol::VERSION)), server_conn.remote_version());
    assert_eq!(Some(String::from(yogi_protocol::VERSION)), client_conn.remote_version());
}

#[test]
#[timeout(30000)]
fn publish_subscribe_over_tcp() {
    let scheduler = Scheduler::new();
    let node = Node::new(&scheduler);
    let leaf = Leaf::new(&scheduler);

    let (_server_conn, _client_conn) = tcp_pair(&scheduler, &node, &leaf);

    let producer = Terminal::new(&leaf, TerminalKind::Producer, "T", Signature(0)).unwrap();
    let consumer = Terminal::new(&node, TerminalKind::Consumer, "T", Signature(0)).unwrap();

    wait_until(|| consumer.get_binding_state().unwrap() == BindingState::Established);
    wait_until(|| {
        producer.get_subscription_state().unwrap() == SubscriptionState::Subscribed
    });

    let (tx, rx) = crossbeam_channel::bounded(1);
    consumer.async_receive_message(move |res| tx.send(res).unwrap()).unwrap();
    producer.publish(&[0x7b]).expect("publish");

    let message = rx.recv_timeout(RECV_TIMEOUT).unwrap().unwrap();
    assert_eq!(vec![0x7b], message.payload);
}

#[test]
#[timeout(30000)]
fn death_observer_fires_when_the_peer_goes_away() {
    let scheduler = Scheduler::new();
    let node = Node::new(&scheduler);
    let leaf = Leaf::new(&scheduler);

    let (server_conn, client_conn) = tcp_pair(&scheduler, &node, &leaf);

    let (tx, rx) = crossbeam_channel::bounded(1);
    server_conn.async_await_death(move |err| tx.send(err).unwrap()).expect("await death");

    drop(client_conn);
    let err = rx.recv_timeout(RECV_TIMEOUT).unwrap();
    assert!(matches!(err, Error::ConnectionLost | Error::Timeout), "got {err:?}");
}

#[test]
#[timeout(30000)]
fn cancel_await_death() {
    let scheduler = Scheduler::new();
    let node = Node::new(&scheduler);
    let leaf = Leaf::new(&scheduler);

    let (server_conn, _client_conn) = tcp_pair(&scheduler, &node, &leaf);

    let (tx, rx) = crossbeam_channel::bounded(1);
    server_conn.async_await_death(move |err| tx.send(err).unwrap()).expect("await death");
    server_conn.cancel_await_death();

    assert_eq!(Error::Canceled, rx.recv_timeout(RECV_TIMEOUT).unwrap());
}

#[test]
#[timeout(30000)]
fn unassigned_connections_time_out() {
    let scheduler = Scheduler::new();

    let port = free_port();
    let server = TcpServer::new(&scheduler, "127.0.0.1", port, None).expect("server");
    let client = TcpClient::new(&scheduler, None);

    let (accept_tx, accept_rx) = crossbeam_channel::bounded(1);
    server
        .async_accept(Some(time::Duration::from_millis(200)), move |res| {
            accept_tx.send(res).unwrap()
        })
        .expect("accept");

    let (connect_tx, connect_rx) = crossbeam_channel::bounded(1);
    client
        .async_connect("127.0.0.1", port, HANDSHAKE_TIMEOUT, move |res| {
            connect_tx.send(res).unwrap()
        })
        .expect("connect");

    let server_conn = accept_rx.recv_timeout(RECV_TIMEOUT).unwrap().expect("server conn");
    let _client_conn = connect_rx.recv_timeout(RECV_TIMEOUT).unwrap().expect("client conn");

    // never assigned; the watchdog reports the death
    let (tx, rx) = crossbeam_channel::bounded(1);
    server_conn.async_await_death(move |err| tx.send(err).unwrap()).expect("await death");
    assert_eq!(Error::Timeout, rx.recv_timeout(RECV_TIMEOUT).unwrap());
}

#[test]
#[timeout(60000)]
fn auto_connecting_client_retries_until_the_server_exists() {
    let scheduler = Scheduler::new();
    let node = Node::new(&scheduler);
    let leaf = Leaf::new(&scheduler);

    let port = free_port();
    let auto = AutoConnectingTcpClient::new(
        &leaf,
        "127.0.0.1",
        port,
        Some(time::Duration::from_secs(2)),
        None,
    );

    let (tx, rx) = crossbeam_channel::unbounded();
    auto.set_connect_observer(move |result, _conn| {
        tx.send(result.is_ok()).unwrap();
    });

    auto.start().expect("start");
    assert_eq!(Err(Error::AlreadyStarted), auto.start());

    // the first attempts fail; the server does not exist yet
    assert!(!rx.recv_timeout(RECV_TIMEOUT).unwrap());

    let server = TcpServer::new(&scheduler, "127.0.0.1", port, None).expect("server");
    let (accept_tx, accept_rx) = crossbeam_channel::bounded(1);
    server
        .async_accept(HANDSHAKE_TIMEOUT, move |res| accept_tx.send(res).unwrap())
        .expect("accept");

    let server_conn = accept_rx
        .recv_timeout(time::Duration::from_secs(20))
        .unwrap()
        .expect("server conn");
    server_conn.assign(&node, HANDSHAKE_TIMEOUT).expect("assign");

    // eventually one attempt succeeds
    let deadline = time::Instant::now() + time::Duration::from_secs(20);
    loop {
        match rx.recv_timeout(time::Duration::from_secs(20)) {
            Ok(true) => break,
            Ok(false) => {
                assert!(time::Instant::now() < deadline, "client never connected");
            }
            Err(err) => panic!("observer stopped: {err:?}"),
        }
    }
}
