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

use std::{
    collections::VecDeque,
    io::{Read as _, Write as _},
    net::TcpStream,
    process::{Child, Command, Stdio},
    thread, time,
};

use byteorder::{ByteOrder as _, LittleEndian};
use ntest::timeout;
use yogi_protocol::{SessionRequest, SessionResponse, TerminalKind};

mod support;

use crate::support::{free_port, yogi_bin};

const RECV_TIMEOUT: time::Duration = time::Duration::from_secs(5);

struct Daemon {
    child: Child,
    port: u16,
    _tmp_dir: tempfile::TempDir,
}

impl Daemon {
    fn start() -> Daemon {
        let tmp_dir = tempfile::Builder::new()
            .prefix("yogi-test")
            .rand_bytes(20)
            .tempdir()
            .expect("creating tmp dir");
        let port = free_port();

        let child = Command::new(yogi_bin())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .arg("--log-file")
            .arg(tmp_dir.path().join("hub.log"))
            .arg("--location=/Test")
            .arg("--json")
            .arg(format!(r#"{{ "hub": {{ "port": {port} }} }}"#))
            .spawn()
            .expect("spawning hub process");

        // wait for the session listener to come up
        let deadline = time::Instant::now() + time::Duration::from_secs(10);
        loop {
            if TcpStream::connect(("127.0.0.1", port)).is_ok() {
                break;
            }
            assert!(time::Instant::now() < deadline, "hub never started listening");
            thread::sleep(time::Duration::from_millis(20));
        }

        Daemon { child, port, _tmp_dir: tmp_dir }
    }

    fn session(&self) -> Session {
        let stream = TcpStream::connect(("127.0.0.1", self.port)).expect("connecting session");
        stream.set_read_timeout(Some(RECV_TIMEOUT)).expect("setting read timeout");
        Session { stream, notifications: VecDeque::new() }
    }
}

impl Drop for Daemon {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

struct Session {
    stream: TcpStream,
    notifications: VecDeque<(u8, Vec<u8>)>,
}

impl Session {
    fn write_frame(&mut self, frame: &[u8]) {
        let mut len = [0u8; 4];
        LittleEndian::write_u32(&mut len, frame.len() as u32);
        self.stream.write_all(&len).expect("writing frame length");
        self.stream.write_all(frame).expect("writing frame");
        self.stream.flush().expect("flushing frame");
    }

    fn read_frame(&mut self) -> (u8, Vec<u8>) {
        let mut len = [0u8; 4];
        self.stream.read_exact(&mut len).expect("reading frame length");
        let len = LittleEndian::read_u32(&len) as usize;
        let mut frame = vec![0u8; len];
        self.stream.read_exact(&mut frame).expect("reading frame");
        let kind = frame[0];
        (kind, frame[1..].to_vec())
    }

    /// Send a request and return its synchronous status + body,
    /// buffering any notifications that arrive in between.
    fn request(&mut self, frame: &[u8]) -> (u8, Vec<u8>) {
        self.write_frame(frame);
        loop {
            let (kind, body) = self.read_frame();
            if kind <= SessionResponse::InvalidTerminalType as u8 {
                return (kind, body);
            }
            self.notifications.push_back((kind, body));
        }
    }

    /// The next buffered or incoming notification of the given type.
    fn notification(&mut self, wanted: SessionResponse) -> Vec<u8> {
        if let Some(pos) =
            self.notifications.iter().position(|(kind, _)| *kind == wanted as u8)
        {
            return self.notifications.remove(pos).unwrap().1;
        }
        loop {
            let (kind, body) = self.read_frame();
            if kind == wanted as u8 {
                return body;
            }
            self.notifications.push_back((kind, body));
        }
    }

    fn create_terminal(&mut self, kind: TerminalKind, signature: u32, name: &str) -> u32 {
        let mut frame = vec![SessionRequest::CreateTerminal as u8, kind as u8];
        let mut sig = [0u8; 4];
        LittleEndian::write_u32(&mut sig, signature);
        frame.extend_from_slice(&sig);
        frame.extend_from_slice(name.as_bytes());
        frame.push(0);

        let (status, body) = self.request(&frame);
        assert_eq!(SessionResponse::Ok as u8, status, "create terminal failed");
        LittleEndian::read_u32(&body[..4])
    }
}

fn frame_with_id(request: SessionRequest, id: u32) -> Vec<u8> {
    let mut frame = vec![request as u8];
    frame.extend_from_slice(&id.to_le_bytes());
    frame
}

#[test]
#[timeout(60000)]
fn version_and_current_time() {
    let daemon = Daemon::start();
    let mut session = daemon.session();

    let (status, body) = session.request(&[SessionRequest::Version as u8]);
    assert_eq!(SessionResponse::Ok as u8, status);
    assert_eq!(yogi_protocol::VERSION.as_bytes(), &body[..body.len() - 1]);
    assert_eq!(0, body[body.len() - 1]);

    let (status, body) = session.request(&[SessionRequest::CurrentTime as u8]);
    assert_eq!(SessionResponse::Ok as u8, status);
    assert_eq!(8, body.len());
    assert!(LittleEndian::read_u64(&body) > 0);
}

#[test]
#[timeout(60000)]
fn create_destroy_terminal_and_errors() {
    let daemon = Daemon::start();
    let mut session = daemon.session();

    let id = session.create_terminal(TerminalKind::Producer, 123, "/T");
    assert_eq!(1, id);

    let (status, _) = session.request(&frame_with_id(SessionRequest::DestroyTerminal, id));
    assert_eq!(SessionResponse::Ok as u8, status);

    let (status, _) = session.request(&frame_with_id(SessionRequest::DestroyTerminal, id));
    assert_eq!(SessionResponse::InvalidTerminalId as u8, status);

    // unknown terminal type byte
    let (status, _) = session.request(&[SessionRequest::CreateTerminal as u8, 99, 0, 0, 0, 0, 0]);
    assert_eq!(SessionResponse::InvalidTerminalType as u8, status);

    // garbage request type
    let (status, _) = session.request(&[0xfe]);
    assert_eq!(SessionResponse::InvalidRequest as u8, status);
}

#[test]
#[timeout(60000)]
fn publish_between_two_sessions() {
    let daemon = Daemon::start();
    let mut publisher = daemon.session();
    let mut subscriber = daemon.session();

    let producer_id = publisher.create_terminal(TerminalKind::Producer, 0, "/T");
    let consumer_id = subscriber.create_terminal(TerminalKind::Consumer, 0, "/T");

    let (status, _) = subscriber
        .request(&frame_with_id(SessionRequest::MonitorReceivedPublishMessages, consumer_id));
    assert_eq!(SessionResponse::Ok as u8, status);

    // publishing fails with an ApiError until the subscription has
    // propagated through the hub node
    let mut frame = frame_with_id(SessionRequest::PublishMessage, producer_id);
    frame.push(0x7b);
    let deadline = time::Instant::now() + time::Duration::from_secs(10);
    loop {
        let (status, _) = publisher.request(&frame);
        if status == SessionResponse::Ok as u8 {
            break;
        }
        assert_eq!(SessionResponse::ApiError as u8, status);
        assert!(time::Instant::now() < deadline, "publish never succeeded");
        thread::sleep(time::Duration::from_millis(20));
    }

    let body = subscriber.notification(SessionResponse::PublishedMessageReceived);
    assert_eq!(consumer_id, LittleEndian::read_u32(&body[..4]));
    assert_eq!(&[0x7b], &body[4..]);
}

#[test]
#[timeout(60000)]
fn monitor_known_terminals() {
    let daemon = Daemon::start();
    let mut watcher = daemon.session();
    let mut other = daemon.session();

    let (status, _) = watcher.request(&[SessionRequest::MonitorKnownTerminals as u8]);
    assert_eq!(SessionResponse::Ok as u8, status);

    let _id = other.create_terminal(TerminalKind::Producer, 123, "/Known/One");

    let body = watcher.notification(SessionResponse::KnownTerminalsChanged);
    assert_eq!(1, body[0]); // ADDED
    assert_eq!(TerminalKind::Producer as u8, body[1]);
    assert_eq!(123, LittleEndian::read_u32(&body[2..6]));
    let name = &body[6..body.len() - 1];
    assert_eq!(b"/Known/One", name);
    assert_eq!(0, body[body.len() - 1]);

    let (status, _) = watcher.request(&[SessionRequest::MonitorKnownTerminals as u8]);
    assert_eq!(SessionResponse::AlreadyMonitoring as u8, status);
}

#[test]
#[timeout(60000)]
fn scatter_gather_between_sessions() {
    let daemon = Daemon::start();
    let mut requester = daemon.session();
    let mut responder = daemon.session();

    let client_id = requester.create_terminal(TerminalKind::Client, 5, "/Svc");
    let service_id = responder.create_terminal(TerminalKind::Service, 5, "/Svc");

    let (status, _) = responder
        .request(&frame_with_id(SessionRequest::MonitorReceivedScatterMessages, service_id));
    assert_eq!(SessionResponse::Ok as u8, status);

    // wait until the service's binding reached the client, otherwise
    // the request completes immediately with DEAF
    let (status, _) = requester
        .request(&frame_with_id(SessionRequest::MonitorSubscriptionState, client_id));
    assert_eq!(SessionResponse::Ok as u8, status);
    loop {
        let body = requester.notification(SessionResponse::SubscriptionStateChanged);
        assert_eq!(client_id, LittleEndian::read_u32(&body[..4]));
        if body[4] == 1 {
            break;
        }
    }

    let mut scatter = frame_with_id(SessionRequest::ScatterGather, client_id);
    scatter.push(0x45);
    let (status, body) = requester.request(&scatter);
    assert_eq!(SessionResponse::Ok as u8, status);
    let operation_id = LittleEndian::read_u32(&body[..4]);

    let scattered = responder.notification(SessionResponse::ScatteredMessageReceived);
    assert_eq!(service_id, LittleEndian::read_u32(&scattered[..4]));
    let remote_op = LittleEndian::read_u32(&scattered[4..8]);
    assert_eq!(&[0x45], &scattered[8..]);

    let mut respond = frame_with_id(SessionRequest::RespondToScatteredMessage, service_id);
    respond.extend_from_slice(&remote_op.to_le_bytes());
    respond.push(0x7b);
    let (status, _) = responder.request(&respond);
    assert_eq!(SessionResponse::Ok as u8, status);

    let gathered = requester.notification(SessionResponse::GatheredMessageReceived);
    assert_eq!(client_id, LittleEndian::read_u32(&gathered[..4]));
    assert_eq!(operation_id, LittleEndian::read_u32(&gathered[4..8]));
    let flags = gathered[8];
    assert_ne!(0, flags & yogi_protocol::gather_flags::FINISHED);
    assert_eq!(&[0x7b], &gathered[9..]);
}
