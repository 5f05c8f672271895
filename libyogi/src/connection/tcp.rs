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

/*! TCP transport: connections, the client/server factories and the
auto connecting supervisor.

A fresh connection is HANDSHAKING and must be assigned to an endpoint
within its timeout or it is torn down. Assignment exchanges Hello
frames (protocol version, endpoint kind, node id, identification),
enforces the node tree topology and then starts the reader and writer
threads. Liveness comes from periodic heartbeats; no traffic within the
timeout marks the connection DEAD.
*/

use std::{
    io,
    net::{TcpListener, TcpStream, ToSocketAddrs as _},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Condvar, Mutex,
    },
    thread, time,
};

use tracing::{debug, info, instrument, warn};
use yogi_protocol::{Hello, TransportMsg};

use crate::{
    connection::DeathHandler,
    consts,
    endpoint::{Endpoint, EndpointInner},
    errors::{Error, Result},
    scheduler::{Scheduler, Strand},
    wire,
};

const ACCEPT_POLL_INTERVAL: time::Duration = time::Duration::from_millis(20);
const MIN_HEARTBEAT_INTERVAL: time::Duration = time::Duration::from_millis(100);
const IDLE_HEARTBEAT_INTERVAL: time::Duration = time::Duration::from_secs(30);

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Phase {
    Handshaking,
    Open,
    Dead,
}

struct ConnState {
    phase: Phase,
    /// Present until assignment; a clone stays behind for shutdown.
    stream: Option<TcpStream>,
    shutdown_stream: Option<TcpStream>,
    remote_version: Option<String>,
    remote_identification: Option<String>,
    endpoint: Option<(Arc<EndpointInner>, u32)>,
    death_handler: Option<DeathHandler>,
    death_reason: Option<Error>,
}

struct ConnShared {
    strand: Strand,
    identification: Option<String>,
    peer_addr: String,
    state: Mutex<ConnState>,
}

impl ConnShared {
    /// Transition to DEAD: shut the socket down, detach from the
    /// endpoint and fire the death observer.
    fn kill(self: &Arc<Self>, reason: Error) {
        let (endpoint, handler) = {
            let mut st = self.state.lock().unwrap();
            if st.phase == Phase::Dead {
                return;
            }
            st.phase = Phase::Dead;
            st.death_reason = Some(reason.clone());
            if let Some(stream) = st.stream.take() {
                let _ = stream.shutdown(std::net::Shutdown::Both);
            }
            if let Some(stream) = st.shutdown_stream.take() {
                let _ = stream.shutdown(std::net::Shutdown::Both);
            }
            (st.endpoint.take(), st.death_handler.take())
        };

        if let Some((endpoint, conn)) = endpoint {
            endpoint.detach(conn);
        }
        if let Some(handler) = handler {
            self.strand.post(move || handler(reason));
        }
    }
}

/// A TCP link between two endpoints, created by [`TcpClient`] or
/// [`TcpServer`].
pub struct TcpConnection {
    shared: Arc<ConnShared>,
}

impl TcpConnection {
    fn new_pending(
        scheduler: &Scheduler,
        stream: TcpStream,
        identification: Option<String>,
        handshake_timeout: Option<time::Duration>,
    ) -> TcpConnection {
        let peer_addr = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| String::from("unknown"));

        let shared = Arc::new(ConnShared {
            strand: Strand::new(scheduler),
            identification,
            peer_addr,
            state: Mutex::new(ConnState {
                phase: Phase::Handshaking,
                stream: Some(stream),
                shutdown_stream: None,
                remote_version: None,
                remote_identification: None,
                endpoint: None,
                death_handler: None,
                death_reason: None,
            }),
        });

        // unassigned connections do not linger
        let watchdog = Arc::clone(&shared);
        let timeout = handshake_timeout.unwrap_or(consts::DEFAULT_HANDSHAKE_TIMEOUT);
        thread::spawn(move || {
            thread::sleep(timeout);
            let unassigned =
                watchdog.state.lock().unwrap().phase == Phase::Handshaking;
            if unassigned {
                info!("tearing down connection that was not assigned in time");
                watchdog.kill(Error::Timeout);
            }
        });

        TcpConnection { shared }
    }

    /// Attach the connection to an endpoint: exchange Hello frames
    /// within `timeout` (None means infinite), validate them and start
    /// the I/O threads. The same timeout bounds the liveness keepalive
    /// afterwards.
    #[instrument(skip_all, fields(peer = %self.shared.peer_addr))]
    pub fn assign<E>(&self, endpoint: &E, timeout: Option<time::Duration>) -> Result<()>
    where
        E: AsRef<Endpoint>,
    {
        let inner = Arc::clone(&endpoint.as_ref().inner);

        let mut st = self.shared.state.lock().unwrap();
        if st.phase != Phase::Handshaking {
            return Err(Error::AssignmentFailed(String::from(
                "the connection is not in the handshaking phase",
            )));
        }
        let mut stream = st.stream.take().ok_or(Error::Unknown)?;

        let result = Self::handshake_and_start(&self.shared, &mut st, &inner, &mut stream, timeout);
        match result {
            Ok(()) => {
                st.shutdown_stream = Some(stream);
                st.phase = Phase::Open;
                Ok(())
            }
            Err(err) => {
                let _ = stream.shutdown(std::net::Shutdown::Both);
                st.phase = Phase::Dead;
                st.death_reason = Some(err.clone());
                Err(err)
            }
        }
    }

    fn handshake_and_start(
        shared: &Arc<ConnShared>,
        st: &mut ConnState,
        inner: &Arc<EndpointInner>,
        stream: &mut TcpStream,
        timeout: Option<time::Duration>,
    ) -> Result<()> {
        stream.set_read_timeout(timeout).map_err(|_| Error::Unknown)?;

        let hello = Hello {
            version: String::from(yogi_protocol::VERSION),
            endpoint_kind: inner.kind,
            node_id: inner.id,
            identification: shared.identification.clone(),
        };
        wire::write_frame(stream, &TransportMsg::Hello(hello))
            .map_err(|_| Error::ConnectionLost)?;

        let frame = wire::read_frame(stream).map_err(|e| {
            if is_timeout(&e) {
                Error::Timeout
            } else {
                Error::ConnectionLost
            }
        })?;
        let peer = match frame {
            TransportMsg::Hello(h) => h,
            _ => {
                return Err(Error::AssignmentFailed(String::from(
                    "peer did not start with a Hello frame",
                )))
            }
        };

        if !versions_compatible(yogi_protocol::VERSION, &peer.version) {
            return Err(Error::AssignmentFailed(format!(
                "incompatible protocol versions (local {}, remote {})",
                yogi_protocol::VERSION,
                peer.version
            )));
        }

        st.remote_version = Some(peer.version.clone());
        st.remote_identification = peer.identification.clone();

        let (writer_tx, writer_rx) = crossbeam_channel::unbounded();
        let conn = inner.attach_remote(writer_tx, peer.endpoint_kind, peer.node_id)?;

        let write_stream = stream.try_clone().map_err(|_| Error::Unknown)?;
        let heartbeat = heartbeat_interval(timeout);
        thread::spawn(move || writer_main(write_stream, writer_rx, heartbeat));

        let read_stream = stream.try_clone().map_err(|_| Error::Unknown)?;
        let reader_shared = Arc::clone(shared);
        let reader_endpoint = Arc::clone(inner);
        thread::spawn(move || reader_main(read_stream, reader_shared, reader_endpoint, conn));

        st.endpoint = Some((Arc::clone(inner), conn));
        Ok(())
    }

    /// One-shot: fires with the failure that killed the connection.
    pub fn async_await_death<F>(&self, handler: F) -> Result<()>
    where
        F: FnOnce(Error) + Send + 'static,
    {
        let mut st = self.shared.state.lock().unwrap();
        if st.phase == Phase::Dead {
            let reason = st.death_reason.clone().unwrap_or(Error::ConnectionLost);
            self.shared.strand.post(move || handler(reason));
            return Ok(());
        }
        if st.death_handler.is_some() {
            return Err(Error::AlreadyAwaiting);
        }
        st.death_handler = Some(Box::new(handler));
        Ok(())
    }

    pub fn cancel_await_death(&self) {
        let taken = self.shared.state.lock().unwrap().death_handler.take();
        if let Some(handler) = taken {
            self.shared.strand.post(move || handler(Error::Canceled));
        }
    }

    pub fn description(&self) -> String {
        format!("tcp://{}", self.shared.peer_addr)
    }

    pub fn remote_version(&self) -> Option<String> {
        self.shared.state.lock().unwrap().remote_version.clone()
    }

    pub fn remote_identification(&self) -> Option<String> {
        self.shared.state.lock().unwrap().remote_identification.clone()
    }
}

impl Drop for TcpConnection {
    fn drop(&mut self) {
        self.shared.kill(Error::Canceled);
    }
}

fn is_timeout(err: &anyhow::Error) -> bool {
    err.root_cause()
        .downcast_ref::<io::Error>()
        .map(|e| matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut))
        .unwrap_or(false)
}

// Pre 1.0 versions flag breaking changes with their minor component.
fn versions_compatible(local: &str, remote: &str) -> bool {
    let parse = |v: &str| -> Option<(u64, u64)> {
        let mut parts = v.split('.');
        let major = parts.next()?.parse().ok()?;
        let minor = parts.next()?.parse().ok()?;
        Some((major, minor))
    };
    match (parse(local), parse(remote)) {
        (Some((0, lm)), Some((0, rm))) => lm == rm,
        (Some((l, _)), Some((r, _))) => l == r,
        _ => false,
    }
}

fn heartbeat_interval(timeout: Option<time::Duration>) -> time::Duration {
    match timeout {
        Some(t) => (t / 2).max(MIN_HEARTBEAT_INTERVAL),
        None => IDLE_HEARTBEAT_INTERVAL,
    }
}

fn writer_main(
    mut stream: TcpStream,
    rx: crossbeam_channel::Receiver<TransportMsg>,
    heartbeat: time::Duration,
) {
    loop {
        let msg = match rx.recv_timeout(heartbeat) {
            Ok(msg) => msg,
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => TransportMsg::Heartbeat,
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => return,
        };
        if let Err(err) = wire::write_frame(&mut stream, &msg) {
            debug!("writer stopping: {:#}", err);
            // the reader notices the dead socket and performs the
            // actual teardown
            let _ = stream.shutdown(std::net::Shutdown::Both);
            return;
        }
    }
}

fn reader_main(
    mut stream: TcpStream,
    shared: Arc<ConnShared>,
    endpoint: Arc<EndpointInner>,
    conn: u32,
) {
    loop {
        match wire::read_frame(&mut stream) {
            Ok(msg) => {
                let target = Arc::clone(&endpoint);
                endpoint.strand.post(move || EndpointInner::dispatch(&target, conn, msg));
            }
            Err(err) => {
                let reason = if is_timeout(&err) {
                    warn!("connection to {} timed out", shared.peer_addr);
                    Error::Timeout
                } else {
                    debug!("connection to {} lost: {:#}", shared.peer_addr, err);
                    Error::ConnectionLost
                };
                shared.kill(reason);
                return;
            }
        }
    }
}

/// Establishes outbound TCP connections.
pub struct TcpClient {
    scheduler: Scheduler,
    identification: Option<String>,
    strand: Strand,
    pending: Arc<Mutex<Option<ConnectHandler>>>,
}

type ConnectHandler = Box<dyn FnOnce(Result<TcpConnection>) + Send>;

impl TcpClient {
    pub fn new(scheduler: &Scheduler, identification: Option<String>) -> TcpClient {
        TcpClient {
            scheduler: scheduler.clone(),
            identification,
            strand: Strand::new(scheduler),
            pending: Arc::new(Mutex::new(None)),
        }
    }

    pub fn identification(&self) -> Option<&str> {
        self.identification.as_deref()
    }

    /// Open a TCP connection to host:port. The handler receives a
    /// connection in the HANDSHAKING phase which must then be assigned
    /// within `timeout`.
    pub fn async_connect<F>(
        &self,
        host: &str,
        port: u16,
        timeout: Option<time::Duration>,
        handler: F,
    ) -> Result<()>
    where
        F: FnOnce(Result<TcpConnection>) + Send + 'static,
    {
        {
            let mut pending = self.pending.lock().unwrap();
            if pending.is_some() {
                return Err(Error::AlreadyAwaiting);
            }
            *pending = Some(Box::new(handler));
        }

        let host = String::from(host);
        let scheduler = self.scheduler.clone();
        let identification = self.identification.clone();
        let strand = self.strand.clone();
        let pending = Arc::clone(&self.pending);
        thread::spawn(move || {
            let result = connect_stream(&host, port, timeout).map(|stream| {
                TcpConnection::new_pending(&scheduler, stream, identification, timeout)
            });
            if let Some(handler) = pending.lock().unwrap().take() {
                strand.post(move || handler(result));
            }
        });

        Ok(())
    }

    /// The outstanding connect, if any, completes with *canceled*.
    pub fn cancel_connect(&self) {
        if let Some(handler) = self.pending.lock().unwrap().take() {
            self.strand.post(move || handler(Err(Error::Canceled)));
        }
    }
}

fn connect_stream(host: &str, port: u16, timeout: Option<time::Duration>) -> Result<TcpStream> {
    let addrs: Vec<_> = (host, port)
        .to_socket_addrs()
        .map_err(|_| Error::InvalidTarget(format!("{host}:{port}")))?
        .collect();
    let addr = addrs.first().ok_or(Error::InvalidTarget(format!("{host}:{port}")))?;

    let stream = match timeout {
        Some(t) => TcpStream::connect_timeout(addr, t),
        None => TcpStream::connect(addr),
    };
    stream.map_err(|e| {
        if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) {
            Error::Timeout
        } else {
            Error::ConnectionLost
        }
    })
}

type AcceptHandler = Box<dyn FnOnce(Result<TcpConnection>) + Send>;

struct AcceptReq {
    timeout: Option<time::Duration>,
}

struct ServerShared {
    pending: Mutex<Option<AcceptHandler>>,
    closed: AtomicBool,
}

/// Accepts inbound TCP connections on a fixed address.
pub struct TcpServer {
    address: String,
    port: u16,
    identification: Option<String>,
    strand: Strand,
    shared: Arc<ServerShared>,
    req_tx: crossbeam_channel::Sender<AcceptReq>,
}

impl TcpServer {
    /// Bind the listening socket. Failure to bind is fatal for the
    /// caller, so it surfaces immediately.
    pub fn new(
        scheduler: &Scheduler,
        address: &str,
        port: u16,
        identification: Option<String>,
    ) -> Result<TcpServer> {
        let listener = TcpListener::bind((address, port))
            .map_err(|_| Error::InvalidTarget(format!("{address}:{port}")))?;
        listener.set_nonblocking(true).map_err(|_| Error::Unknown)?;

        let shared =
            Arc::new(ServerShared { pending: Mutex::new(None), closed: AtomicBool::new(false) });
        let (req_tx, req_rx) = crossbeam_channel::unbounded::<AcceptReq>();

        let accept_shared = Arc::clone(&shared);
        let accept_scheduler = scheduler.clone();
        let accept_identification = identification.clone();
        let strand = Strand::new(scheduler);
        let accept_strand = strand.clone();
        thread::spawn(move || {
            accept_main(
                listener,
                req_rx,
                accept_shared,
                accept_scheduler,
                accept_identification,
                accept_strand,
            )
        });

        Ok(TcpServer {
            address: String::from(address),
            port,
            identification,
            strand,
            shared,
            req_tx,
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn identification(&self) -> Option<&str> {
        self.identification.as_deref()
    }

    /// Accept the next inbound connection. The handler receives a
    /// connection in the HANDSHAKING phase; it is torn down unless
    /// assigned within `timeout`.
    pub fn async_accept<F>(&self, timeout: Option<time::Duration>, handler: F) -> Result<()>
    where
        F: FnOnce(Result<TcpConnection>) + Send + 'static,
    {
        {
            let mut pending = self.shared.pending.lock().unwrap();
            if pending.is_some() {
                return Err(Error::AlreadyAwaiting);
            }
            *pending = Some(Box::new(handler));
        }
        let _ = self.req_tx.send(AcceptReq { timeout });
        Ok(())
    }

    /// The outstanding accept, if any, completes with *canceled*.
    pub fn cancel_accept(&self) {
        if let Some(handler) = self.shared.pending.lock().unwrap().take() {
            self.strand.post(move || handler(Err(Error::Canceled)));
        }
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        self.shared.closed.store(true, Ordering::SeqCst);
    }
}

fn accept_main(
    listener: TcpListener,
    req_rx: crossbeam_channel::Receiver<AcceptReq>,
    shared: Arc<ServerShared>,
    scheduler: Scheduler,
    identification: Option<String>,
    strand: Strand,
) {
    for req in req_rx.iter() {
        loop {
            if shared.closed.load(Ordering::SeqCst) {
                return;
            }
            // the accept was canceled; stop polling
            if shared.pending.lock().unwrap().is_none() {
                break;
            }
            match listener.accept() {
                Ok((stream, addr)) => {
                    debug!("accepted connection from {}", addr);
                    let connection = TcpConnection::new_pending(
                        &scheduler,
                        stream,
                        identification.clone(),
                        req.timeout,
                    );
                    if let Some(handler) = shared.pending.lock().unwrap().take() {
                        strand.post(move || handler(Ok(connection)));
                    }
                    break;
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    thread::sleep(ACCEPT_POLL_INTERVAL);
                }
                Err(e) => {
                    warn!("accepting stream: {:?}", e);
                    if let Some(handler) = shared.pending.lock().unwrap().take() {
                        strand.post(move || handler(Err(Error::Unknown)));
                    }
                    break;
                }
            }
        }
    }
}

type ConnectObserver = Box<dyn Fn(&Result<()>, Option<&TcpConnection>) + Send>;
type DisconnectObserver = Box<dyn Fn(&Error) + Send>;

struct AccState {
    running: bool,
    died: bool,
}

struct AccInner {
    endpoint: Endpoint,
    host: String,
    port: u16,
    timeout: Option<time::Duration>,
    identification: Option<String>,
    state: Mutex<AccState>,
    cv: Condvar,
    observers: Mutex<(Option<ConnectObserver>, Option<DisconnectObserver>)>,
}

/// A supervisor that keeps one connection to a fixed host:port alive:
/// it connects, assigns, watches for death and retries once a second
/// until dropped.
pub struct AutoConnectingTcpClient {
    inner: Arc<AccInner>,
}

impl AutoConnectingTcpClient {
    pub fn new<E>(
        endpoint: &E,
        host: &str,
        port: u16,
        timeout: Option<time::Duration>,
        identification: Option<String>,
    ) -> AutoConnectingTcpClient
    where
        E: AsRef<Endpoint>,
    {
        AutoConnectingTcpClient {
            inner: Arc::new(AccInner {
                endpoint: endpoint.as_ref().clone(),
                host: String::from(host),
                port,
                timeout,
                identification,
                state: Mutex::new(AccState { running: false, died: false }),
                cv: Condvar::new(),
                observers: Mutex::new((None, None)),
            }),
        }
    }

    pub fn host(&self) -> &str {
        &self.inner.host
    }

    pub fn port(&self) -> u16 {
        self.inner.port
    }

    pub fn timeout(&self) -> Option<time::Duration> {
        self.inner.timeout
    }

    pub fn identification(&self) -> Option<&str> {
        self.inner.identification.as_deref()
    }

    /// Observer invoked after every connection attempt, successful or
    /// not.
    pub fn set_connect_observer<F>(&self, observer: F)
    where
        F: Fn(&Result<()>, Option<&TcpConnection>) + Send + 'static,
    {
        self.inner.observers.lock().unwrap().0 = Some(Box::new(observer));
    }

    /// Observer invoked when an established connection dies.
    pub fn set_disconnect_observer<F>(&self, observer: F)
    where
        F: Fn(&Error) + Send + 'static,
    {
        self.inner.observers.lock().unwrap().1 = Some(Box::new(observer));
    }

    /// Start the reconnect loop. Fails with *already-started* when
    /// running.
    pub fn start(&self) -> Result<()> {
        {
            let mut st = self.inner.state.lock().unwrap();
            if st.running {
                return Err(Error::AlreadyStarted);
            }
            st.running = true;
        }
        let inner = Arc::clone(&self.inner);
        thread::spawn(move || supervisor_main(inner));
        Ok(())
    }

    pub fn try_start(&self) -> bool {
        self.start().is_ok()
    }
}

impl Drop for AutoConnectingTcpClient {
    fn drop(&mut self) {
        let mut st = self.inner.state.lock().unwrap();
        st.running = false;
        self.inner.cv.notify_all();
    }
}

#[instrument(skip_all, fields(target = %format!("{}:{}", inner.host, inner.port)))]
fn supervisor_main(inner: Arc<AccInner>) {
    let scheduler = inner.endpoint.scheduler().clone();
    loop {
        if !inner.state.lock().unwrap().running {
            return;
        }

        info!("connecting to {}:{}...", inner.host, inner.port);
        let attempt = connect_stream(&inner.host, inner.port, inner.timeout)
            .map(|stream| {
                TcpConnection::new_pending(
                    &scheduler,
                    stream,
                    inner.identification.clone(),
                    inner.timeout,
                )
            })
            .and_then(|conn| {
                conn.assign(&inner.endpoint, inner.timeout)?;
                Ok(conn)
            });

        match attempt {
            Ok(connection) => {
                info!("connection to {}:{} established successfully", inner.host, inner.port);
                inner.state.lock().unwrap().died = false;

                let death_inner = Arc::clone(&inner);
                let _ = connection.async_await_death(move |err| {
                    {
                        let observers = death_inner.observers.lock().unwrap();
                        if let Some(observer) = &observers.1 {
                            observer(&err);
                        }
                    }
                    let mut st = death_inner.state.lock().unwrap();
                    st.died = true;
                    death_inner.cv.notify_all();
                });

                {
                    let observers = inner.observers.lock().unwrap();
                    if let Some(observer) = &observers.0 {
                        observer(&Ok(()), Some(&connection));
                    }
                }

                // hold the connection until it dies or we are stopped
                let mut st = inner.state.lock().unwrap();
                while st.running && !st.died {
                    st = inner.cv.wait(st).unwrap();
                }
                if !st.running {
                    return;
                }
                drop(st);
                drop(connection);
            }
            Err(err) => {
                debug!("could not connect to {}:{}: {}", inner.host, inner.port, err);
                let observers = inner.observers.lock().unwrap();
                if let Some(observer) = &observers.0 {
                    observer(&Err(err), None);
                }
            }
        }

        // retry cadence
        let st = inner.state.lock().unwrap();
        let (st, _) = inner
            .cv
            .wait_timeout_while(st, consts::RECONNECT_DELAY, |st| st.running)
            .unwrap();
        if !st.running {
            return;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn version_compatibility() {
        let cases = vec![
            ("0.3.0", "0.3.0", true),
            ("0.3.0", "0.3.9", true),
            ("0.3.0", "0.4.0", false),
            ("1.0.0", "1.9.3", true),
            ("1.0.0", "2.0.0", false),
            ("0.3.0", "garbage", false),
        ];
        for (local, remote, want) in cases {
            assert_eq!(versions_compatible(local, remote), want, "{local} vs {remote}");
        }
    }

    #[test]
    fn heartbeat_interval_bounds() {
        assert_eq!(
            heartbeat_interval(Some(time::Duration::from_secs(2))),
            time::Duration::from_secs(1)
        );
        assert_eq!(heartbeat_interval(Some(time::Duration::from_millis(50))), MIN_HEARTBEAT_INTERVAL);
        assert_eq!(heartbeat_interval(None), IDLE_HEARTBEAT_INTERVAL);
    }
}
