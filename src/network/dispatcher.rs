// Copyright 2025 jonefeewang@gmail.com
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

use std::collections::HashMap;
use std::io::ErrorKind;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use dashmap::DashMap;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token, Waker};
use parking_lot::Mutex;
use tracing::{debug, error, info, trace, warn};

use crate::network::command::{command_queue, Command, CommandReceiver, CommandSender};
use crate::network::connection::{ReadOutcome, WriteOutcome};
use crate::network::{Connection, ConnectionId, ConnectionState, Packet};
use crate::service::{NetworkConfig, Shutdown, TransportConfig};
use crate::{AppError, AppResult};

const WAKER_TOKEN: Token = Token(usize::MAX);
const LISTENER_TOKEN: Token = Token(usize::MAX - 1);

/// State shared between the dispatcher handle and its event loop thread.
struct Shared {
    network: NetworkConfig,
    connections: DashMap<ConnectionId, Arc<Connection>>,
    lost_connections: Mutex<Vec<Arc<Connection>>>,
    // bound by `listen`, registered by the loop
    pending_listener: Mutex<Option<TcpListener>>,
    local_addr: Mutex<Option<SocketAddr>>,
    commands: CommandSender,
    waker: Arc<Waker>,
    shutdown: Shutdown,
    running: AtomicBool,
}

impl Shared {
    fn add_connection(&self, connection: Arc<Connection>) -> AppResult<()> {
        self.connections.insert(connection.id(), connection.clone());
        if let Err(e) = self.commands.submit(Command::Register(connection.clone())) {
            connection.abort(None, Some(e.to_string()));
            self.mark_lost(&connection);
            return Err(e);
        }
        Ok(())
    }

    /// Moves `connection` from the live set to the lost set. A connection already moved, and
    /// possibly collected, is reported only once.
    fn mark_lost(&self, connection: &Arc<Connection>) {
        let mut lost = self.lost_connections.lock();
        if self.connections.remove(&connection.id()).is_some() {
            lost.push(connection.clone());
        }
    }
}

/// Owns the event loop thread and is the entry point for the rest of the application.
///
/// Every method can be called from any thread and returns without waiting for network I/O;
/// only [`Dispatcher::connect`] may wait, on name resolution.
/// Socket reads, writes and selector registrations all happen on the single loop thread;
/// requests from other threads reach it through a command queue plus a selector waker.
///
/// Share it by reference or `Arc`; dropping it stops the loop and closes every connection.
pub struct Dispatcher {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<AppResult<()>>>>,
}

impl Dispatcher {
    /// Creates the selector and starts the event loop thread.
    pub fn start(config: &TransportConfig) -> AppResult<Dispatcher> {
        config.validate()?;
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
        let (commands, command_rx) = command_queue(waker.clone());

        let shared = Arc::new(Shared {
            network: config.network.clone(),
            connections: DashMap::new(),
            lost_connections: Mutex::new(Vec::new()),
            pending_listener: Mutex::new(None),
            local_addr: Mutex::new(None),
            commands,
            waker: waker.clone(),
            shutdown: Shutdown::new(waker),
            running: AtomicBool::new(true),
        });

        let event_loop = EventLoop {
            events: Events::with_capacity(config.network.poll_capacity),
            poll,
            listener: None,
            registered: HashMap::new(),
            commands: command_rx,
            shared: shared.clone(),
        };
        let worker = thread::Builder::new()
            .name("tablewire-dispatcher".to_string())
            .spawn(move || event_loop.run())?;

        Ok(Dispatcher {
            shared,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Starts accepting peers on `network.ip:port` (server role). Port 0 picks a free port.
    /// Returns the bound address.
    #[tracing::instrument(skip(self))]
    pub fn listen(&self, port: u16) -> AppResult<SocketAddr> {
        self.ensure_running()?;
        let mut local_addr = self.shared.local_addr.lock();
        if let Some(addr) = *local_addr {
            return Err(AppError::IllegalState(format!(
                "dispatcher is already listening on {}",
                addr
            )));
        }
        let ip: IpAddr = self.shared.network.ip.parse().map_err(|e| {
            AppError::InvalidValue(format!("network.ip {}: {}", self.shared.network.ip, e))
        })?;
        let listen_address = SocketAddr::new(ip, port);
        let listener = TcpListener::bind(listen_address).map_err(|e| {
            let error_msg = format!(
                "Failed to bind server to address: {} - Error: {}",
                listen_address, e
            );
            error!("{}", error_msg);
            AppError::IllegalState(error_msg)
        })?;
        let addr = listener.local_addr()?;
        *self.shared.pending_listener.lock() = Some(listener);
        *local_addr = Some(addr);
        drop(local_addr);

        if let Err(e) = self.shared.waker.wake() {
            warn!("failed to wake event loop: {}", e);
        }
        info!("tcp server binding to {} for listening", addr);
        Ok(addr)
    }

    /// Resolves `host` and starts an outbound connect to the first address (client role).
    ///
    /// Name resolution runs on the calling thread and may block; callers that must not wait
    /// resolve beforehand and use [`Dispatcher::connect_addr`].
    #[tracing::instrument(skip(self))]
    pub fn connect(&self, host: &str, port: u16) -> AppResult<Arc<Connection>> {
        self.ensure_running()?;
        let addr = (host, port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| AppError::InvalidValue(format!("cannot resolve {}:{}", host, port)))?;
        self.connect_addr(addr)
    }

    /// Starts a non-blocking connect to `addr`. The connection is `PendingConnection` until
    /// the handshake completes on the loop thread; sends queued before that are kept.
    pub fn connect_addr(&self, addr: SocketAddr) -> AppResult<Arc<Connection>> {
        self.ensure_running()?;
        let stream = TcpStream::connect(addr)?;
        let connection = Arc::new(Connection::new(
            stream,
            addr,
            ConnectionState::PendingConnection,
            &self.shared.network,
            self.shared.commands.clone(),
        ));
        info!(id = connection.id(), %addr, "initiating connection");
        self.add_connection(connection.clone())?;
        Ok(connection)
    }

    /// Takes over a stream connected elsewhere.
    pub fn adopt(&self, stream: std::net::TcpStream) -> AppResult<Arc<Connection>> {
        self.ensure_running()?;
        let peer_addr = stream.peer_addr()?;
        stream.set_nonblocking(true)?;
        let connection = Arc::new(Connection::new(
            TcpStream::from_std(stream),
            peer_addr,
            ConnectionState::PendingConnection,
            &self.shared.network,
            self.shared.commands.clone(),
        ));
        self.add_connection(connection.clone())?;
        Ok(connection)
    }

    /// Adds `connection` to the live set and asks the loop to register it.
    pub fn add_connection(&self, connection: Arc<Connection>) -> AppResult<()> {
        self.shared.add_connection(connection)
    }

    /// Closes `connection` (flushing queued bytes first) and moves it to the lost set.
    pub fn remove_connection(&self, connection: &Arc<Connection>) {
        connection.close();
        self.shared.mark_lost(connection);
    }

    /// Queues `payload` on every logged-in connection. Returns how many connections took it.
    pub fn broadcast(&self, payload: &[u8]) -> usize {
        let targets: Vec<Arc<Connection>> = self
            .shared
            .connections
            .iter()
            .filter(|entry| entry.value().is_logged_in())
            .map(|entry| entry.value().clone())
            .collect();
        let mut sent = 0;
        for connection in targets {
            match connection.send(payload) {
                Ok(()) => sent += 1,
                Err(e) => debug!(id = connection.id(), "broadcast skipped connection: {}", e),
            }
        }
        sent
    }

    /// Queues `payload` on `connection`, whatever its login state.
    pub fn send_to(&self, payload: &[u8], connection: &Connection) -> AppResult<()> {
        connection.send(payload)
    }

    /// Takes every payload decoded so far, paired with its connection.
    ///
    /// A snapshot: payloads decoded after the call are left for the next one. Payloads of one
    /// connection keep their arrival order. Lost connections not yet collected by
    /// [`Dispatcher::poll_lost_connections`] are drained too.
    pub fn drain_all_packets(&self) -> Vec<Packet> {
        let mut packets = Vec::new();
        for entry in self.shared.connections.iter() {
            collect_packets(entry.value(), &mut packets);
        }
        for connection in self.shared.lost_connections.lock().iter() {
            collect_packets(connection, &mut packets);
        }
        packets
    }

    /// Returns the connections that died since the last call, and forgets them.
    pub fn poll_lost_connections(&self) -> Vec<Arc<Connection>> {
        let dead: Vec<Arc<Connection>> = self
            .shared
            .connections
            .iter()
            .filter(|entry| entry.value().is_dead())
            .map(|entry| entry.value().clone())
            .collect();
        for connection in dead {
            self.shared.mark_lost(&connection);
        }
        std::mem::take(&mut *self.shared.lost_connections.lock())
    }

    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.shared
            .connections
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn connection(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.shared
            .connections
            .get(&id)
            .map(|entry| entry.value().clone())
    }

    pub fn connection_count(&self) -> usize {
        self.shared.connections.len()
    }

    /// Address of the listener, once [`Dispatcher::listen`] succeeded.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.shared.local_addr.lock()
    }

    /// False once the loop stopped, either through [`Dispatcher::shutdown`] or a fatal error.
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Stops the loop, closes every connection and waits for the thread to exit. Returns the
    /// error that ended the loop, if it died on its own.
    pub fn shutdown(&self) -> AppResult<()> {
        self.shared.shutdown.trigger();
        let worker = self.worker.lock().take();
        match worker {
            Some(handle) => handle
                .join()
                .map_err(|_| AppError::IllegalState("dispatcher thread panicked".to_string()))?,
            None => Ok(()),
        }
    }

    fn ensure_running(&self) -> AppResult<()> {
        if self.is_running() {
            Ok(())
        } else {
            Err(AppError::IllegalState(
                "dispatcher is not running".to_string(),
            ))
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            error!("dispatcher stopped with error: {}", e);
        }
        debug!("dispatcher dropped");
    }
}

fn collect_packets(connection: &Arc<Connection>, packets: &mut Vec<Packet>) {
    for payload in connection.drain_inbound() {
        packets.push(Packet::new(payload, connection.clone()));
    }
}

/// The loop thread's private state. Nothing here is touched by any other thread.
struct EventLoop {
    poll: Poll,
    events: Events,
    listener: Option<TcpListener>,
    registered: HashMap<Token, Arc<Connection>>,
    commands: CommandReceiver,
    shared: Arc<Shared>,
}

impl EventLoop {
    fn run(mut self) -> AppResult<()> {
        info!("dispatcher event loop started");
        let result = self.run_loop();
        if let Err(e) = &result {
            error!("dispatcher event loop terminated: {}", e);
        }
        self.close_all();
        self.shared.running.store(false, Ordering::Release);
        info!("dispatcher event loop stopped");
        result
    }

    fn run_loop(&mut self) -> AppResult<()> {
        let timeout = self.shared.network.poll_timeout();
        while !self.shared.shutdown.is_shutdown() {
            self.register_pending_listener();
            self.run_commands();

            if let Err(e) = self.poll.poll(&mut self.events, Some(timeout)) {
                if e.kind() == ErrorKind::Interrupted {
                    continue;
                }
                return Err(e.into());
            }

            let ready: Vec<(Token, bool, bool)> = self
                .events
                .iter()
                .map(|event| {
                    (
                        event.token(),
                        event.is_readable() || event.is_read_closed(),
                        event.is_writable() || event.is_write_closed() || event.is_error(),
                    )
                })
                .collect();
            for (token, readable, writable) in ready {
                match token {
                    // queued commands run at the top of the next iteration
                    WAKER_TOKEN => {}
                    LISTENER_TOKEN => self.accept_connections(),
                    token => self.handle_event(token, readable, writable),
                }
            }
        }
        Ok(())
    }

    fn register_pending_listener(&mut self) {
        let pending = self.shared.pending_listener.lock().take();
        let Some(mut listener) = pending else {
            return;
        };
        match self
            .poll
            .registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)
        {
            Ok(()) => {
                debug!("listener registered");
                self.listener = Some(listener);
            }
            Err(e) => {
                error!("failed to register listener: {}", e);
                *self.shared.local_addr.lock() = None;
            }
        }
    }

    fn run_commands(&mut self) {
        for command in self.commands.drain() {
            trace!(?command, "running command");
            match command {
                Command::Register(connection) => {
                    if connection.is_terminal() {
                        self.forget_abandoned(&connection);
                        continue;
                    }
                    match connection.register(self.poll.registry()) {
                        Ok(()) => {
                            self.registered.insert(connection.token(), connection);
                        }
                        Err(e) => self.drop_connection(&connection, e),
                    }
                }
                Command::ArmWrite(id) => {
                    let Some(connection) = self.registered.get(&Token(id as usize)).cloned()
                    else {
                        continue;
                    };
                    if let Err(e) = connection.enable_write(self.poll.registry()) {
                        self.drop_connection(&connection, e);
                    }
                }
            }
        }
        // connections closed from other threads have already left the selector with their fd
        let closed: Vec<Token> = self
            .registered
            .iter()
            .filter(|(_, connection)| connection.is_terminal())
            .map(|(token, _)| *token)
            .collect();
        for token in closed {
            if let Some(connection) = self.registered.remove(&token) {
                self.forget_abandoned(&connection);
            }
        }
    }

    /// A connection closed before it ever connected is dropped without being reported lost.
    fn forget_abandoned(&self, connection: &Arc<Connection>) {
        if connection.state() == ConnectionState::Abandoned {
            self.shared.connections.remove(&connection.id());
        }
    }

    fn accept_connections(&mut self) {
        let Some(listener) = self.listener.as_ref() else {
            return;
        };
        loop {
            match listener.accept() {
                Ok((stream, peer_addr)) => {
                    if self.shared.connections.len() >= self.shared.network.max_connection {
                        warn!(
                            %peer_addr,
                            max_connection = self.shared.network.max_connection,
                            "connection limit reached, dropping new peer"
                        );
                        continue;
                    }
                    let connection = Arc::new(Connection::new(
                        stream,
                        peer_addr,
                        ConnectionState::PendingConnection,
                        &self.shared.network,
                        self.shared.commands.clone(),
                    ));
                    info!(id = connection.id(), %peer_addr, "accepted connection");
                    if let Err(e) = self.shared.add_connection(connection) {
                        warn!("failed to submit accepted connection: {}", e);
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    let e = AppError::Accept(e.to_string());
                    error!("{}", e);
                    break;
                }
            }
        }
    }

    fn handle_event(&mut self, token: Token, readable: bool, writable: bool) {
        let Some(connection) = self.registered.get(&token).cloned() else {
            debug!(?token, "event for a connection that is no longer registered, skipped");
            return;
        };
        match self.drive(&connection, readable, writable) {
            Ok(true) => {}
            Ok(false) => {
                self.registered.remove(&token);
            }
            Err(e) => self.drop_connection(&connection, e),
        }
    }

    /// Runs the connect, read and write paths for one event. Returns whether the connection
    /// stays registered.
    fn drive(&self, connection: &Arc<Connection>, readable: bool, writable: bool) -> AppResult<bool> {
        let registry = self.poll.registry();
        if writable
            && connection.state() == ConnectionState::PendingConnection
            && !connection.finish_connect(registry)?
        {
            return Ok(true);
        }
        if readable {
            match connection.handle_readable()? {
                ReadOutcome::Open => {}
                ReadOutcome::PeerClosed => {
                    return Err(AppError::DetailedIoError(
                        "connection closed by peer".to_string(),
                    ));
                }
                ReadOutcome::Gone => {
                    debug!(id = connection.id(), "socket closed before its read event ran");
                    return Ok(false);
                }
            }
        }
        if writable {
            match connection.handle_writable(registry)? {
                WriteOutcome::Pending | WriteOutcome::Drained => {}
                WriteOutcome::Flushed => return Ok(false),
                WriteOutcome::Gone => {
                    debug!(id = connection.id(), "socket closed before its write event ran");
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    /// Tears a connection down after an error on the loop thread. The error is recorded on the
    /// connection and logged, never propagated.
    fn drop_connection(&mut self, connection: &Arc<Connection>, reason: AppError) {
        if reason.is_connection_scoped() {
            info!(id = connection.id(), peer = %connection.peer_addr(), "connection lost: {}", reason);
        } else {
            warn!(id = connection.id(), peer = %connection.peer_addr(), "connection failed: {}", reason);
        }
        self.registered.remove(&connection.token());
        connection.abort(Some(self.poll.registry()), Some(reason.to_string()));
        self.shared.mark_lost(connection);
    }

    fn close_all(&mut self) {
        if let Some(mut listener) = self.listener.take() {
            if let Err(e) = self.poll.registry().deregister(&mut listener) {
                trace!("failed to deregister listener: {}", e);
            }
        }
        let registry = self.poll.registry();
        let mut live: Vec<Arc<Connection>> = self
            .shared
            .connections
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        live.extend(self.registered.drain().map(|(_, connection)| connection));
        for connection in live {
            if !connection.is_terminal() {
                connection.abort(Some(registry), Some("dispatcher shut down".to_string()));
            }
            if connection.is_dead() {
                self.shared.mark_lost(&connection);
            } else {
                self.shared.connections.remove(&connection.id());
            }
        }
        debug!("all connections closed");
    }
}
