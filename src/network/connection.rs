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

use std::collections::VecDeque;
use std::fmt;
use std::io::{self, ErrorKind};
use std::net::{Shutdown, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use bytes::Bytes;
use mio::net::TcpStream;
use mio::{Interest, Registry, Token};
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::network::command::{Command, CommandSender};
use crate::network::{frame, FrameBuffer};
use crate::service::NetworkConfig;
use crate::{AppError, AppResult};

pub type ConnectionId = u64;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Outbound connect started, handshake not finished.
    PendingConnection,
    Connected,
    /// Promoted by the application once its own handshake succeeded.
    LoggedIn,
    /// Close requested; queued bytes are written before the socket goes away.
    Flushing,
    /// Socket torn down after the connection had been established.
    Closed,
    /// Socket torn down before the connection was ever established.
    Abandoned,
}

impl ConnectionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Closed | ConnectionState::Abandoned)
    }
}

/// Result of draining a readable socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReadOutcome {
    /// Socket drained, still open.
    Open,
    /// The peer shut down its side.
    PeerClosed,
    /// The socket was already closed by another thread.
    Gone,
}

/// Result of flushing the send buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WriteOutcome {
    /// The socket is full or still connecting; wait for the next writable event.
    Pending,
    /// Send buffer empty, write interest dropped.
    Drained,
    /// Send buffer empty and the connection was flushing, socket now closed.
    Flushed,
    Gone,
}

/// One TCP peer.
///
/// Application threads call [`Connection::send`], [`Connection::receive`] and
/// [`Connection::close`]; none of them block or touch selector registrations. The socket
/// itself is only read, written and registered by the dispatcher thread.
///
/// Lock order: send buffer, state, socket, receive buffer, inbound queue.
pub struct Connection {
    id: ConnectionId,
    peer_addr: SocketAddr,
    max_frame_size: usize,
    state: Mutex<ConnectionState>,
    socket: Mutex<Option<TcpStream>>,
    send_buffer: Mutex<FrameBuffer>,
    receive_buffer: Mutex<FrameBuffer>,
    inbound: Mutex<VecDeque<Bytes>>,
    // set while write interest is registered or an ArmWrite command is queued
    write_armed: AtomicBool,
    close_reason: Mutex<Option<String>>,
    commands: CommandSender,
}

impl Connection {
    pub(crate) fn new(
        stream: TcpStream,
        peer_addr: SocketAddr,
        state: ConnectionState,
        network: &NetworkConfig,
        commands: CommandSender,
    ) -> Connection {
        if network.tcp_nodelay {
            if let Err(e) = stream.set_nodelay(true) {
                warn!(%peer_addr, "failed to set TCP_NODELAY: {}", e);
            }
        }
        Connection {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            peer_addr,
            max_frame_size: network.max_frame_size,
            state: Mutex::new(state),
            socket: Mutex::new(Some(stream)),
            send_buffer: Mutex::new(FrameBuffer::with_capacity(network.buffer_size)),
            receive_buffer: Mutex::new(FrameBuffer::with_capacity(network.buffer_size)),
            inbound: Mutex::new(VecDeque::new()),
            write_armed: AtomicBool::new(false),
            close_reason: Mutex::new(None),
            commands,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub(crate) fn token(&self) -> Token {
        Token(self.id as usize)
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    pub fn is_connected(&self) -> bool {
        matches!(
            self.state(),
            ConnectionState::Connected | ConnectionState::LoggedIn | ConnectionState::Flushing
        )
    }

    pub fn is_logged_in(&self) -> bool {
        self.state() == ConnectionState::LoggedIn
    }

    /// True once an established connection has gone away. A connection that never finished
    /// connecting is not dead, it just never connected.
    pub fn is_dead(&self) -> bool {
        self.state() == ConnectionState::Closed
    }

    pub(crate) fn is_terminal(&self) -> bool {
        self.state().is_terminal()
    }

    /// Promotes `Connected` to `LoggedIn`; any other state is left alone.
    pub fn mark_logged_in(&self) {
        let mut state = self.state.lock();
        if *state == ConnectionState::Connected {
            *state = ConnectionState::LoggedIn;
            debug!(id = self.id, peer = %self.peer_addr, "connection logged in");
        }
    }

    /// Why the dispatcher tore the connection down, if it did.
    pub fn close_reason(&self) -> Option<String> {
        self.close_reason.lock().clone()
    }

    /// Bytes queued for the peer and not yet handed to the socket.
    pub fn pending_send_bytes(&self) -> usize {
        self.send_buffer.lock().len()
    }

    /// Queues `payload` as one frame. Returns immediately; the dispatcher thread writes it.
    ///
    /// Fails with `ConnectionClosed` once [`Connection::close`] was called or the socket is
    /// gone, with `FrameTooLarge` when the payload is over the configured limit, and with
    /// `ChannelSendError` when the dispatcher has stopped. Nothing is queued on failure.
    pub fn send(&self, payload: &[u8]) -> AppResult<()> {
        let mut send_buffer = self.send_buffer.lock();
        let state = self.state.lock();
        if matches!(
            *state,
            ConnectionState::Flushing | ConnectionState::Closed | ConnectionState::Abandoned
        ) {
            return Err(AppError::ConnectionClosed(self.id));
        }
        drop(state);
        let queued = send_buffer.len();
        frame::encode(payload, &mut send_buffer, self.max_frame_size)?;
        // armed under the lock: the loop cannot drain the frame before a failure is undone
        if let Err(e) = self.arm_write() {
            send_buffer.truncate(queued);
            return Err(e);
        }
        trace!(id = self.id, len = payload.len(), "queued frame");
        Ok(())
    }

    /// Oldest decoded payload, if any.
    pub fn receive(&self) -> Option<Bytes> {
        self.inbound.lock().pop_front()
    }

    pub fn has_packets(&self) -> bool {
        !self.inbound.lock().is_empty()
    }

    /// Takes every decoded payload queued so far, oldest first.
    pub(crate) fn drain_inbound(&self) -> Vec<Bytes> {
        self.inbound.lock().drain(..).collect()
    }

    /// Requests a graceful close.
    ///
    /// With nothing queued the socket is closed right away. Otherwise the connection becomes
    /// `Flushing` and the dispatcher closes the socket once the last queued byte is written.
    /// A connection still connecting is abandoned. Calling it again has no effect.
    pub fn close(&self) {
        let send_buffer = self.send_buffer.lock();
        let mut state = self.state.lock();
        let current = *state;
        match current {
            ConnectionState::Flushing | ConnectionState::Closed | ConnectionState::Abandoned => {
                return;
            }
            ConnectionState::PendingConnection => *state = ConnectionState::Abandoned,
            ConnectionState::Connected | ConnectionState::LoggedIn if !send_buffer.is_empty() => {
                *state = ConnectionState::Flushing;
                debug!(
                    id = self.id,
                    pending = send_buffer.len(),
                    "connection flushing before close"
                );
                drop(state);
                drop(send_buffer);
                if let Err(e) = self.arm_write() {
                    warn!(id = self.id, "failed to arm write for flush: {}", e);
                }
                return;
            }
            ConnectionState::Connected | ConnectionState::LoggedIn => {
                *state = ConnectionState::Closed
            }
        }
        // the fd leaves the selector when it is closed; stale events for the token are skipped
        Self::close_socket(&mut self.socket.lock(), None);
        debug!(id = self.id, peer = %self.peer_addr, state = ?*state, "connection closed");
    }

    /// Tears the connection down immediately, dropping queued bytes. Dispatcher thread only.
    pub(crate) fn abort(&self, registry: Option<&Registry>, reason: Option<String>) {
        if reason.is_some() {
            *self.close_reason.lock() = reason;
        }
        let mut state = self.state.lock();
        *state = match *state {
            ConnectionState::PendingConnection | ConnectionState::Abandoned => {
                ConnectionState::Abandoned
            }
            _ => ConnectionState::Closed,
        };
        Self::close_socket(&mut self.socket.lock(), registry);
        trace!(id = self.id, state = ?*state, "connection aborted");
    }

    fn arm_write(&self) -> AppResult<()> {
        if self.write_armed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.commands
            .submit(Command::ArmWrite(self.id))
            .inspect_err(|_| self.write_armed.store(false, Ordering::Release))
    }

    fn close_socket(socket: &mut Option<TcpStream>, registry: Option<&Registry>) {
        if let Some(mut stream) = socket.take() {
            if let Some(registry) = registry {
                if let Err(e) = registry.deregister(&mut stream) {
                    trace!("deregister on close failed: {}", e);
                }
            }
            if let Err(e) = stream.shutdown(Shutdown::Both) {
                trace!("shutdown on close failed: {}", e);
            }
        }
    }

    /// Registers the socket with the selector. Dispatcher thread only.
    ///
    /// An accepted or adopted socket is already connected, which promotes a pending
    /// connection straight to `Connected`.
    pub(crate) fn register(&self, registry: &Registry) -> AppResult<()> {
        let send_buffer = self.send_buffer.lock();
        let mut state = self.state.lock();
        let mut socket = self.socket.lock();
        let stream = socket.as_mut().ok_or(AppError::ConnectionClosed(self.id))?;

        if *state == ConnectionState::PendingConnection && stream.peer_addr().is_ok() {
            *state = ConnectionState::Connected;
        }
        let interest =
            if *state == ConnectionState::PendingConnection || !send_buffer.is_empty() {
                self.write_armed.store(true, Ordering::Release);
                Interest::READABLE | Interest::WRITABLE
            } else {
                Interest::READABLE
            };
        registry.register(stream, self.token(), interest)?;
        debug!(id = self.id, peer = %self.peer_addr, state = ?*state, "connection registered");
        Ok(())
    }

    /// Adds write interest. Dispatcher thread only.
    pub(crate) fn enable_write(&self, registry: &Registry) -> AppResult<()> {
        let mut socket = self.socket.lock();
        if let Some(stream) = socket.as_mut() {
            registry.reregister(stream, self.token(), Interest::READABLE | Interest::WRITABLE)?;
        }
        Ok(())
    }

    /// Completes an outbound connect on the first writable event. Returns whether the
    /// connection is established. Dispatcher thread only.
    pub(crate) fn finish_connect(&self, registry: &Registry) -> AppResult<bool> {
        let send_buffer = self.send_buffer.lock();
        let mut state = self.state.lock();
        if *state != ConnectionState::PendingConnection {
            return Ok(!state.is_terminal());
        }
        let mut socket = self.socket.lock();
        let stream = socket.as_mut().ok_or(AppError::ConnectionClosed(self.id))?;

        if let Some(err) = stream.take_error()? {
            return Err(err.into());
        }
        match stream.peer_addr() {
            Ok(_) => {
                *state = ConnectionState::Connected;
                if send_buffer.is_empty() {
                    registry.reregister(stream, self.token(), Interest::READABLE)?;
                    self.write_armed.store(false, Ordering::Release);
                }
                debug!(id = self.id, peer = %self.peer_addr, "outbound connection established");
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotConnected => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Reads everything the socket has, decoding frames into the inbound queue as they
    /// complete. Dispatcher thread only.
    ///
    /// Frames that arrived before an end of stream or an I/O error are still queued.
    pub(crate) fn handle_readable(&self) -> AppResult<ReadOutcome> {
        let mut socket = self.socket.lock();
        let Some(stream) = socket.as_mut() else {
            return Ok(ReadOutcome::Gone);
        };
        let mut receive_buffer = self.receive_buffer.lock();
        loop {
            match receive_buffer.fill_from(stream) {
                Ok(0) => {
                    trace!(id = self.id, "peer closed its side");
                    return Ok(ReadOutcome::PeerClosed);
                }
                Ok(n) => {
                    trace!(id = self.id, n, "read bytes");
                    self.decode_inbound(&mut receive_buffer)?;
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(ReadOutcome::Open),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn decode_inbound(&self, receive_buffer: &mut FrameBuffer) -> AppResult<()> {
        while let Some(payload) = frame::decode(receive_buffer, self.max_frame_size)? {
            self.inbound.lock().push_back(payload);
        }
        Ok(())
    }

    /// Writes queued bytes until the buffer is empty or the socket is full. Once empty, write
    /// interest is dropped, and a flushing connection is closed. Dispatcher thread only.
    pub(crate) fn handle_writable(&self, registry: &Registry) -> AppResult<WriteOutcome> {
        let mut send_buffer = self.send_buffer.lock();
        let mut state = self.state.lock();
        let mut socket = self.socket.lock();
        let Some(stream) = socket.as_mut() else {
            return Ok(WriteOutcome::Gone);
        };
        if *state == ConnectionState::PendingConnection {
            return Ok(WriteOutcome::Pending);
        }

        while !send_buffer.is_empty() {
            match send_buffer.drain_to(stream) {
                Ok(0) => return Err(io::Error::from(ErrorKind::WriteZero).into()),
                Ok(n) => trace!(id = self.id, n, "wrote bytes"),
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(WriteOutcome::Pending),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }

        if *state == ConnectionState::Flushing {
            *state = ConnectionState::Closed;
            Self::close_socket(&mut socket, Some(registry));
            debug!(id = self.id, peer = %self.peer_addr, "flushed and closed");
            return Ok(WriteOutcome::Flushed);
        }
        registry.reregister(stream, self.token(), Interest::READABLE)?;
        // cleared under the send buffer lock, so a concurrent send re-arms
        self.write_armed.store(false, Ordering::Release);
        Ok(WriteOutcome::Drained)
    }
}

impl PartialEq for Connection {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Connection {}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer_addr", &self.peer_addr)
            .field("state", &self.state())
            .finish()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        trace!(id = self.id, "connection dropped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::command::{command_queue, CommandReceiver};
    use mio::{Poll, Waker};
    use std::io::{Read, Write};
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    struct Harness {
        poll: Poll,
        commands: CommandReceiver,
        connection: Connection,
        peer: std::net::TcpStream,
    }

    fn harness(state: ConnectionState) -> AppResult<Harness> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), Token(usize::MAX))?);
        let (tx, rx) = command_queue(waker);

        let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
        let peer = std::net::TcpStream::connect(listener.local_addr()?)?;
        let (accepted, addr) = listener.accept()?;
        accepted.set_nonblocking(true)?;
        let connection = Connection::new(
            TcpStream::from_std(accepted),
            addr,
            state,
            &NetworkConfig::default(),
            tx,
        );
        Ok(Harness {
            poll,
            commands: rx,
            connection,
            peer,
        })
    }

    fn read_until<F: FnMut() -> AppResult<bool>>(mut f: F) -> AppResult<()> {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !f()? {
            assert!(Instant::now() < deadline, "timed out");
            thread::sleep(Duration::from_millis(5));
        }
        Ok(())
    }

    #[test]
    fn test_login_only_from_connected() -> AppResult<()> {
        let h = harness(ConnectionState::PendingConnection)?;
        h.connection.mark_logged_in();
        assert_eq!(h.connection.state(), ConnectionState::PendingConnection);

        let h = harness(ConnectionState::Connected)?;
        h.connection.mark_logged_in();
        assert!(h.connection.is_logged_in());
        assert!(h.connection.is_connected());
        Ok(())
    }

    #[test]
    fn test_send_arms_write_once() -> AppResult<()> {
        let h = harness(ConnectionState::Connected)?;
        h.connection.send(b"one")?;
        h.connection.send(b"two")?;
        let commands = h.commands.drain();
        assert_eq!(commands.len(), 1);
        assert!(matches!(commands[0], Command::ArmWrite(id) if id == h.connection.id()));
        assert_eq!(h.connection.pending_send_bytes(), 14);
        Ok(())
    }

    #[test]
    fn test_send_after_loop_stopped_queues_nothing() -> AppResult<()> {
        let h = harness(ConnectionState::Connected)?;
        drop(h.commands);

        let result = h.connection.send(b"lost");
        assert!(matches!(result, Err(AppError::ChannelSendError(_))));
        assert_eq!(h.connection.pending_send_bytes(), 0);
        assert!(!h.connection.write_armed.load(Ordering::Acquire));

        // the flag was reset, so the next send reports the failure again
        assert!(h.connection.send(b"again").is_err());
        assert_eq!(h.connection.pending_send_bytes(), 0);
        Ok(())
    }

    #[test]
    fn test_close_with_empty_buffer() -> AppResult<()> {
        let mut h = harness(ConnectionState::LoggedIn)?;
        h.connection.close();
        assert!(h.connection.is_dead());
        assert!(!h.connection.is_connected());
        assert!(matches!(
            h.connection.send(b"late"),
            Err(AppError::ConnectionClosed(_))
        ));

        let mut buf = [0u8; 1];
        assert_eq!(h.peer.read(&mut buf)?, 0);
        Ok(())
    }

    #[test]
    fn test_close_pending_is_not_dead() -> AppResult<()> {
        let h = harness(ConnectionState::PendingConnection)?;
        h.connection.close();
        assert_eq!(h.connection.state(), ConnectionState::Abandoned);
        assert!(!h.connection.is_dead());
        Ok(())
    }

    #[test]
    fn test_flush_then_close() -> AppResult<()> {
        let mut h = harness(ConnectionState::Connected)?;
        h.connection.register(h.poll.registry())?;
        h.connection.send(b"bye")?;
        h.connection.close();
        assert_eq!(h.connection.state(), ConnectionState::Flushing);
        assert!(h.connection.is_connected());

        let registry = h.poll.registry();
        read_until(|| {
            Ok(h.connection.handle_writable(registry)? == WriteOutcome::Flushed)
        })?;
        assert!(h.connection.is_dead());

        let mut received = Vec::new();
        h.peer.read_to_end(&mut received)?;
        assert_eq!(received, vec![0, 0, 0, 3, b'b', b'y', b'e']);
        Ok(())
    }

    #[test]
    fn test_read_decodes_batched_frames() -> AppResult<()> {
        let mut h = harness(ConnectionState::Connected)?;
        h.peer.write_all(&[0, 0, 0, 1, b'a', 0, 0, 0, 2, b'b', b'c'])?;

        read_until(|| {
            h.connection.handle_readable()?;
            Ok(h.connection.has_packets() && h.connection.inbound.lock().len() == 2)
        })?;
        assert_eq!(&h.connection.receive().expect("first")[..], b"a");
        assert_eq!(&h.connection.receive().expect("second")[..], b"bc");
        assert!(h.connection.receive().is_none());

        drop(h.peer);
        read_until(|| Ok(h.connection.handle_readable()? == ReadOutcome::PeerClosed))?;
        Ok(())
    }

    #[test]
    fn test_oversized_frame_is_protocol_error() -> AppResult<()> {
        let mut h = harness(ConnectionState::Connected)?;
        h.peer.write_all(&u32::MAX.to_be_bytes())?;

        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            match h.connection.handle_readable() {
                Err(AppError::FrameTooLarge { .. }) => break,
                Ok(_) => {
                    assert!(Instant::now() < deadline, "timed out");
                    thread::sleep(Duration::from_millis(5));
                }
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        Ok(())
    }
}
