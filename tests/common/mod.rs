#![allow(dead_code)]

use std::io::Read;
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tablewire::{
    setup_local_tracing, AppResult, Connection, ConnectionState, Dispatcher, Packet,
    TransportConfig,
};

pub const TIMEOUT: Duration = Duration::from_secs(10);

pub fn init_tracing() {
    // another test in this binary may have installed the subscriber already
    let _ = setup_local_tracing();
}

pub fn test_config() -> TransportConfig {
    let mut config = TransportConfig::default();
    config.network.ip = "127.0.0.1".to_string();
    config.network.poll_timeout_ms = 10;
    config
}

pub fn start_server(config: &TransportConfig) -> AppResult<(Dispatcher, SocketAddr)> {
    let dispatcher = Dispatcher::start(config)?;
    let addr = dispatcher.listen(0)?;
    Ok((dispatcher, addr))
}

pub fn wait_until<F: FnMut() -> bool>(what: &str, mut condition: F) {
    let deadline = Instant::now() + TIMEOUT;
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        thread::sleep(Duration::from_millis(5));
    }
}

/// Blocking raw peer speaking the wire format by hand.
pub fn raw_client(addr: SocketAddr) -> AppResult<TcpStream> {
    let stream = TcpStream::connect(addr)?;
    stream.set_read_timeout(Some(TIMEOUT))?;
    Ok(stream)
}

pub fn frame(payload: &[u8]) -> Vec<u8> {
    let mut wire = (payload.len() as u32).to_be_bytes().to_vec();
    wire.extend_from_slice(payload);
    wire
}

pub fn read_frame(stream: &mut TcpStream) -> AppResult<Vec<u8>> {
    let mut header = [0u8; 4];
    stream.read_exact(&mut header)?;
    let mut payload = vec![0u8; u32::from_be_bytes(header) as usize];
    stream.read_exact(&mut payload)?;
    Ok(payload)
}

/// The server side of the raw peer `client`, once the dispatcher has registered it.
pub fn accepted(dispatcher: &Dispatcher, client: &TcpStream) -> AppResult<Arc<Connection>> {
    let local = client.local_addr()?;
    let mut found = None;
    wait_until("accepted connection", || {
        found = dispatcher
            .connections()
            .into_iter()
            .find(|c| c.peer_addr() == local && c.state() == ConnectionState::Connected);
        found.is_some()
    });
    Ok(found.expect("connection found"))
}

/// Accumulates drained packets until `count` have arrived.
pub fn collect_packets(dispatcher: &Dispatcher, count: usize) -> Vec<Packet> {
    let mut packets = Vec::new();
    wait_until("packets", || {
        packets.extend(dispatcher.drain_all_packets());
        packets.len() >= count
    });
    packets
}

/// Accumulates lost connections until `count` have been reported.
pub fn collect_lost(dispatcher: &Dispatcher, count: usize) -> Vec<Arc<Connection>> {
    let mut lost = Vec::new();
    wait_until("lost connections", || {
        lost.extend(dispatcher.poll_lost_connections());
        lost.len() >= count
    });
    lost
}
