//! Network Module Implementation
//!
//! This module is the transport core: it establishes TCP connections, frames payloads with a
//! 4-byte big-endian length prefix, and moves bytes between sockets and the application
//! without blocking callers.
//!
//! # Architecture
//!
//! The module is built on mio's readiness selector and consists of:
//! - `Dispatcher`: owns the selector and the single event loop thread, the set of live
//!   connections and the deferred command queue
//! - `Connection`: one socket's buffers, state machine and inbound payload queue
//! - `frame`: the length-prefix codec working on `FrameBuffer`
//! - `Packet`: a decoded payload paired with the connection it came from
//!
//! # Threading
//!
//! Only the event loop thread reads, writes or registers sockets. Other threads enqueue
//! commands (register a connection, arm write interest) and wake the selector; the loop runs
//! them before its next poll.

pub use buffer::FrameBuffer;
pub use connection::{Connection, ConnectionId, ConnectionState};
pub use dispatcher::Dispatcher;
pub use packet::Packet;

mod buffer;
mod command;
mod connection;
mod dispatcher;
pub mod frame;
mod packet;
