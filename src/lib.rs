pub mod network;
pub mod service;

pub use network::{Connection, ConnectionId, ConnectionState, Dispatcher, FrameBuffer, Packet};
pub use service::{
    setup_local_tracing, setup_local_tracing_with_level, setup_tracing, AppError, AppResult,
    NetworkConfig, TransportConfig,
};
