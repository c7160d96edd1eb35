pub use app_error::{AppError, AppResult};
pub use config::{NetworkConfig, TransportConfig, DEFAULT_MAX_FRAME_SIZE};
pub use shutdown::Shutdown;
pub use tracing_config::{setup_local_tracing, setup_local_tracing_with_level, setup_tracing};

mod app_error;
mod config;
mod shutdown;
mod tracing_config;
