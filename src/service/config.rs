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

extern crate config as _;

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{AppError, AppResult};

/// Default upper bound for a single frame payload (16 MiB).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address the listener binds to.
    pub ip: String,
    /// Port used by the `serve` command when none is given on the command line.
    pub port: u16,
    /// Accepted sockets beyond this many live connections are dropped.
    pub max_connection: usize,
    /// Largest payload accepted in either direction.
    pub max_frame_size: usize,
    /// Initial capacity of each connection's receive and send buffer.
    pub buffer_size: usize,
    /// Number of readiness events fetched per poll.
    pub poll_capacity: usize,
    /// Upper bound on a single selector wait.
    pub poll_timeout_ms: u64,
    pub tcp_nodelay: bool,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig {
            ip: "0.0.0.0".to_string(),
            port: 6812,
            max_connection: 256,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            buffer_size: 4 * 1024,
            poll_capacity: 256,
            poll_timeout_ms: 50,
            tcp_nodelay: true,
        }
    }
}

impl NetworkConfig {
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TransportConfig {
    pub network: NetworkConfig,
}

impl TransportConfig {
    /// Loads the configuration from a TOML file, then applies `TABLEWIRE__SECTION__KEY`
    /// environment overrides.
    pub fn set_up_config<P: AsRef<Path>>(path: P) -> AppResult<TransportConfig> {
        let path_str = path.as_ref().to_str().ok_or(AppError::InvalidValue(format!(
            "config file path: {}",
            path.as_ref().to_string_lossy()
        )))?;
        let config = config::Config::builder()
            .add_source(config::File::with_name(path_str))
            .add_source(
                config::Environment::with_prefix("TABLEWIRE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let transport_config: TransportConfig = config.try_deserialize()?;
        transport_config.validate()?;

        Ok(transport_config)
    }

    pub fn validate(&self) -> AppResult<()> {
        let network = &self.network;
        if network.max_frame_size == 0 || network.max_frame_size > u32::MAX as usize {
            return Err(AppError::InvalidValue(format!(
                "network.max_frame_size must be within 1..={}, got {}",
                u32::MAX,
                network.max_frame_size
            )));
        }
        if network.buffer_size == 0 {
            return Err(AppError::InvalidValue(
                "network.buffer_size must be greater than 0".to_string(),
            ));
        }
        if network.poll_capacity == 0 {
            return Err(AppError::InvalidValue(
                "network.poll_capacity must be greater than 0".to_string(),
            ));
        }
        if network.max_connection == 0 {
            return Err(AppError::InvalidValue(
                "network.max_connection must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}
