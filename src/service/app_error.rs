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

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// general errors
    #[error("illegal state: {0}")]
    IllegalState(String),

    #[error("invalid value: {0}")]
    InvalidValue(String),

    #[error("I/O error: {0}")]
    DetailedIoError(String),

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("config file error: {0}")]
    ConfigFileError(#[from] config::ConfigError),

    #[error("tracing init error: {0}")]
    TracingInit(String),

    #[error("channel send error: {0}")]
    ChannelSendError(String),

    #[error("accept error: {0}")]
    Accept(String),

    /// transport errors
    #[error("connection {0} is closed")]
    ConnectionClosed(u64),

    #[error("frame of length {size} exceeds the limit of {limit} bytes")]
    FrameTooLarge { size: usize, limit: usize },

    /// marker error, the buffer does not hold a complete frame yet
    #[error("incomplete frame")]
    Incomplete,
}

impl AppError {
    /// Whether the error only concerns a single connection and should tear that connection
    /// down instead of the whole event loop.
    pub fn is_connection_scoped(&self) -> bool {
        matches!(
            self,
            AppError::IoError(_)
                | AppError::DetailedIoError(_)
                | AppError::ConnectionClosed(_)
                | AppError::FrameTooLarge { .. }
        )
    }
}
