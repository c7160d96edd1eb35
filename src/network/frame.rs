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

//! Wire framing: `u32_be(payload length) || payload`.

use bytes::Bytes;

use crate::network::FrameBuffer;
use crate::AppError::Incomplete;
use crate::{AppError, AppResult};

/// Size of the big-endian length prefix.
pub const FRAME_HEADER_SIZE: usize = 4;

/// Appends one frame carrying `payload` to `buffer`, growing it if needed. Bytes already queued
/// stay in front of the new frame.
pub fn encode(payload: &[u8], buffer: &mut FrameBuffer, max_frame_size: usize) -> AppResult<()> {
    let limit = max_frame_size.min(u32::MAX as usize);
    if payload.len() > limit {
        return Err(AppError::FrameTooLarge {
            size: payload.len(),
            limit,
        });
    }
    buffer.reserve(FRAME_HEADER_SIZE + payload.len());
    buffer.put_u32(payload.len() as u32);
    buffer.put_slice(payload);
    Ok(())
}

/// Checks whether `buffer` holds a complete frame.
///
/// Returns `Err(Incomplete)` when more bytes are needed and `Err(FrameTooLarge)` when the
/// length prefix is beyond `max_frame_size`; the latter should close the connection. On
/// success returns the payload length. Room for the body is only allocated as its bytes
/// arrive, never up front on the word of the prefix.
pub fn check(buffer: &FrameBuffer, max_frame_size: usize) -> AppResult<usize> {
    let readable = buffer.readable();
    if readable.len() < FRAME_HEADER_SIZE {
        return Err(Incomplete);
    }
    let mut header = [0u8; FRAME_HEADER_SIZE];
    header.copy_from_slice(&readable[..FRAME_HEADER_SIZE]);
    let body_size = u32::from_be_bytes(header) as usize;
    if body_size > max_frame_size {
        return Err(AppError::FrameTooLarge {
            size: body_size,
            limit: max_frame_size,
        });
    }
    if readable.len() < FRAME_HEADER_SIZE + body_size {
        return Err(Incomplete);
    }
    Ok(body_size)
}

/// Takes one payload off the front of `buffer`, or `None` if no complete frame is buffered yet.
/// Call repeatedly: one read can deliver several frames.
pub fn decode(buffer: &mut FrameBuffer, max_frame_size: usize) -> AppResult<Option<Bytes>> {
    match check(buffer, max_frame_size) {
        Ok(body_size) => {
            buffer.consume(FRAME_HEADER_SIZE);
            Ok(Some(buffer.split_to(body_size)))
        }
        Err(Incomplete) => Ok(None),
        Err(e) => Err(e),
    }
}
