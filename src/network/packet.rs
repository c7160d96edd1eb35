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

use std::sync::Arc;

use bytes::Bytes;

use crate::network::Connection;

/// A decoded payload together with the connection it arrived on.
#[derive(Debug, Clone)]
pub struct Packet {
    payload: Bytes,
    source: Arc<Connection>,
}

impl Packet {
    pub(crate) fn new(payload: Bytes, source: Arc<Connection>) -> Packet {
        Packet { payload, source }
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn source(&self) -> &Arc<Connection> {
        &self.source
    }

    pub fn into_parts(self) -> (Bytes, Arc<Connection>) {
        (self.payload, self.source)
    }
}
