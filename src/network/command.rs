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

use std::fmt;
use std::sync::Arc;

use mio::Waker;
use tracing::warn;

use crate::network::{Connection, ConnectionId};
use crate::{AppError, AppResult};

/// Work that must run on the event loop thread because it touches selector registrations.
pub enum Command {
    /// Register the connection's socket with the selector.
    Register(Arc<Connection>),
    /// Add write interest so queued bytes get flushed.
    ArmWrite(ConnectionId),
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Register(c) => write!(f, "Register({})", c.id()),
            Command::ArmWrite(id) => write!(f, "ArmWrite({})", id),
        }
    }
}

/// Producer side of the command queue. Cheap to clone; any thread may submit.
#[derive(Clone)]
pub struct CommandSender {
    tx: async_channel::Sender<Command>,
    waker: Arc<Waker>,
}

impl fmt::Debug for CommandSender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandSender")
            .field("queued", &self.tx.len())
            .finish()
    }
}

impl CommandSender {
    /// Queues `command` and wakes the event loop. Never blocks.
    pub fn submit(&self, command: Command) -> AppResult<()> {
        self.tx
            .try_send(command)
            .map_err(|e| AppError::ChannelSendError(format!("{:?}", e.into_inner())))?;
        if let Err(e) = self.waker.wake() {
            warn!("failed to wake event loop: {}", e);
        }
        Ok(())
    }
}

/// Loop side of the command queue.
#[derive(Debug)]
pub struct CommandReceiver {
    rx: async_channel::Receiver<Command>,
}

impl CommandReceiver {
    /// Takes every command queued so far, in submission order.
    pub fn drain(&self) -> Vec<Command> {
        let mut commands = Vec::with_capacity(self.rx.len());
        while let Ok(command) = self.rx.try_recv() {
            commands.push(command);
        }
        commands
    }
}

pub fn command_queue(waker: Arc<Waker>) -> (CommandSender, CommandReceiver) {
    let (tx, rx) = async_channel::unbounded();
    (CommandSender { tx, waker }, CommandReceiver { rx })
}
