// -------------------------------------------------------------------------------------------------
//  Copyright (C) 2015-2025 Nautech Systems Pty Ltd. All rights reserved.
//  https://nautechsystems.io
//
//  Licensed under the GNU Lesser General Public License Version 3.0 (the "License");
//  You may not use this file except in compliance with the License.
//  You may obtain a copy of the License at https://www.gnu.org/licenses/lgpl-3.0.en.html
//
//  Unless required by applicable law or agreed to in writing, software
//  distributed under the License is distributed on an "AS IS" BASIS,
//  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
//  See the License for the specific language governing permissions and
//  limitations under the License.
// -------------------------------------------------------------------------------------------------

//! Contracts for the connection layer consumed by the subscription manager.
//!
//! The physical connection ("bridge"), its write queue and server selection live outside
//! this crate. The manager only sees opaque [`ConnectionId`]s and the narrow traits below.

use std::{
    fmt::{self, Display},
    num::NonZeroU64,
    sync::{
        Arc,
        atomic::{AtomicU8, Ordering},
    },
};

use strum::{AsRefStr, Display as StrumDisplay, EnumString};

use crate::{
    channel::Channel,
    command::{CommandFlags, CommandKind},
    pending::PendingOperation,
};

/// Identity of a physical server connection.
///
/// Never zero, so an owner slot can encode "no owner" as `0` in an atomic word.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(NonZeroU64);

impl ConnectionId {
    /// Creates a new [`ConnectionId`] instance.
    #[must_use]
    pub const fn new(value: NonZeroU64) -> Self {
        Self(value)
    }

    /// Creates a connection ID from a raw value, returning `None` for zero.
    #[must_use]
    pub const fn from_raw(value: u64) -> Option<Self> {
        match NonZeroU64::new(value) {
            Some(value) => Some(Self(value)),
            None => None,
        }
    }

    /// Returns the raw (non-zero) value.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0.get()
    }
}

impl Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// State of a physical connection as reported by the connection layer.
///
/// Connections typically keep this in an `AtomicU8`, see [`ConnectionState::from_atomic`].
#[derive(Clone, Copy, Debug, Default, StrumDisplay, Hash, PartialEq, Eq, AsRefStr, EnumString)]
#[repr(u8)]
#[strum(serialize_all = "UPPERCASE")]
pub enum ConnectionState {
    #[default]
    /// The connection is established and accepts subscription traffic.
    Active = 0,
    /// The connection dropped and is being re-established.
    Reconnect = 1,
    /// The connection is flushing its queues and rejects new work.
    Draining = 2,
    /// The connection is permanently closed.
    Closed = 3,
}

impl ConnectionState {
    /// Convert a u8 to [`ConnectionState`], useful when loading from an `AtomicU8`.
    ///
    /// Unknown values are treated as [`ConnectionState::Closed`].
    #[inline]
    #[must_use]
    pub const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Active,
            1 => Self::Reconnect,
            2 => Self::Draining,
            _ => Self::Closed,
        }
    }

    /// Loads the state from an atomic.
    #[inline]
    #[must_use]
    pub fn from_atomic(value: &AtomicU8) -> Self {
        Self::from_u8(value.load(Ordering::SeqCst))
    }

    /// Convert a [`ConnectionState`] to a u8, useful when storing to an `AtomicU8`.
    #[inline]
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Returns true if the connection is in an active state.
    #[inline]
    #[must_use]
    pub const fn is_active(&self) -> bool {
        matches!(self, Self::Active)
    }

    /// Returns true if the connection is closed or closing.
    #[inline]
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Draining | Self::Closed)
    }
}

/// Picks the connection that should carry a subscription command.
pub trait ServerSelector: Send + Sync {
    /// Returns the connection to use for `kind`, or `None` if no connection is eligible.
    ///
    /// `routing_hint` is the channel being (un)subscribed; sharded channels route by it.
    fn select_server(
        &self,
        kind: CommandKind,
        flags: CommandFlags,
        routing_hint: &Channel,
    ) -> Option<ConnectionId>;
}

/// The background subscription write path of a single connection.
pub trait SubscriptionWriter: Send + Sync {
    /// Hands an operation to the connection.
    ///
    /// Returns `Ok(false)` when the connection refuses new work (e.g. draining), in which
    /// case the caller aborts the operation. An `Err` is propagated to the caller after
    /// ownership rollback.
    ///
    /// Called with the channel's send lock held, so it must not call back into the manager
    /// on the same thread.
    ///
    /// # Errors
    ///
    /// Returns an error if the write path fails while accepting the operation.
    fn try_enqueue(&self, operation: PendingOperation) -> anyhow::Result<bool>;
}

/// Gives access to connections by identity.
pub trait ConnectionProvider: Send + Sync {
    /// Returns the subscription write path of `connection`, if it still exists.
    fn subscription_writer(&self, connection: ConnectionId) -> Option<Arc<dyn SubscriptionWriter>>;

    /// Returns the current state of `connection`.
    fn connection_state(&self, connection: ConnectionId) -> ConnectionState;

    /// Returns true if `connection` is still a valid target for `kind` traffic.
    fn is_viable_target(&self, connection: ConnectionId, kind: CommandKind) -> bool {
        let _ = kind;
        self.connection_state(connection).is_active()
    }
}

////////////////////////////////////////////////////////////////////////////////
// Tests
////////////////////////////////////////////////////////////////////////////////
