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

//! In-memory connection layer for exercising the subscription manager in tests.

use std::{
    num::NonZeroU64,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering},
    },
};

use ahash::AHashMap;
use rstest::fixture;

use crate::{
    channel::Channel,
    command::{CommandFlags, CommandKind, SubscriptionCommand},
    config::SubscriptionConfig,
    connection::{
        ConnectionId, ConnectionProvider, ConnectionState, ServerSelector, SubscriptionWriter,
    },
    manager::SubscriptionManager,
    pending::PendingOperation,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A fake connection recording every operation enqueued on its subscription write path.
#[derive(Debug)]
pub struct StubConnection {
    id: ConnectionId,
    state: AtomicU8,
    accepting: AtomicBool,
    failing: AtomicBool,
    auto_confirm: AtomicBool,
    operations: Mutex<Vec<PendingOperation>>,
}

impl StubConnection {
    fn new(id: ConnectionId) -> Self {
        Self {
            id,
            state: AtomicU8::new(ConnectionState::Active.as_u8()),
            accepting: AtomicBool::new(true),
            failing: AtomicBool::new(false),
            auto_confirm: AtomicBool::new(true),
            operations: Mutex::new(Vec::new()),
        }
    }

    /// Returns the connection identity.
    #[must_use]
    pub const fn id(&self) -> ConnectionId {
        self.id
    }

    /// Sets the connection state.
    pub fn set_state(&self, state: ConnectionState) {
        self.state.store(state.as_u8(), Ordering::SeqCst);
    }

    /// Returns the connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_atomic(&self.state)
    }

    /// Controls whether `try_enqueue` accepts operations.
    pub fn set_accepting(&self, accepting: bool) {
        self.accepting.store(accepting, Ordering::SeqCst);
    }

    /// Controls whether `try_enqueue` returns an error.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Controls whether accepted operations are confirmed immediately.
    pub fn set_auto_confirm(&self, auto_confirm: bool) {
        self.auto_confirm.store(auto_confirm, Ordering::SeqCst);
    }

    /// Returns every accepted operation, in enqueue order.
    #[must_use]
    pub fn operations(&self) -> Vec<PendingOperation> {
        lock(&self.operations).clone()
    }

    /// Returns every accepted command, in enqueue order.
    #[must_use]
    pub fn commands(&self) -> Vec<SubscriptionCommand> {
        lock(&self.operations)
            .iter()
            .map(|op| op.command().clone())
            .collect()
    }

    /// Returns the verbs of every accepted command, in enqueue order.
    #[must_use]
    pub fn command_kinds(&self) -> Vec<CommandKind> {
        self.commands().iter().map(SubscriptionCommand::kind).collect()
    }
}

impl SubscriptionWriter for StubConnection {
    fn try_enqueue(&self, operation: PendingOperation) -> anyhow::Result<bool> {
        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("write path failed on {}", self.id);
        }

        if !self.accepting.load(Ordering::SeqCst) {
            return Ok(false);
        }

        if self.auto_confirm.load(Ordering::SeqCst) {
            operation.complete();
        }

        lock(&self.operations).push(operation);
        Ok(true)
    }
}

/// A fake bridge owning a set of [`StubConnection`]s and a preferred selection target.
#[derive(Debug, Default)]
pub struct StubBridge {
    connections: Mutex<AHashMap<ConnectionId, Arc<StubConnection>>>,
    preferred: Mutex<Option<ConnectionId>>,
    next_id: AtomicU64,
    selections: AtomicU64,
}

impl StubBridge {
    /// Creates a new bridge with no connections.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a connection. The first connection added becomes the preferred target.
    pub fn add_connection(&self) -> Arc<StubConnection> {
        let offset = self.next_id.fetch_add(1, Ordering::SeqCst);
        let id = ConnectionId::new(NonZeroU64::MIN.saturating_add(offset));
        let connection = Arc::new(StubConnection::new(id));
        lock(&self.connections).insert(id, Arc::clone(&connection));

        let mut preferred = lock(&self.preferred);
        if preferred.is_none() {
            *preferred = Some(id);
        }

        connection
    }

    /// Returns the connection with `id`.
    #[must_use]
    pub fn connection(&self, id: ConnectionId) -> Option<Arc<StubConnection>> {
        lock(&self.connections).get(&id).cloned()
    }

    /// Removes a connection entirely.
    pub fn remove_connection(&self, id: ConnectionId) {
        lock(&self.connections).remove(&id);
    }

    /// Sets the connection returned by server selection.
    pub fn prefer(&self, id: Option<ConnectionId>) {
        *lock(&self.preferred) = id;
    }

    /// Returns how many times server selection was asked.
    #[must_use]
    pub fn selections(&self) -> u64 {
        self.selections.load(Ordering::SeqCst)
    }

    /// Returns the number of accepted commands across all connections.
    #[must_use]
    pub fn total_commands(&self) -> usize {
        lock(&self.connections)
            .values()
            .map(|connection| lock(&connection.operations).len())
            .sum()
    }
}

impl ServerSelector for StubBridge {
    fn select_server(
        &self,
        _kind: CommandKind,
        _flags: CommandFlags,
        _routing_hint: &Channel,
    ) -> Option<ConnectionId> {
        self.selections.fetch_add(1, Ordering::SeqCst);
        let preferred = (*lock(&self.preferred))?;
        self.connection(preferred)
            .filter(|connection| connection.state().is_active())
            .map(|connection| connection.id())
    }
}

impl ConnectionProvider for StubBridge {
    fn subscription_writer(&self, connection: ConnectionId) -> Option<Arc<dyn SubscriptionWriter>> {
        self.connection(connection)
            .map(|connection| connection as Arc<dyn SubscriptionWriter>)
    }

    fn connection_state(&self, connection: ConnectionId) -> ConnectionState {
        self.connection(connection)
            .map_or(ConnectionState::Closed, |connection| connection.state())
    }
}

/// Returns a stub bridge with a single active connection.
#[fixture]
pub fn stub_bridge() -> Arc<StubBridge> {
    let bridge = Arc::new(StubBridge::new());
    bridge.add_connection();
    bridge
}

/// Creates a manager wired to `bridge` with the default configuration.
#[must_use]
pub fn stub_manager(bridge: &Arc<StubBridge>) -> SubscriptionManager {
    SubscriptionManager::new(
        SubscriptionConfig::default(),
        Arc::clone(bridge) as Arc<dyn ServerSelector>,
        Arc::clone(bridge) as Arc<dyn ConnectionProvider>,
    )
}
