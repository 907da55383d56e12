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

//! Per-channel subscription records.
//!
//! Handler slots are only mutated by the manager while it holds the table lock; the owner
//! is a separate atomic word so routing decisions never wait on the table.

use std::sync::{
    Arc, Mutex, MutexGuard, PoisonError,
    atomic::{AtomicBool, AtomicU64, Ordering},
};

use ustr::Ustr;

use crate::{
    channel::Channel,
    connection::ConnectionId,
    handler::{HandlerSlot, SubscriptionHandler},
};

/// Raw owner value meaning "no owner".
const NO_OWNER: u64 = 0;

#[derive(Debug, Default)]
struct Handlers {
    inline: HandlerSlot,
    deferred: HandlerSlot,
}

/// State for one actively subscribed channel.
#[derive(Debug)]
pub struct Subscription {
    channel: Channel,
    handlers: Mutex<Handlers>,
    owner: AtomicU64,
    retired: AtomicBool,
}

impl Subscription {
    /// Creates a new [`Subscription`] instance with no handlers and no owner.
    #[must_use]
    pub fn new(channel: Channel) -> Self {
        Self {
            channel,
            handlers: Mutex::new(Handlers::default()),
            owner: AtomicU64::new(NO_OWNER),
            retired: AtomicBool::new(false),
        }
    }

    /// Returns the subscribed channel.
    #[must_use]
    pub const fn channel(&self) -> &Channel {
        &self.channel
    }

    pub(crate) fn add_handler(&self, handler: SubscriptionHandler, inline_eligible: bool) {
        let mut handlers = self.lock_handlers();
        if inline_eligible {
            handlers.inline.add(handler);
        } else {
            handlers.deferred.add(handler);
        }
    }

    /// Removes one registration of the handler, checking the inline slot first.
    pub(crate) fn remove_handler(&self, id: &Ustr) -> bool {
        let mut handlers = self.lock_handlers();
        handlers.inline.remove(id) || handlers.deferred.remove(id)
    }

    /// Empties both slots, returning how many handlers were dropped.
    pub(crate) fn drain_handlers(&self) -> usize {
        let mut handlers = self.lock_handlers();
        handlers.inline.clear() + handlers.deferred.clear()
    }

    pub(crate) fn handler_snapshot(
        &self,
    ) -> (
        Option<Arc<Vec<SubscriptionHandler>>>,
        Option<Arc<Vec<SubscriptionHandler>>>,
    ) {
        let handlers = self.lock_handlers();
        (handlers.inline.snapshot(), handlers.deferred.snapshot())
    }

    /// Returns true if at least one handler is registered.
    #[must_use]
    pub fn has_handlers(&self) -> bool {
        let handlers = self.lock_handlers();
        !handlers.inline.is_empty() || !handlers.deferred.is_empty()
    }

    /// Returns the number of inline-eligible handlers.
    #[must_use]
    pub fn inline_count(&self) -> usize {
        self.lock_handlers().inline.len()
    }

    /// Returns the number of deferred handlers.
    #[must_use]
    pub fn deferred_count(&self) -> usize {
        self.lock_handlers().deferred.len()
    }

    /// Returns the connection currently responsible for this channel.
    #[must_use]
    pub fn owner(&self) -> Option<ConnectionId> {
        ConnectionId::from_raw(self.owner.load(Ordering::SeqCst))
    }

    /// Returns true if `connection` currently owns this channel.
    #[must_use]
    pub fn is_owned_by(&self, connection: ConnectionId) -> bool {
        self.owner.load(Ordering::SeqCst) == connection.get()
    }

    /// Claims ownership if the record is unowned. Returns `false` if another claim won.
    pub(crate) fn try_claim_owner(&self, connection: ConnectionId) -> bool {
        self.owner
            .compare_exchange(
                NO_OWNER,
                connection.get(),
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }

    /// Releases ownership only if `connection` still holds it.
    pub(crate) fn release_owner_if(&self, connection: ConnectionId) -> bool {
        self.owner
            .compare_exchange(
                connection.get(),
                NO_OWNER,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }

    /// Takes ownership away unconditionally, returning the previous owner.
    pub(crate) fn take_owner(&self) -> Option<ConnectionId> {
        ConnectionId::from_raw(self.owner.swap(NO_OWNER, Ordering::SeqCst))
    }

    /// Marks the record as removed from the table. Returns `false` if it already was.
    pub(crate) fn retire(&self) -> bool {
        !self.retired.swap(true, Ordering::SeqCst)
    }

    /// Returns true once the record has left the subscription table.
    ///
    /// Deferred deliveries queued for a retired record are treated as already handled.
    #[must_use]
    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::SeqCst)
    }

    fn lock_handlers(&self) -> MutexGuard<'_, Handlers> {
        self.handlers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

////////////////////////////////////////////////////////////////////////////////
// Tests
////////////////////////////////////////////////////////////////////////////////
