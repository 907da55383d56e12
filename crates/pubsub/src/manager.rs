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

//! The subscription table and the subscribe/unsubscribe protocol.
//!
//! The table maps each [`Channel`] to its [`Subscription`] record and holds an entry
//! exactly while at least one handler is registered. Structural changes happen under a
//! single mutex; everything that talks to a connection happens after it is released.
//!
//! Ownership of a channel (which connection the server-side subscription lives on) is
//! decided per record by an atomic claim, so two concurrent subscribe attempts for the
//! same channel can never both send a command.
//!
//! Every owner change is made under the channel's send lock and held through the enqueue
//! of the command that follows it, so commands for a channel reach the wire in the order
//! ownership changed. Removals reserve the send lock before releasing the table, which
//! orders their unsubscribe ahead of any subscribe from a later record for the same
//! channel. Inbound routing never takes a send lock.

use std::{
    collections::BTreeSet,
    fmt::Debug,
    hash::BuildHasher,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use ahash::{AHashMap, RandomState};
use bytes::Bytes;
use ustr::Ustr;

use crate::{
    channel::Channel,
    command::{CommandFlags, CommandKind, SubscriptionCommand},
    config::SubscriptionConfig,
    connection::{ConnectionId, ConnectionProvider, ServerSelector},
    dispatch::{Delivery, WorkerDispatch},
    error::PubSubError,
    handler::SubscriptionHandler,
    pending::{PendingOperation, SubscriptionFuture},
    subscription::Subscription,
};

/// Number of send lock stripes. Channels hashing to the same stripe share a lock.
const SEND_LOCK_STRIPES: usize = 64;

/// Tracks subscribed channels, their handlers, and the connection owning each channel.
pub struct SubscriptionManager {
    subscriptions: Mutex<AHashMap<Channel, Arc<Subscription>>>,
    send_locks: Box<[Mutex<()>]>,
    send_hasher: RandomState,
    selector: Arc<dyn ServerSelector>,
    connections: Arc<dyn ConnectionProvider>,
    dispatch: WorkerDispatch,
    config: SubscriptionConfig,
}

impl Debug for SubscriptionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct(stringify!(SubscriptionManager))
            .field("subscriptions", &self.subscription_count())
            .field("dispatch", &self.dispatch)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl SubscriptionManager {
    /// Creates a new [`SubscriptionManager`] instance.
    ///
    /// Deferred handlers are dispatched on the current Tokio runtime, or on the shared
    /// fallback runtime when called outside of one.
    #[must_use]
    pub fn new(
        config: SubscriptionConfig,
        selector: Arc<dyn ServerSelector>,
        connections: Arc<dyn ConnectionProvider>,
    ) -> Self {
        Self {
            subscriptions: Mutex::new(AHashMap::new()),
            send_locks: (0..SEND_LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
            send_hasher: RandomState::new(),
            selector,
            connections,
            dispatch: WorkerDispatch::current(),
            config,
        }
    }

    /// Replaces the worker dispatch used for deferred handlers.
    #[must_use]
    pub fn with_dispatch(mut self, dispatch: WorkerDispatch) -> Self {
        self.dispatch = dispatch;
        self
    }

    /// Returns the manager configuration.
    #[must_use]
    pub const fn config(&self) -> &SubscriptionConfig {
        &self.config
    }

    pub(crate) fn connections(&self) -> &dyn ConnectionProvider {
        self.connections.as_ref()
    }

    /// Registers `handler` for `channel`.
    ///
    /// The first handler for a channel creates the record and subscribes it on a selected
    /// connection; the returned future resolves once the server confirms. Later handlers
    /// join the existing record and get an already-resolved future. Adding the same handler
    /// again registers it a second time; each registration needs its own removal.
    ///
    /// # Errors
    ///
    /// Returns an error if the subscribe command cannot be built or the write path fails.
    /// The handler stays registered either way, and a later validation retries.
    pub fn add_subscription(
        &self,
        channel: Channel,
        handler: SubscriptionHandler,
        inline_eligible: bool,
    ) -> Result<SubscriptionFuture, PubSubError> {
        let subscription = {
            let mut subscriptions = self.lock_table();
            if let Some(existing) = subscriptions.get(&channel) {
                existing.add_handler(handler, inline_eligible);
                tracing::trace!(%channel, "Added handler to existing subscription");
                return Ok(SubscriptionFuture::noop());
            }

            let subscription = Arc::new(Subscription::new(channel.clone()));
            subscription.add_handler(handler, inline_eligible);
            subscriptions.insert(channel, Arc::clone(&subscription));
            subscription
        };

        tracing::debug!(channel = %subscription.channel(), "Added subscription");

        let future = self.subscribe_to_server(&subscription, CommandFlags::NONE)?;
        Ok(future.unwrap_or_else(SubscriptionFuture::noop))
    }

    /// Removes one registration of a handler from `channel`, or every handler when `handler`
    /// is `None`.
    ///
    /// When the channel is left without handlers its record is removed and the server
    /// subscription is dropped. Unknown channels and handlers are a no-op.
    ///
    /// # Errors
    ///
    /// Returns an error if the unsubscribe command cannot be built or the write path fails.
    pub fn remove_subscription(
        &self,
        channel: &Channel,
        handler: Option<&Ustr>,
    ) -> Result<SubscriptionFuture, PubSubError> {
        let (removed, _send) = {
            let mut subscriptions = self.lock_table();
            let Some(subscription) = subscriptions.get(channel).cloned() else {
                return Ok(SubscriptionFuture::noop());
            };

            match handler {
                Some(id) => {
                    if !subscription.remove_handler(id) {
                        return Ok(SubscriptionFuture::noop());
                    }

                    if subscription.has_handlers() {
                        tracing::trace!(%channel, handler = %id, "Removed handler");
                        return Ok(SubscriptionFuture::noop());
                    }
                }
                None => {
                    subscription.drain_handlers();
                }
            }

            subscriptions.remove(channel);
            subscription.retire();
            (subscription, self.lock_send(channel))
        };

        tracing::debug!(%channel, "Removed subscription");

        let future = self.send_unsubscribe(&removed, CommandFlags::NONE)?;
        Ok(future.unwrap_or_else(SubscriptionFuture::noop))
    }

    /// Removes every subscription and unsubscribes each owned channel.
    ///
    /// Returns the future of the last unsubscribe issued, or a resolved future if none was.
    pub fn remove_all(&self) -> SubscriptionFuture {
        let (drained, _send) = {
            let mut subscriptions = self.lock_table();
            let drained: Vec<Arc<Subscription>> = subscriptions
                .drain()
                .map(|(_, subscription)| {
                    subscription.drain_handlers();
                    subscription.retire();
                    subscription
                })
                .collect();

            // Stripes are taken in index order, each at most once
            let stripes: BTreeSet<usize> = drained
                .iter()
                .map(|subscription| self.send_stripe(subscription.channel()))
                .collect();
            let guards: Vec<MutexGuard<'_, ()>> = stripes
                .into_iter()
                .map(|stripe| lock_stripe(&self.send_locks[stripe]))
                .collect();

            (drained, guards)
        };

        if drained.is_empty() {
            return SubscriptionFuture::noop();
        }

        tracing::debug!("Removing all {} subscriptions", drained.len());

        let mut last = None;
        for subscription in &drained {
            match self.send_unsubscribe(subscription, CommandFlags::NONE) {
                Ok(Some(future)) => last = Some(future),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(
                        channel = %subscription.channel(),
                        "Failed to unsubscribe during removal: {e}",
                    );
                }
            }
        }

        last.unwrap_or_else(SubscriptionFuture::noop)
    }

    /// Returns the connection currently owning `channel`, if subscribed and owned.
    #[must_use]
    pub fn lookup(&self, channel: &Channel) -> Option<ConnectionId> {
        self.subscription(channel)
            .and_then(|subscription| subscription.owner())
    }

    /// Returns true if any handler is registered for `channel`.
    #[must_use]
    pub fn is_subscribed(&self, channel: &Channel) -> bool {
        self.lock_table().contains_key(channel)
    }

    /// Returns the record for `channel`.
    #[must_use]
    pub fn subscription(&self, channel: &Channel) -> Option<Arc<Subscription>> {
        self.lock_table().get(channel).cloned()
    }

    /// Returns the number of subscribed channels.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.lock_table().len()
    }

    /// Returns true if no channel is subscribed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock_table().is_empty()
    }

    /// Returns every subscribed channel, in no particular order.
    #[must_use]
    pub fn channels(&self) -> Vec<Channel> {
        self.lock_table().keys().cloned().collect()
    }

    /// Returns the inline-eligible and deferred handler counts for `channel`.
    #[must_use]
    pub fn handler_counts(&self, channel: &Channel) -> Option<(usize, usize)> {
        self.subscription(channel)
            .map(|subscription| (subscription.inline_count(), subscription.deferred_count()))
    }

    /// Builds the delivery for a message received on `subscription`.
    ///
    /// `channel` is the channel the message was published on. Returns `None` when nothing
    /// is subscribed, which is normal for messages arriving just after an unsubscribe.
    #[must_use]
    pub fn on_inbound_message(
        &self,
        subscription: &Channel,
        channel: Channel,
        payload: Bytes,
    ) -> Option<Delivery> {
        let record = self.subscription(subscription)?;
        Some(Delivery::new(record, channel, payload))
    }

    /// Delivers an inbound message from the network reader.
    ///
    /// Inline-eligible handlers run on the calling thread, everything else is offloaded to
    /// the worker pool. Returns `false` if no subscription matched.
    pub fn deliver(&self, subscription: &Channel, channel: Channel, payload: Bytes) -> bool {
        let Some(delivery) = self.on_inbound_message(subscription, channel, payload) else {
            tracing::trace!(channel = %subscription, "Dropped message for unknown subscription");
            return false;
        };

        self.dispatch
            .deliver(delivery, self.config.deliver_deferred_inline);
        true
    }

    /// Subscribes `subscription` on a selected connection.
    ///
    /// Returns `Ok(None)` when no connection is available, another claim already owns the
    /// record, or the record has been removed from the table.
    pub(crate) fn subscribe_to_server(
        &self,
        subscription: &Arc<Subscription>,
        flags: CommandFlags,
    ) -> Result<Option<SubscriptionFuture>, PubSubError> {
        let channel = subscription.channel();
        let kind = CommandKind::subscribe_for(channel.kind());

        let Some(connection) = self.selector.select_server(kind, flags, channel) else {
            tracing::debug!(%channel, "No connection available for subscribe");
            return Ok(None);
        };

        let command = SubscriptionCommand::new(kind, channel.clone(), flags)?;
        let (operation, future) = PendingOperation::new(command, Arc::clone(subscription));

        let _send = self.lock_send(channel);

        // The removal holds this lock from retiring through its unsubscribe
        if subscription.is_retired() {
            tracing::trace!(%channel, %connection, "Subscription already removed");
            operation.abort();
            return Ok(None);
        }

        if !subscription.try_claim_owner(connection) {
            tracing::trace!(%channel, %connection, "Subscription already claimed");
            operation.abort();
            return Ok(None);
        }

        match self.enqueue(connection, operation) {
            Ok(true) => {
                tracing::debug!(%channel, %connection, "Subscribing");
                Ok(Some(future))
            }
            Ok(false) => {
                subscription.release_owner_if(connection);
                Ok(Some(future))
            }
            Err(e) => {
                subscription.release_owner_if(connection);
                Err(e)
            }
        }
    }

    /// Drops the server-side subscription from whichever connection owns it.
    ///
    /// Returns `Ok(None)` if the record had no owner.
    pub(crate) fn unsubscribe_from_server(
        &self,
        subscription: &Arc<Subscription>,
        flags: CommandFlags,
    ) -> Result<Option<SubscriptionFuture>, PubSubError> {
        let _send = self.lock_send(subscription.channel());
        self.send_unsubscribe(subscription, flags)
    }

    /// Takes the owner of `subscription` and enqueues the unsubscribe on it.
    ///
    /// The caller holds the send lock for the record's channel.
    fn send_unsubscribe(
        &self,
        subscription: &Arc<Subscription>,
        flags: CommandFlags,
    ) -> Result<Option<SubscriptionFuture>, PubSubError> {
        let channel = subscription.channel();
        let command = SubscriptionCommand::unsubscribe(channel.clone(), flags)?;

        let Some(connection) = subscription.take_owner() else {
            return Ok(None);
        };

        let (operation, future) = PendingOperation::new(command, Arc::clone(subscription));
        if self.enqueue(connection, operation)? {
            tracing::debug!(%channel, %connection, "Unsubscribing");
        }

        Ok(Some(future))
    }

    /// Hands `operation` to the write path of `connection`.
    ///
    /// Returns `Ok(false)` after aborting the operation if the connection has no write path
    /// or refused it.
    pub(crate) fn enqueue(
        &self,
        connection: ConnectionId,
        operation: PendingOperation,
    ) -> Result<bool, PubSubError> {
        let Some(writer) = self.connections.subscription_writer(connection) else {
            tracing::debug!(%connection, "No subscription write path");
            operation.abort();
            return Ok(false);
        };

        match writer.try_enqueue(operation.clone()) {
            Ok(true) => Ok(true),
            Ok(false) => {
                tracing::warn!(
                    %connection,
                    command = %operation.command().kind(),
                    channel = %operation.command().channel(),
                    "Enqueue rejected",
                );
                operation.abort();
                Ok(false)
            }
            Err(source) => {
                operation.abort();
                Err(PubSubError::Enqueue { connection, source })
            }
        }
    }

    /// Returns a snapshot of every record in the table.
    pub(crate) fn snapshot(&self) -> Vec<Arc<Subscription>> {
        self.lock_table().values().cloned().collect()
    }

    /// Locks the send stripe of `channel`.
    pub(crate) fn lock_send(&self, channel: &Channel) -> MutexGuard<'_, ()> {
        lock_stripe(&self.send_locks[self.send_stripe(channel)])
    }

    fn send_stripe(&self, channel: &Channel) -> usize {
        (self.send_hasher.hash_one(channel) % SEND_LOCK_STRIPES as u64) as usize
    }

    fn lock_table(&self) -> MutexGuard<'_, AHashMap<Channel, Arc<Subscription>>> {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

fn lock_stripe(stripe: &Mutex<()>) -> MutexGuard<'_, ()> {
    stripe.lock().unwrap_or_else(PoisonError::into_inner)
}

////////////////////////////////////////////////////////////////////////////////
// Tests
////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            Barrier, OnceLock, Weak,
            atomic::{AtomicUsize, Ordering},
        },
        thread::{self, ThreadId},
        time::Duration,
    };

    use rstest::rstest;
    use tokio::sync::mpsc;

    use super::*;
    use crate::{
        connection::{ConnectionState, SubscriptionWriter},
        pending::Completion,
        stubs::{StubBridge, stub_bridge, stub_manager},
    };

    fn noop_handler(id: &str) -> SubscriptionHandler {
        SubscriptionHandler::new(Some(id), |_: &Channel, _: &Bytes| {})
    }

    fn counting_handler(id: &str, count: &Arc<AtomicUsize>) -> SubscriptionHandler {
        let count = Arc::clone(count);
        SubscriptionHandler::new(Some(id), move |_: &Channel, _: &Bytes| {
            count.fetch_add(1, Ordering::SeqCst);
        })
    }

    fn first_connection(bridge: &StubBridge) -> ConnectionId {
        let id = ConnectionId::from_raw(1).unwrap();
        assert!(bridge.connection(id).is_some());
        id
    }

    /// A connection that removes the channel from another thread while its first
    /// subscribe is being enqueued, then waits for the removal to retire the record.
    #[derive(Debug)]
    struct RemovingConnection {
        remove_all: bool,
        manager: OnceLock<Weak<SubscriptionManager>>,
        remover: Mutex<Option<thread::JoinHandle<()>>>,
        sent: Mutex<Vec<CommandKind>>,
    }

    impl RemovingConnection {
        fn new(remove_all: bool) -> Self {
            Self {
                remove_all,
                manager: OnceLock::new(),
                remover: Mutex::new(None),
                sent: Mutex::new(Vec::new()),
            }
        }

        fn sent(&self) -> Vec<CommandKind> {
            self.sent.lock().unwrap().clone()
        }

        fn join_remover(&self) {
            let remover = self.remover.lock().unwrap().take();
            remover.unwrap().join().unwrap();
        }

        fn spawn_remover(&self, channel: Channel) {
            let manager = self.manager.get().and_then(Weak::upgrade).unwrap();
            let remove_all = self.remove_all;
            let handle = thread::spawn(move || {
                if remove_all {
                    let _ = manager.remove_all();
                } else {
                    let _ = manager.remove_subscription(&channel, None).unwrap();
                }
            });
            *self.remover.lock().unwrap() = Some(handle);
        }
    }

    impl SubscriptionWriter for RemovingConnection {
        fn try_enqueue(&self, operation: PendingOperation) -> anyhow::Result<bool> {
            let command = operation.command();
            let first = self.remover.lock().unwrap().is_none();
            if first && command.kind().is_subscribe() {
                self.spawn_remover(command.channel().clone());
                while !operation.subscription().is_retired() {
                    thread::yield_now();
                }
                // Give the removal time to reach this write path if it is not held back
                thread::sleep(Duration::from_millis(50));
            }

            self.sent.lock().unwrap().push(command.kind());
            operation.complete();
            Ok(true)
        }
    }

    #[derive(Debug)]
    struct RemovingBridge(Arc<RemovingConnection>);

    impl ServerSelector for RemovingBridge {
        fn select_server(
            &self,
            _: CommandKind,
            _: CommandFlags,
            _: &Channel,
        ) -> Option<ConnectionId> {
            ConnectionId::from_raw(1)
        }
    }

    impl ConnectionProvider for RemovingBridge {
        fn subscription_writer(&self, _: ConnectionId) -> Option<Arc<dyn SubscriptionWriter>> {
            Some(Arc::clone(&self.0) as Arc<dyn SubscriptionWriter>)
        }

        fn connection_state(&self, _: ConnectionId) -> ConnectionState {
            ConnectionState::Active
        }
    }

    #[rstest]
    fn test_first_add_subscribes(stub_bridge: Arc<StubBridge>) {
        let manager = stub_manager(&stub_bridge);
        let channel = Channel::literal("news");
        let conn = first_connection(&stub_bridge);

        let future = manager
            .add_subscription(channel.clone(), noop_handler("h1"), false)
            .unwrap();

        assert!(matches!(future.wait_blocking(), Completion::Confirmed));
        assert_eq!(manager.lookup(&channel), Some(conn));
        assert!(manager.is_subscribed(&channel));

        let commands = stub_bridge.connection(conn).unwrap().commands();
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].kind(), CommandKind::Subscribe);
        assert_eq!(commands[0].channel(), &channel);
        assert!(!commands[0].is_internal());
    }

    #[rstest]
    fn test_second_add_is_resolved_without_network(stub_bridge: Arc<StubBridge>) {
        let manager = stub_manager(&stub_bridge);
        let channel = Channel::literal("news");

        let _ = manager
            .add_subscription(channel.clone(), noop_handler("h1"), false)
            .unwrap();
        let mut second = manager
            .add_subscription(channel.clone(), noop_handler("h2"), false)
            .unwrap();

        assert!(second.is_resolved());
        assert!(matches!(second.wait_blocking(), Completion::NoOp));
        assert_eq!(stub_bridge.total_commands(), 1);
        assert_eq!(manager.handler_counts(&channel), Some((0, 2)));
    }

    #[rstest]
    fn test_pattern_and_sharded_verbs(stub_bridge: Arc<StubBridge>) {
        let manager = stub_manager(&stub_bridge);
        let conn = first_connection(&stub_bridge);

        let _ = manager
            .add_subscription(Channel::pattern("news.*"), noop_handler("p"), false)
            .unwrap();
        let _ = manager
            .add_subscription(Channel::sharded("orders"), noop_handler("s"), false)
            .unwrap();

        assert_eq!(
            stub_bridge.connection(conn).unwrap().command_kinds(),
            vec![CommandKind::PSubscribe, CommandKind::SSubscribe],
        );
    }

    #[rstest]
    fn test_remove_one_of_two_handlers_keeps_subscription(stub_bridge: Arc<StubBridge>) {
        let manager = stub_manager(&stub_bridge);
        let channel = Channel::literal("news");

        let _ = manager.add_subscription(channel.clone(), noop_handler("h1"), false);
        let _ = manager.add_subscription(channel.clone(), noop_handler("h2"), true);

        let future = manager
            .remove_subscription(&channel, Some(&Ustr::from("h1")))
            .unwrap();

        assert!(matches!(future.wait_blocking(), Completion::NoOp));
        assert!(manager.is_subscribed(&channel));
        assert_eq!(manager.handler_counts(&channel), Some((1, 0)));
        assert_eq!(stub_bridge.total_commands(), 1);
    }

    #[rstest]
    fn test_duplicate_handler_needs_matching_removals(stub_bridge: Arc<StubBridge>) {
        let manager = stub_manager(&stub_bridge);
        let conn = first_connection(&stub_bridge);
        let channel = Channel::literal("news");
        let count = Arc::new(AtomicUsize::new(0));
        let handler = counting_handler("h1", &count);

        let _ = manager.add_subscription(channel.clone(), handler.clone(), true);
        let _ = manager.add_subscription(channel.clone(), handler, true);
        assert_eq!(manager.handler_counts(&channel), Some((2, 0)));

        assert!(manager.deliver(&channel, channel.clone(), Bytes::from("x")));
        assert_eq!(count.load(Ordering::SeqCst), 2);

        let id = Ustr::from("h1");
        let _ = manager.remove_subscription(&channel, Some(&id)).unwrap();
        assert!(manager.is_subscribed(&channel));
        assert_eq!(manager.handler_counts(&channel), Some((1, 0)));

        let _ = manager.remove_subscription(&channel, Some(&id)).unwrap();
        assert!(!manager.is_subscribed(&channel));
        assert_eq!(
            stub_bridge.connection(conn).unwrap().command_kinds(),
            vec![CommandKind::Subscribe, CommandKind::Unsubscribe]
        );
    }

    #[rstest]
    fn test_remove_last_handler_unsubscribes(stub_bridge: Arc<StubBridge>) {
        let manager = stub_manager(&stub_bridge);
        let channel = Channel::literal("news");
        let conn = first_connection(&stub_bridge);

        let _ = manager.add_subscription(channel.clone(), noop_handler("h1"), false);
        let future = manager
            .remove_subscription(&channel, Some(&Ustr::from("h1")))
            .unwrap();

        assert!(matches!(future.wait_blocking(), Completion::Confirmed));
        assert!(!manager.is_subscribed(&channel));
        assert_eq!(manager.lookup(&channel), None);
        assert_eq!(
            stub_bridge.connection(conn).unwrap().command_kinds(),
            vec![CommandKind::Subscribe, CommandKind::Unsubscribe],
        );
    }

    #[rstest]
    fn test_double_remove_is_noop(stub_bridge: Arc<StubBridge>) {
        let manager = stub_manager(&stub_bridge);
        let channel = Channel::literal("news");
        let id = Ustr::from("h1");

        let _ = manager.add_subscription(channel.clone(), noop_handler("h1"), false);
        let _ = manager.remove_subscription(&channel, Some(&id)).unwrap();
        let second = manager.remove_subscription(&channel, Some(&id)).unwrap();

        assert!(matches!(second.wait_blocking(), Completion::NoOp));
        assert_eq!(stub_bridge.total_commands(), 2);
    }

    #[rstest]
    fn test_remove_unknown_handler_is_noop(stub_bridge: Arc<StubBridge>) {
        let manager = stub_manager(&stub_bridge);
        let channel = Channel::literal("news");

        let _ = manager.add_subscription(channel.clone(), noop_handler("h1"), false);
        let future = manager
            .remove_subscription(&channel, Some(&Ustr::from("other")))
            .unwrap();

        assert!(matches!(future.wait_blocking(), Completion::NoOp));
        assert!(manager.is_subscribed(&channel));
        assert_eq!(stub_bridge.total_commands(), 1);
    }

    #[rstest]
    fn test_blanket_remove_skips_queued_deliveries(stub_bridge: Arc<StubBridge>) {
        let manager = stub_manager(&stub_bridge);
        let channel = Channel::literal("news");
        let count = Arc::new(AtomicUsize::new(0));

        let _ = manager.add_subscription(channel.clone(), counting_handler("h1", &count), false);
        let _ = manager.add_subscription(channel.clone(), counting_handler("h2", &count), false);

        let delivery = manager
            .on_inbound_message(&channel, channel.clone(), Bytes::from("late"))
            .unwrap();

        let future = manager.remove_subscription(&channel, None).unwrap();
        assert!(matches!(future.wait_blocking(), Completion::Confirmed));

        delivery.complete();
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert!(manager.is_empty());
    }

    #[rstest]
    fn test_remove_all_clears_lookups(stub_bridge: Arc<StubBridge>) {
        let manager = stub_manager(&stub_bridge);
        let channels = vec![
            Channel::literal("a"),
            Channel::pattern("b.*"),
            Channel::sharded("c"),
        ];
        for (i, channel) in channels.iter().enumerate() {
            let _ = manager.add_subscription(channel.clone(), noop_handler(&i.to_string()), false);
        }

        let future = manager.remove_all();

        assert!(matches!(future.wait_blocking(), Completion::Confirmed));
        for channel in &channels {
            assert_eq!(manager.lookup(channel), None);
            assert!(!manager.is_subscribed(channel));
        }
        assert_eq!(stub_bridge.total_commands(), 6);
    }

    #[rstest]
    fn test_remove_all_on_empty_table(stub_bridge: Arc<StubBridge>) {
        let manager = stub_manager(&stub_bridge);
        assert!(matches!(manager.remove_all().wait_blocking(), Completion::NoOp));
    }

    #[rstest]
    fn test_no_connection_keeps_unowned_record(stub_bridge: Arc<StubBridge>) {
        stub_bridge.prefer(None);
        let manager = stub_manager(&stub_bridge);
        let channel = Channel::literal("news");

        let future = manager
            .add_subscription(channel.clone(), noop_handler("h1"), false)
            .unwrap();

        assert!(matches!(future.wait_blocking(), Completion::NoOp));
        assert!(manager.is_subscribed(&channel));
        assert_eq!(manager.lookup(&channel), None);
        assert_eq!(stub_bridge.selections(), 1);
        assert_eq!(stub_bridge.total_commands(), 0);
    }

    #[rstest]
    fn test_rejected_enqueue_cancels_and_rolls_back(stub_bridge: Arc<StubBridge>) {
        let conn = first_connection(&stub_bridge);
        stub_bridge.connection(conn).unwrap().set_accepting(false);
        let manager = stub_manager(&stub_bridge);
        let channel = Channel::literal("news");

        let future = manager
            .add_subscription(channel.clone(), noop_handler("h1"), false)
            .unwrap();

        assert!(matches!(future.wait_blocking(), Completion::Cancelled));
        assert_eq!(manager.lookup(&channel), None);
        assert!(manager.is_subscribed(&channel));
    }

    #[rstest]
    fn test_enqueue_error_propagates_and_rolls_back(stub_bridge: Arc<StubBridge>) {
        let conn = first_connection(&stub_bridge);
        stub_bridge.connection(conn).unwrap().set_failing(true);
        let manager = stub_manager(&stub_bridge);
        let channel = Channel::literal("news");

        let result = manager.add_subscription(channel.clone(), noop_handler("h1"), false);

        match result {
            Err(PubSubError::Enqueue { connection, .. }) => assert_eq!(connection, conn),
            other => panic!("expected enqueue error, was {other:?}"),
        }
        assert_eq!(manager.lookup(&channel), None);
        assert!(manager.is_subscribed(&channel));
    }

    #[rstest]
    fn test_invalid_channel_leaves_owner_untouched(stub_bridge: Arc<StubBridge>) {
        let manager = stub_manager(&stub_bridge);
        let channel = Channel::literal("");

        let result = manager.add_subscription(channel.clone(), noop_handler("h1"), false);

        assert!(matches!(result, Err(PubSubError::InvalidChannel(_))));
        assert_eq!(manager.lookup(&channel), None);
        assert_eq!(stub_bridge.total_commands(), 0);
    }

    #[rstest]
    fn test_unconfirmed_future_is_pending(stub_bridge: Arc<StubBridge>) {
        let conn = first_connection(&stub_bridge);
        let connection = stub_bridge.connection(conn).unwrap();
        connection.set_auto_confirm(false);
        let manager = stub_manager(&stub_bridge);

        let mut future = manager
            .add_subscription(Channel::literal("news"), noop_handler("h1"), false)
            .unwrap();
        assert!(!future.is_resolved());

        let operations = connection.operations();
        assert!(operations[0].complete());
        assert!(matches!(future.wait_blocking(), Completion::Confirmed));
    }

    #[rstest]
    fn test_inbound_for_unknown_channel(stub_bridge: Arc<StubBridge>) {
        let manager = stub_manager(&stub_bridge);
        let channel = Channel::literal("nobody");

        assert!(
            manager
                .on_inbound_message(&channel, channel.clone(), Bytes::new())
                .is_none()
        );
        assert!(!manager.deliver(&channel, channel.clone(), Bytes::new()));
    }

    #[rstest]
    fn test_concurrent_subscribe_claims_once(stub_bridge: Arc<StubBridge>) {
        let manager = Arc::new(stub_manager(&stub_bridge));
        let subscription = Arc::new(Subscription::new(Channel::literal("news")));
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let manager = Arc::clone(&manager);
                let subscription = Arc::clone(&subscription);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    manager
                        .subscribe_to_server(&subscription, CommandFlags::INTERNAL)
                        .unwrap()
                        .is_some()
                })
            })
            .collect();

        let sent = handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .filter(|sent| *sent)
            .count();

        assert_eq!(sent, 1);
        assert_eq!(stub_bridge.total_commands(), 1);
        assert!(subscription.owner().is_some());
    }

    #[rstest]
    fn test_subscribe_on_retired_record_sends_nothing(stub_bridge: Arc<StubBridge>) {
        let manager = stub_manager(&stub_bridge);
        let subscription = Arc::new(Subscription::new(Channel::literal("news")));
        subscription.retire();

        let future = manager
            .subscribe_to_server(&subscription, CommandFlags::NONE)
            .unwrap();

        assert!(future.is_none());
        assert_eq!(subscription.owner(), None);
        assert_eq!(stub_bridge.total_commands(), 0);
    }

    #[rstest]
    #[case::single_channel(false)]
    #[case::everything(true)]
    fn test_removal_during_subscribe_enqueue_is_sent_after_it(#[case] remove_all: bool) {
        let connection = Arc::new(RemovingConnection::new(remove_all));
        let bridge = Arc::new(RemovingBridge(Arc::clone(&connection)));
        let manager = Arc::new(SubscriptionManager::new(
            SubscriptionConfig::default(),
            Arc::clone(&bridge) as Arc<dyn ServerSelector>,
            bridge as Arc<dyn ConnectionProvider>,
        ));
        connection.manager.set(Arc::downgrade(&manager)).unwrap();
        let channel = Channel::literal("news");

        let future = manager
            .add_subscription(channel.clone(), noop_handler("h1"), false)
            .unwrap();
        connection.join_remover();

        assert!(matches!(future.wait_blocking(), Completion::Confirmed));
        assert_eq!(
            connection.sent(),
            vec![CommandKind::Subscribe, CommandKind::Unsubscribe]
        );
        assert!(!manager.is_subscribed(&channel));
        assert_eq!(manager.lookup(&channel), None);
    }

    #[rstest]
    fn test_readd_after_removal_keeps_wire_order(stub_bridge: Arc<StubBridge>) {
        let manager = stub_manager(&stub_bridge);
        let conn = first_connection(&stub_bridge);
        let channel = Channel::literal("news");

        for _ in 0..3 {
            let _ = manager.add_subscription(channel.clone(), noop_handler("h1"), false);
            let _ = manager.remove_subscription(&channel, None);
        }
        let _ = manager.add_subscription(channel.clone(), noop_handler("h1"), false);

        let kinds = stub_bridge.connection(conn).unwrap().command_kinds();
        assert_eq!(kinds.len(), 7);
        for (i, kind) in kinds.iter().enumerate() {
            assert_eq!(kind.is_subscribe(), i % 2 == 0);
        }
        assert_eq!(manager.lookup(&channel), Some(conn));
    }

    #[rstest]
    fn test_unsubscribe_without_owner(stub_bridge: Arc<StubBridge>) {
        let manager = stub_manager(&stub_bridge);
        let subscription = Arc::new(Subscription::new(Channel::literal("news")));

        let future = manager
            .unsubscribe_from_server(&subscription, CommandFlags::NONE)
            .unwrap();

        assert!(future.is_none());
        assert_eq!(stub_bridge.total_commands(), 0);
    }

    #[rstest]
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_deferred_handler_runs_once_off_reader(stub_bridge: Arc<StubBridge>) {
        let manager = stub_manager(&stub_bridge);
        let channel = Channel::literal("news");
        let (tx, mut rx) = mpsc::unbounded_channel::<ThreadId>();
        let handler = SubscriptionHandler::new(Some("h1"), move |_: &Channel, _: &Bytes| {
            let _ = tx.send(thread::current().id());
        });

        let _ = manager.add_subscription(channel.clone(), handler, false);
        assert!(manager.deliver(&channel, channel.clone(), Bytes::from("hello")));

        let thread_id = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_ne!(thread_id, thread::current().id());

        // Exactly once
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
    }

    #[rstest]
    fn test_with_dispatch_runs_deferred_on_given_runtime(stub_bridge: Arc<StubBridge>) {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("pubsub-test-worker")
            .build()
            .unwrap();
        let manager =
            stub_manager(&stub_bridge).with_dispatch(WorkerDispatch::new(runtime.handle().clone()));
        let channel = Channel::literal("news");
        let (tx, rx) = std::sync::mpsc::channel();
        let handler = SubscriptionHandler::new(Some("h1"), move |_: &Channel, _: &Bytes| {
            let _ = tx.send(thread::current().name().map(str::to_string));
        });

        let _ = manager.add_subscription(channel.clone(), handler, false);
        assert!(manager.deliver(&channel, channel.clone(), Bytes::new()));

        let name = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(name.as_deref(), Some("pubsub-test-worker"));
    }

    #[rstest]
    fn test_inline_handler_runs_on_reader(stub_bridge: Arc<StubBridge>) {
        let manager = stub_manager(&stub_bridge);
        let channel = Channel::pattern("news.*");
        let (handler, mut rx) = crate::handler::channel_handler();

        let _ = manager.add_subscription(channel.clone(), handler, true);
        assert!(manager.deliver(&channel, Channel::literal("news.sport"), Bytes::from("goal")));

        let message = rx.try_recv().unwrap();
        assert_eq!(message.channel, Channel::literal("news.sport"));
        assert_eq!(message.payload, Bytes::from("goal"));
    }

    #[rstest]
    fn test_panicking_handler_does_not_block_next(stub_bridge: Arc<StubBridge>) {
        let manager = stub_manager(&stub_bridge);
        let channel = Channel::literal("news");
        let count = Arc::new(AtomicUsize::new(0));

        let panicking = SubscriptionHandler::new(Some("boom"), |_: &Channel, _: &Bytes| {
            panic!("handler failure");
        });
        let _ = manager.add_subscription(channel.clone(), panicking, false);
        let _ = manager.add_subscription(channel.clone(), counting_handler("ok", &count), false);

        manager
            .on_inbound_message(&channel, channel.clone(), Bytes::new())
            .unwrap()
            .complete();

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[rstest]
    fn test_introspection(stub_bridge: Arc<StubBridge>) {
        let manager = stub_manager(&stub_bridge);
        assert!(manager.is_empty());

        let _ = manager.add_subscription(Channel::literal("a"), noop_handler("1"), true);
        let _ = manager.add_subscription(Channel::literal("b"), noop_handler("2"), false);

        let mut channels = manager.channels();
        channels.sort_by(|a, b| a.as_bytes().cmp(b.as_bytes()));

        assert_eq!(manager.subscription_count(), 2);
        assert_eq!(channels, vec![Channel::literal("a"), Channel::literal("b")]);
        assert_eq!(manager.handler_counts(&Channel::literal("a")), Some((1, 0)));
        assert_eq!(manager.handler_counts(&Channel::literal("z")), None);
    }
}
