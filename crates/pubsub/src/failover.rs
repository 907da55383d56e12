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

//! Re-homing subscriptions when connection topology changes.
//!
//! Validation compares each record's owner against the connection layer. An owner that is
//! no longer a viable target is dropped (best effort) and the record is subscribed again
//! through whatever connection the selector now picks. Failures are logged, never surfaced:
//! a record left without an owner is simply retried on the next sweep.

use std::{
    sync::{Arc, Weak},
    time::Duration,
};

use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::{
    channel::Channel,
    command::{CommandFlags, CommandKind, SubscriptionCommand},
    connection::ConnectionId,
    manager::SubscriptionManager,
    pending::PendingOperation,
    subscription::Subscription,
};

impl SubscriptionManager {
    /// Re-sends the subscribe for `channel` on `connection`, if it still owns the channel.
    ///
    /// Used after a connection re-establishes its session. The command is fire-and-forget.
    /// Returns `true` if the command was accepted by the connection.
    pub fn resubscribe(&self, channel: &Channel, connection: ConnectionId) -> bool {
        let Some(subscription) = self.subscription(channel) else {
            return false;
        };

        let _send = self.lock_send(channel);
        if !subscription.is_owned_by(connection) {
            return false;
        }

        let command =
            match SubscriptionCommand::subscribe(channel.clone(), CommandFlags::RESUBSCRIBE) {
                Ok(command) => command,
                Err(e) => {
                    tracing::debug!(%channel, "Failed to build resubscribe: {e}");
                    return false;
                }
            };

        let (operation, _future) = PendingOperation::new(command, subscription);
        match self.enqueue(connection, operation) {
            Ok(sent) => {
                tracing::trace!(%channel, %connection, sent, "Resubscribe");
                sent
            }
            Err(e) => {
                tracing::debug!(%channel, %connection, "Failed to resubscribe: {e}");
                false
            }
        }
    }

    /// Ensures `subscription` is owned by a viable connection.
    ///
    /// Returns `true` if the owner changed.
    pub fn validate(&self, subscription: &Arc<Subscription>) -> bool {
        if subscription.is_retired() {
            return false;
        }

        let channel = subscription.channel();
        let mut changed = false;

        if let Some(owner) = subscription.owner() {
            let kind = CommandKind::subscribe_for(channel.kind());
            if self.connections().is_viable_target(owner, kind) {
                return false;
            }

            tracing::debug!(%channel, connection = %owner, "Owner is no longer viable");
            if let Err(e) = self.unsubscribe_from_server(subscription, CommandFlags::INTERNAL) {
                tracing::debug!(%channel, connection = %owner, "Failed to unsubscribe: {e}");
            }
            changed = true;
        }

        if subscription.owner().is_none() {
            match self.subscribe_to_server(subscription, CommandFlags::INTERNAL) {
                Ok(Some(_)) => changed |= subscription.owner().is_some(),
                Ok(None) => {}
                Err(e) => tracing::debug!(%channel, "Failed to subscribe: {e}"),
            }
        }

        changed
    }

    /// Validates the record for `channel`, if subscribed.
    pub fn validate_channel(&self, channel: &Channel) -> bool {
        self.subscription(channel)
            .is_some_and(|subscription| self.validate(&subscription))
    }

    /// Validates every subscription, returning how many changed owner.
    pub fn validate_all(&self) -> usize {
        let changed = self
            .snapshot()
            .iter()
            .filter(|subscription| self.validate(subscription))
            .count();

        if changed > 0 {
            tracing::info!("Re-homed {changed} subscription(s)");
        }

        changed
    }

    /// Re-homes every subscription owned by a connection that has gone away.
    ///
    /// No unsubscribe is sent to the closed connection. Returns how many subscriptions
    /// were placed on a new connection.
    pub fn on_connection_closed(&self, connection: ConnectionId) -> usize {
        let mut rehomed = 0;

        for subscription in self.snapshot() {
            if !subscription.release_owner_if(connection) {
                continue;
            }

            let channel = subscription.channel();
            match self.subscribe_to_server(&subscription, CommandFlags::INTERNAL) {
                Ok(Some(_)) if subscription.owner().is_some() => rehomed += 1,
                Ok(_) => tracing::debug!(%channel, "No connection to re-home onto"),
                Err(e) => tracing::debug!(%channel, "Failed to re-home: {e}"),
            }
        }

        tracing::debug!(%connection, rehomed, "Handled connection close");
        rehomed
    }

    /// Spawns a task running [`SubscriptionManager::validate_all`] every `interval`.
    ///
    /// The task stops when `cancel` fires or the manager is dropped.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a Tokio runtime, or if `interval` is zero.
    pub fn spawn_validation_task(
        self: Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let manager: Weak<Self> = Arc::downgrade(&self);
        drop(self);

        tracing::debug!("Started task 'validation'");

        tokio::task::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // First tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(manager) = manager.upgrade() else {
                            break;
                        };
                        manager.validate_all();
                    }
                }
            }

            tracing::debug!("Completed task 'validation'");
        })
    }

    /// Spawns the validation task at the configured interval, if enabled.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a Tokio runtime.
    pub fn spawn_configured_validation(
        self: Arc<Self>,
        cancel: CancellationToken,
    ) -> Option<JoinHandle<()>> {
        let interval = self.config().validation_interval()?;
        Some(self.spawn_validation_task(interval, cancel))
    }
}

////////////////////////////////////////////////////////////////////////////////
// Tests
////////////////////////////////////////////////////////////////////////////////
