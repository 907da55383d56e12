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

//! Delivery of inbound messages to subscription handlers.
//!
//! The network reader turns each inbound message into a [`Delivery`]: a completable unit
//! carrying snapshots of both handler slots. Inline-eligible handlers run immediately on
//! the reader. Everything else is handed to [`WorkerDispatch`], which runs it exactly once
//! on the blocking pool.

use std::{fmt::Debug, sync::Arc};

use bytes::Bytes;
use tokio::runtime::Handle;

use crate::{
    channel::Channel,
    handler::{SubscriptionHandler, invoke_all},
    runtime::current_or_shared_handle,
    subscription::Subscription,
};

type HandlerList = Arc<Vec<SubscriptionHandler>>;

/// A ready-to-run unit delivering one inbound message to its handlers.
pub struct Delivery {
    subscription: Arc<Subscription>,
    channel: Channel,
    payload: Bytes,
    inline: Option<HandlerList>,
    deferred: Option<HandlerList>,
}

impl Delivery {
    /// Creates a delivery from the current handlers of `subscription`.
    ///
    /// `channel` is the channel the message was published on, which differs from the
    /// subscription channel for pattern subscriptions.
    #[must_use]
    pub fn new(subscription: Arc<Subscription>, channel: Channel, payload: Bytes) -> Self {
        let (inline, deferred) = subscription.handler_snapshot();
        Self {
            subscription,
            channel,
            payload,
            inline,
            deferred,
        }
    }

    /// Returns the channel of the subscription that matched.
    #[must_use]
    pub fn subscription_channel(&self) -> &Channel {
        self.subscription.channel()
    }

    /// Returns the channel the message was published on.
    #[must_use]
    pub const fn channel(&self) -> &Channel {
        &self.channel
    }

    /// Returns the message payload.
    #[must_use]
    pub const fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Returns true if no handlers remain to be invoked.
    #[must_use]
    pub const fn is_complete(&self) -> bool {
        self.inline.is_none() && self.deferred.is_none()
    }

    /// Attempts to complete the delivery on the calling thread.
    ///
    /// Inline-eligible handlers always run here. Deferred handlers only run when
    /// `allow_inline` is set. Returns `true` if nothing is left for a worker.
    pub fn try_complete(&mut self, allow_inline: bool) -> bool {
        if let Some(handlers) = self.inline.take() {
            self.invoke(&handlers);
        }

        if allow_inline && let Some(handlers) = self.deferred.take() {
            self.invoke(&handlers);
        }

        self.is_complete()
    }

    /// Runs every remaining handler.
    ///
    /// A delivery whose subscription has since been removed is treated as already handled.
    pub fn complete(mut self) {
        if self.subscription.is_retired() {
            tracing::trace!(
                channel = %self.channel,
                "Skipping delivery for removed subscription",
            );
            return;
        }

        self.try_complete(true);
    }

    fn invoke(&self, handlers: &[SubscriptionHandler]) {
        let failures = invoke_all(handlers, &self.channel, &self.payload);
        if failures > 0 {
            tracing::debug!(
                channel = %self.channel,
                failures,
                "Handlers failed during delivery",
            );
        }
    }
}

impl Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct(stringify!(Delivery))
            .field("subscription", self.subscription.channel())
            .field("channel", &self.channel)
            .field("payload_len", &self.payload.len())
            .field("inline", &self.inline.as_ref().map_or(0, |h| h.len()))
            .field("deferred", &self.deferred.as_ref().map_or(0, |h| h.len()))
            .finish()
    }
}

/// Offloads deliveries onto a worker pool.
///
/// Submissions are fire-and-forget: nothing awaits the worker, and handler panics are
/// caught inside the unit.
#[derive(Clone, Debug)]
pub struct WorkerDispatch {
    handle: Handle,
}

impl WorkerDispatch {
    /// Creates a new [`WorkerDispatch`] running on the given runtime.
    #[must_use]
    pub const fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Creates a dispatcher on the current runtime, falling back to the shared runtime.
    #[must_use]
    pub fn current() -> Self {
        Self::new(current_or_shared_handle())
    }

    /// Submits a delivery to run on the worker pool.
    pub fn submit(&self, delivery: Delivery) {
        tracing::trace!(channel = %delivery.channel, "Submitting delivery to worker");
        // Detached: the join handle is intentionally dropped
        drop(self.handle.spawn_blocking(move || delivery.complete()));
    }

    /// Delivers inline where possible and submits the remainder.
    ///
    /// Returns `true` if the delivery completed on the calling thread.
    pub fn deliver(&self, mut delivery: Delivery, allow_inline: bool) -> bool {
        if delivery.try_complete(allow_inline) {
            return true;
        }

        self.submit(delivery);
        false
    }
}

impl Default for WorkerDispatch {
    fn default() -> Self {
        Self::current()
    }
}

////////////////////////////////////////////////////////////////////////////////
// Tests
////////////////////////////////////////////////////////////////////////////////
