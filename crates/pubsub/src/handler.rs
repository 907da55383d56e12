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

//! Subscription handlers and multicast slots.
//!
//! Handlers are identified by a [`Ustr`] ID so they can be removed by identity, the same
//! way the message bus keys its subscriptions. A [`HandlerSlot`] is an ordered,
//! copy-on-write list of handlers: inbound deliveries snapshot it in O(1) and never hold a
//! lock while user code runs.

use std::{
    any::Any,
    fmt::Debug,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::Arc,
};

use bytes::Bytes;
use tokio::sync::mpsc::{UnboundedReceiver, unbounded_channel};
use ustr::Ustr;
use uuid::Uuid;

use crate::channel::Channel;

/// Callback invoked with the channel a message was published on and its payload.
pub type HandlerCallback = Arc<dyn Fn(&Channel, &Bytes) + Send + Sync>;

/// A user callback registered for a channel.
#[derive(Clone)]
pub struct SubscriptionHandler {
    id: Ustr,
    callback: HandlerCallback,
}

impl SubscriptionHandler {
    /// Creates a new handler with an optional custom ID.
    pub fn new<S, F>(id: Option<S>, callback: F) -> Self
    where
        S: AsRef<str>,
        F: Fn(&Channel, &Bytes) + Send + Sync + 'static,
    {
        let id = id
            .map(|s| Ustr::from(s.as_ref()))
            .unwrap_or_else(generate_unique_handler_id);
        Self {
            id,
            callback: Arc::new(callback),
        }
    }

    /// Creates a new handler with an auto-generated ID.
    pub fn from_callback<F>(callback: F) -> Self
    where
        F: Fn(&Channel, &Bytes) + Send + Sync + 'static,
    {
        Self::new::<Ustr, F>(None, callback)
    }

    /// Returns the unique identifier for this handler.
    #[must_use]
    pub const fn id(&self) -> Ustr {
        self.id
    }

    /// Invokes the callback.
    pub fn handle(&self, channel: &Channel, payload: &Bytes) {
        (self.callback)(channel, payload);
    }

    /// Invokes the callback, catching any panic. Returns `false` if the callback panicked.
    pub(crate) fn handle_guarded(&self, channel: &Channel, payload: &Bytes) -> bool {
        match catch_unwind(AssertUnwindSafe(|| self.handle(channel, payload))) {
            Ok(()) => true,
            Err(panic) => {
                tracing::error!(
                    handler_id = %self.id,
                    channel = %channel,
                    "Subscription handler panicked: {}",
                    panic_message(panic.as_ref()),
                );
                false
            }
        }
    }
}

impl Debug for SubscriptionHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct(stringify!(SubscriptionHandler))
            .field("id", &self.id)
            .field("callback", &"<function>")
            .finish()
    }
}

impl PartialEq for SubscriptionHandler {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for SubscriptionHandler {}

fn generate_unique_handler_id() -> Ustr {
    Ustr::from(&Uuid::new_v4().to_string())
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.as_str()
    } else {
        "<non-string panic payload>"
    }
}

/// Invokes every handler in order, isolating panics. Returns the number that panicked.
pub(crate) fn invoke_all(
    handlers: &[SubscriptionHandler],
    channel: &Channel,
    payload: &Bytes,
) -> usize {
    handlers
        .iter()
        .filter(|handler| !handler.handle_guarded(channel, payload))
        .count()
}

/// An ordered multicast of handlers for one invocation class.
///
/// A slot starts *unset*. Removing its last handler leaves it *empty*, which callers can
/// tell apart from a slot that was never used.
#[derive(Clone, Debug, Default)]
pub struct HandlerSlot {
    handlers: Option<Arc<Vec<SubscriptionHandler>>>,
}

impl HandlerSlot {
    /// Creates a new unset [`HandlerSlot`].
    #[must_use]
    pub const fn new() -> Self {
        Self { handlers: None }
    }

    /// Appends a handler.
    ///
    /// Registering the same handler twice makes it run twice per message, matching multicast
    /// delegate semantics.
    pub fn add(&mut self, handler: SubscriptionHandler) {
        Arc::make_mut(self.handlers.get_or_insert_with(Default::default)).push(handler);
    }

    /// Removes the most recently added registration with `id`. Returns `true` if one was
    /// present.
    pub fn remove(&mut self, id: &Ustr) -> bool {
        let Some(handlers) = self.handlers.as_mut() else {
            return false;
        };

        let Some(index) = handlers.iter().rposition(|h| h.id == *id) else {
            return false;
        };

        Arc::make_mut(handlers).remove(index);
        true
    }

    /// Removes every handler, returning how many were dropped.
    pub fn clear(&mut self) -> usize {
        match self.handlers.as_mut() {
            Some(handlers) => {
                let count = handlers.len();
                *handlers = Arc::default();
                count
            }
            None => 0,
        }
    }

    /// Returns true if the slot contains a handler with `id`.
    #[must_use]
    pub fn contains(&self, id: &Ustr) -> bool {
        self.handlers
            .as_ref()
            .is_some_and(|handlers| handlers.iter().any(|h| h.id == *id))
    }

    /// Returns the number of handlers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.as_ref().map_or(0, |handlers| handlers.len())
    }

    /// Returns true if the slot has no handlers (either unset or emptied).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns true if no handler was ever added.
    #[must_use]
    pub const fn is_unset(&self) -> bool {
        self.handlers.is_none()
    }

    /// Returns a cheap snapshot of the current handlers, or `None` if there are none.
    #[must_use]
    pub fn snapshot(&self) -> Option<Arc<Vec<SubscriptionHandler>>> {
        self.handlers
            .as_ref()
            .filter(|handlers| !handlers.is_empty())
            .map(Arc::clone)
    }
}

/// A message delivered through a [`channel_handler`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChannelMessage {
    /// The channel the message was published on.
    pub channel: Channel,
    /// The message payload.
    pub payload: Bytes,
}

/// Creates a queue-backed handler.
///
/// The handler only pushes onto an unbounded channel, which makes it safe to register as
/// inline-eligible: invoking it on the network-reader context never blocks.
#[must_use]
pub fn channel_handler() -> (SubscriptionHandler, UnboundedReceiver<ChannelMessage>) {
    let (tx, rx) = unbounded_channel();
    let handler = SubscriptionHandler::from_callback(move |channel: &Channel, payload: &Bytes| {
        let message = ChannelMessage {
            channel: channel.clone(),
            payload: payload.clone(),
        };
        if let Err(e) = tx.send(message) {
            tracing::debug!("Failed to send message to channel: {e}");
        }
    });
    (handler, rx)
}

////////////////////////////////////////////////////////////////////////////////
// Tests
////////////////////////////////////////////////////////////////////////////////
