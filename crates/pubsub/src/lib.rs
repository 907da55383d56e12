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

//! Pub/sub subscription management for the Relay multiplexed protocol client.
//!
//! The `relay-pubsub` crate tracks which channels are subscribed, which physical server
//! connection owns each channel, and delivers inbound messages to registered handlers
//! while the connection topology changes underneath (failover, reconnect, re-routing).
//!
//! It reconciles three concurrent forces:
//!
//! - Application tasks adding and removing subscriptions at any time.
//! - A single network-reader context delivering inbound messages, which never blocks on
//!   user callbacks.
//! - Periodic or triggered validation that silently migrates subscriptions to a new
//!   owning connection without losing or duplicating a registration.
//!
//! The wire codec, the physical connection and its write queue, and server selection are
//! external collaborators, consumed through the traits in [`connection`].
//!
//! # Feature flags
//!
//! - `stubs`: Exposes the in-memory [`stubs::StubBridge`] used for testing.

#![warn(rustc::all)]
#![deny(unsafe_code)]
#![deny(nonstandard_style)]
#![deny(missing_debug_implementations)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

pub mod channel;
pub mod command;
pub mod config;
pub mod connection;
pub mod dispatch;
pub mod error;
pub mod failover;
pub mod handler;
pub mod manager;
pub mod pending;
pub mod runtime;
pub mod subscription;

#[cfg(any(test, feature = "stubs"))]
pub mod stubs;

pub use crate::{
    channel::{Channel, ChannelKind},
    command::{CommandFlags, CommandKind, SubscriptionCommand},
    config::SubscriptionConfig,
    connection::{
        ConnectionId, ConnectionProvider, ConnectionState, ServerSelector, SubscriptionWriter,
    },
    dispatch::{Delivery, WorkerDispatch},
    error::PubSubError,
    handler::{ChannelMessage, HandlerSlot, SubscriptionHandler, channel_handler},
    manager::SubscriptionManager,
    pending::{Completion, PendingOperation, SubscriptionFuture},
    subscription::Subscription,
};
