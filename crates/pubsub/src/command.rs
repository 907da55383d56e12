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

//! Subscription protocol commands.
//!
//! Encoding onto the wire is done by the connection layer; this module only decides which
//! command a channel needs and tags it as internal or user-facing.

use bytes::Bytes;
use strum::{AsRefStr, Display, EnumString, IntoStaticStr};

use crate::{
    channel::{Channel, ChannelKind},
    error::PubSubError,
};

/// Subscription command verbs.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, AsRefStr, Display, EnumString, IntoStaticStr,
)]
#[strum(serialize_all = "UPPERCASE")]
pub enum CommandKind {
    /// Subscribe to a literal channel.
    Subscribe,
    /// Unsubscribe from a literal channel.
    Unsubscribe,
    /// Subscribe to a glob pattern.
    PSubscribe,
    /// Unsubscribe from a glob pattern.
    PUnsubscribe,
    /// Subscribe to a sharded channel.
    SSubscribe,
    /// Unsubscribe from a sharded channel.
    SUnsubscribe,
}

impl CommandKind {
    /// Returns the subscribe verb for a channel kind.
    #[must_use]
    pub const fn subscribe_for(kind: ChannelKind) -> Self {
        match kind {
            ChannelKind::Literal => Self::Subscribe,
            ChannelKind::Pattern => Self::PSubscribe,
            ChannelKind::Sharded => Self::SSubscribe,
        }
    }

    /// Returns the unsubscribe verb for a channel kind.
    #[must_use]
    pub const fn unsubscribe_for(kind: ChannelKind) -> Self {
        match kind {
            ChannelKind::Literal => Self::Unsubscribe,
            ChannelKind::Pattern => Self::PUnsubscribe,
            ChannelKind::Sharded => Self::SUnsubscribe,
        }
    }

    /// Returns true for the subscribe verbs.
    #[must_use]
    pub const fn is_subscribe(self) -> bool {
        matches!(self, Self::Subscribe | Self::PSubscribe | Self::SSubscribe)
    }
}

/// Flags attached to a subscription command.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct CommandFlags {
    /// Issued by the manager itself (failover, validation) rather than a user call.
    pub internal: bool,
    /// Nobody awaits the outcome.
    pub fire_and_forget: bool,
}

impl CommandFlags {
    /// A user-facing command.
    pub const NONE: Self = Self {
        internal: false,
        fire_and_forget: false,
    };

    /// An internal command whose outcome is tracked.
    pub const INTERNAL: Self = Self {
        internal: true,
        fire_and_forget: false,
    };

    /// An internal best-effort re-subscribe.
    pub const RESUBSCRIBE: Self = Self {
        internal: true,
        fire_and_forget: true,
    };
}

/// A subscribe or unsubscribe request for a single channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubscriptionCommand {
    kind: CommandKind,
    channel: Channel,
    flags: CommandFlags,
}

impl SubscriptionCommand {
    /// Creates a new [`SubscriptionCommand`] instance.
    ///
    /// # Errors
    ///
    /// Returns an error if the channel name is empty.
    pub fn new(
        kind: CommandKind,
        channel: Channel,
        flags: CommandFlags,
    ) -> Result<Self, PubSubError> {
        if channel.is_empty() {
            return Err(PubSubError::InvalidChannel(format!(
                "cannot {kind} an empty {} channel",
                channel.kind()
            )));
        }

        Ok(Self {
            kind,
            channel,
            flags,
        })
    }

    /// Creates the subscribe command for `channel`.
    ///
    /// # Errors
    ///
    /// Returns an error if the channel name is empty.
    pub fn subscribe(channel: Channel, flags: CommandFlags) -> Result<Self, PubSubError> {
        Self::new(CommandKind::subscribe_for(channel.kind()), channel, flags)
    }

    /// Creates the unsubscribe command for `channel`.
    ///
    /// # Errors
    ///
    /// Returns an error if the channel name is empty.
    pub fn unsubscribe(channel: Channel, flags: CommandFlags) -> Result<Self, PubSubError> {
        Self::new(CommandKind::unsubscribe_for(channel.kind()), channel, flags)
    }

    /// Returns the command verb.
    #[must_use]
    pub const fn kind(&self) -> CommandKind {
        self.kind
    }

    /// Returns the target channel.
    #[must_use]
    pub const fn channel(&self) -> &Channel {
        &self.channel
    }

    /// Returns the command flags.
    #[must_use]
    pub const fn flags(&self) -> CommandFlags {
        self.flags
    }

    /// Returns true if the command was issued by the manager itself.
    #[must_use]
    pub const fn is_internal(&self) -> bool {
        self.flags.internal
    }

    /// Returns the `[verb, channel]` argument vector for the encoder.
    #[must_use]
    pub fn args(&self) -> Vec<Bytes> {
        let verb: &'static str = self.kind.into();
        vec![
            Bytes::from_static(verb.as_bytes()),
            self.channel.as_bytes().clone(),
        ]
    }
}

////////////////////////////////////////////////////////////////////////////////
// Tests
////////////////////////////////////////////////////////////////////////////////
