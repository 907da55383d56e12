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

//! Channel identities for pub/sub subscriptions.
//!
//! A [`Channel`] is an opaque byte key plus a [`ChannelKind`]. Equality and hashing are
//! exact over both parts, so the literal channel `news.*` and the pattern `news.*` are
//! distinct subscriptions. Glob matching of inbound messages is the network layer's job.

use std::fmt::{self, Display};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display as StrumDisplay, EnumString};

/// How a channel subscription matches published messages.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    PartialEq,
    Eq,
    Hash,
    AsRefStr,
    StrumDisplay,
    EnumString,
    Serialize,
    Deserialize,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    /// Matches a single channel name exactly.
    #[default]
    Literal,
    /// Matches every channel name accepted by a glob pattern.
    Pattern,
    /// Matches a single channel name routed to the shard that owns its slot.
    Sharded,
}

/// A pub/sub channel identity.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Channel {
    value: Bytes,
    kind: ChannelKind,
}

impl Channel {
    /// Creates a new [`Channel`] instance.
    #[must_use]
    pub fn new(value: impl Into<Bytes>, kind: ChannelKind) -> Self {
        Self {
            value: value.into(),
            kind,
        }
    }

    /// Creates a literal channel.
    #[must_use]
    pub fn literal(value: impl Into<Bytes>) -> Self {
        Self::new(value, ChannelKind::Literal)
    }

    /// Creates a glob pattern channel.
    #[must_use]
    pub fn pattern(value: impl Into<Bytes>) -> Self {
        Self::new(value, ChannelKind::Pattern)
    }

    /// Creates a sharded channel.
    #[must_use]
    pub fn sharded(value: impl Into<Bytes>) -> Self {
        Self::new(value, ChannelKind::Sharded)
    }

    /// Returns the raw channel bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &Bytes {
        &self.value
    }

    /// Returns the channel kind.
    #[must_use]
    pub const fn kind(&self) -> ChannelKind {
        self.kind
    }

    /// Returns true if this channel is a glob pattern.
    #[must_use]
    pub const fn is_pattern(&self) -> bool {
        matches!(self.kind, ChannelKind::Pattern)
    }

    /// Returns true if the channel name is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }
}

impl Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.value))
    }
}

impl From<&'static str> for Channel {
    fn from(value: &'static str) -> Self {
        Self::literal(value)
    }
}

////////////////////////////////////////////////////////////////////////////////
// Tests
////////////////////////////////////////////////////////////////////////////////
