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

//! Configuration for the subscription manager.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for a [`crate::manager::SubscriptionManager`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SubscriptionConfig {
    /// Whether deferred handlers may run on the network-reader context.
    ///
    /// When `false` (the default) deferred handlers always run on the worker pool and only
    /// inline-eligible (queue-backed) handlers run on the reader.
    pub deliver_deferred_inline: bool,
    /// The interval (milliseconds) between periodic validation sweeps.
    ///
    /// `None` disables the periodic validation task.
    pub validation_interval_ms: Option<u64>,
}

impl SubscriptionConfig {
    /// Returns the periodic validation interval, if enabled.
    #[must_use]
    pub fn validation_interval(&self) -> Option<Duration> {
        self.validation_interval_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            deliver_deferred_inline: false,
            validation_interval_ms: Some(5_000),
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// Tests
////////////////////////////////////////////////////////////////////////////////
