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

//! Error types for subscription management.

use crate::connection::ConnectionId;

/// Errors surfaced by subscription operations.
///
/// Steady-state connectivity churn is not an error: a missing connection yields a
/// resolved no-op future and a rejected enqueue yields a cancelled one. Only request
/// construction and write-path failures propagate to the caller.
#[derive(Debug, thiserror::Error)]
pub enum PubSubError {
    /// The subscription request could not be built.
    #[error("invalid channel: {0}")]
    InvalidChannel(String),
    /// The connection's subscription write path raised an error while enqueueing.
    #[error("failed to enqueue on connection {connection}: {source}")]
    Enqueue {
        /// The connection that rejected the operation.
        connection: ConnectionId,
        /// The underlying write-path error.
        #[source]
        source: anyhow::Error,
    },
    /// The operation was cancelled before the server confirmed it.
    #[error("subscription operation cancelled")]
    Cancelled,
    /// The connection layer reported a failure for the operation.
    #[error("connection failure: {0}")]
    Connection(String),
}
