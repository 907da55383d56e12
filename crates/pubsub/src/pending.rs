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

//! In-flight subscribe/unsubscribe operations and their single-resolution futures.
//!
//! A [`PendingOperation`] is handed to a connection's subscription write path. The
//! connection resolves it exactly once with [`PendingOperation::complete`],
//! [`PendingOperation::abort`] or [`PendingOperation::fail`]; any later resolution is
//! ignored. If every handle is dropped unresolved the waiter observes cancellation.

use std::{
    fmt::Debug,
    future::Future,
    pin::Pin,
    sync::{Arc, Mutex, PoisonError},
    task::{Context, Poll},
};

use tokio::sync::oneshot::{self, error::TryRecvError};

use crate::{command::SubscriptionCommand, error::PubSubError, subscription::Subscription};

/// The outcome of a subscription operation.
#[derive(Debug)]
pub enum Completion {
    /// The server confirmed the operation.
    Confirmed,
    /// No network action was needed or possible at the time.
    NoOp,
    /// The operation was aborted before it reached the server.
    Cancelled,
    /// The connection layer reported a failure.
    Failed(PubSubError),
}

impl Completion {
    /// Returns true if the operation confirmed or needed no network action.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Confirmed | Self::NoOp)
    }

    /// Returns true if the operation was cancelled.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Converts the outcome into a `Result`.
    ///
    /// # Errors
    ///
    /// Returns [`PubSubError::Cancelled`] for a cancelled operation, or the failure cause.
    pub fn into_result(self) -> Result<(), PubSubError> {
        match self {
            Self::Confirmed | Self::NoOp => Ok(()),
            Self::Cancelled => Err(PubSubError::Cancelled),
            Self::Failed(e) => Err(e),
        }
    }
}

#[derive(Debug)]
enum FutureState {
    Ready(Option<Completion>),
    Pending(oneshot::Receiver<Completion>),
}

/// A future resolving to the [`Completion`] of a subscription operation.
///
/// Async callers `.await` it; synchronous callers use [`SubscriptionFuture::wait_blocking`].
#[derive(Debug)]
#[must_use = "futures do nothing unless awaited"]
pub struct SubscriptionFuture {
    state: FutureState,
}

impl SubscriptionFuture {
    /// Creates an already-resolved future.
    pub const fn ready(completion: Completion) -> Self {
        Self {
            state: FutureState::Ready(Some(completion)),
        }
    }

    /// Creates an already-resolved future for an operation that needed no network action.
    pub const fn noop() -> Self {
        Self::ready(Completion::NoOp)
    }

    /// Returns true if the outcome is available without waiting.
    pub fn is_resolved(&mut self) -> bool {
        match &mut self.state {
            FutureState::Ready(_) => true,
            FutureState::Pending(rx) => {
                let completion = match rx.try_recv() {
                    Ok(completion) => completion,
                    Err(TryRecvError::Empty) => return false,
                    Err(TryRecvError::Closed) => Completion::Cancelled,
                };
                self.state = FutureState::Ready(Some(completion));
                true
            }
        }
    }

    /// Blocks the current thread until the operation resolves.
    ///
    /// # Panics
    ///
    /// Panics if called from within an asynchronous execution context.
    pub fn wait_blocking(self) -> Completion {
        match self.state {
            FutureState::Ready(completion) => completion.unwrap_or(Completion::NoOp),
            FutureState::Pending(rx) => rx.blocking_recv().unwrap_or(Completion::Cancelled),
        }
    }
}

impl Future for SubscriptionFuture {
    type Output = Completion;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.get_mut().state {
            FutureState::Ready(completion) => {
                Poll::Ready(completion.take().unwrap_or(Completion::NoOp))
            }
            FutureState::Pending(rx) => Pin::new(rx)
                .poll(cx)
                .map(|result| result.unwrap_or(Completion::Cancelled)),
        }
    }
}

struct PendingInner {
    command: SubscriptionCommand,
    subscription: Arc<Subscription>,
    sender: Mutex<Option<oneshot::Sender<Completion>>>,
}

/// A subscribe or unsubscribe request awaiting network confirmation.
///
/// Cloning shares the same operation; resolution happens at most once across all clones.
#[derive(Clone)]
pub struct PendingOperation {
    inner: Arc<PendingInner>,
}

impl PendingOperation {
    /// Creates a new [`PendingOperation`] and the future it resolves.
    pub fn new(
        command: SubscriptionCommand,
        subscription: Arc<Subscription>,
    ) -> (Self, SubscriptionFuture) {
        let (tx, rx) = oneshot::channel();
        let operation = Self {
            inner: Arc::new(PendingInner {
                command,
                subscription,
                sender: Mutex::new(Some(tx)),
            }),
        };
        let future = SubscriptionFuture {
            state: FutureState::Pending(rx),
        };
        (operation, future)
    }

    /// Returns the protocol command to send.
    #[must_use]
    pub fn command(&self) -> &SubscriptionCommand {
        &self.inner.command
    }

    /// Returns the subscription record this operation targets.
    #[must_use]
    pub fn subscription(&self) -> &Arc<Subscription> {
        &self.inner.subscription
    }

    /// Returns true if the operation was issued internally (failover, validation).
    #[must_use]
    pub fn is_internal(&self) -> bool {
        self.inner.command.is_internal()
    }

    /// Returns true once the operation has been resolved.
    #[must_use]
    pub fn is_resolved(&self) -> bool {
        self.lock_sender().is_none()
    }

    /// Resolves the operation as confirmed by the server.
    ///
    /// Returns `false` if it was already resolved.
    pub fn complete(&self) -> bool {
        self.resolve(Completion::Confirmed)
    }

    /// Resolves the operation as cancelled.
    ///
    /// Returns `false` if it was already resolved.
    pub fn abort(&self) -> bool {
        self.resolve(Completion::Cancelled)
    }

    /// Resolves the operation as failed with `error`.
    ///
    /// Returns `false` if it was already resolved.
    pub fn fail(&self, error: PubSubError) -> bool {
        self.resolve(Completion::Failed(error))
    }

    fn resolve(&self, completion: Completion) -> bool {
        let Some(tx) = self.lock_sender().take() else {
            return false;
        };

        tracing::trace!(
            command = %self.inner.command.kind(),
            channel = %self.inner.command.channel(),
            ?completion,
            "Resolved subscription operation",
        );

        // The waiter may have gone away (fire-and-forget)
        let _ = tx.send(completion);
        true
    }

    fn lock_sender(&self) -> std::sync::MutexGuard<'_, Option<oneshot::Sender<Completion>>> {
        self.inner
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl Debug for PendingOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct(stringify!(PendingOperation))
            .field("command", &self.inner.command)
            .field("resolved", &self.is_resolved())
            .finish()
    }
}

////////////////////////////////////////////////////////////////////////////////
// Tests
////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use rstest::{fixture, rstest};

    use super::*;
    use crate::{channel::Channel, command::CommandFlags};

    #[fixture]
    fn operation() -> (PendingOperation, SubscriptionFuture) {
        let channel = Channel::literal("news");
        let command = SubscriptionCommand::subscribe(channel.clone(), CommandFlags::NONE).unwrap();
        PendingOperation::new(command, Arc::new(Subscription::new(channel)))
    }

    #[rstest]
    #[tokio::test]
    async fn test_complete_resolves_once(operation: (PendingOperation, SubscriptionFuture)) {
        let (operation, future) = operation;
        let clone = operation.clone();

        assert!(!operation.is_resolved());
        assert!(operation.complete());
        assert!(!clone.abort());
        assert!(!clone.fail(PubSubError::Connection("late".to_string())));
        assert!(clone.is_resolved());
        assert!(Arc::ptr_eq(operation.subscription(), clone.subscription()));
        assert_eq!(
            operation.subscription().channel(),
            &Channel::literal("news")
        );

        let completion = future.await;
        assert!(completion.is_success());
        assert!(matches!(completion, Completion::Confirmed));
    }

    #[rstest]
    #[tokio::test]
    async fn test_abort_is_cancellation(operation: (PendingOperation, SubscriptionFuture)) {
        let (operation, future) = operation;
        assert!(operation.abort());

        let completion = future.await;
        assert!(completion.is_cancelled());
        assert!(!completion.is_success());
        assert!(matches!(
            completion.into_result(),
            Err(PubSubError::Cancelled)
        ));
    }

    #[rstest]
    #[tokio::test]
    async fn test_fail_carries_cause(operation: (PendingOperation, SubscriptionFuture)) {
        let (operation, future) = operation;
        assert!(operation.fail(PubSubError::Connection("socket closed".to_string())));

        let completion = future.await;
        assert!(!completion.is_success());
        match completion {
            Completion::Failed(PubSubError::Connection(message)) => {
                assert_eq!(message, "socket closed");
            }
            other => panic!("unexpected completion {other:?}"),
        }
    }

    #[rstest]
    #[tokio::test]
    async fn test_dropped_operation_is_cancelled(
        operation: (PendingOperation, SubscriptionFuture),
    ) {
        let (operation, future) = operation;
        drop(operation);
        assert!(future.await.is_cancelled());
    }

    #[rstest]
    fn test_resolve_without_waiter_is_ok(operation: (PendingOperation, SubscriptionFuture)) {
        let (operation, future) = operation;
        drop(future);
        assert!(operation.complete());
    }

    #[rstest]
    fn test_is_resolved_polls_without_blocking(
        operation: (PendingOperation, SubscriptionFuture),
    ) {
        let (operation, mut future) = operation;
        assert!(!future.is_resolved());

        operation.complete();
        assert!(future.is_resolved());
        assert!(matches!(future.wait_blocking(), Completion::Confirmed));
    }

    #[rstest]
    fn test_wait_blocking_from_other_thread(operation: (PendingOperation, SubscriptionFuture)) {
        let (operation, future) = operation;
        let handle = std::thread::spawn(move || operation.complete());

        assert!(matches!(future.wait_blocking(), Completion::Confirmed));
        assert!(handle.join().unwrap());
    }

    #[rstest]
    #[tokio::test]
    async fn test_ready_futures() {
        assert!(matches!(SubscriptionFuture::noop().await, Completion::NoOp));
        assert!(
            SubscriptionFuture::ready(Completion::Cancelled)
                .await
                .is_cancelled()
        );
        assert!(SubscriptionFuture::noop().is_resolved());
        assert!(SubscriptionFuture::noop().wait_blocking().is_success());
    }
}
