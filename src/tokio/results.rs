//! Statement-level access to a task's results.

use tokio::sync::mpsc;

use super::connection::Command;
use crate::result::{PendingOutcome, RowStream, Subscription};
use crate::task::TaskId;

/// Ordered results of one submitted task.
///
/// Every `next_*` call subscribes to the next result in statement order,
/// whether or not the server produced it yet. Dropping the handle releases
/// results nobody asked for.
pub struct MultiResult {
    id: TaskId,
    commands: mpsc::UnboundedSender<Command>,
    row_prefetch: usize,
}

impl MultiResult {
    pub(crate) fn new(
        id: TaskId,
        commands: mpsc::UnboundedSender<Command>,
        row_prefetch: usize,
    ) -> Self {
        Self {
            id,
            commands,
            row_prefetch,
        }
    }

    /// Task the results belong to.
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Subscribe to the next result as an update outcome.
    pub fn next_update(&self) -> PendingOutcome {
        let (subscription, pending) = Subscription::single();
        self.request_next(subscription);
        pending
    }

    /// Subscribe to the next result as a row stream.
    pub fn next_rows(&self) -> RowStream {
        let (subscription, stream) = Subscription::stream(self.row_prefetch);
        self.request_next(subscription);
        stream
    }

    /// Subscribe to the next result with a prepared subscription.
    ///
    /// If the connection is gone the subscription is dropped, which its
    /// consumer half reports as [`Error::ConnectionClosed`](crate::Error::ConnectionClosed).
    pub fn request_next(&self, subscription: Subscription) {
        let _ = self.commands.send(Command::Subscribe {
            id: self.id,
            subscription,
        });
    }
}

impl Drop for MultiResult {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Release(self.id));
    }
}
