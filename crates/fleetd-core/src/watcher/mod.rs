//! Watcher abstraction module.
//!
//! External collaborators deliver change notifications as watchers: lazy
//! streams of batches. The model-list watcher yields batches of model
//! UUIDs whose state may have changed; the restore-info watcher yields
//! restore statuses. A watcher read must always be selectable against a
//! stop token, which `async fn next` composes with naturally.

use async_trait::async_trait;
use tokio::sync::mpsc;

/// A lazy stream of change batches. `None` means the watcher has closed
/// (usually because the connection behind it went away).
#[async_trait]
pub trait Watcher<T>: Send {
    /// Wait for the next batch.
    async fn next(&mut self) -> Option<T>;
}

/// A channel-backed watcher, fed by whoever holds the sender. Used both
/// by collaborator implementations and by tests.
#[derive(Debug)]
pub struct ChannelWatcher<T> {
    rx: mpsc::Receiver<T>,
}

/// Create a channel watcher with the given buffer size, returning the
/// feeding side alongside it.
#[must_use]
pub fn channel<T: Send>(buffer: usize) -> (mpsc::Sender<T>, ChannelWatcher<T>) {
    let (tx, rx) = mpsc::channel(buffer);
    (tx, ChannelWatcher { rx })
}

#[async_trait]
impl<T: Send> Watcher<T> for ChannelWatcher<T> {
    async fn next(&mut self) -> Option<T> {
        self.rx.recv().await
    }
}
