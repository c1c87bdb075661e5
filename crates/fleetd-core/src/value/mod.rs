//! Value cell module.
//!
//! A [`ValueCell`] is a single-value publisher with a monotonic version
//! number. Observers receive a lazy stream of change notifications and
//! never see a value older than their last observation. The agent's
//! configuration is published through a cell so workers such as the
//! state-starter can react to changes.

use std::sync::Arc;

use tokio::sync::watch;

#[derive(Debug, Clone)]
struct Slot<T> {
    version: u64,
    value: Option<T>,
}

/// A versioned single-value publisher.
#[derive(Debug, Clone)]
pub struct ValueCell<T> {
    tx: Arc<watch::Sender<Slot<T>>>,
}

impl<T: Clone + Send + Sync> ValueCell<T> {
    /// Create an empty cell at version zero.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(Slot {
            version: 0,
            value: None,
        });
        Self { tx: Arc::new(tx) }
    }

    /// Create a cell already holding `value` at version one.
    #[must_use]
    pub fn with_value(value: T) -> Self {
        let cell = Self::new();
        cell.set(value);
        cell
    }

    /// Publish a new value, bumping the version.
    pub fn set(&self, value: T) {
        self.tx.send_modify(|slot| {
            slot.version += 1;
            slot.value = Some(value);
        });
    }

    /// The current value, if one has ever been published.
    #[must_use]
    pub fn get(&self) -> Option<T> {
        self.tx.borrow().value.clone()
    }

    /// The current version. Zero means nothing has been published.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.tx.borrow().version
    }

    /// Register an observer. The first call to [`ValueWatch::next`]
    /// returns the current value if one has already been published.
    #[must_use]
    pub fn watch(&self) -> ValueWatch<T> {
        ValueWatch {
            rx: self.tx.subscribe(),
            seen: 0,
        }
    }
}

impl<T: Clone + Send + Sync> Default for ValueCell<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// An observer of a [`ValueCell`].
#[derive(Debug)]
pub struct ValueWatch<T> {
    rx: watch::Receiver<Slot<T>>,
    seen: u64,
}

impl<T: Clone + Send + Sync> ValueWatch<T> {
    /// Wait for a value newer than the last one observed and return it.
    /// Returns `None` once every publisher has been dropped.
    pub async fn next(&mut self) -> Option<T> {
        loop {
            let newer = {
                let slot = self.rx.borrow_and_update();
                if slot.version > self.seen {
                    self.seen = slot.version;
                    slot.value.clone()
                } else {
                    None
                }
            };
            if let Some(value) = newer {
                return Some(value);
            }
            if self.rx.changed().await.is_err() {
                return None;
            }
        }
    }
}
