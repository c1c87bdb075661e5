//! One-shot gate module.
//!
//! A [`Gate`] is a set-once boolean signal with multi-observer semantics:
//! the transition from unset to open happens at most once, and observers
//! registered before or after the transition both observe it. Gates
//! replace "done channels used as booleans": the upgrade-complete and
//! initial-upgrade-check signals are gates.

use tokio::sync::watch;

/// A one-shot, multi-observer completion flag.
#[derive(Debug, Clone)]
pub struct Gate {
    tx: std::sync::Arc<watch::Sender<bool>>,
}

impl Gate {
    /// Create a new, unset gate.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            tx: std::sync::Arc::new(tx),
        }
    }

    /// Open the gate. Idempotent: the unset-to-open transition happens at
    /// most once, and further calls are no-ops.
    pub fn open(&self) {
        self.tx.send_if_modified(|open| {
            if *open {
                false
            } else {
                *open = true;
                true
            }
        });
    }

    /// Returns `true` if the gate has been opened.
    #[must_use]
    pub fn is_open(&self) -> bool {
        *self.tx.borrow()
    }

    /// Wait until the gate is open. Returns immediately if it already is.
    pub async fn opened(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives inside self, so the channel cannot close while
        // we hold it.
        let _ = rx.wait_for(|open| *open).await;
    }
}

impl Default for Gate {
    fn default() -> Self {
        Self::new()
    }
}
