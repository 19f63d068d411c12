//! Cooperative cancellation.

use tokio::sync::watch;

/// Fires a [`CancelSignal`].
#[derive(Debug)]
pub struct Canceller {
    sender: watch::Sender<bool>,
}

impl Canceller {
    /// Request cancellation. Work already in progress is allowed to finish.
    pub fn cancel(&self) {
        self.sender.send_replace(true);
    }
}

/// A cheaply cloneable flag that long-running work checks at stage
/// boundaries.
#[derive(Clone, Debug)]
pub struct CancelSignal {
    receiver: watch::Receiver<bool>,
}

impl CancelSignal {
    /// Create a connected [`Canceller`] and [`CancelSignal`].
    pub fn new() -> (Canceller, CancelSignal) {
        let (sender, receiver) = watch::channel(false);
        (Canceller { sender }, CancelSignal { receiver })
    }

    /// A signal that never fires.
    pub fn never() -> CancelSignal {
        // A receiver keeps the last value after its sender is dropped.
        let (_canceller, signal) = Self::new();
        signal
    }

    /// Has cancellation been requested?
    pub fn is_cancelled(&self) -> bool {
        *self.receiver.borrow()
    }
}
