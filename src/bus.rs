//! The message-passing primitive shared by every gateway.
//!
//! A bus is an unbounded FIFO with any number of producers and exactly one
//! consumer. It is the only synchronization primitive in this crate: gateways
//! accept requests on their bus, callers collect replies and notifications on
//! a bus of their own, and nothing else is ever shared between tasks.

use tokio::sync::mpsc;

/// Creates a connected [`Bus`]/[`Inbox`] pair.
pub fn channel<T>() -> (Bus<T>, Inbox<T>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Bus { tx }, Inbox { rx })
}

/// Producer half of a bus.
///
/// Cheap to clone; sends from one producer are delivered in order, sends from
/// concurrent producers interleave arbitrarily.
#[derive(Debug)]
pub struct Bus<T> {
    tx: mpsc::UnboundedSender<T>,
}

impl<T> Clone for Bus<T> {
    fn clone(&self) -> Self {
        Bus {
            tx: self.tx.clone(),
        }
    }
}

impl<T> Bus<T> {
    /// Enqueues a message without blocking.
    ///
    /// Never fails while the consumer lives. Once the consumer is gone the
    /// message is discarded: the receiving side has shut down and there is
    /// nobody left to inform.
    pub fn send(&self, msg: T) {
        let _ = self.tx.send(msg);
    }

    /// Whether the consuming [`Inbox`] has been dropped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Consumer half of a bus.
#[derive(Debug)]
pub struct Inbox<T> {
    rx: mpsc::UnboundedReceiver<T>,
}

impl<T> Inbox<T> {
    /// Receives the next message, waiting if the bus is empty.
    ///
    /// Returns `None` once every [`Bus`] clone has been dropped.
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    /// Takes the next message if one is already queued.
    pub fn try_recv(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }
}
