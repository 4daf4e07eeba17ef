//! # Summary
//!
//! This module abstracts over internal connections between tasks.
//!
//! Currently backed by `tokio::sync::mpsc`: multiple-producer single-consumer
//! channels. Since the channels are unbounded, the only way for a send to fail
//! is if the receiving end has been dropped, which happens routinely when an
//! instance or a reconfiguration task is torn down. Sends therefore report
//! failure instead of panicking.

use tokio::sync::mpsc;

/// Intra-node receiving channel.
#[derive(Debug)]
pub struct Rx<T>(mpsc::UnboundedReceiver<T>);

/// Intra-node transmission channel. All clones send to the same receiving end.
#[derive(Derivative)]
#[derivative(Clone(bound = ""), Debug(bound = ""))]
pub struct Tx<T>(mpsc::UnboundedSender<T>);

/// Create a new pair of linked receiving and transmitting channels.
pub fn new<T>() -> (Rx<T>, Tx<T>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Rx(rx), Tx(tx))
}

impl<T> Tx<T> {
    /// Attempt to send a message through the channel.
    /// Returns false if the receiving end has been dropped.
    pub fn send(&self, message: T) -> bool {
        self.0.send(message).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.0.is_closed()
    }
}

impl<T> Rx<T> {
    /// Waits for the next message; `None` once every sender is gone.
    pub async fn recv(&mut self) -> Option<T> {
        self.0.recv().await
    }

    /// Discards everything currently queued, returning how many were dropped.
    pub fn drain(&mut self) -> usize {
        let mut dropped = 0;
        while self.0.try_recv().is_ok() {
            dropped += 1;
        }
        dropped
    }
}
