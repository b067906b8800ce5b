//! Instrumented mailbox channels for the consensus worker.
//!
//! Thin wrappers around crossbeam channels that expose the queue depth and
//! delivery count of each mailbox as prometheus metrics, so an operator can
//! see a consensus worker falling behind its network feed.
#![warn(missing_docs)]
#![warn(unused_crate_dependencies)]

use crossbeam::channel::{Receiver, RecvError, RecvTimeoutError, SendError, Sender};
use prometheus::{Counter, Gauge};
use std::sync::Arc;
use std::time::Instant;
use tracing::log::warn;

/// Builds the two ends of an instrumented mailbox.
pub struct DbftChannel;

impl DbftChannel {
    /// Creates a mailbox, bounded when `capacity` is given.
    ///
    /// `name` keys the prometheus metrics of the mailbox and must be unique
    /// among live channels.
    #[allow(clippy::new_ret_no_self)]
    pub fn new<T>(name: String, capacity: Option<usize>) -> (DbftSender<T>, DbftReceiver<T>) {
        let (sender, receiver) = match capacity {
            Some(capacity) => crossbeam::channel::bounded::<T>(capacity),
            None => crossbeam::channel::unbounded::<T>(),
        };
        let queue_len = Gauge::new(
            format!("dbft_{}_queue_len", name),
            "number of messages waiting in the mailbox",
        )
        .expect("failed to create mailbox queue length gauge");
        let delivered = Counter::new(
            format!("dbft_{}_delivered_total", name),
            "number of messages delivered by the mailbox",
        )
        .expect("failed to create mailbox delivery counter");
        // fails when a live mailbox already uses this name
        if let Err(err) = prometheus::register(Box::new(queue_len.clone())) {
            warn!("failed to register queue length gauge of {}: {}", name, err);
        }
        if let Err(err) = prometheus::register(Box::new(delivered.clone())) {
            warn!("failed to register delivery counter of {}: {}", name, err);
        }
        (
            DbftSender {
                sender,
                queue_len: queue_len.clone(),
            },
            DbftReceiver {
                receiver,
                queue_len,
                delivered,
                ref_counter: Arc::new(()),
            },
        )
    }
}

/// Producing end of a mailbox, cloned by every thread that feeds the worker.
#[derive(Clone)]
pub struct DbftSender<T> {
    sender: Sender<T>,
    queue_len: Gauge,
}

impl<T> DbftSender<T> {
    /// Queues one message, failing when the consuming end is gone.
    pub fn send(&self, msg: T) -> Result<(), SendError<T>> {
        self.sender.send(msg)?;
        self.queue_len.inc();
        Ok(())
    }
}

/// Consuming end of a mailbox.
///
/// Dropping the last clone unregisters the metrics, freeing the mailbox name
/// for reuse.
#[derive(Clone)]
pub struct DbftReceiver<T> {
    receiver: Receiver<T>,
    queue_len: Gauge,
    delivered: Counter,
    ref_counter: Arc<()>,
}

impl<T> DbftReceiver<T> {
    fn account(&self, msg: T) -> T {
        // sampling the queue length is cheaper than pairing every send with
        // its receive
        self.queue_len.set(self.receiver.len() as f64);
        self.delivered.inc();
        msg
    }

    /// Blocks until a message arrives or every sender is gone.
    pub fn recv(&self) -> Result<T, RecvError> {
        self.receiver.recv().map(|msg| self.account(msg))
    }

    /// Blocks until a message arrives, every sender is gone, or `deadline`
    /// passes.
    pub fn recv_deadline(&self, deadline: Instant) -> Result<T, RecvTimeoutError> {
        self.receiver
            .recv_deadline(deadline)
            .map(|msg| self.account(msg))
    }
}

impl<T> Drop for DbftReceiver<T> {
    fn drop(&mut self) {
        if Arc::strong_count(&self.ref_counter) == 1 {
            let _ = prometheus::unregister(Box::new(self.queue_len.clone()));
            let _ = prometheus::unregister(Box::new(self.delivered.clone()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_mailbox_delivery_and_deadline() {
        let (sender, receiver) = DbftChannel::new::<u8>("test_mailbox".to_string(), Some(2));
        sender.send(7).unwrap();
        assert_eq!(receiver.recv().unwrap(), 7);
        let deadline = Instant::now() + Duration::from_millis(10);
        assert!(matches!(
            receiver.recv_deadline(deadline),
            Err(RecvTimeoutError::Timeout)
        ));
        drop(sender);
        assert!(matches!(receiver.recv(), Err(RecvError)));
    }
}
