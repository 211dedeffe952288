//! Bounded queues connecting the reader, workers and the controller.

use crate::batch::Batch;
use crate::error::{Error, Result};
use async_channel::{Receiver, Sender, TrySendError};

/// Item carried by the batch queues.
#[derive(Debug)]
pub enum Message {
    Batch(Batch),
    /// The producer will send nothing more.
    EndOfStream,
}

/// Bounded MPMC queue used from plain threads.
#[derive(Debug, Clone)]
pub struct Queue {
    tx: Sender<Message>,
    rx: Receiver<Message>,
}

impl Queue {
    pub fn bounded(capacity: usize) -> Self {
        let (tx, rx) = async_channel::bounded(capacity.max(1));
        Self { tx, rx }
    }

    /// Block until there is room. Fails once the queue is closed.
    pub fn send(&self, message: Message) -> Result<()> {
        self.tx
            .send_blocking(message)
            .map_err(|_| Error::Pipeline("queue closed".to_string()))
    }

    /// Send without blocking; returns whether the message was queued.
    pub fn try_send(&self, message: Message) -> bool {
        match self.tx.try_send(message) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) | Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Block until a message arrives. Fails once the queue is closed and drained.
    pub fn recv(&self) -> Result<Message> {
        self.rx
            .recv_blocking()
            .map_err(|_| Error::Pipeline("queue closed".to_string()))
    }

    /// Wake every blocked sender and receiver.
    pub fn close(&self) {
        self.tx.close();
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

/// Error side channel. Any role may report; the controller drains it.
#[derive(Debug, Clone)]
pub struct ErrorQueue {
    tx: Sender<Error>,
    rx: Receiver<Error>,
}

impl ErrorQueue {
    pub fn bounded(capacity: usize) -> Self {
        let (tx, rx) = async_channel::bounded(capacity.max(1));
        Self { tx, rx }
    }

    /// Report an error without blocking. When the queue is full the run is
    /// already failing, so the extra error is only logged.
    pub fn push(&self, error: Error) {
        if let Err(e) = self.tx.try_send(error) {
            tracing::warn!("Dropping secondary pipeline error: {}", e.into_inner());
        }
    }

    /// Whether any role has reported an error.
    pub fn signalled(&self) -> bool {
        !self.rx.is_empty()
    }

    /// Take the oldest reported error.
    pub fn take(&self) -> Option<Error> {
        self.rx.try_recv().ok()
    }

    pub fn close(&self) {
        self.tx.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_end_of_stream_is_delivered_in_order() {
        let queue = Queue::bounded(2);
        queue.send(Message::Batch(Batch::new(["a"]))).unwrap();
        queue.send(Message::EndOfStream).unwrap();
        assert!(matches!(queue.recv().unwrap(), Message::Batch(_)));
        assert!(matches!(queue.recv().unwrap(), Message::EndOfStream));
    }

    #[test]
    fn test_try_send_on_full_queue() {
        let queue = Queue::bounded(1);
        assert!(queue.try_send(Message::EndOfStream));
        assert!(!queue.try_send(Message::EndOfStream));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_close_unblocks_sender() {
        let queue = Queue::bounded(1);
        queue.send(Message::EndOfStream).unwrap();

        let blocked = queue.clone();
        let handle = thread::spawn(move || blocked.send(Message::EndOfStream));
        queue.close();
        assert!(handle.join().unwrap().is_err());
    }

    #[test]
    fn test_error_queue_keeps_first_error() {
        let errors = ErrorQueue::bounded(1);
        assert!(!errors.signalled());
        errors.push(Error::Pipeline("first".to_string()));
        errors.push(Error::Pipeline("second".to_string()));
        assert!(errors.signalled());
        assert!(matches!(errors.take(), Some(Error::Pipeline(m)) if m == "first"));
        assert!(errors.take().is_none());
    }
}
