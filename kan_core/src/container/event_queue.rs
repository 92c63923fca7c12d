//! Unbounded event queue over a crossbeam channel.
//!
//! The queue owns both halves of the channel: producers clone an
//! [`EventSender`], the owner drains accumulated events once per frame.

use crossbeam_channel::{unbounded, Receiver, Sender, TryIter};

pub struct EventQueue<T> {
    sender: Sender<T>,
    receiver: Receiver<T>,
}

pub struct EventSender<T>(Sender<T>);

impl<T> Clone for EventSender<T> {
    fn clone(&self) -> Self {
        EventSender(self.0.clone())
    }
}

impl<T> EventQueue<T> {
    pub fn new() -> Self {
        let (sender, receiver) = unbounded();
        EventQueue { sender, receiver }
    }

    pub fn sender(&self) -> EventSender<T> {
        EventSender(self.sender.clone())
    }

    pub fn emit(&self, event: T) {
        // The queue owns the receiver, so the send cannot fail.
        let _ = self.sender.send(event);
    }

    pub fn drain(&self) -> TryIter<'_, T> {
        self.receiver.try_iter()
    }

    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }
}

impl<T> Default for EventQueue<T> {
    fn default() -> Self {
        EventQueue::new()
    }
}

impl<T> EventSender<T> {
    pub fn emit(&self, event: T) {
        if self.0.send(event).is_err() {
            tracing::trace!("event dropped, queue owner is gone");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emit_and_drain() {
        let queue = EventQueue::new();
        queue.emit(1u32);
        queue.sender().emit(2u32);
        let drained: Vec<u32> = queue.drain().collect();
        assert_eq!(drained, vec![1, 2]);
        assert!(queue.is_empty());
    }

    #[test]
    fn sender_outliving_queue_is_harmless() {
        let queue = EventQueue::new();
        let sender = queue.sender();
        drop(queue);
        sender.emit(7u32);
    }
}
