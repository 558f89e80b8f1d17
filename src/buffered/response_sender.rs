use std::collections::VecDeque;

use bytes::Bytes;
use tokio::task::JoinHandle;

/// The outgoing queue for a single response receiver.
///
/// Messages are delivered strictly in FIFO order by at most one delivery loop at any given time:
///  [ResponseMessageSender::begin_sending] hands out the right to run the loop, and the loop
///  gives it back when the queue is drained or the receiver goes offline. The queue head is
///  removed only after it was handed to the underlying channel successfully, so a failed
///  attempt is retried with the same message once the receiver is back.
///
/// NB: This is plain data without synchronization - it lives inside its
///      [super::receiver_context::ResponseReceiverContext], which is guarded by the input
///      channel's lock. The delivery loop itself lives in the input channel.
#[derive(Default)]
pub struct ResponseMessageSender {
    queue: VecDeque<Bytes>,
    is_sending: bool,
    task: Option<JoinHandle<()>>,
}

impl ResponseMessageSender {
    pub fn enqueue(&mut self, message: Bytes) {
        self.queue.push_back(message);
    }

    /// puts `messages` in front of the queue, preserving their order
    pub fn prepend(&mut self, messages: Vec<Bytes>) {
        for message in messages.into_iter().rev() {
            self.queue.push_front(message);
        }
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// returns `true` if the caller is now responsible for running the delivery loop
    pub fn begin_sending(&mut self) -> bool {
        if self.is_sending || self.queue.is_empty() {
            return false;
        }
        self.is_sending = true;
        true
    }

    /// Returns the message at the head of the queue without removing it. If the queue is
    ///  empty, the delivery loop is finished.
    pub fn next_message(&mut self) -> Option<Bytes> {
        let next = self.queue.front().cloned();
        if next.is_none() {
            self.is_sending = false;
        }
        next
    }

    pub fn confirm_sent(&mut self) {
        self.queue.pop_front();
    }

    /// the delivery loop terminates although there may be messages left, e.g. because the
    ///  response receiver went offline
    pub fn finish_sending(&mut self) {
        self.is_sending = false;
    }

    pub fn set_task(&mut self, handle: JoinHandle<()>) {
        self.task = Some(handle);
    }

    pub fn take_task(&mut self) -> Option<JoinHandle<()>> {
        self.task.take()
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    fn msg(s: &'static str) -> Bytes {
        Bytes::from_static(s.as_bytes())
    }

    #[test]
    fn test_single_delivery_loop() {
        let mut sender = ResponseMessageSender::default();
        assert!(!sender.begin_sending());

        sender.enqueue(msg("a"));
        assert!(sender.begin_sending());
        assert!(!sender.begin_sending());

        assert_eq!(sender.next_message(), Some(msg("a")));
        sender.confirm_sent();
        assert_eq!(sender.next_message(), None);
        assert_eq!(sender.len(), 0);

        // the loop finished, so the next message needs a new one
        sender.enqueue(msg("b"));
        assert!(sender.begin_sending());
    }

    #[test]
    fn test_failed_attempt_keeps_head() {
        let mut sender = ResponseMessageSender::default();
        sender.enqueue(msg("a"));
        sender.enqueue(msg("b"));

        assert!(sender.begin_sending());
        assert_eq!(sender.next_message(), Some(msg("a")));
        sender.finish_sending();

        assert!(sender.begin_sending());
        assert_eq!(sender.next_message(), Some(msg("a")));
        sender.confirm_sent();
        assert_eq!(sender.next_message(), Some(msg("b")));
        assert_eq!(sender.len(), 1);
    }

    #[test]
    fn test_prepend_preserves_order() {
        let mut sender = ResponseMessageSender::default();
        sender.enqueue(msg("own"));
        sender.prepend(vec![msg("b1"), msg("b2")]);

        let mut drained = Vec::new();
        assert!(sender.begin_sending());
        while let Some(m) = sender.next_message() {
            drained.push(m);
            sender.confirm_sent();
        }
        assert_eq!(drained, vec![msg("b1"), msg("b2"), msg("own")]);
    }
}
