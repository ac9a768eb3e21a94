//! Bounded store-and-forward queue for a disconnected client.

use std::collections::VecDeque;

use serde_json::Value;
use tracing::warn;

use crate::message::{unix_timestamp, MessageType, WireMessage};

/// A message accepted while the connection was down.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingMessage {
    pub message_type: MessageType,
    pub payload: Value,
    /// UNIX seconds at enqueue time.
    pub enqueued_at: f64,
}

impl PendingMessage {
    pub fn new(message_type: MessageType, payload: Value) -> Self {
        Self {
            message_type,
            payload,
            enqueued_at: unix_timestamp(),
        }
    }

    /// Build the wire message for sending under `token`.
    pub fn to_wire(&self, token: &str) -> WireMessage {
        WireMessage::new(self.message_type.clone(), self.payload.clone()).with_token(token)
    }
}

/// FIFO with a fixed capacity. When full, the oldest entry is evicted.
#[derive(Debug)]
pub struct MessageQueue {
    items: VecDeque<PendingMessage>,
    capacity: usize,
    dropped: u64,
}

impl MessageQueue {
    /// A zero capacity is raised to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
            dropped: 0,
        }
    }

    /// Append a message, evicting the oldest one if full.
    ///
    /// Returns the evicted message, if any.
    pub fn push(&mut self, msg: PendingMessage) -> Option<PendingMessage> {
        let evicted = if self.items.len() >= self.capacity {
            self.items.pop_front()
        } else {
            None
        };
        if let Some(old) = &evicted {
            self.dropped += 1;
            warn!(
                message_type = %old.message_type,
                capacity = self.capacity,
                dropped_total = self.dropped,
                "Message queue full, dropping oldest"
            );
        }
        self.items.push_back(msg);
        evicted
    }

    /// Remove and return the oldest message.
    pub fn pop(&mut self) -> Option<PendingMessage> {
        self.items.pop_front()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total messages evicted since creation.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Put a message that could not be sent back at the head.
    ///
    /// If the queue filled up in the meantime the message is the oldest
    /// entry, so it is the one dropped.
    pub fn requeue_front(&mut self, msg: PendingMessage) {
        if self.items.len() >= self.capacity {
            self.dropped += 1;
            warn!(
                message_type = %msg.message_type,
                "Message queue full, dropping requeued message"
            );
            return;
        }
        self.items.push_front(msg);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn msg(n: u64) -> PendingMessage {
        PendingMessage::new(MessageType::parse("scan_progress"), json!({ "n": n }))
    }

    #[test]
    fn test_fifo_order() {
        let mut q = MessageQueue::new(10);
        for n in 0..3 {
            assert!(q.push(msg(n)).is_none());
        }
        let drained: Vec<u64> = std::iter::from_fn(|| q.pop())
            .map(|m| m.payload["n"].as_u64().unwrap())
            .collect();
        assert_eq!(drained, vec![0, 1, 2]);
    }

    #[test]
    fn test_overflow_keeps_most_recent_in_order() {
        let k = 5;
        let mut q = MessageQueue::new(k);
        for n in 0..12 {
            q.push(msg(n));
        }
        assert_eq!(q.len(), k);
        assert_eq!(q.dropped(), 7);
        let kept: Vec<u64> = std::iter::from_fn(|| q.pop())
            .map(|m| m.payload["n"].as_u64().unwrap())
            .collect();
        assert_eq!(kept, vec![7, 8, 9, 10, 11]);
    }

    #[test]
    fn test_push_returns_evicted() {
        let mut q = MessageQueue::new(1);
        q.push(msg(1));
        let evicted = q.push(msg(2)).unwrap();
        assert_eq!(evicted.payload["n"], 1);
        assert_eq!(q.pop().unwrap().payload["n"], 2);
    }

    #[test]
    fn test_requeue_front_goes_first_unless_full() {
        let mut q = MessageQueue::new(2);
        q.push(msg(2));
        q.requeue_front(msg(1));
        assert_eq!(q.pop().unwrap().payload["n"], 1);
        assert_eq!(q.pop().unwrap().payload["n"], 2);

        q.push(msg(3));
        q.push(msg(4));
        q.requeue_front(msg(0));
        assert_eq!(q.len(), 2);
        assert_eq!(q.dropped(), 1);
        assert_eq!(q.pop().unwrap().payload["n"], 3);
    }

    #[test]
    fn test_zero_capacity_raised() {
        let q = MessageQueue::new(0);
        assert_eq!(q.capacity(), 1);
    }

    #[test]
    fn test_to_wire_attaches_token() {
        let wire = msg(4).to_wire("tok");
        assert_eq!(wire.session_token.as_deref(), Some("tok"));
        assert_eq!(wire.payload, json!({"n": 4}));
    }
}
