use crate::client::MqttMessage;
use std::collections::VecDeque;
use tracing::debug;

/// Bounded in-memory FIFO holding publishes issued while the broker session
/// is down. Not a durable queue: the oldest entry is dropped when full, and
/// a failed drain discards the remainder.
#[derive(Debug)]
pub struct Backlog {
    items: VecDeque<MqttMessage>,
    max_size: usize,
}

impl Backlog {
    pub fn new(max_size: usize) -> Self {
        Self {
            items: VecDeque::new(),
            max_size: max_size.max(1),
        }
    }

    pub fn enqueue(&mut self, message: MqttMessage) {
        if self.items.len() >= self.max_size {
            if let Some(dropped) = self.items.pop_front() {
                debug!(topic = %dropped.topic, "backlog full, dropping oldest message");
            }
        }
        self.items.push_back(message);
    }

    pub fn dequeue(&mut self) -> Option<MqttMessage> {
        self.items.pop_front()
    }

    pub fn clear(&mut self) -> usize {
        let dropped = self.items.len();
        self.items.clear();
        dropped
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(topic: &str, payload: &str) -> MqttMessage {
        MqttMessage {
            topic: topic.to_string(),
            payload: payload.as_bytes().to_vec(),
            qos: 1,
            retain: false,
        }
    }

    #[test]
    fn drains_in_insertion_order() {
        let mut backlog = Backlog::new(4);
        backlog.enqueue(message("T1", "a"));
        backlog.enqueue(message("T2", "b"));
        backlog.enqueue(message("T1", "c"));

        let drained: Vec<_> = std::iter::from_fn(|| backlog.dequeue())
            .map(|m| (m.topic, String::from_utf8(m.payload).unwrap()))
            .collect();
        assert_eq!(
            drained,
            vec![
                ("T1".to_string(), "a".to_string()),
                ("T2".to_string(), "b".to_string()),
                ("T1".to_string(), "c".to_string()),
            ]
        );
    }

    #[test]
    fn overflow_drops_the_oldest() {
        let mut backlog = Backlog::new(2);
        backlog.enqueue(message("T", "a"));
        backlog.enqueue(message("T", "b"));
        backlog.enqueue(message("T", "c"));

        assert_eq!(backlog.len(), 2);
        assert_eq!(String::from_utf8(backlog.dequeue().unwrap().payload).unwrap(), "b");
        assert_eq!(String::from_utf8(backlog.dequeue().unwrap().payload).unwrap(), "c");
        assert!(backlog.is_empty());
    }
}
