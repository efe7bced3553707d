//! Retained message store.
//!
//! Holds at most one message per exact topic: a retained publish
//! replaces the previous entry, and a retained publish with an empty
//! payload deletes it without being stored itself.

use tidemq_core::packet::Message;

use crate::tree::TopicTree;

#[derive(Default)]
pub struct RetainedStore {
    tree: TopicTree<Message>,
}

impl RetainedStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a retained publish: store the message, or drop the entry
    /// when the payload is empty.
    pub fn handle(&mut self, msg: &Message) {
        if msg.payload.is_empty() {
            self.tree.clear(&msg.topic);
        } else {
            self.tree.set(&msg.topic, msg.clone());
        }
    }

    /// Snapshot of all retained messages whose topics match the filter.
    pub fn search(&self, filter: &str) -> Vec<Message> {
        self.tree.search(filter)
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tidemq_core::packet::QoS;

    fn retained(topic: &str, payload: &'static [u8], qos: QoS) -> Message {
        Message {
            topic: topic.into(),
            payload: Bytes::from_static(payload),
            qos,
            retain: true,
        }
    }

    #[test]
    fn test_latest_message_wins() {
        let mut store = RetainedStore::new();
        assert!(store.search("foo").is_empty());

        let msg1 = retained("foo", b"bar", QoS::AtLeastOnce);
        store.handle(&msg1);
        assert_eq!(store.search("foo"), vec![msg1]);

        let msg2 = retained("foo", b"bar", QoS::ExactlyOnce);
        store.handle(&msg2);
        assert_eq!(store.search("foo"), vec![msg2]);
    }

    #[test]
    fn test_empty_payload_deletes() {
        let mut store = RetainedStore::new();
        store.handle(&retained("foo", b"bar", QoS::AtLeastOnce));
        assert_eq!(store.search("foo").len(), 1);

        store.handle(&retained("foo", b"", QoS::AtLeastOnce));
        assert!(store.search("foo").is_empty());
        assert!(store.is_empty());
    }

    #[test]
    fn test_search_with_wildcards() {
        let mut store = RetainedStore::new();
        store.handle(&retained("foo", b"a", QoS::AtMostOnce));
        store.handle(&retained("foo/bar", b"b", QoS::AtMostOnce));

        assert_eq!(store.search("#").len(), 2);
        assert_eq!(store.search("foo/+").len(), 1);
        assert_eq!(store.search("baz").len(), 0);
    }
}
