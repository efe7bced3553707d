//! Per-client session state.
//!
//! A session tracks everything that must survive between packets of one
//! MQTT conversation, and (for clean_session=false) across reconnects:
//!
//! - the packet identifier counter
//! - in-flight QoS 1 and QoS 2 publishes in both directions
//! - the subscription set and the will message
//!
//! Sessions are shared between the connection threads of a client or a
//! broker handler, so all state lives behind an internal mutex.

use std::collections::VecDeque;

use parking_lot::Mutex;

use crate::packet::{Message, Packet, Publish, QoS, Subscription};

/// Direction of an in-flight publish relative to the session owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Incoming,
    Outgoing,
}

/// Flow state of an in-flight publish.
///
/// Outbound QoS 1 stays in `AwaitingPuback` until acknowledged. Outbound
/// QoS 2 walks `AwaitingPubrec` -> `AwaitingPubcomp`. Inbound QoS 2 sits
/// in `AwaitingPubrel` from the PUBREC we sent until the peer's PUBREL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowState {
    AwaitingPuback,
    AwaitingPubrec,
    AwaitingPubcomp,
    AwaitingPubrel,
}

/// One entry of the in-flight store.
#[derive(Debug, Clone)]
pub struct Inflight {
    pub direction: Direction,
    pub state: FlowState,
    pub publish: Publish,
}

#[derive(Debug)]
struct Inner {
    clean_session: bool,
    next_id: u16,
    /// Outbound entries in original send order (resend order).
    outgoing: VecDeque<Inflight>,
    /// Inbound QoS 2 entries awaiting PUBREL.
    incoming: VecDeque<Inflight>,
    subscriptions: Vec<Subscription>,
    will: Option<Message>,
}

/// Session state for one client identifier.
#[derive(Debug)]
pub struct Session {
    client_id: String,
    inner: Mutex<Inner>,
}

impl Session {
    pub fn new(client_id: impl Into<String>, clean_session: bool) -> Self {
        Self {
            client_id: client_id.into(),
            inner: Mutex::new(Inner {
                clean_session,
                next_id: 1,
                outgoing: VecDeque::new(),
                incoming: VecDeque::new(),
                subscriptions: Vec::new(),
                will: None,
            }),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn clean_session(&self) -> bool {
        self.inner.lock().clean_session
    }

    /// Update the clean-session flag on reconnect; a returning client
    /// may ask for different session semantics than it did before.
    pub fn set_clean_session(&self, clean_session: bool) {
        self.inner.lock().clean_session = clean_session;
    }

    /// Allocate the next packet identifier.
    ///
    /// Identifiers are 16-bit, never zero, wrap from 65535 back to 1 and
    /// skip any id still present in the outbound in-flight store.
    pub fn next_packet_id(&self) -> u16 {
        let mut inner = self.inner.lock();
        let mut candidate = inner.next_id;
        loop {
            if candidate != 0 && !inner.outgoing.iter().any(|r| r.publish.packet_id == Some(candidate)) {
                break;
            }
            candidate = candidate.wrapping_add(1);
        }
        inner.next_id = match candidate.wrapping_add(1) {
            0 => 1,
            id => id,
        };
        candidate
    }

    /// Store an outbound QoS 1/2 publish until it is acknowledged.
    pub fn store_outgoing(&self, publish: Publish) {
        let state = match publish.qos {
            QoS::AtMostOnce => return,
            QoS::AtLeastOnce => FlowState::AwaitingPuback,
            QoS::ExactlyOnce => FlowState::AwaitingPubrec,
        };
        self.inner.lock().outgoing.push_back(Inflight {
            direction: Direction::Outgoing,
            state,
            publish,
        });
    }

    /// Complete an outbound QoS 1 publish. Returns false for unknown or
    /// already-acknowledged identifiers.
    pub fn handle_puback(&self, packet_id: u16) -> bool {
        let mut inner = self.inner.lock();
        match inner
            .outgoing
            .iter()
            .position(|r| r.publish.packet_id == Some(packet_id) && r.state == FlowState::AwaitingPuback)
        {
            Some(pos) => {
                inner.outgoing.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Advance an outbound QoS 2 publish past PUBREC. Returns true only
    /// on the first PUBREC; duplicates after PUBREL return false.
    pub fn handle_pubrec(&self, packet_id: u16) -> bool {
        let mut inner = self.inner.lock();
        match inner
            .outgoing
            .iter_mut()
            .find(|r| r.publish.packet_id == Some(packet_id) && r.state == FlowState::AwaitingPubrec)
        {
            Some(record) => {
                record.state = FlowState::AwaitingPubcomp;
                true
            }
            None => false,
        }
    }

    /// Complete an outbound QoS 2 publish.
    pub fn handle_pubcomp(&self, packet_id: u16) -> bool {
        let mut inner = self.inner.lock();
        match inner
            .outgoing
            .iter()
            .position(|r| r.publish.packet_id == Some(packet_id) && r.state == FlowState::AwaitingPubcomp)
        {
            Some(pos) => {
                inner.outgoing.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Record an inbound QoS 2 publish. Returns false when the id is
    /// already tracked, in which case the payload must not be delivered
    /// again.
    pub fn store_incoming(&self, publish: Publish) -> bool {
        let Some(id) = publish.packet_id else {
            return false;
        };
        let mut inner = self.inner.lock();
        if inner.incoming.iter().any(|r| r.publish.packet_id == Some(id)) {
            return false;
        }
        inner.incoming.push_back(Inflight {
            direction: Direction::Incoming,
            state: FlowState::AwaitingPubrel,
            publish,
        });
        true
    }

    /// Release an inbound QoS 2 publish on PUBREL.
    pub fn handle_pubrel(&self, packet_id: u16) -> bool {
        let mut inner = self.inner.lock();
        match inner
            .incoming
            .iter()
            .position(|r| r.publish.packet_id == Some(packet_id))
        {
            Some(pos) => {
                inner.incoming.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Packets to re-send after a resumed connection, in original order:
    /// unacknowledged PUBLISHes with the duplicate flag set, and PUBRELs
    /// for QoS 2 flows that already saw a PUBREC.
    pub fn packets_to_resend(&self) -> Vec<Packet> {
        let inner = self.inner.lock();
        inner
            .outgoing
            .iter()
            .map(|record| match record.state {
                FlowState::AwaitingPubcomp => Packet::Pubrel {
                    // Entries without an id are never stored.
                    packet_id: record.publish.packet_id.unwrap_or_default(),
                },
                _ => {
                    let mut publish = record.publish.clone();
                    publish.dup = true;
                    Packet::Publish(publish)
                }
            })
            .collect()
    }

    /// Number of tracked in-flight entries for one direction.
    pub fn inflight_len(&self, direction: Direction) -> usize {
        let inner = self.inner.lock();
        match direction {
            Direction::Outgoing => inner.outgoing.len(),
            Direction::Incoming => inner.incoming.len(),
        }
    }

    /// Look up an in-flight entry by packet id.
    pub fn lookup_inflight(&self, direction: Direction, packet_id: u16) -> Option<Inflight> {
        let inner = self.inner.lock();
        let queue = match direction {
            Direction::Outgoing => &inner.outgoing,
            Direction::Incoming => &inner.incoming,
        };
        queue
            .iter()
            .find(|r| r.publish.packet_id == Some(packet_id))
            .cloned()
    }

    /// Store a subscription, replacing any previous one for the same
    /// topic filter.
    pub fn save_subscription(&self, subscription: Subscription) {
        let mut inner = self.inner.lock();
        inner
            .subscriptions
            .retain(|s| s.topic != subscription.topic);
        inner.subscriptions.push(subscription);
    }

    pub fn lookup_subscription(&self, topic: &str) -> Option<Subscription> {
        self.inner
            .lock()
            .subscriptions
            .iter()
            .find(|s| s.topic == topic)
            .cloned()
    }

    pub fn delete_subscription(&self, topic: &str) {
        self.inner.lock().subscriptions.retain(|s| s.topic != topic);
    }

    pub fn all_subscriptions(&self) -> Vec<Subscription> {
        self.inner.lock().subscriptions.clone()
    }

    pub fn save_will(&self, will: Message) {
        self.inner.lock().will = Some(will);
    }

    pub fn lookup_will(&self) -> Option<Message> {
        self.inner.lock().will.clone()
    }

    pub fn clear_will(&self) {
        self.inner.lock().will = None;
    }

    /// Drop all session state, as on a clean-session connect.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.next_id = 1;
        inner.outgoing.clear();
        inner.incoming.clear();
        inner.subscriptions.clear();
        inner.will = None;
    }
}
