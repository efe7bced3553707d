//! Broker-side state: sessions, retained messages and the subscription
//! index.
//!
//! A [`Backend`] owns everything shared between connection handlers.
//! Handlers identify themselves with a [`ClientHandle`] holding their
//! delivery queue; the backend routes published messages into those
//! queues and never touches a transport directly.
//!
//! Lock ordering, where locks nest: retained store before subscription
//! index before connection table. Holding the retained lock across both
//! the store step and the fanout (and, on subscribe, across the bind and
//! the snapshot) is what keeps retained replay and live delivery from
//! duplicating a message for a freshly subscribing client.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ahash::AHashMap;
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::Mutex;

use tidemq_core::packet::{Message, QoS, Subscription};
use tidemq_core::session::Session;

use crate::config::BrokerConfig;
use crate::error::Result;
use crate::retained::RetainedStore;
use crate::tree::TopicTree;

/// Delivery endpoint of one live connection.
#[derive(Clone)]
pub struct ClientHandle {
    id: u64,
    deliveries: Sender<Message>,
    close: Sender<()>,
}

impl ClientHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Ask the owning connection handler to shut down (takeover).
    pub fn signal_close(&self) {
        let _ = self.close.try_send(());
    }
}

/// Broker-side state shared by all connection handlers.
pub trait Backend: Send + Sync {
    /// Allocate a delivery handle for a new connection, together with
    /// the receiving ends of its delivery queue and close signal.
    fn create_handle(&self) -> (ClientHandle, Receiver<Message>, Receiver<()>);

    /// Return the session for a client identifier, creating it if
    /// needed. The bool is true when an existing session was resumed.
    /// An empty client identifier always yields a fresh anonymous
    /// session that is never indexed. If the session is currently bound
    /// to another live connection, that connection is signalled to close
    /// and receives no further deliveries.
    fn get_session(&self, client: &ClientHandle, client_id: &str) -> Result<(Arc<Session>, bool)>;

    /// Publish a message: update the retained store when the retain flag
    /// is set, then deliver to every matching subscription at the lesser
    /// of the published and subscribed qos.
    fn publish(&self, msg: &Message) -> Result<()>;

    /// Record a subscription and return the retained messages its filter
    /// matches, each capped to the requested qos.
    fn subscribe(
        &self,
        client: &ClientHandle,
        session: &Arc<Session>,
        subscription: &Subscription,
    ) -> Result<Vec<Message>>;

    /// Re-bind the stored subscriptions of a resumed session to a new
    /// connection. Unlike [`subscribe`](Backend::subscribe) this replays
    /// no retained messages; resuming a session is not a SUBSCRIBE.
    fn restore_subscriptions(
        &self,
        client: &ClientHandle,
        session: &Arc<Session>,
    ) -> Result<()>;

    /// Remove a subscription.
    fn unsubscribe(
        &self,
        client: &ClientHandle,
        session: &Arc<Session>,
        filter: &str,
    ) -> Result<()>;

    /// Detach a connection. A non-graceful termination publishes the
    /// session's will; the will is dropped either way. Clean and
    /// anonymous sessions are removed from the session table.
    fn terminate(&self, client: &ClientHandle, session: &Arc<Session>, graceful: bool)
        -> Result<()>;
}

/// A subscription binding in the index: the connection it delivers to
/// and the granted qos cap.
#[derive(Debug, Clone, Copy)]
struct Binding {
    conn: u64,
    qos: QoS,
}

#[derive(Default)]
struct ConnectionTable {
    handles: AHashMap<u64, ClientHandle>,
    /// client id -> connection currently bound to it
    owners: AHashMap<String, u64>,
}

/// The default, fully in-memory backend.
pub struct MemoryBackend {
    queue_size: usize,
    next_conn_id: AtomicU64,
    retained: Mutex<RetainedStore>,
    subscriptions: Mutex<TopicTree<Binding>>,
    connections: Mutex<ConnectionTable>,
    sessions: Mutex<AHashMap<String, Arc<Session>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::with_config(&BrokerConfig::default())
    }

    pub fn with_config(config: &BrokerConfig) -> Self {
        Self {
            queue_size: config.queue_size,
            next_conn_id: AtomicU64::new(1),
            retained: Mutex::new(RetainedStore::new()),
            subscriptions: Mutex::new(TopicTree::new()),
            connections: Mutex::new(ConnectionTable::default()),
            sessions: Mutex::new(AHashMap::new()),
        }
    }

    /// Number of stored (non-anonymous) sessions.
    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for MemoryBackend {
    fn create_handle(&self) -> (ClientHandle, Receiver<Message>, Receiver<()>) {
        let (deliveries_tx, deliveries_rx) = bounded(self.queue_size);
        let (close_tx, close_rx) = bounded(1);
        let handle = ClientHandle {
            id: self.next_conn_id.fetch_add(1, Ordering::Relaxed),
            deliveries: deliveries_tx,
            close: close_tx,
        };
        (handle, deliveries_rx, close_rx)
    }

    fn get_session(&self, client: &ClientHandle, client_id: &str) -> Result<(Arc<Session>, bool)> {
        let mut connections = self.connections.lock();
        connections.handles.insert(client.id, client.clone());

        if client_id.is_empty() {
            // Anonymous sessions are never indexed and never resumed.
            return Ok((Arc::new(Session::new("", true)), false));
        }

        if let Some(prev) = connections.owners.insert(client_id.to_string(), client.id) {
            if prev != client.id {
                if let Some(old) = connections.handles.remove(&prev) {
                    log::info!("session takeover for client '{}'", client_id);
                    old.signal_close();
                }
            }
        }
        drop(connections);

        let mut sessions = self.sessions.lock();
        match sessions.get(client_id) {
            Some(existing) => Ok((existing.clone(), true)),
            None => {
                let session = Arc::new(Session::new(client_id, false));
                sessions.insert(client_id.to_string(), session.clone());
                Ok((session, false))
            }
        }
    }

    fn publish(&self, msg: &Message) -> Result<()> {
        // The retained lock spans the store update and the fanout so a
        // concurrent subscribe sees either the pre-publish snapshot or
        // the post-publish one, never a message twice.
        let mut retained = self.retained.lock();
        if msg.retain {
            retained.handle(msg);
        }

        let bindings = self.subscriptions.lock().match_topic(&msg.topic);
        if bindings.is_empty() {
            return Ok(());
        }

        let connections = self.connections.lock();
        for binding in bindings {
            let Some(handle) = connections.handles.get(&binding.conn) else {
                continue;
            };

            let mut out = msg.clone();
            out.qos = msg.qos.min(binding.qos);
            out.retain = false;

            match handle.deliveries.try_send(out) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    log::warn!(
                        "delivery queue full for connection {}, dropping message on '{}'",
                        binding.conn,
                        msg.topic
                    );
                }
                Err(TrySendError::Disconnected(_)) => {}
            }
        }

        Ok(())
    }

    fn subscribe(
        &self,
        client: &ClientHandle,
        session: &Arc<Session>,
        subscription: &Subscription,
    ) -> Result<Vec<Message>> {
        let retained = self.retained.lock();

        self.subscriptions.lock().add(
            &subscription.topic,
            Binding {
                conn: client.id,
                qos: subscription.qos,
            },
        );
        session.save_subscription(subscription.clone());

        let mut replay = retained.search(&subscription.topic);
        for msg in &mut replay {
            msg.qos = msg.qos.min(subscription.qos);
        }
        Ok(replay)
    }

    fn restore_subscriptions(
        &self,
        client: &ClientHandle,
        session: &Arc<Session>,
    ) -> Result<()> {
        let mut subscriptions = self.subscriptions.lock();
        for sub in session.all_subscriptions() {
            subscriptions.add(
                &sub.topic,
                Binding {
                    conn: client.id,
                    qos: sub.qos,
                },
            );
        }
        Ok(())
    }

    fn unsubscribe(
        &self,
        client: &ClientHandle,
        session: &Arc<Session>,
        filter: &str,
    ) -> Result<()> {
        self.subscriptions
            .lock()
            .remove(filter, |b| b.conn == client.id);
        session.delete_subscription(filter);
        Ok(())
    }

    fn terminate(
        &self,
        client: &ClientHandle,
        session: &Arc<Session>,
        graceful: bool,
    ) -> Result<()> {
        // After a takeover the session belongs to another connection;
        // the loser must not tear down shared state.
        let taken_over = {
            let mut connections = self.connections.lock();
            connections.handles.remove(&client.id);
            let owner = connections.owners.get(session.client_id()).copied();
            if owner == Some(client.id) {
                connections.owners.remove(session.client_id());
            }
            owner.is_some() && owner != Some(client.id)
        };
        self.subscriptions.lock().retain(|b| b.conn != client.id);

        if taken_over {
            return Ok(());
        }

        if !graceful {
            if let Some(will) = session.lookup_will() {
                if let Err(e) = self.publish(&will) {
                    log::warn!(
                        "failed to publish will for client '{}': {}",
                        session.client_id(),
                        e
                    );
                }
            }
        }
        session.clear_will();

        if session.clean_session() || session.client_id().is_empty() {
            self.sessions.lock().remove(session.client_id());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn msg(topic: &str, payload: &'static [u8], qos: QoS, retain: bool) -> Message {
        Message {
            topic: topic.into(),
            payload: Bytes::from_static(payload),
            qos,
            retain,
        }
    }

    #[test]
    fn test_get_session_identity() {
        let backend = MemoryBackend::new();
        let (c1, _d1, _k1) = backend.create_handle();

        let (s1, resumed) = backend.get_session(&c1, "foo").unwrap();
        assert!(!resumed);

        let (s2, resumed) = backend.get_session(&c1, "foo").unwrap();
        assert!(resumed);
        assert!(Arc::ptr_eq(&s1, &s2));

        let (s3, resumed) = backend.get_session(&c1, "bar").unwrap();
        assert!(!resumed);
        assert!(!Arc::ptr_eq(&s1, &s3));

        // Anonymous sessions are always fresh.
        let (s4, resumed) = backend.get_session(&c1, "").unwrap();
        assert!(!resumed);
        let (s5, resumed) = backend.get_session(&c1, "").unwrap();
        assert!(!resumed);
        assert!(!Arc::ptr_eq(&s4, &s5));
    }

    #[test]
    fn test_takeover_signals_previous_connection() {
        let backend = MemoryBackend::new();
        let (c1, d1, k1) = backend.create_handle();
        let (c2, _d2, _k2) = backend.create_handle();

        let (s1, _) = backend.get_session(&c1, "alice").unwrap();
        backend
            .subscribe(&c1, &s1, &Subscription::new("news", QoS::AtMostOnce))
            .unwrap();

        let (s2, resumed) = backend.get_session(&c2, "alice").unwrap();
        assert!(resumed);
        assert!(Arc::ptr_eq(&s1, &s2));

        // The first connection was told to close...
        assert!(k1.try_recv().is_ok());

        // ...and receives no further deliveries.
        backend
            .publish(&msg("news", b"hello", QoS::AtMostOnce, false))
            .unwrap();
        assert!(d1.try_recv().is_err());
    }

    #[test]
    fn test_retained_replay() {
        let backend = MemoryBackend::new();
        let (c1, _d1, _k1) = backend.create_handle();
        let (session, _) = backend.get_session(&c1, "sub").unwrap();

        // Empty store yields nothing.
        let msgs = backend
            .subscribe(&c1, &session, &Subscription::new("foo", QoS::ExactlyOnce))
            .unwrap();
        assert!(msgs.is_empty());

        backend
            .publish(&msg("foo", b"bar", QoS::AtLeastOnce, true))
            .unwrap();

        // Replay is capped to min(published, subscribed).
        let msgs = backend
            .subscribe(&c1, &session, &Subscription::new("foo", QoS::ExactlyOnce))
            .unwrap();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].qos, QoS::AtLeastOnce);
        assert_eq!(msgs[0].payload.as_ref(), b"bar");

        backend
            .publish(&msg("foo/bar", b"baz", QoS::AtLeastOnce, true))
            .unwrap();
        let msgs = backend
            .subscribe(&c1, &session, &Subscription::new("#", QoS::ExactlyOnce))
            .unwrap();
        assert_eq!(msgs.len(), 2);

        // Replacement keeps only the latest message per topic.
        backend
            .publish(&msg("foo", b"bar2", QoS::ExactlyOnce, true))
            .unwrap();
        let msgs = backend
            .subscribe(&c1, &session, &Subscription::new("foo", QoS::AtMostOnce))
            .unwrap();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].payload.as_ref(), b"bar2");
        assert_eq!(msgs[0].qos, QoS::AtMostOnce);

        // An empty retained payload clears the entry.
        backend
            .publish(&msg("foo", b"", QoS::AtLeastOnce, true))
            .unwrap();
        let msgs = backend
            .subscribe(&c1, &session, &Subscription::new("foo", QoS::ExactlyOnce))
            .unwrap();
        assert!(msgs.is_empty());
    }

    #[test]
    fn test_publish_delivers_with_qos_cap() {
        let backend = MemoryBackend::new();
        let (c1, d1, _k1) = backend.create_handle();
        let (session, _) = backend.get_session(&c1, "sub").unwrap();

        backend
            .subscribe(&c1, &session, &Subscription::new("a/+", QoS::AtLeastOnce))
            .unwrap();
        backend
            .publish(&msg("a/b", b"x", QoS::ExactlyOnce, false))
            .unwrap();

        let delivered = d1.try_recv().unwrap();
        assert_eq!(delivered.topic, "a/b");
        assert_eq!(delivered.qos, QoS::AtLeastOnce);
        assert!(!delivered.retain);

        // One delivery per matching subscription.
        backend
            .subscribe(&c1, &session, &Subscription::new("a/#", QoS::AtMostOnce))
            .unwrap();
        backend
            .publish(&msg("a/b", b"y", QoS::AtMostOnce, false))
            .unwrap();
        assert!(d1.try_recv().is_ok());
        assert!(d1.try_recv().is_ok());
        assert!(d1.try_recv().is_err());
    }

    #[test]
    fn test_queue_full_drops_without_failing() {
        let config = BrokerConfig {
            queue_size: 1,
            ..Default::default()
        };
        let backend = MemoryBackend::with_config(&config);
        let (c1, d1, _k1) = backend.create_handle();
        let (session, _) = backend.get_session(&c1, "slow").unwrap();

        backend
            .subscribe(&c1, &session, &Subscription::new("t", QoS::AtMostOnce))
            .unwrap();

        backend.publish(&msg("t", b"1", QoS::AtMostOnce, false)).unwrap();
        // The queue holds one message; the second is dropped, not an error.
        backend.publish(&msg("t", b"2", QoS::AtMostOnce, false)).unwrap();

        assert_eq!(d1.try_recv().unwrap().payload.as_ref(), b"1");
        assert!(d1.try_recv().is_err());
    }

    #[test]
    fn test_terminate_publishes_will_when_ungraceful() {
        let backend = MemoryBackend::new();
        let (c1, _d1, _k1) = backend.create_handle();
        let (dying, _) = backend.get_session(&c1, "dying").unwrap();
        dying.save_will(msg("wills", b"gone", QoS::AtMostOnce, false));

        let (c2, d2, _k2) = backend.create_handle();
        let (watcher, _) = backend.get_session(&c2, "watcher").unwrap();
        backend
            .subscribe(&c2, &watcher, &Subscription::new("wills", QoS::AtMostOnce))
            .unwrap();

        backend.terminate(&c1, &dying, false).unwrap();
        assert_eq!(d2.try_recv().unwrap().payload.as_ref(), b"gone");
        assert!(dying.lookup_will().is_none());
    }

    #[test]
    fn test_terminate_graceful_drops_will() {
        let backend = MemoryBackend::new();
        let (c1, _d1, _k1) = backend.create_handle();
        let (dying, _) = backend.get_session(&c1, "dying").unwrap();
        dying.save_will(msg("wills", b"gone", QoS::AtMostOnce, false));

        let (c2, d2, _k2) = backend.create_handle();
        let (watcher, _) = backend.get_session(&c2, "watcher").unwrap();
        backend
            .subscribe(&c2, &watcher, &Subscription::new("wills", QoS::AtMostOnce))
            .unwrap();

        backend.terminate(&c1, &dying, true).unwrap();
        assert!(d2.try_recv().is_err());
        assert!(dying.lookup_will().is_none());
    }

    #[test]
    fn test_terminate_removes_subscriptions_and_clean_sessions() {
        let backend = MemoryBackend::new();
        let (c1, d1, _k1) = backend.create_handle();
        let (session, _) = backend.get_session(&c1, "foo").unwrap();
        backend
            .subscribe(&c1, &session, &Subscription::new("t", QoS::AtMostOnce))
            .unwrap();

        session.set_clean_session(true);
        backend.terminate(&c1, &session, true).unwrap();

        backend.publish(&msg("t", b"x", QoS::AtMostOnce, false)).unwrap();
        assert!(d1.try_recv().is_err());
        assert_eq!(backend.session_count(), 0);

        // Persistent sessions survive terminate.
        let (c2, _d2, _k2) = backend.create_handle();
        let (persistent, _) = backend.get_session(&c2, "bar").unwrap();
        backend.terminate(&c2, &persistent, true).unwrap();
        assert_eq!(backend.session_count(), 1);
    }
}
