//! Packet-flow tests for the client engine over in-memory pipes.
//!
//! Each test plays the broker side of the conversation with a scripted
//! flow while the client under test drives the other endpoint.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use crossbeam_channel::{bounded, Receiver};

use tidemq_client::{
    Client, ClientConfig, ClientError, ConnectionState, FutureOutcome, Message, QoS, Subscription,
};
use tidemq_core::flow::{Flow, FlowError};
use tidemq_core::packet::{
    Connack, ConnackCode, Connect, Packet, Publish, Suback, Subscribe, Unsubscribe,
};
use tidemq_core::session::Direction;
use tidemq_core::transport::{pipe, Connection, Pipe};

const TIMEOUT: Duration = Duration::from_secs(5);

fn expected_connect(config: &ClientConfig) -> Packet {
    Packet::Connect(Connect {
        version: config.version,
        clean_session: config.clean_session,
        keep_alive: config.keep_alive_secs(),
        client_id: config.client_id.clone(),
        will: config.will.clone(),
        username: config.username.clone(),
        password: config.password.clone(),
    })
}

fn connack(session_present: bool) -> Packet {
    Packet::Connack(Connack {
        session_present,
        code: ConnackCode::Accepted,
    })
}

fn publish(topic: &str, payload: &'static [u8], qos: QoS, packet_id: Option<u16>) -> Packet {
    Packet::Publish(Publish {
        dup: false,
        qos,
        retain: false,
        topic: topic.into(),
        packet_id,
        payload: Bytes::from_static(payload),
    })
}

/// Run a broker-side flow against one pipe endpoint.
fn broker_flow(flow: Flow, conn: Pipe) -> Receiver<Result<(), FlowError>> {
    let conn: Arc<dyn Connection> = Arc::new(conn);
    flow.test_async(conn, TIMEOUT)
}

fn no_keep_alive(client_id: &str) -> ClientConfig {
    ClientConfig::new(client_id).keep_alive(Duration::ZERO)
}

fn wait_for_state(client: &Client, state: ConnectionState) {
    let deadline = Instant::now() + TIMEOUT;
    while client.state() != state {
        assert!(Instant::now() < deadline, "timed out waiting for {:?}", state);
        thread::sleep(Duration::from_millis(1));
    }
}

fn wait_for_inflight(client: &Client, direction: Direction, len: usize) {
    let deadline = Instant::now() + TIMEOUT;
    while client.session().inflight_len(direction) != len {
        assert!(Instant::now() < deadline, "timed out waiting for in-flight {}", len);
        thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn test_connect_and_disconnect() {
    let config = no_keep_alive("tester");
    let client = Client::new(config.clone());
    let (conn, broker) = pipe();

    let done = broker_flow(
        Flow::new()
            .receive(expected_connect(&config))
            .send(connack(false))
            .receive(Packet::Disconnect)
            .end(),
        broker,
    );

    let future = client.connect(conn).unwrap();
    assert_eq!(
        future.wait(Some(TIMEOUT)).unwrap(),
        FutureOutcome::Connected {
            session_present: false
        }
    );
    assert_eq!(client.state(), ConnectionState::Connected);

    client.disconnect(None).unwrap();
    done.recv().unwrap().unwrap();
    assert_eq!(client.state(), ConnectionState::Disconnected);
}

#[test]
fn test_connect_refused() {
    let config = no_keep_alive("refused");
    let client = Client::new(config.clone());
    let (conn, broker) = pipe();

    let done = broker_flow(
        Flow::new()
            .receive(expected_connect(&config))
            .send(Packet::Connack(Connack {
                session_present: false,
                code: ConnackCode::BadUsernamePassword,
            }))
            .end(),
        broker,
    );

    let future = client.connect(conn).unwrap();
    assert_eq!(
        future.wait(Some(TIMEOUT)),
        Err(ClientError::ConnectionRefused(
            ConnackCode::BadUsernamePassword
        ))
    );
    done.recv().unwrap().unwrap();
    wait_for_state(&client, ConnectionState::Disconnected);
}

#[test]
fn test_operations_require_connection() {
    let client = Client::new(no_keep_alive("offline"));

    let msg = Message::new("t", &b"x"[..], QoS::AtMostOnce, false);
    assert!(matches!(
        client.publish(msg),
        Err(ClientError::NotConnected)
    ));
    assert!(matches!(
        client.subscribe(vec![Subscription::new("t", QoS::AtMostOnce)]),
        Err(ClientError::NotConnected)
    ));
    assert!(matches!(
        client.unsubscribe(vec!["t".into()]),
        Err(ClientError::NotConnected)
    ));
    assert_eq!(client.disconnect(None), Err(ClientError::NotConnected));
}

#[test]
fn test_publish_qos0_completes_at_send() {
    let config = no_keep_alive("qos0");
    let client = Client::new(config.clone());
    let (conn, broker) = pipe();

    let done = broker_flow(
        Flow::new()
            .receive(expected_connect(&config))
            .send(connack(false))
            .receive(publish("greeting", b"hello", QoS::AtMostOnce, None))
            .receive(Packet::Disconnect)
            .end(),
        broker,
    );

    client.connect(conn).unwrap().wait(Some(TIMEOUT)).unwrap();

    let future = client
        .publish(Message::new("greeting", &b"hello"[..], QoS::AtMostOnce, false))
        .unwrap();
    // QoS 0 resolves without waiting for the broker.
    assert_eq!(future.wait(Some(TIMEOUT)).unwrap(), FutureOutcome::Completed);
    assert_eq!(client.session().inflight_len(Direction::Outgoing), 0);

    client.disconnect(None).unwrap();
    done.recv().unwrap().unwrap();
}

#[test]
fn test_publish_qos1_resolves_on_puback() {
    let config = no_keep_alive("qos1");
    let client = Client::new(config.clone());
    let (conn, broker) = pipe();

    let done = broker_flow(
        Flow::new()
            .receive(expected_connect(&config))
            .send(connack(false))
            .receive(publish("data", b"payload", QoS::AtLeastOnce, Some(1)))
            .send(Packet::Puback { packet_id: 1 })
            .receive(Packet::Disconnect)
            .end(),
        broker,
    );

    client.connect(conn).unwrap().wait(Some(TIMEOUT)).unwrap();

    let future = client
        .publish(Message::new("data", &b"payload"[..], QoS::AtLeastOnce, false))
        .unwrap();
    assert_eq!(future.wait(Some(TIMEOUT)).unwrap(), FutureOutcome::Completed);

    wait_for_inflight(&client, Direction::Outgoing, 0);
    client.disconnect(None).unwrap();
    done.recv().unwrap().unwrap();
}

#[test]
fn test_publish_qos2_flow_ignores_duplicate_pubrec() {
    let config = no_keep_alive("qos2");
    let client = Client::new(config.clone());
    let (conn, broker) = pipe();

    let done = broker_flow(
        Flow::new()
            .receive(expected_connect(&config))
            .send(connack(false))
            .receive(publish("exact", b"once", QoS::ExactlyOnce, Some(1)))
            .send(Packet::Pubrec { packet_id: 1 })
            .receive(Packet::Pubrel { packet_id: 1 })
            // A duplicate PUBREC after PUBREL must not trigger another
            // PUBREL; the next packet on the wire is the DISCONNECT.
            .send(Packet::Pubrec { packet_id: 1 })
            .send(Packet::Pubcomp { packet_id: 1 })
            .receive(Packet::Disconnect)
            .end(),
        broker,
    );

    client.connect(conn).unwrap().wait(Some(TIMEOUT)).unwrap();

    let future = client
        .publish(Message::new("exact", &b"once"[..], QoS::ExactlyOnce, false))
        .unwrap();
    assert_eq!(future.wait(Some(TIMEOUT)).unwrap(), FutureOutcome::Completed);

    wait_for_inflight(&client, Direction::Outgoing, 0);
    client.disconnect(None).unwrap();
    done.recv().unwrap().unwrap();
}

#[test]
fn test_subscribe_and_unsubscribe() {
    let config = no_keep_alive("subs");
    let client = Client::new(config.clone());
    let (conn, broker) = pipe();

    let done = broker_flow(
        Flow::new()
            .receive(expected_connect(&config))
            .send(connack(false))
            .receive(Packet::Subscribe(Subscribe {
                packet_id: 1,
                subscriptions: vec![
                    Subscription::new("a/#", QoS::AtLeastOnce),
                    Subscription::new("b", QoS::AtMostOnce),
                ],
            }))
            .send(Packet::Suback(Suback {
                packet_id: 1,
                return_codes: vec![1, 0],
            }))
            .receive(Packet::Unsubscribe(Unsubscribe {
                packet_id: 2,
                topics: vec!["a/#".into()],
            }))
            .send(Packet::Unsuback { packet_id: 2 })
            .receive(Packet::Disconnect)
            .end(),
        broker,
    );

    client.connect(conn).unwrap().wait(Some(TIMEOUT)).unwrap();

    let future = client
        .subscribe(vec![
            Subscription::new("a/#", QoS::AtLeastOnce),
            Subscription::new("b", QoS::AtMostOnce),
        ])
        .unwrap();
    assert_eq!(
        future.wait(Some(TIMEOUT)).unwrap(),
        FutureOutcome::Granted {
            return_codes: vec![1, 0]
        }
    );

    let future = client.unsubscribe(vec!["a/#".into()]).unwrap();
    assert_eq!(future.wait(Some(TIMEOUT)).unwrap(), FutureOutcome::Completed);

    client.disconnect(None).unwrap();
    done.recv().unwrap().unwrap();
}

#[test]
fn test_inbound_qos2_delivers_once() {
    let config = no_keep_alive("inbound");
    let client = Client::new(config.clone());
    let (conn, broker) = pipe();

    let deliveries = Arc::new(AtomicUsize::new(0));
    let counter = deliveries.clone();
    client.on_message(move |msg| {
        assert_eq!(msg.topic, "in");
        assert_eq!(msg.payload.as_ref(), b"x");
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let (ready_tx, ready_rx) = bounded(1);
    let done = broker_flow(
        Flow::new()
            .receive(expected_connect(&config))
            .send(connack(false))
            .send(publish("in", b"x", QoS::ExactlyOnce, Some(5)))
            .receive(Packet::Pubrec { packet_id: 5 })
            // Duplicate PUBLISH before PUBREL: acknowledged again but
            // not delivered again.
            .send(publish("in", b"x", QoS::ExactlyOnce, Some(5)))
            .receive(Packet::Pubrec { packet_id: 5 })
            .send(Packet::Pubrel { packet_id: 5 })
            .receive(Packet::Pubcomp { packet_id: 5 })
            .run(move || {
                let _ = ready_tx.send(());
            })
            .receive(Packet::Disconnect)
            .end(),
        broker,
    );

    client.connect(conn).unwrap().wait(Some(TIMEOUT)).unwrap();

    ready_rx.recv_timeout(TIMEOUT).unwrap();
    assert_eq!(deliveries.load(Ordering::SeqCst), 1);
    assert_eq!(client.session().inflight_len(Direction::Incoming), 0);

    client.disconnect(None).unwrap();
    done.recv().unwrap().unwrap();
}

#[test]
fn test_keep_alive_ping_exchange() {
    let config = ClientConfig::new("pinger").keep_alive(Duration::from_millis(80));
    let client = Client::new(config.clone());
    let (conn, broker) = pipe();

    let (ready_tx, ready_rx) = bounded(1);
    let done = broker_flow(
        Flow::new()
            .receive(expected_connect(&config))
            .send(connack(false))
            .receive(Packet::Pingreq)
            .send(Packet::Pingresp)
            .receive(Packet::Pingreq)
            .send(Packet::Pingresp)
            .run(move || {
                let _ = ready_tx.send(());
            })
            .receive(Packet::Disconnect)
            .end(),
        broker,
    );

    client.connect(conn).unwrap().wait(Some(TIMEOUT)).unwrap();

    ready_rx.recv_timeout(TIMEOUT).unwrap();
    client.disconnect(None).unwrap();
    done.recv().unwrap().unwrap();
    assert_eq!(client.state(), ConnectionState::Disconnected);
}

#[test]
fn test_keep_alive_timeout_kills_connection() {
    let config = ClientConfig::new("silent").keep_alive(Duration::from_millis(50));
    let client = Client::new(config.clone());
    let (conn, broker) = pipe();

    let done = broker_flow(
        Flow::new()
            .receive(expected_connect(&config))
            .send(connack(false))
            // Swallow the pings and never answer; a second PINGREQ
            // still goes out, and with both unanswered the engine
            // declares the connection dead and closes it.
            .receive(Packet::Pingreq)
            .receive(Packet::Pingreq)
            .end(),
        broker,
    );

    client.connect(conn).unwrap().wait(Some(TIMEOUT)).unwrap();

    done.recv().unwrap().unwrap();
    wait_for_state(&client, ConnectionState::Disconnected);
    assert!(matches!(
        client.publish(Message::new("t", &b"x"[..], QoS::AtMostOnce, false)),
        Err(ClientError::NotConnected)
    ));
}

#[test]
fn test_resume_resends_inflight() {
    let config = no_keep_alive("resume").clean_session(false);
    let client = Client::new(config.clone());

    // First conversation dies mid QoS 2 flow, after the PUBREL went out.
    let (conn, broker) = pipe();
    let done = broker_flow(
        Flow::new()
            .receive(expected_connect(&config))
            .send(connack(false))
            .receive(publish("job", b"run", QoS::ExactlyOnce, Some(1)))
            .send(Packet::Pubrec { packet_id: 1 })
            .receive(Packet::Pubrel { packet_id: 1 })
            .close(),
        broker,
    );

    client.connect(conn).unwrap().wait(Some(TIMEOUT)).unwrap();
    let future = client
        .publish(Message::new("job", &b"run"[..], QoS::ExactlyOnce, false))
        .unwrap();

    done.recv().unwrap().unwrap();
    wait_for_state(&client, ConnectionState::Disconnected);
    assert!(future.wait(Some(TIMEOUT)).is_err());

    // The half-finished flow survived the disconnect.
    assert_eq!(client.session().inflight_len(Direction::Outgoing), 1);

    // Reconnect with session-present: the engine re-issues the PUBREL.
    let (conn, broker) = pipe();
    let done = broker_flow(
        Flow::new()
            .receive(expected_connect(&config))
            .send(connack(true))
            .receive(Packet::Pubrel { packet_id: 1 })
            .send(Packet::Pubcomp { packet_id: 1 })
            .receive(Packet::Disconnect)
            .end(),
        broker,
    );

    client.connect(conn).unwrap().wait(Some(TIMEOUT)).unwrap();
    wait_for_inflight(&client, Direction::Outgoing, 0);

    client.disconnect(None).unwrap();
    done.recv().unwrap().unwrap();
}

#[test]
fn test_session_discarded_when_not_present() {
    let config = no_keep_alive("lost").clean_session(false);
    let client = Client::new(config.clone());

    let (conn, broker) = pipe();
    let done = broker_flow(
        Flow::new()
            .receive(expected_connect(&config))
            .send(connack(false))
            .receive(publish("x", b"1", QoS::AtLeastOnce, Some(1)))
            .close(),
        broker,
    );

    client.connect(conn).unwrap().wait(Some(TIMEOUT)).unwrap();
    let _ = client.publish(Message::new("x", &b"1"[..], QoS::AtLeastOnce, false));

    done.recv().unwrap().unwrap();
    wait_for_state(&client, ConnectionState::Disconnected);
    assert_eq!(client.session().inflight_len(Direction::Outgoing), 1);

    // The broker answers without session-present: local state goes.
    let (conn, broker) = pipe();
    let done = broker_flow(
        Flow::new()
            .receive(expected_connect(&config))
            .send(connack(false))
            .receive(Packet::Disconnect)
            .end(),
        broker,
    );

    client.connect(conn).unwrap().wait(Some(TIMEOUT)).unwrap();
    assert_eq!(client.session().inflight_len(Direction::Outgoing), 0);

    client.disconnect(None).unwrap();
    done.recv().unwrap().unwrap();
}

#[test]
fn test_future_timeout_keeps_inflight_record() {
    let config = no_keep_alive("patience");
    let client = Client::new(config.clone());
    let (conn, broker) = pipe();

    let (late_tx, late_rx) = bounded(1);
    let done = broker_flow(
        Flow::new()
            .receive(expected_connect(&config))
            .send(connack(false))
            .receive(publish("slow", b"ack", QoS::AtLeastOnce, Some(1)))
            .run(move || {
                // Let the caller observe the timeout first.
                let _ = late_rx.recv_timeout(TIMEOUT);
            })
            .send(Packet::Puback { packet_id: 1 })
            .receive(Packet::Disconnect)
            .end(),
        broker,
    );

    client.connect(conn).unwrap().wait(Some(TIMEOUT)).unwrap();

    let future = client
        .publish(Message::new("slow", &b"ack"[..], QoS::AtLeastOnce, false))
        .unwrap();

    // The wait times out, but neither the future nor the in-flight
    // record is removed; the late ack still completes both.
    assert_eq!(
        future.wait(Some(Duration::from_millis(30))),
        Err(ClientError::Timeout)
    );
    assert_eq!(client.session().inflight_len(Direction::Outgoing), 1);

    late_tx.send(()).unwrap();
    assert_eq!(future.wait(Some(TIMEOUT)).unwrap(), FutureOutcome::Completed);
    wait_for_inflight(&client, Direction::Outgoing, 0);

    client.disconnect(None).unwrap();
    done.recv().unwrap().unwrap();
}
