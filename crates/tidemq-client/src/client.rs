//! MQTT client engine.
//!
//! The engine drives an MQTT conversation over an abstract
//! [`Connection`]. Three threads cooperate per connection:
//!
//! - the reader blocks on `receive` and dispatches packets by type;
//! - the writer owns the transport's send half and drains a bounded
//!   queue, so outbound packets never reorder;
//! - the timer fires PINGREQs and declares the connection dead after
//!   two keep-alive windows without a PINGRESP.
//!
//! Operations that expect a broker reply return an [`OpFuture`]; the
//! reader resolves it when the matching acknowledgement arrives. No
//! lock is held across a transport call.

use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;

use tidemq_core::packet::{
    Connack, Connect, Message, Packet, PacketType, Publish, QoS, Subscribe, Subscription,
    Unsubscribe,
};
use tidemq_core::session::Session;
use tidemq_core::transport::Connection;
use tidemq_core::Error as CoreError;

use crate::config::ClientConfig;
use crate::error::{ClientError, Result};
use crate::future::{FutureOutcome, FutureStore, OpFuture};
use crate::tracker::Tracker;

/// Callback invoked by the reader thread for every received message.
pub type MessageCallback = Box<dyn Fn(&Message) + Send + Sync>;

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Initialized,
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
}

struct Shared {
    config: ClientConfig,
    state: Mutex<ConnectionState>,
    conn: Mutex<Option<Arc<dyn Connection>>>,
    writer_tx: Mutex<Option<Sender<Packet>>>,
    stop_tx: Mutex<Option<Sender<()>>>,
    connect_future: Mutex<Option<Arc<OpFuture>>>,
    futures: FutureStore,
    session: Session,
    tracker: Mutex<Tracker>,
    callback: Mutex<Option<MessageCallback>>,
}

/// An MQTT client.
pub struct Client {
    shared: Arc<Shared>,
}

impl Client {
    pub fn new(config: ClientConfig) -> Self {
        let session = Session::new(config.client_id.clone(), config.clean_session);
        let tracker = Tracker::new(config.keep_alive);
        Self {
            shared: Arc::new(Shared {
                config,
                state: Mutex::new(ConnectionState::Initialized),
                conn: Mutex::new(None),
                writer_tx: Mutex::new(None),
                stop_tx: Mutex::new(None),
                connect_future: Mutex::new(None),
                futures: FutureStore::new(),
                session,
                tracker: Mutex::new(tracker),
                callback: Mutex::new(None),
            }),
        }
    }

    /// Set the handler invoked for every received message.
    pub fn on_message(&self, callback: impl Fn(&Message) + Send + Sync + 'static) {
        *self.shared.callback.lock() = Some(Box::new(callback));
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.lock()
    }

    /// Session backing this client; in-flight state survives reconnects
    /// when the clean-session flag is off.
    pub fn session(&self) -> &Session {
        &self.shared.session
    }

    /// Open the MQTT conversation over a connection. The returned
    /// future resolves when the CONNACK arrives.
    pub fn connect(&self, conn: impl Connection + 'static) -> Result<Arc<OpFuture>> {
        {
            let mut state = self.shared.state.lock();
            match *state {
                ConnectionState::Initialized | ConnectionState::Disconnected => {}
                _ => return Err(ClientError::InvalidState("connect on an active client")),
            }
            *state = ConnectionState::Connecting;
        }

        if self.shared.config.clean_session {
            self.shared.session.reset();
        }

        let conn: Arc<dyn Connection> = Arc::new(conn);
        *self.shared.conn.lock() = Some(conn.clone());
        *self.shared.tracker.lock() = Tracker::new(self.shared.config.keep_alive);

        let (writer_tx, writer_rx) = bounded(self.shared.config.queue_size);
        *self.shared.writer_tx.lock() = Some(writer_tx);

        let future = OpFuture::new();
        *self.shared.connect_future.lock() = Some(future.clone());

        self.spawn_writer(conn.clone(), writer_rx);
        self.spawn_reader(conn);
        if !self.shared.config.keep_alive.is_zero() {
            let (stop_tx, stop_rx) = bounded(1);
            *self.shared.stop_tx.lock() = Some(stop_tx);
            self.spawn_timer(stop_rx);
        }

        let config = &self.shared.config;
        let connect = Connect {
            version: config.version,
            clean_session: config.clean_session,
            keep_alive: config.keep_alive_secs(),
            client_id: config.client_id.clone(),
            will: config.will.clone(),
            username: config.username.clone(),
            password: config.password.clone(),
        };
        if let Err(e) = self.send(Packet::Connect(connect)) {
            Self::shutdown(&self.shared, Some(e.clone()), false);
            return Err(e);
        }

        Ok(future)
    }

    /// Publish a message. QoS 0 completes at send; QoS 1/2 resolve on
    /// PUBACK / PUBCOMP.
    pub fn publish(&self, msg: Message) -> Result<Arc<OpFuture>> {
        self.check_connected()?;

        if msg.qos == QoS::AtMostOnce {
            let publish = Publish::from_message(&msg, None);
            self.send(Packet::Publish(publish))?;
            return Ok(OpFuture::completed(FutureOutcome::Completed));
        }

        let packet_id = self.shared.session.next_packet_id();
        let publish = Publish::from_message(&msg, Some(packet_id));
        let future = OpFuture::new();
        self.shared.futures.put(packet_id, future.clone());
        self.shared.session.store_outgoing(publish.clone());

        if let Err(e) = self.send(Packet::Publish(publish)) {
            self.shared.futures.remove(packet_id);
            return Err(e);
        }
        Ok(future)
    }

    /// Subscribe to topic filters. The future resolves with the granted
    /// return codes from the SUBACK.
    pub fn subscribe(&self, subscriptions: Vec<Subscription>) -> Result<Arc<OpFuture>> {
        self.check_connected()?;

        let packet_id = self.shared.session.next_packet_id();
        let future = OpFuture::new();
        self.shared.futures.put(packet_id, future.clone());

        let packet = Packet::Subscribe(Subscribe {
            packet_id,
            subscriptions,
        });
        if let Err(e) = self.send(packet) {
            self.shared.futures.remove(packet_id);
            return Err(e);
        }
        Ok(future)
    }

    /// Unsubscribe from topic filters.
    pub fn unsubscribe(&self, topics: Vec<String>) -> Result<Arc<OpFuture>> {
        self.check_connected()?;

        let packet_id = self.shared.session.next_packet_id();
        let future = OpFuture::new();
        self.shared.futures.put(packet_id, future.clone());

        let packet = Packet::Unsubscribe(Unsubscribe { packet_id, topics });
        if let Err(e) = self.send(packet) {
            self.shared.futures.remove(packet_id);
            return Err(e);
        }
        Ok(future)
    }

    /// Disconnect gracefully: wait up to `timeout` for pending futures,
    /// send DISCONNECT and close the connection.
    pub fn disconnect(&self, timeout: Option<Duration>) -> Result<()> {
        {
            let mut state = self.shared.state.lock();
            if *state != ConnectionState::Connected {
                return Err(ClientError::NotConnected);
            }
            *state = ConnectionState::Disconnecting;
        }

        if let Some(timeout) = timeout {
            if let Err(e) = self.shared.futures.await_all(timeout) {
                log::debug!("pending futures before disconnect: {}", e);
            }
        }

        let _ = self.send(Packet::Disconnect);
        Self::shutdown(&self.shared, None, true);
        Ok(())
    }

    fn check_connected(&self) -> Result<()> {
        if *self.shared.state.lock() != ConnectionState::Connected {
            return Err(ClientError::NotConnected);
        }
        Ok(())
    }

    /// Queue a packet for the writer. Blocks when the queue is full,
    /// exerting backpressure on the caller.
    fn send(&self, packet: Packet) -> Result<()> {
        send_via(&self.shared, packet)
    }

    fn spawn_writer(&self, conn: Arc<dyn Connection>, writer_rx: Receiver<Packet>) {
        let shared = self.shared.clone();
        std::thread::spawn(move || {
            for packet in writer_rx {
                if conn.send(packet, false).is_err() {
                    break;
                }
                shared.tracker.lock().reset();
            }
            // Queue closed after a graceful disconnect, or the send
            // failed; either way the transport is done.
            let _ = conn.close();
        });
    }

    fn spawn_reader(&self, conn: Arc<dyn Connection>) {
        let shared = self.shared.clone();
        std::thread::spawn(move || loop {
            match conn.receive() {
                Ok(packet) => {
                    if let Err(e) = Self::handle_packet(&shared, packet) {
                        log::warn!("client connection failed: {}", e);
                        Self::shutdown(&shared, Some(e), false);
                        break;
                    }
                }
                Err(_) => {
                    let state = *shared.state.lock();
                    let error = match state {
                        ConnectionState::Disconnecting | ConnectionState::Disconnected => None,
                        _ => Some(ClientError::Core(CoreError::ConnectionClosed)),
                    };
                    Self::shutdown(&shared, error, false);
                    break;
                }
            }
        });
    }

    fn spawn_timer(&self, stop_rx: Receiver<()>) {
        let shared = self.shared.clone();
        std::thread::spawn(move || loop {
            let window = shared.tracker.lock().window();
            if !window.is_zero() {
                match stop_rx.recv_timeout(window) {
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    Err(RecvTimeoutError::Timeout) => {}
                }
                continue;
            }

            // Window elapsed: ping again, even with one unanswered.
            if send_via(&shared, Packet::Pingreq).is_err() {
                break;
            }
            let overdue = {
                let mut tracker = shared.tracker.lock();
                tracker.reset();
                tracker.ping();
                tracker.overdue()
            };

            // More than one outstanding ping means two intervals passed
            // without a PINGRESP. Let the writer flush the final ping
            // before it closes the transport.
            if overdue {
                log::warn!("keep alive timeout, closing connection");
                Self::shutdown(&shared, Some(ClientError::KeepAliveTimeout), true);
                break;
            }
        });
    }

    fn handle_packet(shared: &Arc<Shared>, packet: Packet) -> Result<()> {
        match packet {
            Packet::Connack(connack) => Self::handle_connack(shared, connack),
            Packet::Publish(publish) => Self::handle_publish(shared, publish),
            Packet::Puback { packet_id } => {
                shared.session.handle_puback(packet_id);
                Self::resolve(shared, packet_id, FutureOutcome::Completed);
                Ok(())
            }
            Packet::Pubrec { packet_id } => {
                // Only the first PUBREC triggers a PUBREL; duplicates
                // after the transition are dropped.
                if shared.session.handle_pubrec(packet_id) {
                    send_via(shared, Packet::Pubrel { packet_id })?;
                }
                Ok(())
            }
            Packet::Pubcomp { packet_id } => {
                shared.session.handle_pubcomp(packet_id);
                Self::resolve(shared, packet_id, FutureOutcome::Completed);
                Ok(())
            }
            Packet::Pubrel { packet_id } => {
                shared.session.handle_pubrel(packet_id);
                send_via(shared, Packet::Pubcomp { packet_id })?;
                Ok(())
            }
            Packet::Suback(suback) => {
                Self::resolve(
                    shared,
                    suback.packet_id,
                    FutureOutcome::Granted {
                        return_codes: suback.return_codes,
                    },
                );
                Ok(())
            }
            Packet::Unsuback { packet_id } => {
                Self::resolve(shared, packet_id, FutureOutcome::Completed);
                Ok(())
            }
            Packet::Pingresp => {
                shared.tracker.lock().pong();
                Ok(())
            }
            other => Err(ClientError::UnexpectedPacket(other.packet_type())),
        }
    }

    fn handle_connack(shared: &Arc<Shared>, connack: Connack) -> Result<()> {
        if *shared.state.lock() != ConnectionState::Connecting {
            return Err(ClientError::UnexpectedPacket(PacketType::Connack));
        }

        if !connack.code.is_accepted() {
            let err = ClientError::ConnectionRefused(connack.code);
            if let Some(future) = shared.connect_future.lock().take() {
                future.fail(err.clone());
            }
            return Err(err);
        }

        if !shared.config.clean_session && connack.session_present {
            // Resume: re-send every stored in-flight packet, dup set.
            for packet in shared.session.packets_to_resend() {
                send_via(shared, packet)?;
            }
        } else if !shared.config.clean_session {
            // The broker lost our session; discard local state.
            shared.session.reset();
        }

        *shared.state.lock() = ConnectionState::Connected;
        if let Some(future) = shared.connect_future.lock().take() {
            future.complete(FutureOutcome::Connected {
                session_present: connack.session_present,
            });
        }
        Ok(())
    }

    fn handle_publish(shared: &Arc<Shared>, publish: Publish) -> Result<()> {
        match publish.qos {
            QoS::AtMostOnce => {
                Self::deliver(shared, &publish);
            }
            QoS::AtLeastOnce => {
                let packet_id = required_packet_id(&publish)?;
                Self::deliver(shared, &publish);
                send_via(shared, Packet::Puback { packet_id })?;
            }
            QoS::ExactlyOnce => {
                let packet_id = required_packet_id(&publish)?;
                // Deliver on the first PUBLISH only; the in-flight
                // record suppresses duplicates until PUBREL.
                if shared.session.store_incoming(publish.clone()) {
                    Self::deliver(shared, &publish);
                }
                send_via(shared, Packet::Pubrec { packet_id })?;
            }
        }
        Ok(())
    }

    fn deliver(shared: &Arc<Shared>, publish: &Publish) {
        let callback = shared.callback.lock();
        if let Some(callback) = callback.as_ref() {
            callback(&publish.to_message());
        }
    }

    /// Resolve and drop the future for a packet id; late or duplicate
    /// acknowledgements resolve nothing.
    fn resolve(shared: &Arc<Shared>, packet_id: u16, outcome: FutureOutcome) {
        if let Some(future) = shared.futures.remove(packet_id) {
            future.complete(outcome);
        }
    }

    /// Tear the connection down and fail every pending future. With
    /// `drain` the writer empties its queue and closes the transport
    /// itself (graceful disconnect, keep-alive death with a final
    /// PINGREQ still queued); without it the transport is closed
    /// immediately to unblock the other threads.
    fn shutdown(shared: &Arc<Shared>, error: Option<ClientError>, drain: bool) {
        {
            let mut state = shared.state.lock();
            if *state == ConnectionState::Disconnected {
                return;
            }
            *state = ConnectionState::Disconnected;
        }

        // Dropping the queue sender stops the writer after the drain.
        *shared.writer_tx.lock() = None;
        shared.stop_tx.lock().take();

        let conn = shared.conn.lock().take();
        if !drain {
            if let Some(conn) = conn {
                let _ = conn.close();
            }
        }

        let err = error.unwrap_or(ClientError::Core(CoreError::ConnectionClosed));
        if let Some(future) = shared.connect_future.lock().take() {
            future.fail(err.clone());
        }
        shared.futures.fail_all(&err);
    }
}

fn required_packet_id(publish: &Publish) -> Result<u16> {
    publish.packet_id.ok_or_else(|| {
        ClientError::Core(CoreError::Protocol(
            tidemq_core::ProtocolError::MalformedPacket(
                "Missing packet identifier on qos > 0 publish".into(),
            ),
        ))
    })
}

fn send_via(shared: &Arc<Shared>, packet: Packet) -> Result<()> {
    let tx = shared.writer_tx.lock().clone();
    let Some(tx) = tx else {
        return Err(ClientError::NotConnected);
    };
    tx.send(packet)
        .map_err(|_| ClientError::Core(CoreError::ConnectionClosed))
}
