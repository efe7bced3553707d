//! Per-connection broker loop.
//!
//! A [`Dispatcher`] serves one client connection against a [`Backend`]:
//! it performs the CONNECT handshake, then dispatches inbound packets
//! and pumps backend deliveries out. Three activities cooperate per
//! connection:
//!
//! - the reader (the calling thread) blocks on `receive` and handles
//!   one packet at a time;
//! - a writer thread owns the transport's send half; every outbound
//!   packet funnels through its bounded queue;
//! - a delivery pump forwards messages queued by the backend and reacts
//!   to the takeover close signal.

use std::sync::Arc;
use std::thread;

use crossbeam_channel::{bounded, Receiver, Sender};

use tidemq_core::packet::{
    Connack, ConnackCode, Connect, Message, Packet, Publish, QoS, SUBACK_FAILURE, Suback,
    VERSION_31, VERSION_311,
};
use tidemq_core::session::Session;
use tidemq_core::transport::Connection;
use tidemq_core::Error as CoreError;

use crate::backend::{Backend, ClientHandle};
use crate::config::BrokerConfig;
use crate::error::{BrokerError, Result};
use crate::tree::filter_is_valid;

enum Flow {
    Continue,
    Stop,
}

/// Serves client connections against a shared backend.
pub struct Dispatcher<B> {
    backend: Arc<B>,
    config: BrokerConfig,
}

impl<B: Backend + 'static> Dispatcher<B> {
    pub fn new(backend: Arc<B>) -> Self {
        Self::with_config(backend, BrokerConfig::default())
    }

    pub fn with_config(backend: Arc<B>, config: BrokerConfig) -> Self {
        Self { backend, config }
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    /// Serve one connection until it disconnects or fails. The
    /// connection is closed before returning.
    pub fn run(&self, conn: impl Connection + 'static) -> Result<()> {
        let conn: Arc<dyn Connection> = Arc::new(conn);
        let result = self.serve(&conn);
        let _ = conn.close();
        result
    }

    fn serve(&self, conn: &Arc<dyn Connection>) -> Result<()> {
        let connect = self.handshake(conn)?;

        let (handle, deliveries, close_rx) = self.backend.create_handle();
        let (session, resumed) = self.backend.get_session(&handle, &connect.client_id)?;

        session.set_clean_session(connect.clean_session);
        if connect.clean_session {
            session.reset();
        }
        if let Some(will) = connect.will.clone() {
            session.save_will(will);
        }
        let session_present = resumed && !connect.clean_session;

        // Writer thread: sole owner of the transport's send half.
        let (writer_tx, writer_rx) = bounded::<Packet>(self.config.queue_size);
        let writer_conn = Arc::clone(conn);
        let writer = thread::spawn(move || {
            for packet in writer_rx {
                if writer_conn.send(packet, false).is_err() {
                    break;
                }
            }
        });

        let pump = self.spawn_delivery_pump(conn, &session, &writer_tx, deliveries, close_rx);

        let result = (|| {
            send_to_writer(
                &writer_tx,
                Packet::Connack(Connack {
                    session_present,
                    code: ConnackCode::Accepted,
                }),
            )?;

            // Re-bind stored subscriptions and redeliver unacknowledged
            // flows of a resumed session.
            if session_present {
                self.backend.restore_subscriptions(&handle, &session)?;
                for packet in session.packets_to_resend() {
                    send_to_writer(&writer_tx, packet)?;
                }
            }

            let mut graceful = false;
            loop {
                let packet = match conn.receive() {
                    Ok(packet) => packet,
                    // Abnormal loss of the connection; the will fires.
                    Err(_) => break,
                };
                match self.handle_packet(packet, &handle, &session, &writer_tx)? {
                    Flow::Continue => {}
                    Flow::Stop => {
                        graceful = true;
                        break;
                    }
                }
            }
            Ok(graceful)
        })();

        let graceful = *result.as_ref().unwrap_or(&false);
        let _ = self.backend.terminate(&handle, &session, graceful);
        let _ = conn.close();

        // All delivery senders are gone once the backend dropped its
        // handle clone; both helper threads unwind from here.
        drop(handle);
        drop(writer_tx);
        let _ = pump.join();
        let _ = writer.join();

        result.map(|_| ())
    }

    fn handshake(&self, conn: &Arc<dyn Connection>) -> Result<Connect> {
        let packet = conn.receive()?;
        let Packet::Connect(connect) = packet else {
            return Err(BrokerError::ExpectedConnect);
        };

        // The codec enforces both rules on the wire; packet-passing
        // transports like the test pipe get the same CONNACK answers.
        if connect.version != VERSION_311 && connect.version != VERSION_31 {
            self.refuse(conn, ConnackCode::UnacceptableProtocolVersion);
            return Err(BrokerError::ConnectionRefused("unacceptable protocol version"));
        }
        if connect.client_id.is_empty() && !connect.clean_session {
            self.refuse(conn, ConnackCode::IdentifierRejected);
            return Err(BrokerError::ConnectionRefused("identifier rejected"));
        }

        Ok(connect)
    }

    fn refuse(&self, conn: &Arc<dyn Connection>, code: ConnackCode) {
        let _ = conn.send(
            Packet::Connack(Connack {
                session_present: false,
                code,
            }),
            false,
        );
    }

    fn spawn_delivery_pump(
        &self,
        conn: &Arc<dyn Connection>,
        session: &Arc<Session>,
        writer_tx: &Sender<Packet>,
        deliveries: Receiver<Message>,
        close_rx: Receiver<()>,
    ) -> thread::JoinHandle<()> {
        let session = Arc::clone(session);
        let writer_tx = writer_tx.clone();
        let conn = Arc::clone(conn);

        thread::spawn(move || loop {
            crossbeam_channel::select! {
                recv(deliveries) -> msg => {
                    let Ok(msg) = msg else { break };
                    let packet_id =
                        (msg.qos != QoS::AtMostOnce).then(|| session.next_packet_id());
                    let publish = Publish::from_message(&msg, packet_id);
                    if packet_id.is_some() {
                        session.store_outgoing(publish.clone());
                    }
                    // Stay responsive to the close signal even while
                    // the writer queue is exerting backpressure.
                    let packet = Packet::Publish(publish);
                    crossbeam_channel::select! {
                        send(writer_tx, packet) -> res => {
                            if res.is_err() {
                                break;
                            }
                        }
                        recv(close_rx) -> _ => {
                            let _ = conn.close();
                            break;
                        }
                    }
                }
                recv(close_rx) -> _ => {
                    // Session takeover: release the transport so the
                    // reader unblocks and runs cleanup.
                    log::debug!(
                        "closing connection for client '{}': taken over",
                        session.client_id()
                    );
                    let _ = conn.close();
                    break;
                }
            }
        })
    }

    fn handle_packet(
        &self,
        packet: Packet,
        handle: &ClientHandle,
        session: &Arc<Session>,
        writer_tx: &Sender<Packet>,
    ) -> Result<Flow> {
        match packet {
            Packet::Publish(publish) => {
                self.handle_publish(publish, session, writer_tx)?;
                Ok(Flow::Continue)
            }
            Packet::Puback { packet_id } => {
                session.handle_puback(packet_id);
                Ok(Flow::Continue)
            }
            Packet::Pubrec { packet_id } => {
                // Only the first PUBREC triggers a PUBREL.
                if session.handle_pubrec(packet_id) {
                    send_to_writer(writer_tx, Packet::Pubrel { packet_id })?;
                }
                Ok(Flow::Continue)
            }
            Packet::Pubcomp { packet_id } => {
                session.handle_pubcomp(packet_id);
                Ok(Flow::Continue)
            }
            Packet::Pubrel { packet_id } => {
                session.handle_pubrel(packet_id);
                send_to_writer(writer_tx, Packet::Pubcomp { packet_id })?;
                Ok(Flow::Continue)
            }
            Packet::Subscribe(subscribe) => {
                let mut return_codes = Vec::with_capacity(subscribe.subscriptions.len());
                let mut replay = Vec::new();
                for subscription in &subscribe.subscriptions {
                    if filter_is_valid(&subscription.topic) {
                        replay.extend(self.backend.subscribe(handle, session, subscription)?);
                        return_codes.push(subscription.qos as u8);
                    } else {
                        return_codes.push(SUBACK_FAILURE);
                    }
                }
                send_to_writer(
                    writer_tx,
                    Packet::Suback(Suback {
                        packet_id: subscribe.packet_id,
                        return_codes,
                    }),
                )?;

                // Retained replay after the SUBACK, retain flag kept.
                for msg in replay {
                    let packet_id =
                        (msg.qos != QoS::AtMostOnce).then(|| session.next_packet_id());
                    let publish = Publish::from_message(&msg, packet_id);
                    if packet_id.is_some() {
                        session.store_outgoing(publish.clone());
                    }
                    send_to_writer(writer_tx, Packet::Publish(publish))?;
                }
                Ok(Flow::Continue)
            }
            Packet::Unsubscribe(unsubscribe) => {
                for topic in &unsubscribe.topics {
                    self.backend.unsubscribe(handle, session, topic)?;
                }
                send_to_writer(
                    writer_tx,
                    Packet::Unsuback {
                        packet_id: unsubscribe.packet_id,
                    },
                )?;
                Ok(Flow::Continue)
            }
            Packet::Pingreq => {
                send_to_writer(writer_tx, Packet::Pingresp)?;
                Ok(Flow::Continue)
            }
            Packet::Disconnect => Ok(Flow::Stop),
            other => Err(BrokerError::UnexpectedPacket(other.packet_type())),
        }
    }

    fn handle_publish(
        &self,
        publish: Publish,
        session: &Arc<Session>,
        writer_tx: &Sender<Packet>,
    ) -> Result<()> {
        if publish.topic.contains(['+', '#']) {
            return Err(CoreError::from(tidemq_core::ProtocolError::WildcardTopic).into());
        }

        let msg = publish.to_message();
        match publish.qos {
            QoS::AtMostOnce => self.backend.publish(&msg)?,
            QoS::AtLeastOnce => {
                let packet_id = required_packet_id(&publish)?;
                self.backend.publish(&msg)?;
                send_to_writer(writer_tx, Packet::Puback { packet_id })?;
            }
            QoS::ExactlyOnce => {
                let packet_id = required_packet_id(&publish)?;
                // Deliver on the first PUBLISH only; the in-flight
                // record suppresses duplicates until PUBREL.
                if session.store_incoming(publish.clone()) {
                    self.backend.publish(&msg)?;
                }
                send_to_writer(writer_tx, Packet::Pubrec { packet_id })?;
            }
        }
        Ok(())
    }
}

fn required_packet_id(publish: &Publish) -> Result<u16> {
    publish.packet_id.ok_or_else(|| {
        CoreError::from(tidemq_core::ProtocolError::MalformedPacket(
            "Missing packet identifier on qos > 0 publish".into(),
        ))
        .into()
    })
}

fn send_to_writer(writer_tx: &Sender<Packet>, packet: Packet) -> Result<()> {
    writer_tx
        .send(packet)
        .map_err(|_| CoreError::ConnectionClosed.into())
}
