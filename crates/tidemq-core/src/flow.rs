//! Scripted packet flows for testing MQTT conversations.
//!
//! A [`Flow`] is a list of tagged actions executed in order against a
//! [`Connection`]: send a packet, receive and match a packet, skip a
//! packet by type, run a closure, close the connection, or expect the
//! peer to close it. Flows let a test play the role of one side of an
//! MQTT conversation while the code under test drives the other.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver};

use crate::error::Error;
use crate::packet::{Packet, PacketType};
use crate::transport::Connection;

/// A step in a flow.
enum Action {
    Send(Packet),
    Receive(Packet),
    Skip(PacketType),
    Run(Box<dyn FnOnce() + Send>),
    Close,
    End,
}

/// Mismatch or transport failure while executing a flow.
#[derive(Debug)]
pub struct FlowError(pub String);

impl std::fmt::Display for FlowError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for FlowError {}

/// A sequence of actions tested against a connection.
#[derive(Default)]
pub struct Flow {
    actions: Vec<Action>,
}

impl Flow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Send one packet.
    pub fn send(mut self, packet: Packet) -> Self {
        self.actions.push(Action::Send(packet));
        self
    }

    /// Receive one packet and match it exactly.
    pub fn receive(mut self, packet: Packet) -> Self {
        self.actions.push(Action::Receive(packet));
        self
    }

    /// Receive one packet, matching only its type.
    pub fn skip(mut self, packet_type: PacketType) -> Self {
        self.actions.push(Action::Skip(packet_type));
        self
    }

    /// Run a closure and wait until it returns.
    pub fn run(mut self, f: impl FnOnce() + Send + 'static) -> Self {
        self.actions.push(Action::Run(Box::new(f)));
        self
    }

    /// Close the connection.
    pub fn close(mut self) -> Self {
        self.actions.push(Action::Close);
        self
    }

    /// Expect the peer to close the connection.
    pub fn end(mut self) -> Self {
        self.actions.push(Action::End);
        self
    }

    /// Execute the flow against the connection.
    pub fn test(self, conn: &dyn Connection) -> Result<(), FlowError> {
        for action in self.actions {
            match action {
                Action::Send(packet) => {
                    conn.send(packet, false)
                        .map_err(|e| FlowError(format!("error sending packet: {}", e)))?;
                }
                Action::Receive(expected) => {
                    let packet = conn.receive().map_err(|e| {
                        FlowError(format!("expected to receive a packet but got error: {}", e))
                    })?;
                    if packet != expected {
                        return Err(FlowError(format!(
                            "expected packet {:?} but got {:?}",
                            expected, packet
                        )));
                    }
                }
                Action::Skip(packet_type) => {
                    let packet = conn.receive().map_err(|e| {
                        FlowError(format!("expected to skip a packet but got error: {}", e))
                    })?;
                    if packet.packet_type() != packet_type {
                        return Err(FlowError(format!(
                            "expected to receive a {} instead of {:?}",
                            packet_type.name(),
                            packet
                        )));
                    }
                }
                Action::Run(f) => f(),
                Action::Close => {
                    conn.close()
                        .map_err(|e| FlowError(format!("error closing connection: {}", e)))?;
                }
                Action::End => match conn.receive() {
                    Err(Error::ConnectionClosed) => {}
                    Ok(packet) => {
                        return Err(FlowError(format!(
                            "expected connection close but got {:?}",
                            packet
                        )))
                    }
                    Err(e) => {
                        return Err(FlowError(format!("expected connection close, got: {}", e)))
                    }
                },
            }
        }
        Ok(())
    }

    /// Execute the flow on a background thread, reporting the result
    /// through the returned channel. A missing result within `timeout`
    /// is reported as an error.
    pub fn test_async(
        self,
        conn: Arc<dyn Connection>,
        timeout: Duration,
    ) -> Receiver<Result<(), FlowError>> {
        let (tx, rx) = bounded(1);
        thread::spawn(move || {
            let (done_tx, done_rx) = bounded(1);
            thread::spawn(move || {
                let _ = done_tx.send(self.test(conn.as_ref()));
            });
            let result = done_rx
                .recv_timeout(timeout)
                .unwrap_or_else(|_| Err(FlowError("timed out waiting for flow to complete".into())));
            let _ = tx.send(result);
        });
        rx
    }
}
