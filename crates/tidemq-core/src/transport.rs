//! Abstract packet transport.
//!
//! The client engine and the broker dispatcher both talk to a
//! [`Connection`]: three operations over whole packets. Production
//! transports frame packets over TCP or TLS; tests use the in-memory
//! [`Pipe`] which hands packets from one endpoint to the other through a
//! rendezvous channel.

use std::sync::Arc;

use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::packet::Packet;

/// A bidirectional packet connection.
///
/// `receive` signals end of stream with [`Error::ConnectionClosed`].
/// The `async_hint` on `send` lets buffering transports delay the flush;
/// implementations are free to ignore it.
pub trait Connection: Send + Sync {
    fn send(&self, packet: Packet, async_hint: bool) -> Result<()>;
    fn receive(&self) -> Result<Packet>;
    fn close(&self) -> Result<()>;
}

impl<T: Connection + ?Sized> Connection for Arc<T> {
    fn send(&self, packet: Packet, async_hint: bool) -> Result<()> {
        (**self).send(packet, async_hint)
    }

    fn receive(&self) -> Result<Packet> {
        (**self).receive()
    }

    fn close(&self) -> Result<()> {
        (**self).close()
    }
}

/// One endpoint of an in-memory packet pipe.
pub struct Pipe {
    tx: Sender<Packet>,
    rx: Receiver<Packet>,
    /// Receiving on a dropped sender unblocks both endpoints; see close().
    close_rx: Receiver<()>,
    close_tx: Arc<Mutex<Option<Sender<()>>>>,
}

/// Create a connected pair of pipe endpoints.
///
/// Sends rendezvous with the peer's receive: `send` blocks until the
/// other endpoint picks the packet up or the pipe is closed.
pub fn pipe() -> (Pipe, Pipe) {
    let (a_tx, b_rx) = bounded(0);
    let (b_tx, a_rx) = bounded(0);
    let (close_tx, close_rx) = bounded::<()>(0);
    let close_tx = Arc::new(Mutex::new(Some(close_tx)));

    let a = Pipe {
        tx: a_tx,
        rx: a_rx,
        close_rx: close_rx.clone(),
        close_tx: close_tx.clone(),
    };
    let b = Pipe {
        tx: b_tx,
        rx: b_rx,
        close_rx,
        close_tx,
    };
    (a, b)
}

impl Connection for Pipe {
    fn send(&self, packet: Packet, _async_hint: bool) -> Result<()> {
        crossbeam_channel::select! {
            send(self.tx, packet) -> res => res.map_err(|_| Error::ConnectionClosed),
            recv(self.close_rx) -> _ => Err(Error::ConnectionClosed),
        }
    }

    fn receive(&self) -> Result<Packet> {
        crossbeam_channel::select! {
            recv(self.rx) -> res => res.map_err(|_| Error::ConnectionClosed),
            recv(self.close_rx) -> _ => Err(Error::ConnectionClosed),
        }
    }

    fn close(&self) -> Result<()> {
        // Dropping the sender disconnects close_rx on both endpoints.
        self.close_tx.lock().take();
        Ok(())
    }
}
