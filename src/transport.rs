//! TCP transport for consensus RPCs.
//!
//! Messages are framed with a 4-byte big-endian length prefix followed by a
//! JSON-serialized [`Envelope`]. A background thread accepts incoming
//! connections; each is dispatched to its own short-lived thread which reads
//! one message and forwards it into the receive channel. Outbound messages
//! are sent fire-and-forget on ephemeral threads. Failed sends are logged
//! and dropped, consistent with the protocol's assumption of an unreliable
//! network: timeout and retry handle losses.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::message::Message;
use crate::types::NodeId;

/// Error type for transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("unknown peer: {0}")]
    UnknownPeer(NodeId),
}

/// Wire envelope: a message plus the sender's identity.
#[derive(Serialize, Deserialize)]
struct Envelope<C> {
    from: NodeId,
    message: Message<C>,
}

pub struct Transport<C> {
    local_id: NodeId,
    peers: HashMap<NodeId, SocketAddr>,
    rx: mpsc::Receiver<(NodeId, Message<C>)>,
    /// Keeping this Arc alive closes the listener when Transport is
    /// dropped, which makes the accept loop exit on the next error.
    _listener: Arc<TcpListener>,
}

impl<C> Transport<C>
where
    C: Send + 'static + Serialize + DeserializeOwned,
{
    /// Bind a listener on `addr` and start accepting inbound RPCs. `peers`
    /// must name every node this one may ever talk to, including voters
    /// that join later through reconfiguration.
    pub fn bind(
        local_id: NodeId,
        addr: SocketAddr,
        peers: HashMap<NodeId, SocketAddr>,
    ) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr)?;
        Ok(Self::start(local_id, listener, peers))
    }

    fn start(
        local_id: NodeId,
        listener: TcpListener,
        peers: HashMap<NodeId, SocketAddr>,
    ) -> Self {
        let listener = Arc::new(listener);
        let (tx, rx) = mpsc::channel();
        let listener_bg = Arc::clone(&listener);
        thread::spawn(move || accept_loop::<C>(listener_bg, tx));
        Self {
            local_id,
            peers,
            rx,
            _listener: listener,
        }
    }

    /// Send a message to a peer. Returns immediately; actual delivery
    /// happens on a background thread. Unknown peer is the only synchronous
    /// error; I/O failures during send are logged and dropped.
    pub fn send(&self, to: NodeId, message: Message<C>) -> Result<(), TransportError> {
        let addr = self
            .peers
            .get(&to)
            .copied()
            .ok_or(TransportError::UnknownPeer(to))?;
        let from = self.local_id;
        thread::spawn(move || {
            if let Err(err) = dial_and_send(addr, from, message) {
                tracing::debug!(peer = %to, error = %err, "send failed");
            }
        });
        Ok(())
    }

    /// Block until a message arrives or `timeout` elapses. Returns `None`
    /// on timeout.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<(NodeId, Message<C>)> {
        self.rx.recv_timeout(timeout).ok()
    }

    /// The address this transport is listening on.
    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self._listener.local_addr()?)
    }
}

fn accept_loop<C>(listener: Arc<TcpListener>, tx: mpsc::Sender<(NodeId, Message<C>)>)
where
    C: Send + 'static + DeserializeOwned,
{
    loop {
        match listener.accept() {
            Ok((stream, _)) => {
                let tx = tx.clone();
                thread::spawn(move || {
                    // Bound how long we wait for a slow or misbehaving
                    // sender.
                    let _ = stream.set_read_timeout(Some(Duration::from_secs(2)));
                    if let Ok(envelope) = read_envelope::<C>(&stream) {
                        let _ = tx.send((envelope.from, envelope.message));
                    }
                });
            }
            // Listener was closed (Transport dropped) or an unrecoverable
            // error.
            Err(_) => break,
        }
    }
}

/// Read one length-prefixed JSON envelope from the stream.
fn read_envelope<C: DeserializeOwned>(mut stream: &TcpStream) -> Result<Envelope<C>, TransportError> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf)?;
    let len = u32::from_be_bytes(len_buf) as usize;
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf)?;
    Ok(serde_json::from_slice(&buf)?)
}

/// Connect, send one length-prefixed JSON envelope, and close.
fn dial_and_send<C: Serialize>(
    addr: SocketAddr,
    from: NodeId,
    message: Message<C>,
) -> Result<(), TransportError> {
    let envelope = Envelope { from, message };
    let bytes = serde_json::to_vec(&envelope)?;
    let Ok(len) = u32::try_from(bytes.len()) else {
        return Err(TransportError::Io(io::Error::new(
            io::ErrorKind::InvalidData,
            "message exceeds 4 GiB",
        )));
    };
    let mut stream = TcpStream::connect_timeout(&addr, Duration::from_millis(200))?;
    stream.set_write_timeout(Some(Duration::from_millis(500)))?;
    stream.write_all(&len.to_be_bytes())?;
    stream.write_all(&bytes)?;
    stream.flush()?;
    Ok(())
}
