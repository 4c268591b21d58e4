//! Request-reply transport seam. The core owns no sockets; hosts plug in a
//! [`Connector`] for outbound peers and feed [`InboundRequest`]s for the
//! supervisor's own endpoint.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

/// Network location of a peer's request-reply socket.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Client half of a request-reply socket. One request, then exactly one reply.
///
/// Implementations must be cancel-safe in `recv`: the caller wraps exchanges in
/// a timeout, and a reply that arrives after the deadline has to be readable by
/// the next `recv`.
#[async_trait]
pub trait Transport: Send {
    async fn send(&mut self, frame: &[u8]) -> std::io::Result<()>;
    async fn recv(&mut self) -> std::io::Result<Vec<u8>>;

    /// Drop the connection and forget any unanswered request. The next
    /// `send` or `recv` dials fresh.
    fn reset(&mut self);
}

/// Opens a transport for a peer endpoint. Opening is lazy; nothing is dialled here.
pub trait Connector: Send + Sync {
    fn connect(&self, endpoint: &Endpoint) -> Box<dyn Transport>;
}

/// One request received on the supervisor's endpoint, with the slot for its reply.
#[derive(Debug)]
pub struct InboundRequest {
    pub payload: Vec<u8>,
    reply: oneshot::Sender<Vec<u8>>,
}

impl InboundRequest {
    pub fn new(payload: Vec<u8>) -> (Self, oneshot::Receiver<Vec<u8>>) {
        let (reply, rx) = oneshot::channel();
        (Self { payload, reply }, rx)
    }

    /// Send the reply. A requester that already hung up is ignored.
    pub fn respond(self, bytes: Vec<u8>) {
        let _ = self.reply.send(bytes);
    }
}
