//! One logical connection to a remote controllable module.
//!
//! Transport failures are recovered here: they flip `connected` off, bump the
//! error count and come back as [`PeerError::Transport`]. The caller decides
//! whether to keep trying.

use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::command::{PeerCommand, Reply};
use crate::response::{self, Response, ResponseDecodeError};
use crate::transport::{Endpoint, Transport};

/// Default round-trip timeout for interactive peers.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(5000);

/// Round trips slower than this are logged, never failed.
pub const DEFAULT_SLOW_REPLY: Duration = Duration::from_millis(500);

pub const RECONNECTED_REPLY: &str = "Connection re-established!";
pub const ALREADY_CONNECTED_REPLY: &str = "Connection already established";

/// Opaque status blob as reported by the peer itself.
pub type StatusMap = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerTimings {
    pub timeout: Duration,
    pub slow_reply: Duration,
}

impl Default for PeerTimings {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            slow_reply: DEFAULT_SLOW_REPLY,
        }
    }
}

/// Cached liveness view of a peer, as returned by the supervisor's `status` command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PeerSummary {
    pub alive: bool,
    pub connected: bool,
}

pub struct PeerConnection {
    name: String,
    endpoint: Endpoint,
    prefix: String,
    transport: Box<dyn Transport>,
    timings: PeerTimings,
    status: Option<StatusMap>,
    error_count: u32,
    connected: bool,
    alive: bool,
}

impl PeerConnection {
    /// New peer: alive, not yet connected, no status.
    pub fn new(
        name: impl Into<String>,
        endpoint: Endpoint,
        prefix: impl Into<String>,
        transport: Box<dyn Transport>,
        timings: PeerTimings,
    ) -> Self {
        Self {
            name: name.into(),
            endpoint,
            prefix: prefix.into(),
            transport,
            timings,
            status: None,
            error_count: 0,
            connected: false,
            alive: true,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Last successfully decoded status; `None` until the first status exchange.
    pub fn status(&self) -> Option<&StatusMap> {
        self.status.as_ref()
    }

    pub fn error_count(&self) -> u32 {
        self.error_count
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn is_alive(&self) -> bool {
        self.alive
    }

    pub fn summary(&self) -> PeerSummary {
        PeerSummary {
            alive: self.alive,
            connected: self.connected,
        }
    }

    /// Build a command line routed to this peer.
    pub fn command(&self, name: &str) -> PeerCommand {
        PeerCommand::new(self.prefix.as_str(), name)
    }

    /// Send one text command and wait for its reply.
    ///
    /// An empty command is the reconnection sentinel: while disconnected it
    /// performs exactly one receive on the existing socket to drain a buffered
    /// reply, and on success marks the peer connected again.
    pub async fn send(&mut self, command: &str) -> Result<Reply, PeerError> {
        if command.is_empty() {
            return self.try_reconnect().await;
        }
        let bytes = self.exchange(command).await?;
        let text = String::from_utf8(bytes).map_err(|e| {
            self.protocol_error(ResponseDecodeError::MalformedResponse(e.to_string()))
        })?;
        Ok(Reply::from_text(text))
    }

    /// Send one command whose reply is a typed binary envelope.
    pub async fn send_typed(&mut self, command: &str) -> Result<Response, PeerError> {
        if command.is_empty() {
            return Err(PeerError::EmptyCommand {
                peer: self.name.clone(),
            });
        }
        let bytes = self.exchange(command).await?;
        response::decode_response(&bytes).map_err(|e| self.protocol_error(e))
    }

    /// Ask the peer for `<prefix>.status` and cache the decoded object.
    /// On any failure the previously cached status stays in place.
    pub async fn query_status(&mut self) -> Result<&StatusMap, PeerError> {
        let cmd = self.command("status").encode();
        let text = match self.send(&cmd).await? {
            Reply::Text(t) => t,
            Reply::Bool(b) => {
                return Err(self.protocol_error(ResponseDecodeError::MalformedResponse(
                    format!("status reply was a bare {}", b),
                )))
            }
        };
        let map: StatusMap = serde_json::from_str(&text).map_err(|e| {
            self.protocol_error(ResponseDecodeError::MalformedResponse(format!(
                "status is not a JSON object: {}",
                e
            )))
        })?;
        Ok(&*self.status.insert(map))
    }

    async fn try_reconnect(&mut self) -> Result<Reply, PeerError> {
        if self.connected {
            return Ok(Reply::Text(ALREADY_CONNECTED_REPLY.to_string()));
        }
        match tokio::time::timeout(self.timings.timeout, self.transport.recv()).await {
            Ok(Ok(_drained)) => {
                self.mark_connected();
                info!(peer = %self.name, endpoint = %self.endpoint, "connection re-established");
                Ok(Reply::Text(RECONNECTED_REPLY.to_string()))
            }
            Ok(Err(e)) => Err(self.transport_failure(format!("reconnect failed: {}", e))),
            Err(_) => Err(self.transport_failure("reconnect timed out".to_string())),
        }
    }

    async fn exchange(&mut self, command: &str) -> Result<Vec<u8>, PeerError> {
        let started = Instant::now();
        let transport = &mut self.transport;
        let outcome = tokio::time::timeout(self.timings.timeout, async move {
            transport.send(command.as_bytes()).await?;
            transport.recv().await
        })
        .await;
        let bytes = match outcome {
            Ok(Ok(bytes)) => bytes,
            Ok(Err(e)) => return Err(self.transport_failure(format!("{} failed: {}", command, e))),
            Err(_) => {
                return Err(self.transport_failure(format!(
                    "{} timed out after {} ms",
                    command,
                    self.timings.timeout.as_millis()
                )))
            }
        };
        self.mark_connected();
        let elapsed = started.elapsed();
        if elapsed > self.timings.slow_reply {
            warn!(
                peer = %self.name,
                command,
                elapsed_ms = elapsed.as_millis() as u64,
                "long response time"
            );
        }
        Ok(bytes)
    }

    fn mark_connected(&mut self) {
        self.connected = true;
        self.error_count = 0;
    }

    fn transport_failure(&mut self, reason: String) -> PeerError {
        self.connected = false;
        self.error_count = self.error_count.saturating_add(1);
        debug!(peer = %self.name, error_count = self.error_count, %reason, "exchange failed");
        PeerError::Transport {
            peer: self.name.clone(),
            reason,
            error_count: self.error_count,
        }
    }

    fn protocol_error(&self, source: ResponseDecodeError) -> PeerError {
        PeerError::Protocol {
            peer: self.name.clone(),
            source,
        }
    }

    /// Operator reset: clear errors and make the peer eligible for polling again.
    pub(crate) fn revive(&mut self) {
        self.error_count = 0;
        self.alive = true;
    }

    /// Give up on a peer that kept failing. Never applies to a connected peer.
    pub(crate) fn mark_dead(&mut self) {
        if !self.connected {
            self.alive = false;
        }
    }

    /// After a power cycle the old connection is gone; the next tick reconnects
    /// on a freshly dialled socket.
    pub(crate) fn reset_after_reboot(&mut self) {
        self.transport.reset();
        self.connected = false;
        self.error_count = 0;
        self.alive = true;
    }
}

impl std::fmt::Debug for PeerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerConnection")
            .field("name", &self.name)
            .field("endpoint", &self.endpoint)
            .field("prefix", &self.prefix)
            .field("error_count", &self.error_count)
            .field("connected", &self.connected)
            .field("alive", &self.alive)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    /// Peer unreachable: send/receive failed or timed out. Recovered, not fatal.
    #[error("{peer}: {reason} (error count {error_count})")]
    Transport {
        peer: String,
        reason: String,
        error_count: u32,
    },
    /// Peer answered, but with something that could not be decoded.
    #[error("{peer}: {source}")]
    Protocol {
        peer: String,
        #[source]
        source: ResponseDecodeError,
    },
    #[error("{peer}: empty command")]
    EmptyCommand { peer: String },
}
