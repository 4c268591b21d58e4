//! Request-reply over TCP: one frame per message (4 bytes LE length + payload).
//! Client side for peers, server side for the supervisor's command endpoint.

use std::io;
use std::time::Duration;

use async_trait::async_trait;
use fsm_core::{Connector, Endpoint, InboundRequest, Transport};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, warn};

const LEN_SIZE: usize = 4;
const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;
/// Pause after a failed accept (EMFILE and friends) before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

fn encode_frame(payload: &[u8]) -> io::Result<Vec<u8>> {
    let len = u32::try_from(payload.len())
        .ok()
        .filter(|&l| l <= MAX_FRAME_LEN)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "frame too large"))?;
    let mut out = Vec::with_capacity(LEN_SIZE + payload.len());
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(payload);
    Ok(out)
}

/// Take one complete frame off the front of `buf`, if one is there.
fn take_frame(buf: &mut Vec<u8>) -> io::Result<Option<Vec<u8>>> {
    if buf.len() < LEN_SIZE {
        return Ok(None);
    }
    let len = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "frame too large"));
    }
    let end = LEN_SIZE + len as usize;
    if buf.len() < end {
        return Ok(None);
    }
    let payload = buf[LEN_SIZE..end].to_vec();
    buf.drain(..end);
    Ok(Some(payload))
}

/// Read until `buf` holds a whole frame. Cancel-safe: bytes already read stay in `buf`.
async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut Vec<u8>) -> io::Result<Vec<u8>> {
    loop {
        if let Some(frame) = take_frame(buf)? {
            return Ok(frame);
        }
        let mut chunk = [0u8; 8192];
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed by peer",
            ));
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

async fn dial(endpoint: &Endpoint) -> io::Result<TcpStream> {
    let stream = TcpStream::connect((endpoint.host.as_str(), endpoint.port)).await?;
    stream.set_nodelay(true)?;
    Ok(stream)
}

/// Client socket with request-reply discipline: at most one request in
/// flight. Dials lazily. A request is written exactly once: if the connection
/// drops before its reply arrives, the request is abandoned, never re-sent.
pub struct TcpReqSocket {
    endpoint: Endpoint,
    stream: Option<TcpStream>,
    buf: Vec<u8>,
    awaiting_reply: bool,
}

impl TcpReqSocket {
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            stream: None,
            buf: Vec::new(),
            awaiting_reply: false,
        }
    }

    fn drop_connection(&mut self) {
        self.stream = None;
        self.buf.clear();
    }
}

#[async_trait]
impl Transport for TcpReqSocket {
    async fn send(&mut self, payload: &[u8]) -> io::Result<()> {
        if self.awaiting_reply {
            return Err(io::Error::new(
                io::ErrorKind::WouldBlock,
                "previous request is still awaiting its reply",
            ));
        }
        let framed = encode_frame(payload)?;
        // Taken out while writing: a write cut short by a timeout leaves no half-framed stream behind.
        let mut stream = match self.stream.take() {
            Some(s) => s,
            None => {
                self.buf.clear();
                dial(&self.endpoint).await?
            }
        };
        stream.write_all(&framed).await?;
        self.stream = Some(stream);
        self.awaiting_reply = true;
        Ok(())
    }

    async fn recv(&mut self) -> io::Result<Vec<u8>> {
        if !self.awaiting_reply {
            // Nothing to drain: a fresh dial is the reachability check.
            self.drop_connection();
            self.stream = Some(dial(&self.endpoint).await?);
            return Ok(Vec::new());
        }
        let Some(stream) = self.stream.as_mut() else {
            self.awaiting_reply = false;
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "connection lost before the reply arrived",
            ));
        };
        match read_frame(stream, &mut self.buf).await {
            Ok(reply) => {
                self.awaiting_reply = false;
                Ok(reply)
            }
            Err(e) => {
                self.reset();
                Err(e)
            }
        }
    }

    fn reset(&mut self) {
        self.drop_connection();
        self.awaiting_reply = false;
    }
}

/// Opens a [`TcpReqSocket`] per peer.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

impl Connector for TcpConnector {
    fn connect(&self, endpoint: &Endpoint) -> Box<dyn Transport> {
        Box::new(TcpReqSocket::new(endpoint.clone()))
    }
}

/// Accept command connections and hand each request to the supervisor loop.
/// Each connection is served request by request; every request gets one reply frame.
/// A failed accept is logged and retried; the endpoint only stops with the process.
pub async fn serve_commands(listener: TcpListener, commands: mpsc::Sender<InboundRequest>) {
    loop {
        let (stream, from) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                accept_backoff(&e).await;
                continue;
            }
        };
        debug!(%from, "command connection accepted");
        let commands = commands.clone();
        tokio::spawn(async move {
            if let Err(e) = serve_connection(stream, commands).await {
                if e.kind() != io::ErrorKind::UnexpectedEof {
                    warn!(%from, error = %e, "command connection failed");
                }
            }
        });
    }
}

async fn accept_backoff(error: &io::Error) {
    warn!(error = %error, backoff_ms = ACCEPT_BACKOFF.as_millis() as u64, "accept failed");
    tokio::time::sleep(ACCEPT_BACKOFF).await;
}

async fn serve_connection(
    mut stream: TcpStream,
    commands: mpsc::Sender<InboundRequest>,
) -> io::Result<()> {
    let mut buf = Vec::new();
    loop {
        let payload = read_frame(&mut stream, &mut buf).await?;
        let (req, reply) = InboundRequest::new(payload);
        if commands.send(req).await.is_err() {
            // Supervisor has shut down.
            return Ok(());
        }
        let bytes = match reply.await {
            Ok(b) => b,
            Err(_) => return Ok(()),
        };
        stream.write_all(&encode_frame(&bytes)?).await?;
        stream.flush().await?;
    }
}

/// Send one command to a supervisor endpoint and wait for its reply.
pub async fn request(endpoint: &Endpoint, line: &str, timeout: Duration) -> io::Result<Vec<u8>> {
    let mut socket = TcpReqSocket::new(endpoint.clone());
    let exchange = async {
        socket.send(line.as_bytes()).await?;
        socket.recv().await
    };
    tokio::time::timeout(timeout, exchange)
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "no reply from supervisor"))?
}
