//! Direct TCP channels.
//!
//! Frames are length-prefixed: a 4-byte big-endian length followed by the
//! frame bytes. The first frame on every socket is a
//! [`PeerMessage::Hello`] naming the sender; the acceptor tags everything
//! that follows with that address.

use super::{Channel, Connector, Inbound, TransportError, MAX_FRAME_SIZE};
use async_trait::async_trait;
use dashmap::DashMap;
use session_core::ChannelKind;
use session_types::{Hello, PeerMessage, UserId, PROTOCOL_VERSION};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Where each participant accepts direct connections.
pub type AddressBook = Arc<DashMap<UserId, SocketAddr>>;

/// Read one length-prefixed frame.
pub async fn read_frame<R>(reader: &mut R) -> Result<Vec<u8>, TransportError>
where
    R: AsyncRead + Unpin,
{
    // Read 4-byte length prefix (big-endian)
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await.map_err(|e| match e.kind() {
        std::io::ErrorKind::UnexpectedEof => TransportError::ConnectionClosed,
        _ => TransportError::Protocol(e.to_string()),
    })?;
    let len = u32::from_be_bytes(len_buf) as usize;

    if len > MAX_FRAME_SIZE {
        return Err(TransportError::FrameTooLarge(len));
    }

    let mut buf = vec![0u8; len];
    reader
        .read_exact(&mut buf)
        .await
        .map_err(|e| TransportError::Protocol(e.to_string()))?;
    Ok(buf)
}

/// Write one length-prefixed frame.
pub async fn write_frame<W>(writer: &mut W, frame: &[u8]) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    if frame.len() > MAX_FRAME_SIZE {
        return Err(TransportError::FrameTooLarge(frame.len()));
    }
    let len = frame.len() as u32;
    writer
        .write_all(&len.to_be_bytes())
        .await
        .map_err(|e| TransportError::SendFailed(e.to_string()))?;
    writer
        .write_all(frame)
        .await
        .map_err(|e| TransportError::SendFailed(e.to_string()))?;
    writer
        .flush()
        .await
        .map_err(|e| TransportError::SendFailed(e.to_string()))
}

/// Opens direct TCP channels using an address book.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    local: UserId,
    addresses: AddressBook,
    connect_timeout: Duration,
}

impl TcpConnector {
    /// Create a connector sending as `local`.
    pub fn new(local: UserId, addresses: AddressBook, connect_timeout: Duration) -> Self {
        Self {
            local,
            addresses,
            connect_timeout,
        }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Direct
    }

    async fn open(&self, peer: &UserId) -> Result<Box<dyn Channel>, TransportError> {
        let addr = self
            .addresses
            .get(peer)
            .map(|entry| *entry.value())
            .ok_or_else(|| TransportError::ConnectionRefused(format!("no address for {peer}")))?;

        let mut stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(|e| TransportError::ConnectionRefused(e.to_string()))?;
        stream.set_nodelay(true).ok();

        let hello = PeerMessage::Hello(Hello {
            version: PROTOCOL_VERSION,
            user: self.local.clone(),
        })
        .to_bytes()?;
        write_frame(&mut stream, &hello).await?;

        debug!(peer = %peer, %addr, "Direct channel opened");
        Ok(Box::new(TcpChannel {
            stream: Mutex::new(stream),
            open: AtomicBool::new(true),
        }))
    }
}

#[derive(Debug)]
struct TcpChannel {
    stream: Mutex<TcpStream>,
    open: AtomicBool,
}

#[async_trait]
impl Channel for TcpChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Direct
    }

    async fn send(&self, frame: &[u8]) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::ConnectionClosed);
        }
        let mut stream = self.stream.lock().await;
        let result = write_frame(&mut *stream, frame).await;
        if result.is_err() {
            self.open.store(false, Ordering::SeqCst);
        }
        result
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
        let mut stream = self.stream.lock().await;
        let _ = stream.shutdown().await;
    }
}

/// Accepts direct connections and feeds their frames into an inbox.
#[derive(Debug)]
pub struct TcpAcceptor {
    local_addr: SocketAddr,
    task: JoinHandle<()>,
}

impl TcpAcceptor {
    /// Bind and start accepting.
    pub async fn bind(
        addr: SocketAddr,
        inbox: mpsc::UnboundedSender<Inbound>,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let task = tokio::spawn(accept_loop(listener, inbox));
        Ok(Self { local_addr, task })
    }

    /// Address actually bound.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting new connections.
    pub fn shutdown(&self) {
        self.task.abort();
    }
}

impl Drop for TcpAcceptor {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn accept_loop(listener: TcpListener, inbox: mpsc::UnboundedSender<Inbound>) {
    loop {
        match listener.accept().await {
            Ok((stream, remote)) => {
                tokio::spawn(read_connection(stream, remote, inbox.clone()));
            }
            Err(e) => {
                warn!(error = %e, "Accept failed");
            }
        }
    }
}

async fn read_connection(
    mut stream: TcpStream,
    remote: SocketAddr,
    inbox: mpsc::UnboundedSender<Inbound>,
) {
    let from = match read_hello(&mut stream).await {
        Ok(user) => user,
        Err(e) => {
            warn!(%remote, error = %e, "Rejected connection without hello");
            return;
        }
    };
    debug!(%remote, peer = %from, "Direct channel accepted");

    loop {
        match read_frame(&mut stream).await {
            Ok(frame) => {
                let inbound = Inbound {
                    from: from.clone(),
                    frame,
                };
                if inbox.send(inbound).is_err() {
                    return;
                }
            }
            Err(TransportError::ConnectionClosed) => {
                debug!(peer = %from, "Direct channel closed by peer");
                return;
            }
            Err(e) => {
                warn!(peer = %from, error = %e, "Direct channel read failed");
                return;
            }
        }
    }
}

async fn read_hello(stream: &mut TcpStream) -> Result<UserId, TransportError> {
    let frame = read_frame(stream).await?;
    match PeerMessage::from_bytes(&frame)? {
        PeerMessage::Hello(hello) if hello.version == PROTOCOL_VERSION => Ok(hello.user),
        PeerMessage::Hello(hello) => Err(TransportError::Protocol(format!(
            "unsupported protocol version {}",
            hello.version
        ))),
        other => Err(TransportError::Protocol(format!(
            "expected hello, got {}",
            other.kind()
        ))),
    }
}
