//! Request/response transport
//!
//! The gossip engine talks to peers only through the [`Transport`] trait:
//! one request message in, one response message out. [`TcpTransport`] runs
//! each exchange over a framed TCP connection; [`serve`] is the matching
//! accept loop that dispatches inbound requests to a [`RequestHandler`].

use crate::framing::{FrameCodec, FrameError};
use crate::messages::{Message, MessageLimits, ProtocolError};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Connection refused by {0}")]
    ConnectionRefused(SocketAddr),
    #[error("Timed out")]
    Timeout,
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Cancelled")]
    Cancelled,
    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

/// Outbound request/response channel to peers
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one request to `peer` and wait for its response.
    async fn send(&self, peer: SocketAddr, message: Message) -> Result<Message, TransportError>;
}

/// Inbound request dispatch
#[async_trait]
pub trait RequestHandler: Send + Sync {
    /// Answer one request from `from`.
    async fn handle(&self, from: SocketAddr, message: Message) -> Message;
}

/// TCP transport: one framed connection per exchange
#[derive(Debug, Clone)]
pub struct TcpTransport {
    connect_timeout: Duration,
    limits: MessageLimits,
}

impl TcpTransport {
    pub fn new(connect_timeout: Duration, limits: MessageLimits) -> Self {
        Self {
            connect_timeout,
            limits,
        }
    }

    async fn connect(&self, peer: SocketAddr) -> Result<TcpStream, TransportError> {
        match tokio::time::timeout(self.connect_timeout, TcpStream::connect(peer)).await {
            Err(_) => Err(TransportError::Timeout),
            Ok(Err(e)) if e.kind() == ErrorKind::ConnectionRefused => {
                Err(TransportError::ConnectionRefused(peer))
            }
            Ok(Err(e)) => Err(TransportError::Io(e)),
            Ok(Ok(stream)) => Ok(stream),
        }
    }
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new(Duration::from_secs(5), MessageLimits::default())
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn send(&self, peer: SocketAddr, message: Message) -> Result<Message, TransportError> {
        let stream = self.connect(peer).await?;
        stream.set_nodelay(true)?;
        let mut framed = Framed::new(stream, FrameCodec::new());

        framed.send(message.to_frame()?).await?;

        let frame = framed
            .next()
            .await
            .ok_or(TransportError::ConnectionClosed)??;
        Ok(Message::decode_checked(&frame, &self.limits)?)
    }
}

/// Accept connections and answer requests until `cancel` fires.
pub async fn serve(
    listener: TcpListener,
    handler: Arc<dyn RequestHandler>,
    limits: MessageLimits,
    cancel: CancellationToken,
) -> Result<(), TransportError> {
    info!("Transport listening on {}", listener.local_addr()?);

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        debug!("Accepted connection from {}", addr);
                        let handler = handler.clone();
                        let cancel = cancel.child_token();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, addr, handler, limits, cancel).await {
                                debug!("Connection error from {}: {}", addr, e);
                            }
                        });
                    }
                    Err(e) => {
                        warn!("Accept error: {}", e);
                    }
                }
            }
            _ = cancel.cancelled() => {
                info!("Transport shutting down");
                return Ok(());
            }
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    handler: Arc<dyn RequestHandler>,
    limits: MessageLimits,
    cancel: CancellationToken,
) -> Result<(), TransportError> {
    let mut framed = Framed::new(stream, FrameCodec::new());

    loop {
        let frame = tokio::select! {
            next = framed.next() => match next {
                Some(frame) => frame?,
                None => return Ok(()),
            },
            _ = cancel.cancelled() => return Ok(()),
        };

        let response = match Message::decode_checked(&frame, &limits) {
            Ok(Message::Ping) => Message::Pong,
            Ok(request) => handler.handle(addr, request).await,
            Err(e) => {
                warn!("Malformed request from {}: {}", addr, e);
                framed.send(Message::error(e.to_string()).to_frame()?).await?;
                return Ok(());
            }
        };

        framed.send(response.to_frame()?).await?;
    }
}
