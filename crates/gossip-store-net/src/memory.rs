//! In-process transport for tests and simulations
//!
//! A [`MemoryNetwork`] routes requests straight to registered handlers.
//! Messages still pass through frame encoding and boundary validation, and
//! per-address faults (unreachable, fail after N calls, delay) can be
//! injected to exercise the engine's failure paths.

use crate::framing::{Frame, FrameCodec};
use crate::messages::{Message, MessageLimits};
use crate::transport::{RequestHandler, Transport, TransportError};
use async_trait::async_trait;
use bytes::BytesMut;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::codec::{Decoder, Encoder};

/// Injected failure for one address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Every call is refused
    Unreachable,
    /// Calls succeed until this many have been served, then are refused
    FailAfter(u64),
    /// Each call sleeps before being served
    Delay(Duration),
}

/// Shared in-process network
#[derive(Default)]
pub struct MemoryNetwork {
    handlers: RwLock<HashMap<SocketAddr, Arc<dyn RequestHandler>>>,
    faults: RwLock<HashMap<SocketAddr, Fault>>,
    calls: RwLock<HashMap<SocketAddr, u64>>,
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Attach a handler at `addr`
    pub fn register(&self, addr: SocketAddr, handler: Arc<dyn RequestHandler>) {
        self.handlers.write().insert(addr, handler);
    }

    /// Inject a fault for `addr`
    pub fn set_fault(&self, addr: SocketAddr, fault: Fault) {
        self.faults.write().insert(addr, fault);
        self.calls.write().remove(&addr);
    }

    /// Remove any fault for `addr`
    pub fn clear_fault(&self, addr: &SocketAddr) {
        self.faults.write().remove(addr);
    }

    /// Requests served by `addr` so far
    pub fn call_count(&self, addr: &SocketAddr) -> u64 {
        self.calls.read().get(addr).copied().unwrap_or(0)
    }

    /// Transport bound to a local address on this network
    pub fn transport(self: &Arc<Self>, local: SocketAddr) -> MemoryTransport {
        MemoryTransport {
            network: self.clone(),
            local,
            limits: MessageLimits::default(),
        }
    }

    fn admit(&self, peer: SocketAddr) -> Result<Option<Duration>, TransportError> {
        let fault = self.faults.read().get(&peer).copied();
        let mut calls = self.calls.write();
        let served = calls.entry(peer).or_insert(0);
        match fault {
            Some(Fault::Unreachable) => Err(TransportError::ConnectionRefused(peer)),
            Some(Fault::FailAfter(limit)) if *served >= limit => {
                Err(TransportError::ConnectionRefused(peer))
            }
            Some(Fault::Delay(delay)) => {
                *served += 1;
                Ok(Some(delay))
            }
            _ => {
                *served += 1;
                Ok(None)
            }
        }
    }
}

/// [`Transport`] endpoint on a [`MemoryNetwork`]
#[derive(Clone)]
pub struct MemoryTransport {
    network: Arc<MemoryNetwork>,
    local: SocketAddr,
    limits: MessageLimits,
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&self, peer: SocketAddr, message: Message) -> Result<Message, TransportError> {
        let handler = self
            .network
            .handlers
            .read()
            .get(&peer)
            .cloned()
            .ok_or(TransportError::ConnectionRefused(peer))?;

        if let Some(delay) = self.network.admit(peer)? {
            tokio::time::sleep(delay).await;
        }

        let request = through_codec(message.to_frame()?)?;
        let request = Message::decode_checked(&request, &self.limits)?;
        let response = handler.handle(self.local, request).await;
        let response = through_codec(response.to_frame()?)?;
        Ok(Message::decode_checked(&response, &self.limits)?)
    }
}

/// Encode and decode a frame as TCP would, so frame size limits apply.
fn through_codec(frame: Frame) -> Result<Frame, TransportError> {
    let mut codec = FrameCodec::new();
    let mut buf = BytesMut::new();
    codec.encode(frame, &mut buf)?;
    codec
        .decode(&mut buf)?
        .ok_or(TransportError::ConnectionClosed)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct PongHandler;

    #[async_trait]
    impl RequestHandler for PongHandler {
        async fn handle(&self, _from: SocketAddr, _message: Message) -> Message {
            Message::Pong
        }
    }

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[tokio::test]
    async fn test_routes_to_handler() {
        let network = MemoryNetwork::new();
        network.register(addr(2), Arc::new(PongHandler));

        let transport = network.transport(addr(1));
        assert_eq!(transport.send(addr(2), Message::Ping).await.unwrap(), Message::Pong);
        assert_eq!(network.call_count(&addr(2)), 1);

        // Nothing registered here
        assert!(matches!(
            transport.send(addr(3), Message::Ping).await,
            Err(TransportError::ConnectionRefused(_))
        ));
    }

    #[tokio::test]
    async fn test_fail_after() {
        let network = MemoryNetwork::new();
        network.register(addr(2), Arc::new(PongHandler));
        network.set_fault(addr(2), Fault::FailAfter(2));

        let transport = network.transport(addr(1));
        assert!(transport.send(addr(2), Message::Ping).await.is_ok());
        assert!(transport.send(addr(2), Message::Ping).await.is_ok());
        assert!(transport.send(addr(2), Message::Ping).await.is_err());

        network.clear_fault(&addr(2));
        assert!(transport.send(addr(2), Message::Ping).await.is_ok());
    }

    #[tokio::test]
    async fn test_oversized_response_fails_like_tcp() {
        struct Bloated;

        #[async_trait]
        impl RequestHandler for Bloated {
            async fn handle(&self, _from: SocketAddr, _message: Message) -> Message {
                Message::error("x".repeat(crate::framing::MAX_FRAME_SIZE))
            }
        }

        let network = MemoryNetwork::new();
        network.register(addr(2), Arc::new(Bloated));

        let transport = network.transport(addr(1));
        assert!(matches!(
            transport.send(addr(2), Message::Ping).await,
            Err(TransportError::Frame(_))
        ));
    }

    #[tokio::test]
    async fn test_unreachable() {
        let network = MemoryNetwork::new();
        network.register(addr(2), Arc::new(PongHandler));
        network.set_fault(addr(2), Fault::Unreachable);

        let transport = network.transport(addr(1));
        assert!(matches!(
            transport.send(addr(2), Message::Ping).await,
            Err(TransportError::ConnectionRefused(_))
        ));
    }
}
