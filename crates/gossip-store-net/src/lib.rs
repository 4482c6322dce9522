//! Networking primitives for the gossip record store
//!
//! This crate provides:
//! - The fixed set of gossip wire messages
//! - Length-prefixed message framing
//! - The abstract request/response `Transport` and its TCP implementation
//! - An in-process transport with fault injection

pub mod framing;
pub mod memory;
pub mod messages;
pub mod transport;

pub use framing::{Frame, FrameCodec, FrameType};
pub use memory::{Fault, MemoryNetwork, MemoryTransport};
pub use messages::{Message, MessageLimits, ProtocolError};
pub use transport::{serve, RequestHandler, TcpTransport, Transport, TransportError};
