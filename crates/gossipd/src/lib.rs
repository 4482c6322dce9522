//! gossipd - signed record store with gossip convergence
//!
//! This daemon provides:
//! - Append-only, content-addressed record storage
//! - Integrity and authenticity checks on every insert
//! - Peer registry with backoff, strikes and quarantine
//! - Gossip rounds (inventory, fetch, push) on a bounded session pool

pub mod config;
pub mod engine;
pub mod registry;
pub mod server;
pub mod service;
pub mod storage;
pub mod store;

pub use config::Config;
pub use engine::{EngineConfig, GossipEngine, RoundReport, SessionPhase, SyncError};
pub use registry::{BackoffPolicy, PeerInfo, PeerRegistry, PeerStatus, SyncCursor};
pub use server::Server;
pub use service::GossipService;
pub use storage::Storage;
pub use store::{ContentStore, PutOutcome, RejectReason};
