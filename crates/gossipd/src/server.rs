//! gossipd server - wires storage, gossip engine and transport together

use crate::config::{Config, NodeState};
use crate::engine::GossipEngine;
use crate::registry::{PeerRegistry, RegistryStats};
use crate::service::GossipService;
use crate::storage::{Storage, StorageError};
use crate::store::{ContentStore, PutOutcome};
use gossip_store_core::types::*;
use gossip_store_core::Identity;
use gossip_store_net::transport::{serve, TcpTransport, TransportError};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const NODE_STATE_KEY: &str = "node_state";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Server errors
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Bind to {0} failed: {1}")]
    BindFailed(SocketAddr, std::io::Error),
    #[error("Invalid node state: {0}")]
    State(#[from] postcard::Error),
}

/// Server state
pub struct Server {
    config: Config,
    identity: Identity,
    storage: Arc<Storage>,
    store: Arc<ContentStore>,
    registry: Arc<PeerRegistry>,
    engine: Arc<GossipEngine>,
    service: Arc<GossipService>,
    /// Shutdown signal
    cancel: CancellationToken,
}

impl Server {
    /// Create a new server instance
    pub fn new(config: Config) -> Result<Self, ServerError> {
        let storage = Arc::new(Storage::open(&config.data_dir)?);
        let identity = load_or_create_identity(&storage)?;
        let limits = config.message_limits();
        let store = Arc::new(
            ContentStore::new(storage.clone()).with_max_record_bytes(limits.max_record_bytes),
        );

        let registry = Arc::new(PeerRegistry::new(
            config.backoff_policy(),
            Some(config.self_address()),
        ));
        for peer in &config.peers {
            if registry.add(*peer) {
                info!("Seed peer: {}", peer);
            }
        }

        let cancel = CancellationToken::new();
        let transport = Arc::new(TcpTransport::new(CONNECT_TIMEOUT, limits));
        let engine = Arc::new(GossipEngine::with_cancel(
            store.clone(),
            registry.clone(),
            transport,
            config.engine_config(),
            cancel.child_token(),
        ));
        let service = Arc::new(
            GossipService::new(store.clone(), config.max_inventory_hashes).with_limits(limits),
        );

        Ok(Self {
            config,
            identity,
            storage,
            store,
            registry,
            engine,
            service,
            cancel,
        })
    }

    /// Our signer hash
    pub fn signer_hash(&self) -> SignerHash {
        self.identity.identity_hash()
    }

    pub fn store(&self) -> &Arc<ContentStore> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<PeerRegistry> {
        &self.registry
    }

    pub fn engine(&self) -> &Arc<GossipEngine> {
        &self.engine
    }

    /// Sign and store a payload as this node.
    pub fn publish(&self, payload: Vec<u8>) -> Result<(Record, PutOutcome), ServerError> {
        Ok(self.store.publish(&self.identity, payload)?)
    }

    /// Publish each file's contents; returns how many were newly stored.
    pub fn publish_files(&self, paths: &[impl AsRef<Path>]) -> Result<usize, ServerError> {
        let mut stored = 0;
        for path in paths {
            let path = path.as_ref();
            let (record, outcome) = self.publish(std::fs::read(path)?)?;
            match outcome {
                PutOutcome::Stored(marker) => {
                    info!("Published {} as {} at {}", path.display(), record.content_hash, marker);
                    stored += 1;
                }
                other => warn!(
                    "Did not publish {}: {}",
                    path.display(),
                    other.reason().unwrap_or_default()
                ),
            }
        }
        Ok(stored)
    }

    /// Bind the configured address and run until shutdown
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(self.config.listen)
            .await
            .map_err(|e| ServerError::BindFailed(self.config.listen, e))?;
        self.run_with_listener(listener).await
    }

    /// Serve peers and gossip until shutdown
    pub async fn run_with_listener(&self, listener: TcpListener) -> Result<(), ServerError> {
        info!(
            "Starting gossipd on {} (signer {}, {} records, {} peers)",
            listener.local_addr()?,
            self.signer_hash(),
            self.store.len(),
            self.registry.len()
        );

        let publish = self.config.publish.clone();
        if !publish.is_empty() {
            self.publish_files(&publish)?;
        }

        let responder = serve(
            listener,
            self.service.clone(),
            self.config.message_limits(),
            self.cancel.child_token(),
        );
        let (served, ()) = tokio::join!(responder, self.engine.clone().run());

        self.storage.flush()?;
        info!("gossipd stopped");
        served.map_err(ServerError::from)
    }

    /// Shutdown the server
    pub fn shutdown(&self) {
        info!("Shutting down...");
        self.cancel.cancel();
    }

    /// Shutdown handle that can be moved into a signal task
    pub fn shutdown_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Get server statistics
    pub fn stats(&self) -> ServerStats {
        ServerStats {
            record_count: self.store.len(),
            marker: self.store.current_marker(),
            rejected: self.store.rejected_count(),
            active_sessions: self.engine.active_sessions(),
            peers: self.registry.stats(),
        }
    }
}

/// Restore the persisted identity, or create and persist a new one.
fn load_or_create_identity(storage: &Storage) -> Result<Identity, ServerError> {
    if let Some(bytes) = storage.get_metadata(NODE_STATE_KEY)? {
        let state: NodeState = postcard::from_bytes(&bytes)?;
        return Ok(Identity::from_seed(&state.identity_seed));
    }

    let identity = Identity::generate();
    let state = NodeState {
        identity_seed: identity.seed(),
    };
    storage.put_metadata(NODE_STATE_KEY, &postcard::to_allocvec(&state)?)?;
    storage.flush()?;
    info!("Created node identity {}", identity.identity_hash());
    Ok(identity)
}

/// Server statistics
#[derive(Debug, Clone)]
pub struct ServerStats {
    pub record_count: usize,
    pub marker: Marker,
    pub rejected: u64,
    pub active_sessions: usize,
    pub peers: RegistryStats,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::test_config;
    use tempfile::tempdir;

    #[test]
    fn test_server_creation() {
        let dir = tempdir().unwrap();
        let mut config = test_config();
        config.data_dir = dir.path().to_path_buf();
        config.peers = vec!["127.0.0.1:9200".parse().unwrap()];

        let server = Server::new(config).unwrap();
        let stats = server.stats();
        assert_eq!(stats.record_count, 0);
        assert_eq!(stats.marker, Marker::ORIGIN);
        assert_eq!(stats.peers.total, 1);
    }

    #[test]
    fn test_identity_persists() {
        let dir = tempdir().unwrap();
        let mut config = test_config();
        config.data_dir = dir.path().to_path_buf();

        let first = Server::new(config.clone()).unwrap().signer_hash();
        let second = Server::new(config).unwrap().signer_hash();
        assert_eq!(first, second);
    }

    #[test]
    fn test_publish_files() {
        let dir = tempdir().unwrap();
        let mut config = test_config();
        config.data_dir = dir.path().join("db");

        let a = dir.path().join("a.txt");
        let b = dir.path().join("b.txt");
        std::fs::write(&a, b"alpha").unwrap();
        std::fs::write(&b, b"alpha").unwrap();

        let server = Server::new(config).unwrap();
        assert_eq!(server.publish_files(&[a, b]).unwrap(), 1);
        assert_eq!(server.stats().record_count, 1);
    }

    #[test]
    fn test_oversized_file_not_published() {
        let dir = tempdir().unwrap();
        let mut config = test_config();
        config.data_dir = dir.path().join("db");

        let big = dir.path().join("big.bin");
        std::fs::write(&big, vec![0u8; 2 * 1024 * 1024]).unwrap();

        let server = Server::new(config).unwrap();
        assert_eq!(server.publish_files(&[big]).unwrap(), 0);
        assert_eq!(server.stats().record_count, 0);
        assert_eq!(server.stats().rejected, 1);
    }

    #[tokio::test]
    async fn test_bind_failure_keeps_cause() {
        let dir = tempdir().unwrap();
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut config = test_config();
        config.data_dir = dir.path().to_path_buf();
        config.listen = taken.local_addr().unwrap();

        let server = Server::new(config).unwrap();
        match server.run().await {
            Err(ServerError::BindFailed(addr, e)) => {
                assert_eq!(addr, taken.local_addr().unwrap());
                assert_eq!(e.kind(), std::io::ErrorKind::AddrInUse);
            }
            other => panic!("expected bind failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_run_and_shutdown() {
        let dir = tempdir().unwrap();
        let mut config = test_config();
        config.data_dir = dir.path().to_path_buf();

        let server = Arc::new(Server::new(config).unwrap());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();

        let running = server.clone();
        let handle = tokio::spawn(async move { running.run_with_listener(listener).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        server.shutdown();

        handle.await.unwrap().unwrap();
    }
}
