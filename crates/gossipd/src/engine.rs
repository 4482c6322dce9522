//! Gossip reconciliation engine
//!
//! A timer drives rounds against peers chosen by the [`PeerRegistry`]. Each
//! round exchanges inventories, fetches what we lack, and pushes what the
//! peer lacks. Sessions run on a bounded pool, each under a deadline, and
//! observe engine cancellation at every transport call.

use crate::registry::{PeerInfo, PeerRegistry, SyncCursor};
use crate::storage::StorageError;
use crate::store::{ContentStore, PutOutcome};
use gossip_store_core::types::*;
use gossip_store_net::messages::{
    FetchEntry, FetchRequest, InventoryRequest, InventoryResponse, Message, ProtocolError,
    PushRecord, PushStatus,
};
use gossip_store_net::transport::{Transport, TransportError};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Sync round errors
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Transport error: {0}")]
    Transport(TransportError),
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    /// Peer answered with an error message
    #[error("Remote error: {0}")]
    Remote(String),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Peer unavailable: {0}")]
    PeerUnavailable(SocketAddr),
    #[error("Cancelled")]
    Cancelled,
}

impl From<TransportError> for SyncError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Protocol(p) => SyncError::Protocol(p),
            TransportError::Cancelled => SyncError::Cancelled,
            other => SyncError::Transport(other),
        }
    }
}

/// Engine tuning
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Scheduler tick
    pub gossip_interval: Duration,
    /// Simultaneous sessions
    pub max_sessions: usize,
    /// Deadline for one whole round
    pub round_deadline: Duration,
    /// Hashes per fetch request
    pub fetch_batch_size: usize,
    /// Hashes per inventory summary
    pub max_inventory_hashes: usize,
    /// Reset a peer's cursor every N successful rounds (0 = never)
    pub full_resync_rounds: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            gossip_interval: Duration::from_secs(30),
            max_sessions: 4,
            round_deadline: Duration::from_secs(60),
            fetch_batch_size: 64,
            max_inventory_hashes: 4096,
            full_resync_rounds: 100,
        }
    }
}

/// Session phase for one peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Idle,
    InventoryExchange,
    FetchMissing,
    PushMissing,
    Cooldown,
}

/// What one round accomplished
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoundReport {
    /// Records fetched and stored
    pub fetched: usize,
    /// Fetched records we already had
    pub duplicates: usize,
    /// Fetched records that failed verification
    pub rejected: usize,
    /// Hashes the peer no longer had
    pub not_found: usize,
    /// Records the peer stored from our pushes
    pub pushed: usize,
    /// Pushes the peer refused
    pub push_refused: usize,
    /// Strikes charged to the peer this round
    pub strikes: u32,
    /// Cursor recorded for the next round
    pub cursor: SyncCursor,
}

/// Gossip engine
pub struct GossipEngine {
    store: Arc<ContentStore>,
    registry: Arc<PeerRegistry>,
    transport: Arc<dyn Transport>,
    config: EngineConfig,
    /// In-flight sessions
    sessions: RwLock<HashMap<SocketAddr, SessionPhase>>,
    permits: Arc<Semaphore>,
    cancel: CancellationToken,
}

impl GossipEngine {
    pub fn new(
        store: Arc<ContentStore>,
        registry: Arc<PeerRegistry>,
        transport: Arc<dyn Transport>,
        config: EngineConfig,
    ) -> Self {
        Self::with_cancel(store, registry, transport, config, CancellationToken::new())
    }

    pub fn with_cancel(
        store: Arc<ContentStore>,
        registry: Arc<PeerRegistry>,
        transport: Arc<dyn Transport>,
        config: EngineConfig,
        cancel: CancellationToken,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_sessions.max(1)));
        Self {
            store,
            registry,
            transport,
            config,
            sessions: RwLock::new(HashMap::new()),
            permits,
            cancel,
        }
    }

    pub fn registry(&self) -> &Arc<PeerRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &Arc<ContentStore> {
        &self.store
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stop the scheduler and signal every in-flight session
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Current phase of the session with `peer`, if one is running
    pub fn session_phase(&self, peer: &SocketAddr) -> Option<SessionPhase> {
        self.sessions.read().get(peer).copied()
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.read().len()
    }

    fn set_phase(&self, peer: SocketAddr, phase: SessionPhase) {
        debug!("Session {} -> {:?}", peer, phase);
        self.sessions.write().insert(peer, phase);
    }

    /// Scheduler loop; returns after [`shutdown`](Self::shutdown) once all
    /// sessions have wound down.
    pub async fn run(self: Arc<Self>) {
        info!(
            "Gossip engine started (interval {:?}, {} sessions)",
            self.config.gossip_interval, self.config.max_sessions
        );

        let mut ticker = interval(self.config.gossip_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut sessions = JoinSet::new();

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let started = self.dispatch(&mut sessions);
                    if started > 0 {
                        debug!("Dispatched {} gossip sessions", started);
                    }
                }
                Some(joined) = sessions.join_next(), if !sessions.is_empty() => {
                    if let Err(e) = joined {
                        error!("Gossip session task failed: {}", e);
                    }
                }
            }
        }

        // Sessions see the cancellation at their next transport call
        while let Some(joined) = sessions.join_next().await {
            if let Err(e) = joined {
                error!("Gossip session task failed: {}", e);
            }
        }
        info!("Gossip engine stopped");
    }

    /// Start sessions for as many candidates as there are free permits.
    fn dispatch(self: &Arc<Self>, sessions: &mut JoinSet<()>) -> usize {
        let mut started = 0;
        loop {
            let Ok(permit) = self.permits.clone().try_acquire_owned() else {
                break;
            };
            let Some(peer) = self.registry.claim_candidate() else {
                break;
            };

            let engine = self.clone();
            sessions.spawn(async move {
                let _permit = permit;
                let _ = engine.run_claimed(peer).await;
            });
            started += 1;
        }
        started
    }

    /// Run one round with `peer` now, ignoring its backoff.
    pub async fn run_round(&self, peer: SocketAddr) -> Result<RoundReport, SyncError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| SyncError::Cancelled)?;
        let info = self
            .registry
            .claim(&peer)
            .ok_or(SyncError::PeerUnavailable(peer))?;
        self.run_claimed(info).await
    }

    /// Run a round for a peer already claimed in the registry and report
    /// the outcome back to it.
    async fn run_claimed(&self, peer: PeerInfo) -> Result<RoundReport, SyncError> {
        let address = peer.address;
        self.set_phase(address, SessionPhase::Idle);

        let result = match tokio::time::timeout(self.config.round_deadline, self.exchange(&peer))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(SyncError::Transport(TransportError::Timeout)),
        };

        self.set_phase(address, SessionPhase::Cooldown);
        match &result {
            Ok(report) => {
                self.registry.mark_success(&address, report.cursor);
                info!(
                    "Round with {} done: fetched {}, pushed {}, rejected {}",
                    address, report.fetched, report.pushed, report.rejected
                );
            }
            Err(e @ (SyncError::Transport(_) | SyncError::Remote(_))) => {
                let delay = self.registry.mark_failure(&address);
                warn!(
                    "Round with {} failed: {} (backoff {:?})",
                    address,
                    e,
                    delay.unwrap_or_default()
                );
            }
            Err(SyncError::Protocol(e)) => {
                let strikes = self.registry.record_strike(&address);
                self.registry.release(&address);
                warn!(
                    "Round with {} dropped: {} ({} strikes)",
                    address, e, strikes
                );
            }
            Err(SyncError::Cancelled) => {
                self.registry.release(&address);
                debug!("Round with {} cancelled", address);
            }
            Err(e) => {
                self.registry.release(&address);
                error!("Round with {} aborted: {}", address, e);
            }
        }
        self.sessions.write().remove(&address);

        result
    }

    /// Send one request, honouring engine cancellation.
    async fn call(&self, peer: SocketAddr, message: Message) -> Result<Message, SyncError> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(SyncError::Cancelled),
            result = self.transport.send(peer, message) => Ok(result?),
        }
    }

    async fn exchange(&self, peer: &PeerInfo) -> Result<RoundReport, SyncError> {
        let address = peer.address;
        let mut cursor = peer.cursor;
        if self.config.full_resync_rounds > 0
            && peer.rounds > 0
            && peer.rounds % self.config.full_resync_rounds == 0
        {
            debug!("Full inventory resync with {}", address);
            cursor = SyncCursor::default();
        }

        // Inventory exchange
        self.set_phase(address, SessionPhase::InventoryExchange);
        let local = self
            .store
            .list_since(cursor.local_marker, self.config.max_inventory_hashes)?;
        let request = InventoryRequest {
            known_marker: cursor.remote_marker,
            hashes: local.hashes.clone(),
            marker: local.marker,
        };
        let inventory = match self.call(address, Message::InventoryRequest(request)).await? {
            Message::InventoryResponse(response) => response,
            other => return Err(unexpected("InventoryResponse", other)),
        };

        // The peer may examine only a prefix of what we listed
        let covered = (inventory.covered as usize).min(local.hashes.len());
        let covered_marker = if covered < local.hashes.len() {
            debug!(
                "Peer {} examined {} of {} listed hashes",
                address,
                covered,
                local.hashes.len()
            );
            self.store.list_since(cursor.local_marker, covered)?.marker
        } else {
            local.marker
        };

        let mut report = RoundReport::default();
        let fetch_complete = self.fetch_missing(address, &inventory, &mut report).await?;
        let push_complete = self
            .push_missing(address, &local, &inventory, &mut report)
            .await?;

        report.cursor = SyncCursor {
            local_marker: if push_complete {
                covered_marker
            } else {
                cursor.local_marker
            },
            remote_marker: if fetch_complete {
                inventory.marker
            } else {
                cursor.remote_marker
            },
        };
        Ok(report)
    }

    /// Fetch and store everything the peer has that we lack. Returns whether
    /// every offered hash was settled.
    async fn fetch_missing(
        &self,
        address: SocketAddr,
        inventory: &InventoryResponse,
        report: &mut RoundReport,
    ) -> Result<bool, SyncError> {
        self.set_phase(address, SessionPhase::FetchMissing);

        let mut complete = true;
        let mut missing = Vec::new();
        for hash in &inventory.hashes_they_have {
            match self.store.has(hash) {
                Ok(true) => {}
                Ok(false) => missing.push(*hash),
                Err(e) => {
                    error!("Store lookup for {} failed: {}", hash, e);
                    complete = false;
                }
            }
        }

        let batch_size = self.config.fetch_batch_size.max(1);
        let mut queue: VecDeque<ContentHash> = missing.into();
        while !queue.is_empty() {
            let take = batch_size.min(queue.len());
            let batch: Vec<ContentHash> = queue.drain(..take).collect();
            let request = FetchRequest {
                hashes: batch.clone(),
            };
            let entries = match self.call(address, Message::FetchRequest(request)).await? {
                Message::FetchResponse(response) => response.entries,
                other => return Err(unexpected("FetchResponse", other)),
            };

            // Every requested hash must be answered exactly once
            let mut outstanding: HashSet<ContentHash> = batch.iter().copied().collect();
            let mut deferred = Vec::new();
            for entry in entries {
                let record = match entry {
                    FetchEntry::Found(record) => record,
                    FetchEntry::NotFound(hash) => {
                        if outstanding.remove(&hash) {
                            report.not_found += 1;
                        }
                        continue;
                    }
                    FetchEntry::Deferred(hash) => {
                        if outstanding.remove(&hash) {
                            deferred.push(hash);
                        }
                        continue;
                    }
                };

                if !outstanding.remove(&record.content_hash) {
                    warn!("Peer {} sent unrequested record {}", address, record.content_hash);
                    self.strike(address, report);
                    continue;
                }

                match self.store.put(&record) {
                    Ok(PutOutcome::Stored(_)) => report.fetched += 1,
                    Ok(PutOutcome::Duplicate) => report.duplicates += 1,
                    Ok(PutOutcome::Rejected(reason)) => {
                        warn!(
                            "Dropped record {} from {}: {}",
                            record.content_hash, address, reason
                        );
                        report.rejected += 1;
                        self.strike(address, report);
                    }
                    Err(e) => {
                        error!("Storing record {} failed: {}", record.content_hash, e);
                        complete = false;
                    }
                }
            }

            if !outstanding.is_empty() {
                warn!(
                    "Peer {} left {} requested hashes unanswered",
                    address,
                    outstanding.len()
                );
                self.strike(address, report);
                complete = false;
            }

            if deferred.len() == batch.len() {
                warn!("Peer {} deferred a whole fetch batch", address);
                complete = false;
                break;
            }
            for hash in deferred.into_iter().rev() {
                queue.push_front(hash);
            }
        }

        Ok(complete)
    }

    /// Push every listed record the peer asked for. Returns whether the peer
    /// accepted all of them.
    async fn push_missing(
        &self,
        address: SocketAddr,
        local: &InventorySlice,
        inventory: &InventoryResponse,
        report: &mut RoundReport,
    ) -> Result<bool, SyncError> {
        self.set_phase(address, SessionPhase::PushMissing);

        let listed: HashSet<&ContentHash> = local.hashes.iter().collect();
        let mut complete = true;

        for hash in &inventory.hashes_they_want {
            if !listed.contains(hash) {
                debug!("Peer {} wants unlisted hash {}", address, hash);
                continue;
            }

            let record = match self.store.get(hash) {
                Ok(Some(record)) => record,
                Ok(None) => continue,
                Err(e) => {
                    error!("Loading record {} failed: {}", hash, e);
                    complete = false;
                    continue;
                }
            };

            match self
                .call(address, Message::PushRecord(PushRecord { record }))
                .await?
            {
                Message::PushAck(ack) => match ack.status {
                    PushStatus::Stored => report.pushed += 1,
                    PushStatus::Duplicate => {}
                    PushStatus::Rejected(reason) => {
                        warn!("Peer {} refused record {}: {}", address, hash, reason);
                        report.push_refused += 1;
                        complete = false;
                    }
                },
                Message::Error(e) => {
                    warn!("Peer {} failed to take record {}: {}", address, hash, e.reason);
                    report.push_refused += 1;
                    complete = false;
                }
                other => return Err(unexpected("PushAck", other)),
            }
        }

        Ok(complete)
    }

    fn strike(&self, address: SocketAddr, report: &mut RoundReport) {
        self.registry.record_strike(&address);
        report.strikes += 1;
    }
}

fn unexpected(expected: &'static str, got: Message) -> SyncError {
    match got {
        Message::Error(e) => SyncError::Remote(e.reason),
        other => SyncError::Protocol(ProtocolError::UnexpectedResponse {
            expected,
            got: other.frame_type(),
        }),
    }
}
