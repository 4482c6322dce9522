//! Peer registry with failure backoff and soft quarantine

use gossip_store_core::types::Marker;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Backoff and quarantine parameters
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    /// Delay after the first failure
    pub base: Duration,
    /// Upper bound on any delay
    pub max: Duration,
    /// Consecutive failures that quarantine a peer
    pub quarantine_threshold: u32,
    /// Strikes that quarantine a peer
    pub strike_threshold: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(60),
            quarantine_threshold: 10,
            strike_threshold: 5,
        }
    }
}

impl BackoffPolicy {
    /// `min(max, base * 2^prior_failures)`
    pub fn delay_for(&self, prior_failures: u32) -> Duration {
        let factor = 2u32.saturating_pow(prior_failures);
        self.base.saturating_mul(factor).min(self.max)
    }
}

/// Peer status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerStatus {
    /// Eligible for gossip
    Active,
    /// Excluded from candidate selection until reinstated
    Quarantined,
}

/// Per-peer sync position
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncCursor {
    /// Our marker the peer has been fully offered up to
    pub local_marker: Marker,
    /// Peer marker we have fully fetched up to
    pub remote_marker: Marker,
}

/// Peer information
#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub address: SocketAddr,
    pub status: PeerStatus,
    /// Start of the most recent session
    pub last_attempt: Option<Instant>,
    pub last_success: Option<Instant>,
    pub consecutive_failures: u32,
    pub backoff_until: Option<Instant>,
    /// Invalid or malformed data received from this peer
    pub strikes: u32,
    /// Successful rounds
    pub rounds: u64,
    pub cursor: SyncCursor,
    /// Held by an in-flight session
    pub in_session: bool,
}

impl PeerInfo {
    fn new(address: SocketAddr) -> Self {
        Self {
            address,
            status: PeerStatus::Active,
            last_attempt: None,
            last_success: None,
            consecutive_failures: 0,
            backoff_until: None,
            strikes: 0,
            rounds: 0,
            cursor: SyncCursor::default(),
            in_session: false,
        }
    }

    pub fn is_backed_off(&self, now: Instant) -> bool {
        self.backoff_until.map(|until| now < until).unwrap_or(false)
    }

    /// Active, out of backoff, and not in a session
    pub fn is_eligible(&self, now: Instant) -> bool {
        self.status == PeerStatus::Active && !self.in_session && !self.is_backed_off(now)
    }
}

/// Registry of gossip peers
pub struct PeerRegistry {
    /// Our own address, never registered
    local: Option<SocketAddr>,
    policy: BackoffPolicy,
    peers: RwLock<HashMap<SocketAddr, PeerInfo>>,
}

impl PeerRegistry {
    pub fn new(policy: BackoffPolicy, local: Option<SocketAddr>) -> Self {
        Self {
            local,
            policy,
            peers: RwLock::new(HashMap::new()),
        }
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    /// Register a peer, or reinstate it if quarantined.
    ///
    /// Returns false for our own address and for peers already active.
    pub fn add(&self, address: SocketAddr) -> bool {
        if self.local == Some(address) {
            return false;
        }

        let mut peers = self.peers.write();
        match peers.get_mut(&address) {
            Some(peer) if peer.status == PeerStatus::Quarantined => {
                Self::reset(peer);
                info!("Reinstated peer {}", address);
                true
            }
            Some(_) => false,
            None => {
                peers.insert(address, PeerInfo::new(address));
                true
            }
        }
    }

    /// Remove a peer
    pub fn remove(&self, address: &SocketAddr) -> Option<PeerInfo> {
        self.peers.write().remove(address)
    }

    /// Clear quarantine, failures, strikes and backoff.
    pub fn reinstate(&self, address: &SocketAddr) -> bool {
        match self.peers.write().get_mut(address) {
            Some(peer) => {
                Self::reset(peer);
                true
            }
            None => false,
        }
    }

    fn reset(peer: &mut PeerInfo) {
        peer.status = PeerStatus::Active;
        peer.consecutive_failures = 0;
        peer.strikes = 0;
        peer.backoff_until = None;
    }

    pub fn get(&self, address: &SocketAddr) -> Option<PeerInfo> {
        self.peers.read().get(address).cloned()
    }

    pub fn peers(&self) -> Vec<PeerInfo> {
        self.peers.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn select(peers: &HashMap<SocketAddr, PeerInfo>, now: Instant) -> Option<SocketAddr> {
        peers
            .values()
            .filter(|p| p.is_eligible(now))
            // Never-attempted peers sort first (None < Some)
            .min_by_key(|p| (p.last_attempt, p.address))
            .map(|p| p.address)
    }

    /// Eligible peer with the oldest last attempt
    pub fn next_candidate(&self) -> Option<PeerInfo> {
        self.next_candidate_at(Instant::now())
    }

    pub fn next_candidate_at(&self, now: Instant) -> Option<PeerInfo> {
        let peers = self.peers.read();
        Self::select(&peers, now).and_then(|addr| peers.get(&addr).cloned())
    }

    /// Select the next candidate and mark it in-session.
    pub fn claim_candidate(&self) -> Option<PeerInfo> {
        self.claim_candidate_at(Instant::now())
    }

    pub fn claim_candidate_at(&self, now: Instant) -> Option<PeerInfo> {
        let mut peers = self.peers.write();
        let address = Self::select(&peers, now)?;
        peers.get_mut(&address).map(|peer| Self::begin(peer, now))
    }

    /// Claim a specific peer, ignoring backoff (manual rounds).
    pub fn claim(&self, address: &SocketAddr) -> Option<PeerInfo> {
        let now = Instant::now();
        let mut peers = self.peers.write();
        let peer = peers.get_mut(address)?;
        if peer.in_session || peer.status != PeerStatus::Active {
            return None;
        }
        Some(Self::begin(peer, now))
    }

    fn begin(peer: &mut PeerInfo, now: Instant) -> PeerInfo {
        peer.in_session = true;
        peer.last_attempt = Some(now);
        peer.clone()
    }

    /// End a session without success or failure (cancelled, local error).
    pub fn release(&self, address: &SocketAddr) {
        if let Some(peer) = self.peers.write().get_mut(address) {
            peer.in_session = false;
        }
    }

    pub fn mark_success(&self, address: &SocketAddr, cursor: SyncCursor) {
        self.mark_success_at(address, cursor, Instant::now());
    }

    pub fn mark_success_at(&self, address: &SocketAddr, cursor: SyncCursor, now: Instant) {
        if let Some(peer) = self.peers.write().get_mut(address) {
            peer.in_session = false;
            peer.consecutive_failures = 0;
            peer.backoff_until = None;
            peer.last_success = Some(now);
            peer.rounds += 1;
            peer.cursor = cursor;
        }
    }

    /// Record a failed session; returns the backoff applied.
    pub fn mark_failure(&self, address: &SocketAddr) -> Option<Duration> {
        self.mark_failure_at(address, Instant::now())
    }

    pub fn mark_failure_at(&self, address: &SocketAddr, now: Instant) -> Option<Duration> {
        let mut peers = self.peers.write();
        let peer = peers.get_mut(address)?;

        let delay = self.policy.delay_for(peer.consecutive_failures);
        peer.in_session = false;
        peer.consecutive_failures = peer.consecutive_failures.saturating_add(1);
        peer.backoff_until = Some(now + delay);

        if peer.status == PeerStatus::Active
            && peer.consecutive_failures >= self.policy.quarantine_threshold
        {
            peer.status = PeerStatus::Quarantined;
            warn!(
                "Quarantined peer {} after {} consecutive failures",
                address, peer.consecutive_failures
            );
        }

        Some(delay)
    }

    /// Charge a strike; returns the peer's total.
    pub fn record_strike(&self, address: &SocketAddr) -> u32 {
        let mut peers = self.peers.write();
        let Some(peer) = peers.get_mut(address) else {
            return 0;
        };

        peer.strikes = peer.strikes.saturating_add(1);
        if peer.status == PeerStatus::Active && peer.strikes >= self.policy.strike_threshold {
            peer.status = PeerStatus::Quarantined;
            warn!("Quarantined peer {} after {} strikes", address, peer.strikes);
        }
        peer.strikes
    }

    /// Get registry stats
    pub fn stats(&self) -> RegistryStats {
        let now = Instant::now();
        let peers = self.peers.read();
        RegistryStats {
            total: peers.len(),
            active: peers
                .values()
                .filter(|p| p.status == PeerStatus::Active)
                .count(),
            backed_off: peers.values().filter(|p| p.is_backed_off(now)).count(),
            quarantined: peers
                .values()
                .filter(|p| p.status == PeerStatus::Quarantined)
                .count(),
            in_session: peers.values().filter(|p| p.in_session).count(),
        }
    }
}

/// Registry statistics
#[derive(Debug, Clone)]
pub struct RegistryStats {
    pub total: usize,
    pub active: usize,
    pub backed_off: usize,
    pub quarantined: usize,
    pub in_session: usize,
}
