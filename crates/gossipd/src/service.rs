//! Responder side of the gossip exchange

use crate::store::{ContentStore, PutOutcome};
use async_trait::async_trait;
use gossip_store_core::types::*;
use gossip_store_net::messages::{
    record_wire_bytes, FetchEntry, FetchRequest, FetchResponse, InventoryRequest,
    InventoryResponse, Message, MessageLimits, PushAck, PushRecord, PushStatus,
};
use gossip_store_net::transport::RequestHandler;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Answers inventory, fetch and push requests from the local store
pub struct GossipService {
    store: Arc<ContentStore>,
    /// Most hashes offered, and examined, per inventory exchange
    max_inventory_hashes: usize,
    limits: MessageLimits,
}

impl GossipService {
    pub fn new(store: Arc<ContentStore>, max_inventory_hashes: usize) -> Self {
        Self {
            store,
            max_inventory_hashes,
            limits: MessageLimits::default(),
        }
    }

    pub fn with_limits(mut self, limits: MessageLimits) -> Self {
        self.limits = limits;
        self
    }

    fn inventory(&self, from: SocketAddr, request: InventoryRequest) -> Message {
        // Examine a prefix; the requester resumes from there next round
        let covered = request.hashes.len().min(self.max_inventory_hashes);
        if covered < request.hashes.len() {
            debug!(
                "Inventory from {} lists {} hashes, examining {}",
                from,
                request.hashes.len(),
                covered
            );
        }

        let ours = match self
            .store
            .list_since(request.known_marker, self.max_inventory_hashes)
        {
            Ok(slice) => slice,
            Err(e) => {
                error!("Listing inventory for {} failed: {}", from, e);
                return Message::error("storage unavailable");
            }
        };

        let listed: HashSet<&ContentHash> = request.hashes.iter().collect();
        let hashes_they_have: Vec<ContentHash> = ours
            .hashes
            .iter()
            .filter(|h| !listed.contains(h))
            .copied()
            .collect();

        let mut hashes_they_want = Vec::new();
        for hash in &request.hashes[..covered] {
            match self.store.has(hash) {
                Ok(true) => {}
                Ok(false) => hashes_they_want.push(*hash),
                Err(e) => {
                    error!("Store lookup for {} failed: {}", hash, e);
                    return Message::error("storage unavailable");
                }
            }
        }

        debug!(
            "Inventory for {}: offering {}, wanting {}",
            from,
            hashes_they_have.len(),
            hashes_they_want.len()
        );

        Message::InventoryResponse(InventoryResponse {
            hashes_they_have,
            hashes_they_want,
            covered: covered as u32,
            marker: ours.marker,
        })
    }

    /// Answer every requested hash. Records beyond the byte budget are
    /// deferred; the first found record is always sent.
    fn fetch(&self, request: FetchRequest) -> Message {
        let mut entries = Vec::with_capacity(request.hashes.len());
        let mut budget = self.limits.max_batch_bytes;
        let mut sent_any = false;

        for hash in request.hashes {
            match self.store.get(&hash) {
                Ok(Some(record)) if record.payload.len() > self.limits.max_record_bytes => {
                    warn!("Record {} exceeds the wire limit; not serving it", hash);
                    entries.push(FetchEntry::NotFound(hash));
                }
                Ok(Some(record)) => {
                    let size = record_wire_bytes(&record);
                    if sent_any && size > budget {
                        entries.push(FetchEntry::Deferred(hash));
                        continue;
                    }
                    budget = budget.saturating_sub(size);
                    sent_any = true;
                    entries.push(FetchEntry::Found(record));
                }
                Ok(None) => entries.push(FetchEntry::NotFound(hash)),
                Err(e) => {
                    error!("Loading record {} failed: {}", hash, e);
                    return Message::error("storage unavailable");
                }
            }
        }
        Message::FetchResponse(FetchResponse { entries })
    }

    fn push(&self, from: SocketAddr, request: PushRecord) -> Message {
        let hash = request.record.content_hash;
        let status = match self.store.put(&request.record) {
            Ok(PutOutcome::Stored(_)) => PushStatus::Stored,
            Ok(PutOutcome::Duplicate) => PushStatus::Duplicate,
            Ok(PutOutcome::Rejected(reason)) => {
                warn!("Refused record {} pushed by {}: {}", hash, from, reason);
                PushStatus::Rejected(reason.to_string())
            }
            Err(e) => {
                error!("Storing pushed record {} failed: {}", hash, e);
                return Message::error("storage unavailable");
            }
        };
        Message::PushAck(PushAck { hash, status })
    }
}

#[async_trait]
impl RequestHandler for GossipService {
    async fn handle(&self, from: SocketAddr, message: Message) -> Message {
        match message {
            Message::Ping => Message::Pong,
            Message::InventoryRequest(request) => self.inventory(from, request),
            Message::FetchRequest(request) => self.fetch(request),
            Message::PushRecord(request) => self.push(from, request),
            other => {
                debug!("Unexpected {:?} request from {}", other.frame_type(), from);
                Message::error("unexpected request")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Storage;
    use gossip_store_core::Identity;

    fn from() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 4000))
    }

    fn service() -> (GossipService, Arc<ContentStore>) {
        let store = Arc::new(ContentStore::new(Arc::new(Storage::temporary().unwrap())));
        (GossipService::new(store.clone(), 16), store)
    }

    fn record(payload: &[u8]) -> Record {
        Identity::from_seed(&[4; 32]).create_record_at(payload.to_vec(), 0)
    }

    fn inventory_of(response: Message) -> InventoryResponse {
        match response {
            Message::InventoryResponse(inventory) => inventory,
            other => panic!("expected inventory response, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_inventory_diff() {
        let (service, store) = service();
        let shared = record(b"shared");
        let ours = record(b"ours");
        let theirs = record(b"theirs");
        store.put(&shared).unwrap();
        store.put(&ours).unwrap();

        let response = service
            .handle(
                from(),
                Message::InventoryRequest(InventoryRequest {
                    known_marker: Marker::ORIGIN,
                    hashes: vec![shared.content_hash, theirs.content_hash],
                    marker: Marker(2),
                }),
            )
            .await;

        let inventory = inventory_of(response);
        assert_eq!(inventory.hashes_they_have, vec![ours.content_hash]);
        assert_eq!(inventory.hashes_they_want, vec![theirs.content_hash]);
        assert_eq!(inventory.marker, Marker(2));
    }

    #[tokio::test]
    async fn test_inventory_respects_known_marker() {
        let (service, store) = service();
        let old = record(b"old");
        let new = record(b"new");
        store.put(&old).unwrap();
        store.put(&new).unwrap();

        let response = service
            .handle(
                from(),
                Message::InventoryRequest(InventoryRequest {
                    known_marker: Marker(1),
                    hashes: vec![],
                    marker: Marker::ORIGIN,
                }),
            )
            .await;

        let inventory = inventory_of(response);
        assert_eq!(inventory.hashes_they_have, vec![new.content_hash]);
    }

    #[tokio::test]
    async fn test_long_inventory_examines_prefix() {
        let (service, _) = service();
        let hashes: Vec<ContentHash> = (0..20u8).map(|i| record(&[i]).content_hash).collect();
        let response = service
            .handle(
                from(),
                Message::InventoryRequest(InventoryRequest {
                    known_marker: Marker::ORIGIN,
                    hashes: hashes.clone(),
                    marker: Marker(20),
                }),
            )
            .await;

        let inventory = inventory_of(response);
        assert_eq!(inventory.covered, 16);
        assert_eq!(inventory.hashes_they_want, hashes[..16]);
    }

    #[tokio::test]
    async fn test_fetch_defers_past_byte_budget() {
        let store = Arc::new(ContentStore::new(Arc::new(Storage::temporary().unwrap())));
        let records: Vec<Record> = (0..4u8).map(|i| record(&[i; 100])).collect();
        for r in &records {
            store.put(r).unwrap();
        }
        let hashes: Vec<ContentHash> = records.iter().map(|r| r.content_hash).collect();
        let per_record = record_wire_bytes(&records[0]);

        let service = GossipService::new(store.clone(), 16).with_limits(MessageLimits {
            max_batch_bytes: 2 * per_record,
            ..MessageLimits::default()
        });
        let response = service
            .handle(from(), Message::FetchRequest(FetchRequest { hashes: hashes.clone() }))
            .await;
        assert_eq!(
            response,
            Message::FetchResponse(FetchResponse {
                entries: vec![
                    FetchEntry::Found(records[0].clone()),
                    FetchEntry::Found(records[1].clone()),
                    FetchEntry::Deferred(hashes[2]),
                    FetchEntry::Deferred(hashes[3]),
                ],
            })
        );

        // A record larger than the whole budget still goes out alone
        let tight = GossipService::new(store, 16).with_limits(MessageLimits {
            max_batch_bytes: 1,
            ..MessageLimits::default()
        });
        let response = tight
            .handle(from(), Message::FetchRequest(FetchRequest { hashes: hashes.clone() }))
            .await;
        assert_eq!(
            response,
            Message::FetchResponse(FetchResponse {
                entries: vec![
                    FetchEntry::Found(records[0].clone()),
                    FetchEntry::Deferred(hashes[1]),
                    FetchEntry::Deferred(hashes[2]),
                    FetchEntry::Deferred(hashes[3]),
                ],
            })
        );
    }

    #[tokio::test]
    async fn test_fetch_found_and_missing() {
        let (service, store) = service();
        let present = record(b"present");
        let absent = record(b"absent");
        store.put(&present).unwrap();

        let response = service
            .handle(
                from(),
                Message::FetchRequest(FetchRequest {
                    hashes: vec![present.content_hash, absent.content_hash],
                }),
            )
            .await;

        assert_eq!(
            response,
            Message::FetchResponse(FetchResponse {
                entries: vec![
                    FetchEntry::Found(present),
                    FetchEntry::NotFound(absent.content_hash),
                ],
            })
        );
    }

    #[tokio::test]
    async fn test_push_statuses() {
        let (service, store) = service();
        let good = record(b"pushed");

        let first = service
            .handle(from(), Message::PushRecord(PushRecord { record: good.clone() }))
            .await;
        assert_eq!(
            first,
            Message::PushAck(PushAck {
                hash: good.content_hash,
                status: PushStatus::Stored,
            })
        );
        assert!(store.has(&good.content_hash).unwrap());

        let again = service
            .handle(from(), Message::PushRecord(PushRecord { record: good.clone() }))
            .await;
        assert!(matches!(
            again,
            Message::PushAck(PushAck { status: PushStatus::Duplicate, .. })
        ));

        let mut bad = record(b"honest");
        bad.payload = b"forged".to_vec();
        let refused = service
            .handle(from(), Message::PushRecord(PushRecord { record: bad }))
            .await;
        assert!(matches!(
            refused,
            Message::PushAck(PushAck { status: PushStatus::Rejected(ref r), .. }) if r == "IntegrityError"
        ));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_ping_and_unexpected() {
        let (service, _) = service();
        assert_eq!(service.handle(from(), Message::Ping).await, Message::Pong);
        assert!(matches!(
            service.handle(from(), Message::Pong).await,
            Message::Error(_)
        ));
    }
}
