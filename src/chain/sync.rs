//! Position synchronization service
//!
//! Walks the full remote position index, keeps only the requested owner's
//! records, and pushes updates downstream either from ledger events or
//! from a periodic fallback poll that diffs old and new position sets.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::chain::client::AuctionLedger;
use crate::chain::events::LedgerEvent;
use crate::errors::{ErrorContext, RetryCoordinator, RetryPolicy};
use crate::types::{normalize_owner, Position};
use crate::utils::batch::{load_in_batches, BatchOptions, Page};

/// Fallback poll period.
pub const SYNC_POLL_SECS: u64 = 30;

/// Updates flowing from the sync service to the orchestrator.
#[derive(Debug, Clone)]
pub enum SyncUpdate {
    /// Full resynchronized set (only sent when the diff detects change).
    Full {
        owner: String,
        positions: Vec<Position>,
    },
    /// One record changed, driven by a ledger event.
    Upsert { owner: String, position: Position },
    /// A full synchronization failed; previously cached data stays valid.
    Failed { owner: String, message: String },
}

/// Compare two position sets by id.
///
/// Reports a change when the sizes differ, an id was added or removed, or
/// any shared id differs in `closed`, `amount_tokens`, `status`, or
/// `unlock_at`. Identical sets (including empty vs empty) report no
/// change, which keeps redundant cache writes off the hot path.
pub fn positions_changed(old: &[Position], new: &[Position]) -> bool {
    if old.len() != new.len() {
        return true;
    }
    for next in new {
        match old.iter().find(|p| p.id == next.id) {
            None => return true,
            Some(prev) => {
                if prev.closed != next.closed
                    || prev.amount_tokens != next.amount_tokens
                    || prev.status != next.status
                    || prev.unlock_at != next.unlock_at
                {
                    return true;
                }
            }
        }
    }
    // Same size and every new id matched, so nothing was removed either.
    false
}

/// Fetches and watches one owner's positions on the ledger.
pub struct PositionSyncService {
    ledger: Arc<dyn AuctionLedger>,
    retry: RetryCoordinator,
    batch_options: BatchOptions,
    record_retry: RetryPolicy,
}

impl PositionSyncService {
    pub fn new(ledger: Arc<dyn AuctionLedger>, retry: RetryCoordinator) -> Self {
        Self {
            ledger,
            retry,
            batch_options: BatchOptions::default(),
            record_retry: RetryPolicy {
                max_retries: 2,
                base_delay: Duration::from_millis(250),
                ..RetryPolicy::default()
            },
        }
    }

    pub fn with_batch_options(mut self, options: BatchOptions) -> Self {
        self.batch_options = options;
        self
    }

    /// Walk the full position index and return the owner's valid records.
    ///
    /// The ownership filter is the correctness boundary between accounts:
    /// everything not matching `owner` (case-insensitive) is discarded.
    /// Invalid records are dropped and logged; a single record's fetch
    /// failure does not abort the walk.
    pub async fn sync_positions(&self, owner: &str) -> anyhow::Result<Vec<Position>> {
        let owner_key = normalize_owner(owner);
        let total = self
            .retry
            .retry_operation(
                || self.ledger.position_count(),
                ErrorContext::new("position_count").with_user(owner_key.clone()),
                &self.record_retry,
            )
            .await? as usize;

        let mut options = self.batch_options.clone();
        options.known_total = Some(total);

        let records = load_in_batches(
            |offset, limit| self.fetch_record_range(offset, limit, total),
            &options,
        )
        .await;

        let now = Utc::now();
        let mut positions = Vec::new();
        for record in records {
            if normalize_owner(&record.owner) != owner_key {
                continue;
            }
            let position = match record.to_position(now) {
                Ok(p) => p,
                Err(e) => {
                    warn!("dropping malformed record {}: {}", record.id, e);
                    continue;
                }
            };
            if let Err(e) = position.validate(now) {
                warn!("dropping invalid record {}: {}", position.id, e);
                continue;
            }
            positions.push(position);
        }

        info!(
            "synced {} positions for {} ({} records walked)",
            positions.len(),
            owner_key,
            total
        );
        Ok(positions)
    }

    /// One page of the index walk; per-record failures are logged and the
    /// page continues, so the page itself never fails.
    async fn fetch_record_range(
        &self,
        offset: usize,
        limit: usize,
        total: usize,
    ) -> anyhow::Result<Page<crate::chain::client::PositionRecord>> {
        let end = (offset + limit).min(total);
        let mut items = Vec::with_capacity(end.saturating_sub(offset));
        for index in offset..end {
            let result = self
                .retry
                .retry_operation(
                    || self.ledger.position_by_index(index as u64),
                    ErrorContext::new("position_by_index"),
                    &self.record_retry,
                )
                .await;
            match result {
                Ok(record) => items.push(record),
                Err(e) => warn!("record at index {} unavailable, skipping: {}", index, e),
            }
        }
        Ok(Page {
            items,
            has_more: end < total,
            next_offset: end,
        })
    }

    /// Fetch a single record by id, apply the ownership filter, validate.
    pub async fn fetch_one(&self, owner: &str, id: u64) -> anyhow::Result<Option<Position>> {
        let owner_key = normalize_owner(owner);
        let record = self
            .retry
            .retry_operation(
                || self.ledger.position_by_id(id),
                ErrorContext::new("position_by_id").with_user(owner_key.clone()),
                &self.record_retry,
            )
            .await?;

        if normalize_owner(&record.owner) != owner_key {
            debug!("record {} belongs to a different owner, ignoring", id);
            return Ok(None);
        }
        let now = Utc::now();
        let position = record.to_position(now)?;
        if let Err(e) = position.validate(now) {
            warn!("fetched record {} is invalid, dropping: {}", id, e);
            return Ok(None);
        }
        Ok(Some(position))
    }

    /// Event-driven update loop with a periodic fallback poll.
    ///
    /// Runs until `shutdown` flips to true. Ledger events trigger a
    /// single-record refetch; the fallback poll resynchronizes everything
    /// and only propagates when the set diff reports a change.
    pub async fn run(
        self: Arc<Self>,
        owner: String,
        mut events: broadcast::Receiver<LedgerEvent>,
        updates: mpsc::Sender<SyncUpdate>,
        mut shutdown: watch::Receiver<bool>,
        poll_interval: Duration,
    ) {
        let owner_key = normalize_owner(&owner);
        let mut current: Vec<Position> = Vec::new();

        // Seed state so the first poll diff is meaningful.
        match self.sync_positions(&owner_key).await {
            Ok(positions) => {
                current = positions.clone();
                let _ = updates
                    .send(SyncUpdate::Full {
                        owner: owner_key.clone(),
                        positions,
                    })
                    .await;
            }
            Err(e) => {
                warn!("initial sync for {} failed: {}", owner_key, e);
                let _ = updates
                    .send(SyncUpdate::Failed {
                        owner: owner_key.clone(),
                        message: format!("{:#}", e),
                    })
                    .await;
            }
        }

        let mut ticker = interval(poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await; // first tick fires immediately, skip it

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("sync service for {} shutting down", owner_key);
                        return;
                    }
                }

                event = events.recv() => {
                    match event {
                        Ok(event) => {
                            self.handle_event(&owner_key, event, &mut current, &updates).await;
                        }
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            warn!("event stream lagged by {} events, forcing full sync", missed);
                            self.poll_once(&owner_key, &mut current, &updates).await;
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            debug!("event stream closed, falling back to polling only");
                            // Poll loop keeps running below.
                            tokio::time::sleep(poll_interval).await;
                        }
                    }
                }

                _ = ticker.tick() => {
                    self.poll_once(&owner_key, &mut current, &updates).await;
                }
            }
        }
    }

    async fn handle_event(
        &self,
        owner_key: &str,
        event: LedgerEvent,
        current: &mut Vec<Position>,
        updates: &mpsc::Sender<SyncUpdate>,
    ) {
        let id = event.position_id();
        debug!("handling ledger event {:?}", event);
        // Creation fetches the new record; closure refetches the same id,
        // now expected closed.
        match self.fetch_one(owner_key, id).await {
            Ok(Some(position)) => {
                match current.iter_mut().find(|p| p.id == position.id) {
                    Some(existing) => *existing = position.clone(),
                    None => current.push(position.clone()),
                }
                let _ = updates
                    .send(SyncUpdate::Upsert {
                        owner: owner_key.to_string(),
                        position,
                    })
                    .await;
            }
            Ok(None) => {}
            Err(e) => {
                warn!("event-driven fetch of position {} failed: {}", id, e);
            }
        }
    }

    async fn poll_once(
        &self,
        owner_key: &str,
        current: &mut Vec<Position>,
        updates: &mpsc::Sender<SyncUpdate>,
    ) {
        match self.sync_positions(owner_key).await {
            Ok(fresh) => {
                if positions_changed(current, &fresh) {
                    debug!("fallback poll detected a change, propagating");
                    *current = fresh.clone();
                    let _ = updates
                        .send(SyncUpdate::Full {
                            owner: owner_key.to_string(),
                            positions: fresh,
                        })
                        .await;
                } else {
                    debug!("fallback poll found no changes");
                }
            }
            Err(e) => {
                // Stale-but-available: surface the error, keep the cache.
                warn!("fallback poll for {} failed: {}", owner_key, e);
                let _ = updates
                    .send(SyncUpdate::Failed {
                        owner: owner_key.to_string(),
                        message: format!("{:#}", e),
                    })
                    .await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::client::{PositionRecord, TxReceipt};
    use crate::errors::ErrorLog;
    use crate::providers::{ProviderEndpoint, ProviderPool};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Mutex;

    const OWNER: &str = "0xaaa111bbb222ccc333ddd444eee555fff6667788";
    const OTHER: &str = "0xbbb222ccc333ddd444eee555fff66677889900aa";

    struct MockLedger {
        records: Mutex<Vec<PositionRecord>>,
        fail_indices: Mutex<Vec<u64>>,
        fetches: AtomicU64,
    }

    impl MockLedger {
        fn new(records: Vec<PositionRecord>) -> Self {
            Self {
                records: Mutex::new(records),
                fail_indices: Mutex::new(Vec::new()),
                fetches: AtomicU64::new(0),
            }
        }
    }

    fn record(id: u64, owner: &str, closed: bool) -> PositionRecord {
        let now = Utc::now().timestamp();
        PositionRecord {
            id,
            owner: owner.to_string(),
            amount_tokens: "1000000000".to_string(),
            buy_price: "250000000".to_string(),
            created_at: now - 7200,
            unlock_at: now + 7200,
            part_id: ((id % 100) + 1) as u8,
            closed,
        }
    }

    #[async_trait]
    impl AuctionLedger for MockLedger {
        async fn position_count(&self) -> anyhow::Result<u64> {
            Ok(self.records.lock().unwrap().len() as u64)
        }

        async fn position_by_index(&self, index: u64) -> anyhow::Result<PositionRecord> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            if self.fail_indices.lock().unwrap().contains(&index) {
                anyhow::bail!("execution reverted: record {} gone", index);
            }
            self.records
                .lock()
                .unwrap()
                .get(index as usize)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("index {} out of range", index))
        }

        async fn position_by_id(&self, id: u64) -> anyhow::Result<PositionRecord> {
            self.records
                .lock()
                .unwrap()
                .iter()
                .find(|r| r.id == id)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("no record {}", id))
        }

        async fn submit_buy(&self, _owner: &str, _usd: u128) -> anyhow::Result<String> {
            Ok("0xbuy".to_string())
        }

        async fn submit_sell(&self, _owner: &str, _id: u64) -> anyhow::Result<String> {
            Ok("0xsell".to_string())
        }

        async fn transaction_receipt(&self, _hash: &str) -> anyhow::Result<Option<TxReceipt>> {
            Ok(None)
        }

        async fn transaction_exists(&self, _hash: &str) -> anyhow::Result<bool> {
            Ok(true)
        }
    }

    fn service(ledger: Arc<MockLedger>) -> PositionSyncService {
        let pool = Arc::new(ProviderPool::new(vec![ProviderEndpoint {
            url: "https://node.example".to_string(),
            name: "node".to_string(),
            priority: 0,
            is_active: true,
        }]));
        let retry = RetryCoordinator::new(pool, Arc::new(ErrorLog::default()));
        let mut options = BatchOptions::default();
        options.inter_batch_delay = Duration::ZERO;
        PositionSyncService::new(ledger, retry).with_batch_options(options)
    }

    #[tokio::test]
    async fn sync_keeps_only_matching_owner() {
        let ledger = Arc::new(MockLedger::new(vec![
            record(1, OWNER, false),
            record(2, OTHER, false),
            record(3, &OWNER.to_ascii_uppercase().replace("0X", "0x"), false),
        ]));
        let positions = service(ledger).sync_positions(OWNER).await.unwrap();
        let ids: Vec<u64> = positions.iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![1, 3], "case-insensitive owner match");
    }

    #[tokio::test]
    async fn sync_drops_invalid_records() {
        let mut bad = record(2, OWNER, false);
        bad.amount_tokens = "garbage".to_string();
        let mut bad_window = record(3, OWNER, false);
        bad_window.unlock_at = bad_window.created_at - 1;

        let ledger = Arc::new(MockLedger::new(vec![record(1, OWNER, false), bad, bad_window]));
        let positions = service(ledger).sync_positions(OWNER).await.unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].id, 1);
    }

    #[tokio::test]
    async fn record_failure_does_not_abort_walk() {
        let ledger = Arc::new(MockLedger::new(vec![
            record(1, OWNER, false),
            record(2, OWNER, false),
            record(3, OWNER, false),
        ]));
        // Non-retryable failure on index 1 so the walk skips it quickly.
        ledger.fail_indices.lock().unwrap().push(1);

        let positions = service(ledger).sync_positions(OWNER).await.unwrap();
        let ids: Vec<u64> = positions.iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![1, 3]);
    }

    #[tokio::test]
    async fn fetch_one_filters_foreign_owner() {
        let ledger = Arc::new(MockLedger::new(vec![record(5, OTHER, false)]));
        let svc = service(ledger);
        assert!(svc.fetch_one(OWNER, 5).await.unwrap().is_none());
    }

    #[test]
    fn diff_detects_closed_flag_change() {
        let now = Utc::now();
        let old: Vec<Position> = vec![record(1, OWNER, false).to_position(now).unwrap()];
        let new: Vec<Position> = vec![record(1, OWNER, true).to_position(now).unwrap()];
        assert!(positions_changed(&old, &new));
    }

    #[test]
    fn diff_reports_no_change_for_identical_sets() {
        let now = Utc::now();
        let a: Vec<Position> = vec![
            record(1, OWNER, false).to_position(now).unwrap(),
            record(2, OWNER, false).to_position(now).unwrap(),
        ];
        assert!(!positions_changed(&a, &a.clone()));
        assert!(!positions_changed(&[], &[]));
    }

    #[test]
    fn diff_detects_added_and_removed_ids() {
        let now = Utc::now();
        let one: Vec<Position> = vec![record(1, OWNER, false).to_position(now).unwrap()];
        let two: Vec<Position> = vec![
            record(1, OWNER, false).to_position(now).unwrap(),
            record(2, OWNER, false).to_position(now).unwrap(),
        ];
        assert!(positions_changed(&one, &two));
        assert!(positions_changed(&two, &one));
    }

    #[tokio::test]
    async fn poll_loop_propagates_only_on_change() {
        let ledger = Arc::new(MockLedger::new(vec![record(1, OWNER, false)]));
        let svc = Arc::new(service(Arc::clone(&ledger)));

        let (_event_tx, event_rx) = broadcast::channel(8);
        let (update_tx, mut update_rx) = mpsc::channel(32);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(Arc::clone(&svc).run(
            OWNER.to_string(),
            event_rx,
            update_tx,
            shutdown_rx,
            Duration::from_millis(50),
        ));

        // Initial full sync.
        let first = update_rx.recv().await.unwrap();
        assert!(matches!(first, SyncUpdate::Full { ref positions, .. } if positions.len() == 1));

        // Close the position between polls; next poll must propagate.
        ledger.records.lock().unwrap()[0].closed = true;
        let second = tokio::time::timeout(Duration::from_secs(2), update_rx.recv())
            .await
            .expect("change should propagate")
            .unwrap();
        match second {
            SyncUpdate::Full { positions, .. } => assert!(positions[0].closed),
            other => panic!("expected full update, got {:?}", other),
        }

        shutdown_tx.send(true).unwrap();
        let _ = tokio::time::timeout(Duration::from_secs(1), handle).await;
    }

    #[tokio::test]
    async fn created_event_upserts_single_position() {
        let ledger = Arc::new(MockLedger::new(vec![record(1, OWNER, false)]));
        let svc = Arc::new(service(Arc::clone(&ledger)));

        let (event_tx, event_rx) = broadcast::channel(8);
        let (update_tx, mut update_rx) = mpsc::channel(32);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(Arc::clone(&svc).run(
            OWNER.to_string(),
            event_rx,
            update_tx,
            shutdown_rx,
            Duration::from_secs(300), // keep the poll out of this test
        ));

        let _ = update_rx.recv().await.unwrap(); // initial full sync

        ledger.records.lock().unwrap().push(record(9, OWNER, false));
        event_tx
            .send(LedgerEvent::PositionCreated {
                owner: OWNER.to_string(),
                position_id: 9,
            })
            .unwrap();

        let update = tokio::time::timeout(Duration::from_secs(2), update_rx.recv())
            .await
            .expect("event should produce an upsert")
            .unwrap();
        match update {
            SyncUpdate::Upsert { position, .. } => assert_eq!(position.id, 9),
            other => panic!("expected upsert, got {:?}", other),
        }

        shutdown_tx.send(true).unwrap();
        let _ = tokio::time::timeout(Duration::from_secs(1), handle).await;
    }
}
