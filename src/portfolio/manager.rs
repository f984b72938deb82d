//! Portfolio manager orchestrating the sync, cache, retry, and monitor layers
//!
//! This is the surface the presentation layer consumes: `refresh_positions`,
//! `buy`, `sell`, `get_position_by_id`, plus a `watch` channel carrying the
//! observable state. Each write operation walks an explicit state machine
//! (`idle -> submitting -> pending -> {confirmed, failed}`) so every
//! transition is visible on the channel.

use chrono::{NaiveDate, Utc};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{watch, Mutex, RwLock};
use tracing::{info, warn};

use crate::cache::{MemoryTier, PositionStore};
use crate::chain::{AuctionLedger, PositionSyncService, TransactionMonitor};
use crate::errors::{
    classify, ErrorContext, ErrorDetails, ErrorKind, ErrorLog, RetryCoordinator, RetryPolicy,
    Severity,
};
use crate::providers::ProviderPool;
use crate::types::{normalize_owner, Position, PositionStatus, TxKind, TxStatus};
use crate::utils::{Debouncer, MemoCache};

/// How long a remote single-position lookup is memoized.
const LOOKUP_MEMO_TTL: Duration = Duration::from_secs(10);

/// Tunables for the manager's guard rails.
#[derive(Debug, Clone)]
pub struct ManagerSettings {
    /// Smallest accepted buy, in USD base units.
    pub min_buy_base_units: u128,
    /// Buys accepted per UTC day before further ones are rejected.
    pub daily_buy_limit: u32,
    /// Quiet window for the debounced refresh path.
    pub refresh_debounce: Duration,
    /// Retry policy wrapped around remote write submissions.
    pub submit_retry: RetryPolicy,
    /// Receipt poll period for submitted transactions.
    pub receipt_poll_interval: Duration,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            min_buy_base_units: 1_000_000, // one dollar
            daily_buy_limit: 25,
            refresh_debounce: Duration::from_millis(300),
            submit_retry: RetryPolicy::default(),
            receipt_poll_interval: Duration::from_secs(5),
        }
    }
}

/// Per-operation lifecycle, observable on the state channel.
///
/// A terminal `Confirmed`/`Failed` stays visible until the next operation
/// begins; `Idle` means no write operation is in flight.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum OpState {
    #[default]
    Idle,
    Submitting,
    Pending,
    Confirmed,
    Failed(String),
}

/// Snapshot published to the presentation layer.
#[derive(Debug, Clone, Default)]
pub struct UiState {
    pub positions: Vec<Position>,
    pub loading: bool,
    pub error: Option<String>,
    pub transaction_status: OpState,
}

/// Result of a completed write operation.
#[derive(Debug, Clone)]
pub struct TxOutcome {
    pub hash: String,
    pub status: TxStatus,
}

struct DailyCounter {
    day: NaiveDate,
    count: u32,
}

/// Shared core cloned into debounced refresh futures.
struct Inner {
    sync: PositionSyncService,
    store: PositionStore,
    memory: MemoryTier,
    active_owner: RwLock<String>,
    // Single-flight guard so overlapping refreshes for the owner serialize.
    refresh_lock: Mutex<()>,
    state_tx: watch::Sender<UiState>,
    error_log: Arc<ErrorLog>,
}

impl Inner {
    fn update_state(&self, apply: impl FnOnce(&mut UiState)) {
        self.state_tx.send_modify(apply);
    }

    /// Full index sync for `owner`, committing to both cache tiers.
    ///
    /// The commit is skipped when `owner` no longer matches the active
    /// owner at write time, so a refresh started before an account switch
    /// cannot clobber the new owner's cache.
    async fn refresh_now(self: Arc<Self>, owner: String) -> anyhow::Result<Vec<Position>> {
        let _guard = self.refresh_lock.lock().await;
        self.update_state(|s| {
            s.loading = true;
            s.error = None;
        });

        let result = self.sync.sync_positions(&owner).await;
        match result {
            Ok(positions) => {
                self.commit_positions(&owner, &positions).await;
                self.update_state(|s| s.loading = false);
                Ok(positions)
            }
            Err(e) => {
                let message = e.to_string();
                self.update_state(|s| {
                    s.loading = false;
                    s.error = Some(message);
                });
                Err(e)
            }
        }
    }

    async fn commit_positions(&self, owner: &str, positions: &[Position]) {
        let owner_key = normalize_owner(owner);
        if *self.active_owner.read().await != owner_key {
            info!("discarding refresh for {}: owner changed mid-flight", owner_key);
            return;
        }
        if let Err(e) = self.store.save(&owner_key, positions).await {
            warn!("failed to persist positions for {}: {}", owner_key, e);
        }
        self.memory.set(&owner_key, positions.to_vec());
        let snapshot = positions.to_vec();
        self.update_state(|s| s.positions = snapshot);
    }
}

/// Composes the ledger client, sync service, caches, retry coordinator, and
/// transaction monitor behind the UI-facing operations.
pub struct PortfolioManager {
    inner: Arc<Inner>,
    ledger: Arc<dyn AuctionLedger>,
    monitor: Arc<TransactionMonitor>,
    retry: RetryCoordinator,
    debouncer: Debouncer<Vec<Position>>,
    lookup_memo: MemoCache<Option<Position>>,
    settings: ManagerSettings,
    buys_today: StdMutex<DailyCounter>,
}

impl PortfolioManager {
    pub fn new(
        owner: &str,
        ledger: Arc<dyn AuctionLedger>,
        providers: Arc<ProviderPool>,
        store: PositionStore,
        settings: ManagerSettings,
    ) -> Self {
        let error_log = Arc::new(ErrorLog::default());
        let retry = RetryCoordinator::new(providers, Arc::clone(&error_log));
        let monitor = Arc::new(TransactionMonitor::with_poll_interval(
            Arc::clone(&ledger),
            Arc::clone(&error_log),
            settings.receipt_poll_interval,
        ));
        let (state_tx, _) = watch::channel(UiState::default());

        let inner = Arc::new(Inner {
            sync: PositionSyncService::new(Arc::clone(&ledger), retry.clone()),
            store,
            memory: MemoryTier::new(),
            active_owner: RwLock::new(normalize_owner(owner)),
            refresh_lock: Mutex::new(()),
            state_tx,
            error_log,
        });

        Self {
            inner,
            ledger,
            monitor,
            retry,
            debouncer: Debouncer::new(),
            lookup_memo: MemoCache::new(256),
            settings,
            buys_today: StdMutex::new(DailyCounter {
                day: Utc::now().date_naive(),
                count: 0,
            }),
        }
    }

    /// Receiver on the observable state channel.
    pub fn subscribe_state(&self) -> watch::Receiver<UiState> {
        self.inner.state_tx.subscribe()
    }

    pub fn error_log(&self) -> &Arc<ErrorLog> {
        &self.inner.error_log
    }

    pub fn monitor(&self) -> &Arc<TransactionMonitor> {
        &self.monitor
    }

    pub async fn active_owner(&self) -> String {
        self.inner.active_owner.read().await.clone()
    }

    /// Switch the active account. In-flight refreshes for the previous
    /// owner will fail their write-time owner check and discard.
    pub async fn set_active_owner(&self, owner: &str) {
        let owner_key = normalize_owner(owner);
        *self.inner.active_owner.write().await = owner_key;
        self.inner.update_state(|s| {
            s.positions.clear();
            s.error = None;
        });
    }

    /// Seed the memory tier and state channel from the persistent cache.
    pub async fn warm_start(&self) {
        let owner = self.active_owner().await;
        if let Some(positions) = self.inner.store.load(&owner).await {
            info!("warm start: {} cached positions for {}", positions.len(), owner);
            self.inner.memory.set(&owner, positions.clone());
            self.inner.update_state(|s| s.positions = positions);
        }
    }

    /// Debounced refresh; bursts within the quiet window collapse into one
    /// index walk whose result every caller shares.
    pub async fn refresh_positions(&self) -> anyhow::Result<Vec<Position>> {
        let owner = self.active_owner().await;
        let inner = Arc::clone(&self.inner);
        let key = format!("refresh:{}", owner);
        self.debouncer
            .debounce(&key, self.settings.refresh_debounce, move || {
                inner.refresh_now(owner)
            })
            .await
    }

    /// Immediate, non-debounced refresh. Used after confirmed writes.
    pub async fn refresh_positions_now(&self) -> anyhow::Result<Vec<Position>> {
        let owner = self.active_owner().await;
        Arc::clone(&self.inner).refresh_now(owner).await
    }

    /// Look up one position: memory tier first, then the persistent cache,
    /// then the ledger itself.
    pub async fn get_position_by_id(&self, id: u64) -> anyhow::Result<Option<Position>> {
        let owner = self.active_owner().await;
        if let Some(mut position) = self.inner.memory.get_position(&owner, id) {
            position.refresh_status(Utc::now());
            return Ok(Some(position));
        }
        if let Some(positions) = self.inner.store.load(&owner).await {
            if let Some(position) = positions.into_iter().find(|p| p.id == id) {
                return Ok(Some(position));
            }
        }
        // Remote lookups are memoized briefly so UI bursts for the same id
        // do not hammer the ledger.
        let inner = Arc::clone(&self.inner);
        self.lookup_memo
            .with_cache(&format!("{}:{}", owner, id), LOOKUP_MEMO_TTL, || async move {
                inner.sync.fetch_one(&owner, id).await
            })
            .await
    }

    /// Submit a buy for `usd_amount` base units and track it to a terminal
    /// state. `meta` travels with the error context for the audit trail.
    pub async fn buy(
        &self,
        usd_amount: u128,
        meta: Option<serde_json::Value>,
    ) -> anyhow::Result<TxOutcome> {
        let owner = self.active_owner().await;

        if usd_amount < self.settings.min_buy_base_units {
            return Err(self.reject(
                "buy",
                &owner,
                format!(
                    "amount {} is below the minimum of {} base units",
                    usd_amount, self.settings.min_buy_base_units
                ),
            ));
        }
        if !self.daily_slot_available() {
            return Err(self.reject(
                "buy",
                &owner,
                format!(
                    "daily purchase limit of {} reached",
                    self.settings.daily_buy_limit
                ),
            ));
        }

        self.begin_operation();
        let mut context = ErrorContext::new("submit_buy").with_user(owner.clone());
        if let Some(meta) = meta {
            context = context.with_additional(meta);
        }
        let hash = match self
            .retry
            .retry_operation(
                || self.ledger.submit_buy(&owner, usd_amount),
                context,
                &self.settings.submit_retry,
            )
            .await
        {
            Ok(hash) => hash,
            Err(e) => return Err(self.fail_operation("submit_buy", e)),
        };
        self.record_buy();

        self.track_to_terminal(hash, TxKind::Buy).await
    }

    /// Submit a sell of `position_id`. Rejected without any remote
    /// submission unless the position's status is `Ready`.
    pub async fn sell(&self, position_id: u64) -> anyhow::Result<TxOutcome> {
        let owner = self.active_owner().await;

        let position = match self.get_position_by_id(position_id).await? {
            Some(p) => p,
            None => {
                return Err(self.reject(
                    "sell",
                    &owner,
                    format!("position {} not found for this account", position_id),
                ));
            }
        };
        if position.status != PositionStatus::Ready {
            let message = match position.status {
                PositionStatus::Closed => format!("position {} is already closed", position_id),
                _ => format!(
                    "position {} is locked until {}",
                    position_id, position.unlock_at
                ),
            };
            return Err(self.reject("sell", &owner, message));
        }

        self.begin_operation();
        let context = ErrorContext::new("submit_sell").with_user(owner.clone());
        let hash = match self
            .retry
            .retry_operation(
                || self.ledger.submit_sell(&owner, position_id),
                context,
                &self.settings.submit_retry,
            )
            .await
        {
            Ok(hash) => hash,
            Err(e) => return Err(self.fail_operation("submit_sell", e)),
        };

        self.track_to_terminal(hash, TxKind::Sell).await
    }

    /// Drive a submitted hash through the monitor until terminal, then
    /// refresh on confirmation. Cached positions are untouched on failure.
    async fn track_to_terminal(&self, hash: String, kind: TxKind) -> anyhow::Result<TxOutcome> {
        self.inner
            .update_state(|s| s.transaction_status = OpState::Pending);

        let status = self.monitor.monitor(&hash, kind).await;
        match &status {
            TxStatus::Confirmed => {
                self.inner
                    .update_state(|s| s.transaction_status = OpState::Confirmed);
                if let Err(e) = self.refresh_positions_now().await {
                    warn!("post-confirmation refresh failed: {}", e);
                }
                self.inner
                    .update_state(|s| s.transaction_status = OpState::Idle);
                Ok(TxOutcome { hash, status })
            }
            TxStatus::Failed(reason) => {
                let reason = reason.clone();
                self.inner.update_state(|s| {
                    s.transaction_status = OpState::Failed(reason.clone());
                    s.error = Some(reason.clone());
                });
                Err(anyhow::anyhow!("transaction {} failed: {}", hash, reason))
            }
            TxStatus::Pending => unreachable!("monitor resolves only at terminal states"),
        }
    }

    fn begin_operation(&self) {
        self.inner.update_state(|s| {
            s.error = None;
            s.transaction_status = OpState::Submitting;
        });
    }

    fn fail_operation(&self, operation: &str, error: anyhow::Error) -> anyhow::Error {
        // Already classified and logged by the retry coordinator; classify
        // again only to pick the user-facing wording.
        let details = classify(&error, ErrorContext::new(operation));
        let message = details.user_message;
        self.inner.update_state(|s| {
            s.transaction_status = OpState::Failed(message.clone());
            s.error = Some(message);
        });
        error
    }

    fn reject(&self, operation: &str, owner: &str, message: String) -> anyhow::Error {
        let details = ErrorDetails {
            kind: ErrorKind::UserAction,
            severity: Severity::Low,
            message: message.clone(),
            user_message: message.clone(),
            should_retry: false,
            suggested_action: "review the request and try again".to_string(),
            context: ErrorContext::new(operation).with_user(owner),
        };
        self.inner.error_log.record(details);
        anyhow::anyhow!(message)
    }

    fn daily_slot_available(&self) -> bool {
        let today = Utc::now().date_naive();
        let mut counter = self.buys_today.lock().unwrap();
        if counter.day != today {
            counter.day = today;
            counter.count = 0;
        }
        counter.count < self.settings.daily_buy_limit
    }

    fn record_buy(&self) {
        let mut counter = self.buys_today.lock().unwrap();
        counter.count += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::client::{PositionRecord, TxReceipt};
    use crate::providers::ProviderEndpoint;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::TempDir;

    const OWNER: &str = "0xaaa111bbb222ccc333ddd444eee555fff6667788";

    struct MockLedger {
        records: Vec<PositionRecord>,
        buys: AtomicU32,
        sells: AtomicU32,
        receipt_success: bool,
    }

    impl MockLedger {
        fn new(records: Vec<PositionRecord>) -> Self {
            Self {
                records,
                buys: AtomicU32::new(0),
                sells: AtomicU32::new(0),
                receipt_success: true,
            }
        }

        fn failing_receipts(mut self) -> Self {
            self.receipt_success = false;
            self
        }
    }

    #[async_trait]
    impl AuctionLedger for MockLedger {
        async fn position_count(&self) -> anyhow::Result<u64> {
            Ok(self.records.len() as u64)
        }
        async fn position_by_index(&self, index: u64) -> anyhow::Result<PositionRecord> {
            self.records
                .get(index as usize)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("index {} out of range", index))
        }
        async fn position_by_id(&self, id: u64) -> anyhow::Result<PositionRecord> {
            self.records
                .iter()
                .find(|r| r.id == id)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("no position {}", id))
        }
        async fn submit_buy(&self, _owner: &str, _amount: u128) -> anyhow::Result<String> {
            self.buys.fetch_add(1, Ordering::SeqCst);
            Ok("0xbuy".to_string())
        }
        async fn submit_sell(&self, _owner: &str, _id: u64) -> anyhow::Result<String> {
            self.sells.fetch_add(1, Ordering::SeqCst);
            Ok("0xsell".to_string())
        }
        async fn transaction_receipt(&self, hash: &str) -> anyhow::Result<Option<TxReceipt>> {
            Ok(Some(TxReceipt {
                hash: hash.to_string(),
                success: self.receipt_success,
                block_number: 10,
            }))
        }
        async fn transaction_exists(&self, _hash: &str) -> anyhow::Result<bool> {
            Ok(true)
        }
    }

    fn record(id: u64, unlock_offset_secs: i64) -> PositionRecord {
        let now = Utc::now().timestamp();
        PositionRecord {
            id,
            owner: OWNER.to_string(),
            amount_tokens: "1000".to_string(),
            buy_price: "10".to_string(),
            created_at: now - 3600,
            unlock_at: now + unlock_offset_secs,
            part_id: 1,
            closed: false,
        }
    }

    fn manager_with(ledger: MockLedger, dir: &TempDir) -> (PortfolioManager, Arc<MockLedger>) {
        let ledger = Arc::new(ledger);
        let providers = Arc::new(ProviderPool::new(vec![ProviderEndpoint {
            url: "http://localhost:1".to_string(),
            name: "test".to_string(),
            priority: 0,
            is_active: true,
        }]));
        let store = PositionStore::new(dir.path().join("positions.json"));
        let settings = ManagerSettings {
            refresh_debounce: Duration::from_millis(10),
            receipt_poll_interval: Duration::from_millis(5),
            ..Default::default()
        };
        let manager = PortfolioManager::new(
            OWNER,
            Arc::clone(&ledger) as Arc<dyn AuctionLedger>,
            providers,
            store,
            settings,
        );
        (manager, ledger)
    }

    #[tokio::test]
    async fn sell_before_unlock_is_rejected_without_submission() {
        let dir = TempDir::new().unwrap();
        let (manager, ledger) = manager_with(MockLedger::new(vec![record(1, 3600)]), &dir);

        let err = manager.sell(1).await.unwrap_err();
        assert!(err.to_string().contains("locked"));
        assert_eq!(ledger.sells.load(Ordering::SeqCst), 0);

        let logged = manager.error_log().by_kind(ErrorKind::UserAction);
        assert_eq!(logged.len(), 1);
        assert!(!logged[0].should_retry);
    }

    #[tokio::test]
    async fn sell_of_ready_position_submits_and_confirms() {
        let dir = TempDir::new().unwrap();
        let (manager, ledger) = manager_with(MockLedger::new(vec![record(1, -60)]), &dir);

        let outcome = manager.sell(1).await.unwrap();
        assert_eq!(outcome.status, TxStatus::Confirmed);
        assert_eq!(ledger.sells.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn buy_below_minimum_is_rejected_without_submission() {
        let dir = TempDir::new().unwrap();
        let (manager, ledger) = manager_with(MockLedger::new(vec![]), &dir);

        let err = manager.buy(10, None).await.unwrap_err();
        assert!(err.to_string().contains("below the minimum"));
        assert_eq!(ledger.buys.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn buy_respects_daily_limit() {
        let dir = TempDir::new().unwrap();
        let ledger = Arc::new(MockLedger::new(vec![]));
        let providers = Arc::new(ProviderPool::new(vec![ProviderEndpoint {
            url: "http://localhost:1".to_string(),
            name: "test".to_string(),
            priority: 0,
            is_active: true,
        }]));
        let store = PositionStore::new(dir.path().join("positions.json"));
        let settings = ManagerSettings {
            daily_buy_limit: 1,
            receipt_poll_interval: Duration::from_millis(5),
            ..Default::default()
        };
        let manager = PortfolioManager::new(
            OWNER,
            Arc::clone(&ledger) as Arc<dyn AuctionLedger>,
            providers,
            store,
            settings,
        );

        manager.buy(5_000_000, None).await.unwrap();
        let err = manager.buy(5_000_000, None).await.unwrap_err();
        assert!(err.to_string().contains("daily purchase limit"));
        assert_eq!(ledger.buys.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn confirmed_buy_refreshes_the_cache() {
        let dir = TempDir::new().unwrap();
        let (manager, _ledger) = manager_with(MockLedger::new(vec![record(7, -60)]), &dir);

        let outcome = manager.buy(5_000_000, None).await.unwrap();
        assert_eq!(outcome.status, TxStatus::Confirmed);

        let state = manager.subscribe_state().borrow().clone();
        assert_eq!(state.transaction_status, OpState::Idle);
        assert_eq!(state.positions.len(), 1);
        assert_eq!(state.positions[0].id, 7);
    }

    #[tokio::test]
    async fn failed_transaction_leaves_cache_untouched() {
        let dir = TempDir::new().unwrap();
        let (manager, _ledger) =
            manager_with(MockLedger::new(vec![record(7, -60)]).failing_receipts(), &dir);

        let err = manager.buy(5_000_000, None).await.unwrap_err();
        assert!(err.to_string().contains("reverted"));

        let state = manager.subscribe_state().borrow().clone();
        assert!(matches!(state.transaction_status, OpState::Failed(_)));
        assert!(state.positions.is_empty());
    }

    #[tokio::test]
    async fn refresh_after_owner_switch_does_not_commit() {
        let dir = TempDir::new().unwrap();
        let (manager, _ledger) = manager_with(MockLedger::new(vec![record(1, -60)]), &dir);

        // The owner switches while a refresh keyed to the old owner is in
        // flight; the write-time check must discard its result.
        manager
            .set_active_owner("0xbbb111bbb222ccc333ddd444eee555fff6667788")
            .await;
        let positions = Arc::clone(&manager.inner)
            .refresh_now(OWNER.to_string())
            .await
            .unwrap();
        assert_eq!(positions.len(), 1);

        assert!(!manager.inner.store.has_entry(OWNER).await);
        assert!(manager.inner.memory.get(OWNER).is_none());
    }

    #[tokio::test]
    async fn warm_start_seeds_state_from_the_store() {
        let dir = TempDir::new().unwrap();
        let (manager, _ledger) = manager_with(MockLedger::new(vec![record(3, -60)]), &dir);

        manager.refresh_positions_now().await.unwrap();

        // A second manager over the same store starts warm.
        let (restarted, _ledger) = manager_with(MockLedger::new(vec![]), &dir);
        restarted.warm_start().await;
        let state = restarted.subscribe_state().borrow().clone();
        assert_eq!(state.positions.len(), 1);
        assert_eq!(state.positions[0].id, 3);
    }
}
