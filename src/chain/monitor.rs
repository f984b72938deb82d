//! Transaction lifecycle monitor
//!
//! Each submitted operation gets its own poll loop driving the
//! `pending -> {confirmed, failed}` state machine. Loops share nothing
//! but the tracking map keyed by hash, so no cross-transaction ordering
//! exists or is needed.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::chain::client::AuctionLedger;
use crate::errors::{classify, ErrorContext, ErrorLog};
use crate::types::{PendingTransaction, TxKind, TxStatus};

/// Default receipt poll period.
pub const RECEIPT_POLL_SECS: u64 = 5;

/// Transient-error ceiling; reaching it resolves the monitor as failed.
pub const MAX_MONITOR_RETRIES: u32 = 5;

struct TrackedTx {
    tx: PendingTransaction,
    cancel: Arc<Notify>,
}

/// Polls submitted transactions until they reach a terminal state.
pub struct TransactionMonitor {
    ledger: Arc<dyn AuctionLedger>,
    error_log: Arc<ErrorLog>,
    tracked: DashMap<String, TrackedTx>,
    poll_interval: Duration,
    max_retries: u32,
}

impl TransactionMonitor {
    pub fn new(ledger: Arc<dyn AuctionLedger>, error_log: Arc<ErrorLog>) -> Self {
        Self::with_poll_interval(ledger, error_log, Duration::from_secs(RECEIPT_POLL_SECS))
    }

    pub fn with_poll_interval(
        ledger: Arc<dyn AuctionLedger>,
        error_log: Arc<ErrorLog>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            ledger,
            error_log,
            tracked: DashMap::new(),
            poll_interval,
            max_retries: MAX_MONITOR_RETRIES,
        }
    }

    /// Track `hash` until terminal; resolves only with `Confirmed` or
    /// `Failed`, never `Pending`.
    pub async fn monitor(&self, hash: &str, kind: TxKind) -> TxStatus {
        let cancel = Arc::new(Notify::new());
        self.tracked.insert(
            hash.to_string(),
            TrackedTx {
                tx: PendingTransaction::new(hash, kind),
                cancel: Arc::clone(&cancel),
            },
        );
        info!("monitoring {} transaction {}", kind, hash);

        let mut retry_count: u32 = 0;
        loop {
            match self.ledger.transaction_receipt(hash).await {
                Ok(Some(receipt)) => {
                    let status = if receipt.success {
                        TxStatus::Confirmed
                    } else {
                        TxStatus::Failed("reverted".to_string())
                    };
                    return self.finish(hash, status);
                }
                Ok(None) => {
                    // Not mined yet; make sure the network still knows it.
                    match self.ledger.transaction_exists(hash).await {
                        Ok(false) => {
                            return self.finish(hash, TxStatus::Failed("not found".to_string()));
                        }
                        Ok(true) => {
                            debug!("{} still pending", hash);
                        }
                        Err(e) => {
                            if let Some(status) = self.note_transient(hash, &e, &mut retry_count) {
                                return self.finish(hash, status);
                            }
                        }
                    }
                }
                Err(e) => {
                    if let Some(status) = self.note_transient(hash, &e, &mut retry_count) {
                        return self.finish(hash, status);
                    }
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = cancel.notified() => {
                    debug!("monitoring of {} cancelled", hash);
                    return TxStatus::Failed("monitoring cancelled".to_string());
                }
            }
        }
    }

    /// Classify a transient poll failure. Returns a terminal status when
    /// the error is non-retryable or the retry ceiling is reached.
    fn note_transient(
        &self,
        hash: &str,
        error: &anyhow::Error,
        retry_count: &mut u32,
    ) -> Option<TxStatus> {
        let details = classify(
            error,
            ErrorContext::new("transaction_receipt")
                .with_additional(serde_json::json!({ "hash": hash })),
        );
        let should_retry = details.should_retry;
        let message = details.user_message.clone();
        self.error_log.record(details);

        if !should_retry || *retry_count >= self.max_retries {
            warn!(
                "giving up on {} after {} transient failures: {}",
                hash, *retry_count, message
            );
            return Some(TxStatus::Failed(message));
        }
        *retry_count += 1;
        if let Some(mut entry) = self.tracked.get_mut(hash) {
            entry.tx.retry_count = *retry_count;
        }
        debug!("transient failure polling {}, retry {}", hash, retry_count);
        None
    }

    fn finish(&self, hash: &str, status: TxStatus) -> TxStatus {
        info!("transaction {} reached terminal state {:?}", hash, status);
        if let Some(mut entry) = self.tracked.get_mut(hash) {
            entry.tx.status = status.clone();
        }
        status
    }

    /// Stop polling `hash` and drop all tracking state, regardless of
    /// whether a terminal state was reached.
    pub fn cancel_monitoring(&self, hash: &str) {
        if let Some((_, tracked)) = self.tracked.remove(hash) {
            // notify_one stores a permit, so a cancel issued while the poll
            // loop is awaiting a receipt call is picked up at the next select.
            tracked.cancel.notify_one();
            info!("cancelled monitoring of {}", hash);
        }
    }

    /// Prune entries already terminal; pending ones stay tracked.
    pub fn clear_completed(&self) {
        let before = self.tracked.len();
        self.tracked.retain(|_, t| !t.tx.status.is_terminal());
        let removed = before - self.tracked.len();
        if removed > 0 {
            debug!("cleared {} completed transactions", removed);
        }
    }

    pub fn status_of(&self, hash: &str) -> Option<TxStatus> {
        self.tracked.get(hash).map(|t| t.tx.status.clone())
    }

    pub fn tracked_transactions(&self) -> Vec<PendingTransaction> {
        self.tracked.iter().map(|t| t.tx.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::client::{PositionRecord, TxReceipt};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Ledger stub whose receipt behavior is scripted per test.
    struct ScriptedLedger {
        receipt: Box<dyn Fn(u32) -> anyhow::Result<Option<TxReceipt>> + Send + Sync>,
        exists: bool,
        receipt_delay: Duration,
        polls: AtomicU32,
    }

    impl ScriptedLedger {
        fn new(
            receipt: impl Fn(u32) -> anyhow::Result<Option<TxReceipt>> + Send + Sync + 'static,
            exists: bool,
        ) -> Self {
            Self {
                receipt: Box::new(receipt),
                exists,
                receipt_delay: Duration::ZERO,
                polls: AtomicU32::new(0),
            }
        }

        fn with_receipt_delay(mut self, delay: Duration) -> Self {
            self.receipt_delay = delay;
            self
        }
    }

    #[async_trait]
    impl AuctionLedger for ScriptedLedger {
        async fn position_count(&self) -> anyhow::Result<u64> {
            Ok(0)
        }
        async fn position_by_index(&self, _: u64) -> anyhow::Result<PositionRecord> {
            anyhow::bail!("not used")
        }
        async fn position_by_id(&self, _: u64) -> anyhow::Result<PositionRecord> {
            anyhow::bail!("not used")
        }
        async fn submit_buy(&self, _: &str, _: u128) -> anyhow::Result<String> {
            Ok("0x0".to_string())
        }
        async fn submit_sell(&self, _: &str, _: u64) -> anyhow::Result<String> {
            Ok("0x0".to_string())
        }
        async fn transaction_receipt(&self, _hash: &str) -> anyhow::Result<Option<TxReceipt>> {
            let n = self.polls.fetch_add(1, Ordering::SeqCst);
            if !self.receipt_delay.is_zero() {
                tokio::time::sleep(self.receipt_delay).await;
            }
            (self.receipt)(n)
        }
        async fn transaction_exists(&self, _hash: &str) -> anyhow::Result<bool> {
            Ok(self.exists)
        }
    }

    fn monitor_for(ledger: Arc<ScriptedLedger>) -> TransactionMonitor {
        TransactionMonitor::with_poll_interval(
            ledger,
            Arc::new(ErrorLog::default()),
            Duration::from_millis(5),
        )
    }

    fn receipt(success: bool) -> TxReceipt {
        TxReceipt {
            hash: "0xabc".to_string(),
            success,
            block_number: 1,
        }
    }

    #[tokio::test]
    async fn successful_receipt_resolves_confirmed() {
        let ledger = Arc::new(ScriptedLedger::new(move |_| Ok(Some(receipt(true))), true));
        let monitor = monitor_for(ledger);
        assert_eq!(monitor.monitor("0xabc", TxKind::Buy).await, TxStatus::Confirmed);
        assert_eq!(monitor.status_of("0xabc"), Some(TxStatus::Confirmed));
    }

    #[tokio::test]
    async fn failed_receipt_resolves_reverted() {
        let ledger = Arc::new(ScriptedLedger::new(move |_| Ok(Some(receipt(false))), true));
        let monitor = monitor_for(ledger);
        match monitor.monitor("0xabc", TxKind::Sell).await {
            TxStatus::Failed(reason) => assert_eq!(reason, "reverted"),
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn vanished_transaction_resolves_not_found() {
        let ledger = Arc::new(ScriptedLedger::new(|_| Ok(None), false));
        let monitor = monitor_for(ledger);
        match monitor.monitor("0xabc", TxKind::Buy).await {
            TxStatus::Failed(reason) => assert_eq!(reason, "not found"),
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn pending_then_confirmed() {
        let ledger = Arc::new(ScriptedLedger::new(
            move |n| {
                if n < 3 {
                    Ok(None)
                } else {
                    Ok(Some(receipt(true)))
                }
            },
            true,
        ));
        let monitor = monitor_for(Arc::clone(&ledger));
        assert_eq!(monitor.monitor("0xabc", TxKind::Buy).await, TxStatus::Confirmed);
        assert_eq!(ledger.polls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn transient_errors_respect_retry_ceiling() {
        let ledger = Arc::new(ScriptedLedger::new(
            |_| anyhow::bail!("connection refused"),
            true,
        ));
        let monitor = monitor_for(Arc::clone(&ledger));
        let status = monitor.monitor("0xabc", TxKind::Buy).await;
        assert!(matches!(status, TxStatus::Failed(_)));
        // Retries 1..=5 after the first attempt, then the ceiling trips.
        assert_eq!(ledger.polls.load(Ordering::SeqCst), MAX_MONITOR_RETRIES + 1);
    }

    #[tokio::test]
    async fn non_retryable_error_fails_immediately() {
        let ledger = Arc::new(ScriptedLedger::new(
            |_| anyhow::bail!("execution reverted: bad call"),
            true,
        ));
        let monitor = monitor_for(Arc::clone(&ledger));
        let status = monitor.monitor("0xabc", TxKind::Buy).await;
        assert!(matches!(status, TxStatus::Failed(_)));
        assert_eq!(ledger.polls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancel_stops_polling_and_forgets_the_hash() {
        let ledger = Arc::new(ScriptedLedger::new(|_| Ok(None), true));
        let monitor = Arc::new(TransactionMonitor::with_poll_interval(
            ledger,
            Arc::new(ErrorLog::default()),
            Duration::from_secs(60),
        ));

        let task = {
            let monitor = Arc::clone(&monitor);
            tokio::spawn(async move { monitor.monitor("0xabc", TxKind::Buy).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        monitor.cancel_monitoring("0xabc");

        let status = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("cancel must stop the poll promptly")
            .unwrap();
        assert!(matches!(status, TxStatus::Failed(_)));
        assert!(monitor.status_of("0xabc").is_none());
    }

    #[tokio::test]
    async fn cancel_during_inflight_receipt_call_still_stops() {
        // The cancel arrives while the loop is awaiting a slow receipt
        // call, not while parked in the poll select. The stored permit
        // must still stop the loop at the next select.
        let ledger = Arc::new(
            ScriptedLedger::new(|_| Ok(None), true)
                .with_receipt_delay(Duration::from_millis(300)),
        );
        let monitor = Arc::new(TransactionMonitor::with_poll_interval(
            ledger,
            Arc::new(ErrorLog::default()),
            Duration::from_secs(60),
        ));

        let task = {
            let monitor = Arc::clone(&monitor);
            tokio::spawn(async move { monitor.monitor("0xabc", TxKind::Buy).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        monitor.cancel_monitoring("0xabc");

        let status = tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("cancel must stop the poll even when issued mid-call")
            .unwrap();
        assert!(matches!(status, TxStatus::Failed(_)));
        assert!(monitor.status_of("0xabc").is_none());
    }

    #[tokio::test]
    async fn clear_completed_keeps_pending_entries() {
        let ledger = Arc::new(ScriptedLedger::new(move |_| Ok(Some(receipt(true))), true));
        let monitor = Arc::new(monitor_for(ledger));
        monitor.monitor("0xdone", TxKind::Buy).await;

        // Insert a still-pending entry by hand.
        monitor.tracked.insert(
            "0xpending".to_string(),
            TrackedTx {
                tx: PendingTransaction::new("0xpending", TxKind::Sell),
                cancel: Arc::new(Notify::new()),
            },
        );

        monitor.clear_completed();
        assert!(monitor.status_of("0xdone").is_none());
        assert_eq!(monitor.status_of("0xpending"), Some(TxStatus::Pending));
    }
}
