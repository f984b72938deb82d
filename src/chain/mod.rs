//! Remote ledger access: client, event subscription, sync service, tx monitor

pub mod client;
pub mod events;
pub mod monitor;
pub mod sync;

pub use client::{AuctionLedger, HttpLedgerClient, PositionRecord, TxReceipt};
pub use events::{EventListener, LedgerEvent};
pub use monitor::TransactionMonitor;
pub use sync::{positions_changed, PositionSyncService, SyncUpdate};
