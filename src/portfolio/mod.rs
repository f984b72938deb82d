//! Portfolio orchestration over sync, caching, and transaction monitoring

pub mod manager;

pub use manager::{ManagerSettings, OpState, PortfolioManager, TxOutcome, UiState};
