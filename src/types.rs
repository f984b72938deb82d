//! Core domain types for auction positions and pending transactions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Number of auction parts; part ids are 1-based.
pub const PART_COUNT: u8 = 100;

/// Base-unit scale of the payment token (6 decimals, USDC-style).
pub const BASE_UNIT_SCALE: u128 = 1_000_000;

/// Serde helpers for integer base-unit quantities.
///
/// Quantities are persisted as decimal strings so that no consumer is
/// tempted to round-trip them through floating point.
pub mod base_units {
    use serde::{self, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &u128, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<u128, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse::<u128>().map_err(serde::de::Error::custom)
    }
}

/// Profit tier, selected by the position's buy price.
///
/// Thresholds are consumed as given constants from the auction contract;
/// this crate never derives them from ledger state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum League {
    Bronze,
    Silver,
    Gold,
    Platinum,
    Diamond,
}

impl League {
    /// League boundaries in base units (inclusive lower bound).
    const SILVER_MIN: u128 = 100 * BASE_UNIT_SCALE;
    const GOLD_MIN: u128 = 500 * BASE_UNIT_SCALE;
    const PLATINUM_MIN: u128 = 2_500 * BASE_UNIT_SCALE;
    const DIAMOND_MIN: u128 = 10_000 * BASE_UNIT_SCALE;

    /// Select the league for a buy price expressed in base units.
    pub fn from_buy_price(buy_price: u128) -> Self {
        match buy_price {
            p if p >= Self::DIAMOND_MIN => League::Diamond,
            p if p >= Self::PLATINUM_MIN => League::Platinum,
            p if p >= Self::GOLD_MIN => League::Gold,
            p if p >= Self::SILVER_MIN => League::Silver,
            _ => League::Bronze,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            League::Bronze => "bronze",
            League::Silver => "silver",
            League::Gold => "gold",
            League::Platinum => "platinum",
            League::Diamond => "diamond",
        }
    }
}

/// Derived position status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionStatus {
    Active,
    Locked,
    Ready,
    Closed,
}

/// A user's stake in one auction part
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    /// Local identity
    pub id: u64,
    /// Ledger identity, set once the creation is confirmed on chain
    pub on_chain_id: Option<u64>,
    /// Owner account address, lower-cased for comparison
    pub owner: String,
    #[serde(with = "base_units")]
    pub amount_tokens: u128,
    #[serde(with = "base_units")]
    pub buy_price: u128,
    pub created_at: DateTime<Utc>,
    pub unlock_at: DateTime<Utc>,
    /// Auction part, 1..=100
    pub part_id: u8,
    pub league: League,
    pub closed: bool,
    pub status: PositionStatus,
    /// Set only while a pending creation/closure is in flight
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub transaction_hash: Option<String>,
}

impl Position {
    /// Derive the status from the closed flag and unlock time.
    ///
    /// This function is the single source of truth; the stored `status`
    /// field is refreshed from it whenever a record enters the system.
    pub fn derive_status(closed: bool, unlock_at: DateTime<Utc>, now: DateTime<Utc>) -> PositionStatus {
        if closed {
            PositionStatus::Closed
        } else if now < unlock_at {
            PositionStatus::Locked
        } else {
            PositionStatus::Ready
        }
    }

    /// Refresh the derived status field against the current time.
    pub fn refresh_status(&mut self, now: DateTime<Utc>) {
        self.status = Self::derive_status(self.closed, self.unlock_at, now);
    }

    /// Whether the position can currently be sold.
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        Self::derive_status(self.closed, self.unlock_at, now) == PositionStatus::Ready
    }

    /// Validate a record before it is cached or displayed.
    pub fn validate(&self, now: DateTime<Utc>) -> Result<(), ValidationError> {
        if !is_well_formed_address(&self.owner) {
            return Err(ValidationError::BadOwner(self.owner.clone()));
        }
        if self.unlock_at <= self.created_at {
            return Err(ValidationError::UnlockBeforeCreate {
                created_at: self.created_at,
                unlock_at: self.unlock_at,
            });
        }
        if self.part_id == 0 || self.part_id > PART_COUNT {
            return Err(ValidationError::BadPartId(self.part_id));
        }
        if self.league != League::from_buy_price(self.buy_price) {
            return Err(ValidationError::LeagueMismatch {
                league: self.league,
                buy_price: self.buy_price,
            });
        }
        let expected = Self::derive_status(self.closed, self.unlock_at, now);
        if self.status != expected {
            return Err(ValidationError::InconsistentStatus {
                status: self.status,
                expected,
            });
        }
        Ok(())
    }
}

/// Check an account address: 0x-prefixed, non-empty hex payload.
pub fn is_well_formed_address(addr: &str) -> bool {
    let hex_part = match addr.strip_prefix("0x") {
        Some(rest) => rest,
        None => return false,
    };
    !hex_part.is_empty() && hex::decode(hex_part).is_ok()
}

/// Normalize an owner address for use as a cache/comparison key.
pub fn normalize_owner(addr: &str) -> String {
    addr.trim().to_ascii_lowercase()
}

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("malformed owner address: {0:?}")]
    BadOwner(String),
    #[error("unlock_at {unlock_at} is not after created_at {created_at}")]
    UnlockBeforeCreate {
        created_at: DateTime<Utc>,
        unlock_at: DateTime<Utc>,
    },
    #[error("part id {0} outside 1..=100")]
    BadPartId(u8),
    #[error("league {league:?} does not match buy price {buy_price}")]
    LeagueMismatch { league: League, buy_price: u128 },
    #[error("status {status:?} inconsistent with closed/unlock fields (expected {expected:?})")]
    InconsistentStatus {
        status: PositionStatus,
        expected: PositionStatus,
    },
}

/// Transaction kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TxKind {
    Buy,
    Sell,
}

impl std::fmt::Display for TxKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TxKind::Buy => write!(f, "buy"),
            TxKind::Sell => write!(f, "sell"),
        }
    }
}

/// Transaction lifecycle status; `Confirmed` and `Failed` are terminal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "state", content = "reason")]
pub enum TxStatus {
    Pending,
    Confirmed,
    Failed(String),
}

impl TxStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TxStatus::Pending)
    }
}

/// A submitted operation being tracked until it reaches a terminal state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingTransaction {
    pub hash: String,
    pub kind: TxKind,
    pub timestamp: DateTime<Utc>,
    pub retry_count: u32,
    pub status: TxStatus,
}

impl PendingTransaction {
    pub fn new(hash: impl Into<String>, kind: TxKind) -> Self {
        Self {
            hash: hash.into(),
            kind,
            timestamp: Utc::now(),
            retry_count: 0,
            status: TxStatus::Pending,
        }
    }
}
