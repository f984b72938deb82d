//! Priority-ordered error classification with a bounded audit log
//!
//! Every failure that crosses a component boundary is classified into a
//! small taxonomy that decides whether the operation is retried, which
//! message the user sees, and how the failure is recorded for debugging.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Mutex;
use tracing::{debug, warn};

/// Maximum number of classified errors retained for inspection.
const ERROR_LOG_CAPACITY: usize = 100;

/// Error taxonomy.
///
/// The first five kinds classify remote/ledger failures; the last two are
/// cache-internal and are self-healed, never surfaced to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Network,
    UserAction,
    Gas,
    Contract,
    Unknown,
    CorruptedData,
    VersionMismatch,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Network => "network",
            ErrorKind::UserAction => "user_action",
            ErrorKind::Gas => "gas",
            ErrorKind::Contract => "contract",
            ErrorKind::Unknown => "unknown",
            ErrorKind::CorruptedData => "corrupted_data",
            ErrorKind::VersionMismatch => "version_mismatch",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
}

/// Where and for whom the failure happened; attached to every
/// classified error for traceability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorContext {
    pub operation: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub user_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub additional: Option<serde_json::Value>,
}

impl ErrorContext {
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            timestamp: Utc::now(),
            user_address: None,
            additional: None,
        }
    }

    pub fn with_user(mut self, address: impl Into<String>) -> Self {
        self.user_address = Some(address.into());
        self
    }

    pub fn with_additional(mut self, value: serde_json::Value) -> Self {
        self.additional = Some(value);
        self
    }
}

/// A fully classified failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorDetails {
    pub kind: ErrorKind,
    pub severity: Severity,
    pub message: String,
    pub user_message: String,
    pub should_retry: bool,
    pub suggested_action: String,
    pub context: ErrorContext,
}

/// Signatures checked in priority order; the first match wins.
const NETWORK_PATTERNS: &[&str] = &[
    "timeout",
    "timed out",
    "connection refused",
    "connection reset",
    "connection closed",
    "network",
    "dns",
    "unreachable",
    "econnrefused",
    "econnreset",
    "socket hang up",
    "fetch failed",
    "502",
    "503",
    "504",
    "rate limit",
    "too many requests",
];

const USER_ACTION_PATTERNS: &[&str] = &[
    "user rejected",
    "user denied",
    "rejected by user",
    "request rejected",
    "user cancelled",
    "user canceled",
    "action_rejected",
];

const GAS_PATTERNS: &[&str] = &[
    "insufficient funds",
    "insufficient balance",
    "out of gas",
    "gas required exceeds",
    "intrinsic gas too low",
    "gas limit",
    "fee cap",
];

const CONTRACT_PATTERNS: &[&str] = &[
    "execution reverted",
    "reverted",
    "revert",
    "invalid opcode",
    "call exception",
    "contract",
];

fn matches_any(haystack: &str, patterns: &[&str]) -> bool {
    patterns.iter().any(|p| haystack.contains(p))
}

/// Classify a failure into the taxonomy.
///
/// Matching is case-insensitive over the full error chain so that wrapped
/// errors (reqwest inside anyhow, for example) still hit the right bucket.
pub fn classify(error: &anyhow::Error, context: ErrorContext) -> ErrorDetails {
    let mut full_message = error.to_string();
    for cause in error.chain().skip(1) {
        full_message.push_str(": ");
        full_message.push_str(&cause.to_string());
    }
    let lowered = full_message.to_ascii_lowercase();

    let details = if matches_any(&lowered, NETWORK_PATTERNS) {
        ErrorDetails {
            kind: ErrorKind::Network,
            severity: Severity::Medium,
            message: full_message,
            user_message: "Connection problem, retrying automatically".to_string(),
            should_retry: true,
            suggested_action: "Check your connection; the request will be retried".to_string(),
            context,
        }
    } else if matches_any(&lowered, USER_ACTION_PATTERNS) {
        ErrorDetails {
            kind: ErrorKind::UserAction,
            severity: Severity::Low,
            message: full_message,
            user_message: "Request cancelled".to_string(),
            should_retry: false,
            suggested_action: "Re-submit the operation when ready".to_string(),
            context,
        }
    } else if matches_any(&lowered, GAS_PATTERNS) {
        ErrorDetails {
            kind: ErrorKind::Gas,
            severity: Severity::Medium,
            message: full_message,
            user_message: "Insufficient gas: add funds or raise the limit".to_string(),
            should_retry: false,
            suggested_action: "Top up the account or increase the gas limit".to_string(),
            context,
        }
    } else if matches_any(&lowered, CONTRACT_PATTERNS) {
        ErrorDetails {
            kind: ErrorKind::Contract,
            severity: Severity::High,
            message: full_message,
            user_message: "The ledger rejected the operation".to_string(),
            should_retry: false,
            suggested_action: "Verify the operation parameters and try again".to_string(),
            context,
        }
    } else {
        ErrorDetails {
            kind: ErrorKind::Unknown,
            severity: Severity::High,
            message: full_message,
            user_message: "Something went wrong, retrying".to_string(),
            should_retry: true,
            suggested_action: "If the problem persists, inspect the error log".to_string(),
            context,
        }
    };

    debug!(
        kind = details.kind.as_str(),
        operation = %details.context.operation,
        "classified error: {}",
        details.message
    );
    details
}

/// Bounded ring buffer of classified errors.
///
/// This is the sole audit trail for client-observed failures; oldest
/// entries are evicted first. Constructed explicitly and passed by
/// reference so tests and sessions never share hidden state.
#[derive(Debug)]
pub struct ErrorLog {
    entries: Mutex<VecDeque<ErrorDetails>>,
    capacity: usize,
}

impl Default for ErrorLog {
    fn default() -> Self {
        Self::new(ERROR_LOG_CAPACITY)
    }
}

impl ErrorLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    /// Append a classified error, evicting the oldest entry when full.
    pub fn record(&self, details: ErrorDetails) {
        let mut entries = self.entries.lock().unwrap();
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        if details.severity >= Severity::High {
            warn!(
                kind = details.kind.as_str(),
                operation = %details.context.operation,
                "recorded high-severity error: {}",
                details.message
            );
        }
        entries.push_back(details);
    }

    /// Most recent errors, newest first.
    pub fn recent(&self, limit: usize) -> Vec<ErrorDetails> {
        let entries = self.entries.lock().unwrap();
        entries.iter().rev().take(limit).cloned().collect()
    }

    pub fn by_kind(&self, kind: ErrorKind) -> Vec<ErrorDetails> {
        let entries = self.entries.lock().unwrap();
        entries.iter().filter(|e| e.kind == kind).cloned().collect()
    }

    pub fn by_severity(&self, severity: Severity) -> Vec<ErrorDetails> {
        let entries = self.entries.lock().unwrap();
        entries
            .iter()
            .filter(|e| e.severity == severity)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().unwrap().is_empty()
    }

    pub fn clear(&self) {
        self.entries.lock().unwrap().clear();
    }
}
