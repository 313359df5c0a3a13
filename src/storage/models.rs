//! Storage models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Cost of one AI interpretation, in credits.
pub const INTERPRETATION_COST: i64 = 1;

/// Credits granted to a newly created account.
pub const STARTING_CREDITS: i64 = 3;

/// Account record. Identity itself (login, OAuth) is owned elsewhere; the
/// pipeline only reads settings and mutates the credit balance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    pub email: String,
    pub credits: i64,
    /// Preferred interpretation language code (e.g. "en", "de")
    pub language: String,
    /// Preferred prompt style tag (e.g. "basic", "ridge", "xcperfect")
    pub style: String,
    /// Preferred unit system ("metric" or "imperial")
    pub units: String,
    pub created_at: DateTime<Utc>,
}

/// Ledger entry kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    /// Credits bought by the user.
    Purchase,
    /// Credits reserved for paid work (negative amount).
    Debit,
    /// Reversal of a debit after the paid-for work failed.
    Refund,
}

impl std::fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Purchase => write!(f, "purchase"),
            Self::Debit => write!(f, "debit"),
            Self::Refund => write!(f, "refund"),
        }
    }
}

impl std::str::FromStr for TransactionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "purchase" => Ok(Self::Purchase),
            "debit" => Ok(Self::Debit),
            "refund" => Ok(Self::Refund),
            _ => Err(format!("Unknown transaction kind: {}", s)),
        }
    }
}

/// Immutable ledger entry. Never updated or deleted once written; the sum of
/// amounts for an account tracks its balance by construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: String,
    pub account_id: String,
    pub kind: TransactionKind,
    /// Signed amount: negative for debits, positive for purchases/refunds.
    pub amount: i64,
    pub description: String,
    pub created_at: DateTime<Utc>,
}

/// Persisted report artifact. Created only after generation succeeds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Report {
    pub id: String,
    pub account_id: String,
    pub lat: f64,
    pub lon: f64,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// Database health summary for the /api/health endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseHealth {
    pub foreign_keys_enabled: bool,
    pub integrity_check: String,
    pub account_count: u64,
    pub journal_mode: String,
}
