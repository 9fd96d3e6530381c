//! Immutable ledger transaction records.

use crate::types::TimeStamp;
use chrono::Utc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub enum TxKind {
    #[n(0)]
    Commission,
    #[n(1)]
    Withdrawal,
    #[n(2)]
    Adjustment,
}

/// Append-only record. Never mutated or deleted once written; corrections
/// are offsetting `Adjustment` rows.
#[derive(Debug, Clone, minicbor::Encode, minicbor::Decode)]
pub struct LedgerTransaction {
    /// Monotonic per account, starting at 1.
    #[n(0)]
    pub seq: u64,
    #[n(1)]
    pub account_id: String,
    #[n(2)]
    pub kind: TxKind,
    /// Signed minor units: credits positive, withdrawals negative.
    #[n(3)]
    pub amount: i64,
    #[n(4)]
    pub balance_before: i64,
    #[n(5)]
    pub balance_after: i64,
    /// Order id for Commission, withdrawal-request id for Withdrawal,
    /// free-form for Adjustment. Dedup key together with `kind`.
    #[n(6)]
    pub source_ref: String,
    #[n(7)]
    pub created_at: TimeStamp<Utc>,
}
