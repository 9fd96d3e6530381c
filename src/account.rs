//! Affiliate account projection.
//!
//! `balance` and `reserved` are a materialized view over the transaction
//! log; only [`crate::store::LedgerStore`] writes them.

use crate::types::TimeStamp;
use chrono::Utc;

#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub enum AccountStatus {
    #[n(0)]
    Active,
    #[n(1)]
    Disabled,
}

#[derive(Debug, Clone, minicbor::Encode, minicbor::Decode)]
pub struct AffiliateAccount {
    #[n(0)]
    pub account_id: String,
    #[n(1)]
    pub user_id: String,
    /// Code referral links carry; resolved by the commission processor.
    #[n(2)]
    pub affiliate_code: String,
    /// Whole-percent commission rate applied to order amounts.
    #[n(3)]
    pub commission_rate_percent: u32,
    /// Settled balance in minor currency units. Equals the sum of all
    /// transaction amounts for this account.
    #[n(4)]
    pub balance: i64,
    /// Amount earmarked for in-flight withdrawals.
    #[n(5)]
    pub reserved: i64,
    /// Sequence number of the last appended transaction (0 = none yet).
    #[n(6)]
    pub tx_seq: u64,
    #[n(7)]
    pub status: AccountStatus,
    #[n(8)]
    pub created_at: TimeStamp<Utc>,
}

impl AffiliateAccount {
    pub fn available(&self) -> i64 {
        self.balance - self.reserved
    }

    pub fn is_active(&self) -> bool {
        self.status == AccountStatus::Active
    }
}

/// Read-only balance snapshot returned by [`crate::store::LedgerStore::balance`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BalanceView {
    pub balance: i64,
    pub reserved: i64,
}

impl BalanceView {
    pub fn available(&self) -> i64 {
        self.balance - self.reserved
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn available_subtracts_reservation() {
        let view = BalanceView {
            balance: 100_000,
            reserved: 60_000,
        };
        assert_eq!(view.available(), 40_000);
    }
}
