//! Payout method registry boundary.
//!
//! Thin adapter over bank-transfer destinations. The settlement engine only
//! ever reads an account's active method; the at-most-one-Active rule is
//! enforced here, not in the ledger.

use crate::error::LedgerError;
use crate::store::LedgerStore;
use crate::types::TimeStamp;
use crate::utils;
use chrono::Utc;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub enum PayoutMethodStatus {
    #[n(0)]
    Active,
    #[n(1)]
    Inactive,
    #[n(2)]
    Deleted,
}

#[derive(Debug, Clone, minicbor::Encode, minicbor::Decode)]
pub struct AffiliatePayoutMethod {
    #[n(0)]
    pub method_id: String,
    #[n(1)]
    pub account_id: String,
    /// Opaque bank destination, e.g. a masked account number. Validating
    /// the real destination belongs to the external payout processor.
    #[n(2)]
    pub destination: String,
    #[n(3)]
    pub status: PayoutMethodStatus,
    #[n(4)]
    pub created_at: TimeStamp<Utc>,
}

pub struct PayoutMethodRegistry {
    store: Arc<LedgerStore>,
}

impl PayoutMethodRegistry {
    pub fn new(store: Arc<LedgerStore>) -> Self {
        Self { store }
    }

    /// Register a destination as the account's active method. Any previous
    /// active method is demoted to Inactive in the same unit of work.
    pub fn register(
        &self,
        account_id: &str,
        destination: &str,
    ) -> Result<AffiliatePayoutMethod, LedgerError> {
        if destination.trim().is_empty() {
            return Err(LedgerError::Validation(
                "payout destination must not be empty".into(),
            ));
        }

        let method = AffiliatePayoutMethod {
            method_id: utils::new_payout_method_id()?,
            account_id: account_id.to_string(),
            destination: destination.to_string(),
            status: PayoutMethodStatus::Active,
            created_at: TimeStamp::now(),
        };

        self.store.insert_payout_method(&method)?;
        Ok(method)
    }

    pub fn active_method(&self, account_id: &str) -> Result<AffiliatePayoutMethod, LedgerError> {
        self.store.active_payout_method(account_id)
    }

    pub fn method(&self, method_id: &str) -> Result<AffiliatePayoutMethod, LedgerError> {
        self.store.payout_method(method_id)
    }

    /// Soft-delete a method. Idempotent; records are never physically
    /// removed.
    pub fn remove(&self, method_id: &str) -> Result<AffiliatePayoutMethod, LedgerError> {
        self.store.remove_payout_method(method_id)
    }
}
