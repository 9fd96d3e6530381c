//! Withdrawal settlement lifecycle.
//!
//! PENDING (funds reserved) -> COMPLETED (debited) | RELEASED (reservation
//! returned). Payout confirmation is asynchronous and may take days, so the
//! reservation closes the double-spend window at submission time rather
//! than settlement time.

use crate::error::LedgerError;
use crate::payout::PayoutMethodStatus;
use crate::store::LedgerStore;
use crate::types::{Page, TimeStamp};
use crate::utils;
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, error};

#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub enum WithdrawalStatus {
    #[n(0)]
    Pending,
    #[n(1)]
    Completed,
    #[n(2)]
    Released,
}

#[derive(Debug, Clone, minicbor::Encode, minicbor::Decode)]
pub struct WithdrawalRequest {
    #[n(0)]
    pub request_id: String,
    #[n(1)]
    pub account_id: String,
    /// Positive, in minor currency units.
    #[n(2)]
    pub amount: i64,
    #[n(3)]
    pub payout_method_id: String,
    #[n(4)]
    pub status: WithdrawalStatus,
    /// Set when the request is released.
    #[n(5)]
    pub reason: Option<String>,
    #[n(6)]
    pub requested_at: TimeStamp<Utc>,
    #[n(7)]
    pub settled_at: Option<TimeStamp<Utc>>,
}

/// Outcome reported by the external payout processor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PayoutOutcome {
    Confirmed,
    Failed { reason: String },
}

pub struct SettlementEngine {
    store: Arc<LedgerStore>,
}

impl SettlementEngine {
    pub fn new(store: Arc<LedgerStore>) -> Self {
        Self { store }
    }

    /// Submit a withdrawal against the available balance. The balance check
    /// and the reservation happen in one atomic store step.
    pub fn request_withdrawal(
        &self,
        account_id: &str,
        amount: i64,
        payout_method_id: &str,
    ) -> Result<WithdrawalRequest, LedgerError> {
        if amount <= 0 {
            return Err(LedgerError::Validation(format!(
                "withdrawal amount must be positive, got {amount}"
            )));
        }

        let method = self.store.payout_method(payout_method_id)?;
        if method.account_id != account_id {
            // do not leak another account's method ids
            return Err(LedgerError::not_found("payout method", payout_method_id));
        }
        if method.status != PayoutMethodStatus::Active {
            return Err(LedgerError::Validation(format!(
                "payout method {payout_method_id} is {:?}, expected Active",
                method.status
            )));
        }

        let request = WithdrawalRequest {
            request_id: utils::new_withdrawal_id()?,
            account_id: account_id.to_string(),
            amount,
            payout_method_id: payout_method_id.to_string(),
            status: WithdrawalStatus::Pending,
            reason: None,
            requested_at: TimeStamp::now(),
            settled_at: None,
        };

        self.store.reserve_for_withdrawal(request)
    }

    /// Settle a confirmed payout: debit the ledger, release the
    /// reservation and mark the request COMPLETED atomically. Fails with
    /// `InvalidState` on anything but a pending request, guarding against
    /// double-completion.
    pub fn complete_withdrawal(&self, request_id: &str) -> Result<WithdrawalRequest, LedgerError> {
        self.store.settle_withdrawal(request_id).inspect_err(|err| {
            if matches!(err, LedgerError::InvalidState(_)) {
                error!(request_id, %err, "withdrawal completion rejected");
            }
        })
    }

    /// Cancel a failed payout: return the reservation to the available
    /// balance. No ledger row is written since no debit ever occurred.
    pub fn release_withdrawal(
        &self,
        request_id: &str,
        reason: &str,
    ) -> Result<WithdrawalRequest, LedgerError> {
        self.store
            .release_withdrawal(request_id, reason)
            .inspect_err(|err| {
                if matches!(err, LedgerError::InvalidState(_)) {
                    error!(request_id, %err, "withdrawal release rejected");
                }
            })
    }

    /// Adapter for the payout processor's at-least-once notifications. A
    /// redelivery that matches the request's terminal state is a no-op; a
    /// conflicting one surfaces `InvalidState`.
    pub fn on_payout_notification(
        &self,
        request_id: &str,
        outcome: PayoutOutcome,
    ) -> Result<WithdrawalRequest, LedgerError> {
        let request = self.store.withdrawal(request_id)?;

        match (&request.status, &outcome) {
            (WithdrawalStatus::Pending, PayoutOutcome::Confirmed) => {
                self.complete_withdrawal(request_id)
            }
            (WithdrawalStatus::Pending, PayoutOutcome::Failed { reason }) => {
                self.release_withdrawal(request_id, reason)
            }
            (WithdrawalStatus::Completed, PayoutOutcome::Confirmed)
            | (WithdrawalStatus::Released, PayoutOutcome::Failed { .. }) => {
                debug!(request_id, "payout notification redelivered, ignoring");
                Ok(request)
            }
            (status, outcome) => {
                let err = LedgerError::InvalidState(format!(
                    "payout outcome {outcome:?} conflicts with request {request_id} in {status:?}"
                ));
                error!(request_id, %err, "conflicting payout notification");
                Err(err)
            }
        }
    }

    pub fn withdrawal(&self, request_id: &str) -> Result<WithdrawalRequest, LedgerError> {
        self.store.withdrawal(request_id)
    }

    pub fn list_withdrawals(
        &self,
        account_id: &str,
        page: Page,
    ) -> Result<Vec<WithdrawalRequest>, LedgerError> {
        self.store.withdrawals(account_id, page)
    }
}
