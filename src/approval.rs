//! Affiliate program membership state machine.
//!
//! PENDING -> APPROVED | REJECTED. Both outcomes are terminal for the
//! application instance; a rejected user submits a new application rather
//! than reviving the old record.

use crate::account::AffiliateAccount;
use crate::error::LedgerError;
use crate::store::LedgerStore;
use crate::types::TimeStamp;
use crate::utils;
use chrono::Utc;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub enum ApprovalStatus {
    #[n(0)]
    Pending,
    #[n(1)]
    Approved,
    #[n(2)]
    Rejected,
}

#[derive(Debug, Clone, minicbor::Encode, minicbor::Decode)]
pub struct AffiliateApproval {
    #[n(0)]
    pub approval_id: String,
    #[n(1)]
    pub user_id: String,
    #[n(2)]
    pub status: ApprovalStatus,
    /// Mandatory on rejection, absent otherwise.
    #[n(3)]
    pub reason: Option<String>,
    #[n(4)]
    pub decided_by: Option<String>,
    #[n(5)]
    pub submitted_at: TimeStamp<Utc>,
    #[n(6)]
    pub decided_at: Option<TimeStamp<Utc>>,
}

pub struct ApprovalService {
    store: Arc<LedgerStore>,
}

impl ApprovalService {
    pub fn new(store: Arc<LedgerStore>) -> Self {
        Self { store }
    }

    /// Submit a new application. Fails while an unresolved one exists for
    /// the same user.
    pub fn submit(&self, user_id: &str) -> Result<AffiliateApproval, LedgerError> {
        if user_id.trim().is_empty() {
            return Err(LedgerError::Validation("user id must not be empty".into()));
        }

        let approval = AffiliateApproval {
            approval_id: utils::new_approval_id()?,
            user_id: user_id.to_string(),
            status: ApprovalStatus::Pending,
            reason: None,
            decided_by: None,
            submitted_at: TimeStamp::now(),
            decided_at: None,
        };

        self.store.insert_approval(&approval)?;
        Ok(approval)
    }

    /// Approve a pending application. Creates the affiliate account with a
    /// zero balance in the same unit of work if the user has none; the
    /// commission rate comes from [`crate::config::Config`].
    pub fn approve(
        &self,
        approval_id: &str,
        actor: &str,
    ) -> Result<(AffiliateApproval, AffiliateAccount), LedgerError> {
        let rate = self.store.config().default_commission_rate_percent;
        self.store.approve_approval(approval_id, actor, rate)
    }

    /// Reject a pending application. A reason is mandatory and persisted.
    pub fn reject(
        &self,
        approval_id: &str,
        actor: &str,
        reason: &str,
    ) -> Result<AffiliateApproval, LedgerError> {
        if reason.trim().is_empty() {
            return Err(LedgerError::Validation(
                "a rejection reason is required".into(),
            ));
        }
        self.store.reject_approval(approval_id, actor, reason)
    }

    pub fn approval(&self, approval_id: &str) -> Result<AffiliateApproval, LedgerError> {
        self.store.approval(approval_id)
    }

    pub fn pending_for(&self, user_id: &str) -> Result<Option<AffiliateApproval>, LedgerError> {
        self.store.pending_approval_for(user_id)
    }
}
