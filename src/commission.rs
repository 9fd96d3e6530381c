//! Commission crediting for completed orders.
//!
//! Order events arrive at-least-once; the ledger's dedup gate on the order
//! id turns redeliveries into [`CommissionOutcome::AlreadyCredited`] instead
//! of a second credit.

use crate::error::LedgerError;
use crate::ledger::{LedgerTransaction, TxKind};
use crate::store::LedgerStore;
use std::sync::Arc;
use tracing::debug;

/// Inbound "order finalized" notification from the order system.
#[derive(Debug, Clone)]
pub struct OrderCompleted {
    pub order_id: String,
    pub affiliate_code: String,
    /// Order total in minor currency units.
    pub order_amount: i64,
}

#[derive(Debug)]
pub enum CommissionOutcome {
    /// Exactly-once credit was appended.
    Credited(LedgerTransaction),
    /// Redelivered event; the credit already exists.
    AlreadyCredited,
    /// The order carried no known affiliate code, or the code belongs to a
    /// disabled account. Discarded, not an error: not every order is
    /// attributed.
    Unattributed,
}

/// `floor(order_amount * rate / 100)` in integer arithmetic. The multiply
/// widens to i128 so large order amounts cannot overflow; rates are capped
/// at 100 where accounts are created, so the quotient fits back in i64.
pub fn commission_for(order_amount: i64, rate_percent: u32) -> i64 {
    (i128::from(order_amount) * i128::from(rate_percent) / 100) as i64
}

pub struct CommissionProcessor {
    store: Arc<LedgerStore>,
}

impl CommissionProcessor {
    pub fn new(store: Arc<LedgerStore>) -> Self {
        Self { store }
    }

    /// Translate an order completion into at most one COMMISSION credit.
    ///
    /// The only side effect is the ledger append, so a caller that timed
    /// out or failed mid-way may redeliver the event safely.
    pub fn on_order_completed(
        &self,
        event: &OrderCompleted,
    ) -> Result<CommissionOutcome, LedgerError> {
        if event.order_amount < 0 {
            return Err(LedgerError::Validation(format!(
                "order amount must not be negative, got {}",
                event.order_amount
            )));
        }

        let Some(account) = self.store.account_by_code(&event.affiliate_code)? else {
            debug!(
                order_id = %event.order_id,
                affiliate_code = %event.affiliate_code,
                "order not attributed to a known affiliate, discarding"
            );
            return Ok(CommissionOutcome::Unattributed);
        };

        // a disabled affiliate is treated like an unknown code: the event
        // is discarded, not surfaced as an error the upstream would retry
        // forever
        if !account.is_active() {
            debug!(
                order_id = %event.order_id,
                account_id = %account.account_id,
                "order attributed to a disabled affiliate, discarding"
            );
            return Ok(CommissionOutcome::Unattributed);
        }

        let commission = commission_for(event.order_amount, account.commission_rate_percent);

        // zero-amount orders still get a row so the ledger stays gap-free
        // per attributed order
        match self.store.append_transaction(
            &account.account_id,
            TxKind::Commission,
            commission,
            &event.order_id,
        ) {
            Ok(tx) => Ok(CommissionOutcome::Credited(tx)),
            Err(err) if err.is_duplicate() => {
                debug!(order_id = %event.order_id, "commission already credited, replay ignored");
                Ok(CommissionOutcome::AlreadyCredited)
            }
            Err(err) => Err(err),
        }
    }
}
