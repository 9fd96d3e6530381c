//! Property-based tests for ledger invariants.
//!
//! These drive random interleavings of commission credits, withdrawal
//! requests and settlements against a real store, then check the invariants
//! that must hold regardless of the sequence:
//!
//! 1. balance == sum of all transaction amounts (projection integrity)
//! 2. balance - reserved >= 0 (reservations never overdraw)
//! 3. transaction n's balance_before == transaction n-1's balance_after
//! 4. replayed order ids never credit twice
//!
//! Each case opens its own sled db on temp storage, so the case count is
//! kept deliberately low.

use affiliate_ledger::approval::ApprovalService;
use affiliate_ledger::commission::{commission_for, CommissionProcessor, OrderCompleted};
use affiliate_ledger::payout::PayoutMethodRegistry;
use affiliate_ledger::types::Page;
use affiliate_ledger::withdrawal::SettlementEngine;
use affiliate_ledger::{LedgerError, LedgerStore};
use proptest::prelude::*;
use std::collections::VecDeque;
use std::sync::Arc;

#[derive(Debug, Clone)]
enum Op {
    /// Credit order "O{n}"; small id space forces replays.
    Credit { order: u8, amount: u32 },
    Request { amount: u32 },
    CompleteOldest,
    ReleaseOldest,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0u8..12, 0u32..2_000_000).prop_map(|(order, amount)| Op::Credit { order, amount }),
        (1u32..150_000).prop_map(|amount| Op::Request { amount }),
        Just(Op::CompleteOldest),
        Just(Op::ReleaseOldest),
    ]
}

/// Reference model mirroring the engine's documented semantics.
#[derive(Default)]
struct Model {
    balance: i64,
    reserved: i64,
    credited_orders: Vec<u8>,
    pending: VecDeque<(String, i64)>,
    tx_count: usize,
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_invariants_hold_across_random_op_sequences(ops in prop::collection::vec(op_strategy(), 1..40)) {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = Arc::new(LedgerStore::open(temp_dir.path().join("prop.db")).unwrap());

        let approvals = ApprovalService::new(store.clone());
        let approval = approvals.submit("prop-user").unwrap();
        let (_, account) = approvals.approve(&approval.approval_id, "admin").unwrap();
        let account_id = account.account_id.clone();
        let rate = account.commission_rate_percent;

        let method = PayoutMethodRegistry::new(store.clone())
            .register(&account_id, "bank ****0000")
            .unwrap();

        let processor = CommissionProcessor::new(store.clone());
        let engine = SettlementEngine::new(store.clone());
        let mut model = Model::default();

        for op in &ops {
            match op {
                Op::Credit { order, amount } => {
                    let event = OrderCompleted {
                        order_id: format!("O{order}"),
                        affiliate_code: account.affiliate_code.clone(),
                        order_amount: i64::from(*amount),
                    };
                    processor.on_order_completed(&event).unwrap();

                    if !model.credited_orders.contains(order) {
                        model.credited_orders.push(*order);
                        model.balance += commission_for(i64::from(*amount), rate);
                        model.tx_count += 1;
                    }
                }
                Op::Request { amount } => {
                    let amount = i64::from(*amount);
                    let result =
                        engine.request_withdrawal(&account_id, amount, &method.method_id);
                    if model.balance - model.reserved >= amount {
                        let request = result.unwrap();
                        model.reserved += amount;
                        model.pending.push_back((request.request_id, amount));
                    } else {
                        prop_assert!(
                            matches!(result, Err(LedgerError::InsufficientFunds { .. })),
                            "expected InsufficientFunds, got {:?}",
                            result
                        );
                    }
                }
                Op::CompleteOldest => {
                    if let Some((request_id, amount)) = model.pending.pop_front() {
                        engine.complete_withdrawal(&request_id).unwrap();
                        model.balance -= amount;
                        model.reserved -= amount;
                        model.tx_count += 1;
                    }
                }
                Op::ReleaseOldest => {
                    if let Some((request_id, amount)) = model.pending.pop_front() {
                        engine.release_withdrawal(&request_id, "payout failed").unwrap();
                        model.reserved -= amount;
                    }
                }
            }

            let view = store.balance(&account_id).unwrap();
            prop_assert_eq!(view.balance, model.balance);
            prop_assert_eq!(view.reserved, model.reserved);
            prop_assert!(view.available() >= 0, "available went negative");
        }

        // projection equals the sum of the full log
        let txs = store
            .transactions(&account_id, Page::first(1000).oldest_first())
            .unwrap();
        prop_assert_eq!(txs.len(), model.tx_count);
        let sum: i64 = txs.iter().map(|tx| tx.amount).sum();
        prop_assert_eq!(sum, model.balance);

        // gap-free chain
        for (i, tx) in txs.iter().enumerate() {
            prop_assert_eq!(tx.seq, i as u64 + 1);
            prop_assert_eq!(tx.balance_after, tx.balance_before + tx.amount);
            if i > 0 {
                prop_assert_eq!(tx.balance_before, txs[i - 1].balance_after);
            }
        }
    }

    /// floor-division commission never exceeds the exact entitlement and
    /// never goes negative.
    #[test]
    fn prop_commission_is_bounded(amount in 0i64..=i64::MAX / 2, rate in 0u32..=100) {
        let commission = commission_for(amount, rate);

        prop_assert!(commission >= 0);
        prop_assert!(commission <= amount);
        // floor: recomputing the exact product brackets the result
        let exact = i128::from(amount) * i128::from(rate);
        prop_assert!(i128::from(commission) * 100 <= exact);
        prop_assert!((i128::from(commission) + 1) * 100 > exact);
    }

    /// Pagination is pure: walking the log in pages reproduces the log.
    #[test]
    fn prop_pagination_is_restartable(orders in 1u8..20, limit in 1usize..7) {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = Arc::new(LedgerStore::open(temp_dir.path().join("pages.db")).unwrap());

        let approvals = ApprovalService::new(store.clone());
        let approval = approvals.submit("page-user").unwrap();
        let (_, account) = approvals.approve(&approval.approval_id, "admin").unwrap();

        let processor = CommissionProcessor::new(store.clone());
        for i in 0..orders {
            processor
                .on_order_completed(&OrderCompleted {
                    order_id: format!("O{i}"),
                    affiliate_code: account.affiliate_code.clone(),
                    order_amount: 10_000,
                })
                .unwrap();
        }

        let full = store
            .transactions(&account.account_id, Page::first(1000).oldest_first())
            .unwrap();

        let mut paged = Vec::new();
        let mut offset = 0;
        loop {
            let page = store
                .transactions(
                    &account.account_id,
                    Page::first(limit).oldest_first().at_offset(offset),
                )
                .unwrap();
            if page.is_empty() {
                break;
            }
            offset += page.len();
            paged.extend(page);
        }

        prop_assert_eq!(paged.len(), full.len());
        for (a, b) in paged.iter().zip(full.iter()) {
            prop_assert_eq!(a.seq, b.seq);
            prop_assert_eq!(a.source_ref.clone(), b.source_ref.clone());
        }
    }
}
