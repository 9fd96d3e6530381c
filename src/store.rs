//! Durable store and single writer of account balances.
//!
//! Every balance mutation runs under the owning account's lock and commits
//! as one `sled::Batch`, so a transaction row, its dedup marker and the
//! updated projection land together or not at all. Locks are held only for
//! the read-compute-write sequence, never across anything external.

use crate::account::{AccountStatus, AffiliateAccount, BalanceView};
use crate::approval::{AffiliateApproval, ApprovalStatus};
use crate::config::Config;
use crate::error::LedgerError;
use crate::ledger::{LedgerTransaction, TxKind};
use crate::payout::{AffiliatePayoutMethod, PayoutMethodStatus};
use crate::types::{Order, Page, TimeStamp};
use crate::utils;
use crate::withdrawal::{WithdrawalRequest, WithdrawalStatus};
use sled::{Batch, Db};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Serialization unit is the account, not the whole ledger: each key gets
/// its own mutex so commission crediting for thousands of affiliates never
/// contends on one lock.
#[derive(Default)]
struct LockMap {
    inner: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl LockMap {
    fn entry(&self, key: &str) -> Arc<Mutex<()>> {
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        map.entry(key.to_string()).or_default().clone()
    }
}

mod keys {
    use crate::ledger::TxKind;

    pub fn account(id: &str) -> String {
        format!("acct/{id}")
    }
    pub fn code(code: &str) -> String {
        format!("code/{code}")
    }
    pub fn user(user_id: &str) -> String {
        format!("user/{user_id}")
    }
    pub fn tx(account_id: &str, seq: u64) -> String {
        // zero-padded seq keeps scan_prefix in chronological order
        format!("tx/{account_id}/{seq:020}")
    }
    pub fn tx_prefix(account_id: &str) -> String {
        format!("tx/{account_id}/")
    }
    pub fn dedup(account_id: &str, kind: TxKind, source_ref: &str) -> String {
        // source_ref is free-form (Adjustment rows), so hash it into
        // fixed-length key material
        let tag = match kind {
            TxKind::Commission => "commission",
            TxKind::Withdrawal => "withdrawal",
            TxKind::Adjustment => "adjustment",
        };
        let digest = sha256::digest(format!("{tag}:{source_ref}"));
        format!("dedup/{account_id}/{digest}")
    }
    pub fn approval(id: &str) -> String {
        format!("appr/{id}")
    }
    pub fn pending_approval(user_id: &str) -> String {
        format!("apprpending/{user_id}")
    }
    pub fn withdrawal(id: &str) -> String {
        format!("wd/{id}")
    }
    // bech32 strings do not sort by payload, so the index is keyed by
    // request timestamp with the id as a tie-breaker
    pub fn withdrawal_index(account_id: &str, sort_key: i64, request_id: &str) -> String {
        format!("wdacct/{account_id}/{sort_key:020}/{request_id}")
    }
    pub fn withdrawal_prefix(account_id: &str) -> String {
        format!("wdacct/{account_id}/")
    }
    pub fn payout_method(id: &str) -> String {
        format!("pm/{id}")
    }
    pub fn active_payout_method(account_id: &str) -> String {
        format!("pmactive/{account_id}")
    }
}

fn encode<T: minicbor::Encode<()>>(value: &T) -> Result<Vec<u8>, LedgerError> {
    Ok(minicbor::to_vec(value)?)
}

fn decode<T>(bytes: &[u8]) -> Result<T, LedgerError>
where
    T: for<'b> minicbor::Decode<'b, ()>,
{
    Ok(minicbor::decode(bytes)?)
}

pub struct LedgerStore {
    instance: Arc<Db>,
    config: Config,
    locks: LockMap,
}

impl LedgerStore {
    pub fn new(instance: Arc<Db>, config: Config) -> Self {
        Self {
            instance,
            config,
            locks: LockMap::default(),
        }
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Self, LedgerError> {
        let db = sled::open(path)?;
        Ok(Self::new(Arc::new(db), Config::default()))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn clamp(&self, page: Page) -> Page {
        Page {
            limit: page.limit.min(self.config.max_page_size),
            ..page
        }
    }

    fn get<T>(&self, key: &str) -> Result<Option<T>, LedgerError>
    where
        T: for<'b> minicbor::Decode<'b, ()>,
    {
        match self.instance.get(key.as_bytes())? {
            Some(bytes) => Ok(Some(decode(bytes.as_ref())?)),
            None => Ok(None),
        }
    }

    // ACCOUNTS

    pub fn account(&self, account_id: &str) -> Result<AffiliateAccount, LedgerError> {
        self.get(&keys::account(account_id))?
            .ok_or_else(|| LedgerError::not_found("account", account_id))
    }

    pub fn account_by_code(&self, code: &str) -> Result<Option<AffiliateAccount>, LedgerError> {
        match self.instance.get(keys::code(code).as_bytes())? {
            Some(id) => {
                let account_id = String::from_utf8_lossy(id.as_ref()).into_owned();
                Ok(Some(self.account(&account_id)?))
            }
            None => Ok(None),
        }
    }

    pub fn account_for_user(&self, user_id: &str) -> Result<Option<AffiliateAccount>, LedgerError> {
        match self.instance.get(keys::user(user_id).as_bytes())? {
            Some(id) => {
                let account_id = String::from_utf8_lossy(id.as_ref()).into_owned();
                Ok(Some(self.account(&account_id)?))
            }
            None => Ok(None),
        }
    }

    pub fn balance(&self, account_id: &str) -> Result<BalanceView, LedgerError> {
        let account = self.account(account_id)?;
        Ok(BalanceView {
            balance: account.balance,
            reserved: account.reserved,
        })
    }

    /// Soft-disable or re-enable an account. Accounts are never deleted.
    pub fn set_account_status(
        &self,
        account_id: &str,
        status: AccountStatus,
    ) -> Result<AffiliateAccount, LedgerError> {
        let lock = self.locks.entry(account_id);
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());

        let mut account = self.account(account_id)?;
        account.status = status;
        self.instance
            .insert(keys::account(account_id).as_bytes(), encode(&account)?)?;

        info!(account_id, status = ?account.status, "account status changed");
        Ok(account)
    }

    // LEDGER

    /// Append a transaction and update the balance projection in one unit
    /// of work. The dedup gate on `(account, kind, source_ref)` makes
    /// redelivered events a `DuplicateSource` no-op instead of a second
    /// credit or debit.
    pub fn append_transaction(
        &self,
        account_id: &str,
        kind: TxKind,
        amount: i64,
        source_ref: &str,
    ) -> Result<LedgerTransaction, LedgerError> {
        let lock = self.locks.entry(account_id);
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());

        let mut account = self.account(account_id)?;
        if !account.is_active() {
            return Err(LedgerError::AccountNotEligible(account_id.to_string()));
        }

        let dedup_key = keys::dedup(account_id, kind, source_ref);
        if self.instance.get(dedup_key.as_bytes())?.is_some() {
            return Err(LedgerError::DuplicateSource {
                kind,
                source_ref: source_ref.to_string(),
            });
        }

        // Debits settle against the available portion only; reserved funds
        // belong to in-flight withdrawals.
        if amount < 0 && account.available() + amount < 0 {
            return Err(LedgerError::InsufficientFunds {
                available: account.available(),
                requested: -amount,
            });
        }

        let tx = self.build_transaction(&mut account, kind, amount, source_ref)?;

        let mut batch = Batch::default();
        batch.insert(keys::tx(account_id, tx.seq).as_bytes(), encode(&tx)?);
        batch.insert(dedup_key.as_bytes(), tx.seq.to_string().as_bytes());
        batch.insert(keys::account(account_id).as_bytes(), encode(&account)?);
        self.instance.apply_batch(batch)?;

        info!(
            account_id,
            seq = tx.seq,
            kind = ?kind,
            amount,
            balance = account.balance,
            "ledger transaction appended"
        );
        Ok(tx)
    }

    /// Caller must hold the account lock and have passed the gates.
    fn build_transaction(
        &self,
        account: &mut AffiliateAccount,
        kind: TxKind,
        amount: i64,
        source_ref: &str,
    ) -> Result<LedgerTransaction, LedgerError> {
        let balance_before = account.balance;
        let balance_after = balance_before.checked_add(amount).ok_or_else(|| {
            LedgerError::Validation(format!(
                "balance overflow applying {amount} to account {}",
                account.account_id
            ))
        })?;
        account.balance = balance_after;
        account.tx_seq += 1;

        Ok(LedgerTransaction {
            seq: account.tx_seq,
            account_id: account.account_id.clone(),
            kind,
            amount,
            balance_before,
            balance_after,
            source_ref: source_ref.to_string(),
            created_at: TimeStamp::now(),
        })
    }

    pub fn transactions(
        &self,
        account_id: &str,
        page: Page,
    ) -> Result<Vec<LedgerTransaction>, LedgerError> {
        // surface unknown accounts instead of returning an empty page
        self.account(account_id)?;
        let page = self.clamp(page);

        let prefix = keys::tx_prefix(account_id);
        let iter = self.instance.scan_prefix(prefix.as_bytes());

        let mut out = Vec::with_capacity(page.limit);
        match page.order {
            Order::OldestFirst => {
                for item in iter.skip(page.offset).take(page.limit) {
                    let (_, value) = item?;
                    out.push(decode(value.as_ref())?);
                }
            }
            Order::NewestFirst => {
                for item in iter.rev().skip(page.offset).take(page.limit) {
                    let (_, value) = item?;
                    out.push(decode(value.as_ref())?);
                }
            }
        }
        Ok(out)
    }

    // WITHDRAWALS

    /// Reserve funds and persist the pending request in the same atomic
    /// step as the balance check. Two concurrent requests against the same
    /// unreserved balance therefore cannot both pass.
    pub(crate) fn reserve_for_withdrawal(
        &self,
        request: WithdrawalRequest,
    ) -> Result<WithdrawalRequest, LedgerError> {
        let lock = self.locks.entry(&request.account_id);
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());

        let mut account = self.account(&request.account_id)?;
        if !account.is_active() {
            return Err(LedgerError::AccountNotEligible(request.account_id.clone()));
        }
        if account.available() < request.amount {
            return Err(LedgerError::InsufficientFunds {
                available: account.available(),
                requested: request.amount,
            });
        }

        account.reserved += request.amount;

        let mut batch = Batch::default();
        batch.insert(
            keys::withdrawal(&request.request_id).as_bytes(),
            encode(&request)?,
        );
        batch.insert(
            keys::withdrawal_index(
                &request.account_id,
                request.requested_at.sort_key(),
                &request.request_id,
            )
            .as_bytes(),
            request.request_id.as_bytes(),
        );
        batch.insert(
            keys::account(&request.account_id).as_bytes(),
            encode(&account)?,
        );
        self.instance.apply_batch(batch)?;

        info!(
            account_id = %request.account_id,
            request_id = %request.request_id,
            amount = request.amount,
            reserved = account.reserved,
            "withdrawal requested, funds reserved"
        );
        Ok(request)
    }

    /// Debit the reserved amount, release the reservation and mark the
    /// request completed, all in one batch.
    pub(crate) fn settle_withdrawal(
        &self,
        request_id: &str,
    ) -> Result<WithdrawalRequest, LedgerError> {
        let located = self.withdrawal(request_id)?;
        let lock = self.locks.entry(&located.account_id);
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());

        // re-read under the lock; a racing settlement may have won
        let mut request = self.withdrawal(request_id)?;
        if request.status != WithdrawalStatus::Pending {
            return Err(LedgerError::InvalidState(format!(
                "withdrawal request {request_id} is {:?}, expected Pending",
                request.status
            )));
        }

        let mut account = self.account(&request.account_id)?;
        let dedup_key = keys::dedup(&request.account_id, TxKind::Withdrawal, request_id);
        if self.instance.get(dedup_key.as_bytes())?.is_some() {
            return Err(LedgerError::DuplicateSource {
                kind: TxKind::Withdrawal,
                source_ref: request_id.to_string(),
            });
        }

        // The debit settles against funds reserved at request time, so no
        // available-balance gate applies here.
        let tx =
            self.build_transaction(&mut account, TxKind::Withdrawal, -request.amount, request_id)?;
        account.reserved -= request.amount;

        request.status = WithdrawalStatus::Completed;
        request.settled_at = Some(TimeStamp::now());

        let mut batch = Batch::default();
        batch.insert(keys::tx(&request.account_id, tx.seq).as_bytes(), encode(&tx)?);
        batch.insert(dedup_key.as_bytes(), tx.seq.to_string().as_bytes());
        batch.insert(
            keys::account(&request.account_id).as_bytes(),
            encode(&account)?,
        );
        batch.insert(keys::withdrawal(request_id).as_bytes(), encode(&request)?);
        self.instance.apply_batch(batch)?;

        info!(
            account_id = %request.account_id,
            request_id,
            amount = request.amount,
            balance = account.balance,
            "withdrawal completed"
        );
        Ok(request)
    }

    /// Cancel the reservation without writing a ledger row; no debit ever
    /// occurred.
    pub(crate) fn release_withdrawal(
        &self,
        request_id: &str,
        reason: &str,
    ) -> Result<WithdrawalRequest, LedgerError> {
        let located = self.withdrawal(request_id)?;
        let lock = self.locks.entry(&located.account_id);
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());

        let mut request = self.withdrawal(request_id)?;
        if request.status != WithdrawalStatus::Pending {
            return Err(LedgerError::InvalidState(format!(
                "withdrawal request {request_id} is {:?}, expected Pending",
                request.status
            )));
        }

        let mut account = self.account(&request.account_id)?;
        account.reserved -= request.amount;

        request.status = WithdrawalStatus::Released;
        request.reason = Some(reason.to_string());
        request.settled_at = Some(TimeStamp::now());

        let mut batch = Batch::default();
        batch.insert(
            keys::account(&request.account_id).as_bytes(),
            encode(&account)?,
        );
        batch.insert(keys::withdrawal(request_id).as_bytes(), encode(&request)?);
        self.instance.apply_batch(batch)?;

        warn!(
            account_id = %request.account_id,
            request_id,
            amount = request.amount,
            reason,
            "withdrawal released, reservation returned"
        );
        Ok(request)
    }

    pub fn withdrawal(&self, request_id: &str) -> Result<WithdrawalRequest, LedgerError> {
        self.get(&keys::withdrawal(request_id))?
            .ok_or_else(|| LedgerError::not_found("withdrawal request", request_id))
    }

    pub fn withdrawals(
        &self,
        account_id: &str,
        page: Page,
    ) -> Result<Vec<WithdrawalRequest>, LedgerError> {
        self.account(account_id)?;
        let page = self.clamp(page);

        let prefix = keys::withdrawal_prefix(account_id);
        let iter = self.instance.scan_prefix(prefix.as_bytes());

        let mut ids = Vec::new();
        match page.order {
            Order::OldestFirst => {
                for item in iter.skip(page.offset).take(page.limit) {
                    let (_, value) = item?;
                    ids.push(String::from_utf8_lossy(value.as_ref()).into_owned());
                }
            }
            Order::NewestFirst => {
                for item in iter.rev().skip(page.offset).take(page.limit) {
                    let (_, value) = item?;
                    ids.push(String::from_utf8_lossy(value.as_ref()).into_owned());
                }
            }
        }

        ids.iter().map(|id| self.withdrawal(id)).collect()
    }

    // APPROVALS

    pub(crate) fn insert_approval(
        &self,
        approval: &AffiliateApproval,
    ) -> Result<(), LedgerError> {
        let lock = self.locks.entry(&keys::user(&approval.user_id));
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());

        let pending_key = keys::pending_approval(&approval.user_id);
        if self.instance.get(pending_key.as_bytes())?.is_some() {
            return Err(LedgerError::InvalidState(format!(
                "user {} already has a pending application",
                approval.user_id
            )));
        }

        let mut batch = Batch::default();
        batch.insert(
            keys::approval(&approval.approval_id).as_bytes(),
            encode(approval)?,
        );
        batch.insert(pending_key.as_bytes(), approval.approval_id.as_bytes());
        self.instance.apply_batch(batch)?;

        info!(
            user_id = %approval.user_id,
            approval_id = %approval.approval_id,
            "affiliate application submitted"
        );
        Ok(())
    }

    pub fn approval(&self, approval_id: &str) -> Result<AffiliateApproval, LedgerError> {
        self.get(&keys::approval(approval_id))?
            .ok_or_else(|| LedgerError::not_found("approval", approval_id))
    }

    pub fn pending_approval_for(
        &self,
        user_id: &str,
    ) -> Result<Option<AffiliateApproval>, LedgerError> {
        match self.instance.get(keys::pending_approval(user_id).as_bytes())? {
            Some(id) => {
                let approval_id = String::from_utf8_lossy(id.as_ref()).into_owned();
                Ok(Some(self.approval(&approval_id)?))
            }
            None => Ok(None),
        }
    }

    /// Transition Pending -> Approved and, in the same unit of work, create
    /// the affiliate account with a zero balance if the user has none.
    pub(crate) fn approve_approval(
        &self,
        approval_id: &str,
        actor: &str,
        commission_rate_percent: u32,
    ) -> Result<(AffiliateApproval, AffiliateAccount), LedgerError> {
        // rates enter the ledger only here; capping at 100% keeps the
        // commission product within i64 for any order amount
        if commission_rate_percent > 100 {
            return Err(LedgerError::Validation(format!(
                "commission rate must not exceed 100 percent, got {commission_rate_percent}"
            )));
        }

        let located = self.approval(approval_id)?;
        let lock = self.locks.entry(&keys::user(&located.user_id));
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());

        let mut approval = self.approval(approval_id)?;
        if approval.status != ApprovalStatus::Pending {
            return Err(LedgerError::InvalidState(format!(
                "approval {approval_id} is {:?}, expected Pending",
                approval.status
            )));
        }

        approval.status = ApprovalStatus::Approved;
        approval.decided_by = Some(actor.to_string());
        approval.decided_at = Some(TimeStamp::now());

        let existing = self.account_for_user(&approval.user_id)?;
        let is_new = existing.is_none();
        let account = match existing {
            Some(account) => account,
            None => AffiliateAccount {
                account_id: utils::new_account_id()?,
                user_id: approval.user_id.clone(),
                affiliate_code: utils::new_affiliate_code()?,
                commission_rate_percent,
                balance: 0,
                reserved: 0,
                tx_seq: 0,
                status: AccountStatus::Active,
                created_at: TimeStamp::now(),
            },
        };

        let mut batch = Batch::default();
        batch.insert(keys::approval(approval_id).as_bytes(), encode(&approval)?);
        batch.remove(keys::pending_approval(&approval.user_id).as_bytes());
        if is_new {
            batch.insert(
                keys::account(&account.account_id).as_bytes(),
                encode(&account)?,
            );
            batch.insert(
                keys::code(&account.affiliate_code).as_bytes(),
                account.account_id.as_bytes(),
            );
            batch.insert(
                keys::user(&account.user_id).as_bytes(),
                account.account_id.as_bytes(),
            );
        }
        self.instance.apply_batch(batch)?;

        info!(
            approval_id,
            user_id = %approval.user_id,
            account_id = %account.account_id,
            new_account = is_new,
            "affiliate application approved"
        );
        Ok((approval, account))
    }

    pub(crate) fn reject_approval(
        &self,
        approval_id: &str,
        actor: &str,
        reason: &str,
    ) -> Result<AffiliateApproval, LedgerError> {
        let located = self.approval(approval_id)?;
        let lock = self.locks.entry(&keys::user(&located.user_id));
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());

        let mut approval = self.approval(approval_id)?;
        if approval.status != ApprovalStatus::Pending {
            return Err(LedgerError::InvalidState(format!(
                "approval {approval_id} is {:?}, expected Pending",
                approval.status
            )));
        }

        approval.status = ApprovalStatus::Rejected;
        approval.reason = Some(reason.to_string());
        approval.decided_by = Some(actor.to_string());
        approval.decided_at = Some(TimeStamp::now());

        let mut batch = Batch::default();
        batch.insert(keys::approval(approval_id).as_bytes(), encode(&approval)?);
        batch.remove(keys::pending_approval(&approval.user_id).as_bytes());
        self.instance.apply_batch(batch)?;

        info!(approval_id, user_id = %approval.user_id, reason, "affiliate application rejected");
        Ok(approval)
    }

    // PAYOUT METHODS

    /// Persist a new method and demote any previously active one in the
    /// same batch, keeping at most one Active method per account.
    pub(crate) fn insert_payout_method(
        &self,
        method: &AffiliatePayoutMethod,
    ) -> Result<(), LedgerError> {
        let lock = self.locks.entry(&method.account_id);
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());

        let account = self.account(&method.account_id)?;
        if !account.is_active() {
            return Err(LedgerError::AccountNotEligible(method.account_id.clone()));
        }

        let mut batch = Batch::default();
        let active_key = keys::active_payout_method(&method.account_id);
        if let Some(previous_id) = self.instance.get(active_key.as_bytes())? {
            let previous_id = String::from_utf8_lossy(previous_id.as_ref()).into_owned();
            let mut previous = self.payout_method(&previous_id)?;
            previous.status = PayoutMethodStatus::Inactive;
            batch.insert(
                keys::payout_method(&previous_id).as_bytes(),
                encode(&previous)?,
            );
            debug!(
                account_id = %method.account_id,
                method_id = previous_id,
                "previous payout method demoted"
            );
        }

        batch.insert(
            keys::payout_method(&method.method_id).as_bytes(),
            encode(method)?,
        );
        batch.insert(active_key.as_bytes(), method.method_id.as_bytes());
        self.instance.apply_batch(batch)?;

        info!(
            account_id = %method.account_id,
            method_id = %method.method_id,
            "payout method registered"
        );
        Ok(())
    }

    pub fn payout_method(&self, method_id: &str) -> Result<AffiliatePayoutMethod, LedgerError> {
        self.get(&keys::payout_method(method_id))?
            .ok_or_else(|| LedgerError::not_found("payout method", method_id))
    }

    pub fn active_payout_method(
        &self,
        account_id: &str,
    ) -> Result<AffiliatePayoutMethod, LedgerError> {
        match self
            .instance
            .get(keys::active_payout_method(account_id).as_bytes())?
        {
            Some(id) => {
                let method_id = String::from_utf8_lossy(id.as_ref()).into_owned();
                self.payout_method(&method_id)
            }
            None => Err(LedgerError::not_found("active payout method", account_id)),
        }
    }

    /// Soft-delete; idempotent so a redelivered removal is harmless.
    pub(crate) fn remove_payout_method(
        &self,
        method_id: &str,
    ) -> Result<AffiliatePayoutMethod, LedgerError> {
        let located = self.payout_method(method_id)?;
        let lock = self.locks.entry(&located.account_id);
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());

        let mut method = self.payout_method(method_id)?;
        if method.status == PayoutMethodStatus::Deleted {
            return Ok(method);
        }
        method.status = PayoutMethodStatus::Deleted;

        let mut batch = Batch::default();
        batch.insert(keys::payout_method(method_id).as_bytes(), encode(&method)?);
        let active_key = keys::active_payout_method(&method.account_id);
        if let Some(active_id) = self.instance.get(active_key.as_bytes())? {
            if active_id.as_ref() == method_id.as_bytes() {
                batch.remove(active_key.as_bytes());
            }
        }
        self.instance.apply_batch(batch)?;

        info!(
            account_id = %method.account_id,
            method_id,
            "payout method removed"
        );
        Ok(method)
    }
}
