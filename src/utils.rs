//! Identifier minting helpers.

use crate::error::LedgerError;
use bech32::Bech32m;
use uuid7::uuid7;

// construct a unique entity id then encode using bech32
pub fn new_uuid_to_bech32(hrp: &str) -> Result<String, LedgerError> {
    let hrp = bech32::Hrp::parse(hrp).map_err(|e| LedgerError::Validation(e.to_string()))?;
    let encode = bech32::encode::<Bech32m>(hrp, uuid7().as_bytes())
        .map_err(|e| LedgerError::Validation(e.to_string()))?;
    Ok(encode)
}

pub fn new_account_id() -> Result<String, LedgerError> {
    new_uuid_to_bech32("aff")
}

pub fn new_affiliate_code() -> Result<String, LedgerError> {
    new_uuid_to_bech32("code")
}

pub fn new_approval_id() -> Result<String, LedgerError> {
    new_uuid_to_bech32("appr")
}

pub fn new_withdrawal_id() -> Result<String, LedgerError> {
    new_uuid_to_bech32("wd")
}

pub fn new_payout_method_id() -> Result<String, LedgerError> {
    new_uuid_to_bech32("pm")
}
