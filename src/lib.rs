//! Affiliate commission ledger and withdrawal settlement engine.
//!
//! The crate tracks each affiliate's running balance as an append-only
//! transaction log plus a materialized projection, credits commissions
//! exactly once per completed order, and settles withdrawal requests
//! against a reserve/commit lifecycle. All balance mutation goes through
//! [`store::LedgerStore`]; the service types in [`approval`],
//! [`commission`], [`withdrawal`] and [`payout`] implement the state
//! machines on top of it.

pub mod account;
pub mod approval;
pub mod commission;
pub mod config;
pub mod error;
pub mod ledger;
pub mod payout;
pub mod store;
pub mod types;
pub mod utils;
pub mod withdrawal;

pub use config::Config;
pub use error::LedgerError;
pub use store::LedgerStore;
