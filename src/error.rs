use crate::ledger::TxKind;

/// Error taxonomy for the ledger core.
///
/// `InsufficientFunds`, `InvalidState` and `AccountNotEligible` are terminal
/// for the request that raised them and must be surfaced, never retried.
/// `DuplicateSource` marks an idempotent replay; callers treat it as success.
/// `Storage` and `Codec` are transient from the caller's point of view and
/// safe to retry because every mutation is gated by a dedup key or a state
/// check.
#[derive(thiserror::Error, Debug)]
pub enum LedgerError {
    #[error("insufficient available funds: available {available}, requested {requested}")]
    InsufficientFunds { available: i64, requested: i64 },

    #[error("transaction already recorded for {kind:?} source '{source_ref}'")]
    DuplicateSource { kind: TxKind, source_ref: String },

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("account {0} is not eligible for ledger operations")]
    AccountNotEligible(String),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("storage error: {0}")]
    Storage(#[from] sled::Error),

    #[error("codec error: {0}")]
    Codec(String),
}

impl LedgerError {
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }

    /// True when the error marks an idempotent replay rather than a failure.
    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::DuplicateSource { .. })
    }
}

impl From<minicbor::decode::Error> for LedgerError {
    fn from(err: minicbor::decode::Error) -> Self {
        Self::Codec(err.to_string())
    }
}

impl From<minicbor::encode::Error<std::convert::Infallible>> for LedgerError {
    fn from(err: minicbor::encode::Error<std::convert::Infallible>) -> Self {
        Self::Codec(err.to_string())
    }
}
