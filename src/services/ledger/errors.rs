use uuid::Uuid;

use crate::db::billing_store::StoreError;
use crate::models::credit_transaction::CreditTransactionType;

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("credit amount must be positive, got {0}")]
    InvalidAmount(i64),
    #[error("{0:?} is not a grant transaction type")]
    InvalidGrantType(CreditTransactionType),
    #[error("insufficient credits: balance {balance}, requested {requested}")]
    InsufficientCredits { balance: i64, requested: i64 },
    #[error("account {0} not found")]
    AccountNotFound(Uuid),
    #[error("ledger storage unavailable: {0}")]
    Unavailable(String),
}

impl LedgerError {
    /// Only infrastructure failures are safe to retry; the operation never partially applied.
    pub fn is_retryable(&self) -> bool {
        matches!(self, LedgerError::Unavailable(_))
    }
}

impl From<StoreError> for LedgerError {
    fn from(err: StoreError) -> Self {
        LedgerError::Unavailable(err.to_string())
    }
}
