use crate::db::billing_store::StoreError;
use crate::services::ledger::LedgerError;

#[derive(Debug, thiserror::Error)]
pub enum BillingError {
    #[error("invalid webhook signature: {0}")]
    InvalidSignature(String),
    #[error("malformed webhook payload: {0}")]
    MalformedPayload(String),
    #[error("no plan or pack mapped to provider id {0}")]
    UnknownPlanMapping(String),
    #[error("unable to resolve an account for the event")]
    AccountNotFound,
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error("billing storage unavailable: {0}")]
    Unavailable(String),
}

impl BillingError {
    /// Transient failures the provider should redeliver.
    pub fn is_retryable(&self) -> bool {
        match self {
            BillingError::Unavailable(_) => true,
            BillingError::Ledger(err) => err.is_retryable(),
            _ => false,
        }
    }
}

impl From<StoreError> for BillingError {
    fn from(err: StoreError) -> Self {
        BillingError::Unavailable(err.to_string())
    }
}
