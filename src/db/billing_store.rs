use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::models::{
    account::{Account, BillingProvider, SubscriptionState},
    credit_transaction::{CreditTransaction, CreditTransactionType, NewCreditTransaction},
    purchase::{NewPurchase, Purchase, PurchaseStatus},
};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("record not found")]
    NotFound,
    #[error("conflicting write: {0}")]
    Conflict(String),
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => StoreError::NotFound,
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                StoreError::Conflict(db_err.message().to_string())
            }
            other => StoreError::Unavailable(other.to_string()),
        }
    }
}

/// Entry point to billing persistence. Everything that mutates goes through a unit of work.
#[async_trait]
pub trait BillingStore: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn BillingUnitOfWork>, StoreError>;

    async fn find_account(&self, account_id: Uuid) -> Result<Option<Account>, StoreError>;

    async fn find_purchase(
        &self,
        provider: BillingProvider,
        external_payment_id: &str,
    ) -> Result<Option<Purchase>, StoreError>;

    /// Newest first.
    async fn list_transactions(
        &self,
        account_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<CreditTransaction>, StoreError>;

    async fn list_transactions_since(
        &self,
        account_id: Uuid,
        r#type: CreditTransactionType,
        since: OffsetDateTime,
    ) -> Result<Vec<CreditTransaction>, StoreError>;
}

/// One atomic unit of work. Dropping it without `commit` discards every write made through it.
///
/// `lock_account` must be called before any read-modify-write of an account; it holds the row
/// until the unit of work ends so concurrent writers for the same account are serialised.
#[async_trait]
pub trait BillingUnitOfWork: Send {
    /// Returns `false` when the account already existed.
    async fn insert_account(&mut self, account: &Account) -> Result<bool, StoreError>;

    async fn lock_account(&mut self, account_id: Uuid) -> Result<Option<Account>, StoreError>;

    async fn find_account_id_by_customer(
        &mut self,
        provider: BillingProvider,
        external_customer_id: &str,
    ) -> Result<Option<Uuid>, StoreError>;

    async fn update_balance(
        &mut self,
        account_id: Uuid,
        credit_balance: i64,
        lifetime_credits: i64,
    ) -> Result<(), StoreError>;

    async fn insert_transaction(
        &mut self,
        entry: NewCreditTransaction,
    ) -> Result<CreditTransaction, StoreError>;

    async fn update_subscription_state(
        &mut self,
        account_id: Uuid,
        state: &SubscriptionState,
    ) -> Result<(), StoreError>;

    async fn find_purchase(
        &mut self,
        provider: BillingProvider,
        external_payment_id: &str,
    ) -> Result<Option<Purchase>, StoreError>;

    /// Fails with `StoreError::Conflict` if `(provider, external_payment_id)` already exists.
    async fn insert_purchase(&mut self, purchase: NewPurchase) -> Result<Purchase, StoreError>;

    /// Returns the number of rows touched.
    async fn update_purchase_status(
        &mut self,
        provider: BillingProvider,
        external_payment_id: &str,
        status: PurchaseStatus,
    ) -> Result<u64, StoreError>;

    async fn has_period_grant(
        &mut self,
        account_id: Uuid,
        period_key: &str,
    ) -> Result<bool, StoreError>;

    async fn record_period_grant(
        &mut self,
        account_id: Uuid,
        period_key: &str,
    ) -> Result<(), StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}
