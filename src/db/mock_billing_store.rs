use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use uuid::Uuid;

use crate::db::billing_store::{BillingStore, BillingUnitOfWork, StoreError};
use crate::models::{
    account::{Account, BillingProvider, SubscriptionState},
    credit_transaction::{CreditTransaction, CreditTransactionType, NewCreditTransaction},
    purchase::{NewPurchase, Purchase, PurchaseStatus},
};

/// Operation on which the mock store should fail, to exercise rollback paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailPoint {
    Begin,
    UpdateBalance,
    InsertTransaction,
    InsertPurchase,
    UpdateSubscription,
    Commit,
}

#[derive(Debug, Clone, Default)]
struct MemoryState {
    accounts: HashMap<Uuid, Account>,
    transactions: Vec<CreditTransaction>,
    purchases: Vec<Purchase>,
    period_grants: HashSet<(Uuid, String)>,
}

/// In-memory `BillingStore`. Units of work are fully serialised and apply their writes only on
/// commit, which gives the same all-or-nothing behaviour as the Postgres store.
#[derive(Clone, Default)]
pub struct MockBillingStore {
    state: Arc<AsyncMutex<MemoryState>>,
    fail_point: Arc<Mutex<Option<FailPoint>>>,
    pub commits: Arc<AtomicUsize>,
}

impl MockBillingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn seed_account(&self, account: Account) {
        self.state
            .lock()
            .await
            .accounts
            .insert(account.id, account);
    }

    pub async fn account(&self, account_id: Uuid) -> Option<Account> {
        self.state.lock().await.accounts.get(&account_id).cloned()
    }

    /// Oldest first.
    pub async fn transactions(&self, account_id: Uuid) -> Vec<CreditTransaction> {
        self.state
            .lock()
            .await
            .transactions
            .iter()
            .filter(|t| t.account_id == account_id)
            .cloned()
            .collect()
    }

    pub async fn purchases(&self) -> Vec<Purchase> {
        self.state.lock().await.purchases.clone()
    }

    pub fn fail_on(&self, point: FailPoint) {
        *self.fail_point.lock().unwrap_or_else(|e| e.into_inner()) = Some(point);
    }

    pub fn clear_failure(&self) {
        *self.fail_point.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }

    pub fn commit_count(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }

    fn check(fail_point: &Mutex<Option<FailPoint>>, point: FailPoint) -> Result<(), StoreError> {
        let current = *fail_point.lock().unwrap_or_else(|e| e.into_inner());
        if current == Some(point) {
            return Err(StoreError::Unavailable(format!(
                "injected failure at {point:?}"
            )));
        }
        Ok(())
    }
}

pub struct MockUnitOfWork {
    guard: OwnedMutexGuard<MemoryState>,
    working: MemoryState,
    fail_point: Arc<Mutex<Option<FailPoint>>>,
    commits: Arc<AtomicUsize>,
}

impl MockUnitOfWork {
    fn check(&self, point: FailPoint) -> Result<(), StoreError> {
        MockBillingStore::check(&self.fail_point, point)
    }
}

#[async_trait]
impl BillingStore for MockBillingStore {
    async fn begin(&self) -> Result<Box<dyn BillingUnitOfWork>, StoreError> {
        Self::check(&self.fail_point, FailPoint::Begin)?;
        let guard = self.state.clone().lock_owned().await;
        let working = guard.clone();
        Ok(Box::new(MockUnitOfWork {
            guard,
            working,
            fail_point: self.fail_point.clone(),
            commits: self.commits.clone(),
        }))
    }

    async fn find_account(&self, account_id: Uuid) -> Result<Option<Account>, StoreError> {
        Ok(self.account(account_id).await)
    }

    async fn find_purchase(
        &self,
        provider: BillingProvider,
        external_payment_id: &str,
    ) -> Result<Option<Purchase>, StoreError> {
        Ok(self
            .state
            .lock()
            .await
            .purchases
            .iter()
            .find(|p| p.provider == provider && p.external_payment_id == external_payment_id)
            .cloned())
    }

    async fn list_transactions(
        &self,
        account_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<CreditTransaction>, StoreError> {
        let mut rows = self.transactions(account_id).await;
        rows.reverse();
        Ok(rows
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect())
    }

    async fn list_transactions_since(
        &self,
        account_id: Uuid,
        r#type: CreditTransactionType,
        since: OffsetDateTime,
    ) -> Result<Vec<CreditTransaction>, StoreError> {
        let mut rows: Vec<_> = self
            .transactions(account_id)
            .await
            .into_iter()
            .filter(|t| t.r#type == r#type && t.created_at >= since)
            .collect();
        rows.reverse();
        Ok(rows)
    }
}

#[async_trait]
impl BillingUnitOfWork for MockUnitOfWork {
    async fn insert_account(&mut self, account: &Account) -> Result<bool, StoreError> {
        if self.working.accounts.contains_key(&account.id) {
            return Ok(false);
        }
        self.working.accounts.insert(account.id, account.clone());
        Ok(true)
    }

    async fn lock_account(&mut self, account_id: Uuid) -> Result<Option<Account>, StoreError> {
        Ok(self.working.accounts.get(&account_id).cloned())
    }

    async fn find_account_id_by_customer(
        &mut self,
        provider: BillingProvider,
        external_customer_id: &str,
    ) -> Result<Option<Uuid>, StoreError> {
        Ok(self
            .working
            .accounts
            .values()
            .filter(|a| {
                a.external_customer_id.as_deref() == Some(external_customer_id)
                    && (a.billing_provider == provider
                        || a.billing_provider == BillingProvider::None)
            })
            .max_by_key(|a| a.updated_at)
            .map(|a| a.id))
    }

    async fn update_balance(
        &mut self,
        account_id: Uuid,
        credit_balance: i64,
        lifetime_credits: i64,
    ) -> Result<(), StoreError> {
        self.check(FailPoint::UpdateBalance)?;
        let account = self
            .working
            .accounts
            .get_mut(&account_id)
            .ok_or(StoreError::NotFound)?;
        account.credit_balance = credit_balance;
        account.lifetime_credits = lifetime_credits;
        account.updated_at = OffsetDateTime::now_utc();
        Ok(())
    }

    async fn insert_transaction(
        &mut self,
        entry: NewCreditTransaction,
    ) -> Result<CreditTransaction, StoreError> {
        self.check(FailPoint::InsertTransaction)?;
        let row = CreditTransaction {
            id: Uuid::new_v4(),
            account_id: entry.account_id,
            r#type: entry.r#type,
            amount: entry.amount,
            balance_after: entry.balance_after,
            reason: entry.reason,
            description: entry.description,
            related_asset_id: entry.related_asset_id,
            related_purchase_id: entry.related_purchase_id,
            created_at: OffsetDateTime::now_utc(),
        };
        self.working.transactions.push(row.clone());
        Ok(row)
    }

    async fn update_subscription_state(
        &mut self,
        account_id: Uuid,
        state: &SubscriptionState,
    ) -> Result<(), StoreError> {
        self.check(FailPoint::UpdateSubscription)?;
        let account = self
            .working
            .accounts
            .get_mut(&account_id)
            .ok_or(StoreError::NotFound)?;
        account.plan = state.plan;
        account.plan_status = state.plan_status;
        account.billing_provider = state.billing_provider;
        account.external_customer_id = state.external_customer_id.clone();
        account.external_subscription_id = state.external_subscription_id.clone();
        account.current_period_start = state.current_period_start;
        account.current_period_end = state.current_period_end;
        account.cancel_at_period_end = state.cancel_at_period_end;
        account.updated_at = OffsetDateTime::now_utc();
        Ok(())
    }

    async fn find_purchase(
        &mut self,
        provider: BillingProvider,
        external_payment_id: &str,
    ) -> Result<Option<Purchase>, StoreError> {
        Ok(self
            .working
            .purchases
            .iter()
            .find(|p| p.provider == provider && p.external_payment_id == external_payment_id)
            .cloned())
    }

    async fn insert_purchase(&mut self, purchase: NewPurchase) -> Result<Purchase, StoreError> {
        self.check(FailPoint::InsertPurchase)?;
        let duplicate = self.working.purchases.iter().any(|p| {
            p.provider == purchase.provider && p.external_payment_id == purchase.external_payment_id
        });
        if duplicate {
            return Err(StoreError::Conflict(format!(
                "purchase {} already recorded",
                purchase.external_payment_id
            )));
        }
        let row = Purchase {
            id: Uuid::new_v4(),
            account_id: purchase.account_id,
            r#type: purchase.r#type,
            provider: purchase.provider,
            plan: purchase.plan,
            credits_granted: purchase.credits_granted,
            amount_minor_units: purchase.amount_minor_units,
            currency: purchase.currency,
            external_customer_id: purchase.external_customer_id,
            external_payment_id: purchase.external_payment_id,
            external_subscription_id: purchase.external_subscription_id,
            status: purchase.status,
            metadata: purchase.metadata,
            created_at: OffsetDateTime::now_utc(),
        };
        self.working.purchases.push(row.clone());
        Ok(row)
    }

    async fn update_purchase_status(
        &mut self,
        provider: BillingProvider,
        external_payment_id: &str,
        status: PurchaseStatus,
    ) -> Result<u64, StoreError> {
        let mut touched = 0;
        for purchase in self.working.purchases.iter_mut().filter(|p| {
            p.provider == provider && p.external_payment_id == external_payment_id
        }) {
            purchase.status = status;
            touched += 1;
        }
        Ok(touched)
    }

    async fn has_period_grant(
        &mut self,
        account_id: Uuid,
        period_key: &str,
    ) -> Result<bool, StoreError> {
        Ok(self
            .working
            .period_grants
            .contains(&(account_id, period_key.to_string())))
    }

    async fn record_period_grant(
        &mut self,
        account_id: Uuid,
        period_key: &str,
    ) -> Result<(), StoreError> {
        if !self
            .working
            .period_grants
            .insert((account_id, period_key.to_string()))
        {
            return Err(StoreError::Conflict(format!(
                "period {period_key} already granted"
            )));
        }
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.check(FailPoint::Commit)?;
        let MockUnitOfWork {
            mut guard,
            working,
            commits,
            ..
        } = *self;
        *guard = working;
        commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        Ok(())
    }
}
