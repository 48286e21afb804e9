//! Credit ledger: the only writer of account balances and credit transactions.
//!
//! Every mutation locks the account row, writes the new balance and appends exactly one
//! transaction inside a single unit of work, so `credit_balance` always equals the running sum
//! of the account's transaction amounts.

pub mod errors;

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use time::OffsetDateTime;
use tracing::{info, warn};
use uuid::Uuid;

use crate::catalog::PlanCatalog;
use crate::db::billing_store::{BillingStore, BillingUnitOfWork};
use crate::models::account::Account;
use crate::models::credit_transaction::{
    CreditTransaction, CreditTransactionType, NewCreditTransaction,
};

pub use errors::LedgerError;

pub const DEFAULT_HISTORY_LIMIT: i64 = 50;
const MAX_HISTORY_LIMIT: i64 = 500;

pub const MONTHLY_RESET_REASON: &str = "monthly_reset";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonthlyResetOutcome {
    /// The (possibly zero, when already at the rollover cap) top-up that was written.
    Granted(CreditTransaction),
    /// The period key was already used for this account.
    AlreadyApplied,
    /// FREE accounts are never reset.
    NotEligible,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UsageStats {
    pub total_used: i64,
    pub by_reason: BTreeMap<String, i64>,
    pub transactions: usize,
}

struct Entry<'a> {
    r#type: CreditTransactionType,
    amount: i64,
    reason: &'a str,
    description: String,
    related_asset_id: Option<&'a str>,
    related_purchase_id: Option<Uuid>,
}

#[derive(Clone)]
pub struct CreditLedger {
    store: Arc<dyn BillingStore>,
    catalog: Arc<PlanCatalog>,
}

impl CreditLedger {
    pub fn new(store: Arc<dyn BillingStore>, catalog: Arc<PlanCatalog>) -> Self {
        Self { store, catalog }
    }

    pub fn catalog(&self) -> &PlanCatalog {
        &self.catalog
    }

    /// Signup: creates a FREE account with a zero balance. Opening an existing account returns it
    /// unchanged.
    pub async fn open_account(&self, account_id: Uuid) -> Result<Account, LedgerError> {
        let mut uow = self.store.begin().await?;
        let created = uow
            .insert_account(&Account::new_free(account_id, OffsetDateTime::now_utc()))
            .await?;
        let account = lock_account(uow.as_mut(), account_id).await?;
        uow.commit().await?;
        if created {
            info!(%account_id, "opened credit account");
        }
        Ok(account)
    }

    pub async fn get_balance(&self, account_id: Uuid) -> Result<i64, LedgerError> {
        self.store
            .find_account(account_id)
            .await?
            .map(|a| a.credit_balance)
            .ok_or(LedgerError::AccountNotFound(account_id))
    }

    pub async fn has_sufficient_credits(
        &self,
        account_id: Uuid,
        amount: i64,
    ) -> Result<bool, LedgerError> {
        ensure_positive(amount)?;
        Ok(self.get_balance(account_id).await? >= amount)
    }

    /// Spends `amount` credits and returns the new balance. The balance check happens under the
    /// account lock, so concurrent deductions can never overdraw.
    pub async fn deduct(
        &self,
        account_id: Uuid,
        amount: i64,
        reason: &str,
        description: Option<&str>,
        related_asset_id: Option<&str>,
    ) -> Result<i64, LedgerError> {
        ensure_positive(amount)?;
        let mut uow = self.store.begin().await?;
        let account = lock_account(uow.as_mut(), account_id).await?;
        if account.credit_balance < amount {
            info!(
                %account_id,
                balance = account.credit_balance,
                requested = amount,
                reason,
                "deduction declined: insufficient credits"
            );
            return Err(LedgerError::InsufficientCredits {
                balance: account.credit_balance,
                requested: amount,
            });
        }
        let entry = Entry {
            r#type: CreditTransactionType::Deduction,
            amount: -amount,
            reason,
            description: description
                .map(str::to_string)
                .unwrap_or_else(|| format!("Used {amount} credits for {reason}")),
            related_asset_id,
            related_purchase_id: None,
        };
        let row = write_entry(uow.as_mut(), &account, entry).await?;
        uow.commit().await?;
        info!(%account_id, amount, reason, balance = row.balance_after, "credits deducted");
        Ok(row.balance_after)
    }

    /// Returns previously spent credits. Lifetime credits are left alone.
    pub async fn refund(
        &self,
        account_id: Uuid,
        amount: i64,
        reason: &str,
        related_asset_id: Option<&str>,
    ) -> Result<CreditTransaction, LedgerError> {
        ensure_positive(amount)?;
        let mut uow = self.store.begin().await?;
        let account = lock_account(uow.as_mut(), account_id).await?;
        let entry = Entry {
            r#type: CreditTransactionType::Refund,
            amount,
            reason,
            description: format!("Refunded {amount} credits: {reason}"),
            related_asset_id,
            related_purchase_id: None,
        };
        let row = write_entry(uow.as_mut(), &account, entry).await?;
        uow.commit().await?;
        info!(%account_id, amount, reason, balance = row.balance_after, "credits refunded");
        Ok(row)
    }

    /// Grants new credits. `r#type` must be one of PURCHASE, SUBSCRIPTION or BONUS.
    pub async fn add(
        &self,
        account_id: Uuid,
        amount: i64,
        r#type: CreditTransactionType,
        reason: &str,
        description: Option<&str>,
        related_purchase_id: Option<Uuid>,
    ) -> Result<CreditTransaction, LedgerError> {
        let mut uow = self.store.begin().await?;
        let row = self
            .add_within(
                uow.as_mut(),
                account_id,
                amount,
                r#type,
                reason,
                description,
                related_purchase_id,
            )
            .await?;
        uow.commit().await?;
        Ok(row)
    }

    /// Tops the account up by its plan allotment, capped at the plan's rollover limit.
    /// At most one top-up is applied per `(account_id, period_key)`.
    pub async fn monthly_reset(
        &self,
        account_id: Uuid,
        period_key: &str,
    ) -> Result<MonthlyResetOutcome, LedgerError> {
        let mut uow = self.store.begin().await?;
        let outcome = self
            .monthly_reset_within(uow.as_mut(), account_id, period_key)
            .await?;
        if matches!(outcome, MonthlyResetOutcome::Granted(_)) {
            uow.commit().await?;
        } else {
            uow.rollback().await?;
        }
        Ok(outcome)
    }

    /// Newest first.
    pub async fn history(
        &self,
        account_id: Uuid,
        limit: Option<i64>,
        offset: i64,
    ) -> Result<Vec<CreditTransaction>, LedgerError> {
        let limit = limit
            .unwrap_or(DEFAULT_HISTORY_LIMIT)
            .clamp(1, MAX_HISTORY_LIMIT);
        Ok(self
            .store
            .list_transactions(account_id, limit, offset.max(0))
            .await?)
    }

    /// Credits spent since `since`, in total and per reason code.
    pub async fn usage_stats(
        &self,
        account_id: Uuid,
        since: OffsetDateTime,
    ) -> Result<UsageStats, LedgerError> {
        let rows = self
            .store
            .list_transactions_since(account_id, CreditTransactionType::Deduction, since)
            .await?;
        let mut stats = UsageStats {
            transactions: rows.len(),
            ..UsageStats::default()
        };
        for row in rows {
            let spent = row.amount.abs();
            stats.total_used += spent;
            *stats.by_reason.entry(row.reason).or_insert(0) += spent;
        }
        Ok(stats)
    }

    /// `add` against a unit of work owned by the caller. Nothing is committed here.
    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn add_within(
        &self,
        uow: &mut dyn BillingUnitOfWork,
        account_id: Uuid,
        amount: i64,
        r#type: CreditTransactionType,
        reason: &str,
        description: Option<&str>,
        related_purchase_id: Option<Uuid>,
    ) -> Result<CreditTransaction, LedgerError> {
        ensure_positive(amount)?;
        if !r#type.is_grant() {
            return Err(LedgerError::InvalidGrantType(r#type));
        }
        let account = lock_account(uow, account_id).await?;
        let entry = Entry {
            r#type,
            amount,
            reason,
            description: description
                .map(str::to_string)
                .unwrap_or_else(|| format!("Added {amount} credits")),
            related_asset_id: None,
            related_purchase_id,
        };
        let row = write_entry(uow, &account, entry).await?;
        info!(
            %account_id,
            amount,
            kind = r#type.as_str(),
            reason,
            balance = row.balance_after,
            "credits granted"
        );
        Ok(row)
    }

    /// `monthly_reset` against a unit of work owned by the caller. Nothing is committed here.
    pub(crate) async fn monthly_reset_within(
        &self,
        uow: &mut dyn BillingUnitOfWork,
        account_id: Uuid,
        period_key: &str,
    ) -> Result<MonthlyResetOutcome, LedgerError> {
        let account = lock_account(uow, account_id).await?;
        if !account.plan.is_paid() {
            info!(%account_id, period_key, "monthly reset skipped for free plan");
            return Ok(MonthlyResetOutcome::NotEligible);
        }
        let entry = self.catalog.entry(account.plan).ok_or_else(|| {
            LedgerError::Unavailable(format!("no catalog entry for {} plan", account.plan))
        })?;
        if uow.has_period_grant(account_id, period_key).await? {
            info!(%account_id, period_key, "monthly reset already applied for period");
            return Ok(MonthlyResetOutcome::AlreadyApplied);
        }

        let target = account
            .credit_balance
            .saturating_add(entry.monthly_credits)
            .min(entry.rollover_cap());
        // never claw back credits bought above the cap
        let delta = (target - account.credit_balance).max(0);
        if delta < entry.monthly_credits {
            warn!(
                %account_id,
                balance = account.credit_balance,
                cap = entry.rollover_cap(),
                granted = delta,
                "monthly allotment capped by rollover limit"
            );
        }

        uow.record_period_grant(account_id, period_key).await?;
        let row = write_entry(
            uow,
            &account,
            Entry {
                r#type: CreditTransactionType::Subscription,
                amount: delta,
                reason: MONTHLY_RESET_REASON,
                description: format!("Monthly {} plan credits ({delta} credits)", account.plan),
                related_asset_id: None,
                related_purchase_id: None,
            },
        )
        .await?;
        info!(%account_id, period_key, granted = delta, balance = row.balance_after, "monthly reset applied");
        Ok(MonthlyResetOutcome::Granted(row))
    }
}

fn ensure_positive(amount: i64) -> Result<(), LedgerError> {
    if amount <= 0 {
        return Err(LedgerError::InvalidAmount(amount));
    }
    Ok(())
}

async fn lock_account(
    uow: &mut dyn BillingUnitOfWork,
    account_id: Uuid,
) -> Result<Account, LedgerError> {
    uow.lock_account(account_id)
        .await?
        .ok_or(LedgerError::AccountNotFound(account_id))
}

async fn write_entry(
    uow: &mut dyn BillingUnitOfWork,
    account: &Account,
    entry: Entry<'_>,
) -> Result<CreditTransaction, LedgerError> {
    let balance_after = account
        .credit_balance
        .checked_add(entry.amount)
        .ok_or(LedgerError::InvalidAmount(entry.amount))?;
    if balance_after < 0 {
        return Err(LedgerError::InsufficientCredits {
            balance: account.credit_balance,
            requested: entry.amount.abs(),
        });
    }
    let lifetime_credits = if entry.r#type.is_grant() {
        account.lifetime_credits + entry.amount
    } else {
        account.lifetime_credits
    };

    uow.update_balance(account.id, balance_after, lifetime_credits)
        .await?;
    let row = uow
        .insert_transaction(NewCreditTransaction {
            account_id: account.id,
            r#type: entry.r#type,
            amount: entry.amount,
            balance_after,
            reason: entry.reason.to_string(),
            description: entry.description,
            related_asset_id: entry.related_asset_id.map(str::to_string),
            related_purchase_id: entry.related_purchase_id,
        })
        .await?;
    Ok(row)
}
