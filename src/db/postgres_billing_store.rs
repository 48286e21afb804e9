use std::str::FromStr;

use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::db::billing_store::{BillingStore, BillingUnitOfWork, StoreError};
use crate::models::{
    account::{Account, BillingProvider, SubscriptionState},
    credit_transaction::{CreditTransaction, CreditTransactionType, NewCreditTransaction},
    purchase::{NewPurchase, Purchase, PurchaseStatus},
    ParseEnumError,
};

const ACCOUNT_COLUMNS: &str = r#"
    id, credit_balance, lifetime_credits, plan, plan_status, billing_provider,
    external_customer_id, external_subscription_id, current_period_start,
    current_period_end, cancel_at_period_end, created_at, updated_at
"#;

const TRANSACTION_COLUMNS: &str = r#"
    id, account_id, type, amount, balance_after, reason, description,
    related_asset_id, related_purchase_id, created_at
"#;

/// Newest first. `seq` is assigned under the account lock, so it follows ledger order even when
/// an earlier-started transaction committed later.
const LIST_TRANSACTIONS_SQL: &str = r#"
    SELECT id, account_id, type, amount, balance_after, reason, description,
           related_asset_id, related_purchase_id, created_at
    FROM credit_transactions
    WHERE account_id = $1
    ORDER BY seq DESC
    LIMIT $2 OFFSET $3
"#;

const INSERT_TRANSACTION_SQL: &str = r#"
    INSERT INTO credit_transactions (
        id, account_id, type, amount, balance_after, reason, description,
        related_asset_id, related_purchase_id, created_at
    )
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, clock_timestamp())
    RETURNING id, account_id, type, amount, balance_after, reason, description,
              related_asset_id, related_purchase_id, created_at
"#;

const PURCHASE_COLUMNS: &str = r#"
    id, account_id, type, provider, plan, credits_granted, amount_minor_units, currency,
    external_customer_id, external_payment_id, external_subscription_id, status, metadata,
    created_at
"#;

pub struct PostgresBillingStore {
    pub pool: PgPool,
}

pub struct PostgresUnitOfWork {
    tx: Transaction<'static, Postgres>,
}

fn parse_column<T>(row: &PgRow, column: &str) -> Result<T, sqlx::Error>
where
    T: FromStr<Err = ParseEnumError>,
{
    let raw: String = row.try_get(column)?;
    raw.parse::<T>().map_err(|err| sqlx::Error::ColumnDecode {
        index: column.to_string(),
        source: Box::new(err),
    })
}

fn parse_optional_column<T>(row: &PgRow, column: &str) -> Result<Option<T>, sqlx::Error>
where
    T: FromStr<Err = ParseEnumError>,
{
    let raw: Option<String> = row.try_get(column)?;
    raw.map(|value| {
        value.parse::<T>().map_err(|err| sqlx::Error::ColumnDecode {
            index: column.to_string(),
            source: Box::new(err),
        })
    })
    .transpose()
}

fn account_from_row(row: &PgRow) -> Result<Account, sqlx::Error> {
    Ok(Account {
        id: row.try_get("id")?,
        credit_balance: row.try_get("credit_balance")?,
        lifetime_credits: row.try_get("lifetime_credits")?,
        plan: parse_column(row, "plan")?,
        plan_status: parse_column(row, "plan_status")?,
        billing_provider: parse_column(row, "billing_provider")?,
        external_customer_id: row.try_get("external_customer_id")?,
        external_subscription_id: row.try_get("external_subscription_id")?,
        current_period_start: row.try_get("current_period_start")?,
        current_period_end: row.try_get("current_period_end")?,
        cancel_at_period_end: row.try_get("cancel_at_period_end")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn transaction_from_row(row: &PgRow) -> Result<CreditTransaction, sqlx::Error> {
    Ok(CreditTransaction {
        id: row.try_get("id")?,
        account_id: row.try_get("account_id")?,
        r#type: parse_column(row, "type")?,
        amount: row.try_get("amount")?,
        balance_after: row.try_get("balance_after")?,
        reason: row.try_get("reason")?,
        description: row.try_get("description")?,
        related_asset_id: row.try_get("related_asset_id")?,
        related_purchase_id: row.try_get("related_purchase_id")?,
        created_at: row.try_get("created_at")?,
    })
}

fn purchase_from_row(row: &PgRow) -> Result<Purchase, sqlx::Error> {
    Ok(Purchase {
        id: row.try_get("id")?,
        account_id: row.try_get("account_id")?,
        r#type: parse_column(row, "type")?,
        provider: parse_column(row, "provider")?,
        plan: parse_optional_column(row, "plan")?,
        credits_granted: row.try_get("credits_granted")?,
        amount_minor_units: row.try_get("amount_minor_units")?,
        currency: row.try_get("currency")?,
        external_customer_id: row.try_get("external_customer_id")?,
        external_payment_id: row.try_get("external_payment_id")?,
        external_subscription_id: row.try_get("external_subscription_id")?,
        status: parse_column(row, "status")?,
        metadata: row.try_get("metadata")?,
        created_at: row.try_get("created_at")?,
    })
}

#[async_trait]
impl BillingStore for PostgresBillingStore {
    async fn begin(&self) -> Result<Box<dyn BillingUnitOfWork>, StoreError> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PostgresUnitOfWork { tx }))
    }

    async fn find_account(&self, account_id: Uuid) -> Result<Option<Account>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = $1"
        ))
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(account_from_row).transpose()?)
    }

    async fn find_purchase(
        &self,
        provider: BillingProvider,
        external_payment_id: &str,
    ) -> Result<Option<Purchase>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {PURCHASE_COLUMNS} FROM purchases WHERE provider = $1 AND external_payment_id = $2"
        ))
        .bind(provider.as_str())
        .bind(external_payment_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(purchase_from_row).transpose()?)
    }

    async fn list_transactions(
        &self,
        account_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<CreditTransaction>, StoreError> {
        let rows = sqlx::query(LIST_TRANSACTIONS_SQL)
            .bind(account_id)
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows
            .iter()
            .map(transaction_from_row)
            .collect::<Result<Vec<_>, _>>()?)
    }

    async fn list_transactions_since(
        &self,
        account_id: Uuid,
        r#type: CreditTransactionType,
        since: OffsetDateTime,
    ) -> Result<Vec<CreditTransaction>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {TRANSACTION_COLUMNS}
            FROM credit_transactions
            WHERE account_id = $1 AND type = $2 AND created_at >= $3
            ORDER BY seq DESC
            "#
        ))
        .bind(account_id)
        .bind(r#type.as_str())
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(transaction_from_row)
            .collect::<Result<Vec<_>, _>>()?)
    }
}

#[async_trait]
impl BillingUnitOfWork for PostgresUnitOfWork {
    async fn insert_account(&mut self, account: &Account) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO accounts (
                id, credit_balance, lifetime_credits, plan, plan_status, billing_provider,
                external_customer_id, external_subscription_id, current_period_start,
                current_period_end, cancel_at_period_end, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(account.id)
        .bind(account.credit_balance)
        .bind(account.lifetime_credits)
        .bind(account.plan.as_str())
        .bind(account.plan_status.as_str())
        .bind(account.billing_provider.as_str())
        .bind(account.external_customer_id.as_deref())
        .bind(account.external_subscription_id.as_deref())
        .bind(account.current_period_start)
        .bind(account.current_period_end)
        .bind(account.cancel_at_period_end)
        .bind(account.created_at)
        .bind(account.updated_at)
        .execute(&mut *self.tx)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn lock_account(&mut self, account_id: Uuid) -> Result<Option<Account>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = $1 FOR UPDATE"
        ))
        .bind(account_id)
        .fetch_optional(&mut *self.tx)
        .await?;

        Ok(row.as_ref().map(account_from_row).transpose()?)
    }

    async fn find_account_id_by_customer(
        &mut self,
        provider: BillingProvider,
        external_customer_id: &str,
    ) -> Result<Option<Uuid>, StoreError> {
        let id = sqlx::query_scalar::<Postgres, Uuid>(
            r#"
            SELECT id
            FROM accounts
            WHERE external_customer_id = $1
              AND billing_provider IN ($2, 'NONE')
            ORDER BY updated_at DESC
            LIMIT 1
            "#,
        )
        .bind(external_customer_id)
        .bind(provider.as_str())
        .fetch_optional(&mut *self.tx)
        .await?;

        Ok(id)
    }

    async fn update_balance(
        &mut self,
        account_id: Uuid,
        credit_balance: i64,
        lifetime_credits: i64,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE accounts
            SET credit_balance = $2, lifetime_credits = $3, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(account_id)
        .bind(credit_balance)
        .bind(lifetime_credits)
        .execute(&mut *self.tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn insert_transaction(
        &mut self,
        entry: NewCreditTransaction,
    ) -> Result<CreditTransaction, StoreError> {
        let row = sqlx::query(INSERT_TRANSACTION_SQL)
            .bind(Uuid::new_v4())
            .bind(entry.account_id)
            .bind(entry.r#type.as_str())
            .bind(entry.amount)
            .bind(entry.balance_after)
            .bind(&entry.reason)
            .bind(&entry.description)
            .bind(entry.related_asset_id.as_deref())
            .bind(entry.related_purchase_id)
            .fetch_one(&mut *self.tx)
            .await?;

        Ok(transaction_from_row(&row)?)
    }

    async fn update_subscription_state(
        &mut self,
        account_id: Uuid,
        state: &SubscriptionState,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE accounts
            SET plan = $2,
                plan_status = $3,
                billing_provider = $4,
                external_customer_id = $5,
                external_subscription_id = $6,
                current_period_start = $7,
                current_period_end = $8,
                cancel_at_period_end = $9,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(account_id)
        .bind(state.plan.as_str())
        .bind(state.plan_status.as_str())
        .bind(state.billing_provider.as_str())
        .bind(state.external_customer_id.as_deref())
        .bind(state.external_subscription_id.as_deref())
        .bind(state.current_period_start)
        .bind(state.current_period_end)
        .bind(state.cancel_at_period_end)
        .execute(&mut *self.tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn find_purchase(
        &mut self,
        provider: BillingProvider,
        external_payment_id: &str,
    ) -> Result<Option<Purchase>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {PURCHASE_COLUMNS} FROM purchases WHERE provider = $1 AND external_payment_id = $2"
        ))
        .bind(provider.as_str())
        .bind(external_payment_id)
        .fetch_optional(&mut *self.tx)
        .await?;

        Ok(row.as_ref().map(purchase_from_row).transpose()?)
    }

    async fn insert_purchase(&mut self, purchase: NewPurchase) -> Result<Purchase, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO purchases (
                id, account_id, type, provider, plan, credits_granted, amount_minor_units,
                currency, external_customer_id, external_payment_id, external_subscription_id,
                status, metadata
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            RETURNING {PURCHASE_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(purchase.account_id)
        .bind(purchase.r#type.as_str())
        .bind(purchase.provider.as_str())
        .bind(purchase.plan.map(|p| p.as_str()))
        .bind(purchase.credits_granted)
        .bind(purchase.amount_minor_units)
        .bind(&purchase.currency)
        .bind(purchase.external_customer_id.as_deref())
        .bind(&purchase.external_payment_id)
        .bind(purchase.external_subscription_id.as_deref())
        .bind(purchase.status.as_str())
        .bind(&purchase.metadata)
        .fetch_one(&mut *self.tx)
        .await?;

        Ok(purchase_from_row(&row)?)
    }

    async fn update_purchase_status(
        &mut self,
        provider: BillingProvider,
        external_payment_id: &str,
        status: PurchaseStatus,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "UPDATE purchases SET status = $3 WHERE provider = $1 AND external_payment_id = $2",
        )
        .bind(provider.as_str())
        .bind(external_payment_id)
        .bind(status.as_str())
        .execute(&mut *self.tx)
        .await?;

        Ok(result.rows_affected())
    }

    async fn has_period_grant(
        &mut self,
        account_id: Uuid,
        period_key: &str,
    ) -> Result<bool, StoreError> {
        let exists = sqlx::query_scalar::<Postgres, i32>(
            "SELECT 1 FROM credit_period_grants WHERE account_id = $1 AND period_key = $2",
        )
        .bind(account_id)
        .bind(period_key)
        .fetch_optional(&mut *self.tx)
        .await?
        .is_some();

        Ok(exists)
    }

    async fn record_period_grant(
        &mut self,
        account_id: Uuid,
        period_key: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO credit_period_grants (account_id, period_key)
            VALUES ($1, $2)
            "#,
        )
        .bind(account_id)
        .bind(period_key)
        .execute(&mut *self.tx)
        .await?;

        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.rollback().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn history_follows_write_order_not_transaction_start() {
        assert!(LIST_TRANSACTIONS_SQL.contains("ORDER BY seq DESC"));
        assert!(!LIST_TRANSACTIONS_SQL.contains("ORDER BY created_at"));
        assert!(INSERT_TRANSACTION_SQL.contains("clock_timestamp()"));
        assert!(!INSERT_TRANSACTION_SQL.contains("NOW()"));
    }
}
