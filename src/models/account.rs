use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use super::plan::PlanTier;
use super::ParseEnumError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PlanStatus {
    Active,
    PastDue,
    Canceled,
    Trialing,
    Paused,
}

impl PlanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanStatus::Active => "ACTIVE",
            PlanStatus::PastDue => "PAST_DUE",
            PlanStatus::Canceled => "CANCELED",
            PlanStatus::Trialing => "TRIALING",
            PlanStatus::Paused => "PAUSED",
        }
    }
}

impl FromStr for PlanStatus {
    type Err = ParseEnumError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "ACTIVE" => Ok(PlanStatus::Active),
            "PAST_DUE" => Ok(PlanStatus::PastDue),
            "CANCELED" => Ok(PlanStatus::Canceled),
            "TRIALING" => Ok(PlanStatus::Trialing),
            "PAUSED" => Ok(PlanStatus::Paused),
            _ => Err(ParseEnumError::new("plan status", raw)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BillingProvider {
    None,
    Stripe,
    LemonSqueezy,
}

impl BillingProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingProvider::None => "NONE",
            BillingProvider::Stripe => "STRIPE",
            BillingProvider::LemonSqueezy => "LEMONSQUEEZY",
        }
    }
}

impl FromStr for BillingProvider {
    type Err = ParseEnumError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "NONE" => Ok(BillingProvider::None),
            "STRIPE" => Ok(BillingProvider::Stripe),
            "LEMONSQUEEZY" => Ok(BillingProvider::LemonSqueezy),
            _ => Err(ParseEnumError::new("billing provider", raw)),
        }
    }
}

impl std::fmt::Display for BillingProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-tenant balance and subscription state.
///
/// `credit_balance` and `lifetime_credits` are only ever written by the credit ledger;
/// the subscription fields are only ever written by the billing reconciler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: Uuid,
    pub credit_balance: i64,
    pub lifetime_credits: i64,
    pub plan: PlanTier,
    pub plan_status: PlanStatus,
    pub billing_provider: BillingProvider,
    pub external_customer_id: Option<String>,
    pub external_subscription_id: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub current_period_start: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub current_period_end: Option<OffsetDateTime>,
    pub cancel_at_period_end: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl Account {
    /// A fresh signup: FREE plan, nothing granted yet.
    pub fn new_free(id: Uuid, now: OffsetDateTime) -> Self {
        Self {
            id,
            credit_balance: 0,
            lifetime_credits: 0,
            plan: PlanTier::Free,
            plan_status: PlanStatus::Active,
            billing_provider: BillingProvider::None,
            external_customer_id: None,
            external_subscription_id: None,
            current_period_start: None,
            current_period_end: None,
            cancel_at_period_end: false,
            created_at: now,
            updated_at: now,
        }
    }
}

/// The subscription-state columns of an account, written as one absolute snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionState {
    pub plan: PlanTier,
    pub plan_status: PlanStatus,
    pub billing_provider: BillingProvider,
    pub external_customer_id: Option<String>,
    pub external_subscription_id: Option<String>,
    pub current_period_start: Option<OffsetDateTime>,
    pub current_period_end: Option<OffsetDateTime>,
    pub cancel_at_period_end: bool,
}

impl From<&Account> for SubscriptionState {
    fn from(account: &Account) -> Self {
        Self {
            plan: account.plan,
            plan_status: account.plan_status,
            billing_provider: account.billing_provider,
            external_customer_id: account.external_customer_id.clone(),
            external_subscription_id: account.external_subscription_id.clone(),
            current_period_start: account.current_period_start,
            current_period_end: account.current_period_end,
            cancel_at_period_end: account.cancel_at_period_end,
        }
    }
}
