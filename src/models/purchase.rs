use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use uuid::Uuid;

use super::account::BillingProvider;
use super::plan::PlanTier;
use super::ParseEnumError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PurchaseType {
    Subscription,
    CreditPack,
}

impl PurchaseType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PurchaseType::Subscription => "SUBSCRIPTION",
            PurchaseType::CreditPack => "CREDIT_PACK",
        }
    }
}

impl FromStr for PurchaseType {
    type Err = ParseEnumError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "SUBSCRIPTION" => Ok(PurchaseType::Subscription),
            "CREDIT_PACK" => Ok(PurchaseType::CreditPack),
            _ => Err(ParseEnumError::new("purchase type", raw)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PurchaseStatus {
    Completed,
    Failed,
}

impl PurchaseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PurchaseStatus::Completed => "COMPLETED",
            PurchaseStatus::Failed => "FAILED",
        }
    }
}

impl FromStr for PurchaseStatus {
    type Err = ParseEnumError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "COMPLETED" => Ok(PurchaseStatus::Completed),
            "FAILED" => Ok(PurchaseStatus::Failed),
            _ => Err(ParseEnumError::new("purchase status", raw)),
        }
    }
}

/// A completed monetary transaction with a provider.
/// `(provider, external_payment_id)` is unique and doubles as the webhook idempotency key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Purchase {
    pub id: Uuid,
    pub account_id: Uuid,
    pub r#type: PurchaseType,
    pub provider: BillingProvider,
    pub plan: Option<PlanTier>,
    pub credits_granted: Option<i64>,
    pub amount_minor_units: i64,
    pub currency: String,
    pub external_customer_id: Option<String>,
    pub external_payment_id: String,
    pub external_subscription_id: Option<String>,
    pub status: PurchaseStatus,
    pub metadata: Value,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone)]
pub struct NewPurchase {
    pub account_id: Uuid,
    pub r#type: PurchaseType,
    pub provider: BillingProvider,
    pub plan: Option<PlanTier>,
    pub credits_granted: Option<i64>,
    pub amount_minor_units: i64,
    pub currency: String,
    pub external_customer_id: Option<String>,
    pub external_payment_id: String,
    pub external_subscription_id: Option<String>,
    pub status: PurchaseStatus,
    pub metadata: Value,
}
