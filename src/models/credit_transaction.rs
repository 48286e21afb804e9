use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use super::ParseEnumError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CreditTransactionType {
    Deduction,
    Refund,
    Purchase,
    Subscription,
    Bonus,
}

impl CreditTransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CreditTransactionType::Deduction => "DEDUCTION",
            CreditTransactionType::Refund => "REFUND",
            CreditTransactionType::Purchase => "PURCHASE",
            CreditTransactionType::Subscription => "SUBSCRIPTION",
            CreditTransactionType::Bonus => "BONUS",
        }
    }

    /// Grant types raise `lifetime_credits`; refunds return value that was already granted.
    pub fn is_grant(self) -> bool {
        matches!(
            self,
            CreditTransactionType::Purchase
                | CreditTransactionType::Subscription
                | CreditTransactionType::Bonus
        )
    }

    /// Sign used when presenting an amount; storage always keeps the signed value.
    pub fn display_sign(self) -> &'static str {
        match self {
            CreditTransactionType::Deduction => "-",
            _ => "+",
        }
    }
}

impl FromStr for CreditTransactionType {
    type Err = ParseEnumError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "DEDUCTION" => Ok(CreditTransactionType::Deduction),
            "REFUND" => Ok(CreditTransactionType::Refund),
            "PURCHASE" => Ok(CreditTransactionType::Purchase),
            "SUBSCRIPTION" => Ok(CreditTransactionType::Subscription),
            "BONUS" => Ok(CreditTransactionType::Bonus),
            _ => Err(ParseEnumError::new("credit transaction type", raw)),
        }
    }
}

/// Immutable ledger entry. `amount` is signed: negative for deductions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditTransaction {
    pub id: Uuid,
    pub account_id: Uuid,
    pub r#type: CreditTransactionType,
    pub amount: i64,
    pub balance_after: i64,
    pub reason: String,
    pub description: String,
    pub related_asset_id: Option<String>,
    pub related_purchase_id: Option<Uuid>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl CreditTransaction {
    pub fn display_amount(&self) -> String {
        format!("{}{}", self.r#type.display_sign(), self.amount.unsigned_abs())
    }
}

#[derive(Debug, Clone)]
pub struct NewCreditTransaction {
    pub account_id: Uuid,
    pub r#type: CreditTransactionType,
    pub amount: i64,
    pub balance_after: i64,
    pub reason: String,
    pub description: String,
    pub related_asset_id: Option<String>,
    pub related_purchase_id: Option<Uuid>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refunds_are_not_grants() {
        assert!(CreditTransactionType::Purchase.is_grant());
        assert!(CreditTransactionType::Subscription.is_grant());
        assert!(CreditTransactionType::Bonus.is_grant());
        assert!(!CreditTransactionType::Refund.is_grant());
        assert!(!CreditTransactionType::Deduction.is_grant());
    }

    #[test]
    fn display_amount_uses_type_for_sign() {
        let tx = CreditTransaction {
            id: Uuid::new_v4(),
            account_id: Uuid::new_v4(),
            r#type: CreditTransactionType::Deduction,
            amount: -5,
            balance_after: 10,
            reason: "logo_generation".into(),
            description: String::new(),
            related_asset_id: None,
            related_purchase_id: None,
            created_at: OffsetDateTime::now_utc(),
        };
        assert_eq!(tx.display_amount(), "-5");
    }
}
