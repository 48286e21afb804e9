//! Provider-neutral webhook events. Each provider adapter turns its raw payload into one of these;
//! the reconciler only ever matches on this type.

use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::models::account::{BillingProvider, PlanStatus};
use crate::models::purchase::PurchaseStatus;

/// What the payload tells us about whose event this is. Either may be missing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccountHint {
    pub account_id: Option<Uuid>,
    pub customer_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionRef {
    pub account: AccountHint,
    pub subscription_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionSnapshot {
    pub account: AccountHint,
    pub subscription_id: String,
    pub price_id: String,
    pub status: PlanStatus,
    pub current_period_start: Option<OffsetDateTime>,
    pub current_period_end: Option<OffsetDateTime>,
    pub cancel_at_period_end: bool,
    pub amount_minor_units: i64,
    pub currency: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderSnapshot {
    pub account: AccountHint,
    /// Idempotency key for the purchase row.
    pub external_payment_id: String,
    pub pack_id: Option<String>,
    pub price_id: Option<String>,
    pub amount_minor_units: i64,
    pub currency: String,
    /// Set when the payment instrument can be looked up from the provider.
    pub payment_intent_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenewalSnapshot {
    pub account: AccountHint,
    pub subscription_id: String,
    /// Unique per billing period of the subscription.
    pub period_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BillingEvent {
    SubscriptionActivated(SubscriptionSnapshot),
    SubscriptionCanceled(SubscriptionRef),
    CancelScheduled(SubscriptionRef),
    Paused(SubscriptionRef),
    Resumed(SubscriptionRef),
    OrderCompleted(OrderSnapshot),
    RenewalPaid(RenewalSnapshot),
    PaymentFailed(SubscriptionRef),
    PaymentStatusChanged {
        external_payment_id: String,
        status: PurchaseStatus,
    },
    Ignored {
        reason: String,
    },
}

impl BillingEvent {
    pub fn ignored(reason: impl Into<String>) -> Self {
        BillingEvent::Ignored {
            reason: reason.into(),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            BillingEvent::SubscriptionActivated(_) => "subscription_activated",
            BillingEvent::SubscriptionCanceled(_) => "subscription_canceled",
            BillingEvent::CancelScheduled(_) => "cancel_scheduled",
            BillingEvent::Paused(_) => "subscription_paused",
            BillingEvent::Resumed(_) => "subscription_resumed",
            BillingEvent::OrderCompleted(_) => "order_completed",
            BillingEvent::RenewalPaid(_) => "renewal_paid",
            BillingEvent::PaymentFailed(_) => "payment_failed",
            BillingEvent::PaymentStatusChanged { .. } => "payment_status_changed",
            BillingEvent::Ignored { .. } => "ignored",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderEvent {
    pub provider: BillingProvider,
    /// Provider event id, used for logging only; idempotency is keyed on payment ids.
    pub event_id: String,
    pub event_name: String,
    pub kind: BillingEvent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileOutcome {
    Applied,
    /// Replay of an event whose effect is already recorded.
    Duplicate,
    /// Acknowledged without any state change.
    Ignored,
}

impl ReconcileOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReconcileOutcome::Applied => "applied",
            ReconcileOutcome::Duplicate => "duplicate",
            ReconcileOutcome::Ignored => "ignored",
        }
    }
}
