use serde_json::Value;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::warn;

use super::events::{
    AccountHint, BillingEvent, OrderSnapshot, ProviderEvent, RenewalSnapshot, SubscriptionRef,
    SubscriptionSnapshot,
};
use super::{
    extract_bool, extract_i64, extract_id, extract_str, hmac_sha256_hex, jget, parse_account_id,
    parse_payload, signatures_match, BillingError, ProviderAdapter,
};
use crate::config::LemonSqueezySettings;
use crate::models::account::{BillingProvider, PlanStatus};

pub const SIGNATURE_HEADER: &str = "X-Signature";

pub fn map_status(status: &str) -> PlanStatus {
    match status {
        "on_trial" => PlanStatus::Trialing,
        "active" => PlanStatus::Active,
        "paused" => PlanStatus::Paused,
        "past_due" | "unpaid" => PlanStatus::PastDue,
        "cancelled" | "expired" => PlanStatus::Canceled,
        other => {
            warn!(status = other, "unknown lemonsqueezy subscription status, treating as active");
            PlanStatus::Active
        }
    }
}

/// Verifies `X-Signature` (hex HMAC-SHA256 of the raw body) and classifies LemonSqueezy events.
pub struct LemonSqueezyAdapter {
    webhook_secret: String,
}

impl LemonSqueezyAdapter {
    pub fn new(webhook_secret: impl Into<String>) -> Self {
        Self {
            webhook_secret: webhook_secret.into(),
        }
    }

    pub fn from_settings(settings: &LemonSqueezySettings) -> Self {
        Self::new(settings.webhook_secret.clone())
    }
}

impl ProviderAdapter for LemonSqueezyAdapter {
    fn provider(&self) -> BillingProvider {
        BillingProvider::LemonSqueezy
    }

    fn signature_header(&self) -> &'static str {
        SIGNATURE_HEADER
    }

    fn verify(&self, payload: &[u8], signature: &str) -> Result<(), BillingError> {
        if signature.trim().is_empty() {
            return Err(BillingError::InvalidSignature("empty signature".into()));
        }
        let expected = hmac_sha256_hex(self.webhook_secret.as_bytes(), &[payload])?;
        if signatures_match(&expected, &signature.to_ascii_lowercase()) {
            Ok(())
        } else {
            Err(BillingError::InvalidSignature("signature mismatch".into()))
        }
    }

    fn classify(&self, payload: &[u8]) -> Result<ProviderEvent, BillingError> {
        let event = parse_payload(payload)?;
        let event_name = extract_str(&event, &["meta", "event_name"])
            .ok_or_else(|| BillingError::MalformedPayload("missing meta.event_name".into()))?
            .to_string();
        let data_id = extract_id(&event, &["data", "id"])
            .ok_or_else(|| BillingError::MalformedPayload("missing data.id".into()))?;
        let attrs = jget(&event, &["data", "attributes"])
            .ok_or_else(|| BillingError::MalformedPayload("missing data.attributes".into()))?;
        let account = account_hint(&event, attrs);

        let subscription = |account: AccountHint| SubscriptionRef {
            account,
            subscription_id: data_id.clone(),
        };

        let kind = match event_name.as_str() {
            "subscription_created" | "subscription_updated" => {
                let status = extract_str(attrs, &["status"]).ok_or_else(|| {
                    BillingError::MalformedPayload("missing subscription status".into())
                })?;
                match status {
                    // cancelled subscriptions stay usable until the period ends
                    "cancelled" => BillingEvent::CancelScheduled(subscription(account)),
                    "expired" => BillingEvent::SubscriptionCanceled(subscription(account)),
                    "paused" => BillingEvent::Paused(subscription(account)),
                    _ => BillingEvent::SubscriptionActivated(subscription_snapshot(
                        account,
                        &data_id,
                        attrs,
                        status,
                    )?),
                }
            }
            "subscription_cancelled" => BillingEvent::CancelScheduled(subscription(account)),
            "subscription_expired" => BillingEvent::SubscriptionCanceled(subscription(account)),
            "subscription_paused" => BillingEvent::Paused(subscription(account)),
            "subscription_resumed" | "subscription_unpaused" => {
                BillingEvent::Resumed(subscription(account))
            }
            "order_created" => order_created(account, &data_id, attrs)?,
            "subscription_payment_success" => {
                let reason = extract_str(attrs, &["billing_reason"]).unwrap_or_default();
                match extract_id(attrs, &["subscription_id"]) {
                    Some(subscription_id) if reason == "renewal" => {
                        BillingEvent::RenewalPaid(RenewalSnapshot {
                            account,
                            period_key: format!("{subscription_id}:{data_id}"),
                            subscription_id,
                        })
                    }
                    Some(_) => BillingEvent::ignored(format!(
                        "subscription payment for {reason:?}, not a renewal"
                    )),
                    None => BillingEvent::ignored("subscription payment without subscription"),
                }
            }
            "subscription_payment_failed" => match extract_id(attrs, &["subscription_id"]) {
                Some(subscription_id) => BillingEvent::PaymentFailed(SubscriptionRef {
                    account,
                    subscription_id,
                }),
                None => BillingEvent::ignored("failed payment without subscription"),
            },
            other => BillingEvent::ignored(format!("unhandled lemonsqueezy event {other}")),
        };

        Ok(ProviderEvent {
            provider: BillingProvider::LemonSqueezy,
            event_id: format!("{event_name}:{data_id}"),
            event_name,
            kind,
        })
    }
}

fn account_hint(event: &Value, attrs: &Value) -> AccountHint {
    let account_id = parse_account_id(extract_str(event, &["meta", "custom_data", "account_id"]))
        .or_else(|| parse_account_id(extract_str(event, &["meta", "custom_data", "user_id"])));
    AccountHint {
        account_id,
        customer_id: extract_id(attrs, &["customer_id"]),
    }
}

fn rfc3339(attrs: &Value, key: &str) -> Option<OffsetDateTime> {
    extract_str(attrs, &[key]).and_then(|raw| OffsetDateTime::parse(raw, &Rfc3339).ok())
}

fn subscription_snapshot(
    account: AccountHint,
    subscription_id: &str,
    attrs: &Value,
    status: &str,
) -> Result<SubscriptionSnapshot, BillingError> {
    let price_id = extract_id(attrs, &["variant_id"])
        .ok_or_else(|| BillingError::MalformedPayload("missing variant_id".into()))?;
    Ok(SubscriptionSnapshot {
        account,
        subscription_id: subscription_id.to_string(),
        price_id,
        status: map_status(status),
        current_period_start: rfc3339(attrs, "created_at"),
        current_period_end: rfc3339(attrs, "renews_at").or_else(|| rfc3339(attrs, "ends_at")),
        cancel_at_period_end: extract_bool(attrs, &["cancelled"]).unwrap_or(false),
        // subscription payloads carry no price; the amount lands on the order
        amount_minor_units: 0,
        currency: extract_str(attrs, &["currency"])
            .unwrap_or("usd")
            .to_lowercase(),
    })
}

fn order_created(
    account: AccountHint,
    order_id: &str,
    attrs: &Value,
) -> Result<BillingEvent, BillingError> {
    if let Some(status) = extract_str(attrs, &["status"]) {
        if status != "paid" {
            return Ok(BillingEvent::ignored(format!("order not paid ({status})")));
        }
    }
    let variant_id = extract_id(attrs, &["first_order_item", "variant_id"])
        .ok_or_else(|| BillingError::MalformedPayload("order without variant".into()))?;
    Ok(BillingEvent::OrderCompleted(OrderSnapshot {
        account,
        external_payment_id: order_id.to_string(),
        pack_id: None,
        price_id: Some(variant_id),
        amount_minor_units: extract_i64(attrs, &["total"]).unwrap_or(0),
        currency: extract_str(attrs, &["currency"])
            .unwrap_or("usd")
            .to_lowercase(),
        payment_intent_id: None,
    }))
}

#[cfg(test)]
pub(crate) fn signature_for(secret: &str, payload: &[u8]) -> String {
    hmac_sha256_hex(secret.as_bytes(), &[payload]).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const SECRET: &str = "ls_secret";

    #[test]
    fn verifies_hex_hmac_of_body() {
        let adapter = LemonSqueezyAdapter::new(SECRET);
        let body = br#"{"meta":{"event_name":"order_created"}}"#;
        let signature = signature_for(SECRET, body);
        assert!(adapter.verify(body, &signature).is_ok());
        assert!(adapter.verify(body, &signature.to_uppercase()).is_ok());
        assert!(matches!(
            adapter.verify(b"{}", &signature),
            Err(BillingError::InvalidSignature(_))
        ));
        assert!(matches!(
            adapter.verify(body, ""),
            Err(BillingError::InvalidSignature(_))
        ));
    }

    #[test]
    fn cancelled_schedules_and_expired_terminates() {
        let adapter = LemonSqueezyAdapter::new(SECRET);
        let event = |name: &str| {
            json!({
                "meta": { "event_name": name },
                "data": { "id": "991", "attributes": { "customer_id": 77, "status": "cancelled" } }
            })
            .to_string()
        };
        let scheduled = adapter
            .classify(event("subscription_cancelled").as_bytes())
            .unwrap();
        assert!(matches!(scheduled.kind, BillingEvent::CancelScheduled(ref r) if r.subscription_id == "991"));
        assert_eq!(scheduled.event_id, "subscription_cancelled:991");

        let expired = adapter
            .classify(event("subscription_expired").as_bytes())
            .unwrap();
        match expired.kind {
            BillingEvent::SubscriptionCanceled(r) => {
                assert_eq!(r.account.customer_id.as_deref(), Some("77"))
            }
            other => panic!("unexpected classification {other:?}"),
        }
    }

    #[test]
    fn classifies_subscription_created_with_custom_data() {
        let adapter = LemonSqueezyAdapter::new(SECRET);
        let payload = json!({
            "meta": {
                "event_name": "subscription_created",
                "custom_data": { "user_id": "6f1c1c8e-2b7a-4a57-9a9e-8f2d6f0c1a11" }
            },
            "data": { "id": "991", "attributes": {
                "customer_id": 77,
                "variant_id": 4410,
                "status": "on_trial",
                "renews_at": "2026-11-19T00:00:00.000000Z",
                "cancelled": false
            } }
        });
        let event = adapter
            .classify(payload.to_string().as_bytes())
            .unwrap();
        match event.kind {
            BillingEvent::SubscriptionActivated(snapshot) => {
                assert_eq!(snapshot.price_id, "4410");
                assert_eq!(snapshot.status, PlanStatus::Trialing);
                assert!(snapshot.account.account_id.is_some());
                assert!(snapshot.current_period_end.is_some());
            }
            other => panic!("unexpected classification {other:?}"),
        }
    }

    #[test]
    fn renewal_payment_keys_on_invoice() {
        let adapter = LemonSqueezyAdapter::new(SECRET);
        let payload = json!({
            "meta": { "event_name": "subscription_payment_success" },
            "data": { "id": "5501", "attributes": {
                "subscription_id": 991, "customer_id": 77, "billing_reason": "renewal"
            } }
        });
        let event = adapter
            .classify(payload.to_string().as_bytes())
            .unwrap();
        match event.kind {
            BillingEvent::RenewalPaid(renewal) => {
                assert_eq!(renewal.subscription_id, "991");
                assert_eq!(renewal.period_key, "991:5501");
            }
            other => panic!("unexpected classification {other:?}"),
        }
    }

    #[test]
    fn order_created_reads_first_item_variant() {
        let adapter = LemonSqueezyAdapter::new(SECRET);
        let payload = json!({
            "meta": { "event_name": "order_created" },
            "data": { "id": "3001", "attributes": {
                "customer_id": 77, "status": "paid", "total": 500, "currency": "USD",
                "first_order_item": { "variant_id": 5520 }
            } }
        });
        let event = adapter
            .classify(payload.to_string().as_bytes())
            .unwrap();
        match event.kind {
            BillingEvent::OrderCompleted(order) => {
                assert_eq!(order.external_payment_id, "3001");
                assert_eq!(order.price_id.as_deref(), Some("5520"));
                assert_eq!(order.currency, "usd");
            }
            other => panic!("unexpected classification {other:?}"),
        }
    }

    #[test]
    fn status_map_covers_lemonsqueezy_statuses() {
        assert_eq!(map_status("on_trial"), PlanStatus::Trialing);
        assert_eq!(map_status("unpaid"), PlanStatus::PastDue);
        assert_eq!(map_status("expired"), PlanStatus::Canceled);
        assert_eq!(map_status("paused"), PlanStatus::Paused);
    }
}
