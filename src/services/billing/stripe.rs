use serde_json::Value;
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
use crate::config::StripeSettings;
use crate::models::account::{BillingProvider, PlanStatus};
use crate::models::purchase::PurchaseStatus;

pub const SIGNATURE_HEADER: &str = "Stripe-Signature";

/// Metadata marker set on credit-pack checkout sessions.
const CREDIT_PACK_METADATA_TYPE: &str = "credit_pack";

pub fn map_status(status: &str) -> PlanStatus {
    match status {
        "active" => PlanStatus::Active,
        "trialing" => PlanStatus::Trialing,
        "past_due" | "incomplete" | "unpaid" => PlanStatus::PastDue,
        "canceled" | "incomplete_expired" => PlanStatus::Canceled,
        "paused" => PlanStatus::Paused,
        other => {
            warn!(status = other, "unknown stripe subscription status, treating as active");
            PlanStatus::Active
        }
    }
}

/// Verifies `Stripe-Signature` (`t=<unix>,v1=<hex hmac>`) and classifies Stripe events.
pub struct StripeWebhookAdapter {
    webhook_secret: String,
    tolerance_seconds: i64,
}

impl StripeWebhookAdapter {
    pub fn new(webhook_secret: impl Into<String>, tolerance_seconds: i64) -> Self {
        Self {
            webhook_secret: webhook_secret.into(),
            tolerance_seconds,
        }
    }

    pub fn from_settings(settings: &StripeSettings) -> Self {
        Self::new(
            settings.webhook_secret.clone(),
            settings.webhook_tolerance_seconds,
        )
    }

    pub(crate) fn verify_at(
        &self,
        payload: &[u8],
        header: &str,
        now: i64,
    ) -> Result<(), BillingError> {
        let mut timestamp: Option<&str> = None;
        let mut candidates: Vec<&str> = Vec::new();
        for part in header.split(',') {
            match part.trim().split_once('=') {
                Some(("t", value)) => timestamp = Some(value),
                Some(("v1", value)) => candidates.push(value),
                _ => {}
            }
        }
        let timestamp = timestamp
            .ok_or_else(|| BillingError::InvalidSignature("missing timestamp".into()))?;
        if candidates.is_empty() {
            return Err(BillingError::InvalidSignature("missing v1 signature".into()));
        }
        let ts = timestamp
            .parse::<i64>()
            .map_err(|_| BillingError::InvalidSignature("invalid timestamp".into()))?;
        let within_tolerance = now
            .checked_sub(ts)
            .map(i64::unsigned_abs)
            .is_some_and(|age| age <= self.tolerance_seconds.unsigned_abs());
        if !within_tolerance {
            return Err(BillingError::InvalidSignature(
                "timestamp outside tolerance".into(),
            ));
        }

        let expected = hmac_sha256_hex(
            self.webhook_secret.as_bytes(),
            &[timestamp.as_bytes(), b".", payload],
        )?;
        if candidates.iter().any(|c| signatures_match(&expected, c)) {
            Ok(())
        } else {
            Err(BillingError::InvalidSignature("signature mismatch".into()))
        }
    }
}

impl ProviderAdapter for StripeWebhookAdapter {
    fn provider(&self) -> BillingProvider {
        BillingProvider::Stripe
    }

    fn signature_header(&self) -> &'static str {
        SIGNATURE_HEADER
    }

    fn verify(&self, payload: &[u8], signature: &str) -> Result<(), BillingError> {
        self.verify_at(payload, signature, OffsetDateTime::now_utc().unix_timestamp())
    }

    fn classify(&self, payload: &[u8]) -> Result<ProviderEvent, BillingError> {
        let event = parse_payload(payload)?;
        let event_id = extract_str(&event, &["id"])
            .ok_or_else(|| BillingError::MalformedPayload("missing event id".into()))?
            .to_string();
        let event_name = extract_str(&event, &["type"])
            .ok_or_else(|| BillingError::MalformedPayload("missing event type".into()))?
            .to_string();
        let obj = jget(&event, &["data", "object"])
            .ok_or_else(|| BillingError::MalformedPayload("missing data.object".into()))?;

        let kind = match event_name.as_str() {
            "customer.subscription.created" | "customer.subscription.updated" => {
                let snapshot = subscription_snapshot(obj)?;
                match snapshot.status {
                    PlanStatus::Canceled => BillingEvent::SubscriptionCanceled(SubscriptionRef {
                        account: snapshot.account,
                        subscription_id: snapshot.subscription_id,
                    }),
                    PlanStatus::Paused => BillingEvent::Paused(SubscriptionRef {
                        account: snapshot.account,
                        subscription_id: snapshot.subscription_id,
                    }),
                    _ => BillingEvent::SubscriptionActivated(snapshot),
                }
            }
            "customer.subscription.deleted" => {
                BillingEvent::SubscriptionCanceled(subscription_ref(obj, &["id"])?)
            }
            "customer.subscription.paused" => BillingEvent::Paused(subscription_ref(obj, &["id"])?),
            "customer.subscription.resumed" => {
                BillingEvent::Resumed(subscription_ref(obj, &["id"])?)
            }
            "checkout.session.completed" => checkout_completed(obj)?,
            "payment_intent.succeeded" => payment_status(obj, PurchaseStatus::Completed)?,
            "payment_intent.payment_failed" => payment_status(obj, PurchaseStatus::Failed)?,
            "invoice.paid" => invoice_paid(obj)?,
            "invoice.payment_failed" => match invoice_subscription_id(obj) {
                Some(subscription_id) => BillingEvent::PaymentFailed(SubscriptionRef {
                    account: account_hint(obj),
                    subscription_id,
                }),
                None => BillingEvent::ignored("failed invoice without subscription"),
            },
            other => BillingEvent::ignored(format!("unhandled stripe event {other}")),
        };

        Ok(ProviderEvent {
            provider: BillingProvider::Stripe,
            event_id,
            event_name,
            kind,
        })
    }
}

fn account_hint(obj: &Value) -> AccountHint {
    let account_id = parse_account_id(extract_str(obj, &["metadata", "account_id"]))
        .or_else(|| parse_account_id(extract_str(obj, &["metadata", "user_id"])))
        .or_else(|| parse_account_id(extract_str(obj, &["client_reference_id"])))
        .or_else(|| {
            parse_account_id(extract_str(
                obj,
                &["subscription_details", "metadata", "account_id"],
            ))
        });
    AccountHint {
        account_id,
        customer_id: extract_id(obj, &["customer"]),
    }
}

fn unix_time(obj: &Value, path: &[&str]) -> Option<OffsetDateTime> {
    extract_i64(obj, path).and_then(|ts| OffsetDateTime::from_unix_timestamp(ts).ok())
}

fn required_id(obj: &Value, path: &[&str], what: &str) -> Result<String, BillingError> {
    extract_id(obj, path).ok_or_else(|| BillingError::MalformedPayload(format!("missing {what}")))
}

fn subscription_ref(obj: &Value, id_path: &[&str]) -> Result<SubscriptionRef, BillingError> {
    Ok(SubscriptionRef {
        account: account_hint(obj),
        subscription_id: required_id(obj, id_path, "subscription id")?,
    })
}

fn subscription_snapshot(obj: &Value) -> Result<SubscriptionSnapshot, BillingError> {
    let item = jget(obj, &["items", "data"])
        .and_then(|items| items.as_array())
        .and_then(|items| items.first())
        .ok_or_else(|| BillingError::MalformedPayload("subscription without items".into()))?;
    let price_id = required_id(item, &["price", "id"], "price id")?;
    let status = extract_str(obj, &["status"])
        .ok_or_else(|| BillingError::MalformedPayload("missing subscription status".into()))?;

    // newer API versions moved the period bounds onto the subscription item
    let current_period_start =
        unix_time(obj, &["current_period_start"]).or_else(|| unix_time(item, &["current_period_start"]));
    let current_period_end =
        unix_time(obj, &["current_period_end"]).or_else(|| unix_time(item, &["current_period_end"]));

    Ok(SubscriptionSnapshot {
        account: account_hint(obj),
        subscription_id: required_id(obj, &["id"], "subscription id")?,
        price_id,
        status: map_status(status),
        current_period_start,
        current_period_end,
        cancel_at_period_end: extract_bool(obj, &["cancel_at_period_end"]).unwrap_or(false),
        amount_minor_units: extract_i64(item, &["price", "unit_amount"]).unwrap_or(0),
        currency: extract_str(obj, &["currency"])
            .or_else(|| extract_str(item, &["price", "currency"]))
            .unwrap_or("usd")
            .to_lowercase(),
    })
}

fn checkout_completed(obj: &Value) -> Result<BillingEvent, BillingError> {
    if extract_str(obj, &["metadata", "type"]) != Some(CREDIT_PACK_METADATA_TYPE) {
        return Ok(BillingEvent::ignored(
            "subscription checkouts are reconciled from subscription events",
        ));
    }
    if let Some(status) = extract_str(obj, &["payment_status"]) {
        if status != "paid" {
            return Ok(BillingEvent::ignored(format!(
                "credit pack checkout not paid ({status})"
            )));
        }
    }
    let payment_intent_id = extract_id(obj, &["payment_intent"]);
    let external_payment_id = match payment_intent_id.clone() {
        Some(id) => id,
        None => required_id(obj, &["id"], "checkout session id")?,
    };
    Ok(BillingEvent::OrderCompleted(OrderSnapshot {
        account: account_hint(obj),
        external_payment_id,
        pack_id: extract_str(obj, &["metadata", "packId"])
            .or_else(|| extract_str(obj, &["metadata", "pack_id"]))
            .map(str::to_string),
        price_id: extract_str(obj, &["metadata", "price_id"]).map(str::to_string),
        amount_minor_units: extract_i64(obj, &["amount_total"]).unwrap_or(0),
        currency: extract_str(obj, &["currency"])
            .unwrap_or("usd")
            .to_lowercase(),
        payment_intent_id,
    }))
}

fn payment_status(obj: &Value, status: PurchaseStatus) -> Result<BillingEvent, BillingError> {
    Ok(BillingEvent::PaymentStatusChanged {
        external_payment_id: required_id(obj, &["id"], "payment intent id")?,
        status,
    })
}

fn invoice_subscription_id(obj: &Value) -> Option<String> {
    extract_id(obj, &["subscription"])
        .or_else(|| extract_id(obj, &["parent", "subscription_details", "subscription"]))
}

fn invoice_paid(obj: &Value) -> Result<BillingEvent, BillingError> {
    let billing_reason = extract_str(obj, &["billing_reason"]).unwrap_or_default();
    if billing_reason != "subscription_cycle" {
        return Ok(BillingEvent::ignored(format!(
            "invoice paid for {billing_reason:?}, not a renewal"
        )));
    }
    let Some(subscription_id) = invoice_subscription_id(obj) else {
        return Ok(BillingEvent::ignored("renewal invoice without subscription"));
    };
    let period_start = jget(obj, &["lines", "data"])
        .and_then(|lines| lines.as_array())
        .and_then(|lines| lines.first())
        .and_then(|line| extract_i64(line, &["period", "start"]))
        .or_else(|| extract_i64(obj, &["period_start"]))
        .ok_or_else(|| BillingError::MalformedPayload("renewal invoice without period".into()))?;

    Ok(BillingEvent::RenewalPaid(RenewalSnapshot {
        account: account_hint(obj),
        period_key: format!("{subscription_id}:{period_start}"),
        subscription_id,
    }))
}

#[cfg(test)]
pub(crate) fn signature_header(secret: &str, timestamp: i64, payload: &[u8]) -> String {
    let ts = timestamp.to_string();
    let sig = hmac_sha256_hex(secret.as_bytes(), &[ts.as_bytes(), b".", payload])
        .unwrap_or_default();
    format!("t={ts},v1={sig}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const SECRET: &str = "whsec_test";

    fn adapter() -> StripeWebhookAdapter {
        StripeWebhookAdapter::new(SECRET, 300)
    }

    #[test]
    fn accepts_valid_signature_within_tolerance() {
        let body = br#"{"id":"evt_1"}"#;
        let header = signature_header(SECRET, 1_700_000_000, body);
        assert!(adapter().verify_at(body, &header, 1_700_000_100).is_ok());
    }

    #[test]
    fn rejects_tampered_body_and_stale_timestamp() {
        let body = br#"{"id":"evt_1"}"#;
        let header = signature_header(SECRET, 1_700_000_000, body);
        assert!(matches!(
            adapter().verify_at(br#"{"id":"evt_2"}"#, &header, 1_700_000_000),
            Err(BillingError::InvalidSignature(_))
        ));
        assert!(matches!(
            adapter().verify_at(body, &header, 1_700_001_000),
            Err(BillingError::InvalidSignature(_))
        ));
        assert!(matches!(
            adapter().verify_at(body, "garbage", 1_700_000_000),
            Err(BillingError::InvalidSignature(_))
        ));
        // extreme timestamps must not overflow the age computation
        for t in [i64::MIN, i64::MAX] {
            assert!(matches!(
                adapter().verify_at(body, &format!("t={t},v1=00"), 1_700_000_000),
                Err(BillingError::InvalidSignature(_))
            ));
        }
        assert!(matches!(
            adapter().verify_at(body, "t=1700000000,v1=00", i64::MIN),
            Err(BillingError::InvalidSignature(_))
        ));
    }

    #[test]
    fn status_map_covers_stripe_statuses() {
        assert_eq!(map_status("trialing"), PlanStatus::Trialing);
        assert_eq!(map_status("incomplete"), PlanStatus::PastDue);
        assert_eq!(map_status("unpaid"), PlanStatus::PastDue);
        assert_eq!(map_status("incomplete_expired"), PlanStatus::Canceled);
        assert_eq!(map_status("something_new"), PlanStatus::Active);
    }

    #[test]
    fn classifies_subscription_update() {
        let payload = json!({
            "id": "evt_1",
            "type": "customer.subscription.updated",
            "data": { "object": {
                "id": "sub_1",
                "customer": "cus_1",
                "status": "active",
                "cancel_at_period_end": true,
                "current_period_start": 1_700_000_000,
                "current_period_end": 1_702_592_000,
                "metadata": { "account_id": "6f1c1c8e-2b7a-4a57-9a9e-8f2d6f0c1a11" },
                "items": { "data": [ { "price": { "id": "price_pro_m", "unit_amount": 1900, "currency": "usd" } } ] }
            } }
        });
        let event = adapter()
            .classify(payload.to_string().as_bytes())
            .unwrap();
        let BillingEvent::SubscriptionActivated(snapshot) = event.kind else {
            panic!("unexpected classification");
        };
        assert_eq!(snapshot.subscription_id, "sub_1");
        assert_eq!(snapshot.price_id, "price_pro_m");
        assert_eq!(snapshot.status, PlanStatus::Active);
        assert!(snapshot.cancel_at_period_end);
        assert_eq!(snapshot.amount_minor_units, 1900);
        assert_eq!(snapshot.account.customer_id.as_deref(), Some("cus_1"));
        assert!(snapshot.account.account_id.is_some());
        assert_eq!(
            snapshot.current_period_end.map(|t| t.unix_timestamp()),
            Some(1_702_592_000)
        );
    }

    #[test]
    fn renewal_invoice_keys_on_subscription_period() {
        let payload = json!({
            "id": "evt_2",
            "type": "invoice.paid",
            "data": { "object": {
                "id": "in_1",
                "customer": "cus_1",
                "subscription": "sub_1",
                "billing_reason": "subscription_cycle",
                "lines": { "data": [ { "period": { "start": 1_702_592_000, "end": 1_705_270_400 } } ] }
            } }
        });
        let event = adapter()
            .classify(payload.to_string().as_bytes())
            .unwrap();
        match event.kind {
            BillingEvent::RenewalPaid(renewal) => {
                assert_eq!(renewal.period_key, "sub_1:1702592000")
            }
            other => panic!("unexpected classification {other:?}"),
        }
    }

    #[test]
    fn initial_invoice_is_not_a_renewal() {
        let payload = json!({
            "id": "evt_3",
            "type": "invoice.paid",
            "data": { "object": { "id": "in_0", "subscription": "sub_1", "billing_reason": "subscription_create" } }
        });
        let event = adapter()
            .classify(payload.to_string().as_bytes())
            .unwrap();
        assert!(matches!(event.kind, BillingEvent::Ignored { .. }));
    }

    #[test]
    fn credit_pack_checkout_keys_on_payment_intent() {
        let payload = json!({
            "id": "evt_4",
            "type": "checkout.session.completed",
            "data": { "object": {
                "id": "cs_1",
                "mode": "payment",
                "payment_status": "paid",
                "payment_intent": "pi_1",
                "amount_total": 500,
                "currency": "USD",
                "client_reference_id": "6f1c1c8e-2b7a-4a57-9a9e-8f2d6f0c1a11",
                "metadata": { "type": "credit_pack", "packId": "basic" }
            } }
        });
        let event = adapter()
            .classify(payload.to_string().as_bytes())
            .unwrap();
        match event.kind {
            BillingEvent::OrderCompleted(order) => {
                assert_eq!(order.external_payment_id, "pi_1");
                assert_eq!(order.pack_id.as_deref(), Some("basic"));
                assert_eq!(order.currency, "usd");
                assert_eq!(order.amount_minor_units, 500);
            }
            other => panic!("unexpected classification {other:?}"),
        }
    }

    #[test]
    fn missing_event_type_is_malformed() {
        assert!(matches!(
            adapter().classify(br#"{"id":"evt_5","data":{"object":{}}}"#),
            Err(BillingError::MalformedPayload(_))
        ));
        assert!(matches!(
            adapter().classify(b"not json"),
            Err(BillingError::MalformedPayload(_))
        ));
    }
}
