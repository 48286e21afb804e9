pub mod errors;
pub mod events;
pub mod lemonsqueezy;
pub mod reconciler;
pub mod stripe;

use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;
use uuid::Uuid;

use crate::models::account::BillingProvider;

pub use errors::BillingError;
pub use events::{BillingEvent, ProviderEvent, ReconcileOutcome};
pub use lemonsqueezy::LemonSqueezyAdapter;
pub use reconciler::BillingReconciler;
pub use stripe::StripeWebhookAdapter;

type HmacSha256 = Hmac<Sha256>;

/// One per payment provider: authenticates a raw webhook body and classifies it into a
/// provider-neutral [`BillingEvent`]. `verify` must succeed before `classify` is called.
#[cfg_attr(test, mockall::automock)]
pub trait ProviderAdapter: Send + Sync {
    fn provider(&self) -> BillingProvider;

    /// Name of the request header carrying the signature.
    fn signature_header(&self) -> &'static str;

    fn verify(&self, payload: &[u8], signature: &str) -> Result<(), BillingError>;

    fn classify(&self, payload: &[u8]) -> Result<ProviderEvent, BillingError>;
}

// Small helpers: nested json lookup
pub(crate) fn jget<'a>(val: &'a Value, path: &[&str]) -> Option<&'a Value> {
    let mut cur = val;
    for key in path {
        cur = cur.get(*key)?;
    }
    Some(cur)
}

pub(crate) fn extract_str<'a>(val: &'a Value, path: &[&str]) -> Option<&'a str> {
    jget(val, path)?.as_str().filter(|s| !s.is_empty())
}

/// Ids arrive as strings from Stripe and as numbers from LemonSqueezy.
pub(crate) fn extract_id(val: &Value, path: &[&str]) -> Option<String> {
    match jget(val, path)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        // expanded objects carry their own id
        Value::Object(obj) => obj
            .get("id")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string()),
        _ => None,
    }
}

pub(crate) fn extract_i64(val: &Value, path: &[&str]) -> Option<i64> {
    jget(val, path)?.as_i64()
}

pub(crate) fn extract_bool(val: &Value, path: &[&str]) -> Option<bool> {
    jget(val, path)?.as_bool()
}

pub(crate) fn parse_account_id(raw: Option<&str>) -> Option<Uuid> {
    raw.and_then(|s| Uuid::parse_str(s.trim()).ok())
}

pub(crate) fn hmac_sha256_hex(secret: &[u8], parts: &[&[u8]]) -> Result<String, BillingError> {
    let mut mac = HmacSha256::new_from_slice(secret)
        .map_err(|err| BillingError::InvalidSignature(err.to_string()))?;
    for part in parts {
        mac.update(part);
    }
    Ok(hex::encode(mac.finalize().into_bytes()))
}

pub(crate) fn signatures_match(expected: &str, provided: &str) -> bool {
    subtle::ConstantTimeEq::ct_eq(expected.as_bytes(), provided.trim().as_bytes()).unwrap_u8()
        == 1u8
}

pub(crate) fn parse_payload(payload: &[u8]) -> Result<Value, BillingError> {
    serde_json::from_slice(payload).map_err(|err| BillingError::MalformedPayload(err.to_string()))
}
