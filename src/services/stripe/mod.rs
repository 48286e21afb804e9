// NOTE: async-stripe is compiled with a minimal feature set (runtime-tokio-hyper, checkout,
// webhook-events). Payment intents and payment methods live in the always-on core resources;
// touching APIs outside those features requires updating Cargo.toml explicitly.
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum StripeServiceError {
    #[error("stripe api error: {0}")]
    Api(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("config error: {0}")]
    Config(String),
    #[error("other error: {0}")]
    Other(String),
}

impl From<stripe::StripeError> for StripeServiceError {
    fn from(err: stripe::StripeError) -> Self {
        StripeServiceError::Api(err.to_string())
    }
}

/// Card details recorded on a credit-pack purchase.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PaymentInstrument {
    pub brand: Option<String>,
    pub last4: Option<String>,
    pub fingerprint: Option<String>,
}

impl PaymentInstrument {
    pub fn to_metadata(&self) -> serde_json::Value {
        serde_json::json!({
            "card_brand": self.brand,
            "card_last4": self.last4,
            "card_fingerprint": self.fingerprint,
        })
    }
}

/// Read-only Stripe queries. Called before a unit of work opens, never inside one.
#[async_trait]
pub trait StripeService: Send + Sync {
    async fn payment_instrument(
        &self,
        payment_intent_id: &str,
    ) -> Result<Option<PaymentInstrument>, StripeServiceError>;
}

mod live;
mod mock;

pub use live::LiveStripeService;
pub use mock::MockStripeService;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_returns_registered_instrument_and_counts_calls() {
        let mock = MockStripeService::new().with_instrument(
            "pi_1",
            PaymentInstrument {
                brand: Some("visa".into()),
                last4: Some("4242".into()),
                fingerprint: Some("fp_1".into()),
            },
        );

        let found = mock.payment_instrument("pi_1").await.unwrap().unwrap();
        assert_eq!(found.last4.as_deref(), Some("4242"));
        assert!(mock.payment_instrument("pi_2").await.unwrap().is_none());
        assert_eq!(mock.lookups(), vec!["pi_1".to_string(), "pi_2".to_string()]);
    }

    #[tokio::test]
    async fn mock_can_simulate_outage() {
        let mock = MockStripeService::new();
        mock.set_failing(true);
        assert!(matches!(
            mock.payment_instrument("pi_1").await,
            Err(StripeServiceError::Api(_))
        ));
    }

    #[test]
    fn metadata_uses_card_prefixed_keys() {
        let instrument = PaymentInstrument {
            brand: Some("mastercard".into()),
            last4: Some("4444".into()),
            fingerprint: None,
        };
        let meta = instrument.to_metadata();
        assert_eq!(meta["card_brand"], "mastercard");
        assert!(meta["card_fingerprint"].is_null());
    }
}
