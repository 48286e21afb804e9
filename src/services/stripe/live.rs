use async_trait::async_trait;
use tracing::debug;

use super::{PaymentInstrument, StripeService, StripeServiceError};

pub struct LiveStripeService {
    client: stripe::Client,
}

impl LiveStripeService {
    pub fn new(secret_key: impl Into<String>) -> Self {
        Self {
            client: stripe::Client::new(secret_key),
        }
    }

    /// `None` when no secret key is configured; lookups are then skipped entirely.
    pub fn from_settings(settings: &crate::config::StripeSettings) -> Option<Self> {
        settings.secret_key.as_deref().map(Self::new)
    }
}

#[async_trait]
impl StripeService for LiveStripeService {
    async fn payment_instrument(
        &self,
        payment_intent_id: &str,
    ) -> Result<Option<PaymentInstrument>, StripeServiceError> {
        let id = payment_intent_id
            .parse::<stripe::PaymentIntentId>()
            .map_err(|e| StripeServiceError::Other(e.to_string()))?;
        let intent = stripe::PaymentIntent::retrieve(&self.client, &id, &["payment_method"]).await?;

        let Some(method) = intent
            .payment_method
            .as_ref()
            .and_then(|pm| pm.as_object())
        else {
            debug!(payment_intent_id, "payment intent has no expanded payment method");
            return Ok(None);
        };
        Ok(method.card.as_ref().map(|card| PaymentInstrument {
            brand: Some(card.brand.to_string()),
            last4: Some(card.last4.to_string()),
            fingerprint: card.fingerprint.clone(),
        }))
    }
}
