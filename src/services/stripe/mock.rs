use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::{PaymentInstrument, StripeService, StripeServiceError};

#[derive(Clone, Default)]
pub struct MockStripeService {
    pub instruments: Arc<Mutex<HashMap<String, PaymentInstrument>>>,
    pub lookups: Arc<Mutex<Vec<String>>>,
    pub failing: Arc<Mutex<bool>>,
}

impl MockStripeService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_instrument(self, payment_intent_id: &str, instrument: PaymentInstrument) -> Self {
        self.instruments
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(payment_intent_id.to_string(), instrument);
        self
    }

    pub fn set_failing(&self, failing: bool) {
        *self.failing.lock().unwrap_or_else(|e| e.into_inner()) = failing;
    }

    pub fn lookups(&self) -> Vec<String> {
        self.lookups
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl StripeService for MockStripeService {
    async fn payment_instrument(
        &self,
        payment_intent_id: &str,
    ) -> Result<Option<PaymentInstrument>, StripeServiceError> {
        self.lookups
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(payment_intent_id.to_string());
        if *self.failing.lock().unwrap_or_else(|e| e.into_inner()) {
            return Err(StripeServiceError::Api("simulated stripe outage".into()));
        }
        Ok(self
            .instruments
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(payment_intent_id)
            .cloned())
    }
}
