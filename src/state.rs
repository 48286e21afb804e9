use std::sync::Arc;

use crate::services::billing::BillingReconciler;
use crate::services::ledger::CreditLedger;

#[derive(Clone)]
pub struct AppState {
    /// Entry point for feature-usage code that spends credits.
    pub ledger: Arc<CreditLedger>,
    pub reconciler: Arc<BillingReconciler>,
}
