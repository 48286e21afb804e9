use std::sync::Arc;

use serde_json::json;
use tracing::{error, info, warn};

use super::events::{
    AccountHint, BillingEvent, OrderSnapshot, ProviderEvent, ReconcileOutcome, RenewalSnapshot,
    SubscriptionRef, SubscriptionSnapshot,
};
use super::{BillingError, ProviderAdapter};
use crate::db::billing_store::{BillingStore, BillingUnitOfWork, StoreError};
use crate::models::account::{Account, BillingProvider, PlanStatus, SubscriptionState};
use crate::models::credit_transaction::CreditTransactionType;
use crate::models::plan::PlanTier;
use crate::models::purchase::{NewPurchase, PurchaseStatus, PurchaseType};
use crate::services::ledger::{CreditLedger, MonthlyResetOutcome};
use crate::services::stripe::{PaymentInstrument, StripeService};

pub const SUBSCRIPTION_ACTIVATED_REASON: &str = "subscription_activated";
pub const CREDIT_PACK_REASON: &str = "credit_pack_purchase";

/// Turns verified provider webhooks into account state transitions and ledger grants.
///
/// Credit-granting effects are keyed on a purchase row per `(provider, external id)`, written in
/// the same unit of work as the grant, so a redelivered or reordered event can never grant twice.
/// Status-only transitions write absolute state and are naturally idempotent.
pub struct BillingReconciler {
    store: Arc<dyn BillingStore>,
    ledger: CreditLedger,
    adapters: Vec<Arc<dyn ProviderAdapter>>,
    stripe: Option<Arc<dyn StripeService>>,
}

impl BillingReconciler {
    pub fn new(
        store: Arc<dyn BillingStore>,
        ledger: CreditLedger,
        adapters: Vec<Arc<dyn ProviderAdapter>>,
        stripe: Option<Arc<dyn StripeService>>,
    ) -> Self {
        Self {
            store,
            ledger,
            adapters,
            stripe,
        }
    }

    pub fn adapter(&self, provider: BillingProvider) -> Option<&Arc<dyn ProviderAdapter>> {
        self.adapters.iter().find(|a| a.provider() == provider)
    }

    /// Verify, classify and apply one raw webhook delivery.
    pub async fn handle_webhook(
        &self,
        provider: BillingProvider,
        payload: &[u8],
        signature: Option<&str>,
    ) -> Result<ReconcileOutcome, BillingError> {
        let adapter = self.adapter(provider).ok_or_else(|| {
            BillingError::Unavailable(format!("no webhook adapter configured for {provider}"))
        })?;
        let signature = signature.ok_or_else(|| {
            BillingError::InvalidSignature(format!("missing {} header", adapter.signature_header()))
        })?;
        if let Err(err) = adapter.verify(payload, signature) {
            warn!(%provider, ?err, "webhook signature rejected");
            return Err(err);
        }
        let event = adapter.classify(payload)?;
        self.apply(event).await
    }

    pub async fn apply(&self, event: ProviderEvent) -> Result<ReconcileOutcome, BillingError> {
        let ProviderEvent {
            provider,
            event_id,
            event_name,
            kind,
        } = event;
        let label = kind.label();

        match self.dispatch(provider, kind).await {
            Ok(outcome) => {
                info!(
                    %provider,
                    %event_id,
                    %event_name,
                    kind = label,
                    outcome = outcome.as_str(),
                    "webhook reconciled"
                );
                Ok(outcome)
            }
            // acknowledged so the provider stops redelivering; needs operator follow-up
            Err(BillingError::UnknownPlanMapping(id)) => {
                warn!(%provider, %event_id, %event_name, provider_id = %id, "no catalog mapping for webhook, ignoring");
                Ok(ReconcileOutcome::Ignored)
            }
            Err(BillingError::AccountNotFound) => {
                warn!(%provider, %event_id, %event_name, "unable to resolve account for webhook, ignoring");
                Ok(ReconcileOutcome::Ignored)
            }
            Err(BillingError::Ledger(err)) if !err.is_retryable() => {
                error!(%provider, %event_id, %event_name, ?err, "ledger rejected webhook effect, ignoring");
                Ok(ReconcileOutcome::Ignored)
            }
            Err(err) => {
                error!(%provider, %event_id, %event_name, ?err, "webhook reconciliation failed");
                Err(err)
            }
        }
    }

    async fn dispatch(
        &self,
        provider: BillingProvider,
        kind: BillingEvent,
    ) -> Result<ReconcileOutcome, BillingError> {
        match kind {
            BillingEvent::SubscriptionActivated(snapshot) => {
                self.activate(provider, snapshot).await
            }
            BillingEvent::SubscriptionCanceled(sub) => {
                self.set_subscription_state(provider, sub, |state| {
                    state.plan = PlanTier::Free;
                    state.plan_status = PlanStatus::Canceled;
                    state.cancel_at_period_end = false;
                })
                .await
            }
            BillingEvent::CancelScheduled(sub) => {
                self.set_subscription_state(provider, sub, |state| {
                    state.cancel_at_period_end = true;
                })
                .await
            }
            BillingEvent::Paused(sub) => {
                self.set_subscription_state(provider, sub, |state| {
                    state.plan_status = PlanStatus::Paused;
                })
                .await
            }
            BillingEvent::Resumed(sub) => {
                self.set_subscription_state(provider, sub, |state| {
                    state.plan_status = PlanStatus::Active;
                    state.cancel_at_period_end = false;
                })
                .await
            }
            BillingEvent::PaymentFailed(sub) => {
                self.set_subscription_state(provider, sub, |state| {
                    state.plan_status = PlanStatus::PastDue;
                })
                .await
            }
            BillingEvent::OrderCompleted(order) => self.complete_order(provider, order).await,
            BillingEvent::RenewalPaid(renewal) => self.renew(provider, renewal).await,
            BillingEvent::PaymentStatusChanged {
                external_payment_id,
                status,
            } => {
                self.update_payment_status(provider, &external_payment_id, status)
                    .await
            }
            BillingEvent::Ignored { reason } => {
                info!(%provider, %reason, "webhook event not actionable");
                Ok(ReconcileOutcome::Ignored)
            }
        }
    }

    async fn activate(
        &self,
        provider: BillingProvider,
        snapshot: SubscriptionSnapshot,
    ) -> Result<ReconcileOutcome, BillingError> {
        let catalog = self.ledger.catalog();
        let (plan, interval) = catalog
            .resolve_plan(provider, &snapshot.price_id)
            .ok_or_else(|| BillingError::UnknownPlanMapping(snapshot.price_id.clone()))?;
        let allotment = catalog
            .entry(plan)
            .map(|entry| entry.monthly_credits)
            .ok_or_else(|| BillingError::UnknownPlanMapping(snapshot.price_id.clone()))?;

        let mut uow = self.store.begin().await?;
        let account = resolve_account(uow.as_mut(), provider, &snapshot.account).await?;
        let account_id = account.id;
        let grant_recorded = uow
            .find_purchase(provider, &snapshot.subscription_id)
            .await?
            .is_some();
        let same_subscription =
            account.external_subscription_id.as_deref() == Some(snapshot.subscription_id.as_str());

        if !same_subscription && grant_recorded {
            info!(
                %account_id,
                subscription_id = %snapshot.subscription_id,
                "replay for a superseded subscription, keeping current state"
            );
            uow.rollback().await?;
            return Ok(ReconcileOutcome::Duplicate);
        }
        if same_subscription && account.plan_status == PlanStatus::Canceled {
            info!(
                %account_id,
                subscription_id = %snapshot.subscription_id,
                "update for a terminated subscription, ignoring"
            );
            uow.rollback().await?;
            return Ok(ReconcileOutcome::Ignored);
        }
        if same_subscription {
            if let (Some(incoming), Some(current)) =
                (snapshot.current_period_end, account.current_period_end)
            {
                if incoming < current {
                    info!(%account_id, subscription_id = %snapshot.subscription_id, "out-of-order subscription update, ignoring");
                    uow.rollback().await?;
                    return Ok(ReconcileOutcome::Ignored);
                }
            }
        }

        let state = SubscriptionState {
            plan,
            plan_status: snapshot.status,
            billing_provider: provider,
            external_customer_id: snapshot
                .account
                .customer_id
                .clone()
                .or_else(|| account.external_customer_id.clone()),
            external_subscription_id: Some(snapshot.subscription_id.clone()),
            current_period_start: snapshot.current_period_start,
            current_period_end: snapshot.current_period_end,
            cancel_at_period_end: snapshot.cancel_at_period_end,
        };
        uow.update_subscription_state(account_id, &state).await?;

        // trials and incomplete subscriptions get their allotment once they turn active
        if snapshot.status == PlanStatus::Active && !grant_recorded {
            let inserted = uow
                .insert_purchase(NewPurchase {
                    account_id,
                    r#type: PurchaseType::Subscription,
                    provider,
                    plan: Some(plan),
                    credits_granted: Some(allotment),
                    amount_minor_units: snapshot.amount_minor_units,
                    currency: snapshot.currency.clone(),
                    external_customer_id: state.external_customer_id.clone(),
                    external_payment_id: snapshot.subscription_id.clone(),
                    external_subscription_id: Some(snapshot.subscription_id.clone()),
                    status: PurchaseStatus::Completed,
                    metadata: json!({ "interval": interval }),
                })
                .await;
            let purchase = match inserted {
                Ok(purchase) => purchase,
                Err(StoreError::Conflict(_)) => {
                    uow.rollback().await?;
                    return Ok(ReconcileOutcome::Duplicate);
                }
                Err(err) => return Err(err.into()),
            };
            let description = format!("{plan} plan activated ({allotment} credits)");
            self.ledger
                .add_within(
                    uow.as_mut(),
                    account_id,
                    allotment,
                    CreditTransactionType::Subscription,
                    SUBSCRIPTION_ACTIVATED_REASON,
                    Some(&description),
                    Some(purchase.id),
                )
                .await?;
        }

        uow.commit().await?;
        info!(
            %account_id,
            plan = plan.as_str(),
            status = snapshot.status.as_str(),
            subscription_id = %snapshot.subscription_id,
            "subscription state updated"
        );
        Ok(ReconcileOutcome::Applied)
    }

    /// Status-only transitions. Events for a subscription other than the account's current one
    /// are stale and left alone, as is anything arriving after the subscription was terminated.
    async fn set_subscription_state(
        &self,
        provider: BillingProvider,
        sub: SubscriptionRef,
        apply: impl FnOnce(&mut SubscriptionState) + Send,
    ) -> Result<ReconcileOutcome, BillingError> {
        let mut uow = self.store.begin().await?;
        let account = resolve_account(uow.as_mut(), provider, &sub.account).await?;
        let Some(current) = account.external_subscription_id.as_deref() else {
            info!(
                account_id = %account.id,
                incoming = %sub.subscription_id,
                "status event for an account without a subscription, ignoring"
            );
            uow.rollback().await?;
            return Ok(ReconcileOutcome::Ignored);
        };
        if current != sub.subscription_id {
            info!(
                account_id = %account.id,
                current,
                incoming = %sub.subscription_id,
                "event for a superseded subscription, ignoring"
            );
            uow.rollback().await?;
            return Ok(ReconcileOutcome::Ignored);
        }

        let before = SubscriptionState::from(&account);
        let mut state = before.clone();
        apply(&mut state);
        state.billing_provider = provider;
        state.external_subscription_id = Some(sub.subscription_id);
        if let Some(customer_id) = sub.account.customer_id {
            state.external_customer_id = Some(customer_id);
        }
        if state == before {
            uow.rollback().await?;
            return Ok(ReconcileOutcome::Duplicate);
        }
        if before.plan_status == PlanStatus::Canceled {
            info!(
                account_id = %account.id,
                subscription_id = ?state.external_subscription_id,
                "status event after termination, ignoring"
            );
            uow.rollback().await?;
            return Ok(ReconcileOutcome::Ignored);
        }

        uow.update_subscription_state(account.id, &state).await?;
        uow.commit().await?;
        Ok(ReconcileOutcome::Applied)
    }

    async fn complete_order(
        &self,
        provider: BillingProvider,
        order: OrderSnapshot,
    ) -> Result<ReconcileOutcome, BillingError> {
        let catalog = self.ledger.catalog();
        let pack = order
            .pack_id
            .as_deref()
            .and_then(|id| catalog.pack_by_id(id))
            .or_else(|| {
                order
                    .price_id
                    .as_deref()
                    .and_then(|id| catalog.resolve_pack(provider, id))
            });
        let Some(pack) = pack else {
            let subscription_variant = order
                .price_id
                .as_deref()
                .and_then(|id| catalog.resolve_plan(provider, id))
                .is_some();
            if subscription_variant {
                info!(%provider, order_id = %order.external_payment_id, "order for a subscription plan, handled by subscription events");
                return Ok(ReconcileOutcome::Ignored);
            }
            let key = order
                .pack_id
                .or(order.price_id)
                .unwrap_or_else(|| "<none>".to_string());
            return Err(BillingError::UnknownPlanMapping(key));
        };

        // cheap replay check before calling out to the provider
        if self
            .store
            .find_purchase(provider, &order.external_payment_id)
            .await?
            .is_some()
        {
            return Ok(ReconcileOutcome::Duplicate);
        }

        let mut metadata = json!({ "pack_id": pack.id, "pack_name": pack.name });
        if let Some(instrument) = self
            .lookup_instrument(provider, order.payment_intent_id.as_deref())
            .await
        {
            if let (Some(target), Some(extra)) =
                (metadata.as_object_mut(), instrument.to_metadata().as_object())
            {
                target.extend(extra.clone());
            }
        }
        let amount_minor_units = if order.amount_minor_units > 0 {
            order.amount_minor_units
        } else {
            pack.price_minor_units
        };

        let mut uow = self.store.begin().await?;
        let account = resolve_account(uow.as_mut(), provider, &order.account).await?;
        let inserted = uow
            .insert_purchase(NewPurchase {
                account_id: account.id,
                r#type: PurchaseType::CreditPack,
                provider,
                plan: None,
                credits_granted: Some(pack.credits),
                amount_minor_units,
                currency: order.currency.clone(),
                external_customer_id: order.account.customer_id.clone(),
                external_payment_id: order.external_payment_id.clone(),
                external_subscription_id: None,
                status: PurchaseStatus::Completed,
                metadata,
            })
            .await;
        let purchase = match inserted {
            Ok(purchase) => purchase,
            Err(StoreError::Conflict(_)) => {
                uow.rollback().await?;
                return Ok(ReconcileOutcome::Duplicate);
            }
            Err(err) => return Err(err.into()),
        };

        let description = format!("Purchased {} ({} credits)", pack.name, pack.credits);
        self.ledger
            .add_within(
                uow.as_mut(),
                account.id,
                pack.credits,
                CreditTransactionType::Purchase,
                CREDIT_PACK_REASON,
                Some(&description),
                Some(purchase.id),
            )
            .await?;

        // remember the customer so later events without our metadata still resolve
        if account.external_customer_id.is_none() {
            if let Some(customer_id) = order.account.customer_id {
                let state = SubscriptionState {
                    external_customer_id: Some(customer_id),
                    ..SubscriptionState::from(&account)
                };
                uow.update_subscription_state(account.id, &state).await?;
            }
        }

        uow.commit().await?;
        Ok(ReconcileOutcome::Applied)
    }

    async fn renew(
        &self,
        provider: BillingProvider,
        renewal: RenewalSnapshot,
    ) -> Result<ReconcileOutcome, BillingError> {
        let mut uow = self.store.begin().await?;
        let account = resolve_account(uow.as_mut(), provider, &renewal.account).await?;
        if account
            .external_subscription_id
            .as_deref()
            .is_some_and(|current| current != renewal.subscription_id)
        {
            info!(account_id = %account.id, subscription_id = %renewal.subscription_id, "renewal for a superseded subscription, ignoring");
            uow.rollback().await?;
            return Ok(ReconcileOutcome::Ignored);
        }

        match self
            .ledger
            .monthly_reset_within(uow.as_mut(), account.id, &renewal.period_key)
            .await?
        {
            MonthlyResetOutcome::Granted(_) => {
                uow.commit().await?;
                Ok(ReconcileOutcome::Applied)
            }
            MonthlyResetOutcome::AlreadyApplied => {
                uow.rollback().await?;
                Ok(ReconcileOutcome::Duplicate)
            }
            MonthlyResetOutcome::NotEligible => {
                uow.rollback().await?;
                Ok(ReconcileOutcome::Ignored)
            }
        }
    }

    async fn update_payment_status(
        &self,
        provider: BillingProvider,
        external_payment_id: &str,
        status: PurchaseStatus,
    ) -> Result<ReconcileOutcome, BillingError> {
        let mut uow = self.store.begin().await?;
        let touched = uow
            .update_purchase_status(provider, external_payment_id, status)
            .await?;
        if touched == 0 {
            uow.rollback().await?;
            info!(%provider, external_payment_id, "payment status for unknown purchase, ignoring");
            return Ok(ReconcileOutcome::Ignored);
        }
        uow.commit().await?;
        Ok(ReconcileOutcome::Applied)
    }

    /// Best effort: a failed lookup only means the purchase is recorded without card details.
    async fn lookup_instrument(
        &self,
        provider: BillingProvider,
        payment_intent_id: Option<&str>,
    ) -> Option<PaymentInstrument> {
        if provider != BillingProvider::Stripe {
            return None;
        }
        let (Some(stripe), Some(payment_intent_id)) = (self.stripe.as_ref(), payment_intent_id)
        else {
            return None;
        };
        match stripe.payment_instrument(payment_intent_id).await {
            Ok(instrument) => instrument,
            Err(err) => {
                warn!(?err, payment_intent_id, "payment instrument lookup failed");
                None
            }
        }
    }
}

async fn resolve_account(
    uow: &mut dyn BillingUnitOfWork,
    provider: BillingProvider,
    hint: &AccountHint,
) -> Result<Account, BillingError> {
    if let Some(account_id) = hint.account_id {
        if let Some(account) = uow.lock_account(account_id).await? {
            return Ok(account);
        }
    }
    if let Some(customer_id) = hint.customer_id.as_deref() {
        if let Some(account_id) = uow
            .find_account_id_by_customer(provider, customer_id)
            .await?
        {
            if let Some(account) = uow.lock_account(account_id).await? {
                return Ok(account);
            }
        }
    }
    Err(BillingError::AccountNotFound)
}
