use axum::body::Bytes;
use axum::Json;
use axum::{extract::State, http::HeaderMap, response::IntoResponse, response::Response};
use tracing::error;

use crate::models::account::BillingProvider;
use crate::responses::JsonResponse;
use crate::services::billing::BillingError;
use crate::state::AppState;

// POST /api/billing/webhooks/stripe
pub async fn stripe_webhook(
    State(app_state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    handle_delivery(&app_state, BillingProvider::Stripe, &headers, &body).await
}

// POST /api/billing/webhooks/lemonsqueezy
pub async fn lemonsqueezy_webhook(
    State(app_state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    handle_delivery(&app_state, BillingProvider::LemonSqueezy, &headers, &body).await
}

/// 200 once the event is applied or deliberately ignored, 401 on a bad signature, 400 on a
/// payload we can never parse, 503 when storage failed and the provider should redeliver.
async fn handle_delivery(
    app_state: &AppState,
    provider: BillingProvider,
    headers: &HeaderMap,
    body: &[u8],
) -> Response {
    let signature = app_state
        .reconciler
        .adapter(provider)
        .and_then(|adapter| headers.get(adapter.signature_header()))
        .and_then(|value| value.to_str().ok());

    match app_state
        .reconciler
        .handle_webhook(provider, body, signature)
        .await
    {
        Ok(outcome) => {
            Json(serde_json::json!({ "received": true, "outcome": outcome })).into_response()
        }
        Err(BillingError::InvalidSignature(_)) => {
            JsonResponse::unauthorized("Invalid webhook signature").into_response()
        }
        Err(BillingError::MalformedPayload(msg)) => {
            JsonResponse::bad_request(&format!("Malformed webhook payload: {msg}")).into_response()
        }
        Err(err) if err.is_retryable() => {
            JsonResponse::service_unavailable("Webhook could not be processed, retry later")
                .into_response()
        }
        Err(err) => {
            error!(?err, %provider, "unexpected webhook failure");
            JsonResponse::server_error("Webhook processing failed").into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::{
        body::{to_bytes, Body},
        http::{Request, StatusCode},
        Router,
    };
    use serde_json::{json, Value};
    use time::OffsetDateTime;
    use tower::ServiceExt; // for `app.oneshot(...)`
    use uuid::Uuid;

    use crate::catalog::{PlanCatalog, ProviderPriceIds};
    use crate::config::CatalogSettings;
    use crate::db::mock_billing_store::{FailPoint, MockBillingStore};
    use crate::services::billing::{
        lemonsqueezy, stripe, BillingReconciler, LemonSqueezyAdapter, StripeWebhookAdapter,
    };
    use crate::services::ledger::CreditLedger;
    use crate::state::AppState;

    const STRIPE_SECRET: &str = "whsec_routes";
    const LS_SECRET: &str = "ls_routes";

    fn test_app(store: &MockBillingStore) -> (Router, Arc<CreditLedger>) {
        let settings = CatalogSettings {
            pro_stripe: ProviderPriceIds::new(Some("price_pro_m".into()), None),
            ..CatalogSettings::default()
        };
        let ledger = Arc::new(CreditLedger::new(
            Arc::new(store.clone()),
            Arc::new(PlanCatalog::from_settings(&settings)),
        ));
        let reconciler = BillingReconciler::new(
            Arc::new(store.clone()),
            ledger.as_ref().clone(),
            vec![
                Arc::new(StripeWebhookAdapter::new(STRIPE_SECRET, 300)),
                Arc::new(LemonSqueezyAdapter::new(LS_SECRET)),
            ],
            None,
        );
        let state = AppState {
            ledger: ledger.clone(),
            reconciler: Arc::new(reconciler),
        };
        (crate::routes::app(state), ledger)
    }

    fn subscription_created(account_id: Uuid, price_id: &str) -> String {
        json!({
            "id": "evt_route_1",
            "type": "customer.subscription.created",
            "data": { "object": {
                "id": "sub_route",
                "customer": "cus_route",
                "status": "active",
                "metadata": { "account_id": account_id.to_string() },
                "items": { "data": [ { "price": { "id": price_id } } ] }
            } }
        })
        .to_string()
    }

    fn stripe_request(body: &str, secret: &str) -> Request<Body> {
        let header = stripe::signature_header(
            secret,
            OffsetDateTime::now_utc().unix_timestamp(),
            body.as_bytes(),
        );
        Request::post("/api/billing/webhooks/stripe")
            .header("Content-Type", "application/json")
            .header("Stripe-Signature", header)
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn json_body(res: axum::response::Response) -> Value {
        let bytes = to_bytes(res.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn root_reports_up() {
        let store = MockBillingStore::new();
        let (app, _) = test_app(&store);
        let res = app
            .oneshot(Request::get("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(json_body(res).await["success"], true);
    }

    #[tokio::test]
    async fn signed_stripe_activation_is_applied() {
        let store = MockBillingStore::new();
        let (app, ledger) = test_app(&store);
        let account_id = Uuid::new_v4();
        ledger.open_account(account_id).await.unwrap();

        let body = subscription_created(account_id, "price_pro_m");
        let res = app.oneshot(stripe_request(&body, STRIPE_SECRET)).await.unwrap();

        assert_eq!(res.status(), StatusCode::OK);
        let json = json_body(res).await;
        assert_eq!(json["received"], true);
        assert_eq!(json["outcome"], "applied");
        assert_eq!(ledger.get_balance(account_id).await.unwrap(), 200);
    }

    #[tokio::test]
    async fn unknown_price_is_acknowledged() {
        let store = MockBillingStore::new();
        let (app, ledger) = test_app(&store);
        let account_id = Uuid::new_v4();
        ledger.open_account(account_id).await.unwrap();

        let body = subscription_created(account_id, "price_retired");
        let res = app.oneshot(stripe_request(&body, STRIPE_SECRET)).await.unwrap();

        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(json_body(res).await["outcome"], "ignored");
    }

    #[tokio::test]
    async fn forged_or_missing_signature_is_unauthorized() {
        let store = MockBillingStore::new();
        let (app, _) = test_app(&store);
        let body = subscription_created(Uuid::new_v4(), "price_pro_m");

        let res = app
            .clone()
            .oneshot(stripe_request(&body, "whsec_other"))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

        let res = app
            .oneshot(
                Request::post("/api/billing/webhooks/lemonsqueezy")
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn signed_garbage_is_bad_request() {
        let store = MockBillingStore::new();
        let (app, _) = test_app(&store);
        let body = "{not json";
        let signature = lemonsqueezy::signature_for(LS_SECRET, body.as_bytes());

        let res = app
            .oneshot(
                Request::post("/api/billing/webhooks/lemonsqueezy")
                    .header("X-Signature", signature)
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn storage_outage_asks_for_redelivery() {
        let store = MockBillingStore::new();
        let (app, ledger) = test_app(&store);
        let account_id = Uuid::new_v4();
        ledger.open_account(account_id).await.unwrap();

        store.fail_on(FailPoint::Begin);
        let body = subscription_created(account_id, "price_pro_m");
        let res = app.oneshot(stripe_request(&body, STRIPE_SECRET)).await.unwrap();

        assert_eq!(res.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(json_body(res).await["success"], false);
    }
}
