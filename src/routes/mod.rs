pub mod webhooks;

use axum::{
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};

use crate::responses::JsonResponse;
use crate::state::AppState;

pub fn app(state: AppState) -> Router {
    let webhook_routes = Router::new()
        .route("/stripe", post(webhooks::stripe_webhook))
        .route("/lemonsqueezy", post(webhooks::lemonsqueezy_webhook));

    Router::new()
        .route("/", get(root))
        .nest("/api/billing/webhooks", webhook_routes)
        .with_state(state)
}

/// A simple root route.
async fn root() -> Response {
    JsonResponse::success("credit ledger up").into_response()
}
