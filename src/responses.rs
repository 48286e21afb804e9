use axum::{http::StatusCode, response::IntoResponse, Json};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize)]
pub struct JsonResponse {
    pub status: String,
    pub success: bool,
    pub message: String,
    pub code: Option<String>,
}

impl JsonResponse {
    fn reply(status: StatusCode, success: bool, msg: &str) -> impl IntoResponse {
        (
            status,
            Json(JsonResponse {
                status: if success { "success" } else { "error" }.to_string(),
                success,
                message: msg.to_string(),
                code: None,
            }),
        )
    }

    pub fn success(msg: &str) -> impl IntoResponse {
        Self::reply(StatusCode::OK, true, msg)
    }

    pub fn bad_request(msg: &str) -> impl IntoResponse {
        Self::reply(StatusCode::BAD_REQUEST, false, msg)
    }

    pub fn unauthorized(msg: &str) -> impl IntoResponse {
        Self::reply(StatusCode::UNAUTHORIZED, false, msg)
    }

    pub fn server_error(msg: &str) -> impl IntoResponse {
        Self::reply(StatusCode::INTERNAL_SERVER_ERROR, false, msg)
    }

    /// Tells the caller (usually a provider redelivering a webhook) to retry later.
    pub fn service_unavailable(msg: &str) -> impl IntoResponse {
        Self::reply(StatusCode::SERVICE_UNAVAILABLE, false, msg)
    }
}
