// rest/auth.rs — Shared-token request authentication.
//
// Every protected route requires the configured token in `X-Auth-Token`.
// An empty configured token disables the check (local-only deployments).

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use crate::AppContext;

pub const AUTH_HEADER: &str = "x-auth-token";

pub async fn require_token(
    State(ctx): State<Arc<AppContext>>,
    request: Request,
    next: Next,
) -> Response {
    let expected = ctx.config.server.auth_token.as_str();
    if expected.is_empty() {
        return next.run(request).await;
    }

    let presented = request
        .headers()
        .get(AUTH_HEADER)
        .and_then(|v| v.to_str().ok());
    if presented == Some(expected) {
        next.run(request).await
    } else {
        (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "invalid or missing auth token" })),
        )
            .into_response()
    }
}
