// rest/routes/sync.rs — Manual sync triggers.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde_json::{json, Value};

use crate::AppContext;

/// Run one full pass over every mailbox, right now. Returns the cycle
/// report; mailbox-level failures live inside it, so this is always 200.
pub async fn run_cycle(State(ctx): State<Arc<AppContext>>) -> Json<Value> {
    let report = ctx.sync.run_cycle().await;
    Json(json!(report))
}

pub async fn run_account(
    State(ctx): State<Arc<AppContext>>,
    Path(account): Path<String>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    match ctx.sync.run_account(&account).await {
        Ok(Some(result)) => Ok(Json(json!(result))),
        Ok(None) => Err((
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("no mailbox configured for '{account}'") })),
        )),
        Err(e) => Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": e.to_string() })),
        )),
    }
}
