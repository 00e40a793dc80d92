// rest/routes/mailboxes.rs — Mailbox configuration CRUD.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::AppContext;

type RouteError = (StatusCode, Json<Value>);

fn internal(e: impl std::fmt::Display) -> RouteError {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": e.to_string() })),
    )
}

pub async fn list(State(ctx): State<Arc<AppContext>>) -> Result<Json<Value>, RouteError> {
    let mailboxes = ctx.storage.list_mailboxes().await.map_err(internal)?;
    Ok(Json(json!({ "mailboxes": mailboxes })))
}

#[derive(Deserialize)]
pub struct CreateMailboxRequest {
    pub account: String,
    pub auth_code: String,
    pub server_name: String,
    pub channel_id: i64,
}

pub async fn create(
    State(ctx): State<Arc<AppContext>>,
    Json(body): Json<CreateMailboxRequest>,
) -> Result<(StatusCode, Json<Value>), RouteError> {
    // Reject a dangling channel reference up front.
    let channel = ctx
        .storage
        .get_channel(body.channel_id)
        .await
        .map_err(internal)?;
    if channel.is_none() {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": format!("channel {} does not exist", body.channel_id) })),
        ));
    }
    if ctx
        .storage
        .get_mailbox(&body.account)
        .await
        .map_err(internal)?
        .is_some()
    {
        return Err((
            StatusCode::CONFLICT,
            Json(json!({ "error": format!("mailbox '{}' already exists", body.account) })),
        ));
    }

    let mailbox = ctx
        .storage
        .create_mailbox(&body.account, &body.auth_code, &body.server_name, body.channel_id)
        .await
        .map_err(internal)?;
    Ok((StatusCode::CREATED, Json(json!(mailbox))))
}

#[derive(Deserialize)]
pub struct UpdateMailboxRequest {
    pub auth_code: Option<String>,
    pub server_name: Option<String>,
    pub channel_id: Option<i64>,
}

pub async fn update(
    State(ctx): State<Arc<AppContext>>,
    Path(account): Path<String>,
    Json(body): Json<UpdateMailboxRequest>,
) -> Result<Json<Value>, RouteError> {
    let updated = ctx
        .storage
        .update_mailbox(
            &account,
            body.auth_code.as_deref(),
            body.server_name.as_deref(),
            body.channel_id,
        )
        .await
        .map_err(internal)?;
    match updated {
        Some(mailbox) => Ok(Json(json!(mailbox))),
        None => Err((
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("no mailbox configured for '{account}'") })),
        )),
    }
}

pub async fn delete(
    State(ctx): State<Arc<AppContext>>,
    Path(account): Path<String>,
) -> Result<Json<Value>, RouteError> {
    if ctx.storage.delete_mailbox(&account).await.map_err(internal)? {
        Ok(Json(json!({ "deleted": account })))
    } else {
        Err((
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("no mailbox configured for '{account}'") })),
        ))
    }
}
