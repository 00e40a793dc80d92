// rest/routes/channels.rs — Notification channel CRUD.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::notify::ProviderKind;
use crate::AppContext;

type RouteError = (StatusCode, Json<Value>);

fn internal(e: impl std::fmt::Display) -> RouteError {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": e.to_string() })),
    )
}

fn unknown_provider(provider: &str) -> RouteError {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({ "error": format!("unsupported notification provider '{provider}'") })),
    )
}

pub async fn list(State(ctx): State<Arc<AppContext>>) -> Result<Json<Value>, RouteError> {
    let channels = ctx.storage.list_channels().await.map_err(internal)?;
    Ok(Json(json!({ "channels": channels })))
}

#[derive(Deserialize)]
pub struct CreateChannelRequest {
    pub name: String,
    pub provider: String,
    pub token: String,
    pub chat_id: Option<String>,
}

pub async fn create(
    State(ctx): State<Arc<AppContext>>,
    Json(body): Json<CreateChannelRequest>,
) -> Result<(StatusCode, Json<Value>), RouteError> {
    if ProviderKind::parse(&body.provider).is_none() {
        return Err(unknown_provider(&body.provider));
    }
    let channel = ctx
        .storage
        .create_channel(&body.name, &body.provider, &body.token, body.chat_id.as_deref())
        .await
        .map_err(internal)?;
    Ok((StatusCode::CREATED, Json(json!(channel))))
}

#[derive(Deserialize)]
pub struct UpdateChannelRequest {
    pub name: Option<String>,
    pub provider: Option<String>,
    pub token: Option<String>,
    pub chat_id: Option<String>,
}

pub async fn update(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<i64>,
    Json(body): Json<UpdateChannelRequest>,
) -> Result<Json<Value>, RouteError> {
    if let Some(provider) = body.provider.as_deref() {
        if ProviderKind::parse(provider).is_none() {
            return Err(unknown_provider(provider));
        }
    }
    let updated = ctx
        .storage
        .update_channel(
            id,
            body.name.as_deref(),
            body.provider.as_deref(),
            body.token.as_deref(),
            body.chat_id.as_deref(),
        )
        .await
        .map_err(internal)?;
    match updated {
        Some(channel) => Ok(Json(json!(channel))),
        None => Err((
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("channel {id} not found") })),
        )),
    }
}

pub async fn delete(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<i64>,
) -> Result<Json<Value>, RouteError> {
    if ctx.storage.delete_channel(id).await.map_err(internal)? {
        Ok(Json(json!({ "deleted": id })))
    } else {
        Err((
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("channel {id} not found") })),
        ))
    }
}
