// rest/mod.rs — REST API server.
//
// Axum HTTP server, local bind by default. Thin glue over the sync engine
// and the store; no business logic lives here.
//
// Endpoints:
//   GET    /api/v1/health                       (no auth)
//   POST   /api/v1/sync/run
//   POST   /api/v1/sync/run/{account}
//   GET    /api/v1/mailboxes
//   POST   /api/v1/mailboxes
//   PUT    /api/v1/mailboxes/{account}
//   DELETE /api/v1/mailboxes/{account}
//   GET    /api/v1/channels
//   POST   /api/v1/channels
//   PUT    /api/v1/channels/{id}
//   DELETE /api/v1/channels/{id}
//   GET    /api/v1/messages?recipient=&delivered=&limit=&offset=

pub mod auth;
pub mod routes;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::{
    middleware,
    routing::{get, post, put},
    Router,
};
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::AppContext;

pub async fn start_rest_server(ctx: Arc<AppContext>) -> Result<()> {
    let bind = format!("{}:{}", ctx.config.server.bind_address, ctx.config.server.port);
    let addr: SocketAddr = bind.parse()?;

    let router = build_router(ctx);

    info!("REST API listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    Ok(())
}

pub fn build_router(ctx: Arc<AppContext>) -> Router {
    let protected = Router::new()
        // Sync triggers
        .route("/api/v1/sync/run", post(routes::sync::run_cycle))
        .route("/api/v1/sync/run/{account}", post(routes::sync::run_account))
        // Mailboxes
        .route(
            "/api/v1/mailboxes",
            get(routes::mailboxes::list).post(routes::mailboxes::create),
        )
        .route(
            "/api/v1/mailboxes/{account}",
            put(routes::mailboxes::update).delete(routes::mailboxes::delete),
        )
        // Channels
        .route(
            "/api/v1/channels",
            get(routes::channels::list).post(routes::channels::create),
        )
        .route(
            "/api/v1/channels/{id}",
            put(routes::channels::update).delete(routes::channels::delete),
        )
        // Message records
        .route("/api/v1/messages", get(routes::messages::list))
        .layer(middleware::from_fn_with_state(
            Arc::clone(&ctx),
            auth::require_token,
        ));

    Router::new()
        // Health (no auth)
        .route("/api/v1/health", get(routes::health::health))
        .merge(protected)
        .layer(CorsLayer::permissive())
        .with_state(ctx)
}
