use std::sync::Arc;
use std::time::Duration;

use axum::{
    Extension, Json, Router,
    extract::Path,
    http::StatusCode,
    routing::{get, post},
};
use serde::Serialize;
use tokio::sync::watch;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::AppState;
use crate::config::AppConfig;
use crate::conversation::{
    ActiveConversation, ConversationPatterns, ConversationRegistry, conversation_middleware,
};
use crate::provider::postgres::PgHandleProvider;

/// Start the server with the provided configuration.
pub async fn start_server(config: Arc<AppConfig>) -> anyhow::Result<()> {
    let provider = PgHandleProvider::connect(&config.persistence.database_url).await?;
    let registry = ConversationRegistry::new(
        Arc::new(provider),
        config.conversation.timeout(),
        config.conversation.sweep_interval(),
    );

    let patterns = Arc::new(ConversationPatterns::new(
        &config.conversation.initiators,
        &config.conversation.terminators,
    )?);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweeper = registry.spawn_sweeper(shutdown_rx);
    info!(
        name: "sweeper.started",
        timeout_secs = config.conversation.timeout_secs,
        interval_secs = config.conversation.sweep_interval_secs,
        "Conversation sweeper started"
    );

    let state = AppState {
        registry: registry.clone(),
        patterns,
        config: Arc::clone(&config),
    };
    let app = build_router(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    info!(
        name: "server.started",
        address = %addr,
        "Server started"
    );

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Stop the sweeper before draining the handles it might touch.
    let _ = shutdown_tx.send(true);
    sweeper.await?;
    registry.drain().await;

    info!(name: "server.stopped", "Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::error!(%error, "failed to listen for shutdown signal");
    }
}

/// Build the checkout router with the conversation middleware applied.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/checkout/start", get(checkout_start))
        .route("/checkout/items/{id}", post(checkout_add_item))
        .route("/checkout/confirm", post(checkout_confirm))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            conversation_middleware,
        ))
        .layer(TimeoutLayer::new(Duration::from_secs(30)))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

#[derive(Debug, Serialize)]
struct CheckoutStatus {
    session: String,
    pending: bool,
}

/// GET /checkout/start - the initiator; the middleware has already opened
/// the conversation by the time this runs.
async fn checkout_start(
    Extension(ActiveConversation(conversation)): Extension<ActiveConversation>,
) -> Json<CheckoutStatus> {
    Json(CheckoutStatus {
        session: conversation.id().to_string(),
        pending: false,
    })
}

/// POST /checkout/items/{id} - queues a deferred write on the conversation
/// handle; nothing reaches the database until confirm.
async fn checkout_add_item(
    Path(item_id): Path<i64>,
    conversation: Option<Extension<ActiveConversation>>,
) -> Result<Json<CheckoutStatus>, (StatusCode, &'static str)> {
    let Some(Extension(ActiveConversation(conversation))) = conversation else {
        return Err((StatusCode::CONFLICT, "no active checkout"));
    };

    let session = conversation.id().replace('\'', "''");
    conversation
        .handle()
        .execute(&format!(
            "INSERT INTO checkout_items (session_id, item_id) VALUES ('{session}', {item_id})"
        ))
        .await
        .map_err(|error| {
            tracing::error!(%error, "failed to queue checkout item");
            (StatusCode::INTERNAL_SERVER_ERROR, "persistence failure")
        })?;

    Ok(Json(CheckoutStatus {
        session: conversation.id().to_string(),
        pending: true,
    }))
}

#[derive(Debug, Serialize)]
struct ConfirmReceipt {
    session: String,
    committed: bool,
}

/// POST /checkout/confirm - the terminator; flushes the pending writes in
/// one transaction, then the middleware ends the conversation.
async fn checkout_confirm(
    conversation: Option<Extension<ActiveConversation>>,
) -> Result<Json<ConfirmReceipt>, (StatusCode, &'static str)> {
    let Some(Extension(ActiveConversation(conversation))) = conversation else {
        return Err((StatusCode::CONFLICT, "no active checkout"));
    };

    conversation.handle().commit().await.map_err(|error| {
        tracing::error!(%error, "failed to commit checkout");
        (StatusCode::INTERNAL_SERVER_ERROR, "persistence failure")
    })?;

    Ok(Json(ConfirmReceipt {
        session: conversation.id().to_string(),
        committed: true,
    }))
}
