// server.rs
use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::State,
    http::HeaderMap,
    response::{Html, Json},
    routing::{get, post},
    Router,
};
use chrono::Utc;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};

use crate::bus::{Bus, LocalBus, RedisTransport, RelayBus};
use crate::config::Config;
use crate::connection;
use crate::error::IngressError;
use crate::registry::ChannelRegistry;
use crate::webhook::{CapturedRequest, Dispatch, WebhookHandler};

pub struct AppState {
    pub config: Config,
    pub registry: Arc<ChannelRegistry>,
    pub bus: Arc<dyn Bus>,
    pub webhook_handler: WebhookHandler,
}

impl AppState {
    pub fn new(config: Config, registry: Arc<ChannelRegistry>, bus: Arc<dyn Bus>) -> Self {
        let webhook_handler = WebhookHandler::new(config.webhook_secret(), config.delivery_gate)
            .with_timestamp_tolerance(config.timestamp_tolerance_secs);

        Self {
            config,
            registry,
            bus,
            webhook_handler,
        }
    }
}

/// Wire the registry and bus described by `config`.
///
/// With a Redis URL this connects and spawns the bus listener. The listener
/// resubscribes on its own if Redis goes away.
pub async fn build_state(config: Config) -> Result<AppState> {
    let registry = Arc::new(ChannelRegistry::new(config.event_format()));

    let bus: Arc<dyn Bus> = match config.redis_url() {
        Some(url) => {
            let (transport, incoming) = RedisTransport::connect(url, &config.redis_channel).await?;
            let bus = RelayBus::new(Arc::clone(&registry), transport);
            bus.listen(incoming);
            info!(instance_id = %bus.instance_id(), "cross-instance bus enabled");
            Arc::new(bus)
        }
        None => {
            info!("no REDIS_URL, delivering to local connections only");
            Arc::new(LocalBus::new(Arc::clone(&registry)))
        }
    };

    if config.webhook_secret().is_none() {
        warn!("WEBHOOK_SECRET_KEY is not set, every webhook will be rejected");
    }

    Ok(AppState::new(config, registry, bus))
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/health", get(health_check))
        .route("/webhook", post(handle_webhook))
        .route("/ws", get(connection::ws_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

pub async fn run(listener: TcpListener, state: Arc<AppState>) -> Result<()> {
    axum::serve(listener, router(state))
        .await
        .context("server error")
}

pub async fn serve(config: Config) -> Result<()> {
    let bind_address = config.bind_address();
    let state = Arc::new(build_state(config).await?);

    let listener = TcpListener::bind(&bind_address)
        .await
        .with_context(|| format!("failed to bind {bind_address}"))?;
    info!("listening on {}", bind_address);

    run(listener, state).await
}

async fn index() -> Html<&'static str> {
    Html("<h1>webhook relay</h1>")
}

async fn handle_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, IngressError> {
    let request = CapturedRequest::from_parts(&headers, body);

    let outcome = state
        .webhook_handler
        .handle(&request, state.bus.as_ref())
        .await?;

    if outcome != Dispatch::Published {
        info!(?outcome, "webhook acknowledged without delivery");
    }

    Ok(Json(json!({ "message": "Webhook event dispatched" })))
}

async fn health_check(State(state): State<Arc<AppState>>) -> Json<Value> {
    let (status, bus) = if state.bus.is_connected() {
        ("healthy", "connected")
    } else {
        ("degraded", "disconnected")
    };

    Json(json!({
        "status": status,
        "bus": bus,
        "timestamp": Utc::now(),
        "connections": state.registry.connection_count(),
        "channels": state.registry.channel_count(),
    }))
}
