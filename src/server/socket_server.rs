//! Node wiring
//!
//! Builds the axum application (WebSocket upgrade + REST surface), connects
//! the shared stores, starts the bus subscriber and the reaper, and runs the
//! server with graceful drain on SIGTERM/ctrl-c.

use std::future::IntoFuture;
use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use serde::Deserialize;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::auth::{AuthedUser, TokenService};
use crate::config::Config;
use crate::error::{ChatError, Result};
use crate::pipeline::MessagePipeline;
use crate::presence::{spawn_reaper, PresenceEngine};
use crate::protocol::{BusEnvelope, RoomUpdateKind, ServerEvent};
use crate::rest;
use crate::rooms::RoomService;
use crate::server::connection_handler::ConnectionHandler;
use crate::server::session_registry::SessionRegistry;
use crate::store::bus::{self, EventBus};
use crate::store::db::Database;
use crate::store::kv::KvStore;

/// Shared per-node state, injected into every handler
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub db: Database,
    pub kv: KvStore,
    pub bus: EventBus,
    pub presence: Arc<PresenceEngine>,
    pub pipeline: MessagePipeline,
    pub rooms: Arc<RoomService>,
    pub registry: Arc<SessionRegistry>,
    pub tokens: TokenService,
}

impl AppState {
    /// Resolve a raw token to its user
    pub async fn resolve_token(&self, token: &str) -> Result<AuthedUser> {
        let user_id = self.tokens.verify(token)?;
        let user = self
            .db
            .user_by_id(user_id)
            .await?
            .ok_or_else(|| ChatError::unauthorized("unknown user"))?;
        Ok(AuthedUser {
            id: user.id,
            username: user.username,
        })
    }
}

#[derive(Debug, Deserialize)]
struct WsQuery {
    token: Option<String>,
}

/// Authenticate and upgrade a socket. A missing or invalid token rejects the
/// upgrade outright; the client never reaches the event loop.
async fn ws_upgrade(
    State(state): State<AppState>,
    Query(params): Query<WsQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> std::result::Result<Response, ChatError> {
    let token = params
        .token
        .or_else(|| bearer_token(&headers))
        .ok_or_else(|| ChatError::unauthorized("missing token"))?;
    let user = state.resolve_token(&token).await?;
    Ok(ws
        .on_upgrade(move |socket| ConnectionHandler::run(state, user, socket))
        .into_response())
}

/// Extract a bearer token from the Authorization header
pub fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(axum::http::header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(|t| t.trim().to_string())
}

/// Build the axum application
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_upgrade))
        .merge(rest::routes())
        .layer(cors_layer(&state.config))
        .with_state(state)
}

fn cors_layer(config: &Config) -> CorsLayer {
    if config.allowed_origins.iter().any(|o| o == "*") {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let origins: Vec<axum::http::HeaderValue> = config
            .allowed_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        CorsLayer::new()
            .allow_origin(tower_http::cors::AllowOrigin::list(origins))
            .allow_methods(Any)
            .allow_headers(Any)
    }
}

/// Run one node to completion
pub async fn run(config: Config) -> Result<()> {
    let config = Arc::new(config);

    let db = Database::connect(&config.database_url, config.db_pool_size).await?;
    let kv = KvStore::connect(
        &config.kv_url,
        config.recent_cache_size,
        config.cache_ttl,
        config.heartbeat_ttl,
        config.session_ttl,
    )
    .await?;
    let event_bus = EventBus::connect(&config.bus_url).await?;

    let presence = Arc::new(PresenceEngine::new(db.clone(), kv.clone()));
    let pipeline = MessagePipeline::new(
        db.clone(),
        kv.clone(),
        event_bus.clone(),
        config.recent_cache_size,
    );
    let rooms = Arc::new(RoomService::new(
        db.clone(),
        kv.clone(),
        event_bus.clone(),
        pipeline.clone(),
        presence.clone(),
        config.purge_cache_on_leave,
    ));
    let registry = Arc::new(SessionRegistry::new());
    let tokens = TokenService::new(&config.token_secret, config.token_lifetime);

    // Dedicated subscriber connection; envelopes drain into the local registry.
    let (subscriber, mut envelopes) = bus::spawn_subscriber(config.bus_url.clone());
    let forwarder = {
        let registry = Arc::clone(&registry);
        tokio::spawn(async move {
            while let Some(envelope) = envelopes.recv().await {
                registry.deliver(&envelope);
            }
        })
    };

    let reaper = spawn_reaper(
        Arc::clone(&presence),
        event_bus.clone(),
        config.reap_interval,
        config.stale_threshold,
    );

    let state = AppState {
        config: Arc::clone(&config),
        db: db.clone(),
        kv,
        bus: event_bus.clone(),
        presence: Arc::clone(&presence),
        pipeline,
        rooms,
        registry: Arc::clone(&registry),
        tokens,
    };
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.port))
        .await
        .map_err(|e| ChatError::downstream(format!("failed to bind port {}: {}", config.port, e)))?;
    info!("node listening on port {}", config.port);

    // Shutdown: stop accepting on signal, drain in-flight handlers for the
    // grace period, then tear down whatever is left.
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    let mut grace_rx = shutdown_rx.clone();
    let server = axum::serve(listener, app)
        .with_graceful_shutdown({
            let mut rx = shutdown_rx;
            async move {
                let _ = rx.changed().await;
            }
        })
        .into_future();

    tokio::select! {
        result = server => {
            result.map_err(|e| ChatError::downstream(format!("server error: {}", e)))?;
        }
        _ = async {
            let _ = grace_rx.changed().await;
            tokio::time::sleep(config.shutdown_grace).await;
        } => {
            warn!("drain grace expired, closing remaining sockets");
        }
    }

    reaper.abort();
    subscriber.abort();
    forwarder.abort();

    if config.offline_on_shutdown {
        shutdown_presence(&presence, &event_bus, &registry).await;
    }

    db.close().await;
    info!("node stopped");
    Ok(())
}

/// Optional shutdown policy: proactively demote this node's users instead of
/// waiting for the reaper.
async fn shutdown_presence(
    presence: &PresenceEngine,
    event_bus: &EventBus,
    registry: &SessionRegistry,
) {
    for (user_id, _) in registry.local_users() {
        match presence.mark_offline(user_id).await {
            Ok(Some(room_ids)) => {
                for room_id in room_ids {
                    let presences = match presence.snapshot(room_id).await {
                        Ok(p) => p,
                        Err(_) => continue,
                    };
                    let envelope = BusEnvelope {
                        room_id,
                        exclude: None,
                        event: ServerEvent::presence_change(
                            RoomUpdateKind::UserDisconnected,
                            room_id,
                            presences,
                        ),
                    };
                    if let Err(e) = event_bus.publish(&envelope).await {
                        warn!(room_id = %room_id, "shutdown presence emit failed: {}", e);
                    }
                }
            }
            Ok(None) => {}
            Err(e) => warn!(user_id = %user_id, "shutdown offline failed: {}", e),
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
