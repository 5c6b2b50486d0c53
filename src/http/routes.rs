//! HTTP route definitions

use axum::{
    extract::{Path, State},
    http::{header, Method, StatusCode},
    response::{IntoResponse, Json},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::{compression::CompressionLayer, cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info};
use uuid::Uuid;

use crate::app::AppState;
use crate::game::{GameError, Player, SessionSnapshot};
use crate::util::time::uptime_secs;
use crate::ws::handler::ws_handler;

/// Build the application router
pub fn build_router(state: AppState) -> Router {
    // CORS configuration - support multiple origins (comma-separated in CLIENT_ORIGIN)
    let allowed_origins: Vec<header::HeaderValue> = state
        .config
        .client_origin
        .split(',')
        .filter_map(|s| s.trim().parse::<header::HeaderValue>().ok())
        .collect();

    let cors = CorsLayer::new()
        .allow_origin(allowed_origins)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE])
        .allow_credentials(true);

    let game_routes = Router::new()
        .route("/api/game/new", post(create_game_handler))
        .route("/api/game/join", post(join_game_handler))
        .route("/api/game/:id", get(snapshot_handler));

    Router::new()
        .route("/health", get(health_handler))
        .route("/ws", get(ws_handler))
        .merge(game_routes)
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

// ============================================================================
// Health endpoint
// ============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    uptime_secs: u64,
    active_games: usize,
    live_connections: usize,
}

async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        uptime_secs: uptime_secs(),
        active_games: state.registry.active_games(),
        live_connections: state.registry.live_connections(),
    })
}

// ============================================================================
// Game lifecycle endpoints
// ============================================================================

#[derive(Deserialize)]
struct CreateGameRequest {
    player: Player,
}

#[derive(Serialize)]
struct CreateGameResponse {
    game_id: Uuid,
    join_code: String,
}

async fn create_game_handler(
    State(state): State<AppState>,
    Json(req): Json<CreateGameRequest>,
) -> Result<Json<CreateGameResponse>, AppError> {
    let handle = state.registry.create(req.player)?;
    state.registry.persist(&handle).await;

    Ok(Json(CreateGameResponse {
        game_id: handle.id,
        join_code: handle.join_code.clone(),
    }))
}

#[derive(Deserialize)]
struct JoinGameRequest {
    code: String,
    player: Player,
}

#[derive(Serialize)]
struct JoinGameResponse {
    game_id: Uuid,
    snapshot: SessionSnapshot,
}

async fn join_game_handler(
    State(state): State<AppState>,
    Json(req): Json<JoinGameRequest>,
) -> Result<Json<JoinGameResponse>, AppError> {
    let code = req.code.trim();
    let handle = state.registry.resolve_by_code(code).await?;
    let snapshot = handle.reserve(req.player)?;
    state.registry.persist(&handle).await;

    info!(
        game_id = %handle.id,
        player = %req.player,
        "Player slot reserved by code"
    );

    Ok(Json(JoinGameResponse {
        game_id: handle.id,
        snapshot,
    }))
}

async fn snapshot_handler(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<SessionSnapshot>, AppError> {
    let handle = state.registry.resolve_by_id(id).await?;
    Ok(Json(handle.snapshot()))
}

// ============================================================================
// Error handling
// ============================================================================

#[derive(Debug, thiserror::Error)]
#[error(transparent)]
pub struct AppError(#[from] GameError);

impl AppError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            GameError::NotFound => StatusCode::NOT_FOUND,
            GameError::SlotTaken(_) | GameError::GameNotInProgress => StatusCode::CONFLICT,
            GameError::NotYourTurn | GameError::IllegalMove | GameError::Validation(_) => {
                StatusCode::BAD_REQUEST
            }
            GameError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            GameError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        if let GameError::Internal(detail) = &self.0 {
            error!(error = %detail, "Request failed");
        }

        let body = serde_json::json!({
            "error": self.0.client_message(),
            "code": self.0.code(),
        });

        (self.status(), Json(body)).into_response()
    }
}
