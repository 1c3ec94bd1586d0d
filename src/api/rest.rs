// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// All endpoints live under `/api/v1/`. `GET /api/v1/health` requires no
// authentication; every other route requires a valid Bearer token via the
// `AuthBearer` extractor. Every response is wrapped in the `ApiResponse<T>`
// envelope (§6.1) so callers can branch on `success` without inspecting the
// status code.
//
// CORS is permissive — tighten `allowed_origins` before exposing this outside
// a trusted network.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::api::auth::AuthBearer;
use crate::app_state::AppState;
use crate::boundary::{BoundaryAdapter, SortOrder};
use crate::config::LiveConfigPatch;
use crate::types::{Side, Timeframe};

// =============================================================================
// Response envelope
// =============================================================================

/// `{success, data?, error?, timestamp}` — the uniform shape every endpoint
/// returns (§6.1).
#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: i64,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Self {
        Self { success: true, data: Some(data), error: None, timestamp: Utc::now().timestamp() }
    }

    fn err(message: impl Into<String>) -> Self {
        Self { success: false, data: None, error: Some(message.into()), timestamp: Utc::now().timestamp() }
    }
}

/// Map a subsystem failure to an HTTP status + envelope, classifying through
/// `CoreError` rather than matching on the error's string form (§7).
fn error_response<T: Serialize>(err: anyhow::Error) -> (StatusCode, Json<ApiResponse<T>>) {
    let status = crate::error::classify(&err)
        .map(|e| e.http_status())
        .and_then(|code| StatusCode::from_u16(code).ok())
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    warn!(%err, "request failed");
    (status, Json(ApiResponse::err(err.to_string())))
}

// =============================================================================
// Router construction
// =============================================================================

pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/v1/health", get(health))
        .route("/api/v1/positions", get(get_positions).post(create_position))
        .route("/api/v1/positions/:id", get(get_position))
        .route("/api/v1/positions/:id/close", post(close_position))
        .route("/api/v1/sync", post(sync_positions))
        .route("/api/v1/balance", get(get_balance))
        .route("/api/v1/balance/history", get(get_balance_history))
        .route("/api/v1/rsi", get(get_rsi))
        .route("/api/v1/price", get(get_price))
        .route("/api/v1/config", get(get_config).patch(update_config))
        .layer(cors)
        .with_state(state)
}

// =============================================================================
// Health
// =============================================================================

#[derive(Debug, Serialize)]
struct HealthBody {
    status: &'static str,
    version: u64,
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(ApiResponse::ok(HealthBody {
        status: if state.is_shutting_down() { "shutting_down" } else { "ok" },
        version: state.current_state_version(),
    }))
}

// =============================================================================
// Positions
// =============================================================================

#[derive(Debug, Deserialize)]
struct PositionsQuery {
    limit: Option<usize>,
    #[serde(default)]
    order: SortOrder,
}

async fn get_positions(
    State(state): State<Arc<AppState>>,
    Query(q): Query<PositionsQuery>,
    _auth: AuthBearer,
) -> impl IntoResponse {
    let boundary = BoundaryAdapter::new(state);
    Json(ApiResponse::ok(boundary.get_positions(q.limit, q.order)))
}

async fn get_position(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    _auth: AuthBearer,
) -> impl IntoResponse {
    let boundary = BoundaryAdapter::new(state);
    match boundary.get_position(&id) {
        Some(position) => (StatusCode::OK, Json(ApiResponse::ok(position))).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(ApiResponse::<()>::err(format!("no position with id {id}"))),
        )
            .into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct CreatePositionBody {
    timeframe: String,
    side: String,
    amount: f64,
}

async fn create_position(
    State(state): State<Arc<AppState>>,
    _auth: AuthBearer,
    Json(body): Json<CreatePositionBody>,
) -> impl IntoResponse {
    let Some(tf) = Timeframe::from_str(&body.timeframe) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(ApiResponse::<()>::err(format!("unknown timeframe: {}", body.timeframe))),
        )
            .into_response();
    };
    let side = match body.side.to_uppercase().as_str() {
        "BUY" => Side::Buy,
        "SELL" => Side::Sell,
        other => {
            return (
                StatusCode::BAD_REQUEST,
                Json(ApiResponse::<()>::err(format!("unknown side: {other}"))),
            )
                .into_response();
        }
    };

    let boundary = BoundaryAdapter::new(state);
    match boundary.create_position(tf, side, body.amount).await {
        Ok(position) => {
            info!(id = %position.id, %tf, %side, "position created via API");
            (StatusCode::CREATED, Json(ApiResponse::ok(position))).into_response()
        }
        Err(err) => error_response::<()>(err).into_response(),
    }
}

async fn close_position(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    _auth: AuthBearer,
) -> impl IntoResponse {
    let boundary = BoundaryAdapter::new(state);
    match boundary.close_position(&id).await {
        Ok(outcome) => Json(ApiResponse::ok(outcome)).into_response(),
        Err(err) => error_response::<()>(err).into_response(),
    }
}

async fn sync_positions(State(state): State<Arc<AppState>>, _auth: AuthBearer) -> impl IntoResponse {
    let boundary = BoundaryAdapter::new(state);
    match boundary.sync_positions().await {
        Ok(result) => Json(ApiResponse::ok(result)).into_response(),
        Err(err) => error_response::<()>(err).into_response(),
    }
}

// =============================================================================
// Balance
// =============================================================================

async fn get_balance(State(state): State<Arc<AppState>>, _auth: AuthBearer) -> impl IntoResponse {
    let boundary = BoundaryAdapter::new(state);
    match boundary.get_balance().await {
        Ok(balance) => Json(ApiResponse::ok(balance)).into_response(),
        Err(err) => error_response::<()>(err).into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct BalanceHistoryQuery {
    limit: Option<usize>,
    hours: Option<u32>,
}

async fn get_balance_history(
    State(state): State<Arc<AppState>>,
    Query(q): Query<BalanceHistoryQuery>,
    _auth: AuthBearer,
) -> impl IntoResponse {
    let boundary = BoundaryAdapter::new(state);
    Json(ApiResponse::ok(boundary.get_balance_history(q.limit, q.hours)))
}

// =============================================================================
// Indicators
// =============================================================================

#[derive(Debug, Deserialize)]
struct RsiQuery {
    tf: Option<String>,
}

async fn get_rsi(
    State(state): State<Arc<AppState>>,
    Query(q): Query<RsiQuery>,
    _auth: AuthBearer,
) -> impl IntoResponse {
    let tf = match q.tf.as_deref().map(Timeframe::from_str) {
        Some(None) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(ApiResponse::<()>::err("unknown timeframe".to_string())),
            )
                .into_response();
        }
        Some(Some(tf)) => Some(tf),
        None => None,
    };
    let boundary = BoundaryAdapter::new(state);
    Json(ApiResponse::ok(boundary.get_rsi(tf).await)).into_response()
}

async fn get_price(State(state): State<Arc<AppState>>, _auth: AuthBearer) -> impl IntoResponse {
    let boundary = BoundaryAdapter::new(state);
    match boundary.get_price().await {
        Ok(price) => Json(ApiResponse::ok(price)).into_response(),
        Err(err) => error_response::<()>(err).into_response(),
    }
}

// =============================================================================
// Config
// =============================================================================

async fn get_config(State(state): State<Arc<AppState>>, _auth: AuthBearer) -> impl IntoResponse {
    let boundary = BoundaryAdapter::new(state);
    Json(ApiResponse::ok(boundary.get_config()))
}

async fn update_config(
    State(state): State<Arc<AppState>>,
    _auth: AuthBearer,
    Json(patch): Json<LiveConfigPatch>,
) -> impl IntoResponse {
    let boundary = BoundaryAdapter::new(state);
    match boundary.update_config(patch) {
        Ok(cfg) => Json(ApiResponse::ok(cfg)).into_response(),
        Err(err) => error_response::<()>(err).into_response(),
    }
}
