//! HTTP API server for thermalcast.

use axum::{
    extract::{Path, State},
    http::{HeaderValue, Method, StatusCode},
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, warn};

use crate::error::Error;
use crate::metrics;
use crate::pipeline::{Point, ReportPipeline, RequestOptions};
use crate::storage::SqliteStorage;

/// Create a sanitized error response for external consumers.
///
/// This logs the full error internally but returns only safe information
/// to external clients to prevent information leakage.
fn external_error_response(e: Error) -> axum::response::Response {
    error!("API error: {:?}", e);

    let status =
        StatusCode::from_u16(e.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let body = Json(e.to_external_json());

    if let Error::RateLimited { retry_after } = &e {
        let retry_secs = retry_after.as_secs().max(1).to_string();
        return (status, [("Retry-After", retry_secs)], body).into_response();
    }
    (status, body).into_response()
}

/// Create CORS layer based on environment configuration.
///
/// - THERMALCAST_CORS_ORIGINS: Comma-separated list of allowed origins (default: http://localhost:3000)
/// - THERMALCAST_CORS_ALLOW_ALL: Set to "true" to allow all origins (NOT recommended for production)
pub fn create_cors_layer() -> CorsLayer {
    let allow_all = std::env::var("THERMALCAST_CORS_ALLOW_ALL")
        .map(|v| v.to_lowercase() == "true")
        .unwrap_or(false);

    if allow_all {
        warn!("CORS configured to allow all origins - this is NOT secure for production!");
        return CorsLayer::very_permissive();
    }

    let origins_str = std::env::var("THERMALCAST_CORS_ORIGINS")
        .unwrap_or_else(|_| "http://localhost:3000".to_string());

    let origins: Vec<HeaderValue> = origins_str
        .split(',')
        .filter_map(|s| {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                return None;
            }
            match trimmed.parse::<HeaderValue>() {
                Ok(hv) => Some(hv),
                Err(e) => {
                    warn!("Invalid CORS origin '{}': {}", trimmed, e);
                    None
                }
            }
        })
        .collect();

    if origins.is_empty() {
        warn!("No valid CORS origins configured, using localhost:3000");
        CorsLayer::new()
            .allow_origin("http://localhost:3000".parse::<HeaderValue>().unwrap())
            .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
            .allow_headers([axum::http::header::CONTENT_TYPE])
    } else {
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
            .allow_headers([axum::http::header::CONTENT_TYPE])
    }
}

/// Default maximum concurrent requests.
const DEFAULT_MAX_CONCURRENT_REQUESTS: usize = 100;

/// Get the maximum concurrent requests limit from environment.
///
/// - THERMALCAST_MAX_CONCURRENT_REQUESTS: Maximum concurrent requests (default: 100)
pub fn get_max_concurrent_requests() -> usize {
    std::env::var("THERMALCAST_MAX_CONCURRENT_REQUESTS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_MAX_CONCURRENT_REQUESTS)
}

/// Create a concurrency limit layer to prevent resource exhaustion.
pub fn create_concurrency_limit() -> tower::limit::ConcurrencyLimitLayer {
    let max = get_max_concurrent_requests();
    tower::limit::ConcurrencyLimitLayer::new(max)
}

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub pipeline: ReportPipeline,
    pub storage: SqliteStorage,
}

/// Create the API router (without state applied - call with_state on the result).
pub fn create_api_routes() -> Router<AppState> {
    Router::new()
        .route("/api/health", get(health_check))
        .route("/api/interpret", post(interpret))
        .route("/api/interpret-route", post(interpret_route))
        .route("/api/interpret-and-email", post(interpret_and_email))
        .route("/api/credits", post(purchase_credits))
        .route("/api/accounts", post(create_account))
        .route("/api/accounts/{id}", get(get_account))
        .route("/api/accounts/{id}/settings", post(update_settings))
        .route("/api/accounts/{id}/transactions", get(list_transactions))
        .route("/api/accounts/{id}/reports", get(list_reports))
        .route("/api/reports/{id}", delete(delete_report))
        .route("/metrics", get(metrics_endpoint))
}

/// Create the complete router with all middleware applied.
pub fn create_router(state: AppState) -> Router {
    create_api_routes()
        .layer(create_concurrency_limit())
        .layer(TraceLayer::new_for_http())
        .layer(create_cors_layer())
        .with_state(state)
}

// ============================================================================
// Health Check
// ============================================================================

async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.storage.check_health().await {
        Ok(health) => Json(json!({
            "status": "ok",
            "foreign_keys_enabled": health.foreign_keys_enabled,
            "integrity_check": health.integrity_check,
            "account_count": health.account_count,
            "journal_mode": health.journal_mode,
            "active_jobs": state.pipeline.job_runner().active_jobs(),
        }))
        .into_response(),
        Err(e) => {
            error!("Health check failed: {:?}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"status": "error", "message": "Health check failed"})),
            )
                .into_response()
        }
    }
}

// ============================================================================
// Interpretation Endpoints
// ============================================================================

#[derive(Deserialize)]
struct InterpretRequest {
    account_id: String,
    lat: f64,
    lon: f64,
    #[serde(default)]
    asl: f64,
    #[serde(flatten)]
    options: RequestOptions,
}

async fn interpret(
    State(state): State<AppState>,
    Json(request): Json<InterpretRequest>,
) -> impl IntoResponse {
    let point = Point {
        lat: request.lat,
        lon: request.lon,
        asl: request.asl,
    };
    match state
        .pipeline
        .interpret_sync(&request.account_id, point, request.options)
        .await
    {
        Ok(outcome) => Json(json!({
            "interpretation": outcome.interpretation,
            "report_id": outcome.report_id,
            "remaining_credits": outcome.remaining_credits,
        }))
        .into_response(),
        Err(e) => external_error_response(e),
    }
}

#[derive(Deserialize)]
struct InterpretRouteRequest {
    account_id: String,
    route: Vec<Point>,
    #[serde(flatten)]
    options: RequestOptions,
}

async fn interpret_route(
    State(state): State<AppState>,
    Json(request): Json<InterpretRouteRequest>,
) -> impl IntoResponse {
    match state
        .pipeline
        .interpret_route(&request.account_id, &request.route, request.options)
        .await
    {
        Ok(outcome) => Json(json!({
            "interpretation": outcome.interpretation,
            "report_id": outcome.report_id,
            "points_analyzed": outcome.points_analyzed,
            "points_charged": outcome.points_charged,
            "remaining_credits": outcome.remaining_credits,
        }))
        .into_response(),
        Err(e) => external_error_response(e),
    }
}

#[derive(Deserialize)]
struct InterpretEmailRequest {
    account_id: String,
    lat: f64,
    lon: f64,
    #[serde(default)]
    asl: f64,
    email: String,
    #[serde(flatten)]
    options: RequestOptions,
}

async fn interpret_and_email(
    State(state): State<AppState>,
    Json(request): Json<InterpretEmailRequest>,
) -> impl IntoResponse {
    let point = Point {
        lat: request.lat,
        lon: request.lon,
        asl: request.asl,
    };
    match state
        .pipeline
        .interpret_async_with_email(&request.account_id, point, &request.email, request.options)
        .await
    {
        Ok(ack) => (
            StatusCode::ACCEPTED,
            Json(json!({
                "message": ack.message,
                "remaining_credits": ack.remaining_credits,
            })),
        )
            .into_response(),
        Err(e) => external_error_response(e),
    }
}

// ============================================================================
// Account and Ledger Endpoints
// ============================================================================

#[derive(Deserialize)]
struct CreateAccountRequest {
    email: String,
}

async fn create_account(
    State(state): State<AppState>,
    Json(request): Json<CreateAccountRequest>,
) -> impl IntoResponse {
    if !request.email.contains('@') {
        return external_error_response(Error::Validation(
            "invalid email address".to_string(),
        ));
    }
    match state.storage.create_account(&request.email).await {
        Ok(account) => (StatusCode::CREATED, Json(account)).into_response(),
        Err(e) => external_error_response(e),
    }
}

async fn get_account(State(state): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    match state.storage.get_account(&id).await {
        Ok(Some(account)) => Json(account).into_response(),
        Ok(None) => external_error_response(Error::AccountNotFound(id)),
        Err(e) => external_error_response(e),
    }
}

#[derive(Deserialize)]
struct SettingsRequest {
    language: String,
    style: String,
    units: String,
}

async fn update_settings(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<SettingsRequest>,
) -> impl IntoResponse {
    match state
        .storage
        .update_account_settings(&id, &request.language, &request.style, &request.units)
        .await
    {
        Ok(()) => Json(json!({"status": "ok"})).into_response(),
        Err(e) => external_error_response(e),
    }
}

#[derive(Deserialize)]
struct PurchaseRequest {
    account_id: String,
    amount: i64,
}

async fn purchase_credits(
    State(state): State<AppState>,
    Json(request): Json<PurchaseRequest>,
) -> impl IntoResponse {
    match state
        .storage
        .purchase_credits(
            &request.account_id,
            request.amount,
            &format!("Purchased {} credits", request.amount),
        )
        .await
    {
        Ok(balance) => Json(json!({"credits": balance})).into_response(),
        Err(e) => external_error_response(e),
    }
}

#[derive(Serialize)]
struct TransactionResponse {
    id: String,
    kind: String,
    amount: i64,
    description: String,
    created_at: String,
}

async fn list_transactions(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.storage.list_transactions(&id).await {
        Ok(entries) => {
            let responses: Vec<TransactionResponse> = entries
                .into_iter()
                .map(|e| TransactionResponse {
                    id: e.id,
                    kind: e.kind.to_string(),
                    amount: e.amount,
                    description: e.description,
                    created_at: e.created_at.to_rfc3339(),
                })
                .collect();
            Json(json!({"transactions": responses})).into_response()
        }
        Err(e) => external_error_response(e),
    }
}

async fn list_reports(State(state): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    match state.storage.list_reports(&id).await {
        Ok(reports) => Json(json!({"reports": reports})).into_response(),
        Err(e) => external_error_response(e),
    }
}

async fn delete_report(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.storage.delete_report(&id).await {
        Ok(()) => Json(json!({"status": "deleted"})).into_response(),
        Err(e) => external_error_response(e),
    }
}

// ============================================================================
// Metrics
// ============================================================================

async fn metrics_endpoint() -> impl IntoResponse {
    (
        [("Content-Type", "text/plain; version=0.0.4")],
        metrics::render_metrics(),
    )
}
