//! HTTP front end of the sync protocol.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/v1/sync/check` | Root check: `{changed, serverRoot}` |
//! | `POST` | `/v1/sync/phase1` | Hash-only partition: `{needed, cached}` |
//! | `POST` | `/v1/sync/phase2` | Content for needed hashes: `{received, merkleRoot}` |
//! | `POST` | `/v1/index/full` | Both phases at once: `{received, cached, merkleRoot}` |
//! | `GET`  | `/health` | Health check (returns version), unauthenticated |
//!
//! # Authentication
//!
//! Every `/v1` route requires `Authorization: Bearer <credential>`. A
//! middleware verifies it with the configured [`CredentialVerifier`] and
//! attaches the [`CallerIdentity`] as a request extension before any
//! handler runs.
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "invalid_request", "message": "projectId is required" } }
//! ```
//!
//! Error codes: `invalid_request` (400), `unauthorized` (401), `internal` (500).
//! A body that is not valid JSON for the endpoint is an `invalid_request`.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{rejection::JsonRejection, Request, State},
    http::{header::AUTHORIZATION, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Extension, Json, Router,
};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use merkle_sync_core::models::{
    FullIndexResponse, Phase1Request, Phase1Response, Phase2Request, Phase2Response,
    RootCheckRequest, RootCheckResponse,
};
use merkle_sync_core::store::KvStore;
use merkle_sync_core::{AuthError, CallerIdentity, SyncError};

use crate::auth::{bearer_credential, CredentialVerifier};
use crate::cache::{CachePolicy, ContentCache};
use crate::config::Config;
use crate::processing::create_processor;
use crate::sync::SyncService;

/// Shared application state passed to all route handlers via Axum's `State` extractor.
#[derive(Clone)]
pub struct AppState {
    sync: Arc<SyncService>,
    verifier: Arc<dyn CredentialVerifier>,
}

impl AppState {
    pub fn new(sync: SyncService, verifier: Arc<dyn CredentialVerifier>) -> Self {
        Self {
            sync: Arc::new(sync),
            verifier,
        }
    }

    /// Wires a [`SyncService`] from configuration around an opened store.
    pub fn from_config(
        config: &Config,
        kv: Arc<dyn KvStore>,
        verifier: Arc<dyn CredentialVerifier>,
    ) -> anyhow::Result<Self> {
        let cache = ContentCache::new(kv.clone(), CachePolicy::from(&config.cache));
        let processor = create_processor(&config.processing)?;
        let sync = SyncService::new(kv, cache)
            .with_processor(
                processor,
                Duration::from_secs(config.processing.timeout_secs),
            )
            .with_hash_verification(config.server.verify_content_hash);
        Ok(Self::new(sync, verifier))
    }
}

/// Builds the router with all routes and layers attached.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let protected = Router::new()
        .route("/v1/sync/check", post(handle_root_check))
        .route("/v1/sync/phase1", post(handle_phase1))
        .route("/v1/sync/phase2", post(handle_phase2))
        .route("/v1/index/full", post(handle_full_index))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_caller));

    Router::new()
        .merge(protected)
        .route("/health", get(handle_health))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Starts the sync server on `[server].bind` and runs until Ctrl-C.
///
/// The store handle is owned by the caller, which closes it after this
/// returns.
pub async fn run_server(
    config: &Config,
    kv: Arc<dyn KvStore>,
    verifier: Arc<dyn CredentialVerifier>,
) -> anyhow::Result<()> {
    let state = AppState::from_config(config, kv, verifier)?;
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    info!(
        addr = %listener.local_addr()?,
        verify_content_hash = config.server.verify_content_hash,
        processing = %config.processing.provider,
        "sync server listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("sync server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_err() {
        // No signal handler available; run until killed
        std::future::pending::<()>().await;
    }
}

// ============ Error response ============

/// JSON error response body.
#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

/// Inner error detail with a machine-readable code and human-readable message.
#[derive(Serialize)]
struct ErrorDetail {
    /// Machine-readable error code (e.g., `"invalid_request"`).
    code: String,
    /// Human-readable error message.
    message: String,
}

/// Internal error type that converts into an Axum HTTP response.
#[derive(Debug)]
pub struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<SyncError> for AppError {
    fn from(err: SyncError) -> Self {
        match err {
            SyncError::InvalidRequest(message) => AppError {
                status: StatusCode::BAD_REQUEST,
                code: "invalid_request",
                message,
            },
            SyncError::Unauthorized(message) => AppError {
                status: StatusCode::UNAUTHORIZED,
                code: "unauthorized",
                message,
            },
            other => AppError {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                code: "internal",
                message: other.to_string(),
            },
        }
    }
}

impl From<AuthError> for AppError {
    fn from(err: AuthError) -> Self {
        SyncError::from(err).into()
    }
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        SyncError::invalid(rejection.body_text()).into()
    }
}

// ============ Authentication ============

/// Resolves the caller before any `/v1` handler runs.
async fn require_caller(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let header = req
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    let credential = bearer_credential(header)?;
    let caller = state.verifier.verify(credential).await?;
    req.extensions_mut().insert(caller);
    Ok(next.run(req).await)
}

// ============ GET /health ============

/// JSON response body for `GET /health`.
#[derive(Serialize)]
struct HealthResponse {
    /// Always `"ok"` when the server is running.
    status: String,
    /// The crate version from `Cargo.toml`.
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ POST /v1/... ============

async fn handle_root_check(
    State(state): State<AppState>,
    Extension(caller): Extension<CallerIdentity>,
    body: Result<Json<RootCheckRequest>, JsonRejection>,
) -> Result<Json<RootCheckResponse>, AppError> {
    let Json(req) = body?;
    Ok(Json(state.sync.root_check(&caller, &req).await?))
}

async fn handle_phase1(
    State(state): State<AppState>,
    Extension(caller): Extension<CallerIdentity>,
    body: Result<Json<Phase1Request>, JsonRejection>,
) -> Result<Json<Phase1Response>, AppError> {
    let Json(req) = body?;
    Ok(Json(state.sync.phase1(&caller, &req).await?))
}

async fn handle_phase2(
    State(state): State<AppState>,
    Extension(caller): Extension<CallerIdentity>,
    body: Result<Json<Phase2Request>, JsonRejection>,
) -> Result<Json<Phase2Response>, AppError> {
    let Json(req) = body?;
    Ok(Json(state.sync.phase2(&caller, &req).await?))
}

async fn handle_full_index(
    State(state): State<AppState>,
    Extension(caller): Extension<CallerIdentity>,
    body: Result<Json<Phase2Request>, JsonRejection>,
) -> Result<Json<FullIndexResponse>, AppError> {
    let Json(req) = body?;
    Ok(Json(state.sync.full_index(&caller, &req).await?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_mapping() {
        let e: AppError = SyncError::invalid("x").into();
        assert_eq!(e.status, StatusCode::BAD_REQUEST);
        assert_eq!(e.code, "invalid_request");

        let e: AppError = AuthError::Missing.into();
        assert_eq!(e.status, StatusCode::UNAUTHORIZED);

        let e: AppError = SyncError::StorageUnavailable("down".into()).into();
        assert_eq!(e.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(e.code, "internal");
    }
}
