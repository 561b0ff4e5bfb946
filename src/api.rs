//! Admin HTTP surface: health probe, policy read, policy apply. All
//! mutation funnels into the policy store, so handlers need no locking of
//! their own.

use crate::policy::{PolicyDocument, PolicyStore};
use crate::telemetry::Metrics;
use axum::body::Bytes;
use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub struct AppState {
    pub store: Arc<PolicyStore>,
    pub metrics: Arc<Metrics>,
    /// Shared secret for the gated endpoints; `None` disables the check.
    pub token: Option<String>,
}

pub fn router(state: Arc<AppState>) -> Router {
    let protected = Router::new()
        .route("/policy", get(get_policy))
        .route("/apply", post(apply_policy))
        .route_layer(middleware::from_fn_with_state(state.clone(), token_auth));

    Router::new()
        .route("/healthz", get(healthz))
        .merge(protected)
        .with_state(state)
}

/// Run the server until the shutdown token fires, then drain in-flight
/// requests.
pub async fn serve(
    addr: SocketAddr,
    state: Arc<AppState>,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("admin API listening on {}", addr);
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

/// Byte-wise `X-API-Token` comparison; no token configured means open.
async fn token_auth(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let Some(ref token) = state.token else {
        return next.run(request).await;
    };

    let presented = request.headers().get("X-API-Token").map(|v| v.as_bytes());
    if presented == Some(token.as_bytes()) {
        next.run(request).await
    } else {
        (StatusCode::UNAUTHORIZED, "unauthorized").into_response()
    }
}

async fn healthz() -> &'static str {
    "ok"
}

async fn get_policy(State(state): State<Arc<AppState>>) -> Json<PolicyDocument> {
    Json(state.store.get())
}

async fn apply_policy(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    let doc: PolicyDocument = match serde_json::from_slice(&body) {
        Ok(doc) => doc,
        Err(err) => {
            warn!("rejected policy apply: {}", err);
            return (StatusCode::BAD_REQUEST, "invalid json").into_response();
        }
    };

    match state.store.set(doc) {
        Ok(()) => {
            state.metrics.record_policy_update();
            info!("policy applied");
            (StatusCode::OK, "ok").into_response()
        }
        Err(err) => {
            error!("set policy error: {}", err);
            (StatusCode::INTERNAL_SERVER_ERROR, "set policy failed").into_response()
        }
    }
}
