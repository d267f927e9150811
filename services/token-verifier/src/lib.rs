pub mod config;
pub mod error;
pub mod model;
pub mod provider;
pub mod verifier;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::extract::rejection::JsonRejection;
use axum::extract::{connect_info::ConnectInfo, MatchedPath, State};
use axum::http::{header, HeaderValue, Request, StatusCode};
use axum::middleware::{from_fn, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use common_obs::{
    encode_prometheus_metrics, health_router, http_request_observe, SpanExt,
    PROMETHEUS_CONTENT_TYPE,
};
use error::VerifyError;
use model::{VerificationRequest, VerificationResult};
use tracing::{info_span, Instrument};
use uuid::Uuid;
use verifier::TokenVerifier;

pub const SERVICE_NAME: &str = "token-verifier";
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
const REQUEST_ID_HEADER: &str = "x-request-id";
pub const UNMATCHED_ROUTE: &str = "unmatched";

pub struct AppState {
    pub verifier: TokenVerifier,
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/verify", post(verify_token))
        // Path used by the mobile login demo.
        .route("/verifyToken", post(verify_token))
        .route("/metrics", get(metrics))
        .with_state(state)
        .merge(health_router(SERVICE_NAME, VERSION))
        .layer(from_fn(track_http_metrics))
        .layer(from_fn(request_context))
}

async fn verify_token(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<VerificationRequest>, JsonRejection>,
) -> Result<Json<VerificationResult>, VerifyError> {
    let Json(request) = payload?;
    let identity = state.verifier.verify(&request).await?;
    Ok(Json(VerificationResult::valid(identity)))
}

async fn request_context(mut req: Request<Body>, next: Next) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let remote_addr = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.to_string())
        .unwrap_or_else(|| "unknown".to_string());
    let user_agent = req
        .headers()
        .get(header::USER_AGENT)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("unknown")
        .to_string();

    let request_id = match req
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
    {
        Some(value) => value.to_string(),
        None => {
            let id = Uuid::new_v4().to_string();
            if let Ok(value) = HeaderValue::from_str(&id) {
                req.headers_mut().insert(REQUEST_ID_HEADER, value);
            }
            id
        }
    };

    let span = info_span!(
        "http.request",
        method = %method,
        path = %path,
        remote_addr = remote_addr.as_str(),
        request_id = %request_id
    );
    span.with_req(&request_id);

    let start = Instant::now();
    span.in_scope(|| {
        tracing::info!(
            event = "request_start",
            method = %method,
            path = %path,
            user_agent = user_agent.as_str()
        )
    });

    let mut response = next.run(req).instrument(span.clone()).await;

    let latency_ms = start.elapsed().as_secs_f64() * 1000.0;
    span.in_scope(|| {
        tracing::info!(
            event = "request_end",
            method = %method,
            path = %path,
            status = response.status().as_u16(),
            latency_ms
        )
    });

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }

    response
}

async fn track_http_metrics(req: Request<Body>, next: Next) -> Response {
    // Unrouted paths share one label so callers cannot mint new series.
    let route = req
        .extensions()
        .get::<MatchedPath>()
        .map(|matched| matched.as_str().to_string())
        .unwrap_or_else(|| UNMATCHED_ROUTE.to_string());

    let start = Instant::now();
    let response = next.run(req).await;
    let latency = start.elapsed().as_secs_f64();
    let status = response.status().as_u16().to_string();

    http_request_observe!(route.as_str(), status.as_str(), latency);

    response
}

async fn metrics() -> impl IntoResponse {
    (
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            HeaderValue::from_static(PROMETHEUS_CONTENT_TYPE),
        )],
        encode_prometheus_metrics(),
    )
}
