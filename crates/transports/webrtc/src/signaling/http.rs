//! Axum router for the signaling endpoint
//!
//! - POST /offer - Offer/answer exchange
//! - GET / - Browser client page
//! - GET /client.js - Browser client script
//! - GET /test - Liveness probe
//! - GET /health - Health check with live session count

use super::service::{SessionDescription, SignalingService};
use crate::Error;
use axum::{
    extract::{rejection::JsonRejection, State},
    http::{header, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;

const INDEX_HTML: &str = include_str!("../../assets/index.html");
const CLIENT_JS: &str = include_str!("../../assets/client.js");

/// Build the signaling router
pub fn router(service: Arc<SignalingService>) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/client.js", get(client_js_handler))
        .route("/offer", post(offer_handler))
        .route("/test", get(test_handler))
        .route("/health", get(health_handler))
        .with_state(service)
        .layer(
            tower::ServiceBuilder::new()
                .layer(tower_http::trace::TraceLayer::new_for_http())
                .layer(tower_http::cors::CorsLayer::permissive()),
        )
}

/// Error response body
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Machine-readable error code (e.g. "negotiation_failed")
    pub error: String,
    /// Human-readable error message
    pub message: String,
}

/// Error returned by a handler
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    body: ErrorResponse,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        let status = match &e {
            Error::Negotiation(_) => StatusCode::BAD_REQUEST,
            Error::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            body: ErrorResponse {
                error: e.code().to_string(),
                message: e.to_string(),
            },
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            body: ErrorResponse {
                error: "invalid_request".to_string(),
                message: rejection.body_text(),
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

async fn index_handler() -> Html<&'static str> {
    Html(INDEX_HTML)
}

async fn client_js_handler() -> impl IntoResponse {
    ([(header::CONTENT_TYPE, "application/javascript")], CLIENT_JS)
}

async fn offer_handler(
    State(service): State<Arc<SignalingService>>,
    payload: Result<Json<SessionDescription>, JsonRejection>,
) -> Result<Json<SessionDescription>, ApiError> {
    let Json(offer) = payload?;
    match service.handle_offer(offer).await {
        Ok(answer) => Ok(Json(answer)),
        Err(e) => {
            warn!("Offer rejected: {}", e);
            Err(e.into())
        }
    }
}

async fn test_handler() -> &'static str {
    "Test successful"
}

/// Health check response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub sessions: usize,
}

async fn health_handler(State(service): State<Arc<SignalingService>>) -> Json<HealthResponse> {
    let status = if service.registry().is_closing() {
        "shutting_down"
    } else {
        "ok"
    };
    Json(HealthResponse {
        status: status.to_string(),
        sessions: service.registry().len(),
    })
}
