use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Json, Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use hyvid_core::{ErrorClass, GenerateResult, Orchestrator, ServiceError};
use serde::Serialize;
use serde_json::Value;

mod backend;
mod config;
mod ffmpeg;

pub use backend::{SubprocessFactory, SubprocessPipeline};
pub use config::Args;
pub use ffmpeg::FfmpegWriter;

// Application state shared by every handler.
#[derive(Clone)]
struct AppState(Arc<Orchestrator>);

#[derive(Serialize)]
struct GenerateResponse {
    result: GenerateResult,
}

#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    retryable: Option<bool>,
}

impl ErrorBody {
    fn bare(error: &'static str) -> Self {
        Self {
            error,
            message: None,
            retryable: None,
        }
    }
}

pub fn app(orchestrator: Arc<Orchestrator>) -> Router {
    Router::new()
        .route("/health", get(health_handler).fallback(not_found))
        .route("/generate", post(generate_handler).fallback(not_found))
        .fallback(not_found)
        .layer(middleware::from_fn(log_request))
        .with_state(AppState(orchestrator))
}

/// One line per handled request: method, path, status.
async fn log_request(req: Request, next: Next) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_owned();
    let response = next.run(req).await;
    log::info!("{method} {path} {}", response.status().as_u16());
    response
}

async fn health_handler(State(state): State<AppState>) -> Response {
    let report = state.0.health();
    let status = if report.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(report)).into_response()
}

/// Normalizes the payload and runs the job on a blocking worker; the pipeline
/// run holds that thread for as long as generation takes.
async fn generate_handler(State(state): State<AppState>, body: Bytes) -> Response {
    let payload: Value = if body.is_empty() {
        Value::Object(Default::default())
    } else {
        match serde_json::from_slice(&body) {
            Ok(payload) => payload,
            Err(e) => {
                log::debug!("rejecting malformed body: {e}");
                return (StatusCode::BAD_REQUEST, Json(ErrorBody::bare("invalid_json")))
                    .into_response();
            }
        }
    };

    let orchestrator = Arc::clone(&state.0);
    let outcome = tokio::task::spawn_blocking(move || -> hyvid_core::Result<GenerateResult> {
        let req = orchestrator.normalize(&payload)?;
        let id = req.render_request_id.clone();
        let progress = move |pct: u8, phase: &str| log::info!("request {id}: {pct}% {phase}");
        orchestrator.execute(&req, Some(&progress))
    })
    .await;

    match outcome {
        Ok(Ok(result)) => Json(GenerateResponse { result }).into_response(),
        Ok(Err(err)) => error_response(err),
        Err(join_error) => error_response(ServiceError::Internal(anyhow::anyhow!(
            "generation worker failed: {join_error}"
        ))),
    }
}

fn error_response(err: ServiceError) -> Response {
    let (status, body) = match err.class() {
        ErrorClass::Validation => (
            StatusCode::BAD_REQUEST,
            ErrorBody {
                error: "validation",
                message: Some(err.to_string()),
                retryable: None,
            },
        ),
        ErrorClass::Service => {
            log::warn!("generation failed (retryable={}): {err}", err.retryable());
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorBody {
                    error: "service",
                    message: Some(err.to_string()),
                    retryable: Some(err.retryable()),
                },
            )
        }
        ErrorClass::Internal => {
            // the full chain stays in the log, the caller sees the outer context
            log::error!("unhandled error: {err:?}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorBody {
                    error: "internal",
                    message: Some(err.to_string()),
                    retryable: None,
                },
            )
        }
    };
    (status, Json(body)).into_response()
}

async fn not_found() -> Response {
    (StatusCode::NOT_FOUND, Json(ErrorBody::bare("not_found"))).into_response()
}
