use anyhow::Result;

mod session;
mod streaming;
mod toolcall;
#[cfg(test)]
mod tests;

use axum::{
    extract::{Request, State},
    http::{header::AUTHORIZATION, Method, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use tokenflow_common::{
    system_fingerprint, unix_timestamp, ChatCompletionRequest, CompletionRequest, Error,
    ErrorResponse, ModelCard, ModelList,
};
use tokenflow_config::{AppConfig, ConfigLoader};
use tokenflow_runtime::{ActiveRequestRegistry, CancelOutcome, LlamaBackend, ModelBackend};
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use session::SessionContext;

#[derive(Clone)]
struct AppState {
    ctx: SessionContext,
    config: Arc<AppConfig>,
    started_at: i64,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(err: Error) -> ApiError {
    let status =
        StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(ErrorResponse::from(&err)))
}

async fn chat_completion(
    State(state): State<AppState>,
    Json(request): Json<ChatCompletionRequest>,
) -> Result<Response, ApiError> {
    if request.model != *state.ctx.model_name {
        return Err(api_error(Error::ModelNotFound(request.model.clone())));
    }
    request.validate().map_err(api_error)?;

    let launched = session::launch_chat(&state.ctx, &request)
        .await
        .map_err(api_error)?;

    if request.stream.unwrap_or(false) {
        let (tx, rx) = mpsc::channel(streaming::BUFFER_SIZE);
        let watch = Arc::new(streaming::SenderWatch(tx.clone()));
        tokio::spawn(session::chat_completion_stream(
            state.ctx.clone(),
            request,
            launched,
            watch,
            tx,
        ));
        Ok(streaming::sse_response(rx).into_response())
    } else {
        let response =
            session::chat_completion_full(&state.ctx, &request, launched, &session::NeverDisconnects)
                .await
                .map_err(api_error)?;
        Ok(Json(response).into_response())
    }
}

async fn create_completion(
    State(state): State<AppState>,
    Json(request): Json<CompletionRequest>,
) -> Result<Response, ApiError> {
    let (launched, prompt) = session::launch_completion(&state.ctx, &request)
        .await
        .map_err(api_error)?;

    if request.stream.unwrap_or(false) {
        let (tx, rx) = mpsc::channel(streaming::BUFFER_SIZE);
        let watch = Arc::new(streaming::SenderWatch(tx.clone()));
        tokio::spawn(session::completion_stream(
            state.ctx.clone(),
            request,
            launched,
            prompt,
            watch,
            tx,
        ));
        Ok(streaming::sse_response(rx).into_response())
    } else {
        let response = session::completion_full(
            &state.ctx,
            &request,
            launched,
            prompt,
            &session::NeverDisconnects,
        )
        .await
        .map_err(api_error)?;
        Ok(Json(response).into_response())
    }
}

#[derive(Debug, Deserialize)]
struct CancelRequest {
    request_id: String,
}

async fn cancel_request(
    State(state): State<AppState>,
    Json(body): Json<CancelRequest>,
) -> Response {
    if !state.config.server.admin_endpoints {
        return (
            StatusCode::FORBIDDEN,
            Json(json!({"error": "This API is only available when admin endpoints are enabled"})),
        )
            .into_response();
    }

    match state.ctx.registry.lookup_and_abort(&body.request_id).await {
        CancelOutcome::Cancelled => Json(json!({
            "message": format!("Request {} cancelled successfully", body.request_id)
        }))
        .into_response(),
        CancelOutcome::NotFound => (
            StatusCode::NOT_FOUND,
            Json(json!({
                "error": format!(
                    "Failed to cancel request {}. Request not found or already finished.",
                    body.request_id
                )
            })),
        )
            .into_response(),
        CancelOutcome::Failed(message) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": message})),
        )
            .into_response(),
    }
}

async fn active_requests(State(state): State<AppState>) -> Response {
    if !state.config.server.admin_endpoints {
        return (
            StatusCode::FORBIDDEN,
            Json(json!({"error": "This API is only available when admin endpoints are enabled"})),
        )
            .into_response();
    }

    let ids = state.ctx.registry.list_active().await;
    Json(json!({"active_requests": ids, "count": ids.len()})).into_response()
}

async fn get_models(State(state): State<AppState>) -> Json<ModelList> {
    Json(ModelList {
        object: "list",
        data: vec![ModelCard::new(&state.ctx.model_name, state.started_at)],
    })
}

async fn health_check() -> Json<serde_json::Value> {
    Json(json!({"status": "healthy"}))
}

async fn version() -> Json<serde_json::Value> {
    Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "engine": "tokenflow"
    }))
}

/// Bearer-token gate for `/v1/*` routes, active only when an api key is
/// configured. OPTIONS passes through for CORS preflight.
async fn require_api_key(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let Some(api_key) = &state.config.server.api_key else {
        return next.run(request).await;
    };
    if request.method() == Method::OPTIONS || !request.uri().path().starts_with("/v1") {
        return next.run(request).await;
    }

    let expected = format!("Bearer {}", api_key);
    let authorized = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        == Some(expected.as_str());

    if !authorized {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "Unauthorized"})),
        )
            .into_response();
    }
    next.run(request).await
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    info!("Starting tokenflow API server");

    // Load configuration
    let config = ConfigLoader::load(None)?;

    // Connect the generation backend and the process-wide registry
    let backend: Arc<dyn ModelBackend> = Arc::new(LlamaBackend::new(&config.backend)?);
    let registry = ActiveRequestRegistry::new(backend.clone());

    let ctx = SessionContext {
        backend,
        registry,
        http: reqwest::Client::new(),
        model_name: Arc::from(config.model.name.as_str()),
        fingerprint: Arc::from(system_fingerprint().as_str()),
        request_counter: Arc::new(AtomicU64::new(0)),
        tool_parser_override: config.model.tool_parser.clone(),
        log_prompt_input: config.model.log_prompt_input,
    };
    let state = AppState {
        ctx,
        config: Arc::new(config),
        started_at: unix_timestamp(),
    };

    let app = Router::new()
        .route("/v1/chat/completions", post(chat_completion))
        .route("/v1/completions", post(create_completion))
        .route("/v1/models", get(get_models))
        .route("/v1/cancel", post(cancel_request))
        .route("/v1/active_requests", get(active_requests))
        .route("/health", get(health_check))
        .route("/v1/health", get(health_check))
        .route("/version", get(version))
        .layer(middleware::from_fn_with_state(state.clone(), require_api_key))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state.clone());

    let addr: SocketAddr =
        format!("{}:{}", state.config.server.host, state.config.server.port).parse()?;
    info!("Listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
