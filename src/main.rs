mod config;
mod dedupe;
mod feedback;
mod grading;
mod http;
mod jobs;
mod llm;
mod metrics;
mod models;
mod normalize;
mod pipeline;
mod prompt;
mod runs;
mod security;
mod sources;
mod store;
#[cfg(test)]
mod testing;

use axum::{
    Json, Router,
    extract::{Extension, Path, State},
    http::{HeaderMap, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use eyre::{WrapErr, eyre};
use jobs::{ControlError, RunController, RunStatusView};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use models::{ApiError, Run, Stats};
use pipeline::{AdhocGrade, Pipeline, PipelineError, PipelineErrorKind, RunRequest};
use prompt::InstructionBlock;
use security::{AuthContext, AuthState, require_api_auth};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::{net::SocketAddr, sync::Arc};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt};
use uuid::Uuid;

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    if let Err(err) = run().await {
        error!(target = "grader.api", "server crashed: {err:#}");
    }
}

async fn run() -> eyre::Result<()> {
    init_tracing();

    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|err| eyre!("prometheus recorder: {err}"))?;
    let pipeline = Pipeline::from_env();
    info!(
        target = "grader.api",
        batch_size = pipeline.config.batch_size,
        concurrency = pipeline.config.concurrency,
        queries = ?pipeline.config.queries,
        "pipeline configured"
    );
    let state = AppState {
        controller: RunController::new(pipeline.clone()),
        pipeline,
        openapi: Arc::new(load_openapi()),
        prometheus_handle,
    };
    let app = router(state, AuthState::from_env());

    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(8000);
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    info!(target = "grader.api", "listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .wrap_err_with(|| format!("binding {addr}"))?;
    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}

#[derive(Clone)]
struct AppState {
    pipeline: Pipeline,
    controller: RunController,
    openapi: Arc<serde_json::Value>,
    prometheus_handle: PrometheusHandle,
}

fn router(state: AppState, auth_state: AuthState) -> Router {
    let cors = CorsLayer::new()
        .allow_headers(Any)
        .allow_methods(Any)
        .allow_origin(Any);

    let protected = Router::new()
        .route("/runs", post(trigger_run))
        .route("/runs/cancel", post(cancel_run))
        .route("/runs/current", get(current_run))
        .route("/runs/{id}", get(get_run))
        .route("/grade", post(grade_url))
        .route("/stats", get(stats))
        .route("/prompt", get(prompt))
        .route_layer(middleware::from_fn_with_state(auth_state, require_api_auth));

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .route("/openapi.json", get(openapi_json))
        .route("/docs", get(swagger_ui))
        .merge(protected)
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(axum::extract::DefaultBodyLimit::max(body_limit_from_env()))
}

fn load_openapi() -> serde_json::Value {
    serde_yaml::from_str(include_str!("../docs/openapi.yaml"))
        .unwrap_or_else(|_| json!({"openapi": "3.0.3"}))
}

/// Health and readiness check.
///
/// - Method: `GET`
/// - Path: `/health`
/// - Auth: none
async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "service": "listing-grader",
    }))
}

async fn openapi_json(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, AppError> {
    if let Ok(key) = std::env::var("OPENAPI_KEY") {
        let presented = headers
            .get("X-Docs-Key")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if presented != key {
            return Err(AppError::Unauthorized("docs"));
        }
    }
    Ok(Json((*state.openapi).clone()))
}

async fn swagger_ui() -> Response {
    let html = r#"<!doctype html>
<html>
<head>
  <meta charset='utf-8'/>
  <title>Listing Grader API Docs</title>
  <link rel="stylesheet" href="https://unpkg.com/swagger-ui-dist@5/swagger-ui.css" />
</head>
<body>
  <div id="swagger-ui"></div>
  <script src="https://unpkg.com/swagger-ui-dist@5/swagger-ui-bundle.js"></script>
  <script>
    window.onload = () => {
      window.ui = SwaggerUIBundle({ url: '/openapi.json', dom_id: '#swagger-ui' });
    };
  </script>
</body>
</html>"#;
    (
        [(axum::http::header::CONTENT_TYPE, "text/html; charset=utf-8")],
        html,
    )
        .into_response()
}

fn body_limit_from_env() -> usize {
    std::env::var("REQUEST_MAX_BYTES")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(64 * 1024)
}

async fn metrics_endpoint(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Ok(secret) = std::env::var("METRICS_KEY") {
        let presented = headers
            .get("X-Metrics-Key")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if presented != secret {
            return (StatusCode::UNAUTHORIZED, "unauthorized").into_response();
        }
    }
    (
        [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.prometheus_handle.render(),
    )
        .into_response()
}

#[derive(Debug, Default, Deserialize)]
struct TriggerRequest {
    #[serde(default)]
    dry_run: bool,
}

#[derive(Debug, Serialize)]
struct RunAccepted {
    run_id: Uuid,
}

/// Start a scrape-and-grade run in the background.
///
/// - Method: `POST`
/// - Path: `/runs`
/// - Auth: `Authorization: Bearer <key>` or `X-Grader-Key: <key>`
/// - Body: optional `{"dry_run": bool}`
/// - Response: `202 {"run_id"}`, or `409` while another run is active
async fn trigger_run(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    payload: Option<Json<TriggerRequest>>,
) -> Result<(StatusCode, Json<RunAccepted>), AppError> {
    crate::metrics::inc_requests("/runs");
    let Json(payload) = payload.unwrap_or_default();
    info!(
        target = "grader.api",
        actor = %context.actor,
        api_key = %context.api_key_id,
        dry_run = payload.dry_run,
        "run requested"
    );
    let run_id = state
        .controller
        .start(RunRequest {
            dry_run: payload.dry_run,
            triggered_by: Some(context.actor),
        })
        .await?;
    Ok((StatusCode::ACCEPTED, Json(RunAccepted { run_id })))
}

async fn cancel_run(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
) -> Result<Json<RunAccepted>, AppError> {
    crate::metrics::inc_requests("/runs/cancel");
    let run_id = state.controller.cancel().await?;
    info!(target = "grader.api", actor = %context.actor, %run_id, "run cancel requested");
    Ok(Json(RunAccepted { run_id }))
}

async fn current_run(State(state): State<AppState>) -> Result<Json<RunStatusView>, AppError> {
    crate::metrics::inc_requests("/runs/current");
    Ok(Json(state.controller.status().await?))
}

async fn get_run(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Run>, AppError> {
    crate::metrics::inc_requests("/runs/{id}");
    let Ok(run_id) = Uuid::parse_str(&id) else {
        return Err(PipelineError::invalid_input("runs", "invalid_run_id").into());
    };
    Ok(Json(state.controller.run(run_id).await?))
}

#[derive(Debug, Deserialize)]
struct GradeRequest {
    url: String,
    #[serde(default)]
    dry_run: bool,
}

/// Grade a single listing URL outside of any run.
///
/// - Method: `POST`
/// - Path: `/grade`
/// - Body: `{"url": string, "dry_run"?: bool}`
/// - Response: the stored listing and its grade
async fn grade_url(
    State(state): State<AppState>,
    Json(payload): Json<GradeRequest>,
) -> Result<Json<AdhocGrade>, AppError> {
    crate::metrics::inc_requests("/grade");
    let url = payload.url.trim();
    if url.is_empty() {
        return Err(PipelineError::invalid_input("grade_url", "url is required").into());
    }
    Ok(Json(state.pipeline.grade_url(url, payload.dry_run).await?))
}

async fn stats(State(state): State<AppState>) -> Result<Json<Stats>, AppError> {
    crate::metrics::inc_requests("/stats");
    Ok(Json(state.pipeline.stats().await?))
}

/// The instruction block a run started now would send to the model.
async fn prompt(State(state): State<AppState>) -> Result<Json<InstructionBlock>, AppError> {
    crate::metrics::inc_requests("/prompt");
    Ok(Json(state.pipeline.current_instructions().await?))
}

#[derive(Debug)]
enum AppError {
    Pipeline(PipelineError),
    Control(ControlError),
    Unauthorized(&'static str),
}

impl From<PipelineError> for AppError {
    fn from(value: PipelineError) -> Self {
        Self::Pipeline(value)
    }
}

impl From<ControlError> for AppError {
    fn from(value: ControlError) -> Self {
        match value {
            ControlError::Pipeline(err) => Self::Pipeline(err),
            other => Self::Control(other),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, payload) = match self {
            AppError::Pipeline(err) => {
                let status = match err.kind() {
                    PipelineErrorKind::InvalidInput => StatusCode::BAD_REQUEST,
                    PipelineErrorKind::NotFound => StatusCode::NOT_FOUND,
                    PipelineErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
                };
                if status.is_server_error() {
                    error!(target = "grader.api", stage = err.stage(), error = %err.detail(), "request failed");
                }
                (
                    status,
                    ApiError {
                        error: err.stage().to_string(),
                        detail: Some(err.detail().to_string()),
                    },
                )
            }
            AppError::Control(err) => {
                let (status, code) = match &err {
                    ControlError::Conflict => (StatusCode::CONFLICT, "run_in_progress"),
                    ControlError::NoActiveRun => (StatusCode::NOT_FOUND, "no_active_run"),
                    ControlError::Pipeline(_) => {
                        (StatusCode::INTERNAL_SERVER_ERROR, "internal")
                    }
                };
                (
                    status,
                    ApiError {
                        error: code.to_string(),
                        detail: Some(err.to_string()),
                    },
                )
            }
            AppError::Unauthorized(scope) => (
                StatusCode::UNAUTHORIZED,
                ApiError {
                    error: "unauthorized".to_string(),
                    detail: Some(format!("missing or invalid {scope} key")),
                },
            ),
        };
        (status, Json(payload)).into_response()
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug"));
    let _ = fmt().with_env_filter(filter).try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::store::MemoryStore;
    use crate::testing::{ScriptedGrader, StaticSource, scraped, verdict_json};
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use std::time::Duration;
    use tower::ServiceExt;

    const KEY: &str = "s3cret";

    fn app() -> Router {
        let items = (1..=3).map(|i| scraped(&i.to_string(), "Bookshelf")).collect();
        let pipeline = Pipeline::new(
            PipelineConfig {
                queries: vec!["bookshelf".into()],
                ..PipelineConfig::default()
            },
            Arc::new(MemoryStore::default()),
            vec![Arc::new(StaticSource::new(items))],
            Arc::new(ScriptedGrader::always(&verdict_json(72, "B"))),
        );
        let state = AppState {
            controller: RunController::new(pipeline.clone()),
            pipeline,
            openapi: Arc::new(load_openapi()),
            prometheus_handle: PrometheusBuilder::new().build_recorder().handle(),
        };
        router(state, AuthState::from_pairs(&format!("ops:{KEY}")))
    }

    fn authed(method: &str, uri: &str, body: Option<serde_json::Value>) -> Request<Body> {
        let builder = Request::builder()
            .method(method)
            .uri(uri)
            .header("authorization", format!("Bearer {KEY}"));
        match body {
            Some(value) => builder
                .header("content-type", "application/json")
                .body(Body::from(value.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    async fn send(app: &Router, request: Request<Body>) -> (StatusCode, serde_json::Value) {
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn health_is_public_and_api_requires_key() {
        let app = app();
        let (status, body) = send(
            &app,
            Request::get("/health").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["service"], "listing-grader");

        let (status, body) = send(&app, Request::get("/stats").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "missing_api_key");

        let wrong = Request::get("/stats")
            .header(security::API_KEY_HEADER, "nope")
            .body(Body::empty())
            .unwrap();
        let (status, _) = send(&app, wrong).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn triggered_run_is_attributed_and_queryable() {
        let app = app();
        let (status, body) = send(&app, authed("POST", "/runs", None)).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        let run_id = body["run_id"].as_str().expect("run id").to_string();

        let mut finished = None;
        for _ in 0..200 {
            let (status, run) = send(&app, authed("GET", &format!("/runs/{run_id}"), None)).await;
            assert_eq!(status, StatusCode::OK);
            if run["status"] != "running" {
                finished = Some(run);
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let run = finished.expect("run finished");
        assert_eq!(run["status"], "completed");
        assert_eq!(run["triggered_by"], "ops");
        assert_eq!(run["listings_graded"], 3);

        let (status, stats) = send(&app, authed("GET", "/stats", None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(stats["graded"], 3);
    }

    #[tokio::test]
    async fn run_lookups_distinguish_bad_and_unknown_ids() {
        let app = app();
        let (status, _) = send(&app, authed("GET", "/runs/not-a-uuid", None)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, _) = send(&app, authed("GET", &format!("/runs/{}", Uuid::new_v4()), None)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, body) = send(&app, authed("POST", "/runs/cancel", None)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "no_active_run");
    }

    #[tokio::test]
    async fn current_run_reports_idle_before_any_run() {
        let app = app();
        let (status, body) = send(&app, authed("GET", "/runs/current", None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["active"], false);
        assert!(body["run"].is_null());
    }

    #[tokio::test]
    async fn grade_endpoint_validates_url() {
        let app = app();
        let (status, _) = send(
            &app,
            authed("POST", "/grade", Some(json!({"url": "https://example.org/x"}))),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = send(
            &app,
            authed(
                "POST",
                "/grade",
                Some(json!({
                    "url": "https://minneapolis.craigslist.org/fuo/d/item/2.html",
                    "dry_run": true
                })),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["grade"]["score"], 50);
        assert_eq!(body["listing"]["external_id"], "2");
    }

    #[tokio::test]
    async fn prompt_exposes_active_instructions() {
        let app = app();
        let (status, body) = send(&app, authed("GET", "/prompt", None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["version"], "v1");
        assert!(body["text"].as_str().is_some_and(|t| t.contains("Response format")));
    }
}
