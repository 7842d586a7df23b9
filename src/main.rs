mod autopilot;
mod http;
mod idempotency;
mod jobs;
mod listing;
mod llm;
mod metrics;
mod models;
mod pipeline;
mod supabase;

use autopilot::{
    AutopilotConfig, BatchOrchestrator, BatchReport, InMemoryStore, ProductStore, RunStore,
    store::AutopilotRun,
};
use axum::{
    Json, Router,
    extract::{Path, State},
    http::{HeaderMap, StatusCode, header},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
};
use idempotency::IdempotencyCache;
use listing::attributes::ProductAttributes;
use listing::qc::{self, QcReport};
use listing::voice::{VoiceConfig, VoiceFieldParser};
use llm::{GatewayClient, GatewayConfig, ModelClient};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use models::{
    ApiError, CreateRunRequest, CreateRunResponse, EnqueueResponse, ListingResponse,
    RunStatusRequest, VoiceParseRequest, VoiceParseResponse,
};
use pipeline::{
    GenerationRequest, GeneratorConfig, ListingGenerator, PipelineError, PipelineErrorKind,
};
use serde_json::json;
use std::{net::SocketAddr, sync::Arc};
use supabase::SupabaseClient;
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt};
use uuid::Uuid;

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        error!(target = "relist.api", "server crashed: {err:?}");
    }
}

async fn run() -> eyre::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let prometheus_handle = PrometheusBuilder::new().install_recorder()?;
    let model: Arc<dyn ModelClient> = Arc::new(GatewayClient::new(GatewayConfig::from_env()));
    let generator = ListingGenerator::new(model.clone(), GeneratorConfig::from_env());
    let (products, runs) = stores_from_env();

    let (queue, worker) = jobs::JobQueue::from_env();
    let orchestrator =
        BatchOrchestrator::new(generator.clone(), products, runs, AutopilotConfig::from_env())
            .with_trigger(Arc::new(queue.clone()));
    let _worker = worker.spawn(orchestrator.clone());

    let openapi: serde_json::Value = serde_yaml::from_str(include_str!("../docs/openapi.yaml"))
        .unwrap_or_else(|_| json!({"openapi": "3.0.3"}));
    let state = AppState {
        generator,
        model,
        voice: Arc::new(VoiceConfig::from_env()),
        orchestrator,
        queue,
        idempotency: IdempotencyCache::from_env(),
        openapi: Arc::new(openapi),
        prometheus_handle,
    };

    let app = app(state);

    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(8000);
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    info!(target = "relist.api", "listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}

fn app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_headers(Any)
        .allow_methods(Any)
        .allow_origin(Any);

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .route("/openapi.json", get(openapi_json))
        .route("/docs", get(swagger_ui))
        .route("/listings/generate", post(generate_listing))
        .route("/voice/parse", post(parse_voice))
        .route("/qc/score", post(score_qc))
        .route("/autopilot/runs", post(create_run))
        .route("/autopilot/runs/{id}/status", post(set_run_status))
        .route("/autopilot/runs/{id}/batch", post(run_batch))
        .nest(
            "/jobs",
            Router::new()
                .route("/autopilot/{id}", post(enqueue_batch))
                .route("/{id}", get(get_job_status)),
        )
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors)
                .layer(axum::extract::DefaultBodyLimit::max(body_limit_from_env())),
        )
}

fn stores_from_env() -> (Arc<dyn ProductStore>, Arc<dyn RunStore>) {
    if let Some(client) = SupabaseClient::from_env() {
        info!(target = "relist.api", "using supabase store");
        let client = Arc::new(client);
        return (client.clone(), client);
    }
    warn!(target = "relist.api", "SUPABASE_URL not set; autopilot state is in-memory");
    let memory = Arc::new(InMemoryStore::new());
    (memory.clone(), memory)
}

#[derive(Clone)]
struct AppState {
    generator: ListingGenerator,
    model: Arc<dyn ModelClient>,
    voice: Arc<VoiceConfig>,
    orchestrator: BatchOrchestrator,
    queue: jobs::JobQueue,
    idempotency: IdempotencyCache,
    openapi: Arc<serde_json::Value>,
    prometheus_handle: PrometheusHandle,
}

/// Liveness check. `GET /health`, no auth.
async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "service": "relist-api-rs",
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
            return Err(AppError::Pipeline(PipelineError::invalid_input(
                "docs",
                "unauthorized",
            )));
        }
    }
    Ok(Json((*state.openapi).clone()))
}

async fn swagger_ui() -> Html<&'static str> {
    Html(
        r#"<!doctype html>
<html>
<head>
  <meta charset='utf-8'/>
  <title>Relist API Docs</title>
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
</html>"#,
    )
}

fn body_limit_from_env() -> usize {
    std::env::var("REQUEST_MAX_BYTES")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(256 * 1024)
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
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.prometheus_handle.render(),
    )
        .into_response()
}

/// Generate or partially regenerate a listing.
///
/// - Method: `POST`
/// - Path: `/listings/generate`
/// - Body: `GenerationRequest`
/// - Response: `ListingResponse`; a repeated `Idempotency-Key` replays the
///   first non-degraded response.
async fn generate_listing(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<GenerationRequest>,
) -> Result<Json<ListingResponse>, AppError> {
    crate::metrics::inc_requests("/listings/generate");
    let key = headers
        .get("Idempotency-Key")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());

    if let Some(key) = &key
        && let Some(existing) = state.idempotency.get(key).await
    {
        return Ok(Json(existing));
    }

    let result = state.generator.generate(&payload).await?;
    let degraded = result.report.degraded.is_some();
    let response = ListingResponse::from(result);
    if let Some(key) = &key
        && !degraded
    {
        state.idempotency.set(key, &response).await;
    }
    Ok(Json(response))
}

/// Spoken notes to detected fields; with `attributes` the merged record
/// comes back too.
async fn parse_voice(
    State(state): State<AppState>,
    Json(payload): Json<VoiceParseRequest>,
) -> Result<Json<VoiceParseResponse>, AppError> {
    crate::metrics::inc_requests("/voice/parse");
    let update = VoiceFieldParser::new(state.model.as_ref(), &state.voice)
        .parse(&payload.transcript, payload.condition())
        .await?;
    Ok(Json(VoiceParseResponse::new(update, payload)))
}

async fn score_qc(Json(product): Json<ProductAttributes>) -> Json<QcReport> {
    crate::metrics::inc_requests("/qc/score");
    Json(qc::score(&product))
}

/// Start a run over draft products. Batches are driven through
/// `/jobs/autopilot/{id}` or `/autopilot/runs/{id}/batch`.
async fn create_run(
    State(state): State<AppState>,
    Json(payload): Json<CreateRunRequest>,
) -> Result<Json<CreateRunResponse>, AppError> {
    crate::metrics::inc_requests("/autopilot/runs");
    let products = payload.products.len();
    let run = state
        .orchestrator
        .start_run(payload.batch_size, payload.products)
        .await?;
    Ok(Json(CreateRunResponse {
        run_id: run.id.to_string(),
        products,
    }))
}

async fn set_run_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(payload): Json<RunStatusRequest>,
) -> Result<Json<AutopilotRun>, AppError> {
    crate::metrics::inc_requests("/autopilot/runs/status");
    let run_id = parse_id("autopilot", &id, "invalid_run_id")?;
    let run = state
        .orchestrator
        .set_run_status(run_id, payload.status)
        .await?;
    Ok(Json(run))
}

/// Run one batch step synchronously. Continuations still go through the
/// job queue.
async fn run_batch(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<BatchReport>, AppError> {
    crate::metrics::inc_requests("/autopilot/runs/batch");
    let run_id = parse_id("autopilot", &id, "invalid_run_id")?;
    let report = state.orchestrator.run_batch(run_id).await?;
    Ok(Json(report))
}

async fn enqueue_batch(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<EnqueueResponse>, AppError> {
    crate::metrics::inc_requests("/jobs/autopilot");
    let run_id = parse_id("jobs", &id, "invalid_run_id")?;
    let id = state
        .queue
        .enqueue_batch(run_id)
        .await
        .map_err(|err| AppError::Pipeline(PipelineError::internal("enqueue", err.error)))?;
    Ok(Json(EnqueueResponse {
        job_id: id.to_string(),
    }))
}

async fn get_job_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<jobs::JobInfo>, AppError> {
    let uuid = parse_id("jobs", &id, "invalid_job_id")?;
    match state.queue.get(uuid).await {
        Some(info) => Ok(Json(info)),
        None => Err(AppError::Pipeline(PipelineError::not_found(
            "jobs",
            "job_not_found",
        ))),
    }
}

fn parse_id(stage: &'static str, raw: &str, error: &'static str) -> Result<Uuid, AppError> {
    Uuid::parse_str(raw).map_err(|_| AppError::Pipeline(PipelineError::invalid_input(stage, error)))
}

#[derive(Debug)]
enum AppError {
    Pipeline(PipelineError),
}

impl From<PipelineError> for AppError {
    fn from(value: PipelineError) -> Self {
        Self::Pipeline(value)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::Pipeline(err) => {
                let status = match err.kind() {
                    PipelineErrorKind::InvalidInput => StatusCode::BAD_REQUEST,
                    PipelineErrorKind::NotFound => StatusCode::NOT_FOUND,
                    PipelineErrorKind::QuotaExhausted => StatusCode::PAYMENT_REQUIRED,
                    PipelineErrorKind::RateLimited => StatusCode::TOO_MANY_REQUESTS,
                    PipelineErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
                };
                if status.is_server_error() {
                    error!(
                        target = "relist.api",
                        stage = err.stage(),
                        error = %err,
                        "request_failed"
                    );
                }
                let payload = ApiError {
                    error: error_code(err.kind()).to_string(),
                    detail: Some(err.detail().to_string()),
                };
                (status, Json(payload)).into_response()
            }
        }
    }
}

fn error_code(kind: PipelineErrorKind) -> &'static str {
    match kind {
        PipelineErrorKind::InvalidInput => "invalid_input",
        PipelineErrorKind::NotFound => "not_found",
        PipelineErrorKind::RateLimited => "rate_limited",
        PipelineErrorKind::QuotaExhausted => "quota_exhausted",
        PipelineErrorKind::Internal => "internal",
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
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use llm::scripted::ScriptedModel;
    use std::time::Duration;
    use tower::ServiceExt;

    fn test_state(reply: &str) -> AppState {
        let model: Arc<dyn ModelClient> = Arc::new(ScriptedModel::always(reply));
        let generator = ListingGenerator::new(model.clone(), GeneratorConfig::default());
        let store = Arc::new(InMemoryStore::new());
        let (queue, _worker) = jobs::JobQueue::channel(4, 3, Duration::from_secs(60));
        let orchestrator = BatchOrchestrator::new(
            generator.clone(),
            store.clone(),
            store,
            AutopilotConfig::default(),
        );
        AppState {
            generator,
            model,
            voice: Arc::new(VoiceConfig {
                max_tokens: 500,
                model: None,
            }),
            orchestrator,
            queue,
            idempotency: IdempotencyCache::new(None, Duration::from_secs(60)),
            openapi: Arc::new(json!({})),
            prometheus_handle: PrometheusBuilder::new().build_recorder().handle(),
        }
    }

    async fn post_json(app: &Router, uri: &str, body: serde_json::Value) -> Response {
        let request = Request::post(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .expect("request");
        app.clone().oneshot(request).await.expect("response")
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        serde_json::from_slice(&bytes).expect("json")
    }

    #[tokio::test]
    async fn error_kinds_map_to_status_codes() {
        let cases = [
            (PipelineError::invalid_input("validate", "too_many_images"), 400, "invalid_input"),
            (PipelineError::not_found("run_batch", "run"), 404, "not_found"),
            (PipelineError::internal("autopilot_store", "HTTP 503"), 500, "internal"),
        ];
        for (err, status, code) in cases {
            let response = AppError::from(err).into_response();
            assert_eq!(response.status().as_u16(), status);
            let body = body_json(response).await;
            assert_eq!(body["error"], code);
        }
    }

    #[tokio::test]
    async fn provider_signals_are_distinguishable() {
        let limited = PipelineError::from_model(
            "generate",
            &llm::ModelError::RateLimited {
                retry_after_secs: None,
            },
        );
        assert_eq!(
            AppError::from(limited).into_response().status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        let quota = PipelineError::from_model("generate", &llm::ModelError::QuotaExhausted);
        assert_eq!(
            AppError::from(quota).into_response().status(),
            StatusCode::PAYMENT_REQUIRED
        );
    }

    #[test]
    fn bundled_openapi_document_parses() {
        let doc: serde_json::Value =
            serde_yaml::from_str(include_str!("../docs/openapi.yaml")).expect("yaml");
        for path in ["/listings/generate", "/voice/parse", "/autopilot/runs"] {
            assert!(doc["paths"].get(path).is_some(), "{path} missing");
        }
    }

    #[tokio::test]
    async fn runs_are_started_and_paused_over_http() {
        let app = app(test_state("{}"));
        let created = post_json(
            &app,
            "/autopilot/runs",
            json!({
                "batch_size": 2,
                "products": [{"brand": "Lee", "images": ["https://img.test/a.jpg"]}]
            }),
        )
        .await;
        assert_eq!(created.status(), StatusCode::OK);
        let body = body_json(created).await;
        assert_eq!(body["products"], 1);
        let run_id = body["run_id"].as_str().expect("run id").to_string();

        let paused = post_json(
            &app,
            &format!("/autopilot/runs/{run_id}/status"),
            json!({"status": "paused"}),
        )
        .await;
        assert_eq!(paused.status(), StatusCode::OK);
        assert_eq!(body_json(paused).await["status"], "paused");

        let reserved = post_json(
            &app,
            &format!("/autopilot/runs/{run_id}/status"),
            json!({"status": "awaiting_qc"}),
        )
        .await;
        assert_eq!(reserved.status(), StatusCode::BAD_REQUEST);

        let empty = post_json(&app, "/autopilot/runs", json!({"products": []})).await;
        assert_eq!(body_json(empty).await["detail"], "no_products");
    }

    #[tokio::test]
    async fn voice_parse_returns_the_merged_record() {
        let app = app(test_state(r#"{"brand": "Levi's", "price": 40}"#));
        let response = post_json(
            &app,
            "/voice/parse",
            json!({
                "transcript": "brand levis price forty",
                "attributes": {"garment_type": "Denim Jacket", "brand": "Unknown"}
            }),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["brand"], "Levi's");
        assert_eq!(body["record"]["brand"], "Levi's");
        assert_eq!(body["record"]["garment_type"], "Denim Jacket");
        assert_eq!(body["record"]["price"], 40.0);
        assert_eq!(body["record_style"], "A");
    }
}
