/// API сервер пайплайна риска закрытия

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::State,
    http::Method,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};

use closure_risk::{
    pipeline::{MerchantRiskReport, RiskModelSummary},
    FeaturePipeline, LeakageReport, PipelineConfig, PipelineSummary, RawTables, RiskScorer,
};

const DEFAULT_ADDR: &str = "0.0.0.0:8000";

#[derive(Clone)]
struct AppState {
    pipeline: Arc<FeaturePipeline>,
    /// Последний рассчитанный отчёт о риске
    latest_risk: Arc<tokio::sync::Mutex<Option<MerchantRiskReport>>>,
}

#[derive(Serialize)]
struct FeaturesResponse {
    summary: PipelineSummary,
    rows: Vec<serde_json::Map<String, serde_json::Value>>,
}

#[derive(Serialize)]
struct RiskResponse {
    leakage: LeakageReport,
    model: RiskModelSummary,
    risk: MerchantRiskReport,
}

fn load_config() -> anyhow::Result<PipelineConfig> {
    match std::env::var("CLOSURE_RISK_CONFIG") {
        Ok(path) => PipelineConfig::from_json_file(path.as_ref())
            .with_context(|| format!("failed to load config from {path}")),
        Err(_) => Ok(PipelineConfig::default()),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Инициализация логирования
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = load_config()?;
    let state = AppState {
        pipeline: Arc::new(FeaturePipeline::new(config)?),
        latest_risk: Arc::new(tokio::sync::Mutex::new(None)),
    };

    // CORS
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    let app = Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/api/features", post(build_features))
        .route("/api/risk", post(score_risk).get(latest_risk))
        .layer(cors)
        .with_state(state);

    let addr: SocketAddr = std::env::var("CLOSURE_RISK_ADDR")
        .unwrap_or_else(|_| DEFAULT_ADDR.to_string())
        .parse()
        .context("invalid CLOSURE_RISK_ADDR")?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Server listening on http://{}", addr);
    axum::serve(listener, app).await?;
    Ok(())
}

async fn root() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "message": "Closure Risk API (Rust)",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn build_features(
    State(state): State<AppState>,
    Json(tables): Json<RawTables>,
) -> Result<Json<FeaturesResponse>, String> {
    tracing::info!(
        "Features request: {} merchants, {} sales rows, {} customer rows",
        tables.merchants.len(),
        tables.monthly_sales.len(),
        tables.monthly_customers.len()
    );

    let pipeline = state.pipeline.clone();
    let output = tokio::task::spawn_blocking(move || pipeline.run(&tables))
        .await
        .map_err(|e| format!("Pipeline task failed: {}", e))?
        .map_err(|e| format!("Pipeline error: {}", e))?;

    let keys = &state.pipeline.config().keys;
    Ok(Json(FeaturesResponse {
        rows: output.panel.to_records(&keys.merchant, &keys.period),
        summary: output.summary,
    }))
}

async fn score_risk(
    State(state): State<AppState>,
    Json(tables): Json<RawTables>,
) -> Result<Json<RiskResponse>, String> {
    tracing::info!("Risk request: {} merchants", tables.merchants.len());

    let pipeline = state.pipeline.clone();
    let response = tokio::task::spawn_blocking(move || -> Result<RiskResponse, closure_risk::PipelineError> {
        let output = pipeline.run(&tables)?;
        let scorer = RiskScorer::new(pipeline.config());
        let model = scorer.train(&output.panel)?;
        let risk = scorer.score_latest(&output.panel, &model.ensemble)?;
        Ok(RiskResponse {
            leakage: output.summary.leakage,
            model: model.summary,
            risk,
        })
    })
    .await
    .map_err(|e| format!("Risk task failed: {}", e))?
    .map_err(|e| format!("Risk scoring error: {}", e))?;

    *state.latest_risk.lock().await = Some(response.risk.clone());
    Ok(Json(response))
}

async fn latest_risk(State(state): State<AppState>) -> Result<Json<MerchantRiskReport>, String> {
    state
        .latest_risk
        .lock()
        .await
        .clone()
        .map(Json)
        .ok_or_else(|| "No risk report computed yet".to_string())
}
