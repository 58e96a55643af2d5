use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Result;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use clap::Parser;
use record_ledger_api::RecordLedgerApi;
use record_ledger_core::{AttributeDelta, LedgerError, Record, RecordId, UnversionedRecord};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

const OPENAPI_YAML: &str = include_str!("../../../openapi/openapi.yaml");

#[derive(Debug, Clone)]
struct ServiceState {
    api: RecordLedgerApi,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceError {
    #[serde(skip)]
    status: StatusCode,
    error: String,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    ok: bool,
}

#[derive(Debug, Clone, Deserialize)]
struct AsOfQuery {
    at: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
struct EffectiveQuery {
    effective: Option<i64>,
}

#[derive(Debug, Parser)]
#[command(name = "record-ledger-service")]
#[command(about = "HTTP service for the record ledger")]
struct Args {
    #[arg(long, default_value = "./record_ledger.sqlite3")]
    db: PathBuf,
    #[arg(long, default_value = "127.0.0.1:8000")]
    bind: SocketAddr,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status;
        (status, Json(self)).into_response()
    }
}

impl From<LedgerError> for ServiceError {
    fn from(err: LedgerError) -> Self {
        let status = match &err {
            LedgerError::InvalidId { .. }
            | LedgerError::InvalidVersion { .. }
            | LedgerError::DuplicateTimestamp { .. }
            | LedgerError::EmptyUpdate => StatusCode::BAD_REQUEST,
            LedgerError::NotFound { .. } => StatusCode::NOT_FOUND,
            LedgerError::AlreadyExists { .. } => StatusCode::CONFLICT,
            LedgerError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if status == StatusCode::INTERNAL_SERVER_ERROR {
            // Storage details stay in the logs, not in client responses.
            tracing::error!(error = %err, "request failed");
            return Self { status, error: "internal server error".to_string() };
        }
        Self { status, error: err.to_string() }
    }
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/api/v1/health", get(health))
        .route("/api/v1/openapi", get(openapi))
        .route("/api/v1/records/:id", get(get_record_v1).post(post_record_v1))
        .route("/api/v2/records/:id", get(get_record_v2).post(post_record_v2))
        .route("/api/v2/records/:id/versions", get(get_record_versions))
        .route("/api/v2/records/:id/version/:version", get(get_record_version))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args = Args::parse();
    let state = ServiceState { api: RecordLedgerApi::new(args.db) };
    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    tracing::info!(address = %args.bind, "listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { ok: true })
}

async fn openapi() -> impl IntoResponse {
    (StatusCode::OK, [("content-type", "application/yaml; charset=utf-8")], OPENAPI_YAML)
}

async fn get_record_v1(
    State(state): State<ServiceState>,
    Path(id): Path<i64>,
) -> Result<Json<UnversionedRecord>, ServiceError> {
    let id = RecordId::new(id)?;
    let record = state.api.get_record(id)?;
    Ok(Json(record.into_unversioned()))
}

// The v1 write path: effective time is always "now", so successive calls are
// chronologically ascending and never cascade.
async fn post_record_v1(
    State(state): State<ServiceState>,
    Path(id): Path<i64>,
    Json(delta): Json<AttributeDelta>,
) -> Result<Json<UnversionedRecord>, ServiceError> {
    let id = RecordId::new(id)?;
    let record = state.api.upsert(id, None, &delta)?;
    Ok(Json(record.into_unversioned()))
}

async fn get_record_v2(
    State(state): State<ServiceState>,
    Path(id): Path<i64>,
    Query(query): Query<AsOfQuery>,
) -> Result<Json<Record>, ServiceError> {
    let id = RecordId::new(id)?;
    let record = match query.at {
        Some(at) => state.api.get_record_at(id, at)?,
        None => state.api.get_record(id)?,
    };
    Ok(Json(record))
}

async fn post_record_v2(
    State(state): State<ServiceState>,
    Path(id): Path<i64>,
    Query(query): Query<EffectiveQuery>,
    Json(delta): Json<AttributeDelta>,
) -> Result<Json<Record>, ServiceError> {
    let id = RecordId::new(id)?;
    let record = state.api.upsert(id, query.effective, &delta)?;
    Ok(Json(record))
}

async fn get_record_versions(
    State(state): State<ServiceState>,
    Path(id): Path<i64>,
) -> Result<Json<Vec<Record>>, ServiceError> {
    let id = RecordId::new(id)?;
    let versions = state.api.get_versions(id)?;
    Ok(Json(versions))
}

async fn get_record_version(
    State(state): State<ServiceState>,
    Path((id, version)): Path<(i64, i64)>,
) -> Result<Json<Record>, ServiceError> {
    let id = RecordId::new(id)?;
    let record = state.api.get_version(id, version)?;
    Ok(Json(record))
}
