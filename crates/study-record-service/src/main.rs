use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::rejection::{JsonRejection, PathRejection};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, put};
use axum::{Json, Router};
use clap::Parser;
use serde::Serialize;
use serde_json::json;
use study_record_core::{
    NewRecord, Projection, RecordId, RecordList, StoreError, TotalTime, ValidationError,
};
use study_record_store_sqlite::SqliteRecordStore;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

const SERVICE_CONTRACT_VERSION: &str = "study_record_service.v1";

#[derive(Debug, Clone)]
struct ServiceState {
    db: PathBuf,
    operation_timeout: Duration,
    telemetry: Arc<ServiceTelemetry>,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceEnvelope<T>
where
    T: Serialize,
{
    service_contract_version: &'static str,
    data: T,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceError {
    service_contract_version: &'static str,
    error: ServiceErrorPayload,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceErrorPayload {
    code: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<serde_json::Value>,
}

#[derive(Debug, Clone)]
struct ServiceFailure {
    status: StatusCode,
    code: &'static str,
    message: String,
    details: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
    timeout_ms: u64,
    telemetry: ServiceTelemetrySnapshot,
}

#[derive(Debug, Clone, Serialize)]
struct ReadinessResponse {
    status: &'static str,
    schema_version: i64,
}

#[derive(Debug, Default)]
#[allow(clippy::struct_field_names)]
struct ServiceTelemetry {
    requests_total: AtomicU64,
    requests_success_total: AtomicU64,
    requests_failure_total: AtomicU64,
    timeout_total: AtomicU64,
    invalid_json_total: AtomicU64,
    invalid_path_total: AtomicU64,
    validation_error_total: AtomicU64,
    store_error_total: AtomicU64,
    schema_unavailable_total: AtomicU64,
    internal_error_total: AtomicU64,
    other_error_total: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
#[allow(clippy::struct_field_names)]
struct ServiceTelemetrySnapshot {
    requests_total: u64,
    requests_success_total: u64,
    requests_failure_total: u64,
    timeout_total: u64,
    invalid_json_total: u64,
    invalid_path_total: u64,
    validation_error_total: u64,
    store_error_total: u64,
    schema_unavailable_total: u64,
    internal_error_total: u64,
    other_error_total: u64,
}

#[derive(Debug, Parser)]
#[command(name = "study-record-service")]
#[command(about = "Local HTTP service for study records")]
struct Args {
    #[arg(long, default_value = "./study_record.sqlite3")]
    db: PathBuf,
    #[arg(long, default_value = "127.0.0.1:4020")]
    bind: SocketAddr,
    #[arg(long, default_value_t = 2500)]
    operation_timeout_ms: u64,
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl IntoResponse for ServiceFailure {
    fn into_response(self) -> Response {
        let payload = ServiceError {
            service_contract_version: SERVICE_CONTRACT_VERSION,
            error: ServiceErrorPayload {
                code: self.code,
                message: self.message,
                details: self.details,
            },
        };
        (self.status, Json(payload)).into_response()
    }
}

impl ServiceState {
    fn failure(
        status: StatusCode,
        code: &'static str,
        message: impl Into<String>,
        details: Option<serde_json::Value>,
    ) -> ServiceFailure {
        ServiceFailure { status, code, message: message.into(), details }
    }

    fn invalid_json_with_telemetry(&self, rejection: &JsonRejection) -> ServiceFailure {
        self.telemetry.record_failure("invalid_json", false);
        Self::failure(
            rejection.status(),
            "invalid_json",
            rejection.body_text(),
            Some(json!({"rejection": rejection.to_string()})),
        )
    }

    fn invalid_path_with_telemetry(&self, rejection: &PathRejection) -> ServiceFailure {
        self.telemetry.record_failure("invalid_path", false);
        Self::failure(
            StatusCode::BAD_REQUEST,
            "invalid_path",
            rejection.body_text(),
            Some(json!({"rejection": rejection.to_string()})),
        )
    }

    fn validate_with_telemetry(&self, input: &NewRecord) -> Result<(), ServiceFailure> {
        input.validate().map_err(|err: ValidationError| {
            self.telemetry.record_failure("validation_error", false);
            Self::failure(
                StatusCode::BAD_REQUEST,
                "validation_error",
                err.to_string(),
                None,
            )
        })
    }

    fn classify_store_error(
        err: &StoreError,
        default_status: StatusCode,
        default_code: &'static str,
    ) -> ServiceFailure {
        match err {
            StoreError::Timeout { timeout_ms, .. } => Self::failure(
                StatusCode::GATEWAY_TIMEOUT,
                "store_timeout",
                err.to_string(),
                Some(json!({ "timeout_ms": timeout_ms })),
            ),
            StoreError::Backend { message } => {
                Self::failure(default_status, default_code, message.clone(), None)
            }
        }
    }

    fn timeout_ms(&self) -> u64 {
        u64::try_from(self.operation_timeout.as_millis()).unwrap_or(u64::MAX)
    }

    /// Runs `op` against a freshly opened store on the blocking pool.
    ///
    /// Backend failures, including a failed open, are reported with
    /// `default_status` and `default_code`. On timeout the caller gets
    /// `store_timeout`; the blocking task itself is not cancelled.
    async fn run_blocking<T, F>(
        &self,
        default_status: StatusCode,
        default_code: &'static str,
        operation_label: &'static str,
        op: F,
    ) -> Result<T, ServiceFailure>
    where
        T: Send + 'static,
        F: FnOnce(&mut RecordList<SqliteRecordStore>) -> Result<T, StoreError> + Send + 'static,
    {
        self.telemetry.requests_total.fetch_add(1, Ordering::Relaxed);
        let db = self.db.clone();
        let handle = tokio::task::spawn_blocking(move || {
            let store = SqliteRecordStore::open(&db)
                .map_err(|err| StoreError::backend(format!("{err:#}")))?;
            let mut list = RecordList::new(store);
            op(&mut list)
        });

        let join_result =
            tokio::time::timeout(self.operation_timeout, handle).await.map_err(|_| {
                self.telemetry.record_failure("store_timeout", true);
                tracing::warn!(
                    operation = operation_label,
                    timeout_ms = self.timeout_ms(),
                    "store operation timed out"
                );
                Self::classify_store_error(
                    &StoreError::timeout(operation_label, self.timeout_ms()),
                    default_status,
                    default_code,
                )
            })?;

        let op_result = join_result.map_err(|err| {
            self.telemetry.record_failure("internal_error", false);
            Self::failure(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                format!("{operation_label} join failure: {err}"),
                None,
            )
        })?;

        match op_result {
            Ok(value) => {
                self.telemetry.requests_success_total.fetch_add(1, Ordering::Relaxed);
                Ok(value)
            }
            Err(err) => {
                let failure = Self::classify_store_error(&err, default_status, default_code);
                self.telemetry.record_failure(failure.code, err.is_timeout());
                tracing::warn!(
                    operation = operation_label,
                    code = failure.code,
                    error = %err,
                    "store operation failed"
                );
                Err(failure)
            }
        }
    }
}

impl ServiceTelemetry {
    fn record_failure(&self, code: &str, timeout: bool) {
        self.requests_failure_total.fetch_add(1, Ordering::Relaxed);
        if timeout {
            self.timeout_total.fetch_add(1, Ordering::Relaxed);
        }
        match code {
            "invalid_json" => {
                self.invalid_json_total.fetch_add(1, Ordering::Relaxed);
            }
            "validation_error" => {
                self.validation_error_total.fetch_add(1, Ordering::Relaxed);
            }
            "store_error" => {
                self.store_error_total.fetch_add(1, Ordering::Relaxed);
            }
            "invalid_path" => {
                self.invalid_path_total.fetch_add(1, Ordering::Relaxed);
            }
            "schema_unavailable" => {
                self.schema_unavailable_total.fetch_add(1, Ordering::Relaxed);
            }
            "internal_error" => {
                self.internal_error_total.fetch_add(1, Ordering::Relaxed);
            }
            _ => {
                self.other_error_total.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn snapshot(&self) -> ServiceTelemetrySnapshot {
        ServiceTelemetrySnapshot {
            requests_total: self.requests_total.load(Ordering::Relaxed),
            requests_success_total: self.requests_success_total.load(Ordering::Relaxed),
            requests_failure_total: self.requests_failure_total.load(Ordering::Relaxed),
            timeout_total: self.timeout_total.load(Ordering::Relaxed),
            invalid_json_total: self.invalid_json_total.load(Ordering::Relaxed),
            invalid_path_total: self.invalid_path_total.load(Ordering::Relaxed),
            validation_error_total: self.validation_error_total.load(Ordering::Relaxed),
            store_error_total: self.store_error_total.load(Ordering::Relaxed),
            schema_unavailable_total: self.schema_unavailable_total.load(Ordering::Relaxed),
            internal_error_total: self.internal_error_total.load(Ordering::Relaxed),
            other_error_total: self.other_error_total.load(Ordering::Relaxed),
        }
    }
}

fn envelope<T>(data: T) -> ServiceEnvelope<T>
where
    T: Serialize,
{
    ServiceEnvelope { service_contract_version: SERVICE_CONTRACT_VERSION, data }
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/ready", get(ready))
        .route("/v1/records", get(records_list).post(records_create))
        .route("/v1/records/total", get(records_total))
        .route("/v1/records/:id", put(records_update).delete(records_delete))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    SqliteRecordStore::open(&args.db)
        .and_then(|store| store.migrate())
        .with_context(|| format!("failed to prepare record store at {}", args.db.display()))?;

    let state = ServiceState {
        db: args.db,
        operation_timeout: Duration::from_millis(args.operation_timeout_ms),
        telemetry: Arc::new(ServiceTelemetry::default()),
    };
    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    tracing::info!(bind = %args.bind, "study record service listening");
    axum::serve(listener, app(state)).with_graceful_shutdown(shutdown_signal()).await?;
    tracing::info!("study record service stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
    }
}

async fn health(State(state): State<ServiceState>) -> Json<ServiceEnvelope<HealthResponse>> {
    Json(envelope(HealthResponse {
        status: "ok",
        timeout_ms: state.timeout_ms(),
        telemetry: state.telemetry.snapshot(),
    }))
}

async fn ready(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<ReadinessResponse>>, ServiceFailure> {
    let schema_version = state
        .run_blocking(
            StatusCode::SERVICE_UNAVAILABLE,
            "schema_unavailable",
            "schema_version",
            |list| {
                list.store()
                    .schema_version()
                    .map_err(|err| StoreError::backend(format!("{err:#}")))
            },
        )
        .await?;

    if let Some(schema_version) = schema_version {
        return Ok(Json(envelope(ReadinessResponse { status: "ready", schema_version })));
    }

    state.telemetry.record_failure("schema_unavailable", false);
    Err(ServiceState::failure(
        StatusCode::SERVICE_UNAVAILABLE,
        "schema_unavailable",
        "study_record schema has not been migrated",
        None,
    ))
}

async fn records_list(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<Projection>>, ServiceFailure> {
    let projection = state
        .run_blocking(StatusCode::INTERNAL_SERVER_ERROR, "store_error", "get_all_records", |list| {
            list.refresh().cloned()
        })
        .await?;
    Ok(Json(envelope(projection)))
}

async fn records_total(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<TotalTime>>, ServiceFailure> {
    let total = state
        .run_blocking(StatusCode::INTERNAL_SERVER_ERROR, "store_error", "get_all_records", |list| {
            list.refresh().map(Projection::total)
        })
        .await?;
    Ok(Json(envelope(total)))
}

async fn records_create(
    State(state): State<ServiceState>,
    payload: Result<Json<NewRecord>, JsonRejection>,
) -> Result<Json<ServiceEnvelope<Projection>>, ServiceFailure> {
    let Json(request) =
        payload.map_err(|rejection| state.invalid_json_with_telemetry(&rejection))?;
    state.validate_with_telemetry(&request)?;
    let projection = state
        .run_blocking(
            StatusCode::INTERNAL_SERVER_ERROR,
            "store_error",
            "insert_record",
            move |list| list.insert(&request).cloned(),
        )
        .await?;
    Ok(Json(envelope(projection)))
}

async fn records_update(
    State(state): State<ServiceState>,
    path: Result<Path<i64>, PathRejection>,
    payload: Result<Json<NewRecord>, JsonRejection>,
) -> Result<Json<ServiceEnvelope<Projection>>, ServiceFailure> {
    let Path(id) = path.map_err(|rejection| state.invalid_path_with_telemetry(&rejection))?;
    let Json(request) =
        payload.map_err(|rejection| state.invalid_json_with_telemetry(&rejection))?;
    state.validate_with_telemetry(&request)?;
    let projection = state
        .run_blocking(
            StatusCode::INTERNAL_SERVER_ERROR,
            "store_error",
            "update_record",
            move |list| list.update(RecordId(id), &request).cloned(),
        )
        .await?;
    Ok(Json(envelope(projection)))
}

async fn records_delete(
    State(state): State<ServiceState>,
    path: Result<Path<i64>, PathRejection>,
) -> Result<Json<ServiceEnvelope<Projection>>, ServiceFailure> {
    let Path(id) = path.map_err(|rejection| state.invalid_path_with_telemetry(&rejection))?;
    let projection = state
        .run_blocking(
            StatusCode::INTERNAL_SERVER_ERROR,
            "store_error",
            "delete_record",
            move |list| list.delete(RecordId(id)).cloned(),
        )
        .await?;
    Ok(Json(envelope(projection)))
}
