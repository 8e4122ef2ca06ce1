use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{Context, Result};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::{Args as ClapArgs, Parser};
use identity_kernel_api::{
    IdentifyPolicy, IdentifyResponse, IdentityKernelApi, MigrateResult, API_CONTRACT_VERSION,
    DEFAULT_MAX_CONFLICT_RETRIES, DEFAULT_MAX_UNAVAILABLE_RETRIES, DEFAULT_UNAVAILABLE_BACKOFF_MS,
};
use identity_kernel_core::{
    ConsolidatedContact, ContactId, ContactRecord, IdentifyRequest, IdentityError,
};
use identity_kernel_store_sqlite::{IntegrityReport, SchemaStatus};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const SERVICE_CONTRACT_VERSION: &str = "service.v1";

#[derive(Debug, Clone)]
struct ServiceState {
    api: IdentityKernelApi,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceEnvelope<T>
where
    T: Serialize,
{
    service_contract_version: &'static str,
    api_contract_version: &'static str,
    data: T,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceError {
    #[serde(skip)]
    status: StatusCode,
    service_contract_version: &'static str,
    error: String,
    kind: &'static str,
}

#[derive(Debug, Clone, Deserialize)]
struct MigrateRequest {
    #[serde(default)]
    dry_run: bool,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Clone, Copy, ClapArgs)]
struct RetryArgs {
    #[arg(
        long,
        env = "IDENTITY_KERNEL_MAX_CONFLICT_RETRIES",
        default_value_t = DEFAULT_MAX_CONFLICT_RETRIES
    )]
    max_conflict_retries: u32,
    #[arg(
        long,
        env = "IDENTITY_KERNEL_MAX_UNAVAILABLE_RETRIES",
        default_value_t = DEFAULT_MAX_UNAVAILABLE_RETRIES
    )]
    max_unavailable_retries: u32,
    #[arg(
        long,
        env = "IDENTITY_KERNEL_UNAVAILABLE_BACKOFF_MS",
        default_value_t = DEFAULT_UNAVAILABLE_BACKOFF_MS
    )]
    unavailable_backoff_ms: u64,
}

impl From<RetryArgs> for IdentifyPolicy {
    fn from(args: RetryArgs) -> Self {
        Self {
            max_conflict_retries: args.max_conflict_retries,
            max_unavailable_retries: args.max_unavailable_retries,
            unavailable_backoff_ms: args.unavailable_backoff_ms,
        }
    }
}

#[derive(Debug, Parser)]
#[command(name = "identity-kernel-service")]
#[command(about = "Local HTTP service for contact identity reconciliation")]
struct Args {
    #[arg(long, env = "IDENTITY_KERNEL_DB", default_value = "./identity_kernel.sqlite3")]
    db: PathBuf,
    #[arg(long, env = "IDENTITY_KERNEL_BIND", default_value = "127.0.0.1:4010")]
    bind: SocketAddr,
    #[command(flatten)]
    retry: RetryArgs,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        (self.status, Json(self)).into_response()
    }
}

impl ServiceError {
    fn new(status: StatusCode, kind: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            service_contract_version: SERVICE_CONTRACT_VERSION,
            error: message.into(),
            kind,
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "not_found", message)
    }

    fn from_identity(err: &IdentityError) -> Self {
        let status = match err {
            IdentityError::Validation(_) => StatusCode::BAD_REQUEST,
            IdentityError::Conflict(_) => StatusCode::CONFLICT,
            IdentityError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            IdentityError::Store(_) | IdentityError::Invariant(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        Self::new(status, err.kind(), err.to_string())
    }

    fn from_api(err: &anyhow::Error) -> Self {
        match err.chain().find_map(|cause| cause.downcast_ref::<IdentityError>()) {
            Some(identity) => Self::from_identity(identity),
            None => Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", format!("{err:#}")),
        }
    }
}

fn envelope<T>(data: T) -> ServiceEnvelope<T>
where
    T: Serialize,
{
    ServiceEnvelope {
        service_contract_version: SERVICE_CONTRACT_VERSION,
        api_contract_version: API_CONTRACT_VERSION,
        data,
    }
}

/// Run one API call on the blocking pool; every call opens its own `SQLite` connection.
async fn call_api<T, F>(state: &ServiceState, op: F) -> Result<T, ServiceError>
where
    T: Send + 'static,
    F: FnOnce(&IdentityKernelApi) -> Result<T> + Send + 'static,
{
    let api = state.api.clone();
    match tokio::task::spawn_blocking(move || op(&api)).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => {
            let service_error = ServiceError::from_api(&err);
            if service_error.status.is_server_error() {
                warn!(kind = service_error.kind, error = %service_error.error, "api call failed");
            }
            Err(service_error)
        }
        Err(err) => Err(ServiceError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal",
            format!("api task failed: {err}"),
        )),
    }
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/db/schema-version", post(db_schema_version))
        .route("/v1/db/migrate", post(db_migrate))
        .route("/v1/db/integrity", get(db_integrity))
        .route("/v1/identify", post(identify))
        .route("/identify", post(identify).get(contacts_list))
        .route("/v1/contacts", get(contacts_list))
        .route("/v1/contacts/:contact_id", get(contact_show))
        .with_state(state)
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("identity_kernel_service=info,identity_kernel_api=info")
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(%err, "failed to listen for shutdown signal");
        return;
    }
    info!("shutdown signal received");
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();
    let api = IdentityKernelApi::new(args.db.clone()).with_policy(args.retry.into());

    let migrated = api
        .migrate(false)
        .with_context(|| format!("failed to migrate contact store at {}", args.db.display()))?;
    info!(
        db = %args.db.display(),
        schema_version = ?migrated.after_version,
        policy = ?api.policy(),
        "contact store ready"
    );

    let state = ServiceState { api };
    let listener = tokio::net::TcpListener::bind(args.bind)
        .await
        .with_context(|| format!("failed to bind {}", args.bind))?;
    info!(bind = %args.bind, "identity kernel service listening");

    axum::serve(listener, app(state)).with_graceful_shutdown(shutdown_signal()).await?;
    Ok(())
}

async fn health() -> Json<ServiceEnvelope<HealthResponse>> {
    Json(envelope(HealthResponse { status: "ok" }))
}

async fn db_schema_version(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<SchemaStatus>>, ServiceError> {
    let status = call_api(&state, IdentityKernelApi::schema_status).await?;
    Ok(Json(envelope(status)))
}

async fn db_migrate(
    State(state): State<ServiceState>,
    Json(request): Json<MigrateRequest>,
) -> Result<Json<ServiceEnvelope<MigrateResult>>, ServiceError> {
    let result = call_api(&state, move |api| api.migrate(request.dry_run)).await?;
    Ok(Json(envelope(result)))
}

async fn db_integrity(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<IntegrityReport>>, ServiceError> {
    let report = call_api(&state, IdentityKernelApi::integrity_check).await?;
    Ok(Json(envelope(report)))
}

async fn identify(
    State(state): State<ServiceState>,
    Json(request): Json<IdentifyRequest>,
) -> Result<Json<ServiceEnvelope<IdentifyResponse>>, ServiceError> {
    let response = call_api(&state, move |api| api.identify(&request)).await?;
    info!(
        outcome = response.outcome.as_str(),
        primary_contact_id = %response.contact.primary_contact_id,
        "identify request served"
    );
    Ok(Json(envelope(response)))
}

async fn contacts_list(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<Vec<ContactRecord>>>, ServiceError> {
    let contacts = call_api(&state, IdentityKernelApi::list_contacts).await?;
    Ok(Json(envelope(contacts)))
}

async fn contact_show(
    State(state): State<ServiceState>,
    Path(contact_id): Path<String>,
) -> Result<Json<ServiceEnvelope<ConsolidatedContact>>, ServiceError> {
    let contact_id =
        ContactId::from_str(&contact_id).map_err(|err| ServiceError::from_identity(&err))?;
    match call_api(&state, move |api| api.show_contact(contact_id)).await? {
        Some(contact) => Ok(Json(envelope(contact))),
        None => Err(ServiceError::not_found(format!("unknown contact {contact_id}"))),
    }
}
