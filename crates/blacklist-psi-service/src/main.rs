mod config;

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use axum::extract::{DefaultBodyLimit, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use blacklist_psi_api::{
    is_validation_error, BlacklistApi, BlacklistStatus, QueryError, QueryRequest, QueryResult,
    ReplaceRequest, API_CONTRACT_VERSION,
};
use blacklist_psi_engine::{MatchError, PsiEngineClient};
use clap::Parser;
use serde::Serialize;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use config::{ConfigOverrides, ServiceConfig};

const SERVICE_CONTRACT_VERSION: &str = "service.v1";

#[derive(Clone)]
struct ServiceState {
    api: BlacklistApi,
    engine: PsiEngineClient,
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
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Clone, Serialize)]
struct ReplaceResponse {
    replaced: usize,
    behavior_events: usize,
    population_version: i64,
}

#[derive(Debug, Parser)]
#[command(name = "blacklist-psi-service")]
#[command(about = "Local HTTP service bridging the blacklist store and the PSI engine")]
struct Args {
    /// TOML config file; defaults apply when it does not exist.
    #[arg(long, env = "BLACKLIST_PSI_CONFIG", default_value = "blacklist-psi.toml")]
    config: PathBuf,
    #[arg(long, env = "BLACKLIST_PSI_DB")]
    db: Option<PathBuf>,
    #[arg(long, env = "BLACKLIST_PSI_BIND")]
    bind: Option<SocketAddr>,
    #[arg(long, env = "BLACKLIST_PSI_ENGINE_HOST")]
    engine_host: Option<String>,
    #[arg(long, env = "BLACKLIST_PSI_ENGINE_PORT")]
    engine_port: Option<u16>,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        (self.status, Json(self)).into_response()
    }
}

impl ServiceState {
    fn error(status: StatusCode, message: impl Into<String>) -> ServiceError {
        ServiceError {
            status,
            service_contract_version: SERVICE_CONTRACT_VERSION,
            error: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> ServiceError {
        Self::error(StatusCode::BAD_REQUEST, message)
    }

    fn internal(message: impl Into<String>) -> ServiceError {
        Self::error(StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}

impl From<QueryError> for ServiceError {
    fn from(err: QueryError) -> Self {
        let status = match &err {
            QueryError::Validation(_) => StatusCode::BAD_REQUEST,
            QueryError::EmptyBlacklist => StatusCode::CONFLICT,
            QueryError::Engine(MatchError::RequestTooLarge { .. }) => StatusCode::PAYLOAD_TOO_LARGE,
            QueryError::Engine(MatchError::DeadlineExceeded { .. }) => StatusCode::GATEWAY_TIMEOUT,
            QueryError::Engine(MatchError::ShutDown { .. }) => StatusCode::SERVICE_UNAVAILABLE,
            QueryError::Engine(_) => StatusCode::BAD_GATEWAY,
            QueryError::Store(_) | QueryError::Interpret(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!(error = %err, "query failed");
        } else {
            warn!(error = %err, "query rejected");
        }
        ServiceState::error(status, err.to_string())
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

fn app(state: ServiceState, body_limit: usize) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/blacklist/status", get(blacklist_status))
        .route("/v1/blacklist/replace", post(blacklist_replace))
        .route("/v1/query", post(query))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
}

fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "blacklist_psi=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .context("failed to install tracing subscriber")
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing()?;
    let args = Args::parse();

    let config = ServiceConfig::load(&args.config)?.with_overrides(ConfigOverrides {
        db: args.db,
        bind: args.bind,
        engine_host: args.engine_host,
        engine_port: args.engine_port,
    });
    config.engine.validate().context("invalid engine configuration")?;

    let api = BlacklistApi::new(config.db.clone());
    api.migrate(false).context("failed to migrate blacklist database")?;

    let engine = PsiEngineClient::connect_lazy(config.engine.clone())?;
    let state = ServiceState { api, engine: engine.clone() };

    let listener = tokio::net::TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("failed to bind {}", config.bind))?;
    info!(
        bind = %config.bind,
        db = %config.db.display(),
        engine = %config.engine.endpoint_uri(),
        "blacklist-psi-service listening"
    );

    axum::serve(listener, app(state, config.body_limit()))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let report = engine.shutdown(config.engine.shutdown_grace()).await;
    info!(drained = report.drained, abandoned_calls = report.abandoned_calls, "engine client released");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "failed to listen for ctrl-c");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                error!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
    info!("shutdown signal received");
}

async fn health() -> Json<ServiceEnvelope<HealthResponse>> {
    Json(envelope(HealthResponse { status: "ok" }))
}

async fn blacklist_status(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<BlacklistStatus>>, ServiceError> {
    let status =
        state.api.blacklist_status().map_err(|err| ServiceState::internal(format!("{err:#}")))?;
    Ok(Json(envelope(status)))
}

async fn blacklist_replace(
    State(state): State<ServiceState>,
    Json(request): Json<ReplaceRequest>,
) -> Result<Json<ServiceEnvelope<ReplaceResponse>>, ServiceError> {
    let api = state.api.clone();
    let summary = tokio::task::spawn_blocking(move || api.replace_blacklist(request))
        .await
        .map_err(|err| ServiceState::internal(format!("replace task failed: {err}")))?
        .map_err(|err| {
            if is_validation_error(&err) {
                ServiceState::bad_request(format!("{err:#}"))
            } else {
                error!(error = %format!("{err:#}"), "blacklist replace failed");
                ServiceState::internal(format!("{err:#}"))
            }
        })?;

    Ok(Json(envelope(ReplaceResponse {
        replaced: summary.replaced,
        behavior_events: summary.behavior_events,
        population_version: summary.population_version,
    })))
}

async fn query(
    State(state): State<ServiceState>,
    Json(request): Json<QueryRequest>,
) -> Result<Json<ServiceEnvelope<QueryResult>>, ServiceError> {
    let result = state.api.query(&state.engine, request).await?;
    Ok(Json(envelope(result)))
}
