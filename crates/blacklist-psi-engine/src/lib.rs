use std::fmt::{Display, Formatter};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context};
use blacklist_psi_core::SrvData;
use prost::Message;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tonic::transport::{Channel, Endpoint};
use tonic::{Code, Status};
use tracing::Instrument;
use ulid::Ulid;

#[allow(clippy::all, clippy::pedantic)]
pub mod proto {
    tonic::include_proto!("psi");
}

use proto::psi_service_client::PsiServiceClient;
use proto::{LabelsType, MatchRequest};

pub const DEFAULT_ENGINE_HOST: &str = "127.0.0.1";
pub const DEFAULT_ENGINE_PORT: u16 = 50051;
/// 100 MiB, applied to both directions.
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 100 * 1024 * 1024;
pub const DEFAULT_CALL_DEADLINE_SECS: u64 = 180;
pub const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 5;
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    pub host: String,
    pub port: u16,
    pub max_message_bytes: usize,
    pub call_deadline_secs: u64,
    pub shutdown_grace_secs: u64,
    pub connect_timeout_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_ENGINE_HOST.to_string(),
            port: DEFAULT_ENGINE_PORT,
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
            call_deadline_secs: DEFAULT_CALL_DEADLINE_SECS,
            shutdown_grace_secs: DEFAULT_SHUTDOWN_GRACE_SECS,
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
        }
    }
}

impl EngineConfig {
    #[must_use]
    pub fn endpoint_uri(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    #[must_use]
    pub fn call_deadline(&self) -> Duration {
        Duration::from_secs(self.call_deadline_secs)
    }

    #[must_use]
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    /// Reject configurations the transport cannot honor.
    ///
    /// # Errors
    /// Returns an error when the host is blank or any limit is zero.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.host.trim().is_empty() {
            return Err(anyhow!("engine host MUST be non-empty"));
        }
        if self.port == 0 {
            return Err(anyhow!("engine port MUST be non-zero"));
        }
        if self.max_message_bytes == 0 {
            return Err(anyhow!("max_message_bytes MUST be > 0"));
        }
        if self.call_deadline_secs == 0 {
            return Err(anyhow!("call_deadline_secs MUST be > 0"));
        }
        Ok(())
    }
}

/// Sizes recorded for one match attempt, attached to every failure.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct MatchDiagnostics {
    pub entries: usize,
    pub total_labels: usize,
    pub payload_bytes: usize,
    pub context_bytes: usize,
    pub request_bytes: usize,
}

impl Display for MatchDiagnostics {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "entries={} total_labels={} payload_bytes={} context_bytes={} request_bytes={}",
            self.entries, self.total_labels, self.payload_bytes, self.context_bytes, self.request_bytes
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MatchError {
    #[error("match request of {} bytes exceeds the {limit}-byte ceiling [{diagnostics}]", .diagnostics.request_bytes)]
    RequestTooLarge { limit: usize, diagnostics: MatchDiagnostics },
    #[error("match call exceeded its {deadline:?} deadline [{diagnostics}]")]
    DeadlineExceeded { deadline: Duration, diagnostics: MatchDiagnostics },
    #[error("PSI engine unreachable: {message} [{diagnostics}]")]
    Transport { message: String, diagnostics: MatchDiagnostics },
    #[error("PSI engine returned {code:?}: {message} [{diagnostics}]")]
    Engine { code: Code, message: String, diagnostics: MatchDiagnostics },
    #[error("PSI engine client is shut down [{diagnostics}]")]
    ShutDown { diagnostics: MatchDiagnostics },
}

impl MatchError {
    #[must_use]
    pub fn diagnostics(&self) -> &MatchDiagnostics {
        match self {
            Self::RequestTooLarge { diagnostics, .. }
            | Self::DeadlineExceeded { diagnostics, .. }
            | Self::Transport { diagnostics, .. }
            | Self::Engine { diagnostics, .. }
            | Self::ShutDown { diagnostics } => diagnostics,
        }
    }

    /// A tonic engine enforces `grpc-timeout` on its own side and answers
    /// `Cancelled` when it expires, so a cancellation seen at or after the
    /// deadline counts as a deadline failure.
    fn from_status(
        status: &Status,
        deadline: Duration,
        elapsed: Duration,
        diagnostics: MatchDiagnostics,
    ) -> Self {
        match status.code() {
            Code::DeadlineExceeded => Self::DeadlineExceeded { deadline, diagnostics },
            Code::Cancelled if elapsed >= deadline => Self::DeadlineExceeded { deadline, diagnostics },
            Code::Unavailable => {
                Self::Transport { message: status.message().to_string(), diagnostics }
            }
            code => Self::Engine { code, message: status.message().to_string(), diagnostics },
        }
    }
}

/// One match request as handed to the transport. `payload_data` and
/// `context_data` are opaque and forwarded unmodified.
#[derive(Debug, Clone)]
pub struct MatchInput {
    pub match_id: Ulid,
    pub payload_data: Vec<u8>,
    pub context_data: Vec<u8>,
    pub srv_data: SrvData,
}

impl MatchInput {
    #[must_use]
    pub fn new(payload_data: Vec<u8>, context_data: Vec<u8>, srv_data: SrvData) -> Self {
        Self { match_id: Ulid::new(), payload_data, context_data, srv_data }
    }

    /// Convert into the wire request, measuring it on the way.
    #[must_use]
    pub fn into_request(self) -> (MatchRequest, MatchDiagnostics) {
        let total_labels = self.srv_data.values().map(Vec::len).sum();
        let mut diagnostics = MatchDiagnostics {
            entries: self.srv_data.len(),
            total_labels,
            payload_bytes: self.payload_data.len(),
            context_bytes: self.context_data.len(),
            request_bytes: 0,
        };

        let request = MatchRequest {
            context_data: self.context_data,
            payload_data: self.payload_data,
            srv_data: self
                .srv_data
                .into_iter()
                .map(|(key, labels)| (key, LabelsType { labels }))
                .collect(),
        };
        diagnostics.request_bytes = request.encoded_len();
        (request, diagnostics)
    }
}

/// Sends one match request to the PSI engine and returns its response payload unmodified.
pub trait MatchTransport: Send + Sync {
    fn send_match(
        &self,
        input: MatchInput,
    ) -> impl Future<Output = Result<Vec<u8>, MatchError>> + Send;
}

#[derive(Debug, Default)]
struct InFlight {
    active: AtomicUsize,
    closed: AtomicBool,
    drained: Notify,
}

struct CallGuard<'a> {
    in_flight: &'a InFlight,
}

impl InFlight {
    fn enter(&self) -> Option<CallGuard<'_>> {
        self.active.fetch_add(1, Ordering::SeqCst);
        let guard = CallGuard { in_flight: self };
        if self.closed.load(Ordering::SeqCst) {
            return None;
        }
        Some(guard)
    }
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        if self.in_flight.active.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.in_flight.drained.notify_waiters();
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ShutdownReport {
    pub drained: bool,
    pub abandoned_calls: usize,
}

/// Long-lived client for the PSI engine. One channel is shared by every call.
#[derive(Clone)]
pub struct PsiEngineClient {
    client: Arc<Mutex<Option<PsiServiceClient<Channel>>>>,
    config: EngineConfig,
    call_deadline: Duration,
    in_flight: Arc<InFlight>,
}

impl PsiEngineClient {
    /// Connect eagerly so an unreachable engine is reported before the first match.
    ///
    /// # Errors
    /// Returns an error when the configuration is invalid or the engine cannot be reached.
    pub async fn connect(config: EngineConfig) -> anyhow::Result<Self> {
        let endpoint = endpoint(&config)?;
        let channel = endpoint
            .connect()
            .await
            .with_context(|| format!("failed to connect to PSI engine at {}", config.endpoint_uri()))?;
        Ok(Self::from_channel(channel, config))
    }

    /// Build the client without touching the network; the channel connects on first use.
    ///
    /// # Errors
    /// Returns an error when the configuration is invalid.
    pub fn connect_lazy(config: EngineConfig) -> anyhow::Result<Self> {
        let channel = endpoint(&config)?.connect_lazy();
        Ok(Self::from_channel(channel, config))
    }

    fn from_channel(channel: Channel, config: EngineConfig) -> Self {
        let client = PsiServiceClient::new(channel)
            .max_encoding_message_size(config.max_message_bytes)
            .max_decoding_message_size(config.max_message_bytes);
        Self {
            client: Arc::new(Mutex::new(Some(client))),
            call_deadline: config.call_deadline(),
            config,
            in_flight: Arc::new(InFlight::default()),
        }
    }

    /// Override the per-call deadline with sub-second precision.
    #[must_use]
    pub fn with_call_deadline(mut self, deadline: Duration) -> Self {
        self.call_deadline = deadline;
        self
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[must_use]
    pub fn in_flight_calls(&self) -> usize {
        self.in_flight.active.load(Ordering::SeqCst)
    }

    /// Whether [`PsiEngineClient::shutdown`] has released the channel handle.
    #[must_use]
    pub fn is_released(&self) -> bool {
        self.client.lock().unwrap_or_else(PoisonError::into_inner).is_none()
    }

    fn checkout_client(&self) -> Option<PsiServiceClient<Channel>> {
        self.client.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Refuse new calls, wait up to `grace` for in-flight calls to finish, then
    /// release the shared channel handle.
    ///
    /// Calls abandoned after the grace period keep their own handle until they
    /// complete; the connection closes when the last of them finishes.
    pub async fn shutdown(&self, grace: Duration) -> ShutdownReport {
        self.in_flight.closed.store(true, Ordering::SeqCst);

        let in_flight = Arc::clone(&self.in_flight);
        let wait = async move {
            loop {
                let notified = in_flight.drained.notified();
                if in_flight.active.load(Ordering::SeqCst) == 0 {
                    return;
                }
                notified.await;
            }
        };

        let drained = tokio::time::timeout(grace, wait).await.is_ok();
        let abandoned_calls = if drained { 0 } else { self.in_flight_calls() };
        let released = self.client.lock().unwrap_or_else(PoisonError::into_inner).take().is_some();
        if drained {
            tracing::info!("PSI engine client drained");
        } else {
            tracing::warn!(abandoned_calls, ?grace, "PSI engine client shutdown grace elapsed");
        }
        if released {
            tracing::info!("PSI engine channel released");
        }
        ShutdownReport { drained, abandoned_calls }
    }

    async fn call(
        &self,
        request: MatchRequest,
        diagnostics: MatchDiagnostics,
    ) -> Result<Vec<u8>, MatchError> {
        let limit = self.config.max_message_bytes;
        if diagnostics.request_bytes > limit {
            tracing::error!(limit, request_bytes = diagnostics.request_bytes, "match request too large");
            return Err(MatchError::RequestTooLarge { limit, diagnostics });
        }

        let Some(_guard) = self.in_flight.enter() else {
            return Err(MatchError::ShutDown { diagnostics });
        };
        let Some(mut client) = self.checkout_client() else {
            return Err(MatchError::ShutDown { diagnostics });
        };

        let deadline = self.call_deadline;
        let mut request = tonic::Request::new(request);
        request.set_timeout(deadline);

        let started = Instant::now();
        let outcome = match tokio::time::timeout(deadline, client.do_match(request)).await {
            Err(_elapsed) => Err(MatchError::DeadlineExceeded { deadline, diagnostics }),
            Ok(Err(status)) => {
                Err(MatchError::from_status(&status, deadline, started.elapsed(), diagnostics))
            }
            Ok(Ok(response)) => Ok(response.into_inner().payload_data),
        };

        match &outcome {
            Ok(payload) => tracing::info!(response_bytes = payload.len(), "match completed"),
            Err(err) => tracing::error!(error = %err, "match failed"),
        }
        outcome
    }
}

impl MatchTransport for PsiEngineClient {
    async fn send_match(&self, input: MatchInput) -> Result<Vec<u8>, MatchError> {
        let match_id = input.match_id;
        let (request, diagnostics) = input.into_request();
        let span = tracing::info_span!(
            "psi_match",
            %match_id,
            entries = diagnostics.entries,
            total_labels = diagnostics.total_labels,
            request_bytes = diagnostics.request_bytes,
        );
        self.call(request, diagnostics).instrument(span).await
    }
}

fn endpoint(config: &EngineConfig) -> anyhow::Result<Endpoint> {
    config.validate()?;
    let endpoint = Endpoint::from_shared(config.endpoint_uri())
        .with_context(|| format!("invalid PSI engine endpoint {}", config.endpoint_uri()))?
        .connect_timeout(Duration::from_secs(config.connect_timeout_secs));
    Ok(endpoint)
}
