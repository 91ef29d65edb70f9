use std::fmt::{Debug, Formatter};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use blacklist_psi_core::{
    assemble_srv_data, describe_labels, AssemblyReport, BehaviorEvent, BehaviorType, CoreError,
    CorrelationKey, IdentityRecord, IdentityWithEvents, Label, MatchCount, MatchCountStrategy,
    RiskLevel, ToolType, UndeclaredMatchCount,
};
use blacklist_psi_engine::{MatchError, MatchInput, MatchTransport};
use blacklist_psi_store_sqlite::{
    IntegrityReport, PopulationStatus, ReplaceSummary, SchemaStatus, SqliteStore,
};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

pub const API_CONTRACT_VERSION: &str = "api.v1";
const PREVIEW_LOG_ENTRIES: usize = 3;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrateResult {
    pub dry_run: bool,
    pub current_version: i64,
    pub target_version: i64,
    pub would_apply_versions: Vec<i64>,
    pub after_version: Option<i64>,
    pub up_to_date: Option<bool>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlacklistEvent {
    pub behavior_type: BehaviorType,
    pub tool: ToolType,
}

/// One identity as submitted for a bulk rewrite. Owner keys are assigned on import.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlacklistEntry {
    pub identity: String,
    pub risk_level: RiskLevel,
    #[serde(default)]
    pub events: Vec<BlacklistEvent>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReplaceRequest {
    pub identities: Vec<BlacklistEntry>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PopulationState {
    Created,
    Empty,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlacklistStatus {
    pub status: PopulationState,
    pub size: u64,
    pub population_version: i64,
    pub replaced_at: Option<String>,
}

impl From<PopulationStatus> for BlacklistStatus {
    fn from(value: PopulationStatus) -> Self {
        let status = if value.size == 0 { PopulationState::Empty } else { PopulationState::Created };
        Self {
            status,
            size: value.size,
            population_version: value.population_version,
            replaced_at: value.replaced_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PreviewEntry {
    pub owner_key: i64,
    pub correlation_key: CorrelationKey,
    pub correlation_key_hex: String,
    pub labels: Vec<Label>,
    pub described: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AssemblePreview {
    pub population_version: i64,
    pub report: AssemblyReport,
    pub entries: Vec<PreviewEntry>,
}

/// Query as received over HTTP: both fields are Base64 of opaque client bytes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueryRequest {
    #[serde(default)]
    pub payload_data: String,
    #[serde(default)]
    pub context_data: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchOutcome {
    pub match_id: Ulid,
    pub encrypted_result: Vec<u8>,
    pub match_count: MatchCount,
    pub strategy: &'static str,
    pub total_count: usize,
    pub population_version: i64,
    pub report: AssemblyReport,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueryResult {
    pub match_id: Ulid,
    /// Base64 of the engine response, still encrypted.
    pub encrypted_result: String,
    pub match_count: MatchCount,
    pub match_count_strategy: String,
    pub total_count: usize,
    pub population_version: i64,
    pub elapsed_ms: u64,
}

impl From<MatchOutcome> for QueryResult {
    fn from(value: MatchOutcome) -> Self {
        Self {
            match_id: value.match_id,
            encrypted_result: BASE64.encode(&value.encrypted_result),
            match_count: value.match_count,
            match_count_strategy: value.strategy.to_string(),
            total_count: value.total_count,
            population_version: value.population_version,
            elapsed_ms: value.elapsed_ms,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error("invalid query: {0}")]
    Validation(String),
    #[error("blacklist is empty; import identities before querying")]
    EmptyBlacklist,
    #[error("blacklist store failure: {0:#}")]
    Store(anyhow::Error),
    #[error(transparent)]
    Engine(#[from] MatchError),
    #[error("match count interpretation failed: {0}")]
    Interpret(CoreError),
}

struct PreparedBatch {
    population_version: i64,
    total_count: usize,
    report: AssemblyReport,
    srv_data: blacklist_psi_core::SrvData,
}

#[derive(Clone)]
pub struct BlacklistApi {
    db_path: PathBuf,
    strategy: Arc<dyn MatchCountStrategy>,
}

impl Debug for BlacklistApi {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlacklistApi")
            .field("db_path", &self.db_path)
            .field("strategy", &self.strategy.name())
            .finish()
    }
}

impl BlacklistApi {
    #[must_use]
    pub fn new(db_path: PathBuf) -> Self {
        Self { db_path, strategy: Arc::new(UndeclaredMatchCount) }
    }

    #[must_use]
    pub fn with_strategy(mut self, strategy: Arc<dyn MatchCountStrategy>) -> Self {
        self.strategy = strategy;
        self
    }

    #[must_use]
    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn open_store(&self) -> Result<SqliteStore> {
        SqliteStore::open(&self.db_path)
    }

    fn open_migrated_store(&self) -> Result<SqliteStore> {
        let mut store = self.open_store()?;
        store.migrate()?;
        Ok(store)
    }

    /// Inspect schema status without mutating data.
    ///
    /// # Errors
    /// Returns an error when the `SQLite` database cannot be opened or queried.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        let store = self.open_store()?;
        store.schema_status()
    }

    /// Apply pending migrations, or return planned versions for dry-run mode.
    ///
    /// # Errors
    /// Returns an error when migration planning or execution fails.
    pub fn migrate(&self, dry_run: bool) -> Result<MigrateResult> {
        let mut store = self.open_store()?;
        let before = store.schema_status()?;
        if dry_run {
            return Ok(MigrateResult {
                dry_run: true,
                current_version: before.current_version,
                target_version: before.target_version,
                would_apply_versions: before.pending_versions,
                after_version: None,
                up_to_date: None,
            });
        }

        let planned_versions = before.pending_versions;
        store.migrate()?;
        let after = store.schema_status()?;
        Ok(MigrateResult {
            dry_run: false,
            current_version: before.current_version,
            target_version: before.target_version,
            would_apply_versions: planned_versions,
            after_version: Some(after.current_version),
            up_to_date: Some(after.pending_versions.is_empty()),
        })
    }

    /// Run database health probes.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or a probe fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let store = self.open_store()?;
        store.integrity_check()
    }

    /// Replace the whole blacklist population with `request.identities`.
    ///
    /// # Errors
    /// Returns an error when any entry fails validation or the rewrite fails.
    pub fn replace_blacklist(&self, request: ReplaceRequest) -> Result<ReplaceSummary> {
        let identities = entries_into_identities(request.identities);
        let mut store = self.open_migrated_store()?;
        store.replace_all(&identities)
    }

    /// Replace the population from an NDJSON file of [`BlacklistEntry`] lines.
    ///
    /// # Errors
    /// Returns an error when the file cannot be read, a line is malformed, or the rewrite fails.
    pub fn import_ndjson(&self, in_file: &Path) -> Result<ReplaceSummary> {
        let identities = read_blacklist_ndjson(in_file)?;
        self.replace_blacklist(ReplaceRequest { identities })
    }

    /// Report population size and version.
    ///
    /// # Errors
    /// Returns an error when the store cannot be opened or read.
    pub fn blacklist_status(&self) -> Result<BlacklistStatus> {
        let store = self.open_migrated_store()?;
        Ok(store.population_status()?.into())
    }

    /// Assemble the current population and return the first `limit` entries with decoded labels.
    ///
    /// # Errors
    /// Returns an error when the snapshot cannot be read.
    pub fn assemble_preview(&self, limit: usize) -> Result<AssemblePreview> {
        let mut store = self.open_migrated_store()?;
        let snapshot = store.load_snapshot()?;
        let batch = assemble_srv_data(&snapshot.identities);

        let entries = snapshot
            .identities
            .iter()
            .take(limit)
            .map(|identity| {
                let correlation_key = identity.correlation_key();
                let labels = identity.labels();
                PreviewEntry {
                    owner_key: identity.record.owner_key,
                    correlation_key,
                    correlation_key_hex: correlation_key.to_hex(),
                    described: describe_labels(&labels),
                    labels,
                }
            })
            .collect();

        Ok(AssemblePreview {
            population_version: snapshot.population_version,
            report: batch.report,
            entries,
        })
    }

    /// Decode a Base64 query and run it through the match pipeline.
    ///
    /// # Errors
    /// Returns [`QueryError::Validation`] for malformed or empty Base64 fields and
    /// otherwise whatever [`BlacklistApi::query_bytes`] returns.
    pub async fn query<T>(&self, transport: &T, request: QueryRequest) -> Result<QueryResult, QueryError>
    where
        T: MatchTransport,
    {
        let payload_data = decode_base64_field("payload_data", &request.payload_data)?;
        let context_data = decode_base64_field("context_data", &request.context_data)?;
        let outcome = self.query_bytes(transport, payload_data, context_data).await?;
        Ok(outcome.into())
    }

    /// Run one match: snapshot, assemble, send, interpret.
    ///
    /// Empty inputs are rejected before the store or the engine is touched.
    ///
    /// # Errors
    /// Returns [`QueryError`] naming the failing stage; engine failures carry diagnostics.
    pub async fn query_bytes<T>(
        &self,
        transport: &T,
        payload_data: Vec<u8>,
        context_data: Vec<u8>,
    ) -> Result<MatchOutcome, QueryError>
    where
        T: MatchTransport,
    {
        if payload_data.is_empty() {
            return Err(QueryError::Validation("payload_data MUST be non-empty".to_string()));
        }
        if context_data.is_empty() {
            return Err(QueryError::Validation("context_data MUST be non-empty".to_string()));
        }

        let started = Instant::now();
        let db_path = self.db_path.clone();
        let prepared = tokio::task::spawn_blocking(move || prepare_batch(&db_path))
            .await
            .map_err(|err| QueryError::Store(anyhow!("snapshot task failed: {err}")))?
            .map_err(QueryError::Store)?;

        if prepared.total_count == 0 {
            return Err(QueryError::EmptyBlacklist);
        }

        let input = MatchInput::new(payload_data, context_data, prepared.srv_data);
        let match_id = input.match_id;
        tracing::info!(
            %match_id,
            population_version = prepared.population_version,
            identities = prepared.total_count,
            entries = prepared.report.entries,
            total_labels = prepared.report.total_labels,
            "sending match request"
        );

        let encrypted_result = transport.send_match(input).await?;
        let match_count = self.strategy.interpret(&encrypted_result).map_err(QueryError::Interpret)?;

        let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        tracing::info!(
            %match_id,
            elapsed_ms,
            response_bytes = encrypted_result.len(),
            strategy = self.strategy.name(),
            ?match_count,
            "match finished"
        );

        Ok(MatchOutcome {
            match_id,
            encrypted_result,
            match_count,
            strategy: self.strategy.name(),
            total_count: prepared.total_count,
            population_version: prepared.population_version,
            report: prepared.report,
            elapsed_ms,
        })
    }
}

/// Whether `err` stems from rejected input rather than a storage failure.
#[must_use]
pub fn is_validation_error(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| cause.is::<CoreError>())
}

fn prepare_batch(db_path: &Path) -> Result<PreparedBatch> {
    let mut store = SqliteStore::open(db_path)?;
    store.migrate()?;
    let snapshot = store.load_snapshot()?;
    let batch = assemble_srv_data(&snapshot.identities);

    if batch.report.overwritten_keys > 0 {
        tracing::warn!(
            overwritten_keys = batch.report.overwritten_keys,
            "correlation key collisions overwrote blacklist entries"
        );
    }
    if batch.report.declared_count_mismatches > 0 {
        tracing::warn!(
            mismatches = batch.report.declared_count_mismatches,
            "stored behavior_count disagrees with behavior rows"
        );
    }
    for identity in snapshot.identities.iter().take(PREVIEW_LOG_ENTRIES) {
        tracing::debug!(
            owner_key = identity.record.owner_key,
            correlation_key = %identity.correlation_key(),
            labels = ?describe_labels(&identity.labels()),
            "label preview"
        );
    }

    Ok(PreparedBatch {
        population_version: snapshot.population_version,
        total_count: snapshot.identities.len(),
        report: batch.report,
        srv_data: batch.srv_data,
    })
}

fn decode_base64_field(field: &str, value: &str) -> Result<Vec<u8>, QueryError> {
    if value.trim().is_empty() {
        return Err(QueryError::Validation(format!("{field} MUST be non-empty")));
    }
    BASE64
        .decode(value.trim())
        .map_err(|err| QueryError::Validation(format!("{field} is not valid Base64: {err}")))
}

/// Assign owner keys in submission order, starting at 1.
#[must_use]
pub fn entries_into_identities(entries: Vec<BlacklistEntry>) -> Vec<IdentityWithEvents> {
    entries
        .into_iter()
        .zip(1_i64..)
        .map(|(entry, owner_key)| IdentityWithEvents {
            record: IdentityRecord {
                owner_key,
                identity: entry.identity,
                risk_level: entry.risk_level,
                behavior_count: u8::try_from(entry.events.len()).unwrap_or(u8::MAX),
            },
            events: entry
                .events
                .into_iter()
                .map(|event| BehaviorEvent {
                    owner_key,
                    behavior_type: event.behavior_type,
                    tool: event.tool,
                })
                .collect(),
        })
        .collect()
}

/// Read one [`BlacklistEntry`] per non-blank line.
///
/// # Errors
/// Returns an error naming the line number when a line is not a valid entry.
pub fn read_blacklist_ndjson(path: &Path) -> Result<Vec<BlacklistEntry>> {
    let file = File::open(path)
        .with_context(|| format!("failed to open NDJSON file {}", path.display()))?;
    let reader = BufReader::new(file);
    let mut entries = Vec::new();

    for (index, line) in reader.lines().enumerate() {
        let line = line.with_context(|| format!("failed to read line {}", index + 1))?;
        if line.trim().is_empty() {
            continue;
        }
        let entry = serde_json::from_str::<BlacklistEntry>(&line).with_context(|| {
            format!("invalid blacklist entry on line {} of {}", index + 1, path.display())
        })?;
        entries.push(entry);
    }

    Ok(entries)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use super::*;
    use blacklist_psi_core::{derive_correlation_key, SrvData};
    use blacklist_psi_engine::MatchDiagnostics;

    fn unique_temp_db_path() -> PathBuf {
        std::env::temp_dir().join(format!("blacklist-psi-api-{}.sqlite3", Ulid::new()))
    }

    enum Reply {
        Payload(Vec<u8>),
        Deadline,
    }

    struct FakeTransport {
        reply: Reply,
        calls: AtomicUsize,
        last_srv_data: Mutex<Option<SrvData>>,
    }

    impl FakeTransport {
        fn new(reply: Reply) -> Self {
            Self { reply, calls: AtomicUsize::new(0), last_srv_data: Mutex::new(None) }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl MatchTransport for FakeTransport {
        async fn send_match(&self, input: MatchInput) -> Result<Vec<u8>, MatchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Ok(mut last) = self.last_srv_data.lock() {
                *last = Some(input.srv_data.clone());
            }
            match &self.reply {
                Reply::Payload(payload) => Ok(payload.clone()),
                Reply::Deadline => {
                    let (_, diagnostics) = input.into_request();
                    Err(MatchError::DeadlineExceeded {
                        deadline: std::time::Duration::from_secs(180),
                        diagnostics,
                    })
                }
            }
        }
    }

    struct FixedCount(u64);

    impl MatchCountStrategy for FixedCount {
        fn name(&self) -> &'static str {
            "fixed"
        }

        fn interpret(&self, _response: &[u8]) -> Result<MatchCount, CoreError> {
            Ok(MatchCount::Known { count: self.0 })
        }
    }

    fn sample_request() -> ReplaceRequest {
        ReplaceRequest {
            identities: vec![
                BlacklistEntry {
                    identity: "110105194912310021".to_string(),
                    risk_level: RiskLevel::B,
                    events: vec![
                        BlacklistEvent { behavior_type: BehaviorType::Hide, tool: ToolType::Other },
                        BlacklistEvent {
                            behavior_type: BehaviorType::Complain,
                            tool: ToolType::Knife,
                        },
                    ],
                },
                BlacklistEntry {
                    identity: "110105194912310022".to_string(),
                    risk_level: RiskLevel::A,
                    events: vec![BlacklistEvent {
                        behavior_type: BehaviorType::Other,
                        tool: ToolType::Lighter,
                    }],
                },
                BlacklistEntry {
                    identity: "110105194912310023".to_string(),
                    risk_level: RiskLevel::C,
                    events: Vec::new(),
                },
            ],
        }
    }

    #[derive(Clone, Default)]
    struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            if let Ok(mut captured) = self.0.lock() {
                captured.extend_from_slice(buf);
            }
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn prepare_batch_logs_decoded_labels_for_first_entries() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = BlacklistApi::new(db_path.clone());
        let mut request = sample_request();
        request.identities.push(BlacklistEntry {
            identity: "110105194912310024".to_string(),
            risk_level: RiskLevel::A,
            events: Vec::new(),
        });
        api.replace_blacklist(request)?;

        let logs = CapturedLogs::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();
        let prepared = tracing::subscriber::with_default(subscriber, || prepare_batch(&db_path))?;
        assert_eq!(prepared.total_count, 4);

        let captured = logs.0.lock().map_err(|_| anyhow!("lock poisoned"))?.clone();
        let output = String::from_utf8(captured)?;
        assert_eq!(output.matches("label preview").count(), 3);
        assert!(output.contains("labels[0]=34 (0x22) risk=2 count=2"), "logs were: {output}");
        Ok(())
    }

    // Test IDs: TAPI-001
    #[tokio::test]
    async fn query_sends_assembled_population_and_reports_unknown_count() -> Result<()> {
        let api = BlacklistApi::new(unique_temp_db_path());
        api.replace_blacklist(sample_request())?;
        let transport = FakeTransport::new(Reply::Payload(b"ciphertext".to_vec()));

        let result = api
            .query(
                &transport,
                QueryRequest {
                    payload_data: BASE64.encode(b"client-payload"),
                    context_data: BASE64.encode(b"client-context"),
                },
            )
            .await?;

        assert_eq!(transport.calls(), 1);
        assert_eq!(result.encrypted_result, BASE64.encode(b"ciphertext"));
        assert_eq!(result.match_count, MatchCount::Unknown);
        assert_eq!(result.match_count_strategy, "undeclared");
        assert_eq!(result.total_count, 3);
        assert_eq!(result.population_version, 1);

        let sent = transport.last_srv_data.lock().map_err(|_| anyhow!("lock poisoned"))?.clone();
        let Some(sent) = sent else {
            return Err(anyhow!("transport did not record srv_data"));
        };
        assert_eq!(sent.len(), 3);
        let key = derive_correlation_key("110105194912310021").value();
        assert_eq!(sent.get(&key), Some(&vec![34, 49, 18]));
        Ok(())
    }

    // Test IDs: TAPI-002
    #[tokio::test]
    async fn empty_inputs_are_rejected_before_transport() -> Result<()> {
        let api = BlacklistApi::new(unique_temp_db_path());
        api.replace_blacklist(sample_request())?;
        let transport = FakeTransport::new(Reply::Payload(Vec::new()));

        let empty_payload = api.query_bytes(&transport, Vec::new(), b"ctx".to_vec()).await;
        assert!(matches!(empty_payload, Err(QueryError::Validation(message)) if message.contains("payload_data")));

        let empty_context = api.query_bytes(&transport, b"payload".to_vec(), Vec::new()).await;
        assert!(matches!(empty_context, Err(QueryError::Validation(message)) if message.contains("context_data")));

        let bad_base64 = api
            .query(
                &transport,
                QueryRequest { payload_data: "%%%".to_string(), context_data: "AA==".to_string() },
            )
            .await;
        assert!(matches!(bad_base64, Err(QueryError::Validation(message)) if message.contains("Base64")));

        assert_eq!(transport.calls(), 0);
        Ok(())
    }

    // Test IDs: TAPI-003
    #[tokio::test]
    async fn empty_blacklist_is_rejected_before_transport() -> Result<()> {
        let api = BlacklistApi::new(unique_temp_db_path());
        let transport = FakeTransport::new(Reply::Payload(Vec::new()));

        let result = api.query_bytes(&transport, b"p".to_vec(), b"c".to_vec()).await;
        assert!(matches!(result, Err(QueryError::EmptyBlacklist)));
        assert_eq!(transport.calls(), 0);
        Ok(())
    }

    // Test IDs: TAPI-004
    #[tokio::test]
    async fn engine_failure_propagates_with_diagnostics() -> Result<()> {
        let api = BlacklistApi::new(unique_temp_db_path());
        api.replace_blacklist(sample_request())?;
        let transport = FakeTransport::new(Reply::Deadline);

        let result = api.query_bytes(&transport, b"p".to_vec(), b"ctx".to_vec()).await;
        let Err(QueryError::Engine(err)) = result else {
            return Err(anyhow!("engine failure should surface as QueryError::Engine"));
        };
        assert!(matches!(err, MatchError::DeadlineExceeded { .. }));
        let diagnostics: MatchDiagnostics = *err.diagnostics();
        assert_eq!(diagnostics.entries, 3);
        assert_eq!(diagnostics.total_labels, 6);
        assert_eq!(diagnostics.context_bytes, 3);
        assert_eq!(transport.calls(), 1);
        Ok(())
    }

    // Test IDs: TAPI-005
    #[tokio::test]
    async fn custom_strategy_replaces_undeclared_count() -> Result<()> {
        let api = BlacklistApi::new(unique_temp_db_path()).with_strategy(Arc::new(FixedCount(2)));
        api.replace_blacklist(sample_request())?;
        let transport = FakeTransport::new(Reply::Payload(vec![9; 4]));

        let outcome = api.query_bytes(&transport, b"p".to_vec(), b"c".to_vec()).await?;
        assert_eq!(outcome.match_count, MatchCount::Known { count: 2 });
        assert_eq!(outcome.strategy, "fixed");
        assert_eq!(outcome.encrypted_result, vec![9; 4]);
        Ok(())
    }

    // Test IDs: TAPI-006
    #[test]
    fn status_migrate_and_preview_reflect_population() -> Result<()> {
        let api = BlacklistApi::new(unique_temp_db_path());

        let planned = api.migrate(true)?;
        assert!(planned.dry_run);
        assert_eq!(planned.would_apply_versions, vec![1]);

        let empty = api.blacklist_status()?;
        assert_eq!(empty.status, PopulationState::Empty);
        assert_eq!(empty.population_version, 0);

        let summary = api.replace_blacklist(sample_request())?;
        assert_eq!(summary.replaced, 3);
        assert_eq!(summary.behavior_events, 3);

        let status = api.blacklist_status()?;
        assert_eq!(status.status, PopulationState::Created);
        assert_eq!(status.size, 3);

        let preview = api.assemble_preview(2)?;
        assert_eq!(preview.entries.len(), 2);
        assert_eq!(preview.report.entries, 3);
        assert_eq!(preview.entries[0].labels, vec![34, 49, 18]);
        assert_eq!(preview.entries[0].correlation_key_hex.len(), 16);
        assert_eq!(preview.entries[0].described.len(), 3);

        let applied = api.migrate(false)?;
        assert_eq!(applied.up_to_date, Some(true));
        assert!(api.integrity_check()?.quick_check_ok);
        Ok(())
    }

    // Test IDs: TAPI-007
    #[test]
    fn replace_rejects_too_many_events_and_keeps_population() -> Result<()> {
        let api = BlacklistApi::new(unique_temp_db_path());
        api.replace_blacklist(sample_request())?;

        let too_many = ReplaceRequest {
            identities: vec![BlacklistEntry {
                identity: "x".to_string(),
                risk_level: RiskLevel::A,
                events: vec![
                    BlacklistEvent { behavior_type: BehaviorType::Hide, tool: ToolType::Knife };
                    16
                ],
            }],
        };
        let Err(err) = api.replace_blacklist(too_many) else {
            return Err(anyhow!("sixteen events should be rejected"));
        };
        assert!(is_validation_error(&err));
        assert_eq!(api.blacklist_status()?.size, 3);
        Ok(())
    }

    // Test IDs: TAPI-008
    #[test]
    fn import_ndjson_reads_entries_and_reports_bad_lines() -> Result<()> {
        let dir = std::env::temp_dir().join(format!("blacklist-psi-import-{}", Ulid::new()));
        std::fs::create_dir_all(&dir)?;
        let good = dir.join("good.ndjson");
        std::fs::write(
            &good,
            "{\"identity\":\"a-1\",\"risk_level\":\"A\",\"events\":[{\"behavior_type\":\"hide\",\"tool\":\"knife\"}]}\n\n{\"identity\":\"a-2\",\"risk_level\":\"C\"}\n",
        )?;
        let api = BlacklistApi::new(dir.join("db.sqlite3"));
        let summary = api.import_ndjson(&good)?;
        assert_eq!(summary.replaced, 2);
        assert_eq!(summary.behavior_events, 1);

        let bad = dir.join("bad.ndjson");
        std::fs::write(&bad, "{\"identity\":\"a-1\",\"risk_level\":\"Z\"}\n")?;
        let Err(err) = api.import_ndjson(&bad) else {
            return Err(anyhow!("invalid risk level should be rejected"));
        };
        assert!(format!("{err:#}").contains("line 1"));

        std::fs::remove_dir_all(&dir)?;
        Ok(())
    }
}
