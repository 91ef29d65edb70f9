use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{ensure, Context, Result};
use blacklist_psi_api::{BlacklistApi, QueryResult};
use blacklist_psi_core::{
    decode_labels, derive_correlation_key, describe_labels, encode_labels, BehaviorEvent,
    BehaviorType, Label, RiskLevel, ToolType,
};
use blacklist_psi_engine::{EngineConfig, PsiEngineClient};
use clap::{Args, Parser, Subcommand};
use serde::Deserialize;
use serde_json::Value;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "psi")]
#[command(about = "Blacklist PSI bridge CLI")]
struct Cli {
    #[arg(long, env = "BLACKLIST_PSI_DB", default_value = "./blacklist_psi.sqlite3")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: Box<DbCommand>,
    },
    Blacklist {
        #[command(subcommand)]
        command: Box<BlacklistCommand>,
    },
    Key {
        #[command(subcommand)]
        command: Box<KeyCommand>,
    },
    Labels {
        #[command(subcommand)]
        command: Box<LabelsCommand>,
    },
    Assemble {
        #[command(subcommand)]
        command: Box<AssembleCommand>,
    },
    Query(QueryArgs),
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
    IntegrityCheck,
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Subcommand)]
enum BlacklistCommand {
    /// Replace the whole blacklist with the entries of an NDJSON file.
    Import(BlacklistImportArgs),
    Status,
}

#[derive(Debug, Args)]
struct BlacklistImportArgs {
    #[arg(long = "in")]
    input: PathBuf,
}

#[derive(Debug, Subcommand)]
enum KeyCommand {
    Derive(KeyDeriveArgs),
}

#[derive(Debug, Args)]
struct KeyDeriveArgs {
    #[arg(long, allow_hyphen_values = true)]
    identity: String,
}

#[derive(Debug, Subcommand)]
enum LabelsCommand {
    Encode(LabelsEncodeArgs),
    Decode(LabelsDecodeArgs),
}

#[derive(Debug, Args)]
struct LabelsEncodeArgs {
    #[arg(long, value_parser = parse_risk_level)]
    risk_level: RiskLevel,
    /// Behavior event as `behavior:tool`, e.g. `hide:knife`. Repeat for several events.
    #[arg(long = "event", value_parser = parse_event)]
    events: Vec<(BehaviorType, ToolType)>,
}

#[derive(Debug, Args)]
struct LabelsDecodeArgs {
    #[arg(long = "label", required = true)]
    labels: Vec<Label>,
}

#[derive(Debug, Subcommand)]
enum AssembleCommand {
    Preview(AssemblePreviewArgs),
}

#[derive(Debug, Args)]
struct AssemblePreviewArgs {
    #[arg(long, default_value_t = 10)]
    limit: usize,
}

#[derive(Debug, Args)]
struct QueryArgs {
    #[arg(long)]
    payload_file: PathBuf,
    #[arg(long)]
    context_file: PathBuf,
    /// TOML file with an `[engine]` table, such as the service config.
    #[arg(long)]
    engine_config: Option<PathBuf>,
    #[arg(long, env = "BLACKLIST_PSI_ENGINE_HOST")]
    engine_host: Option<String>,
    #[arg(long, env = "BLACKLIST_PSI_ENGINE_PORT")]
    engine_port: Option<u16>,
    /// Write the raw encrypted response here in addition to the JSON summary.
    #[arg(long)]
    out: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
struct EngineConfigFile {
    #[serde(default)]
    engine: EngineConfig,
}

fn parse_risk_level(value: &str) -> Result<RiskLevel, String> {
    RiskLevel::parse(value).ok_or_else(|| format!("unknown risk level `{value}`, expected A, B or C"))
}

fn parse_event(value: &str) -> Result<(BehaviorType, ToolType), String> {
    let (behavior, tool) = value
        .split_once(':')
        .ok_or_else(|| format!("event `{value}` must look like behavior:tool"))?;
    let behavior_type =
        BehaviorType::parse(behavior).ok_or_else(|| format!("unknown behavior type `{behavior}`"))?;
    let tool_type = ToolType::parse(tool).ok_or_else(|| format!("unknown tool type `{tool}`"))?;
    Ok((behavior_type, tool_type))
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn init_tracing() -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "blacklist_psi=info".into());
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init()
        .context("failed to install tracing subscriber")
}

fn main() -> Result<()> {
    init_tracing()?;
    let cli = Cli::parse();
    let api = BlacklistApi::new(cli.db);
    match cli.command {
        Command::Db { command } => run_db(*command, &api),
        Command::Blacklist { command } => run_blacklist(*command, &api),
        Command::Key { command } => run_key(*command),
        Command::Labels { command } => run_labels(*command),
        Command::Assemble { command } => run_assemble(*command, &api),
        Command::Query(args) => run_query(&args, &api),
    }
}

fn run_db(command: DbCommand, api: &BlacklistApi) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => {
            let status = api.schema_status()?;
            emit_json(serde_json::json!({
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions,
                "up_to_date": status.pending_versions.is_empty()
            }))
        }
        DbCommand::Migrate(args) => emit_json(serde_json::to_value(api.migrate(args.dry_run)?)?),
        DbCommand::IntegrityCheck => emit_json(serde_json::to_value(api.integrity_check()?)?),
    }
}

fn run_blacklist(command: BlacklistCommand, api: &BlacklistApi) -> Result<()> {
    match command {
        BlacklistCommand::Import(args) => {
            let summary = api.import_ndjson(&args.input)?;
            emit_json(serde_json::to_value(summary)?)
        }
        BlacklistCommand::Status => emit_json(serde_json::to_value(api.blacklist_status()?)?),
    }
}

fn run_key(command: KeyCommand) -> Result<()> {
    match command {
        KeyCommand::Derive(args) => {
            let key = derive_correlation_key(&args.identity);
            emit_json(serde_json::json!({
                "identity": args.identity,
                "correlation_key": key.value(),
                "correlation_key_hex": key.to_hex()
            }))
        }
    }
}

fn run_labels(command: LabelsCommand) -> Result<()> {
    match command {
        LabelsCommand::Encode(args) => {
            let events = args
                .events
                .iter()
                .map(|&(behavior_type, tool)| BehaviorEvent { owner_key: 0, behavior_type, tool })
                .collect::<Vec<_>>();
            let labels = encode_labels(args.risk_level, &events);
            emit_json(serde_json::json!({
                "risk_level": args.risk_level,
                "event_count": events.len(),
                "labels": labels,
                "described": describe_labels(&labels)
            }))
        }
        LabelsCommand::Decode(args) => {
            let decoded = decode_labels(&args.labels)?;
            let truncated = decoded.events.len() < usize::from(decoded.declared_count);
            emit_json(serde_json::json!({
                "risk_level": decoded.risk_level,
                "risk_level_name": decoded.typed_risk_level().map(RiskLevel::as_str),
                "declared_count": decoded.declared_count,
                "events": decoded.events.iter().map(|event| serde_json::json!({
                    "behavior_type": event.behavior_type,
                    "tool_type": event.tool_type,
                    "typed": event.typed().map(|(behavior, tool)| serde_json::json!({
                        "behavior_type": behavior,
                        "tool": tool
                    }))
                })).collect::<Vec<_>>(),
                "truncated": truncated,
                "described": describe_labels(&args.labels)
            }))
        }
    }
}

fn run_assemble(command: AssembleCommand, api: &BlacklistApi) -> Result<()> {
    match command {
        AssembleCommand::Preview(args) => emit_json(serde_json::to_value(api.assemble_preview(args.limit)?)?),
    }
}

fn load_engine_config(args: &QueryArgs) -> Result<EngineConfig> {
    let mut config = match args.engine_config.as_ref() {
        Some(path) => {
            let content = fs::read_to_string(path)
                .with_context(|| format!("failed to read engine config {}", path.display()))?;
            toml::from_str::<EngineConfigFile>(&content)
                .with_context(|| format!("invalid engine config {}", path.display()))?
                .engine
        }
        None => EngineConfig::default(),
    };
    if let Some(host) = args.engine_host.clone() {
        config.host = host;
    }
    if let Some(port) = args.engine_port {
        config.port = port;
    }
    config.validate()?;
    Ok(config)
}

fn read_input_file(field: &str, path: &Path) -> Result<Vec<u8>> {
    fs::read(path).with_context(|| format!("failed to read {field} from {}", path.display()))
}

fn run_query(args: &QueryArgs, api: &BlacklistApi) -> Result<()> {
    let payload_data = read_input_file("payload_data", &args.payload_file)?;
    let context_data = read_input_file("context_data", &args.context_file)?;
    ensure!(!payload_data.is_empty(), "payload_data MUST be non-empty: {} is empty", args.payload_file.display());
    ensure!(!context_data.is_empty(), "context_data MUST be non-empty: {} is empty", args.context_file.display());
    let config = load_engine_config(args)?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?;

    tracing::info!(engine = %config.endpoint_uri(), payload_bytes = payload_data.len(), "connecting to PSI engine");
    let outcome = runtime.block_on(async {
        let engine = PsiEngineClient::connect(config).await?;
        let grace = engine.config().shutdown_grace();
        let result = api.query_bytes(&engine, payload_data, context_data).await;
        engine.shutdown(grace).await;
        Ok::<_, anyhow::Error>(result?)
    })?;

    if let Some(out) = args.out.as_ref() {
        fs::write(out, &outcome.encrypted_result)
            .with_context(|| format!("failed to write encrypted result to {}", out.display()))?;
    }

    let report = outcome.report.clone();
    let mut value = serde_json::to_value(QueryResult::from(outcome))?;
    if let Value::Object(object) = &mut value {
        object.insert("assembly".to_string(), serde_json::to_value(report)?);
    }
    emit_json(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_tracing_init_returns_error_instead_of_panicking() {
        let _ = init_tracing();
        assert!(init_tracing().is_err());
    }
}
