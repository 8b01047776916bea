use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};
use jarvis_contracts::{
    command_schema, event_schema, ChatRequest, CommandEnvelope, EventEnvelope, PermissionDecision,
    PermissionReply, ProtocolError,
};
use jarvis_error::SessionError;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::agent_link::{AgentDirectory, ScriptedLink};
use crate::audit::{format_line, RECENT_AUDIT_LINES};
use crate::config::HostConfig;
use crate::host::Host;
use crate::scenarios::{demo_scenarios, find_scenario};
use crate::session::{SessionSnapshot, SessionUpdate, TurnOutcome};

#[derive(Parser, Debug)]
#[command(name = "jarvis", bin_name = "jarvis")]
#[command(about = "Desktop control-surface session host", version)]
#[command(arg_required_else_help = true)]
pub struct JarvisCli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// List the demo scenarios.
    Scenarios,
    /// Run one turn against a scripted sidecar and print every session update.
    Replay(ReplayArgs),
    /// Print the JSON Schema of an envelope family.
    Schema(SchemaArgs),
    /// Check a JSON envelope file against the contract.
    Validate(ValidateArgs),
}

#[derive(Args, Debug)]
pub struct ReplayArgs {
    #[arg(long, short = 's')]
    scenario: String,

    /// Message to send instead of the scenario's placeholder.
    #[arg(long)]
    text: Option<String>,

    #[arg(long, value_enum, default_value_t = DecisionArg::AllowOnce)]
    decision: DecisionArg,

    #[arg(long)]
    chunk_delay_ms: Option<u64>,

    /// Required with `--decision none` unless the environment sets one.
    #[arg(long)]
    permission_timeout_ms: Option<u64>,
}

#[derive(Args, Debug)]
pub struct SchemaArgs {
    #[arg(long, value_enum, default_value_t = EnvelopeKind::Command)]
    kind: EnvelopeKind,
}

#[derive(Args, Debug)]
pub struct ValidateArgs {
    path: PathBuf,

    /// Detected from the envelope's tag field when omitted.
    #[arg(long, value_enum)]
    kind: Option<EnvelopeKind>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum DecisionArg {
    #[value(name = "allow_once")]
    AllowOnce,
    #[value(name = "deny")]
    Deny,
    /// Leave prompts unanswered.
    #[value(name = "none")]
    Skip,
}

impl DecisionArg {
    fn decision(self) -> Option<PermissionDecision> {
        match self {
            Self::AllowOnce => Some(PermissionDecision::AllowOnce),
            Self::Deny => Some(PermissionDecision::Deny),
            Self::Skip => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum EnvelopeKind {
    Command,
    Event,
}

#[derive(Debug, Error)]
pub enum CliError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid envelope: {0}")]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("unknown scenario: {0}")]
    UnknownScenario(String),
    #[error("replay ended without a turn outcome")]
    ReplayInterrupted,
}

pub fn run_jarvis() -> Result<(), CliError> {
    let cli = JarvisCli::parse();
    if let Err(err) = init_logging() {
        eprintln!("failed to init logging: {err}");
        return Err(err);
    }
    run_command(&cli.command)
}

pub fn init_logging() -> Result<(), CliError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_logfmt::builder()
                .layer()
                .with_writer(std::io::stderr),
        )
        .init();
    Ok(())
}

pub fn run_command(command: &Command) -> Result<(), CliError> {
    match command {
        Command::Scenarios => list_scenarios(),
        Command::Replay(args) => run_replay(args),
        Command::Schema(args) => print_schema(args.kind),
        Command::Validate(args) => {
            let tag = validate_file(&args.path, args.kind)?;
            println!("valid {tag}");
            Ok(())
        }
    }
}

fn list_scenarios() -> Result<(), CliError> {
    let mut stdout = std::io::stdout().lock();
    for scenario in demo_scenarios() {
        writeln!(
            stdout,
            "{}\t{}\t{}",
            scenario.id, scenario.mode, scenario.title
        )?;
    }
    Ok(())
}

fn print_schema(kind: EnvelopeKind) -> Result<(), CliError> {
    let schema = match kind {
        EnvelopeKind::Command => serde_json::to_string_pretty(&command_schema())?,
        EnvelopeKind::Event => serde_json::to_string_pretty(&event_schema())?,
    };
    println!("{schema}");
    Ok(())
}

/// Validates the envelope stored at `path` and returns its tag.
pub fn validate_file(path: &Path, kind: Option<EnvelopeKind>) -> Result<&'static str, CliError> {
    let raw = std::fs::read_to_string(path)?;
    let value: serde_json::Value = serde_json::from_str(&raw)?;
    let kind = kind.unwrap_or_else(|| {
        if value.get("event").is_some() {
            EnvelopeKind::Event
        } else {
            EnvelopeKind::Command
        }
    });
    let tag = match kind {
        EnvelopeKind::Command => CommandEnvelope::from_value(value)?.tag(),
        EnvelopeKind::Event => EventEnvelope::from_value(value)?.tag(),
    };
    Ok(tag)
}

#[derive(Debug, Clone)]
pub struct ReplayOptions {
    pub scenario: String,
    pub text: Option<String>,
    pub decision: Option<PermissionDecision>,
    pub config: HostConfig,
}

#[derive(Debug, Serialize)]
pub struct ReplayReport {
    pub updates: Vec<SessionUpdate>,
    pub outcome: TurnOutcome,
    pub snapshot: SessionSnapshot,
    pub audit_lines: Vec<String>,
}

fn run_replay(args: &ReplayArgs) -> Result<(), CliError> {
    let mut config = HostConfig::from_env();
    if let Some(delay) = args.chunk_delay_ms {
        config = config.with_chunk_delay(Duration::from_millis(delay));
    }
    if let Some(timeout) = args.permission_timeout_ms {
        config = config.with_permission_timeout(Some(Duration::from_millis(timeout)));
    }
    let options = ReplayOptions {
        scenario: args.scenario.clone(),
        text: args.text.clone(),
        decision: args.decision.decision(),
        config,
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let report = runtime.block_on(replay(options))?;

    let mut stdout = std::io::stdout().lock();
    for update in &report.updates {
        writeln!(stdout, "{}", serde_json::to_string(update)?)?;
    }
    writeln!(stdout, "{}", serde_json::to_string_pretty(&report.snapshot)?)?;
    for line in &report.audit_lines {
        writeln!(stdout, "{line}")?;
    }
    Ok(())
}

/// Runs one scripted turn, answering every prompt with `options.decision`.
pub async fn replay(options: ReplayOptions) -> Result<ReplayReport, CliError> {
    let scenario = find_scenario(&options.scenario)
        .ok_or_else(|| CliError::UnknownScenario(options.scenario.clone()))?;
    if options.decision.is_none() && options.config.permission_timeout.is_none() {
        return Err(SessionError::InvalidConfig {
            message: "leaving prompts unanswered needs a permission timeout".to_string(),
        }
        .into());
    }
    let request = ChatRequest {
        mode: scenario.mode,
        text: options
            .text
            .clone()
            .unwrap_or_else(|| scenario.input_placeholder.to_string()),
        repo_path: None,
        conversation_id: None,
    };
    let link = Arc::new(ScriptedLink::new(scenario, options.config.chunk_delay));
    let host = Host::new(AgentDirectory::shared(link), options.config);
    let session = host.session(None);
    let mut updates = session.subscribe();
    let handle = session.send_chat_message(request)?;
    tracing::info!(scenario = %options.scenario, turn_id = handle.turn_id, "replaying scenario");

    let mut seen = Vec::new();
    loop {
        let update = match updates.recv().await {
            Ok(update) => update,
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "replay output lagged");
                continue;
            }
            Err(RecvError::Closed) => return Err(CliError::ReplayInterrupted),
        };
        if let SessionUpdate::Event(EventEnvelope::PermissionRequested(payload)) = &update {
            if let Some(decision) = options.decision {
                session.reply_permission(&PermissionReply {
                    request_id: payload.prompt.request_id.clone(),
                    decision,
                });
            }
        }
        let finished = matches!(update, SessionUpdate::TurnFinished(_));
        seen.push(update);
        if finished {
            break;
        }
    }

    let outcome = handle.finished().await;
    let audit_lines = host
        .audit()
        .recent(RECENT_AUDIT_LINES)
        .iter()
        .map(format_line)
        .collect();
    Ok(ReplayReport {
        updates: seen,
        outcome,
        snapshot: session.snapshot(),
        audit_lines,
    })
}
