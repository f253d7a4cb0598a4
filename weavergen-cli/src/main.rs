//! `weavergen` — run, validate, catalog and mine BPMN generation pipelines.
//!
//! Exit codes for embedding callers: 0 verdict pass, 2 verdict fail,
//! 3 run error, 4 startup error. The run report goes to stdout as JSON;
//! diagnostics go to stderr.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use weavergen_core::artifacts::{self, RunReport};
use weavergen_core::engine::WorkflowEngine;
use weavergen_core::handlers::register_builtin_tasks;
use weavergen_core::mining::ProcessMiner;
use weavergen_core::model::{self, export};
use weavergen_core::registry::ServiceTaskRegistry;
use weavergen_core::{EngineConfig, EngineError, Value};

#[derive(Parser)]
#[command(name = "weavergen", about = "BPMN-first code-generation workflow engine")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Execute a process definition and write the artefact trio.
    Run {
        /// BPMN process definition.
        process: PathBuf,
        /// Initial context as a JSON object file.
        #[arg(long)]
        context: Option<PathBuf>,
        /// Artefact output directory.
        #[arg(long, default_value = "weavergen-out")]
        out: PathBuf,
        /// Run every task in mock mode.
        #[arg(long)]
        mock: bool,
        /// Engine options as key=value (see the recognized option table).
        #[arg(long = "option", value_name = "KEY=VALUE")]
        options: Vec<String>,
        /// Append this run's XES trace to an archive directory for mining.
        #[arg(long)]
        archive: Option<PathBuf>,
    },
    /// Parse and verify a process definition without executing it.
    Validate {
        process: PathBuf,
    },
    /// Print the registered service-task catalog.
    Catalog,
    /// Mine a candidate process model from an XES trace archive.
    Mine {
        /// Directory of .xes files.
        archive: PathBuf,
        /// Where to write the candidate BPMN (stdout when omitted).
        #[arg(long)]
        out: Option<PathBuf>,
        /// Process id for the mined model.
        #[arg(long, default_value = "mined")]
        process_id: String,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("failed to start runtime: {e}");
            return ExitCode::from(4);
        }
    };

    let code = runtime.block_on(async {
        match cli.command {
            Command::Run {
                process,
                context,
                out,
                mock,
                options,
                archive,
            } => run(process, context, out, mock, options, archive).await,
            Command::Validate { process } => validate(process).await,
            Command::Catalog => catalog(),
            Command::Mine {
                archive,
                out,
                process_id,
            } => mine(archive, out, process_id).await,
        }
    });

    match code {
        Ok(code) => ExitCode::from(code),
        Err(report) => {
            eprintln!("{report:#}");
            ExitCode::from(exit_code_for(&report))
        }
    }
}

/// Startup-class failures exit 4; everything else that escapes is a run
/// error (3).
fn exit_code_for(report: &anyhow::Error) -> u8 {
    match report.downcast_ref::<EngineError>() {
        Some(e) if e.is_startup() => 4,
        _ => 3,
    }
}

fn build_engine(config: EngineConfig, out: &std::path::Path) -> Result<WorkflowEngine> {
    let mut registry = ServiceTaskRegistry::new();
    register_builtin_tasks(&mut registry, out.to_path_buf())?;
    Ok(WorkflowEngine::new(registry, config))
}

fn parse_options(pairs: &[String], config: &mut EngineConfig) -> Result<()> {
    for pair in pairs {
        let (key, value) = pair
            .split_once('=')
            .with_context(|| format!("option '{pair}' is not key=value"))?;
        config.apply(key.trim(), value.trim())?;
    }
    Ok(())
}

async fn run(
    process: PathBuf,
    context: Option<PathBuf>,
    out: PathBuf,
    mock: bool,
    options: Vec<String>,
    archive: Option<PathBuf>,
) -> Result<u8> {
    let mut config = EngineConfig::default();
    parse_options(&options, &mut config)?;
    if mock {
        config.mock_enabled_globally = true;
    }

    let xml = std::fs::read_to_string(&process)
        .with_context(|| format!("reading {}", process.display()))?;
    let model = model::load_process(&xml)?;

    let initial: BTreeMap<String, Value> = match context {
        Some(path) => {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            let json: serde_json::Value = serde_json::from_str(&raw)
                .with_context(|| format!("parsing {}", path.display()))?;
            match json {
                serde_json::Value::Object(map) => map
                    .into_iter()
                    .map(|(k, v)| (k, Value::from(v)))
                    .collect(),
                _ => anyhow::bail!("context file must hold a JSON object"),
            }
        }
        None => BTreeMap::new(),
    };

    let engine = build_engine(config, &out)?;
    let token = CancellationToken::new();
    spawn_ctrl_c_handler(token.clone());

    let result = engine.run_cancellable(&model, initial, token).await?;
    let paths = artifacts::write_artifacts(&out, &result).await?;

    if let Some(archive_dir) = archive {
        tokio::fs::create_dir_all(&archive_dir).await?;
        let archived = archive_dir.join(format!("{}.xes", result.run_id));
        tokio::fs::copy(&paths.xes, &archived).await?;
        tracing::info!(path = %archived.display(), "trace archived");
    }

    let report = RunReport::from_result(&result);
    println!("{}", serde_json::to_string_pretty(&report)?);

    let failing = report.failing_tasks(3);
    if !failing.is_empty() {
        eprintln!("failing tasks: {}", failing.join(", "));
    }
    if result.status == weavergen_core::RunStatus::Cancelled {
        let compensated: Vec<&str> = report
            .node_states
            .iter()
            .filter(|(_, s)| **s == weavergen_core::NodeState::Compensated)
            .map(|(id, _)| id.as_str())
            .collect();
        eprintln!(
            "run cancelled; compensated: [{}]",
            compensated.join(", ")
        );
    }
    eprintln!(
        "verdict: {} (score {:.3}); artefacts in {}",
        if report.passed { "passed" } else { "failed" },
        report.score.total,
        out.display()
    );

    Ok(result.exit_code() as u8)
}

fn spawn_ctrl_c_handler(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received; cancelling run");
            token.cancel();
        }
    });
}

async fn validate(process: PathBuf) -> Result<u8> {
    let xml = std::fs::read_to_string(&process)
        .with_context(|| format!("reading {}", process.display()))?;
    match model::load_process(&xml) {
        Ok(model) => {
            println!(
                "{}",
                serde_json::json!({
                    "process_id": model.id,
                    "nodes": model.graph.node_count(),
                    "flows": model.graph.edge_count(),
                    "fingerprint": model.fingerprint_hex(),
                    "valid": true,
                })
            );
            Ok(0)
        }
        Err(e) => {
            eprintln!("{e}");
            Ok(4)
        }
    }
}

fn catalog() -> Result<u8> {
    let mut registry = ServiceTaskRegistry::new();
    register_builtin_tasks(&mut registry, PathBuf::from("weavergen-out"))?;
    for definition in registry.list(None) {
        if let Some(entry) = registry.describe(&definition.id) {
            println!("{entry}");
        }
    }
    Ok(0)
}

async fn mine(archive: PathBuf, out: Option<PathBuf>, process_id: String) -> Result<u8> {
    let mut traces = Vec::new();
    let mut dir = tokio::fs::read_dir(&archive)
        .await
        .with_context(|| format!("reading {}", archive.display()))?;
    while let Some(entry) = dir.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) == Some("xes") {
            let xml = tokio::fs::read_to_string(&path).await?;
            for trace in weavergen_core::xes::read_traces(&xml)? {
                traces.push(trace.tasks);
            }
        }
    }
    if traces.is_empty() {
        anyhow::bail!("no traces found in {}", archive.display());
    }
    tracing::info!(count = traces.len(), "traces loaded from archive");

    let mut registry = ServiceTaskRegistry::new();
    register_builtin_tasks(&mut registry, PathBuf::from("weavergen-out"))?;

    let Some(candidate) = ProcessMiner::mine(&process_id, &traces, &registry) else {
        anyhow::bail!("mining produced no candidate model");
    };
    let xml = export::to_bpmn_xml(&candidate);
    match out {
        Some(path) => {
            tokio::fs::write(&path, xml).await?;
            eprintln!("candidate model written to {}", path.display());
        }
        None => println!("{xml}"),
    }
    Ok(0)
}
