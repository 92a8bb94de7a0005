//! intake-cli — 配置校验、依赖健康检查、单文档抽取与作业队列操作的命令行工具
//!
//! Usage:
//!   intake-cli check-config                      Validate the configuration file
//!   intake-cli health                            Probe every configured service
//!   intake-cli extract <file_ref> <file_name>    Run the fallback chain for one document
//!   intake-cli enqueue <document_id> <file_ref> <file_name>
//!   intake-cli status <document_id>              Show the latest job of a document
//!   intake-cli worker [--once]                   Process queued jobs

use anyhow::{anyhow, bail, Context};
use intake_orchestrator::jobs::{EnqueueRequest, ProcessOutcome};
use intake_orchestrator::{
    ClassificationHints, DocumentRef, Orchestrator, OrchestratorConfig, Priority,
};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

fn main() {
    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        print_usage();
        std::process::exit(1);
    }

    let command = args[1].as_str();
    let rest = &args[2..];
    let result = match command {
        "version" | "--version" | "-V" => {
            cmd_version();
            Ok(())
        }
        "help" | "--help" | "-h" => {
            print_usage();
            Ok(())
        }
        "check-config" => cmd_check_config(rest),
        "health" | "extract" | "enqueue" | "status" | "worker" => run_async(command, rest),
        other => {
            eprintln!("Unknown command: {other}");
            eprintln!();
            print_usage();
            std::process::exit(1);
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}

fn print_usage() {
    println!(
        r#"intake-cli — 文档抽取编排命令行工具

USAGE:
    intake-cli <COMMAND> [OPTIONS]

COMMANDS:
    check-config                                Validate the configuration file
    health                                      Probe every configured service now
    extract <file_ref> <file_name>              Run the fallback chain for one document
    enqueue <document_id> <file_ref> <file_name>
                                                Queue a document for extraction
    status <document_id>                        Show the latest job of a document
    worker [--once]                             Process queued jobs until Ctrl-C
    version                                     Show version information
    help                                        Show this help message

OPTIONS:
    --config <path>           Configuration file (default: intake.yaml)
    --store <path>            Job snapshot file (default: intake-jobs.json)
    --client-type <name>      Classification hint
    --document-type <name>    Classification hint
    --priority <level>        low | normal | high | urgent

ENVIRONMENT:
    INTAKE_CONFIG             Configuration file path
    INTAKE_JOB_STORE          Job snapshot file path
    INTAKE_LOG                Log filter (falls back to RUST_LOG)"#
    );
}

fn cmd_version() {
    println!("intake-cli {}", env!("CARGO_PKG_VERSION"));
}

fn flag_value<'a>(args: &'a [String], name: &str) -> Option<&'a str> {
    args.iter()
        .position(|a| a == name)
        .and_then(|i| args.get(i + 1))
        .map(String::as_str)
}

/// Positional arguments, skipping `--flag value` pairs and bare `--switches`.
fn positionals(args: &[String]) -> Vec<&str> {
    let mut out = Vec::new();
    let mut i = 0;
    while i < args.len() {
        let a = args[i].as_str();
        if a == "--once" {
            i += 1;
        } else if a.starts_with("--") {
            i += 2;
        } else {
            out.push(a);
            i += 1;
        }
    }
    out
}

fn config_path(args: &[String]) -> PathBuf {
    flag_value(args, "--config")
        .map(PathBuf::from)
        .or_else(|| std::env::var("INTAKE_CONFIG").ok().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("intake.yaml"))
}

fn store_path(args: &[String]) -> PathBuf {
    flag_value(args, "--store")
        .map(PathBuf::from)
        .or_else(|| std::env::var("INTAKE_JOB_STORE").ok().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("intake-jobs.json"))
}

fn load_config(args: &[String]) -> anyhow::Result<OrchestratorConfig> {
    let path = config_path(args);
    OrchestratorConfig::from_path(&path)
        .with_context(|| format!("loading configuration from {}", path.display()))
}

fn hints(args: &[String]) -> ClassificationHints {
    ClassificationHints::new(
        flag_value(args, "--client-type"),
        flag_value(args, "--document-type"),
    )
}

fn cmd_check_config(args: &[String]) -> anyhow::Result<()> {
    let config = load_config(args)?;
    println!("Configuration OK: {}", config_path(args).display());
    for (name, service) in &config.services {
        println!(
            "  {:<16} {} ({} rpm, breaker {}/{}ms, {} credential(s))",
            name,
            service.base_url,
            service.requests_per_minute,
            service.failure_threshold,
            service.cooldown_ms,
            service.credentials.len()
        );
    }
    println!(
        "  primary: {}",
        if config.fallback.primary.is_empty() {
            "-".to_string()
        } else {
            config.fallback.primary.join(" -> ")
        }
    );
    println!(
        "  fallback_1: {}",
        config.fallback.secondary.as_deref().unwrap_or("-")
    );
    println!(
        "  fallback_2: {}",
        if config.fallback.template.enabled { "template" } else { "disabled" }
    );
    Ok(())
}

fn run_async(command: &str, args: &[String]) -> anyhow::Result<()> {
    intake_orchestrator::logging::init_tracing("info");
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("starting async runtime")?;
    runtime.block_on(async {
        let config = load_config(args)?;
        let orchestrator = Orchestrator::builder(config)
            .job_store_path(store_path(args))
            .build()
            .await?;
        match command {
            "health" => cmd_health(&orchestrator).await,
            "extract" => cmd_extract(&orchestrator, args).await,
            "enqueue" => cmd_enqueue(&orchestrator, args).await,
            "status" => cmd_status(&orchestrator, args).await,
            "worker" => cmd_worker(&orchestrator, args).await,
            other => Err(anyhow!("unhandled command {other}")),
        }
    })
}

async fn cmd_health(orchestrator: &Orchestrator) -> anyhow::Result<()> {
    for health in orchestrator.refresh_health().await {
        println!(
            "{:<16} {:<9} {:>6}ms  {}",
            health.service_name,
            health.status.as_str(),
            health.latency_ms.unwrap_or(0),
            health.probe_error.unwrap_or_default()
        );
    }
    for (name, snap) in orchestrator.guard_snapshots().await {
        println!(
            "{:<16} circuit={:?} failures={} in_window={} next_wait={}ms",
            name,
            snap.circuit_breaker.state,
            snap.circuit_breaker.failure_count,
            snap.rate_limiter.in_window,
            snap.rate_limiter.estimated_wait_ms.unwrap_or(0)
        );
    }
    Ok(())
}

async fn cmd_extract(orchestrator: &Orchestrator, args: &[String]) -> anyhow::Result<()> {
    let pos = positionals(args);
    let [file_ref, file_name] = pos.as_slice() else {
        bail!("usage: intake-cli extract <file_ref> <file_name>");
    };
    let doc = DocumentRef {
        document_id: format!("adhoc-{}", uuid::Uuid::new_v4()),
        file_ref: file_ref.to_string(),
        file_name: file_name.to_string(),
        classification: hints(args),
    };
    let result = orchestrator.chain().execute_with_fallback(&doc).await;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

async fn cmd_enqueue(orchestrator: &Orchestrator, args: &[String]) -> anyhow::Result<()> {
    let pos = positionals(args);
    let [document_id, file_ref, file_name] = pos.as_slice() else {
        bail!("usage: intake-cli enqueue <document_id> <file_ref> <file_name>");
    };
    let priority = match flag_value(args, "--priority") {
        Some(p) => p.parse::<Priority>().map_err(|e| anyhow!(e))?,
        None => Priority::Normal,
    };
    let job = orchestrator
        .enqueue(EnqueueRequest {
            document_id: document_id.to_string(),
            file_ref: file_ref.to_string(),
            file_name: file_name.to_string(),
            classification: hints(args),
            priority,
        })
        .await?;
    println!("queued job {} for document {}", job.id, job.document_id);
    Ok(())
}

async fn cmd_status(orchestrator: &Orchestrator, args: &[String]) -> anyhow::Result<()> {
    let pos = positionals(args);
    let [document_id] = pos.as_slice() else {
        bail!("usage: intake-cli status <document_id>");
    };
    match orchestrator.get_job_status(document_id).await? {
        Some(view) => println!("{}", serde_json::to_string_pretty(&view)?),
        None => bail!("no job found for document {document_id}"),
    }
    Ok(())
}

async fn cmd_worker(orchestrator: &Orchestrator, args: &[String]) -> anyhow::Result<()> {
    let processor = orchestrator.processor();
    if args.iter().any(|a| a == "--once") {
        loop {
            match processor.process_next().await? {
                ProcessOutcome::Idle => break,
                outcome => println!("{outcome:?}"),
            }
        }
        println!("{}", serde_json::to_string_pretty(&processor.stats().await?)?);
        return Ok(());
    }

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            signal.cancel();
        }
    });
    processor.run(shutdown).await;
    Ok(())
}
