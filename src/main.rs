// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod cli;

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::io::AsyncBufReadExt;
use tracing::{debug, warn};
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use cli::{Cli, Commands, OutputFormatArg};
use conduit_config::{Config, McpServerConfig, ModelConfig};
use conduit_core::{BudgetPolicy, CoreError, DisplaySink, Orchestrator, OrchestratorEvent, Session};
use conduit_llm::catalog::ModelCatalogEntry;
use conduit_mcp::{ServerEntry, ServerManager, SessionLimits};

/// Process exit codes (§6 CLI surface).
mod exit_code {
    pub const SUCCESS: i32 = 0;
    pub const GENERIC_FAILURE: i32 = 1;
    pub const CONFIG_ERROR: i32 = 2;
    pub const TIMEOUT: i32 = 124;
    pub const INTERRUPTED: i32 = 130;
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let code = match run(cli).await {
        Ok(()) => exit_code::SUCCESS,
        Err(AppError::Config(e)) => {
            eprintln!("configuration error: {e:#}");
            exit_code::CONFIG_ERROR
        }
        Err(AppError::Timeout) => {
            eprintln!("run timed out");
            exit_code::TIMEOUT
        }
        Err(AppError::Interrupted) => exit_code::INTERRUPTED,
        Err(AppError::Other(e)) => {
            eprintln!("error: {e:#}");
            exit_code::GENERIC_FAILURE
        }
    };
    std::process::exit(code);
}

enum AppError {
    Config(anyhow::Error),
    Timeout,
    Interrupted,
    Other(anyhow::Error),
}

impl From<anyhow::Error> for AppError {
    fn from(e: anyhow::Error) -> Self {
        AppError::Other(e)
    }
}

impl From<CoreError> for AppError {
    fn from(e: CoreError) -> Self {
        AppError::Other(e.into())
    }
}

async fn run(cli: Cli) -> Result<(), AppError> {
    match &cli.command {
        Commands::Completions { shell } => {
            cli::print_completions(*shell);
            return Ok(());
        }
        Commands::ShowConfig { output_format } => {
            let config = load_config(&cli).map_err(AppError::Config)?;
            match output_format {
                OutputFormatArg::Json => {
                    println!("{}", serde_json::to_string_pretty(&config).unwrap_or_default());
                }
                OutputFormatArg::Table => {
                    println!("{}", serde_yaml::to_string(&config).unwrap_or_default());
                }
            }
            return Ok(());
        }
        Commands::ListModels { provider, refresh, json } => {
            let config = load_config(&cli).map_err(AppError::Config)?;
            return list_models_cmd(&config, provider.as_deref(), *refresh, *json).await.map_err(Into::into);
        }
        Commands::ListProviders { verbose, json } => {
            return list_providers_cmd(*verbose, *json).map_err(Into::into);
        }
        _ => {}
    }

    let config = load_config(&cli).map_err(AppError::Config)?;
    let model_cfg = resolve_model_config(&config, &cli);

    let provider = conduit_llm::from_config(&model_cfg).map_err(AppError::Config)?;
    let (manager, failures) = connect_servers(&config, &cli).await;
    for (name, err) in &failures {
        warn!(server = %name, error = %err, "MCP server failed to connect, continuing without it");
    }
    let manager = Arc::new(manager);
    let manager_for_shutdown = manager.clone();

    let budget = budget_from_config(&config.agent);
    let session_ceiling = budget.effective_ceiling();
    let sink: Arc<dyn DisplaySink> = Arc::new(ConsoleSink);
    let max_iterations = config.agent.max_iterations;
    let system_prompt = config.agent.system_prompt.clone();
    let run_timeout = cli.run_timeout;

    let body = async move {
        match cli.command {
            Commands::Query { prompt } => {
                let mut session = Session::new(session_ceiling);
                if let Some(sp) = &system_prompt {
                    session.push(conduit_llm::Message::system(sp.clone()));
                }
                let mut orchestrator = Orchestrator::new(provider, manager, budget, sink, max_iterations);
                let reply = orchestrator.run_turn(&mut session, prompt).await?;
                println!("{reply}");
                Ok(())
            }
            Commands::Chat => {
                run_repl(provider, manager, budget, sink, session_ceiling, max_iterations, system_prompt, true).await
            }
            Commands::Interactive => {
                run_repl(provider, manager, budget, sink, session_ceiling, max_iterations, system_prompt, false).await
            }
            Commands::Workflow { file, vars } => {
                run_workflow(provider, manager, budget, sink, session_ceiling, max_iterations, system_prompt, &file, &vars)
                    .await
            }
            Commands::Serve => {
                run_serve(provider, manager, budget, sink, session_ceiling, max_iterations, system_prompt).await
            }
            Commands::ShowConfig { .. }
            | Commands::ListModels { .. }
            | Commands::ListProviders { .. }
            | Commands::Completions { .. } => unreachable!("handled above"),
        }
    };

    let result: Result<(), AppError> = tokio::select! {
        r = run_with_timeout(body, run_timeout) => r,
        _ = tokio::signal::ctrl_c() => Err(AppError::Interrupted),
    };

    manager_for_shutdown.shutdown(Duration::from_secs(5), Duration::from_secs(15)).await;
    result
}

async fn run_with_timeout(
    body: impl std::future::Future<Output = anyhow::Result<()>>,
    run_timeout: Option<u64>,
) -> Result<(), AppError> {
    match run_timeout.filter(|s| *s > 0) {
        Some(secs) => match tokio::time::timeout(Duration::from_secs(secs), body).await {
            Ok(inner) => inner.map_err(AppError::Other),
            Err(_) => Err(AppError::Timeout),
        },
        None => body.await.map_err(AppError::Other),
    }
}

// ── Configuration resolution ──────────────────────────────────────────────────

fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    conduit_config::load(cli.config.as_deref())
}

/// Apply `--provider` / `--model` CLI overrides on top of `config.model`.
fn resolve_model_config(config: &Config, cli: &Cli) -> ModelConfig {
    let mut model_cfg = config.model.clone();
    if let Some(p) = &cli.provider {
        model_cfg.provider = p.clone();
    }
    if let Some(m) = &cli.model {
        model_cfg.name = m.clone();
    }
    model_cfg
}

fn budget_from_config(agent: &conduit_config::AgentConfig) -> BudgetPolicy {
    BudgetPolicy {
        context_window: agent.context_window,
        overhead_reserve: agent.overhead_reserve,
        trigger_fraction: agent.compaction_threshold,
        keep_recent: agent.compaction_keep_recent,
        tool_result_token_cap: agent.tool_result_token_cap,
    }
}

/// Build `ServerEntry`s from `config.servers`, applying the `--servers`
/// subset filter and falling back to the agent's default timeouts for any
/// server that doesn't override them.
async fn connect_servers(config: &Config, cli: &Cli) -> (ServerManager, Vec<(String, conduit_mcp::McpError)>) {
    let mut names: Vec<&String> = config.servers.keys().collect();
    names.sort();

    let entries: Vec<ServerEntry> = names
        .into_iter()
        .filter(|name| match &cli.servers {
            Some(subset) => subset.iter().any(|s| s == *name),
            None => true,
        })
        .map(|name| {
            let s: &McpServerConfig = &config.servers[name];
            ServerEntry {
                name: name.clone(),
                command: s.command.clone(),
                args: s.args.clone(),
                env: s.env.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
                tee_stderr: s.tee_stderr,
                limits: SessionLimits { inactivity_timeout: s.inactivity_timeout(), hard_ceiling: s.hard_ceiling() },
            }
        })
        .collect();

    ServerManager::connect_all(entries).await
}

// ── Interactive / workflow / serve runners ────────────────────────────────────

#[allow(clippy::too_many_arguments)]
async fn run_repl(
    provider: Box<dyn conduit_llm::ModelProvider>,
    manager: Arc<ServerManager>,
    budget: BudgetPolicy,
    sink: Arc<dyn DisplaySink>,
    session_ceiling: usize,
    max_iterations: u32,
    system_prompt: Option<String>,
    banner: bool,
) -> anyhow::Result<()> {
    if banner {
        println!("conduit chat — model {}/{}. Ctrl-D to exit.", provider.name(), provider.model_name());
    }

    let mut session = Session::new(session_ceiling);
    if let Some(sp) = &system_prompt {
        session.push(conduit_llm::Message::system(sp.clone()));
    }
    let mut orchestrator = Orchestrator::new(provider, manager, budget, sink, max_iterations);

    let stdin = tokio::io::stdin();
    let mut reader = tokio::io::BufReader::new(stdin).lines();
    loop {
        if banner {
            print!("> ");
            std::io::stdout().flush().ok();
        }
        let line = match reader.next_line().await.context("reading stdin")? {
            Some(l) => l,
            None => break, // EOF (Ctrl-D)
        };
        let input = line.trim();
        if input.is_empty() {
            continue;
        }
        match orchestrator.run_turn(&mut session, input.to_string()).await {
            Ok(reply) => println!("{reply}"),
            Err(e) => eprintln!("error: {e:#}"),
        }
    }
    Ok(())
}

/// Splits a workflow file into prompt steps on blank lines or `---` rules,
/// then substitutes `{{KEY}}` placeholders from `--var`.
fn parse_workflow_steps(text: &str, vars: &[(String, String)]) -> Vec<String> {
    let mut steps = Vec::new();
    let mut current = String::new();
    for line in text.lines() {
        if line.trim() == "---" || (line.trim().is_empty() && !current.trim().is_empty()) {
            steps.push(std::mem::take(&mut current));
            continue;
        }
        if !current.is_empty() {
            current.push('\n');
        }
        current.push_str(line);
    }
    if !current.trim().is_empty() {
        steps.push(current);
    }
    steps
        .into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .map(|s| substitute_vars(&s, vars))
        .collect()
}

fn substitute_vars(text: &str, vars: &[(String, String)]) -> String {
    let mut out = text.to_string();
    for (k, v) in vars {
        out = out.replace(&format!("{{{{{k}}}}}"), v);
    }
    out
}

#[allow(clippy::too_many_arguments)]
async fn run_workflow(
    provider: Box<dyn conduit_llm::ModelProvider>,
    manager: Arc<ServerManager>,
    budget: BudgetPolicy,
    sink: Arc<dyn DisplaySink>,
    session_ceiling: usize,
    max_iterations: u32,
    system_prompt: Option<String>,
    file: &std::path::Path,
    vars: &[String],
) -> anyhow::Result<()> {
    let text = std::fs::read_to_string(file).with_context(|| format!("reading workflow file {}", file.display()))?;
    let vars = cli::parse_vars(vars);
    let steps = parse_workflow_steps(&text, &vars);
    if steps.is_empty() {
        anyhow::bail!("workflow file {} has no steps", file.display());
    }

    let mut session = Session::new(session_ceiling);
    if let Some(sp) = &system_prompt {
        session.push(conduit_llm::Message::system(sp.clone()));
    }
    let mut orchestrator = Orchestrator::new(provider, manager, budget, sink, max_iterations);

    for (i, step) in steps.iter().enumerate() {
        debug!(step = i + 1, total = steps.len(), "running workflow step");
        let reply = orchestrator.run_turn(&mut session, step.clone()).await?;
        println!("## Step {}\n{}\n", i + 1, reply);
    }
    Ok(())
}

#[derive(serde::Deserialize)]
struct ServeRequest {
    prompt: String,
}

#[derive(serde::Serialize)]
struct ServeResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    response: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

/// Reads one JSON request per line from stdin, runs it to completion on a
/// single persistent session, and writes one JSON response per line to
/// stdout. Used when conduit is driven programmatically rather than from a
/// terminal.
async fn run_serve(
    provider: Box<dyn conduit_llm::ModelProvider>,
    manager: Arc<ServerManager>,
    budget: BudgetPolicy,
    sink: Arc<dyn DisplaySink>,
    session_ceiling: usize,
    max_iterations: u32,
    system_prompt: Option<String>,
) -> anyhow::Result<()> {
    let mut session = Session::new(session_ceiling);
    if let Some(sp) = &system_prompt {
        session.push(conduit_llm::Message::system(sp.clone()));
    }
    let mut orchestrator = Orchestrator::new(provider, manager, budget, sink, max_iterations);

    let stdin = tokio::io::stdin();
    let mut reader = tokio::io::BufReader::new(stdin).lines();
    let stdout = std::io::stdout();
    while let Some(line) = reader.next_line().await.context("reading stdin")? {
        if line.trim().is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<ServeRequest>(&line) {
            Ok(req) => match orchestrator.run_turn(&mut session, req.prompt).await {
                Ok(reply) => ServeResponse { response: Some(reply), error: None },
                Err(e) => ServeResponse { response: None, error: Some(e.to_string()) },
            },
            Err(e) => ServeResponse { response: None, error: Some(format!("invalid request: {e}")) },
        };
        let mut out = stdout.lock();
        serde_json::to_writer(&mut out, &response)?;
        out.write_all(b"\n")?;
        out.flush()?;
    }
    Ok(())
}

// ── Display sink ───────────────────────────────────────────────────────────────

/// Streams text deltas to stdout as they arrive; logs everything else via
/// `tracing` so it only shows up with `-v`.
struct ConsoleSink;

impl DisplaySink for ConsoleSink {
    fn emit(&self, event: OrchestratorEvent) {
        match event {
            OrchestratorEvent::TextDelta(delta) => {
                print!("{delta}");
                std::io::stdout().flush().ok();
            }
            OrchestratorEvent::ToolCallStarted { tool_name, .. } => {
                debug!(tool = %tool_name, "calling tool");
            }
            OrchestratorEvent::ToolCallFinished { tool_name, is_error, .. } => {
                debug!(tool = %tool_name, is_error, "tool call finished");
            }
            OrchestratorEvent::ContextCompacted { tokens_before, tokens_after } => {
                debug!(tokens_before, tokens_after, "context compacted");
            }
            OrchestratorEvent::TokenUsage { input, output, .. } => {
                debug!(input, output, "token usage");
            }
            OrchestratorEvent::MaxIterationsReached { iterations } => {
                warn!(iterations, "max iterations reached without a final answer");
            }
            OrchestratorEvent::Error(msg) => {
                warn!(error = %msg, "recoverable error during turn");
            }
            OrchestratorEvent::TextComplete(_)
            | OrchestratorEvent::ThinkingDelta(_)
            | OrchestratorEvent::ThinkingComplete(_)
            | OrchestratorEvent::TurnComplete => {}
        }
    }
}

// ── list-models / list-providers (ambient, not part of the core engine) ──────

async fn list_models_cmd(config: &Config, provider_filter: Option<&str>, refresh: bool, as_json: bool) -> anyhow::Result<()> {
    if let Some(prov) = provider_filter {
        if conduit_llm::get_driver(prov).is_none() {
            eprintln!("Unknown provider: {prov:?}");
            eprintln!("\nAvailable providers (run `conduit list-providers` for details):");
            for d in conduit_llm::list_drivers() {
                eprintln!("  {:20} {}", d.id, d.name);
            }
            anyhow::bail!("invalid provider: {prov}");
        }
    }

    let entries: Vec<ModelCatalogEntry> = if refresh {
        let mut model_cfg = config.model.clone();
        if let Some(prov) = provider_filter {
            model_cfg.provider = prov.to_string();
        }
        let model = conduit_llm::from_config(&model_cfg)?;
        let mut live = model.list_models().await?;
        if let Some(prov) = provider_filter {
            live.retain(|e| e.provider == prov);
        }
        live
    } else {
        let mut all = conduit_llm::catalog::static_catalog();
        if let Some(prov) = provider_filter {
            all.retain(|e| e.provider == prov);
        }
        all.sort_by(|a, b| a.provider.cmp(&b.provider).then(a.id.cmp(&b.id)));
        all
    };

    if as_json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    if entries.is_empty() {
        println!("No models found.");
        return Ok(());
    }

    let id_w = entries.iter().map(|e| e.id.len()).max().unwrap_or(10).max(10);
    let prov_w = entries.iter().map(|e| e.provider.len()).max().unwrap_or(8).max(8);

    println!(
        "{:<id_w$}  {:<prov_w$}  {:>12}  {:>16}  DESCRIPTION",
        "ID",
        "PROVIDER",
        "CTX WINDOW",
        "MAX OUT TOKENS",
        id_w = id_w,
        prov_w = prov_w,
    );
    println!("{}", "-".repeat(id_w + prov_w + 50));

    for e in &entries {
        let ctx = if e.context_window == 0 { "  -".to_string() } else { format!("{:>12}", e.context_window) };
        let max_out = if e.max_output_tokens == 0 { "  -".to_string() } else { format!("{:>16}", e.max_output_tokens) };
        println!(
            "{:<id_w$}  {:<prov_w$}  {}  {}  {}",
            e.id,
            e.provider,
            ctx,
            max_out,
            e.description,
            id_w = id_w,
            prov_w = prov_w,
        );
    }
    println!("\nTotal: {} model(s)", entries.len());
    Ok(())
}

fn list_providers_cmd(verbose: bool, as_json: bool) -> anyhow::Result<()> {
    let drivers = conduit_llm::list_drivers();

    if as_json {
        #[derive(serde::Serialize)]
        struct ProviderJson {
            id: &'static str,
            name: &'static str,
            description: &'static str,
            default_api_key_env: Option<&'static str>,
            default_base_url: Option<&'static str>,
            requires_api_key: bool,
        }
        let rows: Vec<ProviderJson> = drivers
            .iter()
            .map(|d| ProviderJson {
                id: d.id,
                name: d.name,
                description: d.description,
                default_api_key_env: d.default_api_key_env,
                default_base_url: d.default_base_url,
                requires_api_key: d.requires_api_key,
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    println!("Supported Model Providers ({} total)\n", drivers.len());

    if verbose {
        for d in drivers {
            println!("  {} — {}", d.id, d.name);
            println!("    {}", d.description);
            if let Some(env) = d.default_api_key_env {
                println!("    API key env : {env}");
            }
            if let Some(url) = d.default_base_url {
                println!("    Default URL : {url}");
            }
            if !d.requires_api_key {
                println!("    Auth        : none required");
            }
            println!();
        }
    } else {
        let id_w = drivers.iter().map(|d| d.id.len()).max().unwrap_or(10).max(10);
        let name_w = drivers.iter().map(|d| d.name.len()).max().unwrap_or(8).max(8);
        println!("{:<id_w$}  {:<name_w$}  DESCRIPTION", "ID", "NAME");
        println!("{}", "-".repeat(id_w + name_w + 40));
        for d in drivers {
            println!("{:<id_w$}  {:<name_w$}  {}", d.id, d.name, d.description);
        }
        println!("\nUse `conduit list-providers --verbose` for API key and URL details.");
        println!("Use `conduit list-models --provider <ID>` to see models for a specific provider.");
    }
    Ok(())
}

// ── Logging ────────────────────────────────────────────────────────────────────

/// Initializes `tracing` to stderr. `-v` (debug) / `-vv` (trace) raise the
/// default level; `CONDUIT_LOG` (read via `EnvFilter`'s default env lookup)
/// takes priority over both when set.
fn init_logging(verbosity: u8) {
    let level = match verbosity {
        0 => "warn",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_env("CONDUIT_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(level));

    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .try_init();
}
