// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::{generate, Shell};
use std::path::PathBuf;

/// Output format for `list-models` / `list-providers` / `show-config`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum OutputFormatArg {
    #[default]
    Table,
    Json,
}

#[derive(Parser, Debug)]
#[command(
    name = "conduit",
    about = "A concurrent orchestration engine for MCP tool servers and multi-provider LLM workflows",
    version,
    long_about = None,
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Path to config file (overrides auto-discovery).
    #[arg(long, short = 'c', global = true)]
    pub config: Option<PathBuf>,

    /// Override `model.provider` from config for this invocation.
    #[arg(long, short = 'p', global = true)]
    pub provider: Option<String>,

    /// Override `model.name` from config for this invocation.
    #[arg(long, short = 'm', global = true)]
    pub model: Option<String>,

    /// Restrict the MCP server pool to this comma-separated subset of
    /// `servers:` entries, e.g. `--servers filesystem,search`.
    #[arg(long, value_delimiter = ',', global = true)]
    pub servers: Option<Vec<String>>,

    /// Total run timeout in seconds (0 = no limit); exits 124 on expiry.
    #[arg(long, value_name = "SECS", global = true)]
    pub run_timeout: Option<u64>,

    /// Increase verbosity (-v = debug, -vv = trace).
    #[arg(long, short = 'v', action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a single prompt to completion and print the final answer.
    ///
    /// Exits once the model produces a plain-text response, `max_iterations`
    /// is reached, or the run timeout expires.
    Query {
        /// The prompt to send.
        prompt: String,
    },

    /// Start an interactive REPL: read a line, run it to completion, print
    /// the reply, repeat. The conversation (and MCP server pool) persists
    /// for the lifetime of the process; exit with Ctrl-D or Ctrl-C.
    Chat,

    /// Same conversational loop as `chat`, without the startup banner — for
    /// use under a pseudo-terminal or from another process over a pipe.
    Interactive,

    /// Run every step of a workflow file against one persistent session.
    ///
    /// A workflow file is a sequence of prompts separated by blank lines (or
    /// `---`); `{{KEY}}` placeholders are substituted from `--var` before
    /// each step runs.
    Workflow {
        /// Path to the workflow file.
        file: PathBuf,

        /// Template variable in KEY=VALUE form, substituted as `{{KEY}}`.
        /// May be repeated: `--var branch=main --var pr=42`.
        #[arg(long = "var", value_name = "KEY=VALUE")]
        vars: Vec<String>,
    },

    /// Run as a long-lived daemon: read newline-delimited JSON requests of
    /// the form `{"prompt": "..."}` from stdin, run each to completion on
    /// one persistent session, and write `{"response": "..."}` (or
    /// `{"error": "..."}`) lines to stdout.
    ///
    /// Used when another process drives this engine programmatically
    /// instead of a human at a terminal.
    Serve,

    /// Print the effective configuration (after merging all layers and
    /// applying CLI overrides) and exit.
    ShowConfig {
        #[arg(long, value_enum, default_value = "table")]
        output_format: OutputFormatArg,
    },

    /// List available models for the configured provider(s).
    ListModels {
        /// Filter by provider name (e.g. "openai", "anthropic", "groq").
        #[arg(long)]
        provider: Option<String>,
        /// Query the provider API for the live list of available models.
        #[arg(long)]
        refresh: bool,
        /// Output as JSON instead of a formatted table.
        #[arg(long)]
        json: bool,
    },

    /// List all supported model providers.
    ListProviders {
        /// Show detailed information for each provider.
        #[arg(long, short = 'v')]
        verbose: bool,
        /// Output as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Generate a shell completion script.
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

/// Parse `--var KEY=VALUE` entries into `(key, value)` pairs, skipping any
/// entry with no `=` (logged by the caller, not here).
pub fn parse_vars(vars: &[String]) -> Vec<(String, String)> {
    vars.iter()
        .filter_map(|kv| kv.split_once('=').map(|(k, v)| (k.to_string(), v.to_string())))
        .collect()
}

pub fn print_completions(shell: Shell) {
    let mut cmd = Cli::command();
    generate(shell, &mut cmd, "conduit", &mut std::io::stdout());
}
