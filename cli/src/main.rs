// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! # AgentGuard CLI
//!
//! The `agentguard` binary is the authoring companion to the guard library:
//!
//! - `agentguard init [path]` - write an annotated starter policy
//! - `agentguard validate [path]` - load a policy and print a summary
//! - `agentguard test [path] <tool> key=value ...` - dry-run a tool call
//!   against the policy and print the decision
//!
//! Every command exits non-zero on failure.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod commands;

const DEFAULT_POLICY_PATH: &str = "./agentguard-policy.yaml";

/// AgentGuard - policy-mediated interception for agent tool calls
#[derive(Parser)]
#[command(name = "agentguard")]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, env = "AGENTGUARD_LOG_LEVEL", default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write an annotated sample policy (refuses to overwrite)
    Init {
        /// Output path
        #[arg(value_name = "FILE", default_value = DEFAULT_POLICY_PATH)]
        path: PathBuf,
    },

    /// Load and validate a policy, printing a summary
    Validate {
        /// Policy path
        #[arg(value_name = "FILE", default_value = DEFAULT_POLICY_PATH)]
        path: PathBuf,
    },

    /// Evaluate a hypothetical tool call against a policy
    Test {
        /// Policy path
        #[arg(value_name = "FILE")]
        path: PathBuf,

        /// Tool name to evaluate
        #[arg(value_name = "TOOL")]
        tool_name: String,

        /// Parameters as key=value pairs (values parsed as JSON when
        /// possible, strings otherwise)
        #[arg(value_name = "KEY=VALUE")]
        params: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log_level)),
        )
        .init();

    match cli.command {
        Commands::Init { path } => commands::init(path),
        Commands::Validate { path } => commands::validate(path),
        Commands::Test {
            path,
            tool_name,
            params,
        } => commands::test(path, tool_name, params),
    }
}
