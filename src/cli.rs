// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormatArg {
    /// Server-sent-events framing (id / event / data lines)
    Sse,
    /// One JSON object per line
    Json,
}

#[derive(Debug, Parser)]
#[command(
    name = "relay",
    about = "Autonomous agent orchestration runtime",
    version
)]
pub struct Cli {
    /// The task prompt.  Reads stdin when omitted.
    pub prompt: Option<String>,

    /// Explicit config file (merged over the discovered layers)
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Model override, e.g. "claude-sonnet-4-5" or "mock"
    #[arg(short, long)]
    pub model: Option<String>,

    /// Event stream framing on stdout
    #[arg(long, value_enum, default_value_t = OutputFormatArg::Json)]
    pub format: OutputFormatArg,

    /// Project root for memory and file injection (default: cwd)
    #[arg(long, value_name = "DIR")]
    pub project_root: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Print the merged configuration and exit
    ShowConfig,
    /// Print the memory system summary for the project and exit
    Memory,
}
