// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod cli;

use std::io::Read;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use cli::{Cli, Commands, OutputFormatArg};
use relay_core::{ExecutionContext, Orchestrator};
use relay_memory::MemoryManager;
use relay_tools::ToolRegistry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let mut config = relay_config::load(cli.config.as_deref())?;
    if let Some(model) = &cli.model {
        // "mock" switches the provider too, so offline runs need no key.
        if model == "mock" {
            config.model.provider = "mock".into();
        }
        config.model.name = model.clone();
    }

    if let Some(cmd) = &cli.command {
        match cmd {
            Commands::ShowConfig => {
                println!("{}", serde_yaml::to_string(&config).unwrap_or_default());
                return Ok(());
            }
            Commands::Memory => {
                let root = project_root(&cli)?;
                let memory =
                    MemoryManager::new(root, &config.memory, config.compression.clone());
                println!("{}", memory.summary());
                return Ok(());
            }
        }
    }

    let prompt = match &cli.prompt {
        Some(p) => p.clone(),
        None => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .context("reading prompt from stdin")?;
            buf.trim().to_string()
        }
    };
    if prompt.is_empty() {
        anyhow::bail!("no prompt given (pass it as an argument or on stdin)");
    }

    let root = project_root(&cli)?;
    let mut memory = MemoryManager::new(&root, &config.memory, config.compression.clone());

    // Tool hosts register their implementations here; the runtime itself
    // ships none.  A tool-less agent still converses.
    let registry = Arc::new(ToolRegistry::new());

    let provider = relay_model::from_config(&config.model)?;
    let mut orchestrator = Orchestrator::new(provider, registry, &config);
    let long_term = memory.long_term_context();
    if !long_term.is_empty() {
        orchestrator.prompt_mut().set_long_term_context(Some(long_term));
    }

    let mut ctx = ExecutionContext::new(config.model.name.clone(), &config.agent);
    let history = memory.get_messages_for_api(&mut ctx)?;

    let sse = cli.format == OutputFormatArg::Sse;
    let (tx, mut rx) = tokio::sync::mpsc::channel(256);
    let printer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let framed = if sse {
                relay_core::StreamEvent::to_sse(&event)
            } else {
                relay_core::StreamEvent::to_json_line(&event)
            };
            print!("{framed}");
        }
    });

    let result = orchestrator.run(&prompt, &mut ctx, history, &tx).await;
    drop(tx);
    let _ = printer.await;

    let outcome = result?;
    memory.short_term.replace(outcome.history);

    Ok(())
}

fn project_root(cli: &Cli) -> anyhow::Result<std::path::PathBuf> {
    match &cli.project_root {
        Some(root) => Ok(root.clone()),
        None => std::env::current_dir().context("resolving current directory"),
    }
}

fn init_logging(verbosity: u8) {
    let level = match verbosity {
        0 => "warn",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
        .with(filter)
        .try_init();
}
