use std::fmt::Display;

use clap::{ArgAction, Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use crate::utils::CancelToken;

mod commands;
mod error;
mod fetch;
mod manifest;
mod merge;
mod pipeline;
mod pkg;
mod resource;
mod strategy;
mod utils;

#[derive(Debug, Parser)]
#[command(
author,
version,
about,
bin_name("krmpkg"),
subcommand_required(true),
propagate_version(true),
)]
struct Cli {
    /// Enables verbose logging
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch a package from a git or OCI upstream
    Get(commands::get::Options),
    /// Pull upstream changes into a local package
    Update(commands::update::Options),
    /// Show how a local package differs from its upstream
    Diff(commands::diff::Options),
}

pub fn setup_logging(verbosity: u8) {
    let default_level = match verbosity {
        0 => "error",
        1 => "warn",
        2 => "info",
        3 => "debug",
        4.. => "trace",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn display_or_json<T: Serialize + Display>(json: bool, results: T) -> String {
    if json {
        serde_json::to_string(&results).unwrap_or_else(|e| format!("{{\"error\":\"{e}\"}}"))
    } else {
        format!("{}", results)
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    let cancel = CancelToken::new();
    let signal_token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            signal_token.cancel();
        }
    });

    let result = match cli.command {
        Commands::Get(options) => commands::get::get(&options, &cancel)
            .await
            .map(|r| display_or_json(cli.json, r)),
        Commands::Update(options) => commands::update::update(&options, &cancel)
            .await
            .map(|r| display_or_json(cli.json, r)),
        Commands::Diff(options) => commands::diff::diff(&options, &cancel)
            .await
            .map(|r| display_or_json(cli.json, r)),
    };
    match result {
        Ok(r) => {
            println!("{}", r);
            std::process::exit(exitcode::OK);
        }
        Err(e) => {
            tracing::error!("Could not execute command: {e:#}");
            std::process::exit(exitcode::DATAERR);
        }
    };
}
