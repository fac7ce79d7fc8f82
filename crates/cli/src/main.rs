//! buildcache CLI
//!
//! Stores and fetches single entries and whole directory artifacts through
//! the local and remote cache tiers configured in `buildcache.toml`.

// CLI binary needs to output to stdout/stderr - this is intentional
#![allow(clippy::print_stdout, clippy::print_stderr)]

use buildcache_cli::cli::{Cli, CliError, EXIT_OK, exit_code_for, render_error};
use buildcache_cli::command_span;
use buildcache_cli::commands;
use buildcache_cli::tracing::{TracingConfig, init_tracing};
use clap::Parser;
use tracing::Instrument;

fn main() {
    // NOTE: Using eprintln! in panic hook is intentional - tracing infrastructure
    // may be corrupted during a panic, so we use the most reliable output method.
    std::panic::set_hook(Box::new(|panic_info| {
        eprintln!("Application panicked: {panic_info}");
        eprintln!("Internal error occurred. Run with RUST_LOG=debug for more information.");
    }));

    let cli = Cli::parse();

    let tracing_config = TracingConfig {
        format: cli.log_format,
        level: cli.level.into(),
        filter: None,
    };
    if let Err(e) = init_tracing(tracing_config) {
        eprintln!("Warning: {e}");
    }

    let exit_code = run_with_tokio(cli);
    std::process::exit(exit_code);
}

/// Create tokio runtime and run the command
fn run_with_tokio(cli: Cli) -> i32 {
    let rt = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Fatal error: Failed to create tokio runtime: {e}");
            return 1;
        }
    };

    match rt.block_on(run(cli)) {
        Ok(output) => {
            if !output.is_empty() {
                println!("{output}");
            }
            EXIT_OK
        }
        Err(err) => {
            render_error(&err);
            exit_code_for(&err)
        }
    }
}

async fn run(cli: Cli) -> Result<String, CliError> {
    let span = command_span!(cli.command.name());
    async move {
        let config = commands::load_config(cli.config.as_deref())?;
        tracing::debug!(
            remote = ?config.remote.as_ref().map(|r| r.backend),
            "Loaded build cache configuration"
        );
        commands::execute(&cli.command, &config).await
    }
    .instrument(span)
    .await
}
