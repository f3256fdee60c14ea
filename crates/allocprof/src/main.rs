use anyhow::Context;
use allocprof::cli::{Cli, Command};
use allocprof::error::exit_code;
use clap::Parser;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    init_logging();
    match run() {
        Ok(()) => ExitCode::from(exit_code::SUCCESS as u8),
        Err(e) => {
            eprintln!("Error: {e:#}");
            if let Some(err) = e.downcast_ref::<allocprof::Error>() {
                ExitCode::from(err.exit_code() as u8)
            } else {
                ExitCode::from(exit_code::GENERAL_ERROR as u8)
            }
        }
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_env("ALLOCPROF_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    cli.validate().map_err(allocprof::Error::InvalidArgument)?;

    match cli.command {
        Command::Collapse {
            input,
            filter,
            output,
            exclusive,
            top,
        } => {
            allocprof::commands::collapse::run(&input, filter.as_deref(), &output, exclusive, top)
                .with_context(|| format!("Failed to collapse {}", input.display()))?;
        }
        Command::Completions { shell } => {
            use clap::CommandFactory;
            let mut cmd = Cli::command();
            clap_complete::generate(shell, &mut cmd, "allocprof", &mut std::io::stdout());
        }
    }

    Ok(())
}
