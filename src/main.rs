//! runectl - Docker-compatible command line for containerd
//!
//! This is the main CLI entry point. The same binary is re-entered by the
//! runtime as the OCI hook and by the shim as the container logging child.

use clap::error::ErrorKind;
use clap::Parser;
use runectl::cli::{self, Cli};
use runectl::error::RuneError;
use runectl::hook::{self, HOOK_COMMAND};
use runectl::logging::{self, SENTINEL};
use std::path::Path;
use std::process::ExitCode;
use std::sync::Mutex;
use tracing::error;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

fn env_filter(debug: bool, default: &str) -> EnvFilter {
    if debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
    }
}

fn exit_status(code: i32) -> ExitCode {
    ExitCode::from((code & 0xff) as u8)
}

#[tokio::main]
async fn main() -> ExitCode {
    let argv: Vec<String> = std::env::args().collect();
    match argv.get(1).map(String::as_str) {
        Some(SENTINEL) => logging_child(&argv),
        Some(HOOK_COMMAND) => oci_hook(&argv[1..]).await,
        _ => command(argv).await,
    }
}

async fn command(argv: Vec<String>) -> ExitCode {
    let cli = match Cli::try_parse_from(argv) {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => ExitCode::SUCCESS,
                _ => exit_status(125),
            };
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(env_filter(cli.global.debug, "warn"))
        .with_writer(std::io::stderr)
        .init();

    match cli::execute(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            // Attached exit codes pass through silently; aggregated
            // failures were already reported per target.
            if !matches!(e, RuneError::ExitCode(_) | RuneError::Aggregate { .. }) {
                eprintln!("Error: {}", e);
            }
            exit_status(e.exit_code())
        }
    }
}

async fn oci_hook(argv: &[String]) -> ExitCode {
    let file_layer = hook::open_log(argv).map(|f| fmt::layer().with_ansi(false).with_writer(Mutex::new(f)));
    tracing_subscriber::registry()
        .with(env_filter(false, "info"))
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();

    match hook::main(argv.to_vec()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn logging_child(argv: &[String]) -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter(false, "warn"))
        .with_writer(std::io::stderr)
        .init();

    let Some(data_store) = argv.get(2) else {
        error!("logging child started without a data store path");
        return ExitCode::FAILURE;
    };
    match logging::run_logging_child(Path::new(data_store)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("logging child failed: {}", e);
            ExitCode::FAILURE
        }
    }
}
