//! nvtune elevated helper (nvtune-helper)
//!
//! Runs under pkexec to perform privileged GPU mutations for the
//! unprivileged frontend. One invocation executes exactly one command and
//! emits exactly one JSON object on stdout; on failure the object carries
//! `"success": false` and the process exits non-zero.
//!
//! # Protocol discipline
//! - stdout is reserved for the single response object
//! - all logging goes to stderr
//! - the command surface is defined in `nvt-protocol`

mod commands;

use std::process::ExitCode;

use tracing::debug;
use tracing_subscriber::EnvFilter;

use nvt_protocol::{help_text, HelperCommand, HelperResponse};

fn init_logging() {
    // stdout carries the protocol response; logs must stay on stderr
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> ExitCode {
    init_logging();

    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.is_empty() {
        eprintln!("{}", help_text());
        println!("{}", HelperResponse::err("missing command").to_json());
        return ExitCode::FAILURE;
    }

    let command = match HelperCommand::parse(&args) {
        Ok(command) => command,
        Err(message) => {
            println!("{}", HelperResponse::err(message).to_json());
            return ExitCode::FAILURE;
        }
    };

    debug!("Executing helper command: {}", command.name());

    match commands::dispatch(&command) {
        Ok(response) => {
            println!("{}", response.to_json());
            ExitCode::SUCCESS
        }
        Err(e) => {
            println!("{}", HelperResponse::err(e.to_string()).to_json());
            ExitCode::FAILURE
        }
    }
}
