mod app;
mod cli;
mod commands;
mod serve;

use std::process::ExitCode;

use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;

use crate::cli::Cli;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // RUST_LOG controls log levels, defaulting to info. Logs go to stderr so
    // command output on stdout stays machine readable.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);
    if cli.log_json {
        builder.json().init();
    } else {
        builder.init();
    }

    match commands::run(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!("hostpanel exited with error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
