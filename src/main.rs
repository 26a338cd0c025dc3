// TODO: forward SIGTERM to the display server while waiting for readiness;
// today it only relies on the parent-death signal.

mod bootstrap;
mod capabilities;
mod config;
mod context;
mod display;
mod identity;
mod launcher;
mod options;
mod process;
mod profile;
mod render;
mod secret;
mod session;
mod staging;
mod utils;

use clap::Parser;
use config::Config;
use session::Session;
use std::process::ExitCode;
use tracing::error;
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let config = Config::parse();

    let result = Session::new(config).and_then(Session::run);

    match result {
        // The display server never came up: nothing left to supervise.
        Ok(failure) => {
            error!("Not starting the gateway: {failure}");
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("Error: {err:?}");
            ExitCode::FAILURE
        }
    }
}
