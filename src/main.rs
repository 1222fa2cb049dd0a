use std::process::ExitCode;

use clap::Parser;
use log::{error, info};
use smtp2tg_router::{Cli, Relay, SmtpServer};

fn main() -> ExitCode {
    // a missing .env file is fine
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = match cli.into_config() {
        Ok(config) => config,
        Err(e) => {
            error!("[smtp2tg] Configuration error: {e}");
            return ExitCode::FAILURE;
        }
    };
    info!("[smtp2tg] Starting with {config:?}");

    let relay = match Relay::from_config(&config) {
        Ok(relay) => relay,
        Err(e) => {
            error!("[smtp2tg] Cannot create Telegram client: {e}");
            return ExitCode::FAILURE;
        }
    };

    let server = SmtpServer::new(relay, config.session_settings(), config.read_timeout());
    let listener = match server.bind(config.listen) {
        Ok(listener) => listener,
        Err(e) => {
            error!("[smtp2tg] Cannot listen on {}: {e}", config.listen);
            return ExitCode::FAILURE;
        }
    };

    match server.serve(listener) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("[smtp2tg] Server error: {e}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(feature = "env_logger")]
fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();
}

#[cfg(not(feature = "env_logger"))]
fn init_logging(_verbose: bool) {}
