use std::process::ExitCode;

use env_logger::Env;
use stamp_tcx::{configuration::*, loader};

#[tokio::main]
async fn main() -> ExitCode {
    let conf = Configuration::parse();

    let default_filter = if conf.debug { "debug" } else { "info" };
    env_logger::Builder::from_env(Env::default().default_filter_or(default_filter)).init();

    if let Err(e) = conf.validate() {
        log::error!("Configuration is broken: {}", e);
        return ExitCode::FAILURE;
    }
    let config = conf.probe_config();

    let handle = match loader::load(&config) {
        Ok(handle) => handle,
        Err(e) => {
            log::error!("Cannot start the {}: {}", config.role, e);
            return ExitCode::FAILURE;
        }
    };
    for link in handle.links() {
        if link.fell_back {
            log::warn!("{} runs at the head of the chain", link.hook);
        }
    }

    log::info!("Running, press Ctrl-C to detach");
    if let Err(e) = tokio::signal::ctrl_c().await {
        log::error!("Cannot listen for Ctrl-C: {}", e);
    }

    log::info!("Detaching the {}", handle.role());
    match handle.close() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
