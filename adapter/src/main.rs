use log::{error, info};

use std::process::exit;

mod controller;
mod error;
mod leader;
mod options;
mod probes;
mod server;
mod supervisor;
mod tenant;

use options::options::{AdapterArgs, Options};
use supervisor::supervisor::{run, shutdown_signal, supervise};


#[tokio::main]
pub async fn main() {
    env_logger::init();

    let args: AdapterArgs = argh::from_env();
    let options = match Options::try_from(args) {
        Ok(o) => o,
        Err(e) => {
            error!("{}", e);
            exit(2);
        }
    };

    info!(
        "Starting whizard adapter: default service {}, default storage {}, cluster controller {}, web server {}",
        options.default_whizard_service,
        options.default_storage,
        options.kubesphere_adapter_enabled,
        options.web_enabled,
    );

    match supervise(shutdown_signal(), |token| run(options, token)).await {
        Ok(()) => info!("Stopped"),
        Err(e) => {
            error!("Exiting: {}", e);
            exit(1);
        }
    }
}
