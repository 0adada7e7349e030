use clap::Parser;
use tracing::error;

use peloton::{
    cli::{run_client_command, Cli, Command, EXIT_TRANSPORT},
    config::ServerConfig,
    service::Service,
    telemetry,
};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve { config } => {
            telemetry::setup_logging();
            let config = match config {
                Some(path) => match ServerConfig::from_path(&path.to_string_lossy()) {
                    Ok(config) => config,
                    Err(err) => {
                        error!(error = %err, "loading config failed");
                        std::process::exit(EXIT_TRANSPORT);
                    }
                },
                None => ServerConfig::default(),
            };

            let service = match Service::new_dev(config) {
                Ok(service) => service,
                Err(err) => {
                    error!(error = %err, "building service failed");
                    std::process::exit(EXIT_TRANSPORT);
                }
            };
            if let Err(err) = service.start().await {
                error!(error = %err, "server exited with error");
                std::process::exit(EXIT_TRANSPORT);
            }
        }
        command => {
            let code = run_client_command(&cli.address, command).await;
            std::process::exit(code);
        }
    }
}
