use clap::{Args, Parser};
use server::{Config, ServerError};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod routes;

#[derive(Parser)]
enum CliCommand {
    /// Serve the demo schema on the configured channels.
    Serve(ServeArgs),
    /// Validate a configuration file and exit.
    Check(CheckArgs),
}

#[derive(Args, Debug, Clone)]
struct BaseArgs {
    #[arg(long)]
    config_file_path: PathBuf,
}

#[derive(Args, Debug)]
struct ServeArgs {
    #[command(flatten)]
    base: BaseArgs,
}

#[derive(Args, Debug)]
struct CheckArgs {
    #[command(flatten)]
    base: BaseArgs,
}

#[tokio::main]
async fn main() -> Result<(), ServerError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    match CliCommand::parse() {
        CliCommand::Serve(args) => {
            let config = Config::from_file(&args.base.config_file_path)?;
            if let Some(metrics_config) = &config.metrics {
                install_statsd(metrics_config)?;
            }
            let tree = routes::demo_schema();
            server::run(config, tree).await
        }
        CliCommand::Check(args) => {
            let config = Config::from_file(&args.base.config_file_path)?;
            println!("config ok: {} channel(s)", config.channels.len());
            Ok(())
        }
    }
}

fn install_statsd(config: &server::MetricsConfig) -> Result<(), ServerError> {
    let recorder =
        metrics_exporter_statsd::StatsdBuilder::from(config.statsd_host.as_str(), config.statsd_port)
            .build(Some("crossbar"))
            .map_err(|e| ServerError::Config(format!("statsd exporter: {e}")))?;
    metrics::set_global_recorder(recorder)
        .map_err(|e| ServerError::Config(format!("metrics recorder: {e}")))?;
    Ok(())
}
