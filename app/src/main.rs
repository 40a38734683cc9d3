use clap::Parser;
use dbexporter::bootstrap;
use dx_config::Config;
use dx_core::telemetry;
use dx_pool::SqlxConnector;
use std::process;
use std::sync::Arc;

/// Multi-source database metrics exporter
#[derive(Parser, Debug)]
#[command(name = "dbexporter", version)]
struct Cli {
    /// Configuration file (TOML, YAML or JSON)
    #[arg(short, long, env = "DBEXPORTER_CONFIG")]
    config: Option<String>,

    /// Override the configured log format (`pretty` or `json`)
    #[arg(long)]
    log_format: Option<String>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Load configuration - exit with non-zero if invalid
    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            telemetry::init_tracing("pretty", "dbexporter");
            tracing::error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let log_format = cli
        .log_format
        .as_deref()
        .unwrap_or(&config.server.log_format);
    telemetry::init_tracing(log_format, "dbexporter");
    tracing::info!(
        sources = config.sources.len(),
        strategy = %config.collection.strategy,
        "dbexporter starting"
    );

    let connector = Arc::new(SqlxConnector::new(config.collection.ping_timeout));
    let runtime = match bootstrap(&config, connector).await {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!(fatal = e.is_fatal(), "Failed to initialize data sources: {}", e);
            process::exit(1);
        }
    };
    runtime.start();

    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let result = tokio::select! {
        result = dx_obs::start_server(&bind_addr, runtime.state.clone()) => {
            tracing::info!("HTTP server exited");
            result
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown signal received");
            Ok(())
        }
    };

    runtime.shutdown().await;

    if let Err(e) = result {
        tracing::error!("Server error: {}", e);
        process::exit(1);
    }
}
