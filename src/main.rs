use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use order_aggregator::aggregator::Aggregator;
use order_aggregator::api::{self, ApiState};
use order_aggregator::bus::ws::{WsBus, WsBusConfig};
use order_aggregator::config::{CliArgs, Config};
use order_aggregator::gateway::HttpGatewayClient;
use order_aggregator::health::install_prometheus_exporter;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = CliArgs::parse();
    let config = match Config::load(cli) {
        Ok(config) => config,
        Err(err) => {
            tracing::error!(error = %err, "failed to load configuration");
            return ExitCode::FAILURE;
        }
    };

    tracing::info!(bus_url = %config.bus_url, gateway_url = %config.gateway_url, "starting order-routing aggregator");

    let bus = WsBus::connect(WsBusConfig {
        url: config.bus_url.clone(),
        ..WsBusConfig::default()
    });
    let gateway = Arc::new(HttpGatewayClient::new(
        config.gateway_url.clone(),
        config.gateway_timeout,
    ));

    let http_port = config.http_port;
    let aggregator = Aggregator::new(config, Arc::new(bus), gateway);

    let api_state = ApiState {
        health: aggregator.health.clone(),
        run_state: aggregator.run_state.clone(),
        queue_depth: aggregator.queue_depth.clone(),
    };

    let metrics_addr = SocketAddr::from(([0, 0, 0, 0], http_port + 1));
    if let Err(err) = install_prometheus_exporter(metrics_addr) {
        tracing::warn!(error = %err, "prometheus exporter failed to start, continuing without it");
    }

    let http_addr = SocketAddr::from(([0, 0, 0, 0], http_port));
    tokio::spawn(async move {
        if let Err(err) = api::serve(http_addr, api_state).await {
            tracing::error!(error = %err, "HTTP control surface exited");
        }
    });

    aggregator.run().await;

    ExitCode::SUCCESS
}
