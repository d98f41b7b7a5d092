//! Entry point for the book marketplace transaction service.
//!
//! Verifies the configured network, binds the marketplace contract, settles
//! anything left pending by a previous run, then serves the API while a
//! background loop keeps reconciling the ledger against the chain.

use bookmarket_config::Config;
use bookmarket_core::MarketBuilder;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

mod apis;
mod factory_registry;
mod server;

/// Command-line arguments for the marketplace service.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
	/// Path to configuration file
	#[arg(short, long, default_value = "config.toml")]
	config: PathBuf,

	/// Log level (trace, debug, info, warn, error)
	#[arg(short, long, default_value = "info")]
	log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
	let args = Args::parse();

	use tracing_subscriber::{fmt, EnvFilter};

	let env_filter =
		EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

	fmt()
		.with_env_filter(env_filter)
		.with_thread_ids(true)
		.with_target(true)
		.init();

	tracing::info!("Started bookmarket");

	let config = Config::from_file(&args.config.to_string_lossy()).await?;
	tracing::info!(market = %config.market.id, "Loaded configuration");

	let engine = MarketBuilder::new(config.clone())
		.build(factory_registry::all_factories())
		.await?;
	let engine = Arc::new(engine);

	// Settle whatever a previous run left pending before taking new requests.
	match engine.reconciliation().run_pass().await {
		Ok(report) => tracing::info!(
			examined = report.examined,
			completed = report.completed,
			failed = report.failed,
			still_pending = report.still_pending,
			"Startup reconciliation finished"
		),
		Err(e) => tracing::warn!(error = %e, "Startup reconciliation failed"),
	}

	let (shutdown_tx, shutdown_rx) = watch::channel(false);
	let reconciliation = Arc::clone(engine.reconciliation());
	let interval = Duration::from_secs(config.reconciliation.interval_seconds.max(1));
	let reconcile_task =
		tokio::spawn(async move { reconciliation.run(interval, shutdown_rx).await });

	match config.api.clone().filter(|api| api.enabled) {
		Some(api_config) => {
			let api_task = server::start_server(
				api_config,
				Arc::clone(&engine),
				config.content.max_size_bytes,
			);
			tokio::select! {
				result = api_task => {
					tracing::info!("API server finished");
					if let Err(e) = result {
						tracing::error!(error = %e, "API server failed");
					}
				}
				_ = tokio::signal::ctrl_c() => {
					tracing::info!("Shutdown requested");
				}
			}
		},
		None => {
			tracing::info!("API disabled; running reconciliation only");
			tokio::signal::ctrl_c().await?;
			tracing::info!("Shutdown requested");
		},
	}

	let _ = shutdown_tx.send(true);
	if let Err(e) = reconcile_task.await {
		tracing::warn!(error = %e, "Reconciliation task ended abnormally");
	}

	tracing::info!("Stopped bookmarket");
	Ok(())
}
