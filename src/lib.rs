pub mod cache;
pub mod config;
pub mod enrich;
pub mod events;
pub mod llm;
pub mod logging;
pub mod netif;
pub mod server;
pub mod tls_utils;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use log::info;

/// Runtime options resolved from the command line.
#[derive(Debug, Clone)]
pub struct Options {
	pub interface: Option<String>,
	pub config_path: PathBuf,
	pub database_path: PathBuf,
	pub log_path: PathBuf,
}

/// Wire every subsystem from configuration and serve until shutdown.
///
/// Any error returned here is startup-fatal; per-request failures never
/// propagate this far.
pub async fn run(opts: Options) -> Result<()> {
	let settings = config::load(&opts.config_path)?;

	let bind_ip = netif::bind_address(opts.interface.as_deref())?;
	let sensor_name = hostname::get()
		.context("resolving local hostname")?
		.to_string_lossy()
		.into_owned();

	let cache = cache::ResponseCache::open(&opts.database_path, settings.cache_duration_hours)
		.await
		.with_context(|| format!("opening response cache {}", opts.database_path.display()))?;

	let synthesizer: Arc<dyn llm::Synthesizer> = Arc::new(llm::LlmClient::new(&settings)?);
	let enricher = Arc::new(enrich::Enricher::new(Arc::new(
		enrich::DnsScannerLookup::from_system_conf()?,
	)));
	let logger = events::EventLogger::new(&opts.log_path);

	info!(
		"sensor {} starting {} decoy listener(s) on {}",
		sensor_name,
		settings.ports.len(),
		bind_ip
	);

	let shared = server::handler::HandlerState {
		listen_addr: String::new(),
		sensor_name,
		cache,
		synthesizer,
		enricher,
		logger,
	};

	server::start(&settings, bind_ip, shared).await?;
	info!("all decoy servers stopped");
	Ok(())
}
