use std::path::PathBuf;

use clap::Parser;
use vanopticon_loki::{Options, logging, run};

#[derive(Parser)]
#[command(name = "loki", about = "Loki - LLM-synthesized web decoys")]
struct Cli {
	/// Interface to serve on; defaults to the first non-loopback interface.
	#[arg(short, long)]
	interface: Option<String>,

	/// Configuration file.
	#[arg(short, long, default_value = "config.yaml")]
	config: PathBuf,

	/// Persistent response cache database.
	#[arg(short, long, default_value = "cache.db")]
	database: PathBuf,

	/// Event log destination (line-delimited JSON).
	#[arg(short, long, default_value = "log.json")]
	output: PathBuf,

	/// Per-request diagnostic logging.
	#[arg(short, long)]
	verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	let cli = Cli::parse();

	if let Err(e) = logging::init(cli.verbose) {
		eprintln!("warning: failed to install logger: {}", e);
	}

	run(Options {
		interface: cli.interface,
		config_path: cli.config,
		database_path: cli.database,
		log_path: cli.output,
	})
	.await
}
