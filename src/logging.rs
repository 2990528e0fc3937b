use fern::colors::{Color, ColoredLevelConfig};
use log::LevelFilter;

/// Install the process-wide logger. Verbose mode raises the level to
/// debug, which is where the per-request diagnostics live.
pub fn init(verbose: bool) -> Result<(), log::SetLoggerError> {
	let colors = ColoredLevelConfig::new()
		.error(Color::Red)
		.warn(Color::Yellow)
		.info(Color::Green)
		.debug(Color::BrightBlack);

	let level = if verbose {
		LevelFilter::Debug
	} else {
		LevelFilter::Info
	};

	fern::Dispatch::new()
		.format(move |out, message, record| {
			out.finish(format_args!(
				"{} [{}] {}: {}",
				chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ"),
				colors.color(record.level()),
				record.target(),
				message
			))
		})
		.level(level)
		// Dependency internals stay quiet even in verbose mode.
		.level_for("hyper", LevelFilter::Warn)
		.level_for("sqlx", LevelFilter::Warn)
		.level_for("hickory_resolver", LevelFilter::Warn)
		.level_for("hickory_proto", LevelFilter::Warn)
		.chain(std::io::stdout())
		.apply()
}
