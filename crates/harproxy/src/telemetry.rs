use tracing_subscriber::EnvFilter;

/// Installs the process-wide `tracing` subscriber. `RUST_LOG` takes
/// precedence; absent that, `--debug` bumps the default level to `debug`
/// (covering the emitted-HAR debug events) and otherwise it is `info`.
pub fn init(debug: bool) {
	let default_directive = if debug { "debug" } else { "info" };
	let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));

	tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}
