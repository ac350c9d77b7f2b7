use std::process::ExitCode;

use clap::Parser;
use harproxy::config::{Cli, Config};
use tracing::error;

#[tokio::main]
async fn main() -> ExitCode {
	let cli = Cli::parse();
	let config = Config::from(cli);
	harproxy::telemetry::init(config.debug);

	// rustls needs a process-wide default crypto provider installed before
	// any ClientConfig/ServerConfig is built.
	let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

	let cert_dir = std::env::current_dir().expect("current working directory must be readable");

	let shutdown = async {
		let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
			.expect("installing SIGTERM handler");
		tokio::select! {
			_ = tokio::signal::ctrl_c() => {},
			_ = sigterm.recv() => {},
		}
	};

	match harproxy::run(config, &cert_dir, shutdown).await {
		Ok(()) => ExitCode::SUCCESS,
		Err(e) => {
			error!(error = %e, "fatal error");
			ExitCode::FAILURE
		},
	}
}
