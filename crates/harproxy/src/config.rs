use std::time::Duration;

use clap::Parser;

use crate::har::ServiceToken;

const DEFAULT_COLLECTOR: &str = "server.apianalytics.com:5000";
const DEFAULT_CONCURRENCY: usize = 300;
const DEFAULT_CALL_TIMEOUT_SECS: f64 = 6.0;
const DEFAULT_DNS_POOL_SIZE: usize = 2;

/// A transparent HTTP/HTTPS forward proxy that emits HAR-formatted
/// observability records for every request to an external collector.
#[derive(Parser, Debug)]
#[command(name = "harproxy", version, about)]
pub struct Cli {
	/// Listen port for plaintext HTTP.
	pub port: u16,

	/// Default Service-Token applied when a request carries none.
	pub service_token: Option<String>,

	/// Enable HTTPS on this port; requires cert.pem and key.pem in the
	/// working directory.
	#[arg(long)]
	pub https: Option<u16>,

	/// Log each emitted HAR message to stdout.
	#[arg(long)]
	pub debug: bool,

	/// Concurrency ceiling: maximum number of in-flight requests.
	#[arg(short = 'c', default_value_t = DEFAULT_CONCURRENCY)]
	pub concurrency: usize,

	/// Upstream call timeout, in seconds.
	#[arg(short = 't', default_value_t = DEFAULT_CALL_TIMEOUT_SECS)]
	pub call_timeout_secs: f64,

	/// Analytics collector endpoint (host:port).
	#[arg(long, default_value = DEFAULT_COLLECTOR)]
	pub collector: String,
}

/// Internal, validated configuration assembled from [`Cli`].
#[derive(Debug, Clone)]
pub struct Config {
	pub http_port: u16,
	pub https_port: Option<u16>,
	pub startup_token: Option<ServiceToken>,
	pub debug: bool,
	pub concurrency_limit: usize,
	pub call_timeout: Duration,
	pub dns_pool_size: usize,
	pub collector: String,
}

impl From<Cli> for Config {
	fn from(cli: Cli) -> Self {
		Config {
			http_port: cli.port,
			https_port: cli.https,
			startup_token: cli.service_token.map(ServiceToken::new),
			debug: cli.debug,
			concurrency_limit: cli.concurrency,
			call_timeout: Duration::from_secs_f64(cli.call_timeout_secs.max(0.0)),
			dns_pool_size: DEFAULT_DNS_POOL_SIZE,
			collector: cli.collector,
		}
	}
}
