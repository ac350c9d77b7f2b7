//! A transparent HTTP/HTTPS forward proxy that emits HAR-formatted
//! observability records for every completed request/response pair to an
//! external analytics collector.
//!
//! The crate's core is [`lifecycle::LifecycleEngine`]: the per-request state
//! machine that enforces the concurrency ceiling, dispatches the upstream
//! call under a deadline, meters body lengths, and hands a HAR datapoint to
//! the egress channel. Everything else in this crate exists to construct and
//! wire up the pieces that engine depends on.

pub mod body;
pub mod client;
pub mod config;
pub mod dns;
pub mod egress;
pub mod error;
pub mod gate;
pub mod har;
pub mod lifecycle;
pub mod server;
pub mod telemetry;
pub mod tls;

use std::path::Path;
use std::sync::Arc;

use tracing::warn;

use crate::client::UpstreamClient;
use crate::config::Config;
use crate::dns::DnsPool;
use crate::egress::EgressChannel;
use crate::gate::ConcurrencyGate;
use crate::lifecycle::LifecycleEngine;

/// Assembles the process-wide singletons (DNS pool, egress channel, upstream
/// client, concurrency gate) into one [`LifecycleEngine`] shared by both
/// front ends.
pub async fn build_engine(config: &Config) -> anyhow::Result<Arc<LifecycleEngine>> {
	let dns = Arc::new(DnsPool::new(config.dns_pool_size)?);
	let egress = Arc::new(EgressChannel::new(config.collector.clone()));
	let tls_config = tls::client_config()?;
	let client = UpstreamClient::new(dns.clone(), tls_config);

	Ok(Arc::new(LifecycleEngine {
		gate: ConcurrencyGate::new(config.concurrency_limit),
		dns,
		client,
		egress,
		startup_token: config.startup_token.clone(),
		call_timeout: config.call_timeout,
		debug: config.debug,
	}))
}

/// Runs both front ends until `shutdown` resolves. If HTTPS fails to
/// initialise, the failure is logged and only HTTP runs; an HTTP bind
/// failure is always fatal and returned to the caller.
pub async fn run(
	config: Config,
	cert_dir: &Path,
	shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
	let engine = build_engine(&config).await?;

	let (http_shutdown_tx, http_shutdown_rx) = tokio::sync::watch::channel(());
	let https_shutdown_rx = http_shutdown_rx.clone();

	let https_handle = config.https_port.map(|port| {
		let engine = engine.clone();
		let cert_dir = cert_dir.to_path_buf();
		let mut https_shutdown_rx = https_shutdown_rx;
		tokio::spawn(async move {
			let shutdown = async move {
				let _ = https_shutdown_rx.changed().await;
			};
			if let Err(e) = server::serve_https(port, &cert_dir, engine, shutdown).await {
				warn!(error = %e, "https listener failed to start, continuing with HTTP only");
			}
		})
	});

	tokio::spawn(async move {
		shutdown.await;
		let _ = http_shutdown_tx.send(());
	});

	let mut http_shutdown_rx = http_shutdown_rx;
	let http_shutdown = async move {
		let _ = http_shutdown_rx.changed().await;
	};
	server::serve_http(config.http_port, engine, http_shutdown).await?;

	if let Some(handle) = https_handle {
		let _ = handle.await;
	}

	Ok(())
}
