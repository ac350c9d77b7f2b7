use std::path::Path;
use std::sync::Arc;

use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use hyper_util::server::graceful::GracefulShutdown;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::lifecycle::LifecycleEngine;
use crate::tls::load_server_acceptor;

fn auto_server() -> ConnBuilder<TokioExecutor> {
	let mut b = ConnBuilder::new(TokioExecutor::new());
	b.http1().timer(hyper_util::rt::TokioTimer::new());
	b.http2().timer(hyper_util::rt::TokioTimer::new());
	b
}

/// Runs the plaintext HTTP listener until `shutdown` resolves, then drains
/// in-flight connections before returning. A bind failure here is fatal to
/// the process.
pub async fn serve_http(port: u16, engine: Arc<LifecycleEngine>, shutdown: impl std::future::Future<Output = ()>) -> anyhow::Result<()> {
	let listener = TcpListener::bind(("0.0.0.0", port))
		.await
		.map_err(|e| anyhow::anyhow!("binding HTTP listener on port {port}: {e}"))?;
	info!(port, "http listener bound");

	let graceful = GracefulShutdown::new();
	let server = auto_server();
	tokio::pin!(shutdown);

	loop {
		tokio::select! {
			accepted = listener.accept() => {
				let (stream, peer) = match accepted {
					Ok(v) => v,
					Err(e) => { warn!(error = %e, "http accept failed"); continue; },
				};
				let engine = engine.clone();
				let server = server.clone();
				let conn = server.serve_connection_with_upgrades(
					TokioIo::new(stream),
					hyper::service::service_fn(move |req| {
						let engine = engine.clone();
						let client_ip = peer.ip().to_string();
						async move { Ok::<_, std::convert::Infallible>(engine.handle(req, client_ip).await) }
					}),
				);
				let watched = graceful.watch(conn.into_owned());
				tokio::spawn(async move {
					if let Err(e) = watched.await {
						warn!(error = %e, "http connection error");
					}
				});
			}
			_ = &mut shutdown => {
				info!("http listener shutting down");
				break;
			}
		}
	}

	graceful.shutdown().await;
	Ok(())
}

/// Runs the HTTPS listener, loading `cert.pem`/`key.pem` from `cert_dir`.
/// Unlike [`serve_http`], failure to initialise (missing/invalid files,
/// bind failure) is logged and returned to the caller rather than crashing
/// the process -- the HTTP listener is expected to keep running alone.
pub async fn serve_https(
	port: u16,
	cert_dir: &Path,
	engine: Arc<LifecycleEngine>,
	shutdown: impl std::future::Future<Output = ()>,
) -> anyhow::Result<()> {
	let acceptor = load_server_acceptor(cert_dir)?;
	let listener = TcpListener::bind(("0.0.0.0", port))
		.await
		.map_err(|e| anyhow::anyhow!("binding HTTPS listener on port {port}: {e}"))?;
	info!(port, "https listener bound");

	let graceful = GracefulShutdown::new();
	let server = auto_server();
	tokio::pin!(shutdown);

	loop {
		tokio::select! {
			accepted = listener.accept() => {
				let (stream, peer) = match accepted {
					Ok(v) => v,
					Err(e) => { warn!(error = %e, "https accept failed"); continue; },
				};
				let acceptor = acceptor.clone();
				let engine = engine.clone();
				let server = server.clone();
				let graceful = graceful.clone();
				tokio::spawn(async move {
					let tls_stream = match acceptor.accept(stream).await {
						Ok(s) => s,
						Err(e) => { warn!(error = %e, "tls handshake failed"); return; },
					};
					let conn = server.serve_connection_with_upgrades(
						TokioIo::new(tls_stream),
						hyper::service::service_fn(move |req| {
							let engine = engine.clone();
							let client_ip = peer.ip().to_string();
							async move { Ok::<_, std::convert::Infallible>(engine.handle(req, client_ip).await) }
						}),
					);
					if let Err(e) = graceful.watch(conn.into_owned()).await {
						warn!(error = %e, "https connection error");
					}
				});
			}
			_ = &mut shutdown => {
				info!("https listener shutting down");
				break;
			}
		}
	}

	graceful.shutdown().await;
	Ok(())
}

// Listener binding and TLS handshake behaviour are covered by the
// wiremock-backed integration tests under tests/, which exercise
// serve_http end-to-end against a real TcpListener.
