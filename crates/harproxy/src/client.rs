use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use http::Uri;
use http::uri::Scheme;
use hyper_util::client::legacy::connect::{Connected, Connection};
use hyper_util::rt::TokioIo;
use pin_project_lite::pin_project;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tracing::{debug, event};

use crate::dns::DnsPool;

pin_project! {
	#[project = MaybeTlsStreamProj]
	pub enum MaybeTlsStream {
		Plain { #[pin] inner: TcpStream },
		Tls { #[pin] inner: tokio_rustls::client::TlsStream<TcpStream> },
	}
}

impl AsyncRead for MaybeTlsStream {
	fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
		match self.project() {
			MaybeTlsStreamProj::Plain { inner } => inner.poll_read(cx, buf),
			MaybeTlsStreamProj::Tls { inner } => inner.poll_read(cx, buf),
		}
	}
}

impl AsyncWrite for MaybeTlsStream {
	fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
		match self.project() {
			MaybeTlsStreamProj::Plain { inner } => inner.poll_write(cx, buf),
			MaybeTlsStreamProj::Tls { inner } => inner.poll_write(cx, buf),
		}
	}

	fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
		match self.project() {
			MaybeTlsStreamProj::Plain { inner } => inner.poll_flush(cx),
			MaybeTlsStreamProj::Tls { inner } => inner.poll_flush(cx),
		}
	}

	fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
		match self.project() {
			MaybeTlsStreamProj::Plain { inner } => inner.poll_shutdown(cx),
			MaybeTlsStreamProj::Tls { inner } => inner.poll_shutdown(cx),
		}
	}
}

impl Connection for MaybeTlsStream {
	fn connected(&self) -> Connected {
		Connected::new()
	}
}

/// Resolves and dials the upstream named by a request URI, applying TLS
/// when the scheme is `https`. Shared by every request; the DNS pool and
/// TLS client config it holds are themselves shared singletons.
#[derive(Clone)]
pub struct Connector {
	pub dns: Arc<DnsPool>,
	pub tls_config: Arc<rustls::ClientConfig>,
}

impl tower::Service<Uri> for Connector {
	type Response = TokioIo<MaybeTlsStream>;
	type Error = anyhow::Error;
	type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

	fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
		Poll::Ready(Ok(()))
	}

	fn call(&mut self, uri: Uri) -> Self::Future {
		let dns = self.dns.clone();
		let tls_config = self.tls_config.clone();
		Box::pin(async move {
			let host = uri.host().ok_or_else(|| anyhow::anyhow!("no host in upstream uri"))?.to_string();
			let is_https = uri.scheme() == Some(&Scheme::HTTPS);
			let port = uri.port_u16().unwrap_or(if is_https { 443 } else { 80 });

			let ip = dns.resolve(&host).await.map_err(|e| anyhow::anyhow!("{e}: {host}"))?;
			let addr = SocketAddr::new(ip, port);

			let connect_start = std::time::Instant::now();
			let tcp = TcpStream::connect(addr).await?;

			let stream = if is_https {
				let tls = crate::tls::connect_upstream(tcp, tls_config, &host, ip).await?;
				MaybeTlsStream::Tls { inner: tls }
			} else {
				MaybeTlsStream::Plain { inner: tcp }
			};

			event!(
				target: "upstream tcp",
				tracing::Level::DEBUG,
				endpoint = %addr,
				tls = is_https,
				connect_ms = connect_start.elapsed().as_millis() as u64,
				"connected"
			);

			Ok(TokioIo::new(stream))
		})
	}
}

pub type BodyError = Box<dyn std::error::Error + Send + Sync>;

/// The upstream HTTP client. One instance is created at startup and shared
/// by every request; `hyper_util`'s legacy client keeps a per-host
/// connection pool internally.
#[derive(Clone)]
pub struct UpstreamClient {
	inner: hyper_util::client::legacy::Client<Connector, crate::body::BoxBody>,
}

impl UpstreamClient {
	pub fn new(dns: Arc<DnsPool>, tls_config: Arc<rustls::ClientConfig>) -> Self {
		let connector = Connector { dns, tls_config };
		let inner = hyper_util::client::legacy::Client::builder(hyper_util::rt::TokioExecutor::new())
			.pool_timer(hyper_util::rt::TokioTimer::new())
			.timer(hyper_util::rt::TokioTimer::new())
			.build(connector);
		Self { inner }
	}

	pub async fn call(
		&self,
		req: http::Request<crate::body::BoxBody>,
	) -> Result<http::Response<hyper::body::Incoming>, hyper_util::client::legacy::Error> {
		debug!(method = %req.method(), uri = %req.uri(), "dispatching upstream request");
		self.inner.request(req).await
	}
}
