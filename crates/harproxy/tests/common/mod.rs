use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use harproxy::dns::DnsPool;
use harproxy::egress::{EgressChannel, read_one_frame};
use harproxy::gate::ConcurrencyGate;
use harproxy::har::ServiceToken;
use harproxy::lifecycle::LifecycleEngine;
use harproxy::server::serve_http;
use http::Uri;
use http_body_util::Full;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tower::Service;

/// Ignores the request URI's host and always dials a fixed address, the way
/// a real HTTP client behaves once pointed at an explicit forward proxy.
#[derive(Clone)]
pub struct FixedAddrConnector {
	pub addr: SocketAddr,
}

impl Service<Uri> for FixedAddrConnector {
	type Response = TokioIo<TcpStream>;
	type Error = std::io::Error;
	type Future = Pin<Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>>;

	fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
		Poll::Ready(Ok(()))
	}

	fn call(&mut self, _uri: Uri) -> Self::Future {
		let addr = self.addr;
		Box::pin(async move { Ok(TokioIo::new(TcpStream::connect(addr).await?)) })
	}
}

pub struct TestProxyOptions {
	pub startup_token: Option<&'static str>,
	pub concurrency_limit: usize,
	pub call_timeout: Duration,
}

impl Default for TestProxyOptions {
	fn default() -> Self {
		Self {
			startup_token: Some("T1"),
			concurrency_limit: 300,
			call_timeout: Duration::from_secs(6),
		}
	}
}

/// A running proxy bound to an ephemeral port, with its own collector stub
/// and a client pre-wired to dial the proxy regardless of request URI.
pub struct TestProxy {
	pub gate: ConcurrencyGate,
	collector: TcpListener,
	collector_conn: Option<TcpStream>,
	shutdown_tx: tokio::sync::watch::Sender<()>,
	task: tokio::task::JoinHandle<()>,
	client: Client<FixedAddrConnector, Full<Bytes>>,
}

async fn free_port() -> u16 {
	let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
	listener.local_addr().unwrap().port()
}

async fn wait_for_connect(addr: SocketAddr) {
	for _ in 0..200 {
		if TcpStream::connect(addr).await.is_ok() {
			return;
		}
		tokio::time::sleep(Duration::from_millis(10)).await;
	}
	panic!("proxy never came up on {addr}");
}

/// Installs the process-wide rustls crypto provider exactly once, whichever
/// test happens to run first.
fn ensure_crypto_provider() {
	let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}

async fn build_engine(opts: &TestProxyOptions, collector_addr: SocketAddr) -> Arc<LifecycleEngine> {
	let dns = Arc::new(DnsPool::new(2).unwrap());
	let egress = Arc::new(EgressChannel::new(collector_addr.to_string()));
	let tls_config = harproxy::tls::client_config().unwrap();
	let upstream_client = harproxy::client::UpstreamClient::new(dns.clone(), tls_config);

	Arc::new(LifecycleEngine {
		gate: ConcurrencyGate::new(opts.concurrency_limit),
		dns,
		client: upstream_client,
		egress,
		startup_token: opts.startup_token.map(ServiceToken::new),
		call_timeout: opts.call_timeout,
		debug: false,
	})
}

async fn spawn_listener(engine: Arc<LifecycleEngine>) -> (tokio::sync::watch::Sender<()>, tokio::task::JoinHandle<()>, SocketAddr) {
	let port = free_port().await;
	let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(());
	let task = tokio::spawn(async move {
		let mut shutdown_rx = shutdown_rx;
		let shutdown = async move {
			let _ = shutdown_rx.changed().await;
		};
		let _ = serve_http(port, engine, shutdown).await;
	});

	let addr: SocketAddr = ([127, 0, 0, 1], port).into();
	wait_for_connect(addr).await;
	(shutdown_tx, task, addr)
}

fn build_client(addr: SocketAddr) -> Client<FixedAddrConnector, Full<Bytes>> {
	Client::builder(TokioExecutor::new())
		.timer(TokioTimer::new())
		.build(FixedAddrConnector { addr })
}

impl TestProxy {
	pub async fn start(opts: TestProxyOptions) -> Self {
		ensure_crypto_provider();
		let collector = TcpListener::bind("127.0.0.1:0").await.unwrap();
		let collector_addr = collector.local_addr().unwrap();

		let engine = build_engine(&opts, collector_addr).await;
		let gate = engine.gate.clone();
		let (shutdown_tx, task, addr) = spawn_listener(engine).await;

		Self {
			gate,
			collector,
			collector_conn: None,
			shutdown_tx,
			task,
			client: build_client(addr),
		}
	}

	/// Like [`TestProxy::start`], but the collector listener accepts every
	/// connection and immediately drops it without reading -- standing in for
	/// an unreachable/unresponsive collector so the egress send is forced to
	/// fail or hang past its deadline.
	pub async fn start_with_unresponsive_collector(opts: TestProxyOptions) -> Self {
		ensure_crypto_provider();
		let collector = TcpListener::bind("127.0.0.1:0").await.unwrap();
		let collector_addr = collector.local_addr().unwrap();
		tokio::spawn(async move {
			loop {
				match collector.accept().await {
					Ok((stream, _)) => drop(stream),
					Err(_) => break,
				}
			}
		});

		let engine = build_engine(&opts, collector_addr).await;
		let gate = engine.gate.clone();
		let (shutdown_tx, task, addr) = spawn_listener(engine).await;

		// No usable collector listener remains for recv_har: the background
		// task above owns it. Bind a throwaway closed listener so the field
		// stays well-typed; tests using this constructor never call recv_har.
		let placeholder = TcpListener::bind("127.0.0.1:0").await.unwrap();

		Self {
			gate,
			collector: placeholder,
			collector_conn: None,
			shutdown_tx,
			task,
			client: build_client(addr),
		}
	}

	/// Like [`TestProxy::start`], but nothing is listening at the collector
	/// address at all -- standing in for a collector that is down or
	/// unreachable (connection refused) rather than merely unresponsive.
	/// The proxy must still start and serve traffic normally.
	pub async fn start_with_unreachable_collector(opts: TestProxyOptions) -> Self {
		ensure_crypto_provider();
		// Claim a port, then immediately drop the listener so nothing
		// answers there for the rest of the test.
		let collector_addr = {
			let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
			listener.local_addr().unwrap()
		};

		let engine = build_engine(&opts, collector_addr).await;
		let gate = engine.gate.clone();
		let (shutdown_tx, task, addr) = spawn_listener(engine).await;

		// No collector listener exists anywhere; tests using this
		// constructor never call recv_har.
		let placeholder = TcpListener::bind("127.0.0.1:0").await.unwrap();

		Self {
			gate,
			collector: placeholder,
			collector_conn: None,
			shutdown_tx,
			task,
			client: build_client(addr),
		}
	}

	pub fn client(&self) -> &Client<FixedAddrConnector, Full<Bytes>> {
		&self.client
	}

	/// Reads one HAR message from the collector stub, accepting the egress
	/// channel's persistent connection on first use.
	pub async fn recv_har(&mut self) -> Value {
		if self.collector_conn.is_none() {
			let (stream, _) = self.collector.accept().await.unwrap();
			self.collector_conn = Some(stream);
		}
		let stream = self.collector_conn.as_mut().unwrap();
		read_one_frame(stream).await.unwrap()
	}
}

impl Drop for TestProxy {
	fn drop(&mut self) {
		let _ = self.shutdown_tx.send(());
		self.task.abort();
	}
}
