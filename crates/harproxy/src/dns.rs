use std::collections::VecDeque;
use std::net::IpAddr;
use std::time::Duration;

use hickory_resolver::TokioResolver;
use hickory_resolver::config::LookupIpStrategy;
use hickory_resolver::name_server::TokioConnectionProvider;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, warn};

const LOOKUP_TIMEOUT: Duration = Duration::from_millis(2500);

/// `hickory_resolver`'s `lookup_ip` only ever yields A/AAAA answers, so the
/// "Not ipv4/ipv6" rejection the resolver pool must perform for other record
/// types is enforced by construction rather than as a distinct error case.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum DnsError {
	#[error("No answer")]
	NoAnswer,
}

/// A bounded pool of resolver handles. Each lookup checks one out, races it
/// against a timeout, and returns it; no caller ever holds more than one
/// resolver, and a resolver is never reused while its lookup is in flight.
pub struct DnsPool {
	idle: Mutex<VecDeque<TokioResolver>>,
	permits: Semaphore,
}

impl DnsPool {
	pub fn new(size: usize) -> anyhow::Result<Self> {
		let size = size.max(1);
		let mut idle = VecDeque::with_capacity(size);
		for _ in 0..size {
			idle.push_back(build_resolver()?);
		}
		Ok(Self {
			idle: Mutex::new(idle),
			permits: Semaphore::new(size),
		})
	}

	/// Resolve `hostname` to a printable IP address, retrying the lookup at
	/// most once on any failure (timeout, transport error, empty answer, or
	/// a non-A/AAAA answer).
	pub async fn resolve(&self, hostname: &str) -> Result<IpAddr, DnsError> {
		match self.resolve_once(hostname).await {
			Ok(ip) => Ok(ip),
			Err(first) => {
				debug!(hostname, error = %first, "dns lookup failed, retrying once");
				self.resolve_once(hostname).await
			},
		}
	}

	async fn resolve_once(&self, hostname: &str) -> Result<IpAddr, DnsError> {
		let _permit = self.permits.acquire().await.expect("semaphore never closed");
		let resolver = {
			let mut idle = self.idle.lock().await;
			idle.pop_front()
		};
		// The semaphore guarantees a resolver is available once the permit is
		// granted; pool size and permit count are kept equal at construction.
		let resolver = resolver.expect("pool size matches permit count");

		let result = match tokio::time::timeout(LOOKUP_TIMEOUT, resolver.lookup_ip(hostname)).await {
			Ok(Ok(lookup)) => lookup.iter().next().ok_or(DnsError::NoAnswer),
			Ok(Err(e)) => {
				warn!(hostname, error = %e, "dns lookup error");
				Err(DnsError::NoAnswer)
			},
			Err(_) => {
				warn!(hostname, "dns lookup timed out");
				Err(DnsError::NoAnswer)
			},
		};

		self.idle.lock().await.push_back(resolver);
		result
	}
}

fn build_resolver() -> anyhow::Result<TokioResolver> {
	let (config, mut opts) = hickory_resolver::system_conf::read_system_conf()?;
	opts.ip_strategy = LookupIpStrategy::Ipv4AndIpv6;
	opts.cache_size = 0;
	opts.try_tcp_on_error = true;
	Ok(
		TokioResolver::builder_with_config(config, TokioConnectionProvider::default())
			.with_options(opts)
			.build(),
	)
}
