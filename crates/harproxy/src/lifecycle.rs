use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use http::header::{HeaderName, HeaderValue, HOST};
use http::{HeaderMap, Request, Response};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use tokio::sync::oneshot;
use tracing::debug;

use crate::body::{BoxBody, OnCompleteBody, metered};
use crate::client::UpstreamClient;
use crate::dns::DnsPool;
use crate::egress::EgressChannel;
use crate::error::ProxyError;
use crate::gate::ConcurrencyGate;
use crate::har::{ArchiveInput, ServiceToken, Timings, build_har};

const SERVICE_TOKEN_HEADER: &str = "service-token";
const FORWARDED_FOR_HEADER: &str = "x-forwarded-for";

fn box_body<B>(body: B) -> BoxBody
where
	B: http_body::Body<Data = Bytes> + Send + 'static,
	B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
	body.map_err(Into::into).boxed()
}

fn text_box_body(s: String) -> BoxBody {
	box_body(Full::new(Bytes::from(s)))
}

/// Where a failure path's `serverIPAddress` comes from. Resolution for the
/// HAR record must never block the client-facing error response (`spec.md`
/// §4.5, §5), so a failure that already has a DNS lookup in flight hands its
/// `JoinHandle` over to be awaited inside the detached egress task rather
/// than awaiting it here.
enum ServerIp {
	Known(Option<String>),
	Pending(tokio::task::JoinHandle<Option<String>>),
}

impl ServerIp {
	async fn resolve(self) -> Option<String> {
		match self {
			ServerIp::Known(ip) => ip,
			ServerIp::Pending(task) => task.await.ok().flatten(),
		}
	}
}

/// Everything a request needs that is process-wide: the one in-flight
/// counter, DNS pool, egress socket, and upstream HTTP client. Injected
/// explicitly rather than reached for as globals, so tests can substitute
/// fakes.
pub struct LifecycleEngine {
	pub gate: ConcurrencyGate,
	pub dns: Arc<DnsPool>,
	pub client: UpstreamClient,
	pub egress: Arc<EgressChannel>,
	pub startup_token: Option<ServiceToken>,
	pub call_timeout: Duration,
	pub debug: bool,
}

impl LifecycleEngine {
	/// Drives one request from Accepted through Completed/Failed. Always
	/// returns a response; failures are surfaced to the client synchronously
	/// and never propagate as an `Err` out of this function.
	pub async fn handle(self: &Arc<Self>, req: Request<Incoming>, client_ip: String) -> Response<BoxBody> {
		let t0 = Instant::now();
		let started_at = Utc::now();

		let header_token = req.headers().get(SERVICE_TOKEN_HEADER).and_then(|v| v.to_str().ok());
		let token_opt = ServiceToken::resolve(header_token, self.startup_token.as_ref());
		let method = req.method().clone();
		let uri = req.uri().clone();

		// Admitted
		let ticket = match self.gate.admit() {
			Some(t) => t,
			None => {
				return self.emit_failure_and_respond(
					ProxyError::Overloaded,
					token_opt,
					method,
					uri,
					HeaderMap::new(),
					0,
					client_ip,
					ServerIp::Known(None),
					started_at,
					Timings::clamped(0, 0, 0),
				);
			},
		};

		// Token-Resolved
		let token = match token_opt {
			Some(t) => t,
			None => {
				ticket.release();
				return ProxyError::MissingToken.as_response().map(text_box_body);
			},
		};

		let mut request_headers = req.headers().clone();
		request_headers.remove(SERVICE_TOKEN_HEADER);
		let (_parts, incoming_body) = req.into_parts();

		// Body-Metered (request): tee the body while it streams to upstream;
		// never materialised here. Awaited lazily once the HAR is built.
		let (metered_body, req_meter) = metered(box_body(incoming_body));

		let host = match uri.host() {
			Some(h) => h.to_string(),
			None => {
				ticket.release();
				return self.emit_failure_and_respond(
					ProxyError::UpstreamError(anyhow::anyhow!("request URI has no host")),
					Some(token),
					method,
					uri,
					request_headers,
					req_meter.bytes(),
					client_ip,
					ServerIp::Known(None),
					started_at,
					Timings::clamped(0, 0, 0),
				);
			},
		};

		// DNS resolution for the HAR record runs independently of whatever
		// connection the upstream client itself establishes, and never
		// blocks the client response.
		let dns = self.dns.clone();
		let dns_host = host.clone();
		let dns_task: tokio::task::JoinHandle<Option<String>> =
			tokio::spawn(async move { dns.resolve(&dns_host).await.ok().map(|ip| ip.to_string()) });

		// Dispatched: strip Service-Token/Host, append X-Forwarded-For.
		let mut outbound = Request::builder().method(method.clone()).uri(uri.clone());
		{
			let headers = outbound.headers_mut().expect("builder headers always present");
			*headers = request_headers.clone();
			headers.remove(HOST);
			append_forwarded_for(headers, &client_ip);
		}
		let outbound = outbound
			.body(box_body(metered_body))
			.expect("headers and uri were already valid on the inbound request");

		let send_ms = t0.elapsed().as_millis() as i64;
		let dispatch_result = tokio::time::timeout(self.call_timeout, self.client.call(outbound)).await;
		let wait_ms = t0.elapsed().as_millis() as i64 - send_ms;

		let upstream_response = match dispatch_result {
			Ok(Ok(resp)) => resp,
			Ok(Err(e)) => {
				ticket.release();
				return self.emit_failure_and_respond(
					ProxyError::UpstreamError(e.into()),
					Some(token),
					method,
					uri,
					request_headers,
					req_meter.bytes(),
					client_ip,
					ServerIp::Pending(dns_task),
					started_at,
					Timings::clamped(send_ms, wait_ms, 0),
				);
			},
			Err(_) => {
				ticket.release();
				return self.emit_failure_and_respond(
					ProxyError::Timeout,
					Some(token),
					method,
					uri,
					request_headers,
					req_meter.bytes(),
					client_ip,
					ServerIp::Pending(dns_task),
					started_at,
					Timings::clamped(send_ms, wait_ms, 0),
				);
			},
		};

		// Responded: strip content-length, the body is transferred chunked.
		let (mut resp_parts, resp_body) = upstream_response.into_parts();
		resp_parts.headers.remove(http::header::CONTENT_LENGTH);
		let response_status = resp_parts.status;
		let response_headers = resp_parts.headers.clone();

		let (metered_resp_body, res_meter) = metered(box_body(resp_body));
		let (complete_tx, complete_rx) = oneshot::channel::<()>();
		let tracked_body = OnCompleteBody::new(metered_resp_body, move || {
			let _ = complete_tx.send(());
		});

		let engine = self.clone();
		tokio::spawn(async move {
			let _ = complete_rx.await;
			let receive_ms = t0.elapsed().as_millis() as i64 - wait_ms - send_ms;
			let server_ip = dns_task.await.ok().flatten();
			let archive = ArchiveInput {
				started_at,
				client_ip,
				server_ip,
				request_method: method,
				request_uri: uri,
				request_headers,
				request_body_len: req_meter.bytes(),
				response_status,
				response_headers,
				response_body_len: res_meter.bytes(),
				timings: Timings::clamped(send_ms, wait_ms, receive_ms),
			};
			let message = build_har(&archive, &token);
			if engine.debug {
				debug!(har = %message, "emitted HAR");
			}
			engine.egress.send(&message).await;
			ticket.release();
		});

		let mut response = Response::from_parts(resp_parts, box_body(tracked_body));
		*response.status_mut() = response_status;
		response
	}

	/// Builds the client-facing error response synchronously and, when a
	/// Service Token is resolvable, schedules a HAR record (`receive_ms=0`)
	/// on a detached task. `server_ip` is resolved inside that detached task
	/// too when it is still [`ServerIp::Pending`], so an in-flight DNS
	/// lookup never delays the response already being returned to the
	/// client. `MissingToken` never reaches this path -- it is handled
	/// inline since by definition no token is available for its envelope.
	#[allow(clippy::too_many_arguments)]
	fn emit_failure_and_respond(
		&self,
		err: ProxyError,
		token: Option<ServiceToken>,
		method: http::Method,
		uri: http::Uri,
		request_headers: HeaderMap,
		request_body_len: u64,
		client_ip: String,
		server_ip: ServerIp,
		started_at: DateTime<Utc>,
		timings: Timings,
	) -> Response<BoxBody> {
		let response = err.as_response();
		if let Some(token) = token {
			let response_status = response.status();
			let response_headers = response.headers().clone();
			let response_body_len = response.body().len() as u64;
			let debug_enabled = self.debug;
			let egress = self.egress.clone();
			tokio::spawn(async move {
				let server_ip = server_ip.resolve().await;
				let archive = ArchiveInput {
					started_at,
					client_ip,
					server_ip,
					request_method: method,
					request_uri: uri,
					request_headers,
					request_body_len,
					response_status,
					response_headers,
					response_body_len,
					timings,
				};
				let message = build_har(&archive, &token);
				if debug_enabled {
					debug!(har = %message, "emitted HAR");
				}
				egress.send(&message).await;
			});
		} else {
			debug!(kind = err.kind(), "failure with no resolvable service token, no datapoint emitted");
		}
		response.map(text_box_body)
	}
}

fn append_forwarded_for(headers: &mut HeaderMap, client_ip: &str) {
	let name = HeaderName::from_static(FORWARDED_FOR_HEADER);
	let value = match headers.get(&name).and_then(|v| v.to_str().ok()) {
		Some(existing) => format!("{existing}, {client_ip}"),
		None => client_ip.to_string(),
	};
	if let Ok(value) = HeaderValue::from_str(&value) {
		headers.insert(name, value);
	}
}
