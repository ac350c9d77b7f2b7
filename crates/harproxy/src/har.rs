use std::sync::Arc;

use chrono::{DateTime, Utc};
use http::{HeaderMap, Method, StatusCode, Uri};
use serde_json::{Value, json};

/// Tenant identifier carried by every datapoint. Cheap to clone into the
/// detached egress task since it is just a reference-counted string.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServiceToken(Arc<str>);

impl ServiceToken {
	pub fn new(s: impl Into<Arc<str>>) -> Self {
		Self(s.into())
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}

	/// First non-empty token from (per-request header, startup default).
	pub fn resolve(request_header: Option<&str>, startup_default: Option<&ServiceToken>) -> Option<ServiceToken> {
		if let Some(h) = request_header
			&& !h.is_empty()
		{
			return Some(ServiceToken::new(h.to_string()));
		}
		startup_default.cloned()
	}
}

impl std::fmt::Display for ServiceToken {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(&self.0)
	}
}

/// The three measured phases of one request, in milliseconds, clamped >= 0.
#[derive(Clone, Copy, Debug, Default)]
pub struct Timings {
	pub send_ms: i64,
	pub wait_ms: i64,
	pub receive_ms: i64,
}

impl Timings {
	pub fn clamped(send_ms: i64, wait_ms: i64, receive_ms: i64) -> Self {
		Self {
			send_ms: send_ms.max(0),
			wait_ms: wait_ms.max(0),
			receive_ms: receive_ms.max(0),
		}
	}
}

/// The captured record of one request/response exchange. Immutable once
/// constructed; consumed exactly once by [`build_har`].
pub struct ArchiveInput {
	pub started_at: DateTime<Utc>,
	pub client_ip: String,
	pub server_ip: Option<String>,

	pub request_method: Method,
	pub request_uri: Uri,
	pub request_headers: HeaderMap,
	pub request_body_len: u64,

	pub response_status: StatusCode,
	pub response_headers: HeaderMap,
	pub response_body_len: u64,

	pub timings: Timings,
}

fn headers_to_json(headers: &HeaderMap) -> Value {
	Value::Array(
		headers
			.iter()
			.map(|(name, value)| {
				json!({
					"name": name.as_str(),
					"value": value.to_str().unwrap_or_default(),
				})
			})
			.collect(),
	)
}

/// Pure transform from a captured exchange to the HAR-shaped JSON message
/// the collector expects. Has no side effects and cannot fail: every field
/// it needs has already been validated by the time an `ArchiveInput` exists.
pub fn build_har(input: &ArchiveInput, token: &ServiceToken) -> Value {
	json!({
		"serviceToken": token.as_str(),
		"startedDateTime": input.started_at.to_rfc3339(),
		"clientIPAddress": input.client_ip,
		"serverIPAddress": input.server_ip.as_deref().unwrap_or("<error>"),
		"request": {
			"method": input.request_method.as_str(),
			"url": input.request_uri.to_string(),
			"headers": headers_to_json(&input.request_headers),
			"bodySize": input.request_body_len,
		},
		"response": {
			"status": input.response_status.as_u16(),
			"headers": headers_to_json(&input.response_headers),
			"bodySize": input.response_body_len,
		},
		"timings": {
			"send": input.timings.send_ms,
			"wait": input.timings.wait_ms,
			"receive": input.timings.receive_ms,
		},
	})
}
