use http::StatusCode;

/// Failure kinds for one request, as described in the error handling design.
///
/// Every variant maps to exactly one client-facing status code and, except
/// [`ProxyError::MissingToken`], still results in a HAR record being
/// scheduled for egress with `receive_ms = 0`.
#[derive(thiserror::Error, Debug)]
pub enum ProxyError {
	#[error("too many in-flight requests")]
	Overloaded,

	#[error("Service-Token header missing")]
	MissingToken,

	#[error("upstream call timed out")]
	Timeout,

	#[error("upstream request failed: {0}")]
	UpstreamError(#[source] anyhow::Error),
}

impl ProxyError {
	/// Whether a HAR datapoint should still be emitted for this failure.
	pub fn emits_datapoint(&self) -> bool {
		!matches!(self, ProxyError::MissingToken)
	}

	pub fn status(&self) -> StatusCode {
		match self {
			ProxyError::Overloaded => StatusCode::SERVICE_UNAVAILABLE,
			ProxyError::MissingToken => StatusCode::INTERNAL_SERVER_ERROR,
			ProxyError::Timeout => StatusCode::GATEWAY_TIMEOUT,
			ProxyError::UpstreamError(_) => StatusCode::INTERNAL_SERVER_ERROR,
		}
	}

	pub fn kind(&self) -> &'static str {
		match self {
			ProxyError::Overloaded => "Overloaded",
			ProxyError::MissingToken => "MissingToken",
			ProxyError::Timeout => "Timeout",
			ProxyError::UpstreamError(_) => "UpstreamError",
		}
	}

	/// Render the error as the response body the client sees. The body is
	/// metered like any other response body so a HAR record can still be
	/// produced for it.
	pub fn as_response(&self) -> http::Response<String> {
		let body = match self {
			ProxyError::MissingToken => "Service-Token header missing".to_string(),
			other => other.to_string(),
		};
		http::Response::builder()
			.status(self.status())
			.header(http::header::CONTENT_TYPE, "text/plain; charset=utf-8")
			.body(body)
			.expect("status and headers are always valid")
	}
}
