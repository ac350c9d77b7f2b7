use std::time::Duration;

use bytes::{Buf, BufMut, BytesMut};
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, warn};

const SEND_TIMEOUT: Duration = Duration::from_secs(20);

/// The one long-lived push connection to the analytics collector, shared by
/// every request. Sends are serialised so the downstream push protocol
/// receives message-framed writes; each message is a 4-byte big-endian
/// length prefix followed by UTF-8 JSON bytes.
pub struct EgressChannel {
	collector: String,
	conn: Mutex<Option<TcpStream>>,
}

impl EgressChannel {
	/// Builds the channel with no connection yet. The collector is dialled
	/// lazily, on the first `send()` and again after any severed
	/// connection, via the same path -- an unreachable or black-holed
	/// collector at startup must never keep the proxy from serving traffic
	/// (`spec.md`'s Non-goals: datapoints are best-effort, never persisted,
	/// and dropped-with-a-log-entry when egress can't keep up).
	pub fn new(collector: impl Into<String>) -> Self {
		Self {
			collector: collector.into(),
			conn: Mutex::new(None),
		}
	}

	/// Send one HAR message. Never blocks the client-facing response path:
	/// callers invoke this from a detached task. Completes within 20s or the
	/// message is dropped and logged with kind `EgressTimeout`.
	pub async fn send(&self, message: &Value) {
		let encoded = message.to_string();
		match tokio::time::timeout(SEND_TIMEOUT, self.send_framed(encoded.as_bytes())).await {
			Ok(Ok(())) => {},
			Ok(Err(e)) => warn!(kind = "EgressTimeout", error = %e, "egress send failed, datapoint dropped"),
			Err(_) => warn!(kind = "EgressTimeout", "egress send timed out, datapoint dropped"),
		}
	}

	async fn send_framed(&self, payload: &[u8]) -> anyhow::Result<()> {
		let mut guard = self.conn.lock().await;
		if guard.is_none() {
			debug!(collector = %self.collector, "egress connection severed, reconnecting");
			*guard = Some(TcpStream::connect(&self.collector).await?);
		}
		let stream = guard.as_mut().expect("just ensured present");

		let mut framed = BytesMut::with_capacity(4 + payload.len());
		framed.put_u32(payload.len() as u32);
		framed.extend_from_slice(payload);

		if let Err(e) = stream.write_all(&framed).await {
			*guard = None;
			return Err(e.into());
		}
		Ok(())
	}
}

/// Minimal framed reader used by tests to stand in for the collector.
pub async fn read_one_frame(stream: &mut TcpStream) -> anyhow::Result<Value> {
	let mut len_buf = [0u8; 4];
	stream.read_exact(&mut len_buf).await?;
	let len = (&len_buf[..]).get_u32() as usize;
	let mut body = vec![0u8; len];
	stream.read_exact(&mut body).await?;
	Ok(serde_json::from_slice(&body)?)
}
