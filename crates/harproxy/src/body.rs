use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};

use bytes::Bytes;
use http_body::{Body, Frame, SizeHint};
use pin_project_lite::pin_project;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;
pub type BoxBody = http_body_util::combinators::BoxBody<Bytes, BoxError>;

/// Shared handle to the running total of bytes seen by a [`MeteredBody`].
/// Cheap to clone; read after the body has been fully drained.
#[derive(Clone, Default)]
pub struct BodyMeter(Arc<AtomicU64>);

impl BodyMeter {
	pub fn new() -> Self {
		Self(Arc::new(AtomicU64::new(0)))
	}

	/// Bytes metered so far. If the body was never fully drained (the
	/// metering task was abandoned or failed) this returns whatever was
	/// observed before abandonment, per the "report zero" fallback the
	/// caller applies when it never awaits completion.
	pub fn bytes(&self) -> u64 {
		self.0.load(Ordering::Acquire)
	}

	fn add(&self, n: u64) {
		self.0.fetch_add(n, Ordering::AcqRel);
	}
}

pin_project! {
	/// Tees a body stream: frames pass through unchanged to whatever consumes
	/// this body, while their data length is summed into a [`BodyMeter`].
	/// Never buffers; a frame is counted and forwarded in the same poll.
	pub struct MeteredBody<B> {
		#[pin]
		inner: B,
		meter: BodyMeter,
	}
}

impl<B> MeteredBody<B> {
	pub fn new(inner: B, meter: BodyMeter) -> Self {
		Self { inner, meter }
	}
}

/// Wraps `body` for metering and returns the handle used to read the final
/// byte count once the wrapped body has been driven to completion.
pub fn metered<B>(body: B) -> (MeteredBody<B>, BodyMeter) {
	let meter = BodyMeter::new();
	(MeteredBody::new(body, meter.clone()), meter)
}

impl<B> Body for MeteredBody<B>
where
	B: Body<Data = Bytes>,
{
	type Data = Bytes;
	type Error = B::Error;

	fn poll_frame(
		self: Pin<&mut Self>,
		cx: &mut Context<'_>,
	) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
		let this = self.project();
		match this.inner.poll_frame(cx) {
			Poll::Ready(Some(Ok(frame))) => {
				if let Some(data) = frame.data_ref() {
					this.meter.add(data.len() as u64);
				}
				Poll::Ready(Some(Ok(frame)))
			},
			other => other,
		}
	}

	fn is_end_stream(&self) -> bool {
		self.inner.is_end_stream()
	}

	fn size_hint(&self) -> SizeHint {
		self.inner.size_hint()
	}
}

pin_project! {
	/// Runs a closure exactly once when the wrapped body is dropped, whether
	/// that is because it was fully drained or because the client went away
	/// mid-stream. Used to trigger HAR assembly and gate release once "the
	/// client has finished consuming the response", in either case.
	pub struct OnCompleteBody<B, F>
	where
		F: FnOnce(),
	{
		#[pin]
		inner: B,
		on_complete: Option<F>,
	}

	impl<B, F: FnOnce()> PinnedDrop for OnCompleteBody<B, F> {
		fn drop(this: Pin<&mut Self>) {
			if let Some(f) = this.project().on_complete.take() {
				f();
			}
		}
	}
}

impl<B, F: FnOnce()> OnCompleteBody<B, F> {
	pub fn new(inner: B, on_complete: F) -> Self {
		Self {
			inner,
			on_complete: Some(on_complete),
		}
	}
}

impl<B, F> Body for OnCompleteBody<B, F>
where
	B: Body<Data = Bytes>,
	F: FnOnce(),
{
	type Data = Bytes;
	type Error = B::Error;

	fn poll_frame(
		self: Pin<&mut Self>,
		cx: &mut Context<'_>,
	) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
		self.project().inner.poll_frame(cx)
	}

	fn is_end_stream(&self) -> bool {
		self.inner.is_end_stream()
	}

	fn size_hint(&self) -> SizeHint {
		self.inner.size_hint()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use http_body_util::{BodyExt, Full};

	#[tokio::test]
	async fn meters_while_forwarding() {
		let payload = Bytes::from_static(b"hello world");
		let (body, meter) = metered(Full::new(payload.clone()));
		assert_eq!(meter.bytes(), 0);

		let collected = body.collect().await.unwrap().to_bytes();
		assert_eq!(collected, payload);
		assert_eq!(meter.bytes(), payload.len() as u64);
	}

	#[tokio::test]
	async fn empty_body_meters_zero() {
		let (body, meter) = metered(Full::new(Bytes::new()));
		let _ = body.collect().await.unwrap();
		assert_eq!(meter.bytes(), 0);
	}

	#[tokio::test]
	async fn multi_chunk_stream_sums_all_chunks() {
		use futures_util::stream;
		use http_body_util::StreamBody;

		let chunks = vec![
			Ok::<_, std::io::Error>(Frame::data(Bytes::from_static(b"abc"))),
			Ok::<_, std::io::Error>(Frame::data(Bytes::from_static(b"defgh"))),
		];
		let (body, meter) = metered(StreamBody::new(stream::iter(chunks)));
		let collected = body.collect().await.unwrap().to_bytes();
		assert_eq!(collected, Bytes::from_static(b"abcdefgh"));
		assert_eq!(meter.bytes(), 8);
	}

	#[tokio::test]
	async fn on_complete_fires_after_full_drain() {
		let fired = Arc::new(std::sync::atomic::AtomicBool::new(false));
		let fired_clone = fired.clone();
		let body = OnCompleteBody::new(Full::new(Bytes::from_static(b"hi")), move || {
			fired_clone.store(true, Ordering::SeqCst);
		});
		assert!(!fired.load(Ordering::SeqCst));
		let _ = body.collect().await.unwrap();
		assert!(fired.load(Ordering::SeqCst));
	}

	#[tokio::test]
	async fn on_complete_fires_on_early_drop() {
		let fired = Arc::new(std::sync::atomic::AtomicBool::new(false));
		let fired_clone = fired.clone();
		let body = OnCompleteBody::new(Full::new(Bytes::from_static(b"hi")), move || {
			fired_clone.store(true, Ordering::SeqCst);
		});
		drop(body);
		assert!(fired.load(Ordering::SeqCst));
	}
}
