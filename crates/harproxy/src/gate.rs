use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Process-wide admission control. Strictly a check, never a queue: a
/// request either gets a [`GateTicket`] immediately or is rejected.
#[derive(Clone)]
pub struct ConcurrencyGate {
	inner: Arc<Inner>,
}

struct Inner {
	in_flight: AtomicUsize,
	limit: usize,
}

impl ConcurrencyGate {
	pub fn new(limit: usize) -> Self {
		Self {
			inner: Arc::new(Inner {
				in_flight: AtomicUsize::new(0),
				limit,
			}),
		}
	}

	/// Current value of the in-flight counter, for tests and diagnostics.
	pub fn in_flight(&self) -> usize {
		self.inner.in_flight.load(Ordering::Acquire)
	}

	pub fn limit(&self) -> usize {
		self.inner.limit
	}

	/// Increment the counter and admit the request if it did not exceed the
	/// ceiling. On rejection the counter is restored before returning, so the
	/// gate leaves no trace of a rejected attempt.
	pub fn admit(&self) -> Option<GateTicket> {
		let observed = self.inner.in_flight.fetch_add(1, Ordering::AcqRel) + 1;
		if observed > self.inner.limit {
			self.inner.in_flight.fetch_sub(1, Ordering::AcqRel);
			return None;
		}
		Some(GateTicket {
			inner: self.inner.clone(),
			released: false,
		})
	}
}

/// Held for the lifetime of one admitted request. Decrements the in-flight
/// counter exactly once, whether dropped explicitly via [`GateTicket::release`]
/// or implicitly on drop (e.g. a task panicking at the boundary).
pub struct GateTicket {
	inner: Arc<Inner>,
	released: bool,
}

impl GateTicket {
	pub fn release(mut self) {
		self.released = true;
		self.inner.in_flight.fetch_sub(1, Ordering::AcqRel);
	}
}

impl Drop for GateTicket {
	fn drop(&mut self) {
		if !self.released {
			self.inner.in_flight.fetch_sub(1, Ordering::AcqRel);
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn admits_up_to_limit() {
		let gate = ConcurrencyGate::new(2);
		let a = gate.admit().expect("first admitted");
		let b = gate.admit().expect("second admitted");
		assert_eq!(gate.in_flight(), 2);
		assert!(gate.admit().is_none());
		assert_eq!(gate.in_flight(), 2, "rejection must not leave a trace");
		a.release();
		assert_eq!(gate.in_flight(), 1);
		drop(b);
		assert_eq!(gate.in_flight(), 0);
	}

	#[test]
	fn rejection_restores_pre_attempt_value() {
		let gate = ConcurrencyGate::new(1);
		let _a = gate.admit().unwrap();
		let before = gate.in_flight();
		assert!(gate.admit().is_none());
		assert_eq!(gate.in_flight(), before);
	}
}
