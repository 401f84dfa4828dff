use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

// === JobCounter === //

/// A cloneable handle to an atomic dispatch counter.
///
/// Counters are the entire dependency mechanism of the job system: a dispatch becomes eligible
/// to run only once every counter it waits on reads zero, and a dispatch retiring decrements
/// its done counter exactly once. Handles are reference-counted, so a counter trivially
/// outlives every dispatch that refers to it.
#[derive(Debug, Clone)]
pub struct JobCounter(Arc<AtomicI64>);

impl JobCounter {
	pub fn new(count: u32) -> Self {
		Self(Arc::new(AtomicI64::new(count.into())))
	}

	pub fn get(&self) -> i64 {
		self.0.load(Ordering::Acquire)
	}

	/// Whether every dispatch charged against this counter has retired.
	pub fn is_complete(&self) -> bool {
		self.get() == 0
	}

	/// Decrements the counter, returning the value left on it.
	pub(crate) fn decrement(&self) -> i64 {
		let left = self.0.fetch_sub(1, Ordering::AcqRel) - 1;
		assert!(left >= 0, "job counter decremented below zero");
		left
	}
}

// === JobEvent === //

/// A cloneable one-shot event for host threads blocking on a dispatch's result.
///
/// The scheduler signals the event exactly once, when the dispatch it is attached to (or the
/// last dispatch of a group sharing a done counter) has fully executed.
#[derive(Debug, Clone, Default)]
pub struct JobEvent(Arc<EventInner>);

#[derive(Debug, Default)]
struct EventInner {
	signaled: Mutex<bool>,
	on_signal: Condvar,
}

impl JobEvent {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn signal(&self) {
		let mut signaled = self.0.signaled.lock();
		*signaled = true;
		self.0.on_signal.notify_all();
	}

	/// Blocks the calling thread until the event is signaled.
	pub fn wait(&self) {
		let mut signaled = self.0.signaled.lock();
		while !*signaled {
			self.0.on_signal.wait(&mut signaled);
		}
	}

	/// Blocks until the event is signaled or the timeout elapses, returning whether the event
	/// was signaled.
	pub fn wait_for(&self, timeout: Duration) -> bool {
		let deadline = Instant::now() + timeout;
		let mut signaled = self.0.signaled.lock();
		while !*signaled {
			if self.0.on_signal.wait_until(&mut signaled, deadline).timed_out() {
				break;
			}
		}
		*signaled
	}

	pub fn is_signaled(&self) -> bool {
		*self.0.signaled.lock()
	}
}

// === Tests === //
