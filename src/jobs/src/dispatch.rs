use std::fmt;
use std::ops::Range;
use std::sync::Arc;

use smallvec::SmallVec;

use crate::counter::{JobCounter, JobEvent};

// === Slice === //

/// The arguments handed to a dispatch body for one claimed slice.
#[derive(Debug, Copy, Clone)]
pub struct Slice {
	/// The total number of invocations in the owning dispatch.
	pub invocation_count: u32,

	/// The nominal number of invocations per slice.
	pub slice_size: u32,

	/// The index of this slice in `0..num_slices`.
	pub slice_index: u32,

	/// The invocation index at which this slice begins, i.e. `slice_index * slice_size`.
	pub invocation_offset: u32,
}

impl Slice {
	/// The invocation indices covered by this slice. The final slice of a dispatch whose
	/// invocation count is not a multiple of the slice size is clamped to the dispatch's end.
	pub fn invocations(&self) -> Range<u32> {
		let end = self
			.invocation_offset
			.saturating_add(self.slice_size)
			.min(self.invocation_count);

		self.invocation_offset..end
	}
}

// === Dispatch === //

pub(crate) type SliceBody = Arc<dyn Fn(Slice) + Send + Sync>;

/// One parallel-for unit of work: a body invoked once per slice over `invocation_count`
/// invocations, `slice_size` invocations at a time.
///
/// A dispatch may be gated behind any number of [`JobCounter`]s via [`Dispatch::after`]; it
/// will not begin executing until every one of them reads zero. Chaining a group of dispatches
/// onto a shared counter with [`Dispatch::then_decrement`] lets a later dispatch gate on the
/// completion of all of them.
///
/// Bodies run on pool worker threads and must not block: a blocked body parks its worker and
/// shrinks the pool's effective parallelism until it returns. Capture whatever context the body
/// needs in its closure; the scheduler never inspects it.
pub struct Dispatch {
	pub(crate) body: SliceBody,
	pub(crate) invocation_count: u32,
	pub(crate) slice_size: u32,
	pub(crate) wait_counters: SmallVec<[JobCounter; 2]>,
	pub(crate) done_counter: Option<JobCounter>,
	pub(crate) signal_event: Option<JobEvent>,
}

impl Dispatch {
	pub fn new<F>(invocation_count: u32, slice_size: u32, body: F) -> Self
	where
		F: Fn(Slice) + Send + Sync + 'static,
	{
		assert!(invocation_count > 0, "dispatch with zero invocations");
		assert!(slice_size > 0, "dispatch with zero slice size");

		Self {
			body: Arc::new(body),
			invocation_count,
			slice_size,
			wait_counters: SmallVec::new(),
			done_counter: None,
			signal_event: None,
		}
	}

	/// Gates this dispatch on `counter` reaching zero. May be chained to wait on several
	/// counters at once.
	pub fn after(mut self, counter: &JobCounter) -> Self {
		self.wait_counters.push(counter.clone());
		self
	}

	/// Decrements `counter` exactly once, when the last slice of this dispatch has executed.
	pub fn then_decrement(mut self, counter: &JobCounter) -> Self {
		self.done_counter = Some(counter.clone());
		self
	}

	/// Signals `event` once this dispatch has fully executed. If a done counter is also
	/// attached, the event fires only once that counter reaches zero, letting several
	/// dispatches share one event.
	pub fn then_signal(mut self, event: &JobEvent) -> Self {
		self.signal_event = Some(event.clone());
		self
	}

	pub(crate) fn num_slices(&self) -> u32 {
		self.invocation_count.div_ceil(self.slice_size)
	}
}

impl fmt::Debug for Dispatch {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Dispatch")
			.field("invocation_count", &self.invocation_count)
			.field("slice_size", &self.slice_size)
			.field("num_slices", &self.num_slices())
			.field("num_wait_counters", &self.wait_counters.len())
			.finish_non_exhaustive()
	}
}

// === Tests === //

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn slice_counts() {
		assert_eq!(Dispatch::new(100, 10, |_| {}).num_slices(), 10);
		assert_eq!(Dispatch::new(101, 10, |_| {}).num_slices(), 11);
		assert_eq!(Dispatch::new(9, 10, |_| {}).num_slices(), 1);
		assert_eq!(Dispatch::new(1, 1, |_| {}).num_slices(), 1);
	}

	#[test]
	fn tail_slice_is_clamped() {
		let slice = |index: u32| Slice {
			invocation_count: 25,
			slice_size: 10,
			slice_index: index,
			invocation_offset: index * 10,
		};

		assert_eq!(slice(0).invocations(), 0..10);
		assert_eq!(slice(1).invocations(), 10..20);
		assert_eq!(slice(2).invocations(), 20..25);
	}

	#[test]
	#[should_panic(expected = "zero invocations")]
	fn zero_invocations_is_fatal() {
		Dispatch::new(0, 1, |_| {});
	}

	#[test]
	#[should_panic(expected = "zero slice size")]
	fn zero_slice_size_is_fatal() {
		Dispatch::new(1, 0, |_| {});
	}
}
