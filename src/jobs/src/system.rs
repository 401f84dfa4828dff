use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use anyhow::Context;
use parking_lot::{Condvar, Mutex};
use smallvec::SmallVec;

use crate::counter::{JobCounter, JobEvent};
use crate::dispatch::{Dispatch, Slice, SliceBody};

// === Config === //

#[derive(Debug, Clone)]
pub struct JobSystemConfig {
	/// The number of worker threads to start. Must be greater than zero.
	pub num_threads: usize,

	/// The prefix used to name worker threads; thread `i` is named `"<prefix> #<i>"`.
	pub thread_name_prefix: String,

	/// A bitmask of core indices workers may be pinned to. Workers are distributed
	/// round-robin over the set bits; zero disables pinning.
	pub core_affinity_mask: u64,
}

impl Default for JobSystemConfig {
	fn default() -> Self {
		Self {
			num_threads: thread::available_parallelism().map_or(4, |count| count.get()),
			thread_name_prefix: "job worker".to_string(),
			core_affinity_mask: 0,
		}
	}
}

// === Scheduler state === //

/// The live form of a submitted [`Dispatch`].
///
/// `completion_counter` starts at the dispatch's slice count and is decremented by each worker
/// after it finishes executing a slice, with no lock held; exactly one worker observes it reach
/// zero and performs the dispatch's one-time finalization. Everything else here is immutable
/// after submission.
struct JobDesc {
	body: SliceBody,
	invocation_count: u32,
	slice_size: u32,
	completion_counter: AtomicU32,
	wait_counters: SmallVec<[JobCounter; 2]>,
	done_counter: Option<JobCounter>,
	signal_event: Option<JobEvent>,
}

/// A ready-list entry for a dispatch that still has unclaimed slices.
///
/// `remaining_slices` is only ever touched with the scheduler lock held. It counts slices left
/// to *hand out*, which is distinct from the descriptor's completion counter: a dispatch leaves
/// the ready list as soon as its last slice is claimed, possibly well before that slice has
/// finished executing.
struct ReadyEntry {
	desc: Arc<JobDesc>,
	remaining_slices: u32,
}

struct SchedState {
	ready: Vec<ReadyEntry>,
	stop: bool,
}

struct Inner {
	state: Mutex<SchedState>,
	work_available: Condvar,
}

struct ClaimedSlice {
	desc: Arc<JobDesc>,
	slice_index: u32,
}

// === JobSystem === //

/// A fixed pool of worker threads executing [`Dispatch`]es slice by slice.
///
/// Workers repeatedly scan the shared ready list under one global lock, claim a single slice
/// from the first dispatch whose wait counters all read zero, and run the slice body with no
/// lock held. Dependencies between dispatches are expressed purely through counters; there is
/// no materialized graph, so a dispatch waiting on a counter that never reaches zero stalls in
/// the ready list forever without being detected. Unrelated dispatches keep executing normally
/// around it.
pub struct JobSystem {
	inner: Arc<Inner>,
	threads: Vec<JoinHandle<()>>,
}

impl JobSystem {
	pub fn new(config: &JobSystemConfig) -> anyhow::Result<Self> {
		assert!(
			config.num_threads > 0,
			"job system configured with zero worker threads"
		);

		let inner = Arc::new(Inner {
			state: Mutex::new(SchedState {
				ready: Vec::new(),
				stop: false,
			}),
			work_available: Condvar::new(),
		});

		let pinnable = pinnable_cores(config.core_affinity_mask);
		let mut threads = Vec::with_capacity(config.num_threads);

		for index in 0..config.num_threads {
			let inner = inner.clone();
			let core = (!pinnable.is_empty()).then(|| pinnable[index % pinnable.len()]);

			let thread = thread::Builder::new()
				.name(format!("{} #{index}", config.thread_name_prefix))
				.spawn(move || {
					if let Some(core) = core {
						if !core_affinity::set_for_current(core) {
							log::warn!("failed to pin job worker #{index} to core {}", core.id);
						}
					}
					worker_main(&inner);
				})
				.context("failed to spawn job system worker thread")?;

			threads.push(thread);
		}

		log::debug!("job system started with {} worker thread(s)", threads.len());

		Ok(Self { inner, threads })
	}

	pub fn thread_count(&self) -> usize {
		self.threads.len()
	}

	/// Publishes `dispatch` into the ready list and wakes every worker.
	///
	/// There is no return handle: completion is observed through whatever [`JobCounter`] and
	/// [`JobEvent`] the caller wired onto the dispatch before submitting it.
	pub fn submit(&self, dispatch: Dispatch) {
		let num_slices = dispatch.num_slices();
		let desc = Arc::new(JobDesc {
			body: dispatch.body,
			invocation_count: dispatch.invocation_count,
			slice_size: dispatch.slice_size,
			completion_counter: AtomicU32::new(num_slices),
			wait_counters: dispatch.wait_counters,
			done_counter: dispatch.done_counter,
			signal_event: dispatch.signal_event,
		});

		let mut state = self.inner.state.lock();
		assert!(
			!state.stop,
			"dispatch submitted to a job system that is shutting down"
		);

		// Tail insertion gives approximate FIFO fairness between eligible dispatches.
		state.ready.push(ReadyEntry {
			desc,
			remaining_slices: num_slices,
		});

		// Broadcast rather than wake one: several workers may be able to claim slices of the
		// new dispatch at once.
		self.inner.work_available.notify_all();
	}

	/// Stops the pool and joins every worker thread.
	///
	/// Slices already executing finish on their worker first. Dispatches still sitting in the
	/// ready list are discarded without running; their counters and events are never touched.
	/// Dropping the system does the same thing.
	pub fn shutdown(mut self) {
		self.shutdown_inner();
	}

	fn shutdown_inner(&mut self) {
		if self.threads.is_empty() {
			return;
		}

		{
			let mut state = self.inner.state.lock();
			state.stop = true;

			if !state.ready.is_empty() {
				log::warn!(
					"job system shutting down with {} unfinished dispatch(es); discarding them",
					state.ready.len(),
				);
			}
			state.ready.clear();

			self.inner.work_available.notify_all();
		}

		for thread in self.threads.drain(..) {
			let _ = thread.join();
		}

		log::debug!("job system stopped");
	}
}

impl Drop for JobSystem {
	fn drop(&mut self) {
		self.shutdown_inner();
	}
}

// === Worker loop === //

fn worker_main(inner: &Inner) {
	loop {
		// Scan for an eligible slice, sleeping whenever a full pass over the ready list finds
		// none. The condvar wait releases the scheduler lock atomically, and every waker
		// notifies with the lock held, so a wakeup between scan and sleep cannot be lost.
		let claimed = {
			let mut state = inner.state.lock();
			loop {
				if state.stop {
					return;
				}
				if let Some(claimed) = claim_slice(&mut state) {
					break claimed;
				}
				inner.work_available.wait(&mut state);
			}
		};

		// Run the slice body with no lock held. This is the only phase in which the pool
		// actually executes in parallel, across slices and across distinct dispatches.
		let desc = &claimed.desc;
		(desc.body)(Slice {
			invocation_count: desc.invocation_count,
			slice_size: desc.slice_size,
			slice_index: claimed.slice_index,
			invocation_offset: claimed.slice_index * desc.slice_size,
		});

		// Report completion. Exactly one worker observes the counter reach zero and performs
		// the dispatch's finalization.
		if desc.completion_counter.fetch_sub(1, Ordering::AcqRel) == 1 {
			finalize(inner, desc);
		}
	}
}

/// Claims one slice from the first eligible dispatch in the ready list, if any.
fn claim_slice(state: &mut SchedState) -> Option<ClaimedSlice> {
	for index in 0..state.ready.len() {
		let entry = &mut state.ready[index];

		// A dispatch is eligible only once every wait counter has reached zero. Ineligible
		// entries stay in place and get re-examined on every scan.
		if !entry.desc.wait_counters.iter().all(JobCounter::is_complete) {
			continue;
		}

		debug_assert!(entry.remaining_slices > 0);
		entry.remaining_slices -= 1;
		let slice_index = entry.remaining_slices;

		// Claiming the last slice retires the entry from the ready list in the same critical
		// section, so no second lock acquisition is needed to unlink it. Swap-remove is fine:
		// the list guarantees nothing about execution order.
		let desc = if entry.remaining_slices == 0 {
			state.ready.swap_remove(index).desc
		} else {
			entry.desc.clone()
		};

		return Some(ClaimedSlice { desc, slice_index });
	}

	None
}

/// The one-time actions performed by the worker that retires a dispatch's last slice.
fn finalize(inner: &Inner, desc: &JobDesc) {
	match &desc.done_counter {
		Some(done) => {
			// The event, if any, fires only once every dispatch sharing the done counter has
			// retired.
			if done.decrement() == 0 {
				if let Some(event) = &desc.signal_event {
					event.signal();
				}
			}
		}
		None => {
			if let Some(event) = &desc.signal_event {
				event.signal();
			}
		}
	}

	// The done counter decrement may have made other dispatches eligible, and no record exists
	// of which ones those might be, so wake the whole pool to re-scan. Taking the lock orders
	// the broadcast against workers that are about to go to sleep.
	let _state = inner.state.lock();
	inner.work_available.notify_all();
}

fn pinnable_cores(mask: u64) -> Vec<core_affinity::CoreId> {
	if mask == 0 {
		return Vec::new();
	}

	let Some(cores) = core_affinity::get_core_ids() else {
		log::warn!("failed to query core ids; job workers will not be pinned");
		return Vec::new();
	};

	let pinnable = cores
		.into_iter()
		.filter(|core| core.id < 64 && mask & (1 << core.id) != 0)
		.collect::<Vec<_>>();

	if pinnable.is_empty() {
		log::warn!("core affinity mask {mask:#x} matches no available core; job workers will not be pinned");
	}

	pinnable
}

// === Tests === //
