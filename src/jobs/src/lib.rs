//! The engine's multi-threaded dispatch scheduler.
//!
//! Work is submitted as [`Dispatch`]es: a body invoked over a range of invocations, split into
//! slices that a fixed pool of worker threads claim one at a time from a shared ready list.
//! Dependencies between dispatches are expressed through [`JobCounter`]s rather than an
//! explicit graph, and host threads can block on a [`JobEvent`] wired to a dispatch.

pub mod counter;
pub mod dispatch;
pub mod system;

pub use counter::{JobCounter, JobEvent};
pub use dispatch::{Dispatch, Slice};
pub use system::{JobSystem, JobSystemConfig};
