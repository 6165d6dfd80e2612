//! A preemptive, priority-based real-time kernel core for single-core
//! microcontrollers.
//!
//! The crate is organized the way [`r3_kernel`] organizes a kernel
//! implementation: a small architecture [`port`] contract at the bottom, a
//! [`klock`]-guarded kernel state above it, and the scheduler
//! ([`sched`]), synchronization primitives ([`mutex`], [`semaphore`],
//! [`condvar`], [`queue`]), the [`signal`] subsystem, thread termination and
//! join ([`exit`]), and the software [`timer`] wheel built on top of that.
//! Unlike a multi-board kernel crate,
//! this one assumes exactly one kernel image per program: there is a single
//! process-wide [`sched::Scheduler`] instance, constructed by
//! [`builder::System::new`] before any thread runs.
//!
//! [`r3_kernel`]: https://github.com/r3-os/r3
#![cfg_attr(not(test), no_std)]

pub mod builder;
pub mod condvar;
pub mod error;
pub mod exit;
pub mod klock;
pub mod mutex;
pub mod port;
pub mod queue;
pub mod sched;
pub mod semaphore;
pub mod signal;
pub mod task;
pub mod time;
pub mod timeout;
pub mod timer;
pub mod utils;
pub mod wait;

pub use error::ErrorCode;
pub use port::Port;
pub use time::{Duration, Tick};

/// A thread priority. Higher values are more urgent; `0` is reserved for the
/// idle thread, which always exists and is always Runnable.
pub type Priority = u8;

/// The lowest (least urgent) priority level, reserved for the idle thread.
pub const IDLE_PRIORITY: Priority = 0;

/// The number of distinct priority levels supported by the ready queue.
pub const NUM_PRIORITY_LEVELS: usize = 256;
