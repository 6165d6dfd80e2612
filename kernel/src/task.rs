//! Thread control blocks.
//!
//! A [`TaskCb`] is value-typed and usually lives as a `'static` value built by
//! [`crate::builder::make_static_thread`]; nothing here allocates. The single
//! pair of link fields embedded in a `TaskCb` is shared by the ready queue
//! and by whichever primitive's waiter list the task is blocked on — never
//! both, per the "a thread is a member of at most one list" invariant.
use core::cell::UnsafeCell;

use crate::{
    klock::{self, CpuLockCell},
    mutex::MutexCb,
    port::Port,
    signal::SignalsReceiverCb,
    time::Duration,
    timeout::TimeoutCb,
    Priority,
};

/// FIFO: runs to completion or blocks. RR: preempted at quantum expiry and
/// rotated to the tail of its priority level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedPolicy {
    Fifo,
    RoundRobin { quantum: Duration },
}

/// Per-thread scheduling state (§3, §4.1 state machine).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Created,
    Runnable,
    Running,
    Blocked,
    Suspended,
    Terminated,
}

/// Why a blocked thread was last unblocked. A single-writer field: the first
/// of {explicit unblock, timeout, signal interruption} to observe the thread
/// still Blocked wins, and later writers are no-ops (§5, "Cancellation &
/// timeouts").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnblockReason {
    Explicit,
    TimedOut,
    Interrupted,
}

/// The two link fields a `TaskCb` lends to whichever list currently holds it:
/// the ready queue's per-priority buckets, or a single primitive's waiters
/// list. Never both at once.
pub(crate) struct Link<P: Port> {
    pub prev: Option<&'static TaskCb<P>>,
    pub next: Option<&'static TaskCb<P>>,
}

impl<P: Port> Link<P> {
    const fn new() -> Self {
        Self {
            prev: None,
            next: None,
        }
    }
}

impl<P: Port> Default for Link<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: Port> core::fmt::Debug for TaskCb<P> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_tuple("TaskCb").field(&(self as *const Self)).finish()
    }
}

/// Thread control block.
pub struct TaskCb<P: Port> {
    stack: Cell<*mut [u8]>,
    entry: extern "C" fn(usize) -> !,
    arg: usize,

    pub(crate) policy: SchedPolicy,
    pub(crate) base_priority: CpuLockCell<P, Priority>,
    pub(crate) effective_priority: CpuLockCell<P, Priority>,
    pub(crate) state: CpuLockCell<P, TaskState>,
    pub(crate) sp: CpuLockCell<P, usize>,
    pub(crate) remaining_quantum: CpuLockCell<P, u32>,
    pub(crate) unblock_reason: CpuLockCell<P, Option<UnblockReason>>,

    pub(crate) link: CpuLockCell<P, Link<P>>,

    /// The [`crate::wait::WaitQueue`] `link` is currently spliced into, if
    /// any (§3, "the TCB's 'blocked-on' pointer references P"). Set by
    /// `WaitQueue::insert`, cleared by `WaitQueue::unlink` — lets
    /// [`crate::sched::Scheduler::unblock`] unlink a timed-out or
    /// signal-interrupted task from whatever queue it's actually on before
    /// `link` gets repurposed for the ready queue, without needing to know
    /// which primitive's queue that is.
    pub(crate) blocked_on: CpuLockCell<P, Option<&'static crate::wait::WaitQueue<P>>>,

    /// Head of the singly-linked list of mutexes this task currently owns,
    /// most-recently-locked first. Walked to recompute effective priority
    /// whenever a mutex is released or the base priority changes.
    pub(crate) last_mutex_held: CpuLockCell<P, Option<&'static MutexCb<P>>>,

    /// The `PriorityInheritance` mutex this task is currently blocked on, if
    /// any — the hop used to propagate a priority boost transitively through
    /// a chain of blocked owners.
    pub(crate) blocking_mutex: CpuLockCell<P, Option<&'static MutexCb<P>>>,

    pub(crate) timeout: TimeoutCb<P>,

    pub(crate) signals: Option<SignalsReceiverCb<P>>,

    /// Tasks blocked in [`crate::exit::join`] on this task's termination.
    /// A [`crate::wait::WaitQueue`] like any other primitive's waiters list,
    /// just embedded in the `TaskCb` itself rather than a separate object —
    /// every task can be joined, so there's no standalone control block to
    /// own this queue.
    pub(crate) join_waiters: crate::wait::WaitQueue<P>,
    pub(crate) exit_value: CpuLockCell<P, i32>,
}

/// `*mut [u8]` is not `Sync`, but every access to `TaskCb::stack` outside of
/// construction happens through the owning port while CPU Lock is active.
struct Cell<T>(UnsafeCell<T>);
unsafe impl<T> Sync for Cell<T> {}
impl<T: Copy> Cell<T> {
    const fn new(v: T) -> Self {
        Self(UnsafeCell::new(v))
    }
    fn get(&self) -> T {
        unsafe { *self.0.get() }
    }
}

impl<P: Port> TaskCb<P> {
    /// # Safety
    ///
    /// `stack` must be exclusively owned by this task for as long as it is
    /// not Terminated. Usually called from a `static` initializer by
    /// [`crate::builder::make_static_thread`], which upholds this by pairing
    /// every `TaskCb` with its own dedicated stack storage.
    pub const unsafe fn new(
        stack: &'static mut [u8],
        entry: extern "C" fn(usize) -> !,
        arg: usize,
        priority: Priority,
        policy: SchedPolicy,
        signals: Option<SignalsReceiverCb<P>>,
    ) -> Self {
        Self {
            stack: Cell::new(stack as *mut [u8]),
            entry,
            arg,
            policy,
            base_priority: CpuLockCell::new(priority),
            effective_priority: CpuLockCell::new(priority),
            state: CpuLockCell::new(TaskState::Created),
            sp: CpuLockCell::new(0),
            remaining_quantum: CpuLockCell::new(0),
            unblock_reason: CpuLockCell::new(None),
            link: CpuLockCell::new(Link::new()),
            blocked_on: CpuLockCell::new(None),
            last_mutex_held: CpuLockCell::new(None),
            blocking_mutex: CpuLockCell::new(None),
            timeout: TimeoutCb::new(),
            signals,
            join_waiters: crate::wait::WaitQueue::new(),
            exit_value: CpuLockCell::new(0),
        }
    }

    pub fn priority(&self, lock: &klock::CpuLockGuard<P>) -> Priority {
        self.base_priority.get(&**lock)
    }

    pub fn effective_priority(&self, lock: &klock::CpuLockGuard<P>) -> Priority {
        self.effective_priority.get(&**lock)
    }

    pub fn state(&self, lock: &klock::CpuLockGuard<P>) -> TaskState {
        self.state.get(&**lock)
    }

    /// Initial quantum for an RR task dispatched from Blocked/Created, per
    /// §4.1 ("A thread's quantum resets on every dispatch into Runnable").
    pub(crate) fn reset_quantum(&self, lock: &mut klock::CpuLockGuard<P>) {
        if let SchedPolicy::RoundRobin { quantum } = self.policy {
            self.remaining_quantum.replace(&mut **lock, quantum.ticks());
        }
    }

    /// Walk the chain of currently held mutexes and recompute the priority
    /// that should be in effect once any mutex-induced boost is applied on
    /// top of `base`. Ceiling mutexes clamp upward; PI boosts are tracked
    /// separately on the mutex's waiters and folded in by `mutex::unlock`.
    pub(crate) fn recompute_ceiling_floor(
        &self,
        lock: &mut klock::CpuLockGuard<P>,
        base: Priority,
    ) -> Priority {
        let mut effective = base;
        let mut cur = self.last_mutex_held.get(&**lock);
        while let Some(m) = cur {
            if let Some(floor) = m.priority_floor(&*lock) {
                effective = effective.max(floor);
            }
            cur = m.prev_mutex_held.get(&**lock);
        }
        effective
    }

    pub unsafe fn initial_sp(&self) -> usize {
        unsafe { P::initialize_stack(&mut *self.stack.get(), self.entry, self.arg) }
    }
}

// Safety: every field besides `stack`/`entry`/`arg`/`policy` is a
// `CpuLockCell`, mediated by CPU Lock; `stack`/`entry`/`arg`/`policy` are
// immutable after construction except through the port during
// initialization, itself CPU-Lock-gated.
unsafe impl<P: Port> Sync for TaskCb<P> {}
