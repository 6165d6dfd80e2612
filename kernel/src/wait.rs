//! Priority-ordered waiters lists and the generic block/resume loop every
//! synchronization primitive is built on.
//!
//! Unlike `r3_kernel::wait`, which links a stack-allocated `Wait` object
//! (carrying a payload enum) into the queue, a task here is spliced directly
//! into the queue using the link fields already embedded in its `TaskCb` —
//! legal because a `TaskCb` is in at most one list at a time (§3 invariant).
//! This also means a waiters list only ever needs to store `&'static
//! TaskCb<P>`, not a separate payload type.
use crate::{
    error::{expect_not_timeout, WaitError, WaitTimeoutError},
    klock::{self, CpuLockGuard},
    port::Port,
    sched::Scheduler,
    task::{Link, TaskCb, TaskState, UnblockReason},
    time::Tick,
    Priority,
};

/// A priority-ordered (descending), insertion-order-tied-break list of
/// blocked tasks, owned by a single synchronization primitive.
pub struct WaitQueue<P: Port> {
    head: klock::CpuLockCell<P, Option<&'static TaskCb<P>>>,
}

impl<P: Port> Default for WaitQueue<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: Port> WaitQueue<P> {
    pub const fn new() -> Self {
        Self {
            head: klock::CpuLockCell::new(None),
        }
    }

    pub fn is_empty(&self, lock: &CpuLockGuard<P>) -> bool {
        self.head.get(&**lock).is_none()
    }

    pub fn first(&self, lock: &CpuLockGuard<P>) -> Option<&'static TaskCb<P>> {
        self.head.get(&**lock)
    }

    /// Splice `task` into the list, after every existing waiter whose
    /// effective priority is `>=` its own (§4.2, "priority-ordered with
    /// stable insertion-order tie-break").
    fn insert(&'static self, lock: &mut CpuLockGuard<P>, task: &'static TaskCb<P>) {
        let pri = task.effective_priority.get(&**lock);
        let mut prev: Option<&'static TaskCb<P>> = None;
        let mut cur = self.head.get(&**lock);
        while let Some(node) = cur {
            if node.effective_priority.get(&**lock) < pri {
                break;
            }
            prev = Some(node);
            cur = node.link.read(&**lock).next;
        }
        {
            let link = task.link.write(&mut **lock);
            link.prev = prev;
            link.next = cur;
        }
        match prev {
            Some(prev) => prev.link.write(&mut **lock).next = Some(task),
            None => {
                self.head.replace(&mut **lock, Some(task));
            }
        }
        if let Some(cur) = cur {
            cur.link.write(&mut **lock).prev = Some(task);
        }
        task.blocked_on.replace(&mut **lock, Some(self));
    }

    /// Unlink `task` from this queue, wherever in it `task` currently sits.
    /// `pub(crate)` so [`crate::sched::Scheduler::unblock`] can unlink a
    /// timed-out or signal-interrupted task through its `blocked_on`
    /// back-pointer without this queue's notify path having done so first.
    pub(crate) fn unlink(&self, lock: &mut CpuLockGuard<P>, task: &'static TaskCb<P>) {
        let (prev, next) = {
            let link = task.link.read(&**lock);
            (link.prev, link.next)
        };
        match prev {
            Some(prev) => prev.link.write(&mut **lock).next = next,
            None => {
                self.head.replace(&mut **lock, next);
            }
        }
        if let Some(next) = next {
            next.link.write(&mut **lock).prev = prev;
        }
        let link = task.link.write(&mut **lock);
        *link = Link::default();
        task.blocked_on.replace(&mut **lock, None);
    }

    /// Pop the highest-priority waiter and return it without changing its
    /// scheduling state; the caller decides how to resume it (e.g. a mutex
    /// grants ownership before calling [`Scheduler::unblock`]).
    pub fn pop_first(&self, lock: &mut CpuLockGuard<P>) -> Option<&'static TaskCb<P>> {
        let task = self.head.get(&**lock)?;
        self.unlink(lock, task);
        Some(task)
    }

    /// Reposition `task` after its effective priority changed while it was
    /// already queued (used by `Mutex::set_task_base_priority`-equivalents).
    pub fn reorder(&'static self, lock: &mut CpuLockGuard<P>, task: &'static TaskCb<P>) {
        self.unlink(lock, task);
        self.insert(lock, task);
    }

    /// Block the current thread on this queue until woken or, if `deadline`
    /// is given, until it expires; returns the reason.
    ///
    /// `before_block` runs after the current task is spliced into this queue
    /// but before it leaves the Running state — condition variables use this
    /// hook to release their associated mutex atomically with the enqueue,
    /// closing the lost-wakeup window between "unlock" and "block".
    fn block(
        &'static self,
        sched: &Scheduler<P>,
        mut lock: CpuLockGuard<P>,
        deadline: Option<Tick>,
        before_block: impl FnOnce(&mut CpuLockGuard<P>),
    ) -> UnblockReason {
        let current = sched.current(&lock).expect("blocking call with no current task");
        self.insert(&mut lock, current);
        before_block(&mut lock);
        let (lock, current) = sched.block_current(lock, deadline);
        drop(lock);
        // Safety: CPU Lock is inactive here; only `wait` calls this.
        unsafe { block_until_runnable::<P>(current) };
        // `block_until_runnable` leaves CPU Lock inactive on return (it drops
        // its own guard right before checking `Running`), so this is a real
        // re-entry, not a re-assertion of an already-active lock.
        let lock = klock::lock_cpu::<P>().expect("CPU Lock unexpectedly active after wakeup");
        let reason = current.unblock_reason.get(&*lock).unwrap_or(UnblockReason::Explicit);
        // Whoever woke `current` — this queue's own notify path via
        // `pop_first`, or `Scheduler::unblock` unlinking it through
        // `blocked_on` on a timeout/interrupt — has already unlinked it from
        // this queue by now, so there's nothing left to do here.
        core::mem::forget(lock);
        reason
    }
}

/// The generic "park this OS/hardware thread until the scheduler resumes
/// it" loop, grounded on `r3_kernel::task::wait_until_woken_up`: leave CPU
/// Lock, synchronously yield, and keep retrying until the task is Running
/// again. On real hardware `yield_cpu` resumes here only via the dispatch
/// trap restoring this exact call frame; on a host port it is backed by a
/// real OS thread parked on a condition variable.
///
/// # Safety
///
/// CPU Lock must be inactive, and `task` must currently be this CPU's
/// Current-to-be (i.e. the caller is the thread represented by `task`).
///
/// Also used directly by [`crate::exit::exit`]: a thread whose state was
/// just set to Terminated rather than Blocked never observes `running` and
/// so never returns from here, parking the underlying OS/hardware thread
/// for good.
pub(crate) unsafe fn block_until_runnable<P: Port>(task: &'static TaskCb<P>) {
    loop {
        unsafe { P::yield_cpu() };
        let lock = klock::lock_cpu::<P>().expect("yield_cpu returned with CPU Lock active");
        let running = task.state.get(&*lock) == TaskState::Running;
        drop(lock);
        if running {
            return;
        }
    }
}

/// §4.2 blocking entry point shared by every primitive with no timeout:
/// `wait`, `lock`, plain `notifyOne`/`notifyAll` waits.
pub fn wait<P: Port>(
    queue: &'static WaitQueue<P>,
    sched: &Scheduler<P>,
    lock: CpuLockGuard<P>,
) -> Result<(), WaitError> {
    match queue.block(sched, lock, None, |_| {}) {
        UnblockReason::Explicit => Ok(()),
        UnblockReason::TimedOut => Err(expect_not_timeout(WaitTimeoutError::TimedOut)),
        UnblockReason::Interrupted => Err(WaitError::Interrupted),
    }
}

/// §4.2 blocking entry point shared by every primitive: `waitFor` / `waitUntil`.
pub fn wait_timeout<P: Port>(
    queue: &'static WaitQueue<P>,
    sched: &Scheduler<P>,
    lock: CpuLockGuard<P>,
    deadline: Tick,
) -> Result<(), WaitTimeoutError> {
    match queue.block(sched, lock, Some(deadline), |_| {}) {
        UnblockReason::Explicit => Ok(()),
        UnblockReason::TimedOut => Err(WaitTimeoutError::TimedOut),
        UnblockReason::Interrupted => Err(WaitTimeoutError::Interrupted),
    }
}

/// Like [`wait`]/[`wait_timeout`] but runs `before_block` after the current
/// task is enqueued and before it actually leaves Running — used by
/// [`crate::condvar`] to release the associated mutex atomically with the
/// enqueue. Returns the raw reason rather than a `Result` since the caller
/// (condvar re-lock logic) needs to distinguish all three outcomes itself.
pub(crate) fn wait_with<P: Port>(
    queue: &'static WaitQueue<P>,
    sched: &Scheduler<P>,
    lock: CpuLockGuard<P>,
    deadline: Option<Tick>,
    before_block: impl FnOnce(&mut CpuLockGuard<P>),
) -> UnblockReason {
    queue.block(sched, lock, deadline, before_block)
}

pub(crate) fn highest_priority<P: Port>(
    queue: &WaitQueue<P>,
    lock: &CpuLockGuard<P>,
) -> Option<Priority> {
    queue.first(lock).map(|t| t.effective_priority.get(&**lock))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{sched::Scheduler, task::SchedPolicy};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    extern "C" fn noop_entry(_: usize) -> ! {
        unreachable!("test tasks are never actually dispatched")
    }

    fn leak_stack() -> &'static mut [u8] {
        Box::leak(Box::new([0u8; 16])).as_mut_slice()
    }

    fn leak_task<P: Port>(priority: Priority) -> &'static TaskCb<P> {
        Box::leak(Box::new(unsafe {
            TaskCb::new(leak_stack(), noop_entry, 0, priority, SchedPolicy::Fifo, None)
        }))
    }

    macro_rules! test_port {
        ($name:ident, $lock:ident) => {
            struct $name;
            static $lock: AtomicBool = AtomicBool::new(false);
            static SWITCHES: AtomicUsize = AtomicUsize::new(0);
            unsafe impl Port for $name {
                unsafe fn initialize_stack(
                    _stack: &mut [u8],
                    _entry: extern "C" fn(usize) -> !,
                    _arg: usize,
                ) -> usize {
                    0
                }
                unsafe fn try_enter_cpu_lock() -> bool {
                    !$lock.swap(true, Ordering::AcqRel)
                }
                unsafe fn leave_cpu_lock() {
                    $lock.store(false, Ordering::Release);
                }
                fn is_cpu_lock_active() -> bool {
                    $lock.load(Ordering::Acquire)
                }
                fn is_task_context() -> bool {
                    false
                }
                fn request_context_switch() {
                    SWITCHES.fetch_add(1, Ordering::SeqCst);
                }
                unsafe fn yield_cpu() {
                    unreachable!("not exercised by this test")
                }
                unsafe fn dispatch_first(_initial_sp: usize) -> ! {
                    unreachable!("not exercised by this test")
                }
                fn tick_init(_hz: u32) {}
            }
        };
    }

    /// A timed-out or signal-interrupted waiter must come off its primitive's
    /// `WaitQueue` without corrupting whoever is still waiting behind it —
    /// the bug this module's `blocked_on` back-pointer exists to close.
    /// `t1`/`t2` are spliced in directly via the private `insert` (as every
    /// primitive does), bypassing `block`'s `yield_cpu` loop, then
    /// `Scheduler::unblock` is invoked exactly as `TimeoutList::advance` and
    /// `signal::wake_or_interrupt` do: with no prior `pop_first` of its own.
    #[test]
    fn unblock_unlinks_timed_out_waiter_without_losing_the_next_one() {
        test_port!(TestPort, CPU_LOCK);

        let idle = leak_task::<TestPort>(crate::IDLE_PRIORITY);
        let sched: &'static Scheduler<TestPort> = Box::leak(Box::new(Scheduler::new(idle)));
        let queue: &'static WaitQueue<TestPort> = Box::leak(Box::new(WaitQueue::new()));

        let t1 = leak_task::<TestPort>(5);
        let t2 = leak_task::<TestPort>(5);

        let mut lock = klock::lock_cpu::<TestPort>().unwrap();
        queue.insert(&mut lock, t1);
        queue.insert(&mut lock, t2);
        t1.state.replace(&mut *lock, TaskState::Blocked);
        t2.state.replace(&mut *lock, TaskState::Blocked);

        sched.unblock(&mut lock, t1, UnblockReason::TimedOut);

        assert_eq!(t1.unblock_reason.get(&*lock), Some(UnblockReason::TimedOut));
        assert!(
            t1.blocked_on.get(&*lock).is_none(),
            "t1 must be fully detached from `queue` once unblocked"
        );
        assert!(
            core::ptr::eq(queue.first(&lock).expect("t2 is still waiting"), t2),
            "t2 must still be head of `queue`, not lost through t1's stale link"
        );
        let t2_link = t2.link.read(&*lock);
        assert!(t2_link.prev.is_none(), "t2 is now the sole waiter");
        assert!(t2_link.next.is_none());
        core::mem::forget(lock);
    }
}
