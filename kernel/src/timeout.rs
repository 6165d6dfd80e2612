//! Scheduler timeouts.
//!
//! A timeout is a one-shot deadline tied to a specific blocked task, kept in
//! a CPU-locked, deadline-sorted singly-linked list advanced from the tick
//! ISR — the same deadline-sorted-list technique `r3_kernel::timeout` uses
//! for its timeout queue, minus that module's wall-clock
//! frontier/headroom-adjustment machinery (dropped per §9A: this kernel only
//! ever deals in monotonic tick-relative deadlines, never wall-clock time).
use crate::{
    klock::{self, CpuLockGuard},
    port::Port,
    sched::Scheduler,
    task::{TaskCb, UnblockReason},
    time::Tick,
};

/// Per-task embedded timeout node. Distinct from [`crate::task::Link`]
/// because a task can be on a primitive's waiters list *and* have an armed
/// timeout simultaneously.
pub struct TimeoutCb<P: Port> {
    deadline: klock::CpuLockCell<P, Option<Tick>>,
    prev: klock::CpuLockCell<P, Option<&'static TaskCb<P>>>,
    next: klock::CpuLockCell<P, Option<&'static TaskCb<P>>>,
}

impl<P: Port> TimeoutCb<P> {
    pub const fn new() -> Self {
        Self {
            deadline: klock::CpuLockCell::new(None),
            prev: klock::CpuLockCell::new(None),
            next: klock::CpuLockCell::new(None),
        }
    }
}

/// The deadline-sorted list of currently armed timeouts, owned by
/// [`Scheduler`].
pub struct TimeoutList<P: Port> {
    head: klock::CpuLockCell<P, Option<&'static TaskCb<P>>>,
}

impl<P: Port> TimeoutList<P> {
    pub const fn new() -> Self {
        Self {
            head: klock::CpuLockCell::new(None),
        }
    }

    /// Arm `task`'s timeout for `deadline`, inserting it in deadline order
    /// (§3 invariant: "equal deadlines keep insertion order").
    pub fn arm(&self, lock: &mut CpuLockGuard<P>, task: &'static TaskCb<P>, deadline: Tick) {
        task.timeout.deadline.replace(&mut **lock, Some(deadline));

        let mut prev: Option<&'static TaskCb<P>> = None;
        let mut cur = self.head.get(&**lock);
        while let Some(node) = cur {
            let node_deadline = node.timeout.deadline.get(&**lock).unwrap();
            if deadline.has_reached(node_deadline) && deadline != node_deadline {
                break;
            }
            prev = Some(node);
            cur = node.timeout.next.get(&**lock);
        }

        task.timeout.prev.replace(&mut **lock, prev);
        task.timeout.next.replace(&mut **lock, cur);
        match prev {
            Some(prev) => prev.timeout.next.replace(&mut **lock, Some(task)),
            None => self.head.replace(&mut **lock, Some(task)),
        };
        if let Some(cur) = cur {
            cur.timeout.prev.replace(&mut **lock, Some(task));
        }
    }

    /// Disarm `task`'s timeout if it has one. A no-op if it already fired or
    /// was never armed — the race described in §4.3 ("if the timer fires
    /// just as the thread is otherwise unblocked ... the second call is a
    /// no-op") is resolved by [`Scheduler::unblock`]'s single-writer check
    /// before this is ever reached.
    pub fn cancel(&self, lock: &mut CpuLockGuard<P>, task: &'static TaskCb<P>) {
        if task.timeout.deadline.get(&**lock).is_none() {
            return;
        }
        let prev = task.timeout.prev.get(&**lock);
        let next = task.timeout.next.get(&**lock);
        match prev {
            Some(prev) => {
                prev.timeout.next.replace(&mut **lock, next);
            }
            None => {
                self.head.replace(&mut **lock, next);
            }
        }
        if let Some(next) = next {
            next.timeout.prev.replace(&mut **lock, prev);
        }
        task.timeout.deadline.replace(&mut **lock, None);
        task.timeout.prev.replace(&mut **lock, None);
        task.timeout.next.replace(&mut **lock, None);
    }

    /// Pop and fire every timeout whose deadline has been reached,
    /// unblocking its task with `ETIMEDOUT`.
    pub fn advance(&self, lock: &mut CpuLockGuard<P>, sched: &Scheduler<P>, now: Tick) {
        loop {
            let Some(task) = self.head.get(&**lock) else {
                return;
            };
            let deadline = task.timeout.deadline.get(&**lock).unwrap();
            if !now.has_reached(deadline) {
                return;
            }
            self.cancel(lock, task);
            sched.unblock(lock, task, UnblockReason::TimedOut);
        }
    }
}
