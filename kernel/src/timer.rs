//! Software timers (§4.3).
//!
//! Structured the same way as [`crate::timeout`]'s scheduler-timeout list —
//! a CPU-locked, deadline-sorted singly-linked list advanced from the tick
//! ISR — but a timer's callback must not run in ISR context (§4.3: "in a
//! dedicated software-timer thread ... not in ISR context"), so [`advance`]
//! only moves expired timers onto a second FIFO list and wakes the
//! dedicated software-timer thread; [`run_due`] is that thread's loop body,
//! called from ordinary thread context where calling into a callback that
//! may itself use blocking kernel APIs is safe.
//!
//! [`advance`]: TimerList::advance
//! [`run_due`]: TimerList::run_due
use crate::{
    klock::{self, CpuLockCell, CpuLockGuard},
    port::Port,
    sched::Scheduler,
    task::UnblockReason,
    time::{Duration, Tick},
    wait::WaitQueue,
};

pub type TimerCallback = fn(usize);

/// A single software timer. Usually lives as a `'static` value built by
/// [`crate::builder`], like a [`crate::task::TaskCb`].
pub struct TimerCb<P: Port> {
    callback: TimerCallback,
    arg: usize,
    /// `Duration::ZERO` means one-shot.
    period: CpuLockCell<P, Duration>,
    /// `Some` both while armed *and*, briefly, while sitting on the due FIFO
    /// awaiting its callback — in the latter case it holds the deadline
    /// that just fired, which [`TimerList::run_due`] needs to compute the
    /// next `deadline += period` without drift.
    deadline: CpuLockCell<P, Option<Tick>>,
    prev: CpuLockCell<P, Option<&'static TimerCb<P>>>,
    next: CpuLockCell<P, Option<&'static TimerCb<P>>>,
    /// Link for the separate due FIFO; never linked into both lists at once.
    due_next: CpuLockCell<P, Option<&'static TimerCb<P>>>,
}

impl<P: Port> TimerCb<P> {
    pub const fn new(callback: TimerCallback, arg: usize, period: Duration) -> Self {
        Self {
            callback,
            arg,
            period: CpuLockCell::new(period),
            deadline: CpuLockCell::new(None),
            prev: CpuLockCell::new(None),
            next: CpuLockCell::new(None),
            due_next: CpuLockCell::new(None),
        }
    }

    pub fn is_armed(&self, lock: &CpuLockGuard<P>) -> bool {
        self.deadline.get(&**lock).is_some()
    }
}

/// The deadline-sorted list of armed timers plus the FIFO of expired ones
/// awaiting their callback, owned by [`Scheduler`].
pub struct TimerList<P: Port> {
    head: CpuLockCell<P, Option<&'static TimerCb<P>>>,
    due_head: CpuLockCell<P, Option<&'static TimerCb<P>>>,
    due_tail: CpuLockCell<P, Option<&'static TimerCb<P>>>,
    /// The dedicated software-timer thread blocks here while the due list
    /// is empty.
    worker_wait: WaitQueue<P>,
}

impl<P: Port> TimerList<P> {
    pub const fn new() -> Self {
        Self {
            head: CpuLockCell::new(None),
            due_head: CpuLockCell::new(None),
            due_tail: CpuLockCell::new(None),
            worker_wait: WaitQueue::new(),
        }
    }

    /// Arm (or re-arm) `timer` for `deadline`, in deadline order (ties kept
    /// in insertion order, same as [`crate::timeout::TimeoutList`]).
    pub fn arm(&self, lock: &mut CpuLockGuard<P>, timer: &'static TimerCb<P>, deadline: Tick) {
        timer.deadline.replace(&mut **lock, Some(deadline));

        let mut prev: Option<&'static TimerCb<P>> = None;
        let mut cur = self.head.get(&**lock);
        while let Some(node) = cur {
            let node_deadline = node.deadline.get(&**lock).unwrap();
            if deadline.has_reached(node_deadline) && deadline != node_deadline {
                break;
            }
            prev = Some(node);
            cur = node.next.get(&**lock);
        }

        timer.prev.replace(&mut **lock, prev);
        timer.next.replace(&mut **lock, cur);
        match prev {
            Some(prev) => prev.next.replace(&mut **lock, Some(timer)),
            None => self.head.replace(&mut **lock, Some(timer)),
        };
        if let Some(cur) = cur {
            cur.prev.replace(&mut **lock, Some(timer));
        }
    }

    /// Unlink `timer` from the armed list without touching its `deadline`
    /// field — shared by [`cancel`](Self::cancel) (which clears `deadline`
    /// right after, fully disarming) and [`advance`](Self::advance) (which
    /// leaves it as the fired deadline for [`run_due`](Self::run_due)).
    fn unlink(&self, lock: &mut CpuLockGuard<P>, timer: &'static TimerCb<P>) {
        let prev = timer.prev.get(&**lock);
        let next = timer.next.get(&**lock);
        match prev {
            Some(prev) => {
                prev.next.replace(&mut **lock, next);
            }
            None => {
                self.head.replace(&mut **lock, next);
            }
        }
        if let Some(next) = next {
            next.prev.replace(&mut **lock, prev);
        }
        timer.prev.replace(&mut **lock, None);
        timer.next.replace(&mut **lock, None);
    }

    /// Disarm `timer`. A no-op if it already fired (moved to the due FIFO)
    /// or was never armed.
    pub fn cancel(&self, lock: &mut CpuLockGuard<P>, timer: &'static TimerCb<P>) {
        if timer.deadline.get(&**lock).is_none() {
            return;
        }
        self.unlink(lock, timer);
        timer.deadline.replace(&mut **lock, None);
    }

    fn push_due(&self, lock: &mut CpuLockGuard<P>, timer: &'static TimerCb<P>) {
        timer.due_next.replace(&mut **lock, None);
        match self.due_tail.get(&**lock) {
            Some(tail) => {
                tail.due_next.replace(&mut **lock, Some(timer));
            }
            None => {
                self.due_head.replace(&mut **lock, Some(timer));
            }
        }
        self.due_tail.replace(&mut **lock, Some(timer));
    }

    fn pop_due(&self, lock: &mut CpuLockGuard<P>) -> Option<&'static TimerCb<P>> {
        let timer = self.due_head.get(&**lock)?;
        let next = timer.due_next.get(&**lock);
        self.due_head.replace(&mut **lock, next);
        if next.is_none() {
            self.due_tail.replace(&mut **lock, None);
        }
        Some(timer)
    }

    /// §4.1 `tick`'s timer-wheel step: move every timer whose deadline has
    /// been reached onto the due FIFO and wake the software-timer thread.
    /// Never calls a callback directly — this runs in ISR context.
    pub fn advance(&self, lock: &mut CpuLockGuard<P>, sched: &Scheduler<P>, now: Tick) {
        let mut fired = false;
        loop {
            let Some(timer) = self.head.get(&**lock) else {
                break;
            };
            let deadline = timer.deadline.get(&**lock).unwrap();
            if !now.has_reached(deadline) {
                break;
            }
            self.unlink(lock, timer);
            self.push_due(lock, timer);
            fired = true;
        }
        if fired {
            if let Some(task) = self.worker_wait.pop_first(lock) {
                sched.unblock(lock, task, UnblockReason::Explicit);
            }
        }
    }

    /// The dedicated software-timer thread's loop body: run every timer
    /// currently due, re-arming periodic ones with `deadline += period`
    /// (§4.3: "guaranteeing no drift but allowing catch-up firings"), then
    /// block until [`advance`] wakes it again. Never returns.
    ///
    /// A periodic timer only ever occupies one slot on the due FIFO per
    /// visit here, no matter how many of its periods have actually elapsed
    /// since the last tick — `advance` moves it off the armed list the
    /// moment its single `deadline` field is reached and doesn't revisit it.
    /// So after each firing this re-checks the freshly advanced `deadline`
    /// against the current tick itself, firing again in place before
    /// re-arming, rather than handing back a still-overdue timer to the
    /// worker's next wake-up one period at a time.
    pub fn run_due(&'static self, sched: &Scheduler<P>, mut lock: CpuLockGuard<P>) -> ! {
        loop {
            while let Some(timer) = self.pop_due(&mut lock) {
                let period = timer.period.get(&*lock);
                if period == Duration::ZERO {
                    timer.deadline.replace(&mut *lock, None);
                    drop(lock);
                    (timer.callback)(timer.arg);
                    lock = klock::lock_cpu::<P>().expect("timer callback returned with CPU Lock active");
                    continue;
                }
                loop {
                    let fired_deadline = timer
                        .deadline
                        .get(&*lock)
                        .expect("a due timer keeps its fired deadline until rearmed");
                    let next_deadline = fired_deadline + period;
                    timer.deadline.replace(&mut *lock, Some(next_deadline));
                    drop(lock);
                    (timer.callback)(timer.arg);
                    lock = klock::lock_cpu::<P>().expect("timer callback returned with CPU Lock active");
                    if !sched.now(&lock).has_reached(next_deadline) {
                        break;
                    }
                }
                let deadline = timer.deadline.get(&*lock).unwrap();
                self.arm(&mut lock, timer, deadline);
            }
            let _ = crate::wait::wait(&self.worker_wait, sched, lock);
            lock = unsafe { klock::assume_cpu_lock::<P>() };
        }
    }
}

impl<P: Port> Default for TimerList<P> {
    fn default() -> Self {
        Self::new()
    }
}
