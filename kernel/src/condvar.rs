//! Condition variables (§4.2).
//!
//! `r3_kernel` has no condition variable — its only rendezvous primitives are
//! the semaphore and event group, neither of which pairs with a mutex — so
//! this is built from scratch on top of [`crate::wait`] and [`crate::mutex`]
//! directly, following the same "queue + generic block loop" shape `mutex.rs`
//! uses. The one piece that needs its own hook is the mutex release: it must
//! happen in the same CPU-Lock critical section as the enqueue onto the
//! condvar's wait queue, or a `notify` between the unlock and the enqueue
//! would be missed. [`wait::wait_with`] exists for exactly this.
use crate::{
    error::{CondvarWaitError, CondvarWaitTimeoutError, LockMutexError},
    klock::{self, CpuLockGuard},
    mutex::{self, MutexCb},
    port::Port,
    sched::Scheduler,
    task::UnblockReason,
    time::{Duration, Tick},
    wait::{self, WaitQueue},
};

pub struct CondvarCb<P: Port> {
    wait_queue: WaitQueue<P>,
}

impl<P: Port> CondvarCb<P> {
    pub const fn new() -> Self {
        Self {
            wait_queue: WaitQueue::new(),
        }
    }
}

impl<P: Port> Default for CondvarCb<P> {
    fn default() -> Self {
        Self::new()
    }
}

/// §4.2 `wait(mutex)`: atomically release `mutex_cb` and block, then
/// re-acquire it (honoring its own priority order, which may itself block)
/// before returning.
pub fn wait<P: Port>(
    cv: &'static CondvarCb<P>,
    mutex_cb: &'static MutexCb<P>,
    sched: &Scheduler<P>,
    lock: CpuLockGuard<P>,
) -> Result<(), CondvarWaitError> {
    match block_and_relock(cv, mutex_cb, sched, lock, None) {
        Ok(UnblockReason::Explicit) => Ok(()),
        Ok(UnblockReason::TimedOut) => unreachable!("untimed condvar wait can't time out"),
        Ok(UnblockReason::Interrupted) => Err(CondvarWaitError::Interrupted),
        Err(CondvarWaitTimeoutError::Interrupted) => Err(CondvarWaitError::Interrupted),
        Err(CondvarWaitTimeoutError::OwnerDead) => Err(CondvarWaitError::OwnerDead),
        Err(CondvarWaitTimeoutError::NotOwner) => Err(CondvarWaitError::NotOwner),
        Err(CondvarWaitTimeoutError::TimedOut) => {
            unreachable!("untimed condvar wait can't time out")
        }
    }
}

/// §4.2 `waitFor`/`waitUntil`.
pub fn wait_until<P: Port>(
    cv: &'static CondvarCb<P>,
    mutex_cb: &'static MutexCb<P>,
    sched: &Scheduler<P>,
    lock: CpuLockGuard<P>,
    deadline: Tick,
) -> Result<(), CondvarWaitTimeoutError> {
    let reason = block_and_relock(cv, mutex_cb, sched, lock, Some(deadline))?;
    match reason {
        UnblockReason::Explicit => Ok(()),
        UnblockReason::TimedOut => Err(CondvarWaitTimeoutError::TimedOut),
        UnblockReason::Interrupted => Err(CondvarWaitTimeoutError::Interrupted),
    }
}

pub fn wait_for<P: Port>(
    cv: &'static CondvarCb<P>,
    mutex_cb: &'static MutexCb<P>,
    sched: &Scheduler<P>,
    lock: CpuLockGuard<P>,
    timeout: Duration,
) -> Result<(), CondvarWaitTimeoutError> {
    let deadline = sched.now(&lock) + timeout;
    wait_until(cv, mutex_cb, sched, lock, deadline)
}

/// Release `mutex_cb`, enqueue onto `cv`, block, then re-lock `mutex_cb` once
/// woken — re-locking may itself re-block if another task grabbed the mutex
/// first (§4.2, "re-lock may re-block on mutex, which must itself honor
/// priority order"). Re-locks on every path, including timeout/interruption,
/// since the caller's invariant ("returns with the mutex held") must hold
/// regardless, same as `pthread_cond_wait`.
fn block_and_relock<P: Port>(
    cv: &'static CondvarCb<P>,
    mutex_cb: &'static MutexCb<P>,
    sched: &Scheduler<P>,
    lock: CpuLockGuard<P>,
    deadline: Option<Tick>,
) -> Result<UnblockReason, CondvarWaitTimeoutError> {
    let task = sched.current(&lock).expect("condvar wait with no current task");
    assert!(
        mutex_cb.is_owned_by(&lock, task),
        "condvar wait called without holding its mutex"
    );
    let reason = wait::wait_with(&cv.wait_queue, sched, lock, deadline, |lock| {
        mutex::release(mutex_cb, sched, task, lock);
    });
    // `wait_with` leaves CPU Lock active with no live guard, the same
    // contract as `wait::wait`/`wait::wait_timeout`.
    let relock_lock = unsafe { klock::assume_cpu_lock::<P>() };
    match mutex::lock(mutex_cb, sched, relock_lock) {
        Ok(()) => Ok(reason),
        Err(LockMutexError::OwnerDead) => {
            // Re-locked successfully but the previous owner abandoned it;
            // surface that instead of the original wake reason, matching
            // robust-mutex semantics (the caller must call `mark_consistent`).
            Err(CondvarWaitTimeoutError::OwnerDead)
        }
        Err(LockMutexError::Deadlock | LockMutexError::InvalidArgument) => {
            unreachable!("condvar's own mutex can't reject a re-lock from its prior owner")
        }
    }
}

/// §4.2 `notifyOne`: wake the single highest-priority waiter, if any.
pub fn notify_one<P: Port>(cv: &'static CondvarCb<P>, sched: &Scheduler<P>, lock: &mut CpuLockGuard<P>) {
    if let Some(task) = cv.wait_queue.pop_first(lock) {
        sched.unblock(lock, task, UnblockReason::Explicit);
    }
}

/// §4.2 `notifyAll`: wake every waiter.
pub fn notify_all<P: Port>(cv: &'static CondvarCb<P>, sched: &Scheduler<P>, lock: &mut CpuLockGuard<P>) {
    while let Some(task) = cv.wait_queue.pop_first(lock) {
        sched.unblock(lock, task, UnblockReason::Explicit);
    }
}
