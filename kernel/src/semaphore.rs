//! Counting semaphores (§4.2).
//!
//! Grounded directly on `r3_kernel::semaphore`'s `poll_core`/`signal` split:
//! `poll` decrements the count if positive, `post` hands a permit straight to
//! the highest-priority waiter instead of incrementing the count when one is
//! waiting ("direct hand-off"), and only touches `value` when the queue is
//! empty. Unlike the teacher, `post` here never blocks and is written to take
//! `&mut CpuLockGuard<P>` directly rather than an owned guard, since the spec
//! requires it to be ISR-callable.
use crate::{
    error::{PostSemaphoreError, WaitError, WaitTimeoutError},
    klock::{self, CpuLockGuard},
    port::Port,
    sched::Scheduler,
    task::UnblockReason,
    time::{Duration, Tick},
    wait::WaitQueue,
};

pub struct SemaphoreCb<P: Port> {
    value: crate::klock::CpuLockCell<P, u32>,
    max_value: u32,
    wait_queue: WaitQueue<P>,
}

impl<P: Port> SemaphoreCb<P> {
    pub const fn new(initial: u32, max_value: u32) -> Self {
        Self {
            value: crate::klock::CpuLockCell::new(initial),
            max_value,
            wait_queue: WaitQueue::new(),
        }
    }

    pub fn value(&self, lock: &CpuLockGuard<P>) -> u32 {
        self.value.get(&**lock)
    }
}

fn poll<P: Port>(sem: &SemaphoreCb<P>, lock: &mut CpuLockGuard<P>) -> bool {
    let v = sem.value.get(&**lock);
    if v > 0 {
        sem.value.replace(&mut **lock, v - 1);
        true
    } else {
        false
    }
}

/// §4.2 `wait`: block until a permit is available.
pub fn wait<P: Port>(
    sem: &'static SemaphoreCb<P>,
    sched: &Scheduler<P>,
    mut lock: CpuLockGuard<P>,
) -> Result<(), WaitError> {
    if poll(sem, &mut lock) {
        return Ok(());
    }
    let result = crate::wait::wait(&sem.wait_queue, sched, lock);
    // `wait::wait` leaves CPU Lock active with no live guard; reconstitute
    // one so it actually gets released when this function returns.
    drop(unsafe { klock::assume_cpu_lock::<P>() });
    result
}

/// §4.2 `tryWait`: `EBUSY`-style immediate failure, reported here as `bool`
/// (the caller maps `false` to its own "no permit" error code).
pub fn try_wait<P: Port>(sem: &'static SemaphoreCb<P>, lock: &mut CpuLockGuard<P>) -> bool {
    poll(sem, lock)
}

/// §4.2 `tryWaitFor`/`tryWaitUntil`.
pub fn wait_until<P: Port>(
    sem: &'static SemaphoreCb<P>,
    sched: &Scheduler<P>,
    mut lock: CpuLockGuard<P>,
    deadline: Tick,
) -> Result<(), WaitTimeoutError> {
    if poll(sem, &mut lock) {
        return Ok(());
    }
    let result = crate::wait::wait_timeout(&sem.wait_queue, sched, lock, deadline);
    drop(unsafe { klock::assume_cpu_lock::<P>() });
    result
}

pub fn wait_for<P: Port>(
    sem: &'static SemaphoreCb<P>,
    sched: &Scheduler<P>,
    lock: CpuLockGuard<P>,
    timeout: Duration,
) -> Result<(), WaitTimeoutError> {
    let deadline = sched.now(&lock) + timeout;
    wait_until(sem, sched, lock, deadline)
}

/// §4.2 `post`: hand a permit directly to the highest-priority waiter if one
/// exists; otherwise increment the count, failing with `EOVERFLOW` if that
/// would exceed `max_value`. Callable from ISR context.
pub fn post<P: Port>(
    sem: &'static SemaphoreCb<P>,
    sched: &Scheduler<P>,
    lock: &mut CpuLockGuard<P>,
) -> Result<(), PostSemaphoreError> {
    if let Some(task) = sem.wait_queue.pop_first(lock) {
        sched.unblock(lock, task, UnblockReason::Explicit);
        return Ok(());
    }
    let v = sem.value.get(&**lock);
    if v >= sem.max_value {
        return Err(PostSemaphoreError::Overflow);
    }
    sem.value.replace(&mut **lock, v + 1);
    Ok(())
}
