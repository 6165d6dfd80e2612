//! Bounded queues (§4.2): raw byte queues and typed FIFO/message queues
//! share one generic implementation here, [`QueueCb<P, T, N>`]. A plain FIFO
//! queue is the degenerate case where every push uses the same priority; a
//! message queue passes a real priority byte and pop returns the
//! highest-priority slot, FIFO among equal priorities — the same
//! descending-with-stable-ties order [`crate::wait::WaitQueue`] keeps for
//! blocked tasks, reused here for queued values instead.
//!
//! `r3_kernel` has no message-queue kind (its queues are untyped, unordered,
//! and always raw bytes), and `original_source/` only ships a message queue
//! *test case*, not an implementation, so the push/pop blocking loop below
//! is grounded directly on this kernel's own `mutex.rs`: a `poll`-then-block
//! pair reusing [`crate::wait::WaitQueue`], rather than on two separate
//! [`crate::semaphore::SemaphoreCb`] instances. A real free-slot and
//! used-slot semaphore pair would need its wait to be reconstituted across
//! the slot-mutation step in between, which the public semaphore API's
//! narrow `Result<(), _>`-only contract isn't shaped for; counting `len`
//! against the fixed capacity `N` plays the same role without that seam.
use crate::{
    error::{WaitError, WaitTimeoutError},
    klock::{self, CpuLockCell, CpuLockGuard},
    port::Port,
    sched::Scheduler,
    task::UnblockReason,
    time::{Duration, Tick},
    wait::{self, WaitQueue},
};

struct Slots<T, const N: usize> {
    items: [Option<(u8, T)>; N],
    len: usize,
}

impl<T, const N: usize> Slots<T, N> {
    const fn new() -> Self {
        Self {
            items: [const { None }; N],
            len: 0,
        }
    }

    fn is_full(&self) -> bool {
        self.len == N
    }

    /// Insert after every existing entry whose priority is `>=` this one,
    /// the same stable descending order `WaitQueue::insert` keeps.
    fn insert(&mut self, priority: u8, value: T) {
        let mut pos = 0;
        while pos < self.len {
            let (p, _) = self.items[pos].as_ref().expect("len entries are Some");
            if *p < priority {
                break;
            }
            pos += 1;
        }
        let mut i = self.len;
        while i > pos {
            self.items[i] = self.items[i - 1].take();
            i -= 1;
        }
        self.items[pos] = Some((priority, value));
        self.len += 1;
    }

    fn remove_front(&mut self) -> Option<T> {
        if self.len == 0 {
            return None;
        }
        let (_, value) = self.items[0].take().expect("len entries are Some");
        for i in 0..self.len - 1 {
            self.items[i] = self.items[i + 1].take();
        }
        self.len -= 1;
        Some(value)
    }
}

/// A bounded queue of up to `N` values of type `T`, ordered by an `u8`
/// priority given at push time (FIFO queues just always pass the same
/// value). Push blocks while full; pop blocks while empty.
pub struct QueueCb<P: Port, T, const N: usize> {
    slots: CpuLockCell<P, Slots<T, N>>,
    push_waiters: WaitQueue<P>,
    pop_waiters: WaitQueue<P>,
}

impl<P: Port, T, const N: usize> QueueCb<P, T, N> {
    pub const fn new() -> Self {
        Self {
            slots: CpuLockCell::new(Slots::new()),
            push_waiters: WaitQueue::new(),
            pop_waiters: WaitQueue::new(),
        }
    }

    pub fn len(&self, lock: &CpuLockGuard<P>) -> usize {
        self.slots.read(&**lock).len
    }

    pub fn is_empty(&self, lock: &CpuLockGuard<P>) -> bool {
        self.len(lock) == 0
    }

    pub fn is_full(&self, lock: &CpuLockGuard<P>) -> bool {
        self.slots.read(&**lock).is_full()
    }
}

impl<P: Port, T, const N: usize> Default for QueueCb<P, T, N> {
    fn default() -> Self {
        Self::new()
    }
}

/// §4.2 `push`/`emplace`: block while the queue is full.
pub fn push<P: Port, T, const N: usize>(
    q: &'static QueueCb<P, T, N>,
    sched: &Scheduler<P>,
    priority: u8,
    value: T,
    mut lock: CpuLockGuard<P>,
) -> Result<(), WaitError> {
    loop {
        if !q.slots.read(&*lock).is_full() {
            q.slots.write(&mut *lock).insert(priority, value);
            wake_one(&q.pop_waiters, sched, &mut lock);
            return Ok(());
        }
        let result = wait::wait(&q.push_waiters, sched, lock);
        lock = unsafe { klock::assume_cpu_lock::<P>() };
        result?;
        // Woken because a slot was freed (or spuriously); re-poll rather
        // than assuming this waiter in particular gets it — another racing
        // pusher (or a push from ISR-less but higher-priority context)
        // might have taken it first.
    }
}

/// §4.2 `tryPush`/`tryEmplace`: `EAGAIN`-style immediate failure, reported as
/// `Err(value)` handing the value back so the caller isn't forced to make it
/// `Clone` just to retry.
pub fn try_push<P: Port, T, const N: usize>(
    q: &'static QueueCb<P, T, N>,
    sched: &Scheduler<P>,
    priority: u8,
    value: T,
    lock: &mut CpuLockGuard<P>,
) -> Result<(), T> {
    if q.slots.read(&**lock).is_full() {
        return Err(value);
    }
    q.slots.write(&mut **lock).insert(priority, value);
    wake_one(&q.pop_waiters, sched, lock);
    Ok(())
}

/// §4.2 `tryPushFor`/`tryPushUntil`.
pub fn push_until<P: Port, T, const N: usize>(
    q: &'static QueueCb<P, T, N>,
    sched: &Scheduler<P>,
    priority: u8,
    value: T,
    mut lock: CpuLockGuard<P>,
    deadline: Tick,
) -> Result<(), WaitTimeoutError> {
    loop {
        if !q.slots.read(&*lock).is_full() {
            q.slots.write(&mut *lock).insert(priority, value);
            wake_one(&q.pop_waiters, sched, &mut lock);
            return Ok(());
        }
        let result = wait::wait_timeout(&q.push_waiters, sched, lock, deadline);
        lock = unsafe { klock::assume_cpu_lock::<P>() };
        result?;
    }
}

pub fn push_for<P: Port, T, const N: usize>(
    q: &'static QueueCb<P, T, N>,
    sched: &Scheduler<P>,
    priority: u8,
    value: T,
    lock: CpuLockGuard<P>,
    timeout: Duration,
) -> Result<(), WaitTimeoutError> {
    let deadline = sched.now(&lock) + timeout;
    push_until(q, sched, priority, value, lock, deadline)
}

/// §4.2 `pop`: block while the queue is empty; returns the highest-priority
/// slot (FIFO among equal priorities).
pub fn pop<P: Port, T, const N: usize>(
    q: &'static QueueCb<P, T, N>,
    sched: &Scheduler<P>,
    mut lock: CpuLockGuard<P>,
) -> Result<T, WaitError> {
    loop {
        if let Some(value) = q.slots.write(&mut *lock).remove_front() {
            wake_one(&q.push_waiters, sched, &mut lock);
            return Ok(value);
        }
        let result = wait::wait(&q.pop_waiters, sched, lock);
        lock = unsafe { klock::assume_cpu_lock::<P>() };
        result?;
    }
}

pub fn try_pop<P: Port, T, const N: usize>(
    q: &'static QueueCb<P, T, N>,
    sched: &Scheduler<P>,
    lock: &mut CpuLockGuard<P>,
) -> Option<T> {
    let value = q.slots.write(&mut **lock).remove_front()?;
    wake_one(&q.push_waiters, sched, lock);
    Some(value)
}

pub fn pop_until<P: Port, T, const N: usize>(
    q: &'static QueueCb<P, T, N>,
    sched: &Scheduler<P>,
    mut lock: CpuLockGuard<P>,
    deadline: Tick,
) -> Result<T, WaitTimeoutError> {
    loop {
        if let Some(value) = q.slots.write(&mut *lock).remove_front() {
            wake_one(&q.push_waiters, sched, &mut lock);
            return Ok(value);
        }
        let result = wait::wait_timeout(&q.pop_waiters, sched, lock, deadline);
        lock = unsafe { klock::assume_cpu_lock::<P>() };
        result?;
    }
}

pub fn pop_for<P: Port, T, const N: usize>(
    q: &'static QueueCb<P, T, N>,
    sched: &Scheduler<P>,
    lock: CpuLockGuard<P>,
    timeout: Duration,
) -> Result<T, WaitTimeoutError> {
    let deadline = sched.now(&lock) + timeout;
    pop_until(q, sched, lock, deadline)
}

fn wake_one<P: Port>(queue: &WaitQueue<P>, sched: &Scheduler<P>, lock: &mut CpuLockGuard<P>) {
    if let Some(task) = queue.pop_first(lock) {
        sched.unblock(lock, task, UnblockReason::Explicit);
    }
}
