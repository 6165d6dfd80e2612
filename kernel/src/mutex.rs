//! Mutexes: `None`, `PriorityProtect` (ceiling) and `PriorityInheritance`
//! locking protocols, layered on three recursion modes.
//!
//! The ceiling protocol and the held-mutex chain (`last_mutex_held` /
//! `prev_mutex_held`) are carried over directly from `r3_kernel::mutex`
//! (`lock_core`, `unlock_mutex_unchecked`, `evaluate_task_effective_priority`,
//! `do_held_mutexes_allow_new_task_base_priority`). Priority inheritance has
//! no counterpart there (`r3_kernel` only ships `None`/`Ceiling`) and is built
//! from scratch: each mutex additionally tracks the effective priority of its
//! highest waiter (`pi_boost`), folded into the owner's priority floor the
//! same way a ceiling is, and propagated transitively through a bounded
//! number of "blocked on" hops when the current owner is itself waiting on
//! another `PriorityInheritance` mutex.
use crate::{
    error::{
        LockMutexError, LockMutexPrecheckError, LockMutexTimeoutError, TryLockMutexError,
        UnlockMutexError, WaitError, WaitTimeoutError,
    },
    klock::{self, CpuLockGuard},
    port::Port,
    sched::Scheduler,
    task::{TaskCb, UnblockReason},
    time::{Duration, Tick},
    wait::{self, WaitQueue},
    Priority,
};

/// How a mutex resolves priority inversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutexProtocol {
    None,
    /// Priority ceiling: the owner's effective priority is raised to
    /// `ceiling` for as long as it holds the lock. Locking fails with
    /// `EINVAL` if the calling task's base priority is already above
    /// `ceiling`.
    PriorityProtect { ceiling: Priority },
    /// Priority inheritance: the owner's effective priority is raised to
    /// the highest waiter's effective priority, for as long as that waiter
    /// is blocked.
    PriorityInheritance,
}

/// Re-lock behavior when the owner already holds the mutex.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecursionMode {
    /// Re-lock by the owner fails with `EDEADLK`, checked on every lock.
    ErrorCheck,
    /// Re-lock by the owner fails with `EDEADLK`, check skipped: undefined
    /// (in practice, self-deadlock) if violated. Matches a plain POSIX
    /// `PTHREAD_MUTEX_NORMAL` mutex.
    Normal,
    /// Re-lock by the owner succeeds and bumps a lock count; `unlock` must
    /// be called the same number of times before the mutex is released.
    Recursive,
}

/// Bound on priority-inheritance propagation hops, so a cycle in
/// `blocking_mutex` (which would only arise from a kernel bug, since the
/// wait graph is acyclic by construction) can't spin forever.
const MAX_INHERITANCE_DEPTH: u32 = 16;

pub struct MutexCb<P: Port> {
    protocol: MutexProtocol,
    recursion: RecursionMode,
    owning_task: klock::CpuLockCell<P, Option<&'static TaskCb<P>>>,
    lock_count: klock::CpuLockCell<P, u32>,
    inconsistent: klock::CpuLockCell<P, bool>,
    /// Highest effective priority among current waiters, maintained only
    /// for [`MutexProtocol::PriorityInheritance`].
    pi_boost: klock::CpuLockCell<P, Option<Priority>>,
    wait_queue: WaitQueue<P>,
    /// Next element of the singly-linked list headed by
    /// `TaskCb::last_mutex_held`.
    pub(crate) prev_mutex_held: klock::CpuLockCell<P, Option<&'static MutexCb<P>>>,
}

impl<P: Port> MutexCb<P> {
    pub const fn new(protocol: MutexProtocol, recursion: RecursionMode) -> Self {
        Self {
            protocol,
            recursion,
            owning_task: klock::CpuLockCell::new(None),
            lock_count: klock::CpuLockCell::new(0),
            inconsistent: klock::CpuLockCell::new(false),
            pi_boost: klock::CpuLockCell::new(None),
            wait_queue: WaitQueue::new(),
            prev_mutex_held: klock::CpuLockCell::new(None),
        }
    }

    pub fn is_locked(&self, lock: &CpuLockGuard<P>) -> bool {
        self.owning_task.get(&**lock).is_some()
    }

    /// Whether `task` is the current owner — used by [`crate::condvar`] to
    /// validate its precondition that the mutex is locked by the caller.
    pub(crate) fn is_owned_by(&self, lock: &CpuLockGuard<P>, task: &'static TaskCb<P>) -> bool {
        same_task(self.owning_task.get(&**lock), task)
    }

    /// The priority floor this mutex currently imposes on its owner, folded
    /// into [`TaskCb::recompute_ceiling_floor`] alongside every other mutex
    /// the task holds.
    pub(crate) fn priority_floor(&self, lock: &CpuLockGuard<P>) -> Option<Priority> {
        match self.protocol {
            MutexProtocol::PriorityProtect { ceiling } => Some(ceiling),
            MutexProtocol::PriorityInheritance => self.pi_boost.get(&**lock),
            MutexProtocol::None => None,
        }
    }

    pub fn mark_consistent(&self, lock: &mut CpuLockGuard<P>) -> bool {
        self.inconsistent.replace(&mut **lock, false)
    }
}

fn same_task<P: Port>(a: Option<&'static TaskCb<P>>, b: &'static TaskCb<P>) -> bool {
    matches!(a, Some(a) if core::ptr::eq(a, b))
}

fn precheck<P: Port>(
    sched: &Scheduler<P>,
    mutex_cb: &'static MutexCb<P>,
    lock: &CpuLockGuard<P>,
) -> Result<&'static TaskCb<P>, LockMutexPrecheckError> {
    let task = sched.current(lock).expect("lock called with no current task");

    if let MutexProtocol::PriorityProtect { ceiling } = mutex_cb.protocol {
        if task.priority(lock) > ceiling {
            return Err(LockMutexPrecheckError::InvalidArgument);
        }
    }

    // `Normal` mode intentionally skips this check (a self-relock just
    // blocks forever, same as a plain `PTHREAD_MUTEX_NORMAL` mutex); only
    // `ErrorCheck` reports it up front.
    if mutex_cb.recursion == RecursionMode::ErrorCheck
        && same_task(mutex_cb.owning_task.get(&**lock), task)
    {
        return Err(LockMutexPrecheckError::Deadlock);
    }

    Ok(task)
}

/// Give ownership of `mutex_cb` to `task`, which must be Running or about to
/// become Running. Updates the held-mutex chain and `task`'s effective
/// priority; does not touch the wait queue.
fn grant<P: Port>(mutex_cb: &'static MutexCb<P>, task: &'static TaskCb<P>, lock: &mut CpuLockGuard<P>) {
    mutex_cb.owning_task.replace(&mut **lock, Some(task));
    mutex_cb.lock_count.replace(&mut **lock, 1);

    let prev = task.last_mutex_held.replace(&mut **lock, Some(mutex_cb));
    mutex_cb.prev_mutex_held.replace(&mut **lock, prev);

    let base = task.priority(&*lock);
    let effective = task.recompute_ceiling_floor(lock, base);
    task.effective_priority.replace(&mut **lock, effective);
}

/// Attempt to satisfy the lock immediately. Returns `true` (and grants or
/// bumps the recursion count) if it could; `false` if the caller must block.
fn poll<P: Port>(
    mutex_cb: &'static MutexCb<P>,
    task: &'static TaskCb<P>,
    lock: &mut CpuLockGuard<P>,
) -> bool {
    match mutex_cb.owning_task.get(&**lock) {
        None => {
            grant(mutex_cb, task, lock);
            true
        }
        Some(owner)
            if core::ptr::eq(owner, task) && mutex_cb.recursion == RecursionMode::Recursive =>
        {
            let count = mutex_cb.lock_count.get(&**lock);
            mutex_cb.lock_count.replace(&mut **lock, count + 1);
            true
        }
        // A different owner, or a self-relock on a `Normal`/`ErrorCheck`
        // mutex (the latter already rejected by `precheck`): block.
        Some(_) => false,
    }
}

/// Raise `owner`'s effective priority to account for a new waiter of
/// `waiter_pri`, propagating through however many `PriorityInheritance`
/// mutexes `owner` is itself blocked on.
fn propagate_inheritance<P: Port>(
    lock: &mut CpuLockGuard<P>,
    sched: &Scheduler<P>,
    mutex_cb: &'static MutexCb<P>,
    mut owner: &'static TaskCb<P>,
    waiter_pri: Priority,
) {
    let current = mutex_cb.pi_boost.get(&**lock).unwrap_or(0);
    if waiter_pri <= current {
        return;
    }
    mutex_cb.pi_boost.replace(&mut **lock, Some(waiter_pri));

    for _ in 0..MAX_INHERITANCE_DEPTH {
        let old_pri = owner.effective_priority.get(&**lock);
        let base = owner.priority(&*lock);
        let effective = owner.recompute_ceiling_floor(lock, base);
        owner.effective_priority.replace(&mut **lock, effective);
        // `owner` might be sitting in the ready queue right now (preempted
        // while holding the mutex, not blocked on anything) — in that case
        // the boost above is invisible to dispatch order until its bucket
        // is fixed up too.
        sched.reorder_ready(lock, owner, old_pri);

        let next_mutex = match owner.blocking_mutex.get(&**lock) {
            Some(m) if matches!(m.protocol, MutexProtocol::PriorityInheritance) => m,
            _ => break,
        };
        next_mutex.wait_queue.reorder(lock, owner);
        let next_current = next_mutex.pi_boost.get(&**lock).unwrap_or(0);
        if effective <= next_current {
            break;
        }
        next_mutex.pi_boost.replace(&mut **lock, Some(effective));
        match next_mutex.owning_task.get(&**lock) {
            Some(next_owner) => owner = next_owner,
            None => break,
        }
    }
}

/// Block the current task on `mutex_cb`, first applying the priority-boost
/// side effect if the protocol calls for it. Returns with CPU Lock active
/// (no live guard), matching [`wait::wait`]/[`wait::wait_timeout`]'s contract.
fn block<P: Port>(
    mutex_cb: &'static MutexCb<P>,
    sched: &Scheduler<P>,
    mut lock: CpuLockGuard<P>,
    task: &'static TaskCb<P>,
    deadline: Option<Tick>,
) -> Result<(), WaitTimeoutError> {
    if let MutexProtocol::PriorityInheritance = mutex_cb.protocol {
        if let Some(owner) = mutex_cb.owning_task.get(&*lock) {
            let waiter_pri = task.effective_priority(&lock);
            propagate_inheritance(&mut lock, sched, mutex_cb, owner, waiter_pri);
        }
    }
    task.blocking_mutex.replace(&mut *lock, Some(mutex_cb));
    match deadline {
        Some(deadline) => wait::wait_timeout(&mutex_cb.wait_queue, sched, lock, deadline),
        None => wait::wait(&mutex_cb.wait_queue, sched, lock).map_err(|WaitError::Interrupted| {
            unreachable!("mutex wait is not a signal-interruption point")
        }),
    }
}

/// Clear `task.blocking_mutex` after a (possibly failed) block attempt. CPU
/// Lock must be active with no live guard, per [`block`]'s return contract —
/// so this reconstitutes a guard for the still-active lock rather than
/// re-entering it.
fn clear_blocking_mutex<P: Port>(task: &'static TaskCb<P>) {
    let mut lock = unsafe { klock::assume_cpu_lock::<P>() };
    task.blocking_mutex.replace(&mut *lock, None);
    core::mem::forget(lock);
}

pub fn lock<P: Port>(
    mutex_cb: &'static MutexCb<P>,
    sched: &Scheduler<P>,
    mut lock: CpuLockGuard<P>,
) -> Result<(), LockMutexError> {
    let task = precheck(sched, mutex_cb, &lock)?;

    let lock = if poll(mutex_cb, task, &mut lock) {
        lock
    } else {
        let result = block(mutex_cb, sched, lock, task, None);
        clear_blocking_mutex::<P>(task);
        // Reconstitute before converting the error: a `?` return must find a
        // live guard already in scope to drop, or CPU Lock leaks forever.
        let lock = unsafe { klock::assume_cpu_lock::<P>() };
        result.map_err(|e| -> LockMutexError {
            match e {
                WaitTimeoutError::TimedOut => unreachable!("untimed mutex wait can't time out"),
                WaitTimeoutError::Interrupted => unreachable!("mutex wait is not signal-interruptible"),
            }
        })?;
        lock
    };
    let result = if mutex_cb.inconsistent.get(&*lock) {
        Err(LockMutexError::OwnerDead)
    } else {
        Ok(())
    };
    drop(lock);
    result
}

pub fn try_lock<P: Port>(
    mutex_cb: &'static MutexCb<P>,
    sched: &Scheduler<P>,
    mut lock: CpuLockGuard<P>,
) -> Result<(), TryLockMutexError> {
    let task = precheck(sched, mutex_cb, &lock)?;

    if !poll(mutex_cb, task, &mut lock) {
        return Err(TryLockMutexError::Busy);
    }

    if mutex_cb.inconsistent.get(&*lock) {
        Err(TryLockMutexError::OwnerDead)
    } else {
        Ok(())
    }
}

pub fn lock_for<P: Port>(
    mutex_cb: &'static MutexCb<P>,
    sched: &Scheduler<P>,
    lock: CpuLockGuard<P>,
    timeout: Duration,
) -> Result<(), LockMutexTimeoutError> {
    let deadline = sched.now(&lock) + timeout;
    lock_until(mutex_cb, sched, lock, deadline)
}

pub fn lock_until<P: Port>(
    mutex_cb: &'static MutexCb<P>,
    sched: &Scheduler<P>,
    mut lock: CpuLockGuard<P>,
    deadline: Tick,
) -> Result<(), LockMutexTimeoutError> {
    let task = precheck(sched, mutex_cb, &lock)?;
    let lock = if poll(mutex_cb, task, &mut lock) {
        lock
    } else {
        let result = block(mutex_cb, sched, lock, task, Some(deadline));
        clear_blocking_mutex::<P>(task);
        // Reconstitute before converting the error (this is the reachable
        // timeout path): a `?` return must find a live guard already in
        // scope to drop, or CPU Lock leaks forever.
        let lock = unsafe { klock::assume_cpu_lock::<P>() };
        result.map_err(|e| match e {
            WaitTimeoutError::TimedOut => LockMutexTimeoutError::TimedOut,
            WaitTimeoutError::Interrupted => unreachable!("mutex wait is not signal-interruptible"),
        })?;
        lock
    };
    let result = if mutex_cb.inconsistent.get(&*lock) {
        Err(LockMutexTimeoutError::OwnerDead)
    } else {
        Ok(())
    };
    drop(lock);
    result
}

pub fn unlock<P: Port>(
    mutex_cb: &'static MutexCb<P>,
    sched: &Scheduler<P>,
    mut lock: CpuLockGuard<P>,
) -> Result<(), UnlockMutexError> {
    let task = sched.current(&lock).expect("unlock called with no current task");

    if !same_task(mutex_cb.owning_task.get(&*lock), task) {
        return Err(UnlockMutexError::NotOwner);
    }

    let count = mutex_cb.lock_count.get(&*lock);
    if count > 1 {
        mutex_cb.lock_count.replace(&mut *lock, count - 1);
        return Ok(());
    }

    release(mutex_cb, sched, task, &mut lock);
    sched.yield_now(lock);
    Ok(())
}

/// Release `mutex_cb` (held exactly once) from `task` and, if a waiter
/// exists, grant it ownership before making it Runnable. Exposed to
/// [`crate::condvar`], which needs to release a mutex as part of the same
/// atomic step as enqueueing onto its own wait queue.
pub(crate) fn release<P: Port>(
    mutex_cb: &'static MutexCb<P>,
    sched: &Scheduler<P>,
    task: &'static TaskCb<P>,
    lock: &mut CpuLockGuard<P>,
) {
    let prev = mutex_cb.prev_mutex_held.get(&**lock);
    task.last_mutex_held.replace(&mut **lock, prev);

    let base = task.priority(lock);
    let effective = task.recompute_ceiling_floor(lock, base);
    task.effective_priority.replace(&mut **lock, effective);

    unlock_unchecked(mutex_cb, sched, lock);
}

/// Wake the highest-priority waiter, if any, granting it ownership first.
/// Otherwise clear `owning_task`. Does not touch the releasing task's
/// effective priority or held-mutex chain; used both by [`release`] (after
/// it has already unlinked the chain) and by [`abandon_held_mutexes`].
fn unlock_unchecked<P: Port>(mutex_cb: &'static MutexCb<P>, sched: &Scheduler<P>, lock: &mut CpuLockGuard<P>) {
    if let Some(next) = mutex_cb.wait_queue.pop_first(lock) {
        grant(mutex_cb, next, lock);
        let remaining = wait::highest_priority(&mutex_cb.wait_queue, &*lock);
        mutex_cb.pi_boost.replace(&mut **lock, remaining);
        sched.unblock(lock, next, UnblockReason::Explicit);
    } else {
        mutex_cb.owning_task.replace(&mut **lock, None);
        mutex_cb.pi_boost.replace(&mut **lock, None);
    }
}

/// Abandon every mutex `task` currently holds, marking each inconsistent so
/// the next owner observes `EOWNERDEAD`. Called when a task terminates while
/// holding locks. Does not touch `task`'s own effective priority (it is
/// about to leave the ready/running state for good).
pub(crate) fn abandon_held_mutexes<P: Port>(lock: &mut CpuLockGuard<P>, sched: &Scheduler<P>, task: &'static TaskCb<P>) {
    let mut cur = task.last_mutex_held.replace(&mut **lock, None);
    while let Some(mutex_cb) = cur {
        cur = mutex_cb.prev_mutex_held.get(&**lock);
        mutex_cb.inconsistent.replace(&mut **lock, true);
        unlock_unchecked(mutex_cb, sched, lock);
    }
}
