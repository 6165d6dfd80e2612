//! Thread termination and join (§3 "Lifecycles": "reaches Terminated ... on
//! explicit exit; its storage is owned by the caller and must outlive
//! Terminated until `join()` releases it"; §4.1 state machine's
//! `exit/return -> Terminated` transition).
//!
//! `r3_kernel` has no join — its tasks run forever or exit with no one
//! watching for the result — so this is built from scratch on
//! [`crate::wait::WaitQueue`] (the same priority-ordered waiters list every
//! other primitive uses, just embedded directly in the exiting `TaskCb`
//! rather than owned by a separate control block) plus [`crate::mutex`]'s
//! existing held-mutex abandonment, reused verbatim from its robust-mutex
//! support for a task that dies mid-lock.
use crate::{
    error::WaitError,
    klock::{self, CpuLockGuard},
    mutex,
    port::Port,
    sched::Scheduler,
    task::{TaskCb, TaskState, UnblockReason},
    wait,
};

/// §4.1 explicit `exit`: abandon every mutex still held, record
/// `exit_value`, wake every current joiner, and permanently leave the ready
/// queue. Never returns.
pub fn exit<P: Port>(sched: &Scheduler<P>, mut lock: CpuLockGuard<P>, exit_value: i32) -> ! {
    let task = sched.current(&lock).expect("exit called with no current task");
    task.exit_value.replace(&mut *lock, exit_value);
    mutex::abandon_held_mutexes(&mut lock, sched, task);
    task.state.replace(&mut *lock, TaskState::Terminated);
    while let Some(joiner) = task.join_waiters.pop_first(&mut lock) {
        sched.unblock(&mut lock, joiner, UnblockReason::Explicit);
    }
    drop(lock);
    // Safety: CPU Lock is inactive here, `task` is Current. `state` is
    // Terminated rather than Running, so `switch_context` never requeues it
    // and this task's `Running` check inside `block_until_runnable` never
    // succeeds — the underlying OS/hardware thread parks here for good.
    unsafe { wait::block_until_runnable::<P>(task) };
    unreachable!("a Terminated task is never dispatched again");
}

/// §4.1 `join`: block until `task` reaches Terminated, then return its exit
/// value. Safe to call more than once, and by more than one joiner — anyone
/// already waiting when `task` exits is woken together; anyone who finds it
/// already Terminated returns immediately without blocking.
pub fn join<P: Port>(
    task: &'static TaskCb<P>,
    sched: &Scheduler<P>,
    mut lock: CpuLockGuard<P>,
) -> Result<i32, WaitError> {
    loop {
        if task.state.get(&*lock) == TaskState::Terminated {
            let value = task.exit_value.get(&*lock);
            drop(lock);
            return Ok(value);
        }
        let result = wait::wait(&task.join_waiters, sched, lock);
        lock = unsafe { klock::assume_cpu_lock::<P>() };
        result?;
    }
}
