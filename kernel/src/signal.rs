//! POSIX-style realtime signals.
//!
//! `r3_kernel` has no counterpart to this subsystem (its event primitives are
//! event groups and message-passing, not per-thread asynchronous
//! notifications), so the wait/wake mechanics here are grounded on
//! [`crate::wait`] directly — a signal-wait is just another `WaitQueue<P>`
//! wait, and interrupting one is just [`crate::sched::Scheduler::unblock`]
//! with [`crate::task::UnblockReason::Interrupted`]. The one piece with no
//! real port backing yet is handler dispatch: a full implementation installs
//! a trampoline frame on the target thread's own stack so the handler runs
//! with the thread's normal register state; this kernel instead calls the
//! handler directly from [`deliver_pending`], which the port's dispatch path
//! invokes right before resuming a thread that left a blocking call. That is
//! observably equivalent for a host port backed by real OS threads
//! ([`crate::builder`]'s intended first consumer) but would need revisiting
//! for a bare-metal port that wants the handler to run in the thread's own
//! unprivileged context.
use arrayvec::ArrayVec;

use crate::{
    klock::{self, CpuLockGuard},
    port::Port,
    sched::Scheduler,
    task::{TaskCb, UnblockReason},
    time::Tick,
};

/// How many distinct signal numbers a [`SignalsCatcherCb`] can have
/// non-default actions for at once.
pub const MAX_ACTIONS: usize = 8;
/// How many queued (signal, value) pairs a [`SignalsReceiverCb`] can hold
/// at once, across all signal numbers.
pub const QUEUE_CAPACITY: usize = 8;

pub type SignalNumber = u8;
pub const MAX_SIGNAL: SignalNumber = 31;

/// A 32-bit set of signal numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SignalSet(u32);

impl SignalSet {
    pub const EMPTY: Self = Self(0);

    pub const fn single(n: SignalNumber) -> Self {
        Self(1 << n)
    }

    pub const fn contains(self, n: SignalNumber) -> bool {
        self.0 & (1 << n) != 0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub const fn intersection(self, other: Self) -> Self {
        Self(self.0 & other.0)
    }

    fn insert(&mut self, n: SignalNumber) {
        self.0 |= 1 << n;
    }

    fn remove(&mut self, n: SignalNumber) {
        self.0 &= !(1 << n);
    }

    /// The lowest-numbered pending signal, if any (an arbitrary but
    /// deterministic tie-break; the spec only requires "some n ∈ set").
    pub fn lowest(self) -> Option<SignalNumber> {
        if self.0 == 0 {
            None
        } else {
            Some(self.0.trailing_zeros() as SignalNumber)
        }
    }
}

/// What `wait`/`tryWait` returns once a pending signal is dequeued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignalInformation {
    pub signal: SignalNumber,
    /// `Some` if this instance came from `queueSignal`, `None` if it was
    /// only ever `generateSignal`d.
    pub value: Option<i32>,
}

pub type SignalHandlerFn = fn(SignalInformation);

#[derive(Clone, Copy)]
pub enum SignalAction {
    Default,
    Handler {
        handler: SignalHandlerFn,
        /// Additional signals masked for the duration of the handler.
        mask: SignalSet,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueSignalError {
    NoSpace,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetActionError {
    NoSpace,
}

/// Per-thread mask + signal-number-to-action table, backed by a fixed-
/// capacity inline vector (no heap) — the same `arrayvec::ArrayVec` the
/// teacher's priority-queue storage (`r3_kernel::utils::binary_heap::veclike`)
/// uses wherever a `Vec` would otherwise need an allocator.
pub struct SignalsCatcherCb<P: Port> {
    mask: klock::CpuLockCell<P, SignalSet>,
    actions: klock::CpuLockCell<P, ArrayVec<(SignalNumber, SignalAction), MAX_ACTIONS>>,
}

impl<P: Port> SignalsCatcherCb<P> {
    pub const fn new() -> Self {
        Self {
            mask: klock::CpuLockCell::new(SignalSet::EMPTY),
            actions: klock::CpuLockCell::new(ArrayVec::new_const()),
        }
    }

    pub fn mask(&self, lock: &CpuLockGuard<P>) -> SignalSet {
        self.mask.get(&**lock)
    }

    pub fn set_mask(&self, lock: &mut CpuLockGuard<P>, mask: SignalSet) {
        self.mask.replace(&mut **lock, mask);
    }

    pub fn action(&self, lock: &CpuLockGuard<P>, n: SignalNumber) -> SignalAction {
        self.actions
            .read(&**lock)
            .iter()
            .find(|&&(num, _)| num == n)
            .map(|&(_, action)| action)
            .unwrap_or(SignalAction::Default)
    }

    /// Install `action` for signal `n`, replacing any prior action. Setting
    /// `SignalAction::Default` frees the slot instead of occupying one.
    pub fn set_action(
        &self,
        lock: &mut CpuLockGuard<P>,
        n: SignalNumber,
        action: SignalAction,
    ) -> Result<(), SetActionError> {
        let table = self.actions.write(&mut **lock);
        let existing = table.iter().position(|&(num, _)| num == n);
        match (existing, action) {
            (Some(i), SignalAction::Default) => {
                table.remove(i);
                Ok(())
            }
            (Some(i), _) => {
                table[i] = (n, action);
                Ok(())
            }
            (None, SignalAction::Default) => Ok(()),
            (None, _) => table
                .try_push((n, action))
                .map_err(|_| SetActionError::NoSpace),
        }
    }
}

impl<P: Port> Default for SignalsCatcherCb<P> {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-thread signal state: pending-generated set, a fixed-capacity FIFO of
/// queued (signal, value) pairs, and the wait queue used by a blocking
/// `wait`/`tryWaitFor`/`tryWaitUntil`.
pub struct SignalsReceiverCb<P: Port> {
    generated: klock::CpuLockCell<P, SignalSet>,
    queued: klock::CpuLockCell<P, ArrayVec<(SignalNumber, i32), QUEUE_CAPACITY>>,
    /// The set this task is currently blocked waiting on, if any — used to
    /// tell a signal-wait wakeup (Explicit) apart from an interruption of
    /// some unrelated blocking call (Interrupted).
    waiting_set: klock::CpuLockCell<P, Option<SignalSet>>,
    wait_queue: crate::wait::WaitQueue<P>,
    pub catcher: SignalsCatcherCb<P>,
}

impl<P: Port> SignalsReceiverCb<P> {
    pub const fn new() -> Self {
        Self {
            generated: klock::CpuLockCell::new(SignalSet::EMPTY),
            queued: klock::CpuLockCell::new(ArrayVec::new_const()),
            waiting_set: klock::CpuLockCell::new(None),
            wait_queue: crate::wait::WaitQueue::new(),
            catcher: SignalsCatcherCb::new(),
        }
    }

    fn pending(&self, lock: &CpuLockGuard<P>) -> SignalSet {
        let mut set = self.generated.get(&**lock);
        for &(n, _) in self.queued.read(&**lock).iter() {
            set.insert(n);
        }
        set
    }

    /// Remove and return the first pending signal in `set`, preferring the
    /// queued form if both a generated and queued instance exist.
    fn dequeue(&self, lock: &mut CpuLockGuard<P>, set: SignalSet) -> Option<SignalInformation> {
        let queued = self.queued.write(&mut **lock);
        if let Some(i) = queued.iter().position(|&(n, _)| set.contains(n)) {
            let (n, value) = queued.remove(i);
            self.generated.write(&mut **lock).remove(n);
            return Some(SignalInformation {
                signal: n,
                value: Some(value),
            });
        }
        let generated = self.generated.write(&mut **lock);
        let n = generated.intersection(set).lowest()?;
        generated.remove(n);
        Some(SignalInformation { signal: n, value: None })
    }
}

impl<P: Port> Default for SignalsReceiverCb<P> {
    fn default() -> Self {
        Self::new()
    }
}

/// §4.4 `generateSignal`: idempotent per signal number.
pub fn generate<P: Port>(
    task: &'static TaskCb<P>,
    sched: &Scheduler<P>,
    lock: &mut CpuLockGuard<P>,
    n: SignalNumber,
) {
    let receiver = task.signals.as_ref().expect("task has no signals receiver");
    receiver.generated.write(&mut **lock).insert(n);
    wake_or_interrupt(task, receiver, sched, lock, n);
}

/// §4.4 `queueSignal`.
pub fn queue<P: Port>(
    task: &'static TaskCb<P>,
    sched: &Scheduler<P>,
    lock: &mut CpuLockGuard<P>,
    n: SignalNumber,
    value: i32,
) -> Result<(), QueueSignalError> {
    let receiver = task.signals.as_ref().expect("task has no signals receiver");
    receiver
        .queued
        .write(&mut **lock)
        .try_push((n, value))
        .map_err(|_| QueueSignalError::NoSpace)?;
    receiver.generated.write(&mut **lock).insert(n);
    wake_or_interrupt(task, receiver, sched, lock, n);
    Ok(())
}

/// A signal `n` just became pending on `task`. If `task` is specifically
/// signal-waiting on a set containing `n`, wake it normally; else, if it is
/// blocked on anything else and `n` now has a non-default, non-masked
/// action, interrupt that wait with `EINTR` (§4.4 "Interrupting blocking
/// calls").
fn wake_or_interrupt<P: Port>(
    task: &'static TaskCb<P>,
    receiver: &SignalsReceiverCb<P>,
    sched: &Scheduler<P>,
    lock: &mut CpuLockGuard<P>,
    n: SignalNumber,
) {
    if let Some(waiting) = receiver.waiting_set.get(&**lock) {
        if waiting.contains(n) {
            sched.unblock(lock, task, UnblockReason::Explicit);
            return;
        }
    }
    let masked = receiver.catcher.mask(lock).contains(n);
    let has_handler = matches!(receiver.catcher.action(lock, n), SignalAction::Handler { .. });
    if !masked && has_handler {
        sched.unblock(lock, task, UnblockReason::Interrupted);
    }
}

/// §4.4 `wait(set)`: block until some `n` in `set` is pending, then dequeue
/// and return it.
pub fn wait<P: Port>(
    task: &'static TaskCb<P>,
    sched: &Scheduler<P>,
    mut lock: CpuLockGuard<P>,
    set: SignalSet,
) -> SignalInformation {
    let receiver = task.signals.as_ref().expect("task has no signals receiver");
    loop {
        if let Some(info) = receiver.dequeue(&mut lock, set) {
            return info;
        }
        receiver.waiting_set.replace(&mut *lock, Some(set));
        // `wait::wait` leaves CPU Lock active with no live guard (it never
        // observes `Interrupted` here since nothing else unblocks a
        // signal-wait with that reason); reconstitute a guard for it rather
        // than re-entering.
        let _ = crate::wait::wait(&receiver.wait_queue, sched, lock);
        lock = unsafe { klock::assume_cpu_lock::<P>() };
        receiver.waiting_set.replace(&mut *lock, None);
    }
}

/// §4.4 `tryWait(set)`.
pub fn try_wait<P: Port>(
    task: &'static TaskCb<P>,
    lock: &mut CpuLockGuard<P>,
    set: SignalSet,
) -> Option<SignalInformation> {
    let receiver = task.signals.as_ref().expect("task has no signals receiver");
    receiver.dequeue(lock, set)
}

/// §4.4 `tryWaitFor`/`tryWaitUntil`.
pub fn wait_timeout<P: Port>(
    task: &'static TaskCb<P>,
    sched: &Scheduler<P>,
    mut lock: CpuLockGuard<P>,
    set: SignalSet,
    deadline: Tick,
) -> Result<SignalInformation, crate::error::WaitTimeoutError> {
    let receiver = task.signals.as_ref().expect("task has no signals receiver");
    loop {
        if let Some(info) = receiver.dequeue(&mut lock, set) {
            return Ok(info);
        }
        receiver.waiting_set.replace(&mut *lock, Some(set));
        let result = crate::wait::wait_timeout(&receiver.wait_queue, sched, lock, deadline);
        lock = unsafe { klock::assume_cpu_lock::<P>() };
        receiver.waiting_set.replace(&mut *lock, None);
        if let Err(e) = result {
            return Err(e);
        }
    }
}

/// Called by the port's dispatch path right before resuming a thread that
/// is returning from a blocking call (or an ISR, for the thread it
/// preempted): runs the handler for every deliverable pending signal.
///
/// A signal is deliverable when it is not masked and has a non-default
/// action; consistent with §4.4, this never touches a signal that has no
/// handler installed (those stay pending for an explicit `wait`/`tryWait`).
pub fn deliver_pending<P: Port>(task: &'static TaskCb<P>, lock: &mut CpuLockGuard<P>) {
    let Some(receiver) = task.signals.as_ref() else {
        return;
    };
    loop {
        let mask = receiver.catcher.mask(lock);
        let pending = receiver.pending(lock).intersection(SignalSet(!mask.0));
        let Some(n) = (0..=MAX_SIGNAL).find(|&n| {
            pending.contains(n) && matches!(receiver.catcher.action(lock, n), SignalAction::Handler { .. })
        }) else {
            return;
        };
        let SignalAction::Handler { handler, mask: extra_mask } = receiver.catcher.action(lock, n) else {
            unreachable!()
        };
        let info = receiver.dequeue(lock, SignalSet::single(n)).expect("just found pending");
        let saved_mask = receiver.catcher.mask(lock);
        receiver.catcher.set_mask(lock, saved_mask.union(extra_mask));
        handler(info);
        receiver.catcher.set_mask(lock, saved_mask);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;
    use std::collections::BTreeSet;

    /// A modifying operation on `SignalSet`.
    #[derive(Debug, Clone, Copy)]
    enum Cmd {
        Insert(SignalNumber),
        Remove(SignalNumber),
    }

    /// Map random bytes to operations against a set of size `MAX_SIGNAL + 1`,
    /// mirroring `r3_kernel`'s `FixedPrioBitmap` quickcheck harness.
    fn interpret(bytecode: &[u8]) -> impl Iterator<Item = Cmd> + '_ {
        let mut i = 0;
        let mut known: Vec<SignalNumber> = Vec::new();
        std::iter::from_fn(move || {
            let instr = bytecode.get(i..i + 2)?;
            i += 2;
            let n = instr[1] % (MAX_SIGNAL + 1);
            if instr[0] % 2 == 0 || known.is_empty() {
                known.push(n);
                Some(Cmd::Insert(n))
            } else {
                let idx = usize::from(instr[0]) % known.len();
                Some(Cmd::Remove(known.swap_remove(idx)))
            }
        })
    }

    #[quickcheck]
    fn matches_btreeset_reference(bytecode: Vec<u8>) {
        let mut subject = SignalSet::EMPTY;
        let mut reference: BTreeSet<SignalNumber> = BTreeSet::new();

        for cmd in interpret(&bytecode) {
            log::trace!("{cmd:?}");
            match cmd {
                Cmd::Insert(n) => {
                    subject.insert(n);
                    reference.insert(n);
                }
                Cmd::Remove(n) => {
                    subject.remove(n);
                    reference.remove(&n);
                }
            }
            assert_eq!(subject.lowest(), reference.iter().next().copied());
        }

        log::info!("final set size = {}", reference.len());
        for n in 0..=MAX_SIGNAL {
            assert_eq!(subject.contains(n), reference.contains(&n), "n={n}");
        }
    }

    #[test]
    fn set_action_frees_slot_on_default() {
        use std::sync::atomic::{AtomicBool, Ordering};

        struct TestPort;
        static LOCK: AtomicBool = AtomicBool::new(false);
        unsafe impl Port for TestPort {
            unsafe fn initialize_stack(
                _stack: &mut [u8],
                _entry: extern "C" fn(usize) -> !,
                _arg: usize,
            ) -> usize {
                0
            }
            unsafe fn try_enter_cpu_lock() -> bool {
                !LOCK.swap(true, Ordering::AcqRel)
            }
            unsafe fn leave_cpu_lock() {
                LOCK.store(false, Ordering::Release);
            }
            fn is_cpu_lock_active() -> bool {
                LOCK.load(Ordering::Acquire)
            }
            fn is_task_context() -> bool {
                false
            }
            fn request_context_switch() {}
            unsafe fn yield_cpu() {
                unreachable!("not exercised by this test")
            }
            unsafe fn dispatch_first(_initial_sp: usize) -> ! {
                unreachable!("not exercised by this test")
            }
            fn tick_init(_hz: u32) {}
        }

        fn handler(_info: SignalInformation) {}

        let mut lock = klock::lock_cpu::<TestPort>().unwrap();
        let catcher = SignalsCatcherCb::<TestPort>::new();
        for n in 0..MAX_ACTIONS as SignalNumber {
            catcher
                .set_action(&mut lock, n, SignalAction::Handler { handler, mask: SignalSet::EMPTY })
                .unwrap();
        }
        assert_eq!(
            catcher.set_action(
                &mut lock,
                MAX_ACTIONS as SignalNumber,
                SignalAction::Handler { handler, mask: SignalSet::EMPTY },
            ),
            Err(SetActionError::NoSpace)
        );
        catcher.set_action(&mut lock, 0, SignalAction::Default).unwrap();
        catcher
            .set_action(
                &mut lock,
                MAX_ACTIONS as SignalNumber,
                SignalAction::Handler { handler, mask: SignalSet::EMPTY },
            )
            .unwrap();
    }
}
