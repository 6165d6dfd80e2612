//! The scheduler: ready queue, dispatch, and the block/unblock API every
//! synchronization primitive is built on.
//!
//! Ready selection is the bitmap-plus-per-priority-bucket technique
//! `r3_kernel::task::readyqueue::BitmapQueue` uses, specialized to the one
//! instantiation this kernel needs instead of being generic over the bitmap
//! width and task-ready-queue data layout.
use crate::{
    error::BadContextError,
    klock::{self, CpuLockGuard},
    port::Port,
    signal,
    task::{SchedPolicy, TaskCb, TaskState, UnblockReason},
    time::Tick,
    utils::prio_bitmap::PrioBitmap256,
    Priority,
};

/// One process-wide scheduler instance, per the design note in §9 ("Global
/// kernel state ... keep a single process-wide scheduler object").
pub struct Scheduler<P: Port> {
    ready_head: [klock::CpuLockCell<P, Option<&'static TaskCb<P>>>; crate::NUM_PRIORITY_LEVELS],
    ready_tail: [klock::CpuLockCell<P, Option<&'static TaskCb<P>>>; crate::NUM_PRIORITY_LEVELS],
    bitmap: klock::CpuLockCell<P, PrioBitmap256>,
    current: klock::CpuLockCell<P, Option<&'static TaskCb<P>>>,
    tick: klock::CpuLockCell<P, Tick>,
    started: klock::CpuLockCell<P, bool>,
    idle: &'static TaskCb<P>,
    pub(crate) timeouts: crate::timeout::TimeoutList<P>,
    pub(crate) timers: crate::timer::TimerList<P>,
}

impl<P: Port> Scheduler<P> {
    /// # Safety
    ///
    /// `idle` must be a `TaskCb` dedicated to this scheduler, created at
    /// priority [`crate::IDLE_PRIORITY`], never blocked, never joined.
    pub const fn new(idle: &'static TaskCb<P>) -> Self {
        Self {
            ready_head: Self::init_ready(),
            ready_tail: Self::init_ready(),
            bitmap: klock::CpuLockCell::new(PrioBitmap256::new()),
            current: klock::CpuLockCell::new(None),
            tick: klock::CpuLockCell::new(Tick::ZERO),
            started: klock::CpuLockCell::new(false),
            idle,
            timeouts: crate::timeout::TimeoutList::new(),
            timers: crate::timer::TimerList::new(),
        }
    }

    const fn init_ready(
    ) -> [klock::CpuLockCell<P, Option<&'static TaskCb<P>>>; crate::NUM_PRIORITY_LEVELS] {
        [const { klock::CpuLockCell::new(None) }; crate::NUM_PRIORITY_LEVELS]
    }

    pub fn current(&self, lock: &CpuLockGuard<P>) -> Option<&'static TaskCb<P>> {
        self.current.get(&**lock)
    }

    pub fn now(&self, lock: &CpuLockGuard<P>) -> Tick {
        self.tick.get(&**lock)
    }

    /// Insert `task` at the tail of its priority level's ready bucket and
    /// mark it Runnable.
    ///
    /// # Safety
    ///
    /// `task` must not already be linked into the ready queue or any
    /// waiters list.
    pub unsafe fn make_ready(&self, lock: &mut CpuLockGuard<P>, task: &'static TaskCb<P>) {
        task.state.replace(&mut **lock, TaskState::Runnable);
        task.reset_quantum(lock);
        let pri = task.effective_priority.get(&**lock);
        self.push_back(lock, pri, task);
    }

    fn push_back(&self, lock: &mut CpuLockGuard<P>, pri: Priority, task: &'static TaskCb<P>) {
        let tail = self.ready_tail[pri as usize].get(&**lock);
        {
            let link = task.link.write(&mut **lock);
            link.prev = tail;
            link.next = None;
        }
        match tail {
            Some(tail) => tail.link.write(&mut **lock).next = Some(task),
            None => {
                self.ready_head[pri as usize].replace(&mut **lock, Some(task));
            }
        }
        self.ready_tail[pri as usize].replace(&mut **lock, Some(task));
        self.bitmap.write(&mut **lock).set(pri);
    }

    fn remove(&self, lock: &mut CpuLockGuard<P>, pri: Priority, task: &'static TaskCb<P>) {
        let (prev, next) = {
            let link = task.link.read(&**lock);
            (link.prev, link.next)
        };
        match prev {
            Some(prev) => prev.link.write(&mut **lock).next = next,
            None => {
                self.ready_head[pri as usize].replace(&mut **lock, next);
            }
        }
        match next {
            Some(next) => next.link.write(&mut **lock).prev = prev,
            None => {
                self.ready_tail[pri as usize].replace(&mut **lock, prev);
            }
        }
        if self.ready_head[pri as usize].get(&**lock).is_none() {
            self.bitmap.write(&mut **lock).clear(pri);
        }
        let link = task.link.write(&mut **lock);
        link.prev = None;
        link.next = None;
    }

    fn pop_front(&self, lock: &mut CpuLockGuard<P>, pri: Priority) -> Option<&'static TaskCb<P>> {
        let task = self.ready_head[pri as usize].get(&**lock)?;
        self.remove(lock, pri, task);
        Some(task)
    }

    fn highest_ready(&self, lock: &CpuLockGuard<P>) -> Option<Priority> {
        self.bitmap.get(&**lock).highest_set()
    }

    /// Move `task` from the ready-queue bucket matching `old_pri` to the one
    /// matching its current effective priority. A no-op if `task` isn't
    /// actually sitting in the ready queue right now (Running and Blocked
    /// tasks have no bucket to fix up — `switch_context` and the relevant
    /// [`crate::wait::WaitQueue`] already read the fresh effective priority
    /// whenever either of those actually matters).
    ///
    /// Needed because [`crate::mutex::propagate_inheritance`] can boost a
    /// mutex owner's effective priority while that owner is merely Runnable
    /// (preempted while still holding the mutex, not blocked on anything) —
    /// without this, the boost would never affect dispatch order until the
    /// owner happened to be requeued for some unrelated reason.
    pub(crate) fn reorder_ready(
        &self,
        lock: &mut CpuLockGuard<P>,
        task: &'static TaskCb<P>,
        old_pri: Priority,
    ) {
        if task.state.get(&**lock) != TaskState::Runnable {
            return;
        }
        let new_pri = task.effective_priority.get(&**lock);
        if new_pri == old_pri {
            return;
        }
        self.remove(lock, old_pri, task);
        self.push_back(lock, new_pri, task);
    }

    /// Start the scheduler: from boot context, with no thread Current yet.
    /// Never returns.
    ///
    /// # Safety
    ///
    /// Must be called exactly once.
    pub unsafe fn start(&'static self) -> ! {
        let mut lock = klock::lock_cpu::<P>().unwrap_or_else(|BadContextError| {
            panic!("Scheduler::start called while CPU Lock active")
        });
        self.started.replace(&mut *lock, true);
        unsafe { self.make_ready(&mut lock, self.idle) };
        let top = self.highest_ready(&lock).expect("idle task always ready");
        let next = self.pop_front(&mut lock, top).unwrap();
        next.state.replace(&mut *lock, TaskState::Running);
        let sp = unsafe { next.initial_sp() };
        next.sp.replace(&mut *lock, sp);
        self.current.replace(&mut *lock, Some(next));
        signal::deliver_pending(next, &mut lock);
        P::tick_init(crate::builder::TICK_HZ);
        core::mem::forget(lock);
        unsafe { P::dispatch_first(sp) }
    }

    /// Insert a newly-activated or woken thread into the ready queue and
    /// request a context switch if it outranks Current (§4.1 `add`).
    ///
    /// # Safety
    ///
    /// `task` must be in the Created or Blocked state and unlinked.
    pub unsafe fn add(&self, mut lock: CpuLockGuard<P>, task: &'static TaskCb<P>) {
        unsafe { self.make_ready(&mut lock, task) };
        self.request_switch_if_needed(lock);
    }

    /// §4.1 thread `start()`: the first transition out of Created. Computes
    /// the thread's initial stack pointer (never done before, since a
    /// Created thread has never been dispatched) and inserts it via `add`.
    ///
    /// # Safety
    ///
    /// `task` must currently be in the Created state and unlinked.
    pub unsafe fn activate(&self, mut lock: CpuLockGuard<P>, task: &'static TaskCb<P>) {
        let sp = unsafe { task.initial_sp() };
        task.sp.replace(&mut *lock, sp);
        unsafe { self.add(lock, task) };
    }

    /// Called from the context-switch trap to pick the next thread to run.
    /// Moves the outgoing Current back to Ready if it's still Runnable, and
    /// runs any signal handlers pending on the thread being resumed (§4.4:
    /// handlers run "right before resuming a thread").
    pub fn switch_context(&self, current_sp: usize) -> usize {
        let mut lock = unsafe { klock::assume_cpu_lock::<P>() };
        if let Some(prev) = self.current.get(&*lock) {
            prev.sp.replace(&mut *lock, current_sp);
            if let TaskState::Running = prev.state.get(&*lock) {
                prev.state.replace(&mut *lock, TaskState::Runnable);
                let pri = prev.effective_priority.get(&*lock);
                self.push_back(&mut lock, pri, prev);
            }
        }
        let top = self.highest_ready(&lock).expect("idle task always ready");
        let next = self.pop_front(&mut lock, top).unwrap();
        next.state.replace(&mut *lock, TaskState::Running);
        self.current.replace(&mut *lock, Some(next));
        signal::deliver_pending(next, &mut lock);
        next.sp.get(&*lock)
    }

    /// Transition Current to Blocked and, if given, arm a timeout. The
    /// caller (the primitive's waiters list) has already linked `current`
    /// into its list before calling this. Returns the guard so the caller
    /// ([`crate::wait`]'s generic blocking loop) can release CPU Lock and
    /// synchronously yield.
    pub(crate) fn block_current(
        &self,
        mut lock: CpuLockGuard<P>,
        deadline: Option<Tick>,
    ) -> (CpuLockGuard<P>, &'static TaskCb<P>) {
        let current = self.current.get(&*lock).expect("no current task");
        current.state.replace(&mut *lock, TaskState::Blocked);
        current.unblock_reason.replace(&mut *lock, None);
        if let Some(deadline) = deadline {
            self.timeouts.arm(&mut lock, current, deadline);
        }
        (lock, current)
    }

    /// Move `task` back to Ready, recording `reason` if no reason has been
    /// recorded yet for this wait (§5, single-writer unblock reason), and
    /// requesting a context switch if it outranks Current (§4.1 `unblock`).
    ///
    /// `task.link` is shared between every primitive's `WaitQueue` and the
    /// ready queue `make_ready` below splices `task` into, so `task` must be
    /// off whatever waiters list it's on before `make_ready` repurposes that
    /// field — this checks `task.blocked_on` (§3, "the TCB's 'blocked-on'
    /// pointer references P") and unlinks through it itself before doing so.
    /// An explicit wakeup's caller (a mutex granting ownership, a semaphore
    /// handing off a token, …) has always already popped `task` off that
    /// list itself via `WaitQueue::pop_first`, which clears `blocked_on` too
    /// — so this is a no-op for that path and only does real work for a
    /// timeout or signal interruption, neither of which unlinks `task` from
    /// its actual waiters list before reaching here.
    pub fn unblock(&self, lock: &mut CpuLockGuard<P>, task: &'static TaskCb<P>, reason: UnblockReason) {
        if task.state.get(&**lock) != TaskState::Blocked {
            return;
        }
        if task.unblock_reason.get(&**lock).is_some() {
            return;
        }
        task.unblock_reason.replace(&mut **lock, Some(reason));
        self.timeouts.cancel(lock, task);
        if let Some(queue) = task.blocked_on.get(&**lock) {
            queue.unlink(lock, task);
        }
        unsafe { self.make_ready(lock, task) };
        if self.should_preempt(lock) {
            P::request_context_switch();
        }
    }

    /// §4.1 `yield`: rotate Current to the tail of its priority level if a
    /// peer of equal priority exists.
    pub fn yield_now(&self, lock: CpuLockGuard<P>) {
        self.request_switch_if_needed(lock);
    }

    /// Whether the highest-priority Runnable thread outranks Current, i.e.
    /// whether a context switch should be requested right now.
    ///
    /// Always `false` before [`Scheduler::start`] has run: nothing has been
    /// dispatched yet, so there is no live context for a switch to preempt,
    /// and the boot thread building and activating threads must be free to
    /// keep running until it hands off via `start`.
    fn should_preempt(&self, lock: &CpuLockGuard<P>) -> bool {
        if !self.started.get(&**lock) {
            return false;
        }
        let current_pri = self
            .current
            .get(&**lock)
            .map(|t| t.effective_priority.get(&**lock))
            .unwrap_or(0);
        self.highest_ready(lock).map(|top| top >= current_pri).unwrap_or(false)
    }

    fn request_switch_if_needed(&self, lock: CpuLockGuard<P>) {
        let preempt = self.should_preempt(&lock);
        drop(lock);
        if preempt {
            P::request_context_switch();
        }
    }

    /// §4.1 `tick`: advance the clock, drive the timer wheel and timeouts,
    /// and account RR quantum.
    pub fn tick(&self) {
        let mut lock = unsafe { klock::assume_cpu_lock::<P>() };
        let now = self.tick.get(&*lock).wrapping_add(crate::Duration::from_ticks(1));
        self.tick.replace(&mut *lock, now);
        self.timeouts.advance(&mut lock, self, now);
        self.timers.advance(&mut lock, self, now);

        let mut request_yield = false;
        if let Some(current) = self.current.get(&*lock) {
            if let SchedPolicy::RoundRobin { .. } = current.policy {
                let remaining = current.remaining_quantum.get(&*lock);
                if remaining <= 1 {
                    current.reset_quantum(&mut lock);
                    request_yield = true;
                } else {
                    current.remaining_quantum.replace(&mut *lock, remaining - 1);
                }
            }
        }
        core::mem::forget(lock);
        if request_yield {
            P::request_context_switch();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
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

    /// A `Port` whose CPU Lock is a plain flag and whose context-switch
    /// requests just count, used to exercise `Scheduler`'s pure ready-queue
    /// and preemption-decision logic without ever actually dispatching
    /// anything. Each test defines its own local type so the `tokenlock`
    /// singleton tag (and the flag/counter statics below) are never shared
    /// across tests running concurrently.
    macro_rules! test_port {
        ($name:ident, $lock:ident, $switches:ident) => {
            struct $name;
            static $lock: AtomicBool = AtomicBool::new(false);
            static $switches: AtomicUsize = AtomicUsize::new(0);
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
                    $switches.fetch_add(1, Ordering::SeqCst);
                }
                unsafe fn yield_cpu() {
                    unreachable!("not exercised by these tests")
                }
                unsafe fn dispatch_first(_initial_sp: usize) -> ! {
                    unreachable!("not exercised by these tests")
                }
                fn tick_init(_hz: u32) {}
            }
        };
    }

    #[test]
    fn ready_queue_orders_by_priority_then_fifo() {
        test_port!(TestPort, CPU_LOCK, SWITCHES);

        let idle = leak_task::<TestPort>(crate::IDLE_PRIORITY);
        let sched: &'static Scheduler<TestPort> = Box::leak(Box::new(Scheduler::new(idle)));

        let a = leak_task::<TestPort>(5);
        let b = leak_task::<TestPort>(5);
        let c = leak_task::<TestPort>(10);

        for task in [a, b, c] {
            let lock = klock::lock_cpu::<TestPort>().unwrap();
            unsafe { sched.activate(lock, task) };
        }

        let mut lock = klock::lock_cpu::<TestPort>().unwrap();
        assert_eq!(sched.highest_ready(&lock), Some(10));
        let first = sched.pop_front(&mut lock, 10).unwrap();
        assert!(core::ptr::eq(first, c));

        assert_eq!(sched.highest_ready(&lock), Some(5));
        let second = sched.pop_front(&mut lock, 5).unwrap();
        assert!(core::ptr::eq(second, a), "equal-priority ties break FIFO");
        let third = sched.pop_front(&mut lock, 5).unwrap();
        assert!(core::ptr::eq(third, b));

        assert_eq!(sched.highest_ready(&lock), None);
        drop(lock);
    }

    #[test]
    fn preemption_is_suppressed_before_scheduler_starts() {
        test_port!(TestPort, CPU_LOCK, SWITCHES);

        let idle = leak_task::<TestPort>(crate::IDLE_PRIORITY);
        let sched: &'static Scheduler<TestPort> = Box::leak(Box::new(Scheduler::new(idle)));
        let high = leak_task::<TestPort>(200);

        let lock = klock::lock_cpu::<TestPort>().unwrap();
        unsafe { sched.activate(lock, high) };

        assert_eq!(
            SWITCHES.load(Ordering::SeqCst),
            0,
            "boot-time activation must not request a switch with nothing dispatched yet"
        );
    }

    #[test]
    fn round_robin_quantum_requests_switch_at_expiry() {
        test_port!(TestPort, CPU_LOCK, SWITCHES);

        let idle = leak_task::<TestPort>(crate::IDLE_PRIORITY);
        let sched: &'static Scheduler<TestPort> = Box::leak(Box::new(Scheduler::new(idle)));

        let rr_task: &'static TaskCb<TestPort> = Box::leak(Box::new(unsafe {
            TaskCb::new(
                leak_stack(),
                noop_entry,
                0,
                5,
                SchedPolicy::RoundRobin {
                    quantum: crate::Duration::from_ticks(3),
                },
                None,
            )
        }));

        // Simulate the post-`start()` world (white-box: this test lives in
        // `sched`'s own module tree, so `started`/`current` are reachable)
        // without actually diverging into `Port::dispatch_first`.
        let mut lock = klock::lock_cpu::<TestPort>().unwrap();
        sched.started.replace(&mut *lock, true);
        drop(lock);

        let lock = klock::lock_cpu::<TestPort>().unwrap();
        unsafe { sched.activate(lock, rr_task) };
        assert_eq!(
            SWITCHES.load(Ordering::SeqCst),
            1,
            "activating a thread above idle after start() must request a switch"
        );

        // Simulate dispatch picking `rr_task` up as Current.
        let mut lock = klock::lock_cpu::<TestPort>().unwrap();
        let task = sched.pop_front(&mut lock, 5).unwrap();
        assert!(core::ptr::eq(task, rr_task));
        task.state.replace(&mut *lock, TaskState::Running);
        sched.current.replace(&mut *lock, Some(task));
        drop(lock);

        SWITCHES.store(0, Ordering::SeqCst);
        sched.tick();
        assert_eq!(SWITCHES.load(Ordering::SeqCst), 0, "quantum=3: tick 1 of 3");
        sched.tick();
        assert_eq!(SWITCHES.load(Ordering::SeqCst), 0, "quantum=3: tick 2 of 3");
        sched.tick();
        assert_eq!(
            SWITCHES.load(Ordering::SeqCst),
            1,
            "quantum expiry on the 3rd tick must request a switch"
        );
    }
}
