//! Static object construction (§6, §9A).
//!
//! §9A drops the teacher's `CfgBuilder`/`build!` static-configuration macro
//! system (it exists to assemble a whole `KernelTraits` type from a
//! configuration function — event groups, interrupt lines and multi-board
//! examples this spec has no use for) in favor of §6's `makeStaticThread`:
//! objects are created directly as `'static` values, no macro DSL involved.
//! A [`MutexCb`], [`SemaphoreCb`], [`CondvarCb`] or [`QueueCb`]/[`TimerCb`]
//! needs nothing beyond its own `const fn new`, so those are just ordinary
//! `static` items:
//!
//! ```ignore
//! static LOCK: MutexCb<MyPort> =
//!     MutexCb::new(MutexProtocol::PriorityInheritance, RecursionMode::Normal);
//! ```
//!
//! A thread is the one object that can't be a plain `const`-initialized
//! `static`: [`TaskCb::new`] needs a `&'static mut [u8]` stack slice, and a
//! mutable reference baked into a `static`'s initial value is exactly the
//! hazard `r3_kernel`'s own stack-hunk machinery exists to avoid. So
//! [`make_static_thread`] pairs each thread with a private [`StaticCell`] —
//! the same "`UnsafeCell` wrapper, `Sync` asserted by the caller's exclusivity
//! contract" technique [`crate::task::TaskCb`] already uses for its own
//! `stack` field — and builds the `TaskCb` at runtime, once, the first time
//! system init runs.
use core::{
    cell::UnsafeCell,
    mem::MaybeUninit,
    sync::atomic::{AtomicBool, Ordering},
};

use crate::{klock, port::Port, sched::Scheduler, task::TaskCb};

/// Tick rate the scheduler's timer wheel and RR quantum accounting run at
/// (§6 `tick_init(hz)`).
pub const TICK_HZ: u32 = 1000;

/// The single process-wide kernel instance (§9 "Global kernel state
/// (`schedulerInstance`): keep a single process-wide scheduler object
/// constructed before `main`-equivalent; all APIs route through it").
pub struct System<P: Port> {
    pub sched: Scheduler<P>,
}

impl<P: Port> System<P> {
    /// # Safety
    ///
    /// `idle` must be a `TaskCb` dedicated to this system: priority
    /// [`crate::IDLE_PRIORITY`], never blocked, never joined — see
    /// [`Scheduler::new`].
    pub const unsafe fn new(idle: &'static TaskCb<P>) -> Self {
        Self {
            sched: Scheduler::new(idle),
        }
    }

    /// Start the scheduler. Never returns.
    ///
    /// # Safety
    ///
    /// Must be called exactly once, from boot context, before any interrupt
    /// that could call into the kernel is unmasked.
    pub unsafe fn start(&'static self) -> ! {
        unsafe { self.sched.start() }
    }
}

/// A cell that hands out a `&'static mut T` exactly once, by writing `value`
/// into storage embedded in the cell itself. Panics on a second [`init`]
/// call against the same cell.
///
/// [`init`]: StaticCell::init
pub struct StaticCell<T> {
    slot: UnsafeCell<MaybeUninit<T>>,
    taken: AtomicBool,
}

// Safety: `slot` is only ever written by `init`, which enforces (via `taken`)
// that it runs at most once per cell, so the `&'static mut T` it hands out is
// never aliased.
unsafe impl<T> Sync for StaticCell<T> {}

impl<T> StaticCell<T> {
    pub const fn new() -> Self {
        Self {
            slot: UnsafeCell::new(MaybeUninit::uninit()),
            taken: AtomicBool::new(false),
        }
    }

    pub fn init(&'static self, value: T) -> &'static mut T {
        if self.taken.swap(true, Ordering::AcqRel) {
            panic!("StaticCell already initialized");
        }
        // Safety: `taken` just transitioned false -> true, so no other
        // reference to `slot`'s contents exists or ever will.
        unsafe { (*self.slot.get()).write(value) }
    }
}

impl<T> Default for StaticCell<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Byte storage for one thread's stack, sized by the caller (§6
/// `makeStaticThread<stackSize, ...>`). Only meant to be used through
/// [`make_static_thread`], which upholds the exclusive-ownership contract
/// [`TaskCb::new`] requires of the slice it's given.
pub type StackStorage<const N: usize> = StaticCell<[u8; N]>;

/// §6 `makeStaticThread<stackSize, canReceiveSignals, queuedSignalsCapacity,
/// signalActionsCapacity>(priority, policy, entry, args...)`: build a
/// `'static` thread with its stack and control block embedded, no heap
/// allocation anywhere in the expansion. (The queued-signal and
/// signal-action table capacities are the crate-wide constants
/// [`crate::signal::QUEUE_CAPACITY`]/[`crate::signal::MAX_ACTIONS`] rather
/// than per-thread const generics — every thread's signal tables are the
/// same fixed size.)
///
/// Evaluates to a `&'static TaskCb<$port>`. Must run at most once per call
/// site (typically from a system-init function called once at boot); a
/// second call panics via [`StaticCell::init`].
///
/// ```ignore
/// let worker: &'static TaskCb<MyPort> = make_static_thread!(
///     port: MyPort,
///     stack_size: 4096,
///     priority: 5,
///     policy: SchedPolicy::Fifo,
///     entry: worker_main,
///     arg: 0,
/// );
/// ```
///
/// Add a trailing `, signals: true` to give the thread a
/// [`crate::signal::SignalsReceiverCb`] (§6 `canReceiveSignals`); without
/// it, any `wait`/`generateSignal`/`queueSignal` call against this thread
/// panics (see `crate::signal`'s `task.signals.as_ref().expect(...)`).
#[macro_export]
macro_rules! make_static_thread {
    (
        port: $port:ty,
        stack_size: $stack_size:expr,
        priority: $priority:expr,
        policy: $policy:expr,
        entry: $entry:expr,
        arg: $arg:expr,
        signals: true $(,)?
    ) => {{
        static STACK: $crate::builder::StackStorage<{ $stack_size }> =
            $crate::builder::StackStorage::new();
        static TASK: $crate::builder::StaticCell<$crate::task::TaskCb<$port>> =
            $crate::builder::StaticCell::new();
        let stack: &'static mut [u8] = STACK.init([0u8; { $stack_size }]);
        let signals = ::core::option::Option::Some($crate::signal::SignalsReceiverCb::new());
        // Safety: `stack` came from this call site's own `STACK` cell, which
        // `StaticCell::init` guarantees is handed out at most once.
        TASK.init(unsafe {
            $crate::task::TaskCb::new(stack, $entry, $arg, $priority, $policy, signals)
        })
    }};
    (
        port: $port:ty,
        stack_size: $stack_size:expr,
        priority: $priority:expr,
        policy: $policy:expr,
        entry: $entry:expr,
        arg: $arg:expr $(,)?
    ) => {{
        static STACK: $crate::builder::StackStorage<{ $stack_size }> =
            $crate::builder::StackStorage::new();
        static TASK: $crate::builder::StaticCell<$crate::task::TaskCb<$port>> =
            $crate::builder::StaticCell::new();
        let stack: &'static mut [u8] = STACK.init([0u8; { $stack_size }]);
        // Safety: see above.
        TASK.init(unsafe {
            $crate::task::TaskCb::new(stack, $entry, $arg, $priority, $policy, ::core::option::Option::None)
        })
    }};
}

/// Entry point for the dedicated software-timer thread §4.3 requires
/// ("callbacks run in a dedicated software-timer thread ... not in ISR
/// context"). Build this thread with [`make_static_thread`], passing
/// `run_timer_thread::<P>` as `entry` and `system as *const System<P> as
/// usize` as `arg`, where `system: &'static System<P>`.
pub extern "C" fn run_timer_thread<P: Port>(arg: usize) -> ! {
    // Safety: the caller passes `arg` as a `&'static System<P>` address, per
    // this function's contract as a thread entry point.
    let system = unsafe { &*(arg as *const System<P>) };
    let lock = klock::lock_cpu::<P>().unwrap_or_else(|_| {
        panic!("run_timer_thread started with CPU Lock already active")
    });
    let timers: &'static crate::timer::TimerList<P> = &system.sched.timers;
    timers.run_due(&system.sched, lock)
}
