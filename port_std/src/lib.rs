//! A host-process architecture port (§2, §6): each [`TaskCb`] maps 1:1 to a
//! real OS thread, parked on a condvar, with a single global flag playing
//! the role of the CPU's interrupt-priority mask ("CPU Lock"). This is
//! deliberately *not* a port in the style of `r3_port_std`'s user-mode
//! scheduling — no `ucontext`, no fiber/register-switching, no per-thread
//! signal masks. This kernel's threads have no machine register state of
//! their own to save and restore (there is no JIT-compiled user code, only
//! Rust closures already running on a real OS thread each), so the port's
//! job shrinks to picking which OS thread gets to run and blocking the
//! rest — exactly what a condvar hand-off already does.
//!
//! [`TaskCb`]: rros_kernel::task::TaskCb
use std::cell::Cell;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex, OnceLock};
use std::thread;
use std::time::Duration as StdDuration;

use rros_kernel::{port::Port, sched::Scheduler};

/// The host-process port. Zero-sized: its state lives in process-wide
/// statics, the same way a real port's lock state lives in a CPU register
/// rather than in any Rust value.
pub struct StdPort;

/// One task's run token: a condvar hand-off, leaked for the task's entire
/// lifetime and addressed by its own memory address. That address doubles
/// as the kernel's opaque "stack pointer" for this port (`TaskCb::sp`) —
/// this port never saves or restores a real stack, so `sp` only needs to
/// uniquely identify a task, not point at anything.
struct ParkSlot {
    go: Mutex<bool>,
    condvar: Condvar,
}

impl ParkSlot {
    fn new() -> Self {
        Self {
            go: Mutex::new(false),
            condvar: Condvar::new(),
        }
    }

    /// Block the calling OS thread until [`wake`](Self::wake) is called.
    fn park(&self) {
        let mut go = self.go.lock().unwrap();
        while !*go {
            go = self.condvar.wait(go).unwrap();
        }
        *go = false;
    }

    fn wake(&self) {
        *self.go.lock().unwrap() = true;
        self.condvar.notify_one();
    }
}

static CPU_LOCK: AtomicBool = AtomicBool::new(false);
static PENDING_SWITCH: AtomicBool = AtomicBool::new(false);
static CURRENT_SP: AtomicUsize = AtomicUsize::new(0);
static SCHED: OnceLock<&'static Scheduler<StdPort>> = OnceLock::new();

thread_local! {
    /// `true` only inside a task's own dedicated OS thread (including idle).
    /// `false` in the boot thread and the tick thread: both drive the
    /// scheduler but have no `TaskCb`/`ParkSlot` of their own to park on.
    static IS_TASK: Cell<bool> = const { Cell::new(false) };
}

/// Register the single process-wide scheduler instance this port drives.
///
/// Must be called exactly once, before `System::start`.
pub fn set_scheduler(sched: &'static Scheduler<StdPort>) {
    SCHED
        .set(sched)
        .unwrap_or_else(|_| panic!("set_scheduler called more than once"));
}

fn scheduler() -> &'static Scheduler<StdPort> {
    *SCHED.get().expect("set_scheduler was never called")
}

/// Re-enter CPU Lock (already known free) and ask the scheduler to pick the
/// next thread, then hand off: wake the chosen thread's park slot and, if
/// the calling OS thread is itself a task, park it.
///
/// Shared by [`leave_cpu_lock`](StdPort::leave_cpu_lock) (the trap "fires as
/// soon as the section is left") and the CPU-Lock-inactive branch of
/// [`request_context_switch`](StdPort::request_context_switch), where
/// nothing else is ever going to leave a section to fire it.
fn dispatch_pending() {
    log::trace!("dispatch_pending");
    // Safety: every caller reaches this with CPU Lock already inactive.
    let entered = unsafe { <StdPort as Port>::try_enter_cpu_lock() };
    debug_assert!(entered, "dispatch_pending expects CPU Lock to be free");
    let prev_sp = CURRENT_SP.load(Ordering::Acquire);
    // `switch_context` fabricates its own guard and drops it normally on
    // return, which runs `leave_cpu_lock` again and clears CPU Lock for us.
    let next_sp = scheduler().switch_context(prev_sp);
    CURRENT_SP.store(next_sp, Ordering::Release);
    if next_sp != prev_sp {
        log::debug!("switching {prev_sp:#x} -> {next_sp:#x}");
        // Safety: every live `sp` value is the address of a `Box::leak`'d
        // `ParkSlot`, handed out once by `initialize_stack` and never freed.
        let next = unsafe { &*(next_sp as *const ParkSlot) };
        next.wake();
        if IS_TASK.with(Cell::get) {
            let prev = unsafe { &*(prev_sp as *const ParkSlot) };
            prev.park();
        }
    }
}

unsafe impl Port for StdPort {
    unsafe fn initialize_stack(
        _stack: &mut [u8],
        entry: extern "C" fn(usize) -> !,
        arg: usize,
    ) -> usize {
        // The stack storage `make_static_thread!` allocated is unused here —
        // the OS thread we spawn brings its own. It still gets carved out so
        // that switching ports later doesn't change a thread's memory
        // footprint characteristics.
        let slot: &'static ParkSlot = Box::leak(Box::new(ParkSlot::new()));
        let sp = slot as *const ParkSlot as usize;
        log::trace!("initialize_stack: spawning task thread for sp={sp:#x}");
        thread::Builder::new()
            .name(format!("rros-task-{sp:#x}"))
            .spawn(move || {
                IS_TASK.with(|cell| cell.set(true));
                slot.park();
                entry(arg);
            })
            .expect("failed to spawn task thread");
        sp
    }

    unsafe fn try_enter_cpu_lock() -> bool {
        let entered = CPU_LOCK
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok();
        log::trace!("try_enter_cpu_lock -> {entered}");
        entered
    }

    unsafe fn leave_cpu_lock() {
        log::trace!("leave_cpu_lock");
        CPU_LOCK.store(false, Ordering::Release);
        if PENDING_SWITCH.swap(false, Ordering::AcqRel) {
            dispatch_pending();
        }
    }

    fn is_cpu_lock_active() -> bool {
        CPU_LOCK.load(Ordering::Acquire)
    }

    fn is_task_context() -> bool {
        IS_TASK.with(Cell::get)
    }

    fn request_context_switch() {
        log::trace!("request_context_switch");
        if CPU_LOCK.load(Ordering::Acquire) {
            // The section is still open; its eventual `leave_cpu_lock` will
            // observe this and dispatch then — "fires as soon as the
            // section is left".
            PENDING_SWITCH.store(true, Ordering::Release);
        } else {
            // Nobody is going to leave a section to fire this later (the
            // caller already left its own, e.g. `Scheduler::add` drops its
            // guard before requesting), so dispatch inline instead. Unlike a
            // real PendSV trap this can block the calling OS thread if the
            // switch picks someone else — see `dispatch_pending`.
            dispatch_pending();
        }
    }

    unsafe fn yield_cpu() {
        log::trace!("yield_cpu");
        debug_assert!(
            !CPU_LOCK.load(Ordering::Acquire),
            "yield_cpu is never called with CPU Lock active"
        );
        let entered = unsafe { Self::try_enter_cpu_lock() };
        debug_assert!(entered);
        let me = CURRENT_SP.load(Ordering::Acquire);
        let next_sp = scheduler().switch_context(me);
        CURRENT_SP.store(next_sp, Ordering::Release);
        // Safety: see `dispatch_pending`.
        let next = unsafe { &*(next_sp as *const ParkSlot) };
        next.wake();
        let mine = unsafe { &*(me as *const ParkSlot) };
        // By the time `wait::block_until_runnable` calls this, the calling
        // task's state is already Blocked, so it can never be `next` here —
        // parking unconditionally is always correct.
        mine.park();
    }

    unsafe fn dispatch_first(initial_sp: usize) -> ! {
        log::debug!("dispatch_first: sp={initial_sp:#x}");
        CURRENT_SP.store(initial_sp, Ordering::Release);
        // The freshly-dispatched context starts with interrupts enabled,
        // mirroring why `Scheduler::start` hands its guard off with
        // `core::mem::forget` rather than a normal drop.
        CPU_LOCK.store(false, Ordering::Release);
        let first = unsafe { &*(initial_sp as *const ParkSlot) };
        first.wake();
        // The boot thread's job ends here; it has no `TaskCb` of its own.
        loop {
            thread::park();
        }
    }

    fn tick_init(hz: u32) {
        log::trace!("tick_init({hz})");
        let period = StdDuration::from_secs_f64(1.0 / f64::from(hz));
        thread::Builder::new()
            .name("rros-tick".to_owned())
            .spawn(move || loop {
                thread::sleep(period);
                // Safety: mirrors a real tick ISR masking interrupts before
                // calling into the scheduler.
                let entered = unsafe { StdPort::try_enter_cpu_lock() };
                debug_assert!(entered, "tick fired while CPU Lock was already active");
                log::trace!("tick");
                scheduler().tick();
                // Safety: `tick` left CPU Lock active via its own internal
                // `core::mem::forget`; this is the matching exit, which
                // dispatches any switch `tick` requested.
                unsafe { StdPort::leave_cpu_lock() };
            })
            .expect("failed to spawn tick thread");
    }
}
