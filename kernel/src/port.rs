//! The architecture port contract.
//!
//! Everything the scheduler needs from a concrete CPU port is collected in
//! [`Port`]. A port crate (for example a host-process port used by tests, or
//! a real ARMv7-M port) implements this trait once and the rest of the
//! kernel is generic over it, the same way [`r3_kernel`] is generic over its
//! `PortThreading` trait.
//!
//! [`r3_kernel`]: https://github.com/r3-os/r3

/// What the kernel requires from a CPU port.
///
/// # Safety
///
/// Implementors must uphold the contract described on each method. Getting
/// any of this wrong breaks the single-owner assumptions the rest of the
/// kernel relies on (see [`crate::klock`]).
pub unsafe trait Port: Sized + Send + Sync + 'static {
    /// Build the initial CPU frame inside `stack` so that, when the
    /// scheduler first dispatches this stack pointer, execution resumes at
    /// `entry(arg)`. `entry`'s `-> !` return type is the contract that
    /// replaces a real port's exit trampoline: the only way out is an
    /// explicit [`crate::exit::exit`] call, so there is no return address to
    /// install. Returns the initial stack pointer to record in the TCB.
    ///
    /// # Safety
    ///
    /// `stack` must be a region of memory exclusively owned by the thread
    /// for as long as the thread is not Terminated.
    unsafe fn initialize_stack(
        stack: &mut [u8],
        entry: extern "C" fn(usize) -> !,
        arg: usize,
    ) -> usize;

    /// Attempt to enter the scheduler's critical section ("CPU Lock").
    /// Returns `false` (without raising the interrupt priority mask again)
    /// if CPU Lock is already active, so that [`crate::klock::lock_cpu`] can
    /// reject re-entrance.
    ///
    /// # Safety
    ///
    /// Must only be called by [`crate::klock`].
    unsafe fn try_enter_cpu_lock() -> bool;

    /// Leave the scheduler's critical section, restoring the interrupt
    /// priority mask observed before the matching `try_enter_cpu_lock` call.
    ///
    /// # Safety
    ///
    /// Must only be called by [`crate::klock`] while CPU Lock is active.
    unsafe fn leave_cpu_lock();

    /// Returns `true` if the scheduler's critical section is currently
    /// active (on this CPU).
    fn is_cpu_lock_active() -> bool;

    /// Returns `true` if the caller is running in thread context (as opposed
    /// to an ISR or before the scheduler has started).
    fn is_task_context() -> bool;

    /// Pend the context-switch trap ("PendSV-equivalent"). Must be callable
    /// from both thread and ISR context, and from inside a critical section
    /// (in which case the trap fires as soon as the section is left). Unlike
    /// [`Port::yield_cpu`], this never blocks the caller — it is the only
    /// context-switch primitive ISRs may use.
    fn request_context_switch();

    /// Synchronously perform a context switch: pend the trap and block the
    /// calling thread until the scheduler dispatches it again. Used by
    /// [`crate::wait`]'s generic blocking loop; never called with CPU Lock
    /// active and never called from an ISR.
    ///
    /// # Safety
    ///
    /// Must only be called by [`crate::wait`].
    unsafe fn yield_cpu();

    /// Enter the idle/first-dispatch loop, transferring control to the
    /// stack pointer the scheduler has already chosen as Current. Never
    /// returns.
    ///
    /// # Safety
    ///
    /// Must only be called once, by [`crate::sched::Scheduler::start`].
    unsafe fn dispatch_first(initial_sp: usize) -> !;

    /// Initialize the tick source to fire at `hz` Hz and call
    /// [`crate::sched::Scheduler::tick`] from its ISR.
    fn tick_init(hz: u32);
}
