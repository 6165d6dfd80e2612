//! Kernel state locking.
//!
//! [`CpuLockCell`] is a zero-cost interior-mutability cell that can only be
//! read or written while the scheduler's critical section ("CPU Lock") is
//! active, proven at the type level via [`tokenlock`]'s singleton-token
//! trick rather than a runtime `RefCell` check. This is the same technique
//! `r3_kernel::klock` uses.
use core::ops;

use crate::{error::BadContextError, port::Port};

pub struct CpuLockTag<P>(core::marker::PhantomData<P>);

/// The key that "unlocks" a [`CpuLockCell`].
pub type CpuLockToken<P> = tokenlock::UnsyncSingletonToken<CpuLockTag<P>>;
type CpuLockKeyhole<P> = tokenlock::SingletonTokenId<CpuLockTag<P>>;

/// A cell that can only be read or written while holding a [`CpuLockToken`].
pub struct CpuLockCell<P, T: ?Sized>(tokenlock::UnsyncTokenLock<T, CpuLockKeyhole<P>>);

impl<P, T> CpuLockCell<P, T> {
    pub const fn new(x: T) -> Self {
        Self(tokenlock::UnsyncTokenLock::new(CpuLockKeyhole::<P>::new(), x))
    }
}

impl<P, T: Default> Default for CpuLockCell<P, T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<P, T> ops::Deref for CpuLockCell<P, T> {
    type Target = tokenlock::UnsyncTokenLock<T, CpuLockKeyhole<P>>;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<P, T> ops::DerefMut for CpuLockCell<P, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

// Safety: access is mediated entirely through the singleton token, which can
// only exist while the port's critical section is active.
unsafe impl<P: Send, T: Send + ?Sized> Sync for CpuLockCell<P, T> {}

/// Borrowed, re-borrowable form of [`CpuLockGuard`]. Always prefer this over
/// `&mut CpuLockGuard` in function signatures; reborrow explicitly with
/// [`borrow_mut`](tokenlock::UnsyncSingletonTokenRefMut::borrow_mut).
pub type CpuLockTokenRefMut<'a, P> = tokenlock::UnsyncSingletonTokenRefMut<'a, CpuLockTag<P>>;

/// Read-only borrowed form of [`CpuLockGuard`].
pub type CpuLockTokenRef<'a, P> = tokenlock::UnsyncSingletonTokenRef<'a, CpuLockTag<P>>;

/// RAII guard for an active critical section ("CPU Lock"). Dropping it calls
/// the port's `leave_cpu_lock`.
pub struct CpuLockGuard<P: Port> {
    token: CpuLockToken<P>,
}

impl<P: Port> CpuLockGuard<P> {
    pub fn borrow_mut(&mut self) -> CpuLockTokenRefMut<'_, P> {
        self.token.borrow_mut()
    }
}

impl<P: Port> ops::Deref for CpuLockGuard<P> {
    type Target = CpuLockToken<P>;
    fn deref(&self) -> &Self::Target {
        &self.token
    }
}

impl<P: Port> ops::DerefMut for CpuLockGuard<P> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.token
    }
}

impl<P: Port> Drop for CpuLockGuard<P> {
    fn drop(&mut self) {
        // Safety: this guard is the unique witness that CPU Lock is active.
        unsafe { P::leave_cpu_lock() };
    }
}

/// Enter the scheduler's critical section and return an RAII guard.
///
/// Fails with `BadContext` if CPU Lock is already active (re-entering from
/// kernel code is a bug).
pub fn lock_cpu<P: Port>() -> Result<CpuLockGuard<P>, BadContextError> {
    // Safety: `try_enter_cpu_lock` is only meant to be called by the kernel.
    if unsafe { P::try_enter_cpu_lock() } {
        // Safety: we just entered CPU Lock, and `try_enter_cpu_lock`
        // returning `true` means no other `CpuLockGuard` (and thus no other
        // live `CpuLockToken`) can exist right now.
        let token = unsafe { CpuLockToken::new_unchecked() };
        Ok(CpuLockGuard { token })
    } else {
        Err(BadContextError)
    }
}

/// Assume CPU Lock is active and fabricate a guard for it.
///
/// # Safety
///
/// The caller must guarantee CPU Lock is really active and that no other
/// `CpuLockGuard` for this port currently exists.
pub unsafe fn assume_cpu_lock<P: Port>() -> CpuLockGuard<P> {
    debug_assert!(P::is_cpu_lock_active());
    CpuLockGuard {
        token: unsafe { CpuLockToken::new_unchecked() },
    }
}
