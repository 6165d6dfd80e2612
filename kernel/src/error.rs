//! Error codes.
//!
//! The kernel surfaces a small set of POSIX-style error codes (§6, §7 of the
//! specification). Individual operations only accept a subset of these —
//! `tryLock` can return `EBUSY` but never `ETIMEDOUT`, for instance — so,
//! following `r3_kernel::error`'s `define_suberror!` pattern, each operation
//! gets its own narrow `#[repr(i8)]` enum that converts into [`ErrorCode`]
//! via `From`.
use core::fmt;

/// The umbrella error code returned (in narrowed form) by every fallible
/// kernel operation.
#[repr(i8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// `EAGAIN` — a non-blocking operation could not proceed right now, or a
    /// fixed-capacity queue is full.
    Again = 1,
    /// `EBUSY` — `tryLock`/`tryWait` found the resource unavailable.
    Busy,
    /// `EDEADLK` — the calling thread already owns the mutex (and the mutex
    /// does not permit recursion).
    Deadlock,
    /// `EINTR` — a blocking call was interrupted by signal delivery.
    Interrupted,
    /// `EINVAL` — an out-of-range argument, or an incompatible mutex
    /// configuration (`base priority > ceiling`).
    InvalidArgument,
    /// `ENOSPC` — a fixed-size storage region (signal action table, queued
    /// signal list) is exhausted.
    NoSpace,
    /// `EOVERFLOW` — a semaphore or queue hit its configured maximum.
    Overflow,
    /// `EOWNERDEAD` — the mutex was abandoned by a thread that exited while
    /// holding it.
    OwnerDead,
    /// `EPERM` — `unlock` called by a thread that does not own the mutex.
    NotOwner,
    /// `ETIMEDOUT` — a timed operation's deadline expired first.
    TimedOut,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Again => "EAGAIN",
            Self::Busy => "EBUSY",
            Self::Deadlock => "EDEADLK",
            Self::Interrupted => "EINTR",
            Self::InvalidArgument => "EINVAL",
            Self::NoSpace => "ENOSPC",
            Self::Overflow => "EOVERFLOW",
            Self::OwnerDead => "EOWNERDEAD",
            Self::NotOwner => "EPERM",
            Self::TimedOut => "ETIMEDOUT",
        };
        f.write_str(s)
    }
}

/// Defines a narrow, `#[repr(i8)]` sub-error enum sharing discriminants with
/// [`ErrorCode`], plus `From` impls converting it (and any further
/// supertypes named in `#[into(...)]`) up to [`ErrorCode`].
macro_rules! define_suberror {
    (
        $vis:vis enum $Name:ident { $( $Variant:ident ),* $(,)? }
    ) => {
        #[repr(i8)]
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        $vis enum $Name {
            $( $Variant = $crate::error::ErrorCode::$Variant as i8 ),*
        }

        impl From<$Name> for $crate::error::ErrorCode {
            #[inline]
            fn from(x: $Name) -> Self {
                match x {
                    $( $Name::$Variant => Self::$Variant ),*
                }
            }
        }
    };
}

/// The context the caller is running in does not permit this operation
/// (e.g. a blocking call from ISR context, or a kernel API called before
/// `Scheduler::start`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BadContextError;

impl From<BadContextError> for ErrorCode {
    #[inline]
    fn from(_: BadContextError) -> Self {
        // The spec's error taxonomy has no dedicated "bad context" code;
        // treat it as an argument/precondition violation.
        Self::InvalidArgument
    }
}

define_suberror! {
    pub enum LockMutexPrecheckError {
        Deadlock,
        InvalidArgument,
    }
}

define_suberror! {
    pub enum LockMutexError { Deadlock, InvalidArgument, OwnerDead }
}

define_suberror! {
    pub enum TryLockMutexError { Deadlock, InvalidArgument, Busy, OwnerDead }
}

define_suberror! {
    pub enum LockMutexTimeoutError { Deadlock, InvalidArgument, TimedOut, OwnerDead }
}

define_suberror! {
    pub enum UnlockMutexError { NotOwner }
}

macro_rules! widen_precheck_error {
    ($($Target:ident),* $(,)?) => {
        $(
            impl From<LockMutexPrecheckError> for $Target {
                #[inline]
                fn from(e: LockMutexPrecheckError) -> Self {
                    match e {
                        LockMutexPrecheckError::Deadlock => Self::Deadlock,
                        LockMutexPrecheckError::InvalidArgument => Self::InvalidArgument,
                    }
                }
            }
        )*
    };
}

widen_precheck_error!(LockMutexError, TryLockMutexError, LockMutexTimeoutError);

define_suberror! {
    pub enum PostSemaphoreError { Overflow }
}

define_suberror! {
    pub enum CondvarWaitError { Interrupted, NotOwner, OwnerDead }
}

define_suberror! {
    pub enum CondvarWaitTimeoutError { Interrupted, TimedOut, NotOwner, OwnerDead }
}

define_suberror! {
    pub enum WaitError { Interrupted }
}

define_suberror! {
    pub enum WaitTimeoutError { Interrupted, TimedOut }
}

/// Convert `self` to [`WaitError`], panicking if `self` is `TimedOut`.
///
/// Used by callers that construct a wait with no timeout armed, where a
/// `TimedOut` result would indicate a kernel bug.
#[inline]
pub fn expect_not_timeout(e: WaitTimeoutError) -> WaitError {
    match e {
        WaitTimeoutError::Interrupted => WaitError::Interrupted,
        WaitTimeoutError::TimedOut => unreachable!("timeout result for a non-timed wait"),
    }
}
