//! # Errors
//!
//! Two kinds of failure exist in the kernel:
//!
//! - **Recoverable**: resource exhaustion and soft failures. Reported as a
//!   [`KernelError`] (or a queue-specific error) for the caller to check.
//! - **Fatal**: protocol violations such as unlocking a mutex the caller
//!   does not own. The kernel's lists can no longer be trusted, so
//!   [`fatal`] stops the system. Under `debug_assertions` it panics with
//!   the message instead, which is what host tests observe.

use core::fmt;

/// Typed failure returned by kernel operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    /// The task table is full (`MAX_TASKS` reached).
    TooManyTasks,
    /// Every pool page is in use.
    PoolExhausted,
    /// The backing allocator returned null for a DYNAMIC page.
    OutOfMemory,
    /// The supplied stack cannot hold the initial trap frame.
    StackTooSmall,
    /// The handle does not name a live task.
    NoSuchTask,
    /// The task is parked on a synchronization object and cannot be torn
    /// down without corrupting that object's counter.
    WaitingOnObject,
    /// The operation needs a running task but the scheduler has not
    /// started yet.
    NotStarted,
    /// The task is not in a state that allows the operation.
    InvalidState,
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            KernelError::TooManyTasks => "task table full",
            KernelError::PoolExhausted => "page pool exhausted",
            KernelError::OutOfMemory => "page allocation failed",
            KernelError::StackTooSmall => "stack too small for initial frame",
            KernelError::NoSuchTask => "no such task",
            KernelError::WaitingOnObject => "task is waiting on a synchronization object",
            KernelError::NotStarted => "scheduler not started",
            KernelError::InvalidState => "task in wrong state",
        };
        f.write_str(msg)
    }
}

/// The single terminal path of the kernel.
#[cold]
#[inline(never)]
pub fn fatal(args: fmt::Arguments<'_>) -> ! {
    if cfg!(debug_assertions) {
        panic!("kernel fatal: {}", args);
    }

    log::error!("kernel fatal: {}", args);
    halt()
}

#[cfg(all(target_arch = "arm", target_os = "none"))]
fn halt() -> ! {
    cortex_m::interrupt::disable();
    loop {
        cortex_m::asm::bkpt();
    }
}

#[cfg(not(all(target_arch = "arm", target_os = "none")))]
fn halt() -> ! {
    panic!("kernel halted")
}

/// Assert a kernel invariant; a failure goes through [`fatal`].
#[macro_export]
macro_rules! kassert {
    ($cond:expr) => {
        if !$cond {
            $crate::error::fatal(format_args!("assertion failed: {}", stringify!($cond)))
        }
    };
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            $crate::error::fatal(format_args!($($arg)+))
        }
    };
}

/// `unwrap` for kernel invariants.
pub(crate) trait OrFatal<T> {
    fn or_fatal(self, what: &str) -> T;
}

impl<T> OrFatal<T> for Option<T> {
    #[track_caller]
    fn or_fatal(self, what: &str) -> T {
        match self {
            Some(v) => v,
            None => fatal(format_args!("{}", what)),
        }
    }
}
