//! # Synchronization Primitives
//!
//! Semaphore, priority-inheriting mutex, condition variable and barrier.
//!
//! Each object keeps its state in a `critical_section::Mutex<RefCell<_>>`
//! and exposes two layers:
//!
//! - `*_in(cs, kernel, ..)` step functions. They do one atomic step on the
//!   object and the kernel (take, or park the caller; release, or wake a
//!   waiter) and return. They never switch by themselves; the kernel
//!   records the switch request.
//! - blocking wrappers (`down`, `lock`, `wait`, ...) that run a step
//!   through `kernel::with`. When the step parked the caller, the pended
//!   trap fires at the end of the critical section and the wrapper only
//!   continues once a counterpart has woken it.
//!
//! The `_from_isr` variants never request a switch; the next tick picks
//! up any task they made ready.

pub mod barrier;
pub mod condvar;
pub mod mutex;
pub mod semaphore;

pub use barrier::Barrier;
pub use condvar::CondVar;
pub use mutex::{Mutex, MutexGuard};
pub use semaphore::Semaphore;

/// Outcome of a step that may have to wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquire {
    /// Taken without waiting.
    Acquired,
    /// The caller is parked; it owns the resource once it runs again.
    Parked,
}
