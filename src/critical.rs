//! # Critical Sections
//!
//! Interrupt-safe critical section abstractions. Disabling interrupts is
//! the kernel's only locking discipline below the synchronization layer:
//! every list mutation, status change and update of the running-task
//! pointer happens inside one of these spans.
//!
//! On target the implementation comes from `cortex-m`'s
//! `critical-section-single-core` feature (PRIMASK save/restore). Host
//! tests use the `critical-section` `std` implementation.

pub use critical_section::CriticalSection;

/// Execute a closure within a critical section (interrupts disabled).
///
/// Interrupts are restored to their previous state on exit, so nesting is
/// allowed.
#[inline]
pub fn critical_section<F, R>(f: F) -> R
where
    F: FnOnce(CriticalSection<'_>) -> R,
{
    let guard = IrqGuard::acquire();
    f(guard.token())
}

/// Scoped interrupt-disable.
///
/// Interrupts stay masked while the guard lives; dropping it restores the
/// state captured by [`IrqGuard::acquire`] on every exit path.
#[must_use = "interrupts are re-enabled as soon as the guard is dropped"]
pub struct IrqGuard {
    restore: critical_section::RestoreState,
}

impl IrqGuard {
    /// Mask interrupts until the returned guard is dropped.
    pub fn acquire() -> Self {
        // Safety: the matching release is performed exactly once, in Drop.
        let restore = unsafe { critical_section::acquire() };
        IrqGuard { restore }
    }

    /// Token for `critical_section::Mutex` borrows tied to this guard.
    pub fn token(&self) -> CriticalSection<'_> {
        // Safety: interrupts are masked for as long as `self` is borrowed.
        unsafe { CriticalSection::new() }
    }
}

impl Drop for IrqGuard {
    fn drop(&mut self) {
        // Safety: `restore` came from the acquire in `IrqGuard::acquire`.
        unsafe { critical_section::release(self.restore) }
    }
}
