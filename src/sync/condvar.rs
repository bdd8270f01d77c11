//! Condition variable.
//!
//! `wait` gives up the mutex and parks the caller in one critical section,
//! so a notify issued after the mutex is released always finds the waiter
//! on the list. A notify with nobody waiting is lost.

use core::cell::RefCell;

use critical_section::Mutex as CsMutex;

use super::mutex::{Mutex, MutexGuard};
use crate::critical::{critical_section, CriticalSection};
use crate::kernel;
use crate::list::{Hook, List};
use crate::scheduler::Kernel;
use crate::task::by_priority;

pub struct CondVar {
    waiters: CsMutex<RefCell<List>>,
}

impl CondVar {
    pub const fn new() -> Self {
        CondVar {
            waiters: CsMutex::new(RefCell::new(List::new(Hook::Sched))),
        }
    }

    pub fn waiting(&self) -> usize {
        critical_section(|cs| self.waiters.borrow_ref(cs).len())
    }

    // -----------------------------------------------------------------------
    // Steps
    // -----------------------------------------------------------------------

    /// Release `mutex` entirely and park the running task. Returns the
    /// recursion depth to restore on relock.
    pub fn park_in(&self, cs: CriticalSection<'_>, k: &mut Kernel, mutex: &Mutex) -> u32 {
        let depth = mutex.unlock_all_in(cs, k);
        let mut waiters = self.waiters.borrow_ref_mut(cs);
        k.park_current(&mut waiters, by_priority);
        depth
    }

    /// Wake the most urgent waiter. Returns whether there was one.
    pub fn notify_one_in(&self, cs: CriticalSection<'_>, k: &mut Kernel, may_yield: bool) -> bool {
        let mut waiters = self.waiters.borrow_ref_mut(cs);
        k.unpark(&mut waiters, may_yield).is_some()
    }

    /// Wake every waiter. Returns how many there were.
    pub fn notify_all_in(&self, cs: CriticalSection<'_>, k: &mut Kernel, may_yield: bool) -> usize {
        let mut waiters = self.waiters.borrow_ref_mut(cs);
        let mut woken = 0;
        while k.unpark(&mut waiters, may_yield).is_some() {
            woken += 1;
        }
        woken
    }

    // -----------------------------------------------------------------------
    // Blocking API
    // -----------------------------------------------------------------------

    /// Wait for one notification. The mutex is released while waiting and
    /// held again on return.
    pub fn wait<'a>(&self, guard: MutexGuard<'a>) -> MutexGuard<'a> {
        let mutex = guard.into_mutex();
        let depth = kernel::with(|cs, k| self.park_in(cs, k, mutex));
        mutex.relock(depth)
    }

    /// Wait for as long as `condition` holds. The condition is evaluated
    /// with the mutex held: once before waiting and again after every
    /// wake-up.
    pub fn wait_while<'a, F>(&self, mut guard: MutexGuard<'a>, mut condition: F) -> MutexGuard<'a>
    where
        F: FnMut() -> bool,
    {
        while condition() {
            guard = self.wait(guard);
        }
        guard
    }

    pub fn notify_one(&self) -> bool {
        kernel::with(|cs, k| self.notify_one_in(cs, k, true))
    }

    pub fn notify_all(&self) -> usize {
        kernel::with(|cs, k| self.notify_all_in(cs, k, true))
    }

    pub fn notify_one_from_isr(&self) -> bool {
        kernel::with(|cs, k| self.notify_one_in(cs, k, false))
    }
}

impl Default for CondVar {
    fn default() -> Self {
        Self::new()
    }
}
