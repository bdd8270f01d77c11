//! Counting semaphore.
//!
//! The count may go negative: `-n` means `n` tasks are parked. The wait
//! list is ordered by priority, FIFO among equals.

use core::cell::{RefCell, RefMut};

use critical_section::Mutex as CsMutex;

use super::Acquire;
use crate::critical::{critical_section, CriticalSection};
use crate::kernel;
use crate::list::{Hook, List};
use crate::scheduler::{Kernel, WaitOrder};
use crate::task::by_priority;

pub(crate) struct SemState {
    pub(crate) count: isize,
    pub(crate) waiters: List,
    order: WaitOrder,
}

pub struct Semaphore {
    state: CsMutex<RefCell<SemState>>,
}

impl Semaphore {
    /// A semaphore holding `count` units.
    pub const fn new(count: isize) -> Self {
        Self::with_order(count, by_priority)
    }

    pub(crate) const fn with_order(count: isize, order: WaitOrder) -> Self {
        Semaphore {
            state: CsMutex::new(RefCell::new(SemState {
                count,
                waiters: List::new(Hook::Sched),
                order,
            })),
        }
    }

    pub(crate) fn state<'cs>(&'cs self, cs: CriticalSection<'cs>) -> RefMut<'cs, SemState> {
        self.state.borrow_ref_mut(cs)
    }

    pub fn count(&self) -> isize {
        critical_section(|cs| self.state(cs).count)
    }

    /// Number of parked tasks.
    pub fn waiting(&self) -> usize {
        critical_section(|cs| self.state(cs).waiters.len())
    }

    // -----------------------------------------------------------------------
    // Steps
    // -----------------------------------------------------------------------

    /// Take one unit, parking the running task if none is left.
    pub fn down_in(&self, cs: CriticalSection<'_>, k: &mut Kernel) -> Acquire {
        let mut st = self.state(cs);
        st.count -= 1;
        if st.count >= 0 {
            return Acquire::Acquired;
        }
        let st = &mut *st;
        k.park_current(&mut st.waiters, st.order);
        Acquire::Parked
    }

    /// Take one unit if available.
    pub fn try_down_in(&self, cs: CriticalSection<'_>) -> bool {
        let mut st = self.state(cs);
        if st.count > 0 {
            st.count -= 1;
            true
        } else {
            false
        }
    }

    /// Return one unit. If tasks are parked the unit goes straight to the
    /// most urgent one, whose slot is returned.
    pub fn up_in(&self, cs: CriticalSection<'_>, k: &mut Kernel, may_yield: bool) -> Option<usize> {
        let mut st = self.state(cs);
        let had_waiters = st.count < 0;
        st.count += 1;
        if !had_waiters {
            return None;
        }
        let woken = k.unpark(&mut st.waiters, may_yield);
        crate::kassert!(woken.is_some(), "semaphore count below zero with no waiters");
        woken
    }

    // -----------------------------------------------------------------------
    // Blocking API
    // -----------------------------------------------------------------------

    pub fn down(&self) {
        kernel::with(|cs, k| self.down_in(cs, k));
    }

    pub fn try_down(&self) -> bool {
        critical_section(|cs| self.try_down_in(cs))
    }

    pub fn up(&self) {
        kernel::with(|cs, k| {
            self.up_in(cs, k, true);
        });
    }

    pub fn up_from_isr(&self) {
        kernel::with(|cs, k| {
            self.up_in(cs, k, false);
        });
    }
}
