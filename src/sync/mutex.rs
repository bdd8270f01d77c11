//! # Mutex
//!
//! A binary semaphore plus an owner, a recursion depth and a priority
//! ceiling. The owner may lock again without blocking; every lock needs a
//! matching unlock.
//!
//! ## Priority inheritance
//!
//! The ceiling is the most urgent priority among the tasks waiting for the
//! mutex (`Priority::LOWEST` when nobody waits). When a task has to wait:
//!
//! - if it is more urgent than the ceiling, the ceiling drops to its
//!   priority, and the owner and every earlier waiter are raised to it;
//! - otherwise the waiter itself is raised to the ceiling.
//!
//! On the last unlock the outgoing owner falls back to its assigned
//! priority and ownership passes straight to the head waiter. The ceiling
//! is recomputed from the assigned priorities of the tasks still waiting.
//!
//! Waiters queue by assigned priority, so raising them to a common ceiling
//! does not disturb who is served first.

use core::cell::RefCell;

use critical_section::Mutex as CsMutex;

use super::{Acquire, Semaphore};
use crate::critical::{critical_section, CriticalSection};
use crate::kassert;
use crate::kernel;
use crate::scheduler::Kernel;
use crate::task::{Priority, TaskHandle, TaskTable};

struct MutexState {
    owner: Option<TaskHandle>,
    recursion: u32,
    ceiling: Priority,
}

pub struct Mutex {
    sem: Semaphore,
    state: CsMutex<RefCell<MutexState>>,
}

/// Waiters queue by assigned priority.
fn by_base_priority(tasks: &TaskTable, a: usize, b: usize) -> bool {
    tasks.tcb(a).base_priority.outranks(tasks.tcb(b).base_priority)
}

impl Mutex {
    pub const fn new() -> Self {
        Mutex {
            sem: Semaphore::with_order(1, by_base_priority),
            state: CsMutex::new(RefCell::new(MutexState {
                owner: None,
                recursion: 0,
                ceiling: Priority::LOWEST,
            })),
        }
    }

    pub fn owner(&self) -> Option<TaskHandle> {
        critical_section(|cs| self.state.borrow_ref(cs).owner)
    }

    pub fn ceiling(&self) -> Priority {
        critical_section(|cs| self.state.borrow_ref(cs).ceiling)
    }

    pub fn recursion(&self) -> u32 {
        critical_section(|cs| self.state.borrow_ref(cs).recursion)
    }

    // -----------------------------------------------------------------------
    // Steps
    // -----------------------------------------------------------------------

    /// Lock for the running task, parking it behind the owner if needed.
    pub fn lock_in(&self, cs: CriticalSection<'_>, k: &mut Kernel) -> Acquire {
        let cur = k.require_current();
        let me = k.tasks().handle(cur);
        let mut st = self.state.borrow_ref_mut(cs);

        if st.owner == Some(me) {
            st.recursion += 1;
            return Acquire::Acquired;
        }

        if let Some(owner) = st.owner {
            let mine = k.tasks().tcb(cur).priority;
            if mine.outranks(st.ceiling) {
                st.ceiling = mine;
                if let Some(os) = k.tasks().resolve(owner) {
                    if mine.outranks(k.tasks().tcb(os).priority) {
                        k.set_effective_priority(os, mine);
                    }
                }
                let sem = self.sem.state(cs);
                k.reprioritize_waiters(&sem.waiters, |t| t.priority.min(mine));
            } else {
                k.set_effective_priority(cur, st.ceiling);
            }
        }

        match self.sem.down_in(cs, k) {
            Acquire::Acquired => {
                st.owner = Some(me);
                st.recursion = 1;
                Acquire::Acquired
            }
            Acquire::Parked => Acquire::Parked,
        }
    }

    /// Lock only if that needs no waiting.
    pub fn try_lock_in(&self, cs: CriticalSection<'_>, k: &mut Kernel) -> bool {
        let cur = k.require_current();
        let me = k.tasks().handle(cur);
        let mut st = self.state.borrow_ref_mut(cs);

        if st.owner == Some(me) {
            st.recursion += 1;
            return true;
        }
        if st.owner.is_none() && self.sem.try_down_in(cs) {
            st.owner = Some(me);
            st.recursion = 1;
            return true;
        }
        false
    }

    /// Drop one level of ownership. Unlocking a mutex the caller does not
    /// own is fatal.
    pub fn unlock_in(&self, cs: CriticalSection<'_>, k: &mut Kernel) {
        let cur = k.require_current();
        let me = k.tasks().handle(cur);
        let mut st = self.state.borrow_ref_mut(cs);

        kassert!(
            st.owner == Some(me),
            "mutex unlocked by task {} which does not own it",
            me.tid()
        );
        st.recursion -= 1;
        if st.recursion > 0 {
            return;
        }

        let base = k.tasks().tcb(cur).base_priority;
        k.set_effective_priority(cur, base);

        let next = {
            let sem = self.sem.state(cs);
            sem.waiters.head().map(|head| {
                let ceiling = sem
                    .waiters
                    .next_of(k.tasks(), head)
                    .map(|s| k.tasks().tcb(s).base_priority)
                    .unwrap_or(Priority::LOWEST);
                (head, ceiling)
            })
        };

        match next {
            Some((head, ceiling)) => {
                st.owner = Some(k.tasks().handle(head));
                st.recursion = 1;
                st.ceiling = ceiling;
                {
                    let sem = self.sem.state(cs);
                    k.reprioritize_waiters(&sem.waiters, |t| t.base_priority.min(ceiling));
                }
                let woken = self.sem.up_in(cs, k, true);
                kassert!(woken == Some(head), "mutex handed to the wrong waiter");
            }
            None => {
                st.owner = None;
                st.ceiling = Priority::LOWEST;
                self.sem.up_in(cs, k, true);
            }
        }
    }

    /// Release every level at once, for a condition-variable wait.
    /// Returns the depth to restore afterwards.
    pub(crate) fn unlock_all_in(&self, cs: CriticalSection<'_>, k: &mut Kernel) -> u32 {
        let depth = {
            let mut st = self.state.borrow_ref_mut(cs);
            core::mem::replace(&mut st.recursion, 1)
        };
        self.unlock_in(cs, k);
        depth
    }

    // -----------------------------------------------------------------------
    // Blocking API
    // -----------------------------------------------------------------------

    pub fn lock(&self) -> MutexGuard<'_> {
        kernel::with(|cs, k| self.lock_in(cs, k));
        MutexGuard { mutex: self }
    }

    pub fn try_lock(&self) -> Option<MutexGuard<'_>> {
        kernel::with(|cs, k| self.try_lock_in(cs, k)).then(|| MutexGuard { mutex: self })
    }

    /// Lock again after a condition-variable wait, restoring `depth`.
    pub(crate) fn relock(&self, depth: u32) -> MutexGuard<'_> {
        kernel::with(|cs, k| self.lock_in(cs, k));
        critical_section(|cs| self.state.borrow_ref_mut(cs).recursion = depth);
        MutexGuard { mutex: self }
    }

    fn unlock(&self) {
        kernel::with(|cs, k| self.unlock_in(cs, k));
    }
}

impl Default for Mutex {
    fn default() -> Self {
        Self::new()
    }
}

/// Scoped lock. Unlocks one level when dropped.
#[must_use = "the mutex is unlocked as soon as the guard is dropped"]
pub struct MutexGuard<'a> {
    mutex: &'a Mutex,
}

impl<'a> MutexGuard<'a> {
    pub fn mutex(&self) -> &'a Mutex {
        self.mutex
    }

    /// Give up the guard without unlocking. The caller takes over the
    /// matching unlock.
    pub(crate) fn into_mutex(self) -> &'a Mutex {
        let guard = core::mem::ManuallyDrop::new(self);
        guard.mutex
    }
}

impl Drop for MutexGuard<'_> {
    fn drop(&mut self) {
        self.mutex.unlock();
    }
}
