//! Barrier for a fixed number of parties.
//!
//! Built from a [`Mutex`], a [`CondVar`] and a generation counter. The
//! last arrival of a round is the leader: it resets the count, advances
//! the generation and wakes the others, so the barrier is reusable at
//! once.

use core::cell::RefCell;

use critical_section::Mutex as CsMutex;

use super::{CondVar, Mutex};
use crate::critical::{critical_section, CriticalSection};
use crate::kernel;
use crate::scheduler::Kernel;

struct BarrierState {
    arrived: usize,
    generation: u32,
}

/// What an arrival has to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arrival {
    /// Last of the round; the others have been woken.
    Leader,
    /// Wait until the generation moves past this one.
    Wait(u32),
}

pub struct Barrier {
    parties: usize,
    lock: Mutex,
    cv: CondVar,
    state: CsMutex<RefCell<BarrierState>>,
}

impl Barrier {
    pub const fn new(parties: usize) -> Self {
        Barrier {
            parties,
            lock: Mutex::new(),
            cv: CondVar::new(),
            state: CsMutex::new(RefCell::new(BarrierState {
                arrived: 0,
                generation: 0,
            })),
        }
    }

    pub fn parties(&self) -> usize {
        self.parties
    }

    pub fn generation(&self) -> u32 {
        critical_section(|cs| self.state.borrow_ref(cs).generation)
    }

    pub fn arrived(&self) -> usize {
        critical_section(|cs| self.state.borrow_ref(cs).arrived)
    }

    /// Count one arrival. Call with the barrier's mutex held.
    pub fn arrive_in(&self, cs: CriticalSection<'_>, k: &mut Kernel) -> Arrival {
        let mut st = self.state.borrow_ref_mut(cs);
        st.arrived += 1;
        if st.arrived < self.parties {
            return Arrival::Wait(st.generation);
        }
        st.arrived = 0;
        st.generation = st.generation.wrapping_add(1);
        self.cv.notify_all_in(cs, k, true);
        Arrival::Leader
    }

    /// Block until all parties have called `wait`. Exactly one caller per
    /// round gets `true`.
    pub fn wait(&self) -> bool {
        let guard = self.lock.lock();
        match kernel::with(|cs, k| self.arrive_in(cs, k)) {
            Arrival::Leader => true,
            Arrival::Wait(generation) => {
                let _guard = self.cv.wait_while(guard, || self.generation() == generation);
                false
            }
        }
    }

    pub(crate) fn lock(&self) -> &Mutex {
        &self.lock
    }

    pub(crate) fn condvar(&self) -> &CondVar {
        &self.cv
    }
}
