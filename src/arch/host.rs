//! # Host Port
//!
//! Stand-in for the hardware when the crate is built for a desktop
//! target. Nothing ever jumps to a task entry here; [`SimCpu`] plays the
//! role of the trap by carrying the stack pointer across
//! [`Kernel::switch_context`] calls, which is all the scheduler observes
//! of a real switch.
//!
//! Under test, a thread may install a trap handler. It runs when a
//! critical section that pended a switch ends, which is where the real
//! trap would fire. It stands in for everything the other tasks do
//! until the caller is switched back in.

#[cfg(test)]
use core::cell::RefCell;
use core::sync::atomic::{AtomicBool, Ordering};
#[cfg(test)]
use std::boxed::Box;

use crate::config::IdleMode;
use crate::scheduler::Kernel;

static PENDED: AtomicBool = AtomicBool::new(false);

/// Record a switch request.
pub fn pend_switch() {
    PENDED.store(true, Ordering::SeqCst);
}

/// Consume a recorded switch request.
pub fn take_pended() -> bool {
    PENDED.swap(false, Ordering::SeqCst)
}

#[cfg(test)]
std::thread_local! {
    static TRAP_HANDLER: RefCell<Option<Box<dyn FnMut()>>> = const { RefCell::new(None) };
}

/// Install (or with `None` remove) this thread's trap handler.
#[cfg(test)]
pub(crate) fn set_trap_handler(handler: Option<Box<dyn FnMut()>>) {
    TRAP_HANDLER.with(|h| *h.borrow_mut() = handler);
}

/// Take a pended trap, if any. Called once the critical section that
/// pended it has ended. Switches pended by the handler itself are
/// dropped.
pub fn take_trap() {
    #[cfg(test)]
    run_trap_handler();
}

#[cfg(test)]
fn run_trap_handler() {
    if !take_pended() {
        return;
    }
    let Some(mut handler) = TRAP_HANDLER.with(|h| h.borrow_mut().take()) else {
        return;
    };
    handler();
    TRAP_HANDLER.with(|h| {
        let mut slot = h.borrow_mut();
        if slot.is_none() {
            *slot = Some(handler);
        }
    });
}

pub fn idle_wait(_mode: IdleMode) {
    core::hint::spin_loop();
}

/// A simulated core: the stack pointer of whatever task it is running.
#[derive(Debug)]
pub struct SimCpu {
    sp: *mut usize,
    switches: usize,
}

impl SimCpu {
    pub fn new() -> Self {
        SimCpu {
            sp: core::ptr::null_mut(),
            switches: 0,
        }
    }

    /// Start the scheduler and load the first task.
    pub fn boot(&mut self, kernel: &mut Kernel) {
        match kernel.start() {
            Ok(sp) => self.sp = sp,
            Err(e) => crate::error::fatal(format_args!("boot: {}", e)),
        }
    }

    /// Take the context-switch trap.
    pub fn trap(&mut self, kernel: &mut Kernel) {
        kernel.take_switch_request();
        let next = kernel.switch_context(self.sp);
        if next != self.sp {
            self.switches += 1;
        }
        self.sp = next;
    }

    pub fn sp(&self) -> *mut usize {
        self.sp
    }

    /// Number of traps that changed the running stack.
    pub fn switches(&self) -> usize {
        self.switches
    }
}

impl Default for SimCpu {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SchedPolicy;
    use crate::scheduler::tests::{kernel, spawn};

    #[test]
    fn test_trap_swaps_saved_stack_pointers() {
        let mut k = kernel(SchedPolicy::Preemptive);
        let a = spawn(&mut k, 3, "a");
        let b = spawn(&mut k, 3, "b");
        let mut cpu = SimCpu::new();
        cpu.boot(&mut k);
        assert_eq!(cpu.sp(), k.tcb(a).unwrap().sp);

        k.yield_current();
        cpu.trap(&mut k);
        assert_eq!(cpu.sp(), k.tcb(b).unwrap().sp);
        assert_eq!(cpu.switches(), 1);

        // no request, no rotation: the same task keeps the core
        cpu.trap(&mut k);
        assert_eq!(cpu.switches(), 1);
    }
}
