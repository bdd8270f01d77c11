//! # Cortex-M4 Port Layer
//!
//! Hardware-specific code for the ARM Cortex-M4 (Thumb-2) processor.
//! Implements context switching via PendSV, SysTick timer configuration,
//! and interrupt management.
//!
//! ## Context Switch Mechanism
//!
//! Tasks run in Thread mode on the process stack (PSP); the kernel and
//! interrupt handlers use the main stack (MSP). On exception entry the
//! hardware stacks R0–R3, R12, LR, PC and xPSR onto the process stack.
//! PendSV saves and restores R4–R11 by hand, which completes the frame.
//!
//! ## Interrupt Priorities
//!
//! PendSV and SysTick both sit at the lowest priority, so a switch never
//! preempts an application interrupt handler.

use core::arch::{asm, naked_asm};

use cortex_m::peripheral::scb::SystemHandler;
use cortex_m::peripheral::syst::SystClkSource;
use cortex_m::peripheral::{SCB, SYST};

use crate::config::{IdleMode, SYSTEM_CLOCK_HZ, TICK_HZ};
use crate::kernel;

// ---------------------------------------------------------------------------
// SysTick configuration
// ---------------------------------------------------------------------------

/// Configure SysTick to fire at `TICK_HZ` from the core clock.
pub fn configure_systick(syst: &mut SYST) {
    let reload = SYSTEM_CLOCK_HZ / TICK_HZ - 1;
    syst.set_reload(reload);
    syst.clear_current();
    syst.set_clock_source(SystClkSource::Core);
    syst.enable_counter();
    syst.enable_interrupt();
}

/// Put PendSV and SysTick at the lowest priority.
pub fn set_interrupt_priorities(scb: &mut SCB) {
    // Safety: changing system handler priorities cannot break a critical
    // section; interrupts are still disabled at this point.
    unsafe {
        scb.set_priority(SystemHandler::PendSV, 0xFF);
        scb.set_priority(SystemHandler::SysTick, 0xFF);
    }
}

// ---------------------------------------------------------------------------
// Port hooks
// ---------------------------------------------------------------------------

/// Pend the PendSV exception.
#[inline]
pub fn pend_switch() {
    SCB::set_pendsv();
}

#[inline]
pub fn idle_wait(mode: IdleMode) {
    match mode {
        IdleMode::WaitForInterrupt => cortex_m::asm::wfi(),
        IdleMode::Spin => cortex_m::asm::nop(),
    }
}

// ---------------------------------------------------------------------------
// First task launch
// ---------------------------------------------------------------------------

/// Switch Thread mode to PSP and branch into the first task by unwinding
/// its initial frame by hand.
///
/// # Safety
/// Called once, with interrupts disabled, with a stack pointer produced
/// by `arch::init_frame`.
pub unsafe fn start_first_task(sp: *mut usize) -> ! {
    asm!(
        // Skip the eight software-saved registers.
        "adds r0, #32",
        "msr psp, r0",
        // CONTROL.SPSEL = 1: Thread mode uses PSP.
        "movs r0, #2",
        "msr control, r0",
        "isb",
        // Unwind the hardware part of the frame.
        "pop {{r0-r3, r12}}",
        "pop {{r4, r5, r6}}",
        "mov lr, r4",
        "orr r5, r5, #1",
        "cpsie i",
        "bx r5",
        in("r0") sp,
        options(noreturn)
    );
}

// ---------------------------------------------------------------------------
// PendSV handler (context switch)
// ---------------------------------------------------------------------------

/// PendSV exception handler.
///
/// 1. Push R4–R11 onto the outgoing task's stack.
/// 2. Hand the resulting PSP to the kernel, get the incoming one back.
/// 3. Pop R4–R11 from the incoming stack and return to Thread mode; the
///    hardware unstacks the rest.
///
/// # Safety
/// Entered by the NVIC only.
#[no_mangle]
#[unsafe(naked)]
pub unsafe extern "C" fn PendSV() {
    naked_asm!(
        "mrs r0, psp",
        "stmdb r0!, {{r4-r11}}",
        "bl {switch}",
        "ldmia r0!, {{r4-r11}}",
        "msr psp, r0",
        // EXC_RETURN: Thread mode, PSP, basic frame.
        "ldr r0, =0xFFFFFFFD",
        "bx r0",
        switch = sym switch_stacks,
    );
}

/// Store the outgoing stack pointer and return the incoming one.
extern "C" fn switch_stacks(psp: *mut usize) -> *mut usize {
    kernel::with(|_, k| k.switch_context(psp))
}

// ---------------------------------------------------------------------------
// SysTick handler
// ---------------------------------------------------------------------------

/// SysTick exception handler: the kernel tick.
#[no_mangle]
pub extern "C" fn SysTick() {
    kernel::tick();
}
