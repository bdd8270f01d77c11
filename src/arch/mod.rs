//! # Architecture Abstraction Layer
//!
//! The hardware boundary of the scheduler. A port supplies:
//!
//! - `pend_switch`: request the context-switch trap. The switch itself
//!   happens when the trap is taken, after the current critical section.
//! - `idle_wait`: what the idle task does between interrupts.
//! - the trap and timer handlers, which call into `kernel`.
//!
//! The initial stack frame is the same on every port: it mirrors what the
//! Cortex-M4 exception entry pushes, preceded by the eight registers the
//! switch handler saves by hand.
//!
//! ```text
//!   high  ┌──────────┐ ◄── stack top (8-byte aligned)
//!         │ xPSR     │  Thumb bit set
//!         │ PC       │  entry point
//!         │ LR       │  return trampoline
//!         │ R12      │
//!         │ R3..R1   │
//!         │ R0       │  task argument
//!         │ R11..R4  │  zero
//!   low   └──────────┘ ◄── saved stack pointer
//! ```

#[cfg(all(target_arch = "arm", target_os = "none"))]
pub mod cortex_m4;
#[cfg(all(target_arch = "arm", target_os = "none"))]
pub use cortex_m4::{idle_wait, pend_switch};

#[cfg(not(all(target_arch = "arm", target_os = "none")))]
pub mod host;
#[cfg(not(all(target_arch = "arm", target_os = "none")))]
pub use host::{idle_wait, pend_switch};

/// Words in the initial frame.
pub const FRAME_WORDS: usize = 16;

/// Initial xPSR: only the Thumb bit.
pub const XPSR_THUMB: usize = 0x0100_0000;

/// Word offsets inside a saved frame, from the saved stack pointer.
pub mod frame {
    pub const R4: usize = 0;
    pub const R0: usize = 8;
    pub const R12: usize = 12;
    pub const LR: usize = 13;
    pub const PC: usize = 14;
    pub const XPSR: usize = 15;
}

/// Build the initial frame below `top` and return the stack pointer the
/// first switch will restore from.
///
/// # Safety
/// `top` must be one past the end of a writable stack of at least
/// `FRAME_WORDS + 1` words.
pub unsafe fn init_frame(top: *mut usize, entry: usize, arg: usize, return_to: usize) -> *mut usize {
    let top = (top as usize & !7) as *mut usize;
    let sp = top.sub(FRAME_WORDS);
    for i in 0..FRAME_WORDS {
        sp.add(i).write(0);
    }
    sp.add(frame::R0).write(arg);
    sp.add(frame::LR).write(return_to);
    // Exception return wants the Thumb bit in xPSR, not in PC.
    sp.add(frame::PC).write(entry & !1);
    sp.add(frame::XPSR).write(XPSR_THUMB);
    sp
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_frame_layout() {
        let mut mem = [0xEEusize; 40];
        let top = unsafe { mem.as_mut_ptr().add(mem.len()) };
        let sp = unsafe { init_frame(top, 0x0800_1235, 0xAB, 0x0800_2001) };
        assert_eq!(sp as usize % 8, 0);
        assert!(sp as usize >= mem.as_ptr() as usize);

        let f = unsafe { core::slice::from_raw_parts(sp, FRAME_WORDS) };
        assert_eq!(f[frame::R4], 0);
        assert_eq!(f[frame::R0], 0xAB);
        assert_eq!(f[frame::R12], 0);
        assert_eq!(f[frame::LR], 0x0800_2001);
        assert_eq!(f[frame::PC], 0x0800_1234);
        assert_eq!(f[frame::XPSR], XPSR_THUMB);
    }
}
