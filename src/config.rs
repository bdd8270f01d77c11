//! # KeelOS Configuration
//!
//! Compile-time constants governing the kernel. All limits are fixed at
//! compile time; the page pool and the task table are sized from them.
//! Cargo features pick the build-time defaults that [`KernelConfig`]
//! starts from.

use crate::task::Priority;

/// Maximum number of tasks the kernel manages simultaneously, the idle
/// task included. Bounds the task table and the page pool.
pub const MAX_TASKS: usize = 8;

/// Size of one pool page in machine words. Each pool task runs on
/// exactly one page, so this is also the default stack depth.
pub const PAGE_WORDS: usize = 256;

/// Smallest stack (in words) a task may be created with: the synthetic
/// trap frame plus a little headroom for the entry function.
pub const MIN_STACK_WORDS: usize = 32;

/// SysTick frequency in Hz. One tick is the kernel's unit of time.
pub const TICK_HZ: u32 = 1000;

/// System clock frequency in Hz (default for STM32F4 at 16 MHz HSI).
pub const SYSTEM_CLOCK_HZ: u32 = 16_000_000;

/// Default time slice in ticks.
pub const DEFAULT_TIME_SLICE: u32 = 10;

/// Watermark painted over fresh stacks; the first word that no longer
/// holds it marks the deepest point the task has reached.
pub const STACK_PAINT: usize = 0xA5A5_A5A5;

/// Priority of the idle task. Nothing is ever less urgent.
pub const IDLE_PRIORITY: Priority = Priority::LOWEST;

/// Scheduling policy, fixed per kernel instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedPolicy {
    /// The running task keeps the CPU until its slice runs out or it
    /// blocks, whatever became ready in the meantime.
    RoundRobin,
    /// The head of the ready list always wins; equal priorities share
    /// the CPU slice by slice.
    Preemptive,
}

/// What the idle task does while nothing else is ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleMode {
    /// Sleep in `wfi` until the next interrupt.
    WaitForInterrupt,
    /// Busy-loop. Useful under debuggers that lose the core during `wfi`.
    Spin,
}

#[cfg(feature = "round-robin")]
pub const DEFAULT_POLICY: SchedPolicy = SchedPolicy::RoundRobin;
#[cfg(not(feature = "round-robin"))]
pub const DEFAULT_POLICY: SchedPolicy = SchedPolicy::Preemptive;

#[cfg(feature = "idle-spin")]
pub const DEFAULT_IDLE: IdleMode = IdleMode::Spin;
#[cfg(not(feature = "idle-spin"))]
pub const DEFAULT_IDLE: IdleMode = IdleMode::WaitForInterrupt;

/// Per-instance kernel settings.
#[derive(Debug, Clone, Copy)]
pub struct KernelConfig {
    pub policy: SchedPolicy,
    /// Ticks a task may run before it is rotated behind its peers.
    pub time_slice: u32,
    pub idle: IdleMode,
}

impl KernelConfig {
    /// The build-time defaults.
    pub const DEFAULT: KernelConfig = KernelConfig {
        policy: DEFAULT_POLICY,
        time_slice: DEFAULT_TIME_SLICE,
        idle: DEFAULT_IDLE,
    };

    pub const fn with_policy(self, policy: SchedPolicy) -> Self {
        KernelConfig { policy, ..self }
    }

    pub const fn with_time_slice(self, time_slice: u32) -> Self {
        KernelConfig { time_slice, ..self }
    }
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}
