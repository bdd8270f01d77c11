//! # KeelOS: Preemptive Real-Time Kernel
//!
//! A small preemptive real-time kernel for single-core ARM Cortex-M4
//! microcontrollers.
//!
//! ## Overview
//!
//! KeelOS schedules a fixed number of tasks by priority (lower value = more
//! urgent), round-robin among equals. Tasks block on semaphores, mutexes
//! with priority inheritance, condition variables, barriers and bounded
//! message queues with timeouts, sleep for a number of ticks, or await
//! one-shot child tasks.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────┐
//! │                    Application Tasks                    │
//! ├────────────────────────────────────────────────────────┤
//! │                 Kernel API (kernel.rs)                  │
//! │     spawn() · start() · delay() · yield_now() · dump()  │
//! ├──────────────┬───────────────────┬─────────────────────┤
//! │  Scheduler   │  Sync Primitives  │  Message Queue      │
//! │  scheduler.rs│  sync/            │  queue.rs           │
//! │  ─ tick()    │  ─ Semaphore      │  ─ send(timeout)    │
//! │  ─ pick_next │  ─ Mutex (PI)     │  ─ recv(timeout)    │
//! │  ─ switch    │  ─ CondVar        ├─────────────────────┤
//! │              │  ─ Barrier        │  Child tasks        │
//! │              │                   │  future.rs          │
//! ├──────────────┴───────────────────┴─────────────────────┤
//! │   Task Model (task.rs) · Lists (list.rs) · Pages (page) │
//! ├────────────────────────────────────────────────────────┤
//! │            Arch Port (arch/cortex_m4.rs)                │
//! │    PendSV · SysTick · Context Switch · Stack Init      │
//! ├────────────────────────────────────────────────────────┤
//! │         ARM Cortex-M4 Hardware (Thumb-2)                │
//! └────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Memory Model
//!
//! - **No heap by default**: the task table and the page pool are static.
//!   The `alloc` feature adds a stack policy backed by the global
//!   allocator.
//! - **Intrusive lists**: every queue threads through nodes embedded in
//!   the task control blocks; no list operation allocates.
//! - **Critical sections**: all kernel state sits behind
//!   `critical_section::Mutex`; interrupts are disabled while it changes.
//!
//! ## Host builds
//!
//! Off target, `arch::host` stands in for the hardware: the scheduler,
//! lists and primitives run unchanged and are exercised by the unit tests
//! through a simulated trap.

#![no_std]

#[cfg(test)]
extern crate std;

#[cfg(any(test, feature = "alloc"))]
extern crate alloc;

pub mod error;
pub mod config;
pub mod critical;
pub mod list;
pub mod page;
pub mod task;
pub mod scheduler;
pub mod arch;
pub mod kernel;
pub mod sync;
pub mod queue;
pub mod future;

pub use config::{IdleMode, KernelConfig, SchedPolicy};
pub use error::KernelError;
pub use future::ChildTask;
pub use page::{PagePool, PageRequest};
pub use queue::{MessageQueue, RecvError, SendError};
pub use scheduler::{Kernel, TaskKey, TaskRow, TaskTableSnapshot, WAIT_FOREVER};
pub use sync::{Barrier, CondVar, Mutex, MutexGuard, Semaphore};
pub use task::{Priority, TaskEntry, TaskHandle, TaskParams, TaskStatus};
