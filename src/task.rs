//! # Task Control Block
//!
//! Defines the unit of scheduling. Each TCB sits in one slot of the
//! kernel's fixed [`TaskTable`]; a slot is either free or holds a task,
//! never both, so a slot is never read as a TCB while it is unused.
//!
//! ## Status machine
//!
//! ```text
//!   ┌──────────┐   picked by trap    ┌─────────┐
//!   │  Ready   │ ──────────────────► │ Running │
//!   └──────────┘ ◄────────────────── └─────────┘
//!        ▲          preempt / yield       │   │
//!        │                       block()  │   │ terminate()
//!        │        resume()  ┌─────────┐   │   ▼
//!        └──────────────────│ Blocked │ ◄─┘  ┌────────────┐
//!                           └─────────┘      │ Terminated │
//!                                            └────────────┘
//! ```
//!
//! Only the scheduler moves a task between states. The scheduling node
//! is in exactly the list [`Residence`] names: `Ready`/`Running` tasks
//! are in the ready list, `Blocked` tasks in the blocked list, the
//! sleeping list or an object's wait list, `Terminated` tasks in none.

use core::fmt;

use crate::config::MAX_TASKS;
use crate::error::fatal;
use crate::list::{Hook, ListNode, NodeArena};
use crate::page::Stack;

// ---------------------------------------------------------------------------
// Priority
// ---------------------------------------------------------------------------

/// Scheduling priority. Lower value = more urgent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Priority(u8);

impl Priority {
    pub const HIGHEST: Priority = Priority(0);
    pub const LOWEST: Priority = Priority(u8::MAX);

    pub const fn new(value: u8) -> Self {
        Priority(value)
    }

    pub const fn value(self) -> u8 {
        self.0
    }

    /// Strictly more urgent than `other`.
    #[inline]
    pub fn outranks(self, other: Priority) -> bool {
        self.0 < other.0
    }
}

impl From<u8> for Priority {
    fn from(value: u8) -> Self {
        Priority(value)
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Ready,
    Running,
    Blocked,
    Terminated,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Ready => "ready",
            TaskStatus::Running => "running",
            TaskStatus::Blocked => "blocked",
            TaskStatus::Terminated => "dead",
        }
    }
}

/// Which list currently holds a task's scheduling node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Residence {
    None,
    Ready,
    Blocked,
    Sleeping,
    /// Wait list of a semaphore, mutex or condition variable.
    Object,
}

/// Where the task goes when its entry function returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnPath {
    /// Plain teardown.
    Terminate,
    /// Tear down and wake the task that awaited this one.
    JoinParent,
}

/// Task entry point. Receives the opaque argument given at creation.
pub type TaskEntry = extern "C" fn(arg: *mut ());

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// Reference to a task that stays safe after the task is gone: the slot
/// index is only honoured while the slot still holds the same `tid`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskHandle {
    pub(crate) slot: usize,
    pub(crate) tid: u32,
}

impl TaskHandle {
    pub fn tid(&self) -> u32 {
        self.tid
    }

    pub fn slot(&self) -> usize {
        self.slot
    }
}

// ---------------------------------------------------------------------------
// Task Control Block
// ---------------------------------------------------------------------------

/// Task Control Block.
///
/// `tid` and the saved stack pointer lead the structure so their offsets
/// are fixed.
#[repr(C)]
pub struct Tcb {
    /// Monotonically assigned identity.
    pub tid: u32,
    /// Saved stack pointer. Valid while the task is not running.
    pub sp: *mut usize,
    pub entry: TaskEntry,
    pub arg: *mut (),
    /// Diagnostic only.
    pub name: &'static str,
    /// Assigned priority. Changed only by `set_priority`.
    pub base_priority: Priority,
    /// Priority the ordered lists sort by; raised by priority inheritance.
    pub priority: Priority,
    pub status: TaskStatus,
    pub residence: Residence,
    /// Task that was running when this one was created.
    pub parent: Option<TaskHandle>,
    /// For a child task: the task blocked in `join` on it.
    pub joiner: Option<TaskHandle>,
    /// Ticks left in the current time slice.
    pub slice_left: u32,
    /// Tick at which a sleeping task becomes ready again.
    pub wake_tick: u64,
    pub ret: ReturnPath,
    pub idle: bool,
    pub(crate) node: ListNode,
    pub(crate) event: ListNode,
    pub(crate) stack: Stack,
}

// Safety: `sp` and `arg` are only dereferenced by the task itself or by
// the trap, and a TCB is only reached through the kernel's critical
// sections.
unsafe impl Send for Tcb {}

/// Everything needed to build a TCB.
pub struct TaskParams {
    pub entry: TaskEntry,
    pub arg: *mut (),
    pub priority: Priority,
    pub name: &'static str,
}

impl Tcb {
    pub(crate) fn new(slot: usize, tid: u32, params: TaskParams, stack: Stack, time_slice: u32) -> Self {
        Tcb {
            tid,
            sp: core::ptr::null_mut(),
            entry: params.entry,
            arg: params.arg,
            name: params.name,
            base_priority: params.priority,
            priority: params.priority,
            status: TaskStatus::Ready,
            residence: Residence::None,
            parent: None,
            joiner: None,
            slice_left: time_slice,
            wake_tick: 0,
            ret: ReturnPath::Terminate,
            idle: false,
            node: ListNode::new(slot),
            event: ListNode::new(slot),
            stack,
        }
    }

    #[inline]
    pub fn stack(&self) -> &Stack {
        &self.stack
    }

    /// Linked into some object's event list (timed queue wait pending).
    #[inline]
    pub fn awaiting_event(&self) -> bool {
        self.event.is_linked()
    }

    /// Runnable: ready or running.
    #[inline]
    pub fn is_runnable(&self) -> bool {
        matches!(self.status, TaskStatus::Ready | TaskStatus::Running)
    }
}

// ---------------------------------------------------------------------------
// Task table
// ---------------------------------------------------------------------------

/// One entry of the task table.
pub enum Slot {
    Free,
    Task(Tcb),
}

/// Fixed-size table of TCBs. The node arena of every kernel list.
pub struct TaskTable {
    slots: [Slot; MAX_TASKS],
}

impl TaskTable {
    pub const fn new() -> Self {
        const FREE: Slot = Slot::Free;
        TaskTable {
            slots: [FREE; MAX_TASKS],
        }
    }

    pub fn get(&self, slot: usize) -> Option<&Tcb> {
        match self.slots.get(slot) {
            Some(Slot::Task(tcb)) => Some(tcb),
            _ => None,
        }
    }

    pub fn get_mut(&mut self, slot: usize) -> Option<&mut Tcb> {
        match self.slots.get_mut(slot) {
            Some(Slot::Task(tcb)) => Some(tcb),
            _ => None,
        }
    }

    /// TCB in `slot`; an empty slot is a kernel bug.
    #[track_caller]
    pub fn tcb(&self, slot: usize) -> &Tcb {
        match self.get(slot) {
            Some(tcb) => tcb,
            None => fatal(format_args!("slot {} holds no task", slot)),
        }
    }

    #[track_caller]
    pub fn tcb_mut(&mut self, slot: usize) -> &mut Tcb {
        match self.get_mut(slot) {
            Some(tcb) => tcb,
            None => fatal(format_args!("slot {} holds no task", slot)),
        }
    }

    /// Slot index of a live handle.
    pub fn resolve(&self, handle: TaskHandle) -> Option<usize> {
        match self.get(handle.slot) {
            Some(tcb) if tcb.tid == handle.tid => Some(handle.slot),
            _ => None,
        }
    }

    pub fn handle(&self, slot: usize) -> TaskHandle {
        TaskHandle {
            slot,
            tid: self.tcb(slot).tid,
        }
    }

    pub fn free_slot(&self) -> Option<usize> {
        self.slots.iter().position(|s| matches!(s, Slot::Free))
    }

    pub(crate) fn install(&mut self, slot: usize, tcb: Tcb) {
        crate::kassert!(matches!(self.slots[slot], Slot::Free), "slot {} in use", slot);
        self.slots[slot] = Slot::Task(tcb);
    }

    /// Empty the slot, handing back the TCB.
    pub(crate) fn take(&mut self, slot: usize) -> Option<Tcb> {
        match core::mem::replace(&mut self.slots[slot], Slot::Free) {
            Slot::Task(tcb) => Some(tcb),
            Slot::Free => None,
        }
    }

    /// Live tasks in slot order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &Tcb)> {
        self.slots.iter().enumerate().filter_map(|(i, s)| match s {
            Slot::Task(tcb) => Some((i, tcb)),
            Slot::Free => None,
        })
    }

    pub fn count(&self) -> usize {
        self.iter().count()
    }
}

impl Default for TaskTable {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeArena for TaskTable {
    fn node(&self, id: usize, hook: Hook) -> &ListNode {
        let tcb = self.tcb(id);
        match hook {
            Hook::Sched => &tcb.node,
            Hook::Event => &tcb.event,
        }
    }

    fn node_mut(&mut self, id: usize, hook: Hook) -> &mut ListNode {
        let tcb = self.tcb_mut(id);
        match hook {
            Hook::Sched => &mut tcb.node,
            Hook::Event => &mut tcb.event,
        }
    }
}

// ---------------------------------------------------------------------------
// List orderings
// ---------------------------------------------------------------------------

/// Ready list and object wait lists: more urgent first.
pub fn by_priority(tasks: &TaskTable, a: usize, b: usize) -> bool {
    tasks.tcb(a).priority.outranks(tasks.tcb(b).priority)
}

/// Sleeping list: earliest wake tick first.
pub fn by_wake_tick(tasks: &TaskTable, a: usize, b: usize) -> bool {
    tasks.tcb(a).wake_tick < tasks.tcb(b).wake_tick
}

/// Queue wait lists: more urgent first, then the earlier timeout.
pub fn by_priority_then_deadline(tasks: &TaskTable, a: usize, b: usize) -> bool {
    let (ta, tb) = (tasks.tcb(a), tasks.tcb(b));
    (ta.priority, ta.wake_tick) < (tb.priority, tb.wake_tick)
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------
