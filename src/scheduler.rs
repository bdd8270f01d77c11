//! # Scheduler
//!
//! Core scheduling logic for KeelOS. [`Kernel`] is the single kernel-state
//! struct: task table, page allocator, the ready / blocked / sleeping
//! lists, the running-task slot and the tick counter. It is plain data
//! with no hardware access, so everything here runs on a host; the global
//! instance and the interrupt plumbing live in `kernel.rs` and `arch/`.
//!
//! ## Queues
//!
//! - `ready`: runnable tasks, priority order, FIFO among equals. The
//!   running task stays in it, at its priority-ordered position.
//! - `blocked`: tasks waiting for an explicit `resume` (and children that
//!   have not been awaited yet). Unordered.
//! - `sleeping`: delayed tasks and timed queue waits, wake-tick order.
//!
//! Tasks waiting on a semaphore, mutex or condition variable sit in that
//! object's own list instead (`Residence::Object`).
//!
//! ## Switching
//!
//! Nothing here switches synchronously. Operations that change who should
//! run set `switch_pending`; the caller pends the trap, and the trap calls
//! [`Kernel::switch_context`], which saves the outgoing stack pointer,
//! applies the policy and hands back the incoming one.

use core::fmt;

use log::{debug, trace, warn};

use crate::arch;
use crate::config::{KernelConfig, SchedPolicy, IDLE_PRIORITY, MAX_TASKS};
use crate::error::{KernelError, OrFatal};
use crate::kassert;
use crate::list::{Hook, List};
use crate::page::{PageAllocator, PagePool, PageRequest};
use crate::task::{
    by_priority, by_priority_then_deadline, by_wake_tick, Priority, Residence, ReturnPath,
    TaskEntry, TaskHandle, TaskParams, TaskStatus, TaskTable, Tcb,
};

/// Timeout value meaning "wait until satisfied".
pub const WAIT_FOREVER: u32 = u32::MAX;

/// Lookup key for [`Kernel::find`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKey<'a> {
    Tid(u32),
    Name(&'a str),
}

impl From<u32> for TaskKey<'_> {
    fn from(tid: u32) -> Self {
        TaskKey::Tid(tid)
    }
}

impl<'a> From<&'a str> for TaskKey<'a> {
    fn from(name: &'a str) -> Self {
        TaskKey::Name(name)
    }
}

/// Ordering of an object's wait list.
pub type WaitOrder = fn(&TaskTable, usize, usize) -> bool;

/// The kernel state.
pub struct Kernel {
    tasks: TaskTable,
    pages: PageAllocator,
    ready: List,
    blocked: List,
    sleeping: List,
    current: Option<usize>,
    ticks: u64,
    next_tid: u32,
    config: KernelConfig,
    switch_pending: bool,
    started: bool,
}

impl Kernel {
    pub const fn new(pool: &'static PagePool, config: KernelConfig) -> Self {
        Kernel {
            tasks: TaskTable::new(),
            pages: PageAllocator::new(pool),
            ready: List::new(Hook::Sched),
            blocked: List::new(Hook::Sched),
            sleeping: List::new(Hook::Sched),
            current: None,
            ticks: 0,
            next_tid: 1,
            config,
            switch_pending: false,
            started: false,
        }
    }

    /// Replace the configuration. Only allowed before `start`.
    pub fn configure(&mut self, config: KernelConfig) -> Result<(), KernelError> {
        if self.started {
            return Err(KernelError::InvalidState);
        }
        self.config = config;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn tasks(&self) -> &TaskTable {
        &self.tasks
    }

    pub fn current(&self) -> Option<TaskHandle> {
        self.current.map(|slot| self.tasks.handle(slot))
    }

    pub(crate) fn current_slot(&self) -> Option<usize> {
        self.current
    }

    /// Slot of the running task. Blocking outside a task is a protocol
    /// violation.
    #[track_caller]
    pub(crate) fn require_current(&self) -> usize {
        self.current.or_fatal("blocking call outside of a task")
    }

    pub fn tcb(&self, handle: TaskHandle) -> Option<&Tcb> {
        self.tasks.resolve(handle).map(|slot| self.tasks.tcb(slot))
    }

    pub fn status(&self, handle: TaskHandle) -> Option<TaskStatus> {
        self.tcb(handle).map(|t| t.status)
    }

    /// Ready list, front to back.
    pub fn ready_tasks(&self) -> impl Iterator<Item = TaskHandle> + '_ {
        self.ready.iter(&self.tasks).map(move |s| self.tasks.handle(s))
    }

    /// Sleeping list, front to back.
    pub fn sleeping_tasks(&self) -> impl Iterator<Item = TaskHandle> + '_ {
        self.sleeping.iter(&self.tasks).map(move |s| self.tasks.handle(s))
    }

    pub fn blocked_tasks(&self) -> impl Iterator<Item = TaskHandle> + '_ {
        self.blocked.iter(&self.tasks).map(move |s| self.tasks.handle(s))
    }

    pub fn switch_requested(&self) -> bool {
        self.switch_pending
    }

    /// Consume a pending switch request.
    pub fn take_switch_request(&mut self) -> bool {
        core::mem::replace(&mut self.switch_pending, false)
    }

    pub fn pages_in_use(&self) -> usize {
        self.pages.pages_in_use()
    }

    /// Diagnostic lookup by tid or name.
    pub fn find<'a>(&self, key: impl Into<TaskKey<'a>>) -> Option<TaskHandle> {
        let key = key.into();
        self.tasks
            .iter()
            .find(|(_, tcb)| match key {
                TaskKey::Tid(tid) => tcb.tid == tid,
                TaskKey::Name(name) => tcb.name == name,
            })
            .map(|(slot, _)| self.tasks.handle(slot))
    }

    // -----------------------------------------------------------------------
    // Creation
    // -----------------------------------------------------------------------

    /// Create a task on a pool page.
    pub fn create(
        &mut self,
        entry: TaskEntry,
        arg: *mut (),
        priority: Priority,
        name: &'static str,
    ) -> Result<TaskHandle, KernelError> {
        let params = TaskParams {
            entry,
            arg,
            priority,
            name,
        };
        self.create_with(params, PageRequest::Pool)
    }

    /// Create a task with an explicit page policy. Yields if the new task
    /// outranks the caller.
    pub fn create_with(&mut self, params: TaskParams, page: PageRequest) -> Result<TaskHandle, KernelError> {
        let slot = self.spawn(params, page, ReturnPath::Terminate)?;
        self.make_ready(slot);
        self.preempt_check();
        Ok(self.tasks.handle(slot))
    }

    /// Interrupt-context creation: never requests a switch. The next tick
    /// notices if the new task should run.
    pub fn create_from_isr(&mut self, params: TaskParams, page: PageRequest) -> Result<TaskHandle, KernelError> {
        let slot = self.spawn(params, page, ReturnPath::Terminate)?;
        self.make_ready(slot);
        Ok(self.tasks.handle(slot))
    }

    /// Create a one-shot child. It is parked in the blocked list until a
    /// parent awaits it, and returns through the join path.
    pub fn create_child(&mut self, params: TaskParams, page: PageRequest) -> Result<TaskHandle, KernelError> {
        let slot = self.spawn(params, page, ReturnPath::JoinParent)?;
        let tcb = self.tasks.tcb_mut(slot);
        tcb.status = TaskStatus::Blocked;
        tcb.residence = Residence::Blocked;
        self.blocked.insert(&mut self.tasks, slot);
        Ok(self.tasks.handle(slot))
    }

    /// Create the idle task. Lowest priority; must never block.
    pub fn create_idle(&mut self, entry: TaskEntry) -> Result<TaskHandle, KernelError> {
        let params = TaskParams {
            entry,
            arg: core::ptr::null_mut(),
            priority: IDLE_PRIORITY,
            name: "idle",
        };
        let slot = self.spawn(params, PageRequest::Pool, ReturnPath::Terminate)?;
        self.tasks.tcb_mut(slot).idle = true;
        self.make_ready(slot);
        Ok(self.tasks.handle(slot))
    }

    fn spawn(&mut self, params: TaskParams, page: PageRequest, ret: ReturnPath) -> Result<usize, KernelError> {
        let Some(slot) = self.tasks.free_slot() else {
            warn!("create '{}': task table full ({} tasks)", params.name, MAX_TASKS);
            return Err(KernelError::TooManyTasks);
        };
        let mut stack = self.pages.allocate(page).map_err(|e| {
            warn!("create '{}': {}", params.name, e);
            e
        })?;
        stack.paint();

        let tid = self.next_tid;
        self.next_tid = self.next_tid.wrapping_add(1);

        let return_to = match ret {
            ReturnPath::Terminate => crate::kernel::task_return as usize,
            ReturnPath::JoinParent => crate::kernel::child_return as usize,
        };
        // Safety: `top` is one past the end of a stack at least
        // MIN_STACK_WORDS long, enough for the frame.
        let sp = unsafe { arch::init_frame(stack.top(), params.entry as usize, params.arg as usize, return_to) };

        let name = params.name;
        let priority = params.priority;
        let mut tcb = Tcb::new(slot, tid, params, stack, self.config.time_slice);
        tcb.sp = sp;
        tcb.ret = ret;
        tcb.parent = self.current();
        self.tasks.install(slot, tcb);

        debug!("created task {} '{}' prio {} in slot {}", tid, name, priority, slot);
        Ok(slot)
    }

    // -----------------------------------------------------------------------
    // List movement
    // -----------------------------------------------------------------------

    /// Take the scheduling node out of whichever kernel list holds it.
    fn detach(&mut self, slot: usize) {
        match self.tasks.tcb(slot).residence {
            Residence::None => {}
            Residence::Ready => self.ready.remove(&mut self.tasks, slot),
            Residence::Blocked => self.blocked.remove(&mut self.tasks, slot),
            Residence::Sleeping => self.sleeping.remove(&mut self.tasks, slot),
            Residence::Object => {
                crate::error::fatal(format_args!("slot {} is parked on an object", slot))
            }
        }
        self.tasks.tcb_mut(slot).residence = Residence::None;
    }

    /// Put a task into the ready list at its priority position. A task
    /// that is already runnable stays where it is.
    fn make_ready(&mut self, slot: usize) {
        if self.tasks.tcb(slot).is_runnable() && self.tasks.tcb(slot).residence == Residence::Ready {
            return;
        }
        self.detach(slot);
        let tcb = self.tasks.tcb_mut(slot);
        tcb.status = TaskStatus::Ready;
        tcb.residence = Residence::Ready;
        self.ready.insert_in_order(&mut self.tasks, slot, by_priority);
    }

    fn request_switch(&mut self) {
        if self.started {
            self.switch_pending = true;
        }
    }

    /// Whether the ready list has someone who should displace the running
    /// task right now.
    fn should_preempt(&self) -> bool {
        let Some(cur) = self.current else {
            return !self.ready.is_empty();
        };
        let tcb = self.tasks.tcb(cur);
        if tcb.status != TaskStatus::Running {
            return true;
        }
        let Some(head) = self.ready.head() else {
            return false;
        };
        if head == cur {
            return false;
        }
        if tcb.idle {
            return true;
        }
        match self.config.policy {
            SchedPolicy::RoundRobin => false,
            SchedPolicy::Preemptive => self.tasks.tcb(head).priority.outranks(tcb.priority),
        }
    }

    fn preempt_check(&mut self) {
        if self.should_preempt() {
            self.request_switch();
        }
    }

    // -----------------------------------------------------------------------
    // Block / resume
    // -----------------------------------------------------------------------

    /// Move a runnable task to the blocked list. It stays there until
    /// [`Kernel::resume`].
    pub fn block(&mut self, handle: TaskHandle) -> Result<(), KernelError> {
        let slot = self.tasks.resolve(handle).ok_or(KernelError::NoSuchTask)?;
        let tcb = self.tasks.tcb(slot);
        if !tcb.is_runnable() {
            return Err(KernelError::InvalidState);
        }
        kassert!(!tcb.idle, "idle task cannot block");

        self.detach(slot);
        let tcb = self.tasks.tcb_mut(slot);
        tcb.status = TaskStatus::Blocked;
        tcb.residence = Residence::Blocked;
        self.blocked.insert(&mut self.tasks, slot);
        trace!("task {} blocked", handle.tid);

        if Some(slot) == self.current {
            self.request_switch();
        }
        Ok(())
    }

    /// Make a blocked or sleeping task ready; yields if it outranks the
    /// running task.
    pub fn resume(&mut self, handle: TaskHandle) -> Result<(), KernelError> {
        self.resume_inner(handle)?;
        self.preempt_check();
        Ok(())
    }

    /// Interrupt-context resume: never requests a switch.
    pub fn resume_from_isr(&mut self, handle: TaskHandle) -> Result<(), KernelError> {
        self.resume_inner(handle)
    }

    fn resume_inner(&mut self, handle: TaskHandle) -> Result<(), KernelError> {
        let slot = self.tasks.resolve(handle).ok_or(KernelError::NoSuchTask)?;
        let tcb = self.tasks.tcb(slot);
        if tcb.status != TaskStatus::Blocked {
            return Err(KernelError::InvalidState);
        }
        if tcb.residence == Residence::Object || tcb.awaiting_event() {
            return Err(KernelError::WaitingOnObject);
        }
        self.make_ready(slot);
        trace!("task {} resumed", handle.tid);
        Ok(())
    }

    /// Sleep the running task for `ticks` ticks. `delay(0)` is a yield.
    pub fn delay(&mut self, ticks: u32) {
        if ticks == 0 {
            self.yield_current();
            return;
        }
        let cur = self.require_current();
        kassert!(!self.tasks.tcb(cur).idle, "idle task cannot sleep");

        self.detach(cur);
        let wake = self.ticks + u64::from(ticks);
        let tcb = self.tasks.tcb_mut(cur);
        tcb.status = TaskStatus::Blocked;
        tcb.wake_tick = wake;
        tcb.residence = Residence::Sleeping;
        self.sleeping.insert_in_order(&mut self.tasks, cur, by_wake_tick);
        trace!("task {} sleeps until tick {}", tcb_tid(&self.tasks, cur), wake);
        self.request_switch();
    }

    /// Give up the rest of the time slice.
    pub fn yield_current(&mut self) {
        if let Some(cur) = self.current {
            self.tasks.tcb_mut(cur).slice_left = 0;
            self.request_switch();
        }
    }

    /// Change a task's assigned priority.
    pub fn set_priority(&mut self, handle: TaskHandle, priority: Priority) -> Result<(), KernelError> {
        let slot = self.tasks.resolve(handle).ok_or(KernelError::NoSuchTask)?;
        let tcb = self.tasks.tcb_mut(slot);
        let inherited = tcb.priority != tcb.base_priority;
        tcb.base_priority = priority;
        let effective = if inherited && tcb.priority.outranks(priority) {
            tcb.priority
        } else {
            priority
        };
        self.set_effective_priority(slot, effective);
        Ok(())
    }

    /// Change the priority the ordered lists see. Repositions the task in
    /// the ready list; object wait lists are ordered by the object.
    pub(crate) fn set_effective_priority(&mut self, slot: usize, priority: Priority) {
        let tcb = self.tasks.tcb_mut(slot);
        if tcb.priority == priority {
            return;
        }
        tcb.priority = priority;
        if tcb.residence == Residence::Ready {
            self.ready.remove(&mut self.tasks, slot);
            self.ready.insert_in_order(&mut self.tasks, slot, by_priority);
        }
        self.preempt_check();
    }

    // -----------------------------------------------------------------------
    // Object wait lists
    // -----------------------------------------------------------------------

    /// Recompute the effective priority of every task on an object's wait
    /// list. The list's own order is the object's business.
    pub(crate) fn reprioritize_waiters(&mut self, list: &List, f: impl Fn(&Tcb) -> Priority) {
        let mut at = list.head();
        while let Some(slot) = at {
            at = list.next_of(&self.tasks, slot);
            let tcb = self.tasks.tcb_mut(slot);
            let priority = f(tcb);
            tcb.priority = priority;
        }
    }

    /// Park the running task on an object's wait list.
    pub(crate) fn park_current(&mut self, list: &mut List, order: WaitOrder) -> usize {
        let cur = self.require_current();
        kassert!(!self.tasks.tcb(cur).idle, "idle task cannot wait");

        self.detach(cur);
        let tcb = self.tasks.tcb_mut(cur);
        tcb.status = TaskStatus::Blocked;
        tcb.residence = Residence::Object;
        list.insert_in_order(&mut self.tasks, cur, order);
        trace!("task {} parked", tcb_tid(&self.tasks, cur));
        self.request_switch();
        cur
    }

    /// Wake the head of an object's wait list.
    pub(crate) fn unpark(&mut self, list: &mut List, may_yield: bool) -> Option<usize> {
        let slot = list.pop_front(&mut self.tasks)?;
        self.tasks.tcb_mut(slot).residence = Residence::None;
        self.make_ready(slot);
        trace!("task {} unparked", tcb_tid(&self.tasks, slot));
        if may_yield {
            self.preempt_check();
        }
        Some(slot)
    }

    /// Park the running task on an event list with a timeout. The
    /// scheduling node goes to the sleeping list (or the blocked list for
    /// `WAIT_FOREVER`); the event node marks the pending wait.
    pub(crate) fn park_current_timed(&mut self, events: &mut List, timeout: u32) -> usize {
        kassert!(events.hook() == Hook::Event, "event list expected");
        kassert!(timeout > 0, "zero timeout never parks");
        let cur = self.require_current();
        kassert!(!self.tasks.tcb(cur).idle, "idle task cannot wait");

        self.detach(cur);
        let forever = timeout == WAIT_FOREVER;
        let wake = if forever { u64::MAX } else { self.ticks + u64::from(timeout) };
        let tcb = self.tasks.tcb_mut(cur);
        tcb.status = TaskStatus::Blocked;
        tcb.wake_tick = wake;
        events.insert_in_order(&mut self.tasks, cur, by_priority_then_deadline);
        if forever {
            self.tasks.tcb_mut(cur).residence = Residence::Blocked;
            self.blocked.insert(&mut self.tasks, cur);
        } else {
            self.tasks.tcb_mut(cur).residence = Residence::Sleeping;
            self.sleeping.insert_in_order(&mut self.tasks, cur, by_wake_tick);
        }
        self.request_switch();
        cur
    }

    /// Satisfy the head of an event list: unlink its event node and make
    /// it ready.
    pub(crate) fn unpark_event(&mut self, events: &mut List, may_yield: bool) -> Option<usize> {
        let slot = events.pop_front(&mut self.tasks)?;
        self.make_ready(slot);
        if may_yield {
            self.preempt_check();
        }
        Some(slot)
    }

    /// Called by a task back from a timed wait. Returns `true` when the
    /// wait timed out (the event node was still linked); the node is
    /// unlinked either way.
    pub(crate) fn withdraw_event(&mut self, events: &mut List, slot: usize) -> bool {
        if self.tasks.tcb(slot).awaiting_event() {
            events.remove(&mut self.tasks, slot);
            true
        } else {
            false
        }
    }

    // -----------------------------------------------------------------------
    // Termination
    // -----------------------------------------------------------------------

    /// Tear a task down. The running task stays in its slot, marked
    /// `Terminated`, until the trap has switched away from its stack.
    pub fn terminate(&mut self, handle: TaskHandle) -> Result<(), KernelError> {
        let slot = self.tasks.resolve(handle).ok_or(KernelError::NoSuchTask)?;
        let tcb = self.tasks.tcb(slot);
        if tcb.status == TaskStatus::Terminated {
            return Err(KernelError::InvalidState);
        }
        if tcb.residence == Residence::Object || tcb.awaiting_event() {
            return Err(KernelError::WaitingOnObject);
        }
        kassert!(!tcb.idle, "idle task cannot terminate");

        self.detach(slot);
        self.tasks.tcb_mut(slot).status = TaskStatus::Terminated;
        self.release_joiner(slot);
        debug!("task {} '{}' terminated", handle.tid, self.tasks.tcb(slot).name);

        if Some(slot) == self.current {
            self.request_switch();
        } else {
            self.reclaim(slot);
            self.preempt_check();
        }
        Ok(())
    }

    /// Terminate the running task.
    pub fn terminate_current(&mut self) -> Result<(), KernelError> {
        let cur = self.current.ok_or(KernelError::NotStarted)?;
        self.terminate(self.tasks.handle(cur))
    }

    /// Return path of a child task: wake the parent that awaited it and
    /// tear down.
    pub fn finish_child(&mut self) -> Result<(), KernelError> {
        let cur = self.current.ok_or(KernelError::NotStarted)?;
        let tcb = self.tasks.tcb(cur);
        kassert!(tcb.ret == ReturnPath::JoinParent, "task {} is not a child", tcb.tid);
        self.terminate(self.tasks.handle(cur))
    }

    /// A finishing child wakes the task blocked in `join` on it, if any.
    fn release_joiner(&mut self, slot: usize) {
        let Some(joiner) = self.tasks.tcb_mut(slot).joiner.take() else {
            return;
        };
        let Some(waiter) = self.tasks.resolve(joiner) else {
            return;
        };
        let w = self.tasks.tcb(waiter);
        if w.status == TaskStatus::Blocked && w.residence == Residence::Blocked && !w.awaiting_event() {
            self.make_ready(waiter);
        }
    }

    fn reclaim(&mut self, slot: usize) {
        if let Some(tcb) = self.tasks.take(slot) {
            self.pages.release(tcb.stack);
        }
    }

    // -----------------------------------------------------------------------
    // Child tasks
    // -----------------------------------------------------------------------

    /// Start a child created by [`Kernel::create_child`] and block the
    /// running task until the child returns.
    pub fn await_child(&mut self, child: TaskHandle) -> Result<(), KernelError> {
        let cur = self.current.ok_or(KernelError::NotStarted)?;
        let slot = self.tasks.resolve(child).ok_or(KernelError::NoSuchTask)?;
        let tcb = self.tasks.tcb(slot);
        if tcb.ret != ReturnPath::JoinParent
            || tcb.status != TaskStatus::Blocked
            || tcb.residence != Residence::Blocked
        {
            return Err(KernelError::InvalidState);
        }

        if tcb.joiner.is_some() {
            return Err(KernelError::InvalidState);
        }

        self.tasks.tcb_mut(slot).joiner = Some(self.tasks.handle(cur));
        self.make_ready(slot);
        self.block(self.tasks.handle(cur))
    }

    // -----------------------------------------------------------------------
    // Tick service
    // -----------------------------------------------------------------------

    /// Timer interrupt entry: advance time, wake due sleepers, charge the
    /// running task's slice. Returns whether a switch is pending.
    pub fn tick(&mut self) -> bool {
        self.ticks += 1;

        while let Some(head) = self.sleeping.head() {
            if self.tasks.tcb(head).wake_tick > self.ticks {
                break;
            }
            self.make_ready(head);
            trace!("task {} woke at tick {}", tcb_tid(&self.tasks, head), self.ticks);
        }

        if let Some(cur) = self.current {
            let time_slice = self.config.time_slice;
            let tcb = self.tasks.tcb_mut(cur);
            if tcb.status == TaskStatus::Running && time_slice > 0 {
                tcb.slice_left = tcb.slice_left.saturating_sub(1);
                if tcb.slice_left == 0 {
                    self.request_switch();
                }
            }
        }

        self.preempt_check();
        self.switch_pending
    }

    // -----------------------------------------------------------------------
    // Dispatch
    // -----------------------------------------------------------------------

    /// Mark the scheduler started and pick the first task. Returns its
    /// stack pointer.
    pub fn start(&mut self) -> Result<*mut usize, KernelError> {
        if self.started {
            return Err(KernelError::InvalidState);
        }
        if self.ready.is_empty() {
            return Err(KernelError::NotStarted);
        }
        self.started = true;
        let next = self.pick_next().or_fatal("ready list empty at start");
        debug!("scheduler started with task {}", tcb_tid(&self.tasks, next));
        Ok(self.tasks.tcb(next).sp)
    }

    /// Decide who runs next and make it current.
    pub(crate) fn pick_next(&mut self) -> Option<usize> {
        if let Some(cur) = self.current {
            match self.tasks.tcb(cur).status {
                TaskStatus::Running => {
                    if self.tasks.tcb(cur).slice_left == 0 {
                        // Rotate behind the equal-priority peers.
                        self.ready.remove(&mut self.tasks, cur);
                        let tcb = self.tasks.tcb_mut(cur);
                        tcb.status = TaskStatus::Ready;
                        tcb.slice_left = self.config.time_slice;
                        self.ready.insert_in_order(&mut self.tasks, cur, by_priority);
                    } else if !self.should_preempt() {
                        return Some(cur);
                    } else {
                        self.tasks.tcb_mut(cur).status = TaskStatus::Ready;
                    }
                }
                TaskStatus::Terminated => {
                    self.current = None;
                    self.reclaim(cur);
                }
                TaskStatus::Ready | TaskStatus::Blocked => {}
            }
        }

        let next = self.ready.head();
        self.current = next;
        if let Some(n) = next {
            let time_slice = self.config.time_slice;
            let tcb = self.tasks.tcb_mut(n);
            tcb.status = TaskStatus::Running;
            if tcb.slice_left == 0 {
                tcb.slice_left = time_slice;
            }
        }
        next
    }

    /// Trap entry: save the outgoing stack pointer, pick the next task and
    /// return its stack pointer.
    pub fn switch_context(&mut self, saved_sp: *mut usize) -> *mut usize {
        self.switch_pending = false;

        if let Some(cur) = self.current {
            let tcb = self.tasks.tcb_mut(cur);
            kassert!(
                tcb.stack.contains(saved_sp),
                "task {} '{}' overflowed its stack",
                tcb.tid,
                tcb.name
            );
            tcb.sp = saved_sp;
        }

        let prev = self.current;
        match self.pick_next() {
            Some(next) => {
                if prev != Some(next) {
                    trace!("switch to task {}", tcb_tid(&self.tasks, next));
                }
                self.tasks.tcb(next).sp
            }
            None => saved_sp,
        }
    }

    // -----------------------------------------------------------------------
    // Introspection
    // -----------------------------------------------------------------------

    /// Copy of every task's status line, in slot order.
    pub fn snapshot(&self) -> TaskTableSnapshot {
        let mut rows = [None; MAX_TASKS];
        for (row, (_, tcb)) in rows.iter_mut().zip(self.tasks.iter()) {
            *row = Some(TaskRow {
                tid: tcb.tid,
                name: tcb.name,
                priority: tcb.priority,
                base_priority: tcb.base_priority,
                status: tcb.status,
                stack_percent: tcb.stack.usage_percent(),
            });
        }
        TaskTableSnapshot { rows }
    }

    /// `ls`-style status table.
    pub fn dump(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        self.snapshot().write_to(out)
    }

    /// Check every structural invariant: list rings, orderings, and that
    /// each task's status and residence agree with list membership.
    pub fn is_consistent(&self) -> bool {
        let lists = [&self.ready, &self.blocked, &self.sleeping];
        if !lists.iter().all(|l| l.is_consistent(&self.tasks)) {
            return false;
        }

        let ordered = |list: &List, before: WaitOrder| {
            let mut prev: Option<usize> = None;
            list.iter(&self.tasks).all(|s| {
                let ok = prev.map_or(true, |p| !before(&self.tasks, s, p));
                prev = Some(s);
                ok
            })
        };
        if !ordered(&self.ready, by_priority) || !ordered(&self.sleeping, by_wake_tick) {
            return false;
        }

        let mut running = 0;
        for (slot, tcb) in self.tasks.iter() {
            let in_ready = self.ready.contains(&self.tasks, slot);
            let in_blocked = self.blocked.contains(&self.tasks, slot);
            let in_sleeping = self.sleeping.contains(&self.tasks, slot);
            let memberships = [in_ready, in_blocked, in_sleeping].iter().filter(|m| **m).count();

            let ok = match tcb.residence {
                Residence::Ready => in_ready && tcb.is_runnable(),
                Residence::Blocked => in_blocked && tcb.status == TaskStatus::Blocked,
                Residence::Sleeping => in_sleeping && tcb.status == TaskStatus::Blocked,
                Residence::Object => memberships == 0 && tcb.status == TaskStatus::Blocked,
                Residence::None => memberships == 0 && tcb.status == TaskStatus::Terminated,
            };
            if !ok || memberships > 1 {
                return false;
            }
            if tcb.status == TaskStatus::Running {
                running += 1;
                if self.current != Some(slot) {
                    return false;
                }
            }
        }
        running <= 1
    }
}

// ---------------------------------------------------------------------------
// Status table
// ---------------------------------------------------------------------------

/// One line of the status table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskRow {
    pub tid: u32,
    pub name: &'static str,
    pub priority: Priority,
    pub base_priority: Priority,
    pub status: TaskStatus,
    pub stack_percent: usize,
}

/// The task table as it was at one instant. Taken with interrupts
/// disabled, written out after they are back on.
#[derive(Debug, Clone, Copy)]
pub struct TaskTableSnapshot {
    rows: [Option<TaskRow>; MAX_TASKS],
}

impl TaskTableSnapshot {
    pub fn rows(&self) -> impl Iterator<Item = &TaskRow> {
        self.rows.iter().flatten()
    }

    pub fn write_to(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        writeln!(out, "{:>4}  {:<12} {:>7}  {:<8} {:>5}", "TID", "NAME", "PRI", "STATUS", "STACK")?;
        for row in self.rows() {
            writeln!(
                out,
                "{:>4}  {:<12} {:>3}/{:<3}  {:<8} {:>4}%",
                row.tid,
                row.name,
                row.priority,
                row.base_priority,
                row.status.as_str(),
                row.stack_percent
            )?;
        }
        Ok(())
    }
}

fn tcb_tid(tasks: &TaskTable, slot: usize) -> u32 {
    tasks.tcb(slot).tid
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::arch::host::SimCpu;
    use crate::config::{PAGE_WORDS, STACK_PAINT};
    use crate::page::PageSource;
    use std::boxed::Box;
    use std::string::String;
    use std::vec::Vec;

    pub(crate) extern "C" fn nop(_: *mut ()) {}

    pub(crate) fn kernel(policy: SchedPolicy) -> Box<Kernel> {
        let pool: &'static PagePool = Box::leak(Box::new(PagePool::new()));
        let config = KernelConfig::DEFAULT.with_policy(policy).with_time_slice(3);
        Box::new(Kernel::new(pool, config))
    }

    pub(crate) fn spawn(k: &mut Kernel, prio: u8, name: &'static str) -> TaskHandle {
        k.create(nop, core::ptr::null_mut(), Priority::new(prio), name).unwrap()
    }

    pub(crate) fn ready_names(k: &Kernel) -> Vec<&'static str> {
        k.ready_tasks().map(|h| k.tcb(h).unwrap().name).collect()
    }

    pub(crate) fn current_name(k: &Kernel) -> &'static str {
        k.tcb(k.current().unwrap()).unwrap().name
    }

    #[test]
    fn test_ready_order_is_priority_then_fifo() {
        let mut k = kernel(SchedPolicy::RoundRobin);
        spawn(&mut k, 5, "five");
        spawn(&mut k, 3, "three-a");
        spawn(&mut k, 3, "three-b");
        assert_eq!(ready_names(&k), ["three-a", "three-b", "five"]);
        assert!(k.is_consistent());
    }

    #[test]
    fn test_round_robin_rotates_within_priority_group() {
        let mut k = kernel(SchedPolicy::RoundRobin);
        spawn(&mut k, 5, "five");
        spawn(&mut k, 3, "three-a");
        spawn(&mut k, 3, "three-b");
        let mut cpu = SimCpu::new();
        cpu.boot(&mut k);
        assert_eq!(current_name(&k), "three-a");

        let mut seen = Vec::new();
        for _ in 0..30 {
            if k.tick() {
                cpu.trap(&mut k);
            }
            seen.push(current_name(&k));
            assert!(k.is_consistent());
        }
        assert!(seen.contains(&"three-b"));
        assert!(seen.contains(&"three-a"));
        assert!(!seen.contains(&"five"));

        // five only runs once both threes are gone
        let a = k.find("three-a").unwrap();
        let b = k.find("three-b").unwrap();
        k.terminate(a).unwrap();
        k.terminate(b).unwrap();
        cpu.trap(&mut k);
        assert_eq!(current_name(&k), "five");
        assert!(k.is_consistent());
    }

    #[test]
    fn test_round_robin_does_not_preempt_before_slice_expires() {
        let mut k = kernel(SchedPolicy::RoundRobin);
        spawn(&mut k, 5, "low");
        let mut cpu = SimCpu::new();
        cpu.boot(&mut k);

        spawn(&mut k, 1, "high");
        assert!(!k.switch_requested());
        assert_eq!(current_name(&k), "low");

        // slice is 3 ticks
        k.tick();
        k.tick();
        assert!(k.tick());
        cpu.trap(&mut k);
        assert_eq!(current_name(&k), "high");
    }

    #[test]
    fn test_preemptive_policy_switches_immediately() {
        let mut k = kernel(SchedPolicy::Preemptive);
        spawn(&mut k, 5, "low");
        let mut cpu = SimCpu::new();
        cpu.boot(&mut k);

        spawn(&mut k, 1, "high");
        assert!(k.switch_requested());
        cpu.trap(&mut k);
        assert_eq!(current_name(&k), "high");
        assert_eq!(k.status(k.find("low").unwrap()), Some(TaskStatus::Ready));
        assert!(k.is_consistent());
    }

    #[test]
    fn test_preemptive_equal_priority_waits_for_slice() {
        let mut k = kernel(SchedPolicy::Preemptive);
        spawn(&mut k, 4, "a");
        let mut cpu = SimCpu::new();
        cpu.boot(&mut k);
        spawn(&mut k, 4, "b");
        assert!(!k.switch_requested());

        assert!(!k.tick());
        assert!(!k.tick());
        assert!(k.tick());
        cpu.trap(&mut k);
        assert_eq!(current_name(&k), "b");
        assert_eq!(ready_names(&k), ["b", "a"]);
    }

    #[test]
    fn test_yield_rotates_to_peer() {
        let mut k = kernel(SchedPolicy::Preemptive);
        spawn(&mut k, 4, "a");
        spawn(&mut k, 4, "b");
        let mut cpu = SimCpu::new();
        cpu.boot(&mut k);
        assert_eq!(current_name(&k), "a");

        k.yield_current();
        assert!(k.switch_requested());
        cpu.trap(&mut k);
        assert_eq!(current_name(&k), "b");
    }

    #[test]
    fn test_block_and_resume() {
        let mut k = kernel(SchedPolicy::Preemptive);
        let a = spawn(&mut k, 2, "a");
        let b = spawn(&mut k, 4, "b");
        let mut cpu = SimCpu::new();
        cpu.boot(&mut k);

        k.block(a).unwrap();
        assert!(k.switch_requested());
        assert_eq!(k.status(a), Some(TaskStatus::Blocked));
        assert!(k.is_consistent());
        cpu.trap(&mut k);
        assert_eq!(k.current(), Some(b));

        assert_eq!(k.block(a), Err(KernelError::InvalidState));
        k.resume(a).unwrap();
        assert!(k.switch_requested());
        cpu.trap(&mut k);
        assert_eq!(k.current(), Some(a));
        assert_eq!(k.resume(a), Err(KernelError::InvalidState));
        assert!(k.is_consistent());
    }

    #[test]
    fn test_resume_from_isr_defers_switch() {
        let mut k = kernel(SchedPolicy::Preemptive);
        let a = spawn(&mut k, 2, "a");
        spawn(&mut k, 4, "b");
        let mut cpu = SimCpu::new();
        cpu.boot(&mut k);
        k.block(a).unwrap();
        cpu.trap(&mut k);

        k.resume_from_isr(a).unwrap();
        assert!(!k.switch_requested());
        assert!(k.tick());
        cpu.trap(&mut k);
        assert_eq!(k.current(), Some(a));
    }

    #[test]
    fn test_delay_wakes_at_deadline() {
        let mut k = kernel(SchedPolicy::Preemptive);
        let sleeper = spawn(&mut k, 1, "sleeper");
        spawn(&mut k, 5, "other");
        let mut cpu = SimCpu::new();
        cpu.boot(&mut k);

        let start = k.ticks();
        k.delay(100);
        cpu.trap(&mut k);
        assert_eq!(current_name(&k), "other");

        for _ in 0..99 {
            k.tick();
            assert!(!k.ready_tasks().any(|h| h == sleeper));
            assert!(k.is_consistent());
            cpu.trap(&mut k);
        }
        k.tick();
        assert_eq!(k.ticks(), start + 100);
        assert_eq!(ready_names(&k), ["sleeper", "other"]);
        assert!(k.switch_requested());
        cpu.trap(&mut k);
        assert_eq!(k.current(), Some(sleeper));
    }

    #[test]
    fn test_sleeping_list_sorted_by_wake_tick() {
        let mut k = kernel(SchedPolicy::Preemptive);
        spawn(&mut k, 1, "a");
        spawn(&mut k, 2, "b");
        spawn(&mut k, 3, "c");
        spawn(&mut k, 9, "rest");
        let mut cpu = SimCpu::new();
        cpu.boot(&mut k);

        for d in [30, 10, 20] {
            k.delay(d);
            cpu.trap(&mut k);
        }
        let order: Vec<_> = k.sleeping_tasks().map(|h| k.tcb(h).unwrap().name).collect();
        assert_eq!(order, ["b", "c", "a"]);
        assert!(k.is_consistent());
    }

    #[test]
    fn test_create_limits() {
        let mut k = kernel(SchedPolicy::Preemptive);
        for _ in 0..MAX_TASKS {
            spawn(&mut k, 3, "t");
        }
        assert_eq!(
            k.create(nop, core::ptr::null_mut(), Priority::new(3), "x"),
            Err(KernelError::TooManyTasks)
        );
    }

    #[test]
    fn test_static_stack_takes_no_pool_page() {
        let mut k = kernel(SchedPolicy::Preemptive);
        let mem: &'static mut [usize] = Box::leak(std::vec![0usize; 64].into_boxed_slice());
        let params = TaskParams {
            entry: nop,
            arg: core::ptr::null_mut(),
            priority: Priority::new(3),
            name: "static",
        };
        let h = k.create_with(params, PageRequest::Static(mem)).unwrap();
        assert_eq!(k.tcb(h).unwrap().stack().source(), PageSource::Static);
        assert_eq!(k.pages_in_use(), 0);
    }

    #[test]
    fn test_terminate_other_task_reclaims_page() {
        let mut k = kernel(SchedPolicy::Preemptive);
        let a = spawn(&mut k, 3, "a");
        spawn(&mut k, 3, "b");
        assert_eq!(k.pages_in_use(), 2);
        k.terminate(a).unwrap();
        assert_eq!(k.pages_in_use(), 1);
        assert!(k.tcb(a).is_none());
        assert_eq!(k.terminate(a), Err(KernelError::NoSuchTask));
        assert!(k.is_consistent());
    }

    #[test]
    fn test_terminate_current_defers_reclaim_to_trap() {
        let mut k = kernel(SchedPolicy::Preemptive);
        let a = spawn(&mut k, 3, "a");
        spawn(&mut k, 4, "b");
        let mut cpu = SimCpu::new();
        cpu.boot(&mut k);

        k.terminate_current().unwrap();
        assert_eq!(k.status(a), Some(TaskStatus::Terminated));
        assert_eq!(k.pages_in_use(), 2);
        assert!(k.is_consistent());

        cpu.trap(&mut k);
        assert_eq!(current_name(&k), "b");
        assert!(k.tcb(a).is_none());
        assert_eq!(k.pages_in_use(), 1);
    }

    #[test]
    fn test_tids_are_monotonic_and_findable() {
        let mut k = kernel(SchedPolicy::Preemptive);
        let a = spawn(&mut k, 3, "a");
        k.terminate(a).unwrap();
        let b = spawn(&mut k, 3, "b");
        assert_eq!(b.slot(), a.slot());
        assert!(b.tid() > a.tid());
        assert_eq!(k.find(b.tid()), Some(b));
        assert_eq!(k.find("b"), Some(b));
        assert_eq!(k.find("a"), None);
    }

    #[test]
    fn test_initial_frame_and_stack_paint() {
        let mut k = kernel(SchedPolicy::Preemptive);
        let h = spawn(&mut k, 3, "a");
        let tcb = k.tcb(h).unwrap();
        let stack = tcb.stack();
        assert!(stack.contains(tcb.sp));
        assert_eq!(stack.high_water(), arch::FRAME_WORDS);
        let frame = unsafe { core::slice::from_raw_parts(tcb.sp, arch::FRAME_WORDS) };
        assert_eq!(frame[arch::frame::PC], (nop as usize) & !1);
        assert_eq!(frame[arch::frame::LR], crate::kernel::task_return as usize);
        assert_eq!(unsafe { stack.base().read() }, STACK_PAINT);
        assert_eq!(stack.words(), PAGE_WORDS);
    }

    #[test]
    fn test_set_priority_repositions() {
        let mut k = kernel(SchedPolicy::Preemptive);
        let a = spawn(&mut k, 3, "a");
        spawn(&mut k, 4, "b");
        k.set_priority(a, Priority::new(6)).unwrap();
        assert_eq!(ready_names(&k), ["b", "a"]);
        assert_eq!(k.tcb(a).unwrap().base_priority, Priority::new(6));
        assert!(k.is_consistent());
    }

    #[test]
    fn test_idle_gives_way_under_round_robin() {
        let mut k = kernel(SchedPolicy::RoundRobin);
        k.create_idle(nop).unwrap();
        let mut cpu = SimCpu::new();
        cpu.boot(&mut k);
        assert_eq!(current_name(&k), "idle");

        spawn(&mut k, 3, "work");
        assert!(k.switch_requested());
        cpu.trap(&mut k);
        assert_eq!(current_name(&k), "work");
    }

    #[test]
    fn test_start_requires_a_task() {
        let mut k = kernel(SchedPolicy::Preemptive);
        assert_eq!(k.start(), Err(KernelError::NotStarted));
        spawn(&mut k, 3, "a");
        assert!(k.start().is_ok());
        assert_eq!(k.start(), Err(KernelError::InvalidState));
        assert_eq!(k.configure(KernelConfig::DEFAULT), Err(KernelError::InvalidState));
    }

    #[test]
    #[should_panic(expected = "overflowed its stack")]
    fn test_stack_overflow_is_fatal() {
        let mut k = kernel(SchedPolicy::Preemptive);
        spawn(&mut k, 3, "a");
        k.start().unwrap();
        k.switch_context(core::ptr::null_mut());
    }

    #[test]
    #[should_panic(expected = "outside of a task")]
    fn test_delay_before_start_is_fatal() {
        let mut k = kernel(SchedPolicy::Preemptive);
        k.delay(5);
    }

    #[test]
    fn test_dump_lists_every_task() {
        let mut k = kernel(SchedPolicy::Preemptive);
        spawn(&mut k, 3, "alpha");
        spawn(&mut k, 7, "beta");
        let mut out = String::new();
        k.dump(&mut out).unwrap();
        let lines: Vec<_> = out.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].contains("STATUS"));
        assert!(lines[1].contains("alpha") && lines[1].contains("ready"));
        assert!(lines[2].contains("beta") && lines[2].contains("  7/7"));
        assert!(lines[2].ends_with('%'));
    }
}
