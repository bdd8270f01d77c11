//! # Message Queue
//!
//! Bounded FIFO of `N` messages with timed blocking on both ends.
//!
//! Waiting senders and receivers sit on two event lists (the task's event
//! node), ordered by priority and then by deadline. While it waits, the
//! task's scheduling node is in the sleeping list (finite timeout) or the
//! blocked list (`WAIT_FOREVER`), so the tick wakes it if nobody else
//! does.
//!
//! A counterpart that makes progress pops the head waiter off the event
//! list and makes it ready. A waiter that runs again therefore knows why:
//! event node unlinked means it was served, still linked means the timeout
//! hit first.

use core::cell::{RefCell, RefMut};
use core::fmt;

use critical_section::Mutex as CsMutex;

use crate::critical::{critical_section, CriticalSection};
use crate::kernel;
use crate::list::{Hook, List};
use crate::scheduler::{Kernel, WAIT_FOREVER};

/// Send failure. The message comes back to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendError<T> {
    /// Full and the caller would not wait.
    Full(T),
    /// Still full when the timeout expired.
    Timeout(T),
}

impl<T> SendError<T> {
    pub fn into_inner(self) -> T {
        match self {
            SendError::Full(msg) | SendError::Timeout(msg) => msg,
        }
    }
}

impl<T> fmt::Display for SendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SendError::Full(_) => f.write_str("queue full"),
            SendError::Timeout(_) => f.write_str("send timed out"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvError {
    /// Empty and the caller would not wait.
    Empty,
    /// Still empty when the timeout expired.
    Timeout,
}

impl fmt::Display for RecvError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecvError::Empty => f.write_str("queue empty"),
            RecvError::Timeout => f.write_str("receive timed out"),
        }
    }
}

/// Which end of the queue a task waits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Sender,
    Receiver,
}

struct QueueState<T, const N: usize> {
    slots: [Option<T>; N],
    head: usize,
    len: usize,
    senders: List,
    receivers: List,
}

impl<T, const N: usize> QueueState<T, N> {
    fn push(&mut self, msg: T) {
        let tail = (self.head + self.len) % N;
        self.slots[tail] = Some(msg);
        self.len += 1;
    }

    fn pop(&mut self) -> Option<T> {
        if self.len == 0 {
            return None;
        }
        let msg = self.slots[self.head].take();
        self.head = (self.head + 1) % N;
        self.len -= 1;
        msg
    }

    fn waiters(&mut self, side: Side) -> &mut List {
        match side {
            Side::Sender => &mut self.senders,
            Side::Receiver => &mut self.receivers,
        }
    }
}

pub struct MessageQueue<T, const N: usize> {
    state: CsMutex<RefCell<QueueState<T, N>>>,
}

enum SendStep<T> {
    Done,
    Failed(SendError<T>),
    Parked(T),
}

enum RecvStep<T> {
    Done(T),
    Failed(RecvError),
    Parked,
}

impl<T, const N: usize> MessageQueue<T, N> {
    pub const fn new() -> Self {
        assert!(N > 0, "queue capacity must be non-zero");
        MessageQueue {
            state: CsMutex::new(RefCell::new(QueueState {
                slots: [const { None }; N],
                head: 0,
                len: 0,
                senders: List::new(Hook::Event),
                receivers: List::new(Hook::Event),
            })),
        }
    }

    fn state<'cs>(&'cs self, cs: CriticalSection<'cs>) -> RefMut<'cs, QueueState<T, N>> {
        self.state.borrow_ref_mut(cs)
    }

    pub const fn capacity(&self) -> usize {
        N
    }

    pub fn len(&self) -> usize {
        critical_section(|cs| self.state(cs).len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() == N
    }

    // -----------------------------------------------------------------------
    // Steps
    // -----------------------------------------------------------------------

    /// Enqueue if there is room, waking the most urgent receiver.
    pub fn try_send_in(&self, cs: CriticalSection<'_>, k: &mut Kernel, msg: T, may_yield: bool) -> Result<(), T> {
        let mut st = self.state(cs);
        if st.len == N {
            return Err(msg);
        }
        st.push(msg);
        k.unpark_event(&mut st.receivers, may_yield);
        Ok(())
    }

    /// Dequeue if there is a message, waking the most urgent sender.
    pub fn try_recv_in(&self, cs: CriticalSection<'_>, k: &mut Kernel, may_yield: bool) -> Option<T> {
        let mut st = self.state(cs);
        let msg = st.pop()?;
        k.unpark_event(&mut st.senders, may_yield);
        Some(msg)
    }

    /// Park the running task on one end for at most `timeout` ticks.
    pub fn park_in(&self, cs: CriticalSection<'_>, k: &mut Kernel, side: Side, timeout: u32) {
        let mut st = self.state(cs);
        k.park_current_timed(st.waiters(side), timeout);
    }

    /// Called by a task back from `park_in`. Returns `true` if the wait
    /// timed out.
    pub fn finish_wait_in(&self, cs: CriticalSection<'_>, k: &mut Kernel, side: Side) -> bool {
        let cur = k.require_current();
        let mut st = self.state(cs);
        k.withdraw_event(st.waiters(side), cur)
    }

    // -----------------------------------------------------------------------
    // Blocking API
    // -----------------------------------------------------------------------

    /// Send, waiting up to `timeout` ticks for room. `0` never waits,
    /// `WAIT_FOREVER` never gives up.
    pub fn send(&self, msg: T, timeout: u32) -> Result<(), SendError<T>> {
        let mut msg = msg;
        let mut deadline = None;
        loop {
            let step = kernel::with(|cs, k| {
                let msg = match self.try_send_in(cs, k, msg, true) {
                    Ok(()) => return SendStep::Done,
                    Err(msg) => msg,
                };
                if timeout == 0 {
                    return SendStep::Failed(SendError::Full(msg));
                }
                match remaining(k.ticks(), timeout, &mut deadline) {
                    Some(left) => {
                        self.park_in(cs, k, Side::Sender, left);
                        SendStep::Parked(msg)
                    }
                    None => SendStep::Failed(SendError::Timeout(msg)),
                }
            });
            match step {
                SendStep::Done => return Ok(()),
                SendStep::Failed(e) => return Err(e),
                SendStep::Parked(back) => msg = back,
            }
            if kernel::with(|cs, k| self.finish_wait_in(cs, k, Side::Sender)) {
                return Err(SendError::Timeout(msg));
            }
        }
    }

    /// Receive, waiting up to `timeout` ticks for a message.
    pub fn recv(&self, timeout: u32) -> Result<T, RecvError> {
        let mut deadline = None;
        loop {
            let step = kernel::with(|cs, k| {
                if let Some(msg) = self.try_recv_in(cs, k, true) {
                    return RecvStep::Done(msg);
                }
                if timeout == 0 {
                    return RecvStep::Failed(RecvError::Empty);
                }
                match remaining(k.ticks(), timeout, &mut deadline) {
                    Some(left) => {
                        self.park_in(cs, k, Side::Receiver, left);
                        RecvStep::Parked
                    }
                    None => RecvStep::Failed(RecvError::Timeout),
                }
            });
            match step {
                RecvStep::Done(msg) => return Ok(msg),
                RecvStep::Failed(e) => return Err(e),
                RecvStep::Parked => {}
            }
            if kernel::with(|cs, k| self.finish_wait_in(cs, k, Side::Receiver)) {
                return Err(RecvError::Timeout);
            }
        }
    }

    pub fn try_send(&self, msg: T) -> Result<(), SendError<T>> {
        self.send(msg, 0)
    }

    pub fn try_recv(&self) -> Result<T, RecvError> {
        self.recv(0)
    }

    /// Send from an interrupt handler. Never waits, never switches.
    pub fn send_from_isr(&self, msg: T) -> Result<(), SendError<T>> {
        kernel::with(|cs, k| self.try_send_in(cs, k, msg, false)).map_err(SendError::Full)
    }

    pub fn recv_from_isr(&self) -> Result<T, RecvError> {
        kernel::with(|cs, k| self.try_recv_in(cs, k, false)).ok_or(RecvError::Empty)
    }
}

impl<T, const N: usize> Default for MessageQueue<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

/// Ticks left before `deadline`, fixing the deadline on the first call.
/// `None` once it has passed.
fn remaining(now: u64, timeout: u32, deadline: &mut Option<u64>) -> Option<u32> {
    if timeout == WAIT_FOREVER {
        return Some(WAIT_FOREVER);
    }
    let end = *deadline.get_or_insert(now + u64::from(timeout));
    match end.saturating_sub(now) {
        0 => None,
        left => Some(left as u32),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::host::SimCpu;
    use crate::config::SchedPolicy;
    use crate::scheduler::tests::{current_name, kernel, spawn};
    use crate::task::TaskStatus;
    use crate::kernel::tests as global;
    use std::cell::Cell;
    use std::rc::Rc;

    #[test]
    fn test_capacity_one_zero_timeout() {
        let _serial = global::fresh(SchedPolicy::Preemptive);
        let q: MessageQueue<u32, 1> = MessageQueue::new();
        assert_eq!(q.try_recv(), Err(RecvError::Empty));
        assert_eq!(q.send(7, 0), Ok(()));
        assert!(q.is_full());
        assert_eq!(q.send(8, 0), Err(SendError::Full(8)));
        assert_eq!(q.recv(0), Ok(7));
        assert!(q.is_empty());
        assert_eq!(q.recv(0), Err(RecvError::Empty));
    }

    #[test]
    fn test_fifo_order_and_wraparound() {
        let q: MessageQueue<u8, 3> = MessageQueue::new();
        let mut k = kernel(SchedPolicy::Preemptive);
        critical_section(|cs| {
            for round in 0..4u8 {
                assert!(q.try_send_in(cs, &mut k, round, true).is_ok());
                assert!(q.try_send_in(cs, &mut k, round + 10, true).is_ok());
                assert_eq!(q.try_recv_in(cs, &mut k, true), Some(round));
                assert_eq!(q.try_recv_in(cs, &mut k, true), Some(round + 10));
            }
            assert_eq!(q.try_recv_in(cs, &mut k, true), None);
        });
        assert_eq!(q.capacity(), 3);
    }

    #[test]
    fn test_receiver_times_out() {
        let q: MessageQueue<u32, 2> = MessageQueue::new();
        let mut k = kernel(SchedPolicy::Preemptive);
        let rx = spawn(&mut k, 2, "rx");
        spawn(&mut k, 5, "other");
        let mut cpu = SimCpu::new();
        cpu.boot(&mut k);

        critical_section(|cs| {
            assert_eq!(q.try_recv_in(cs, &mut k, true), None);
            q.park_in(cs, &mut k, Side::Receiver, 5);
        });
        assert!(k.tcb(rx).unwrap().awaiting_event());
        cpu.trap(&mut k);
        assert_eq!(current_name(&k), "other");

        for _ in 0..4 {
            k.tick();
            cpu.trap(&mut k);
        }
        assert_eq!(k.status(rx), Some(TaskStatus::Blocked));
        k.tick();
        cpu.trap(&mut k);
        assert_eq!(k.current(), Some(rx));

        assert!(critical_section(|cs| q.finish_wait_in(cs, &mut k, Side::Receiver)));
        assert!(!k.tcb(rx).unwrap().awaiting_event());
        assert!(k.is_consistent());
    }

    #[test]
    fn test_send_hands_message_to_waiting_receiver() {
        let q: MessageQueue<u32, 2> = MessageQueue::new();
        let mut k = kernel(SchedPolicy::Preemptive);
        let rx = spawn(&mut k, 2, "rx");
        spawn(&mut k, 5, "tx");
        let mut cpu = SimCpu::new();
        cpu.boot(&mut k);

        critical_section(|cs| q.park_in(cs, &mut k, Side::Receiver, WAIT_FOREVER));
        cpu.trap(&mut k);
        assert_eq!(current_name(&k), "tx");
        assert!(k.blocked_tasks().any(|h| h == rx));

        critical_section(|cs| assert!(q.try_send_in(cs, &mut k, 99, true).is_ok()));
        assert!(k.switch_requested());
        cpu.trap(&mut k);
        assert_eq!(k.current(), Some(rx));

        critical_section(|cs| {
            assert!(!q.finish_wait_in(cs, &mut k, Side::Receiver));
            assert_eq!(q.try_recv_in(cs, &mut k, true), Some(99));
        });
        assert!(k.is_consistent());
    }

    #[test]
    fn test_receive_frees_blocked_sender() {
        let q: MessageQueue<u32, 1> = MessageQueue::new();
        let mut k = kernel(SchedPolicy::Preemptive);
        let tx = spawn(&mut k, 2, "tx");
        let rx = spawn(&mut k, 5, "rx");
        let mut cpu = SimCpu::new();
        cpu.boot(&mut k);

        critical_section(|cs| {
            assert!(q.try_send_in(cs, &mut k, 1, true).is_ok());
            assert_eq!(q.try_send_in(cs, &mut k, 2, true), Err(2));
            q.park_in(cs, &mut k, Side::Sender, 50);
        });
        cpu.trap(&mut k);
        assert_eq!(k.current(), Some(rx));

        critical_section(|cs| assert_eq!(q.try_recv_in(cs, &mut k, true), Some(1)));
        cpu.trap(&mut k);
        assert_eq!(k.current(), Some(tx));
        critical_section(|cs| {
            assert!(!q.finish_wait_in(cs, &mut k, Side::Sender));
            assert!(q.try_send_in(cs, &mut k, 2, true).is_ok());
        });
        // served before the deadline: no longer on the sleeping list
        assert_eq!(k.sleeping_tasks().count(), 0);
    }

    #[test]
    fn test_most_urgent_receiver_served_first() {
        let q: MessageQueue<u32, 4> = MessageQueue::new();
        let mut k = kernel(SchedPolicy::Preemptive);
        let slow = spawn(&mut k, 4, "slow");
        let fast = spawn(&mut k, 1, "fast");
        spawn(&mut k, 9, "tx");
        k.block(fast).unwrap();
        let mut cpu = SimCpu::new();
        cpu.boot(&mut k);

        critical_section(|cs| q.park_in(cs, &mut k, Side::Receiver, WAIT_FOREVER));
        cpu.trap(&mut k);
        k.resume(fast).unwrap();
        cpu.trap(&mut k);
        assert_eq!(k.current(), Some(fast));
        critical_section(|cs| q.park_in(cs, &mut k, Side::Receiver, WAIT_FOREVER));
        cpu.trap(&mut k);
        assert_eq!(current_name(&k), "tx");

        critical_section(|cs| q.try_send_in(cs, &mut k, 5, true)).unwrap();
        assert_eq!(k.status(fast), Some(TaskStatus::Ready));
        assert_eq!(k.status(slow), Some(TaskStatus::Blocked));
    }

    #[test]
    fn test_remaining_ticks() {
        let mut deadline = None;
        assert_eq!(remaining(100, 10, &mut deadline), Some(10));
        assert_eq!(remaining(104, 10, &mut deadline), Some(6));
        assert_eq!(remaining(110, 10, &mut deadline), None);
        assert_eq!(remaining(0, WAIT_FOREVER, &mut None), Some(WAIT_FOREVER));
    }

    // -----------------------------------------------------------------------
    // Blocking API on the global kernel
    // -----------------------------------------------------------------------

    #[test]
    fn test_recv_gives_up_at_deadline() {
        static Q: MessageQueue<u32, 2> = MessageQueue::new();
        let _serial = global::fresh(SchedPolicy::Preemptive);
        global::spawn_task(2, "rx");
        global::spawn_task(5, "other");
        let cpu = global::boot();

        let c = cpu.clone();
        global::on_trap(move || {
            global::trap(&c);
            assert_eq!(global::current_name(), "other");
            for _ in 0..5 {
                crate::kernel::tick();
            }
            global::trap(&c);
        });

        assert_eq!(Q.recv(5), Err(RecvError::Timeout));
        assert_eq!(global::current_name(), "rx");
        assert_eq!(crate::kernel::ticks(), 5);
        assert!(global::consistent());
    }

    #[test]
    fn test_recv_with_timeout_takes_late_message() {
        static Q: MessageQueue<u32, 2> = MessageQueue::new();
        let _serial = global::fresh(SchedPolicy::Preemptive);
        global::spawn_task(2, "rx");
        global::spawn_task(5, "tx");
        let cpu = global::boot();

        let c = cpu.clone();
        global::on_trap(move || {
            global::trap(&c);
            crate::kernel::tick();
            crate::kernel::tick();
            assert_eq!(Q.send(42, 0), Ok(()));
            global::trap(&c);
        });

        assert_eq!(Q.recv(10), Ok(42));
        assert!(Q.is_empty());
        assert_eq!(crate::kernel::ticks(), 2);
    }

    #[test]
    fn test_send_retries_until_room_within_deadline() {
        static Q: MessageQueue<u32, 1> = MessageQueue::new();
        let _serial = global::fresh(SchedPolicy::Preemptive);
        let tx = global::spawn_task(2, "tx");
        global::spawn_task(5, "rx");
        let cpu = global::boot();
        assert_eq!(Q.send(1, 0), Ok(()));

        let rounds = Rc::new(Cell::new(0u32));
        let (c, n) = (cpu.clone(), rounds.clone());
        global::on_trap(move || {
            global::trap(&c);
            assert_eq!(global::current_name(), "rx");
            n.set(n.get() + 1);
            if n.get() == 1 {
                for _ in 0..3 {
                    crate::kernel::tick();
                }
                // make room, then fill it again before tx runs
                assert_eq!(Q.try_recv(), Ok(1));
                assert_eq!(Q.try_send(9), Ok(()));
            } else {
                // parked again against the original deadline
                assert_eq!(crate::kernel::with(|_, k| k.tcb(tx).unwrap().wake_tick), 50);
                assert_eq!(Q.try_recv(), Ok(9));
            }
            global::trap(&c);
        });

        assert_eq!(Q.send(2, 50), Ok(()));
        assert_eq!(rounds.get(), 2);
        assert_eq!(Q.len(), 1);
        assert_eq!(Q.try_recv(), Ok(2));
        assert!(global::consistent());
    }
}
