//! # Intrusive List
//!
//! Circular, doubly linked, sentinel-headed list threaded through nodes
//! embedded in the task table. Every kernel queue (ready, blocked,
//! sleeping, and the wait lists of the synchronization objects) is one of
//! these.
//!
//! Nodes are addressed by task-slot index rather than by pointer. A link
//! is either another slot or [`Link::Head`], the list's own sentinel,
//! whose `next`/`prev` are the `first`/`last` fields of [`List`]. A node
//! that is in no list links to itself.
//!
//! A task carries two nodes, selected by [`Hook`]: the scheduling node
//! (ready / blocked / sleeping / object wait list) and the event node
//! used by timed waits on a message queue.
//!
//! All mutators must run with interrupts disabled; the `&mut` arena
//! passed in is only reachable from inside a critical section.

use crate::kassert;

/// One end of a link: a task slot or the list sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Link {
    Head,
    Node(usize),
}

/// Which embedded node of a task a list threads through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hook {
    Sched,
    Event,
}

/// Node embedded in a task control block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListNode {
    me: usize,
    prev: Link,
    next: Link,
}

impl ListNode {
    /// A self-linked node for slot `me`.
    pub const fn new(me: usize) -> Self {
        ListNode {
            me,
            prev: Link::Node(me),
            next: Link::Node(me),
        }
    }

    #[inline]
    pub fn is_linked(&self) -> bool {
        self.next != Link::Node(self.me)
    }

    fn reset(&mut self) {
        *self = ListNode::new(self.me);
    }
}

/// Storage that owns the nodes a [`List`] threads through.
pub trait NodeArena {
    fn node(&self, id: usize, hook: Hook) -> &ListNode;
    fn node_mut(&mut self, id: usize, hook: Hook) -> &mut ListNode;
}

/// List header. Doubles as the sentinel node.
#[derive(Debug)]
pub struct List {
    hook: Hook,
    first: Link,
    last: Link,
    len: usize,
}

impl List {
    pub const fn new(hook: Hook) -> Self {
        List {
            hook,
            first: Link::Head,
            last: Link::Head,
            len: 0,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn hook(&self) -> Hook {
        self.hook
    }

    /// First member, if any.
    pub fn head(&self) -> Option<usize> {
        match self.first {
            Link::Head => None,
            Link::Node(id) => Some(id),
        }
    }

    /// Member following `id`, or `None` at the tail.
    pub fn next_of<A: NodeArena + ?Sized>(&self, arena: &A, id: usize) -> Option<usize> {
        match arena.node(id, self.hook).next {
            Link::Head => None,
            Link::Node(n) => Some(n),
        }
    }

    fn next_link<A: NodeArena + ?Sized>(&self, arena: &A, at: Link) -> Link {
        match at {
            Link::Head => self.first,
            Link::Node(id) => arena.node(id, self.hook).next,
        }
    }

    fn prev_link<A: NodeArena + ?Sized>(&self, arena: &A, at: Link) -> Link {
        match at {
            Link::Head => self.last,
            Link::Node(id) => arena.node(id, self.hook).prev,
        }
    }

    fn set_next<A: NodeArena + ?Sized>(&mut self, arena: &mut A, at: Link, to: Link) {
        match at {
            Link::Head => self.first = to,
            Link::Node(id) => arena.node_mut(id, self.hook).next = to,
        }
    }

    fn set_prev<A: NodeArena + ?Sized>(&mut self, arena: &mut A, at: Link, to: Link) {
        match at {
            Link::Head => self.last = to,
            Link::Node(id) => arena.node_mut(id, self.hook).prev = to,
        }
    }

    fn insert_before<A: NodeArena + ?Sized>(&mut self, arena: &mut A, id: usize, before: Link) {
        kassert!(!arena.node(id, self.hook).is_linked(), "slot {} already linked", id);

        let prev = self.prev_link(arena, before);
        {
            let node = arena.node_mut(id, self.hook);
            node.prev = prev;
            node.next = before;
        }
        self.set_next(arena, prev, Link::Node(id));
        self.set_prev(arena, before, Link::Node(id));
        self.len += 1;
    }

    /// Append at the tail.
    pub fn insert<A: NodeArena + ?Sized>(&mut self, arena: &mut A, id: usize) {
        self.insert_before(arena, id, Link::Head);
    }

    /// Insert before the first member that `id` strictly precedes.
    ///
    /// Members equal to `id` keep their place ahead of it, so equal keys
    /// come out in insertion order.
    pub fn insert_in_order<A, F>(&mut self, arena: &mut A, id: usize, precedes: F)
    where
        A: NodeArena + ?Sized,
        F: Fn(&A, usize, usize) -> bool,
    {
        let mut cursor = self.first;
        while let Link::Node(other) = cursor {
            if precedes(&*arena, id, other) {
                break;
            }
            cursor = arena.node(other, self.hook).next;
        }
        self.insert_before(arena, id, cursor);
    }

    /// Unlink `id`. The node must be a member of this list.
    pub fn remove<A: NodeArena + ?Sized>(&mut self, arena: &mut A, id: usize) {
        let node = *arena.node(id, self.hook);
        kassert!(node.is_linked(), "slot {} not linked", id);
        kassert!(self.len > 0, "remove from empty list");

        self.set_next(arena, node.prev, node.next);
        self.set_prev(arena, node.next, node.prev);
        arena.node_mut(id, self.hook).reset();
        self.len -= 1;
    }

    /// Unlink and return the head.
    pub fn pop_front<A: NodeArena + ?Sized>(&mut self, arena: &mut A) -> Option<usize> {
        let id = self.head()?;
        self.remove(arena, id);
        Some(id)
    }

    pub fn contains<A: NodeArena + ?Sized>(&self, arena: &A, id: usize) -> bool {
        self.iter(arena).any(|n| n == id)
    }

    pub fn iter<'a, A: NodeArena + ?Sized>(&'a self, arena: &'a A) -> Iter<'a, A> {
        Iter {
            list: self,
            arena,
            cursor: self.first,
        }
    }

    /// Walk the ring once and check every back link and the length.
    pub fn is_consistent<A: NodeArena + ?Sized>(&self, arena: &A) -> bool {
        let mut at = Link::Head;
        let mut count = 0;
        loop {
            let next = self.next_link(arena, at);
            if self.prev_link(arena, next) != at {
                return false;
            }
            if next == Link::Head {
                break;
            }
            count += 1;
            if count > self.len {
                return false;
            }
            at = next;
        }
        count == self.len
    }
}

/// Front-to-back iterator over slot indices.
pub struct Iter<'a, A: NodeArena + ?Sized> {
    list: &'a List,
    arena: &'a A,
    cursor: Link,
}

impl<A: NodeArena + ?Sized> Iterator for Iter<'_, A> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        match self.cursor {
            Link::Head => None,
            Link::Node(id) => {
                self.cursor = self.arena.node(id, self.list.hook).next;
                Some(id)
            }
        }
    }
}
