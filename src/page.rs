//! # Page Allocator
//!
//! Task stacks come from one of three places:
//!
//! | Policy    | Storage                         | On termination          |
//! |-----------|---------------------------------|-------------------------|
//! | `Pool`    | first free page of [`PagePool`] | page marked unused      |
//! | `Dynamic` | global allocator, caller size   | storage deallocated     |
//! | `Static`  | caller-supplied `'static` slice | left untouched          |
//!
//! The pool scan is O(`MAX_TASKS`), deterministic and cannot fragment.
//! Every failure is reported; nothing here retries.
//!
//! Page memory lives outside the kernel state. Tasks run on it
//! while the kernel state is borrowed, so it is only ever reached through
//! raw pointers.

use core::cell::UnsafeCell;
use core::ptr::NonNull;

use crate::config::{MAX_TASKS, MIN_STACK_WORDS, PAGE_WORDS, STACK_PAINT};
use crate::error::KernelError;

// ---------------------------------------------------------------------------
// Pool storage
// ---------------------------------------------------------------------------

/// One fixed-size block of stack memory. Aligned to 8 bytes (AAPCS).
#[repr(C, align(8))]
pub struct Page {
    words: UnsafeCell<[usize; PAGE_WORDS]>,
}

impl Page {
    pub const fn new() -> Self {
        Page {
            words: UnsafeCell::new([0; PAGE_WORDS]),
        }
    }
}

/// Backing storage for POOL stacks, one page per possible task.
pub struct PagePool {
    pages: [Page; MAX_TASKS],
}

// Safety: pages are handed out to exactly one task at a time by
// `PageAllocator`, whose bookkeeping is only touched inside critical
// sections. The pool itself never reads page contents through `&self`.
unsafe impl Sync for PagePool {}

impl PagePool {
    pub const fn new() -> Self {
        const EMPTY: Page = Page::new();
        PagePool {
            pages: [EMPTY; MAX_TASKS],
        }
    }

    fn page_base(&self, index: usize) -> NonNull<usize> {
        let ptr = self.pages[index].words.get() as *mut usize;
        // Safety: derived from a reference, never null.
        unsafe { NonNull::new_unchecked(ptr) }
    }
}

impl Default for PagePool {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Allocation request / result
// ---------------------------------------------------------------------------

/// How a new task's stack should be obtained.
pub enum PageRequest {
    /// First unused page of the pool.
    Pool,
    /// Fresh block of the given number of words from the global allocator.
    #[cfg(any(test, feature = "alloc"))]
    Dynamic(usize),
    /// Caller-owned storage. Never recycled by the kernel.
    Static(&'static mut [usize]),
}

/// Where a [`Stack`] came from, and therefore how to give it back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageSource {
    Pool(usize),
    Dynamic,
    Static,
}

/// A task's stack memory. Grows downward from [`Stack::top`].
#[derive(Debug)]
pub struct Stack {
    base: NonNull<usize>,
    words: usize,
    source: PageSource,
}

// Safety: a Stack is owned by exactly one TCB; the memory it names is
// never aliased by another Stack.
unsafe impl Send for Stack {}

impl Stack {
    #[inline]
    pub fn base(&self) -> *mut usize {
        self.base.as_ptr()
    }

    /// One past the highest word.
    #[inline]
    pub fn top(&self) -> *mut usize {
        // Safety: `words` is the exact length of the block at `base`.
        unsafe { self.base.as_ptr().add(self.words) }
    }

    #[inline]
    pub fn words(&self) -> usize {
        self.words
    }

    #[inline]
    pub fn source(&self) -> PageSource {
        self.source
    }

    /// Whether `sp` points into this stack (the top itself included).
    pub fn contains(&self, sp: *const usize) -> bool {
        let sp = sp as usize;
        sp >= self.base() as usize && sp <= self.top() as usize
    }

    /// Fill the whole stack with the watermark.
    pub fn paint(&mut self) {
        for i in 0..self.words {
            // Safety: in bounds; the stack is not in use yet.
            unsafe { self.base().add(i).write_volatile(STACK_PAINT) };
        }
    }

    /// Deepest extent ever used, in words, judged by the watermark.
    pub fn high_water(&self) -> usize {
        let untouched = (0..self.words)
            // Safety: in bounds; a racy read only skews a diagnostic.
            .take_while(|&i| unsafe { self.base().add(i).read_volatile() } == STACK_PAINT)
            .count();
        self.words - untouched
    }

    /// `high_water` as a percentage of the stack size.
    pub fn usage_percent(&self) -> usize {
        if self.words == 0 {
            return 0;
        }
        self.high_water() * 100 / self.words
    }
}

// ---------------------------------------------------------------------------
// Allocator
// ---------------------------------------------------------------------------

/// Bookkeeping for the pool plus the DYNAMIC/STATIC policies.
pub struct PageAllocator {
    pool: &'static PagePool,
    used: [bool; MAX_TASKS],
}

impl PageAllocator {
    pub const fn new(pool: &'static PagePool) -> Self {
        PageAllocator {
            pool,
            used: [false; MAX_TASKS],
        }
    }

    /// Obtain a stack according to `req`.
    pub fn allocate(&mut self, req: PageRequest) -> Result<Stack, KernelError> {
        match req {
            PageRequest::Pool => {
                let index = self
                    .used
                    .iter()
                    .position(|used| !used)
                    .ok_or(KernelError::PoolExhausted)?;
                self.used[index] = true;
                Ok(Stack {
                    base: self.pool.page_base(index),
                    words: PAGE_WORDS,
                    source: PageSource::Pool(index),
                })
            }
            #[cfg(any(test, feature = "alloc"))]
            PageRequest::Dynamic(words) => {
                if words < MIN_STACK_WORDS {
                    return Err(KernelError::StackTooSmall);
                }
                let layout = dynamic_layout(words)?;
                // Safety: layout has non-zero size.
                let ptr = unsafe { alloc::alloc::alloc(layout) } as *mut usize;
                let base = NonNull::new(ptr).ok_or(KernelError::OutOfMemory)?;
                Ok(Stack {
                    base,
                    words,
                    source: PageSource::Dynamic,
                })
            }
            PageRequest::Static(mem) => {
                if mem.len() < MIN_STACK_WORDS {
                    return Err(KernelError::StackTooSmall);
                }
                let words = mem.len();
                let base = NonNull::from(mem).cast::<usize>();
                Ok(Stack {
                    base,
                    words,
                    source: PageSource::Static,
                })
            }
        }
    }

    /// Give a stack back according to where it came from.
    pub fn release(&mut self, stack: Stack) {
        match stack.source {
            PageSource::Pool(index) => {
                crate::kassert!(self.used[index], "page {} released twice", index);
                self.used[index] = false;
            }
            #[cfg(any(test, feature = "alloc"))]
            PageSource::Dynamic => {
                if let Ok(layout) = dynamic_layout(stack.words) {
                    // Safety: allocated in `allocate` with this very layout.
                    unsafe { alloc::alloc::dealloc(stack.base() as *mut u8, layout) };
                }
            }
            #[cfg(not(any(test, feature = "alloc")))]
            PageSource::Dynamic => {}
            PageSource::Static => {}
        }
    }

    /// Number of pool pages currently handed out.
    pub fn pages_in_use(&self) -> usize {
        self.used.iter().filter(|u| **u).count()
    }
}

#[cfg(any(test, feature = "alloc"))]
fn dynamic_layout(words: usize) -> Result<core::alloc::Layout, KernelError> {
    let size = words
        .checked_mul(core::mem::size_of::<usize>())
        .ok_or(KernelError::OutOfMemory)?;
    core::alloc::Layout::from_size_align(size, 8).map_err(|_| KernelError::OutOfMemory)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::boxed::Box;
    use std::vec;

    fn pool() -> &'static PagePool {
        Box::leak(Box::new(PagePool::new()))
    }

    #[test]
    fn test_pool_hands_out_first_free_page() {
        let mut pages = PageAllocator::new(pool());
        let a = pages.allocate(PageRequest::Pool).unwrap();
        let b = pages.allocate(PageRequest::Pool).unwrap();
        assert_eq!(a.source(), PageSource::Pool(0));
        assert_eq!(b.source(), PageSource::Pool(1));
        assert_eq!(a.words(), PAGE_WORDS);

        pages.release(a);
        let c = pages.allocate(PageRequest::Pool).unwrap();
        assert_eq!(c.source(), PageSource::Pool(0));
        assert_eq!(pages.pages_in_use(), 2);
    }

    #[test]
    fn test_pool_exhaustion_is_reported() {
        let mut pages = PageAllocator::new(pool());
        for _ in 0..MAX_TASKS {
            pages.allocate(PageRequest::Pool).unwrap();
        }
        assert_eq!(
            pages.allocate(PageRequest::Pool).unwrap_err(),
            KernelError::PoolExhausted
        );
    }

    #[test]
    fn test_dynamic_allocation_round_trip() {
        let mut pages = PageAllocator::new(pool());
        let stack = pages.allocate(PageRequest::Dynamic(64)).unwrap();
        assert_eq!(stack.source(), PageSource::Dynamic);
        assert_eq!(stack.words(), 64);
        assert_eq!(stack.base() as usize % 8, 0);
        pages.release(stack);
        assert_eq!(pages.pages_in_use(), 0);
    }

    #[test]
    fn test_small_stacks_rejected() {
        let mut pages = PageAllocator::new(pool());
        let mem: &'static mut [usize] = Box::leak(vec![0usize; 4].into_boxed_slice());
        assert_eq!(
            pages.allocate(PageRequest::Static(mem)).unwrap_err(),
            KernelError::StackTooSmall
        );
        assert_eq!(
            pages.allocate(PageRequest::Dynamic(1)).unwrap_err(),
            KernelError::StackTooSmall
        );
    }

    #[test]
    fn test_static_stack_is_not_recycled() {
        let mut pages = PageAllocator::new(pool());
        let mem: &'static mut [usize] = Box::leak(vec![7usize; 48].into_boxed_slice());
        let base = mem.as_ptr();
        let stack = pages.allocate(PageRequest::Static(mem)).unwrap();
        assert_eq!(stack.base() as *const usize, base);
        pages.release(stack);
        // caller memory untouched by release
        assert_eq!(unsafe { base.read() }, 7);
        assert_eq!(pages.pages_in_use(), 0);
    }

    #[test]
    fn test_high_water_mark() {
        let mut pages = PageAllocator::new(pool());
        let mut stack = pages.allocate(PageRequest::Pool).unwrap();
        stack.paint();
        assert_eq!(stack.high_water(), 0);

        unsafe { stack.top().sub(10).write(0) };
        assert_eq!(stack.high_water(), 10);
        assert_eq!(stack.usage_percent(), 10 * 100 / PAGE_WORDS);
        assert!(stack.contains(stack.top()));
        assert!(!stack.contains(unsafe { stack.top().add(1) }));
    }
}
