//! # Child Tasks
//!
//! A [`ChildTask`] is a one-shot task that only starts when its parent
//! awaits it. `join` makes the child ready and blocks the parent; when the
//! child's entry function returns, the child is torn down and the parent
//! made ready again.
//!
//! ```ignore
//! let child = ChildTask::spawn(checksum, buf.as_mut_ptr().cast(), Priority::new(4), "sum")?;
//! child.join()?;
//! // the child has finished here
//! ```

use crate::error::KernelError;
use crate::kernel;
use crate::page::PageRequest;
use crate::scheduler::Kernel;
use crate::task::{Priority, TaskEntry, TaskHandle, TaskParams};

/// Handle to a child that has not been awaited yet.
#[must_use = "a child task only runs once it is joined"]
#[derive(Debug)]
pub struct ChildTask {
    handle: TaskHandle,
}

impl ChildTask {
    /// Create a child on a pool page. It does not run yet.
    pub fn spawn(entry: TaskEntry, arg: *mut (), priority: Priority, name: &'static str) -> Result<Self, KernelError> {
        let params = TaskParams {
            entry,
            arg,
            priority,
            name,
        };
        Self::spawn_with(params, PageRequest::Pool)
    }

    pub fn spawn_with(params: TaskParams, page: PageRequest) -> Result<Self, KernelError> {
        kernel::with(|_, k| Self::create_in(k, params, page))
    }

    pub fn create_in(k: &mut Kernel, params: TaskParams, page: PageRequest) -> Result<Self, KernelError> {
        k.create_child(params, page).map(|handle| ChildTask { handle })
    }

    pub fn handle(&self) -> TaskHandle {
        self.handle
    }

    /// Run the child and wait for it to finish.
    pub fn join(self) -> Result<(), KernelError> {
        kernel::with(|_, k| self.join_in(k))
    }

    pub fn join_in(self, k: &mut Kernel) -> Result<(), KernelError> {
        k.await_child(self.handle)
    }

    /// Discard a child. A task blocked in `join` on it is released.
    pub fn cancel(self) -> Result<(), KernelError> {
        kernel::with(|_, k| self.cancel_in(k))
    }

    pub fn cancel_in(self, k: &mut Kernel) -> Result<(), KernelError> {
        k.terminate(self.handle)
    }
}
