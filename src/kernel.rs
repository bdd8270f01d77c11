//! # Kernel
//!
//! Top-level kernel initialization and public API for KeelOS.
//!
//! The kernel owns the global [`Kernel`] instance behind a
//! critical-section mutex. Every public function runs its work inside one
//! critical section through [`with`]; if the work asked for a context
//! switch, the switch trap is pended before the section ends and taken as
//! soon as interrupts come back on.
//!
//! ## Startup Sequence
//!
//! ```text
//! reset_handler (cortex-m-rt)
//!   └─► main()
//!         ├─► kernel::init()   ← Pick policy / time slice (optional)
//!         ├─► kernel::spawn()  ← Register tasks (×N)
//!         └─► kernel::start()  ← Launch scheduler (no return)
//!               ├─► Create the idle task
//!               ├─► Set interrupt priorities
//!               ├─► Configure SysTick
//!               └─► Start first task via arch::start_first_task()
//! ```

use core::cell::RefCell;
use core::fmt;

use critical_section::Mutex;

use crate::arch;
use crate::config::{IdleMode, KernelConfig};
use crate::critical::{critical_section, CriticalSection};
use crate::error::{fatal, KernelError};
use crate::page::{PagePool, PageRequest};
use crate::scheduler::{Kernel, TaskKey};
use crate::task::{Priority, TaskEntry, TaskHandle, TaskParams};

// ---------------------------------------------------------------------------
// Global kernel instance
// ---------------------------------------------------------------------------

static PAGES: PagePool = PagePool::new();

static KERNEL: Mutex<RefCell<Kernel>> = Mutex::new(RefCell::new(Kernel::new(&PAGES, KernelConfig::DEFAULT)));

/// Run `f` on the global kernel inside a critical section, then pend the
/// switch trap if `f` asked for one.
pub fn with<R>(f: impl FnOnce(CriticalSection<'_>, &mut Kernel) -> R) -> R {
    let result = critical_section(|cs| {
        let mut kernel = KERNEL.borrow_ref_mut(cs);
        let result = f(cs, &mut kernel);
        if kernel.take_switch_request() {
            arch::pend_switch();
        }
        result
    });
    #[cfg(not(all(target_arch = "arm", target_os = "none")))]
    arch::host::take_trap();
    result
}

// ---------------------------------------------------------------------------
// Kernel API
// ---------------------------------------------------------------------------

/// Replace the build-time configuration. Only before [`start`].
pub fn init(config: KernelConfig) -> Result<(), KernelError> {
    with(|_, k| k.configure(config))
}

/// Create a task on a pool page.
///
/// # Example
/// ```ignore
/// extern "C" fn blink(_: *mut ()) { /* ... */ }
/// kernel::spawn(blink, core::ptr::null_mut(), Priority::new(3), "blink").unwrap();
/// ```
pub fn spawn(entry: TaskEntry, arg: *mut (), priority: Priority, name: &'static str) -> Result<TaskHandle, KernelError> {
    with(|_, k| k.create(entry, arg, priority, name))
}

/// Create a task with an explicit page policy.
pub fn spawn_with(params: TaskParams, page: PageRequest) -> Result<TaskHandle, KernelError> {
    with(|_, k| k.create_with(params, page))
}

/// Create a task from an interrupt handler. Never switches.
pub fn spawn_from_isr(params: TaskParams, page: PageRequest) -> Result<TaskHandle, KernelError> {
    with(|_, k| k.create_from_isr(params, page))
}

/// Start the scheduler. **Does not return.**
///
/// Creates the idle task, configures SysTick and the trap priorities and
/// launches the most urgent ready task.
#[cfg(all(target_arch = "arm", target_os = "none"))]
pub fn start(mut core_peripherals: cortex_m::Peripherals) -> ! {
    use crate::arch::cortex_m4;

    cortex_m::interrupt::disable();

    let first_sp = with(|_, k| {
        k.create_idle(idle_task)?;
        k.start()
    });
    let first_sp = match first_sp {
        Ok(sp) => sp,
        Err(e) => fatal(format_args!("start: {}", e)),
    };

    cortex_m4::set_interrupt_priorities(&mut core_peripherals.SCB);
    cortex_m4::configure_systick(&mut core_peripherals.SYST);
    log::info!("keelos: scheduler started");

    // Safety: called once, interrupts disabled, frame built by init_frame.
    unsafe { cortex_m4::start_first_task(first_sp) }
}

/// Sleep the calling task for `ticks` ticks. `delay(0)` yields.
pub fn delay(ticks: u32) {
    with(|_, k| k.delay(ticks));
}

/// Give up the rest of the time slice.
pub fn yield_now() {
    with(|_, k| k.yield_current());
}

/// Block a task until [`resume`]. Blocking the caller switches away.
pub fn block(task: TaskHandle) -> Result<(), KernelError> {
    with(|_, k| k.block(task))
}

pub fn resume(task: TaskHandle) -> Result<(), KernelError> {
    with(|_, k| k.resume(task))
}

/// Resume from an interrupt handler. The switch, if any, waits for the
/// next tick.
pub fn resume_from_isr(task: TaskHandle) -> Result<(), KernelError> {
    with(|_, k| k.resume_from_isr(task))
}

pub fn terminate(task: TaskHandle) -> Result<(), KernelError> {
    with(|_, k| k.terminate(task))
}

pub fn set_priority(task: TaskHandle, priority: Priority) -> Result<(), KernelError> {
    with(|_, k| k.set_priority(task, priority))
}

/// Terminate the calling task. **Does not return.**
pub fn exit() -> ! {
    if let Err(e) = with(|_, k| k.terminate_current()) {
        fatal(format_args!("exit: {}", e));
    }
    // The pended trap fires as soon as the critical section ends.
    loop {
        arch::idle_wait(IdleMode::Spin);
    }
}

pub fn current() -> Option<TaskHandle> {
    with(|_, k| k.current())
}

pub fn ticks() -> u64 {
    with(|_, k| k.ticks())
}

/// Look a task up by tid or name.
pub fn find<'a>(key: impl Into<TaskKey<'a>>) -> Option<TaskHandle> {
    let key = key.into();
    with(|_, k| k.find(key))
}

/// Write the task table to `out`. The table is copied with interrupts
/// disabled; `out` runs with them enabled.
pub fn dump(out: &mut dyn fmt::Write) -> fmt::Result {
    let snapshot = with(|_, k| k.snapshot());
    snapshot.write_to(out)
}

/// Diagnostic print, routed through the logger.
pub fn print(args: fmt::Arguments<'_>) {
    log::info!("{}", args);
}

/// Timer interrupt entry.
pub fn tick() {
    with(|_, k| {
        k.tick();
    });
}

// ---------------------------------------------------------------------------
// Task return paths and idle
// ---------------------------------------------------------------------------

/// Where a task's entry function returns to.
pub(crate) extern "C" fn task_return() -> ! {
    exit()
}

/// Where a child task's entry function returns to.
pub(crate) extern "C" fn child_return() -> ! {
    if let Err(e) = with(|_, k| k.finish_child()) {
        fatal(format_args!("child return: {}", e));
    }
    loop {
        arch::idle_wait(IdleMode::Spin);
    }
}

#[cfg_attr(not(all(target_arch = "arm", target_os = "none")), allow(dead_code))]
extern "C" fn idle_task(_: *mut ()) {
    let mode = with(|_, k| k.config().idle);
    loop {
        arch::idle_wait(mode);
    }
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::arch::host::{self, SimCpu};
    use crate::config::SchedPolicy;
    use crate::scheduler::tests::nop;
    use std::boxed::Box;
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::string::String;
    use std::sync::{Mutex as StdMutex, MutexGuard as StdMutexGuard};

    static SERIAL: StdMutex<()> = StdMutex::new(());

    /// Exclusive use of a fresh global kernel for the rest of the test.
    pub(crate) fn fresh(policy: SchedPolicy) -> StdMutexGuard<'static, ()> {
        let serial = SERIAL.lock().unwrap_or_else(|e| e.into_inner());
        let pool: &'static PagePool = Box::leak(Box::new(PagePool::new()));
        let config = KernelConfig::DEFAULT.with_policy(policy).with_time_slice(3);
        critical_section(|cs| *KERNEL.borrow_ref_mut(cs) = Kernel::new(pool, config));
        host::take_pended();
        host::set_trap_handler(None);
        serial
    }

    pub(crate) fn spawn_task(prio: u8, name: &'static str) -> TaskHandle {
        spawn(nop, core::ptr::null_mut(), Priority::new(prio), name).unwrap()
    }

    /// Start the global kernel on a simulated core.
    pub(crate) fn boot() -> Rc<RefCell<SimCpu>> {
        let cpu = Rc::new(RefCell::new(SimCpu::new()));
        with(|_, k| cpu.borrow_mut().boot(k));
        cpu
    }

    pub(crate) fn trap(cpu: &RefCell<SimCpu>) {
        with(|_, k| cpu.borrow_mut().trap(k));
    }

    /// Run `f` each time the calling task is switched out.
    pub(crate) fn on_trap(f: impl FnMut() + 'static) {
        host::set_trap_handler(Some(Box::new(f)));
    }

    pub(crate) fn current_name() -> &'static str {
        with(|_, k| k.tcb(k.current().unwrap()).unwrap().name)
    }

    pub(crate) fn consistent() -> bool {
        with(|_, k| k.is_consistent())
    }

    /// Writer that calls back into the kernel for every chunk.
    struct KernelAwareSink {
        text: String,
        lookups: usize,
    }

    impl fmt::Write for KernelAwareSink {
        fn write_str(&mut self, s: &str) -> fmt::Result {
            if current().is_some() {
                self.lookups += 1;
            }
            self.text.push_str(s);
            Ok(())
        }
    }

    #[test]
    fn test_dump_writes_outside_critical_section() {
        let _serial = fresh(SchedPolicy::Preemptive);
        spawn_task(3, "alpha");
        spawn_task(6, "beta");
        boot();

        let mut out = KernelAwareSink {
            text: String::new(),
            lookups: 0,
        };
        dump(&mut out).unwrap();
        assert!(out.text.contains("alpha"));
        assert!(out.text.contains("beta"));
        assert!(out.lookups > 0);
    }

    #[test]
    fn test_snapshot_is_taken_at_one_instant() {
        let _serial = fresh(SchedPolicy::Preemptive);
        let alpha = spawn_task(3, "alpha");
        spawn_task(6, "beta");
        let cpu = boot();

        let before = with(|_, k| k.snapshot());
        block(alpha).unwrap();
        trap(&cpu);
        assert_eq!(current_name(), "beta");

        let row = before.rows().find(|r| r.name == "alpha").unwrap();
        assert_eq!(row.status, crate::task::TaskStatus::Running);
        let after = with(|_, k| k.snapshot());
        let row = after.rows().find(|r| r.name == "alpha").unwrap();
        assert_eq!(row.status, crate::task::TaskStatus::Blocked);
        assert_eq!(after.rows().count(), 2);
    }

    #[test]
    fn test_trap_handler_runs_after_switch_request() {
        let _serial = fresh(SchedPolicy::Preemptive);
        spawn_task(3, "a");
        spawn_task(3, "b");
        let cpu = boot();

        let seen = Rc::new(RefCell::new(String::new()));
        let (c, s) = (cpu.clone(), seen.clone());
        on_trap(move || {
            trap(&c);
            s.borrow_mut().push_str(current_name());
        });
        yield_now();
        assert_eq!(*seen.borrow(), "b");
        assert_eq!(current_name(), "b");
        assert!(consistent());
    }
}
