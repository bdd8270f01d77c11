//! # KeelOS Example Firmware
//!
//! Four tasks exercising the kernel:
//!
//! | Task | Priority | Behavior |
//! |------|----------|----------|
//! | `sampler` | 3 | Produces a reading every 10 ticks into a queue |
//! | `reporter` | 4 | Drains the queue, prints under the console mutex |
//! | `supervisor` | 5 | Awaits a checksum child task, dumps the task table |
//! | `spinner` | 6 | Never blocks; shows round-robin at the bottom |
//!
//! Output goes through `log`; register a logger before `kernel::start` to
//! see it.

#![no_std]
#![no_main]

use core::fmt;

use cortex_m_rt::entry;
use panic_halt as _;

use keelos::error::fatal;
use keelos::{kernel, ChildTask, MessageQueue, Mutex, Priority, WAIT_FOREVER};

static READINGS: MessageQueue<u32, 4> = MessageQueue::new();
static CONSOLE: Mutex = Mutex::new();

/// Routes `dump` output line by line into the logger.
struct LogSink;

impl fmt::Write for LogSink {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for line in s.lines().filter(|l| !l.is_empty()) {
            kernel::print(format_args!("{}", line));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Task entry points
// ---------------------------------------------------------------------------

extern "C" fn sampler(_: *mut ()) {
    let mut reading: u32 = 0;
    loop {
        reading = reading.wrapping_add(17) % 1000;
        if let Err(e) = READINGS.send(reading, 100) {
            let _console = CONSOLE.lock();
            kernel::print(format_args!("sampler: {}", e));
        }
        kernel::delay(10);
    }
}

extern "C" fn reporter(_: *mut ()) {
    loop {
        match READINGS.recv(WAIT_FOREVER) {
            Ok(value) => {
                let _console = CONSOLE.lock();
                kernel::print(format_args!("reading {}", value));
            }
            Err(e) => kernel::print(format_args!("reporter: {}", e)),
        }
    }
}

/// Child: sums `1..=100` into the `u32` behind `arg`.
extern "C" fn checksum(arg: *mut ()) {
    let out = arg as *mut u32;
    // Safety: the parent is blocked in `join` and keeps `out` alive.
    unsafe { *out = (1..=100).sum() };
}

extern "C" fn supervisor(_: *mut ()) {
    loop {
        let mut sum: u32 = 0;
        let arg = &mut sum as *mut u32 as *mut ();
        match ChildTask::spawn(checksum, arg, Priority::new(4), "checksum").and_then(ChildTask::join) {
            Ok(()) => {
                let _console = CONSOLE.lock();
                kernel::print(format_args!("checksum {}", sum));
                let _ = kernel::dump(&mut LogSink);
            }
            Err(e) => kernel::print(format_args!("supervisor: {}", e)),
        }
        kernel::delay(1000);
    }
}

extern "C" fn spinner(_: *mut ()) {
    let mut spins: u32 = 0;
    loop {
        spins = spins.wrapping_add(1);
    }
}

// ---------------------------------------------------------------------------
// Main entry point
// ---------------------------------------------------------------------------

#[entry]
fn main() -> ! {
    let Some(cp) = cortex_m::Peripherals::take() else {
        fatal(format_args!("core peripherals already taken"));
    };

    let tasks: [(keelos::TaskEntry, u8, &'static str); 4] = [
        (sampler, 3, "sampler"),
        (reporter, 4, "reporter"),
        (supervisor, 5, "supervisor"),
        (spinner, 6, "spinner"),
    ];
    for (entry, prio, name) in tasks {
        if let Err(e) = kernel::spawn(entry, core::ptr::null_mut(), Priority::new(prio), name) {
            fatal(format_args!("spawn {}: {}", name, e));
        }
    }

    kernel::start(cp)
}
