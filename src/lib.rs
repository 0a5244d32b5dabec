//! # TickRT
//!
//! A deterministic runtime core for small microcontrollers with no OS:
//! a tick clock, a cooperative virtual-thread executor, a static-priority
//! scheduler, a structured panic / safe-state path and a loader for signed
//! controller modules with last-known-good fallback.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────┐
//! │        Boot tasks            Controller modules         │
//! ├────────────────────────────────────────────────────────┤
//! │                Runtime (kernel.rs)                      │
//! │  register_* · dispatch_once · run_until_idle · *_module │
//! ├──────────────┬──────────────┬──────────────┬──────────┤
//! │  Scheduler   │  Executor    │  Panic       │  Loader  │
//! │  select()    │  resume()    │  on_panic()  │  boot()  │
//! │  dispatch()  │  Suspend     │  safe state  │  reload()│
//! │  generations │              │              │  image   │
//! │              │              │              │  verify  │
//! ├──────────────┴──────────────┴──────────────┴──────────┤
//! │   Tick clock (tick.rs) · Telemetry · Capability traits   │
//! ├────────────────────────────────────────────────────────┤
//! │       Arch port (arch/cortex_m4.rs): SysTick · WFI       │
//! └────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Execution Model
//!
//! One thread of control. The SysTick ISR increments the tick counter and
//! raises a reschedule flag; nothing else runs in interrupt context. The
//! mainline repeatedly asks the scheduler for the highest-priority Ready
//! task and resumes it until it yields, sleeps, completes or faults.
//! Tasks never preempt one another.
//!
//! ## Faults
//!
//! A task reports failure by returning `Err(Fault)`. The panic handler
//! captures an [`ErrorContext`](panic::ErrorContext) and decides: task-local
//! faults quarantine the task, global ones (memory corruption, stack
//! overflow, watchdog by default) run the safe-state sequence: outputs off,
//! logs flushed, then halt or reboot.
//!
//! ## Memory Model
//!
//! - **No heap**: every table, ring and image slot is a fixed array
//! - **No `alloc`**: pure `core` outside tests
//! - **Fixed-size task table**: `[Option<TaskControlBlock>; MAX_TASKS]`
//! - **Stackless tasks**: saved state is a `u16` resume point plus whatever
//!   the task value owns
//! - **Critical sections**: `critical-section` for the one multi-step read
//!   that crosses the ISR boundary

#![cfg_attr(not(test), no_std)]

pub mod arch;
pub mod config;
pub mod error;
pub mod executor;
pub mod hal;
pub mod image;
pub mod kernel;
pub mod loader;
pub mod panic;
pub mod scheduler;
pub mod sync;
pub mod task;
pub mod telemetry;
pub mod tick;
pub mod verify;

pub use error::{ConfigError, Error, ErrorKind, Fault, FaultCode, HardwareFault, VerificationFailure};
pub use executor::{ExecContext, Suspend, VirtualThread};
pub use kernel::{PassSummary, Runtime, Step};
pub use loader::{LoadOutcome, ModuleEntry, ModuleLoader, ModuleStore};
pub use task::{Priority, TaskConfig, TaskId, ThreadConfig};
pub use tick::{Tick, TickClock};
