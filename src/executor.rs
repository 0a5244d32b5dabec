//! # Virtual-Thread Executor
//!
//! Runs one task up to its next suspension point and hands control back to
//! the scheduler.
//!
//! Tasks are stackless state machines. Instead of saving registers, a task
//! returns a [`Suspend`] and records where it wants to continue as a
//! `resume_point` in its TCB. On the next resume it reads that point back
//! from [`ExecContext::resume_point`] and jumps there with a `match`:
//!
//! ```ignore
//! impl VirtualThread for Sampler {
//!     fn resume(&mut self, cx: &mut ExecContext) -> Result<Suspend, Fault> {
//!         match cx.resume_point() {
//!             0 => {
//!                 self.adc.start()?;
//!                 Ok(cx.sleep_until(cx.now().wrapping_add(2), 1))
//!             }
//!             _ => {
//!                 self.last = self.adc.read()?;
//!                 Ok(cx.complete())
//!             }
//!         }
//!     }
//! }
//! ```
//!
//! ## Cooperative only
//!
//! The executor never interrupts a running task. A task that loops without
//! returning blocks the whole system, timer ticks included as far as task
//! scheduling is concerned. Returning promptly is the task author's
//! obligation.

use crate::config::MAX_INTERVAL_TICKS;
use crate::error::{Fault, FaultCode};
use crate::task::{TaskBody, TaskControlBlock, TaskId};
use crate::tick::Tick;

/// How a resume ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Suspend {
    /// Give up the rest of the slot; Ready for the next decision.
    Yield { resume_at: u16 },
    /// Sleep until the tick; Ready once `current_tick() >= tick`.
    SleepUntil { tick: Tick, resume_at: u16 },
    /// Run finished. Periodic tasks wait for their next release; threads
    /// are retired.
    Complete,
}

/// A resumable unit of work with a fixed footprint.
pub trait VirtualThread {
    fn resume(&mut self, cx: &mut ExecContext) -> Result<Suspend, Fault>;
}

/// View of the scheduler a task gets while it runs.
pub struct ExecContext {
    now: Tick,
    task: TaskId,
    resume_point: u16,
}

impl ExecContext {
    pub(crate) fn new(now: Tick, task: TaskId, resume_point: u16) -> Self {
        Self {
            now,
            task,
            resume_point,
        }
    }

    /// Tick at which this resume started.
    #[inline]
    pub fn now(&self) -> Tick {
        self.now
    }

    #[inline]
    pub fn task_id(&self) -> TaskId {
        self.task
    }

    /// Point recorded by the previous suspension. 0 on first resume and
    /// after `complete`.
    #[inline]
    pub fn resume_point(&self) -> u16 {
        self.resume_point
    }

    /// Relinquish the remainder of this scheduling slot.
    #[inline]
    pub fn yield_now(&self, resume_at: u16) -> Suspend {
        Suspend::Yield { resume_at }
    }

    /// Sleep until `tick`. A tick that is not in the future still yields
    /// once.
    #[inline]
    pub fn sleep_until(&self, tick: Tick, resume_at: u16) -> Suspend {
        Suspend::SleepUntil { tick, resume_at }
    }

    /// Sleep for `ticks` from the start of this resume.
    ///
    /// A sleep longer than [`MAX_INTERVAL_TICKS`] cannot be told apart from
    /// a tick in the past and is refused as a contract fault.
    #[inline]
    pub fn sleep_for(&self, ticks: u32, resume_at: u16) -> Result<Suspend, Fault> {
        if ticks > MAX_INTERVAL_TICKS {
            return Err(Fault::at(FaultCode::Contract, "sleep_for").frame("interval", Some(ticks)));
        }
        Ok(self.sleep_until(self.now.wrapping_add(ticks), resume_at))
    }

    #[inline]
    pub fn complete(&self) -> Suspend {
        Suspend::Complete
    }
}

/// Resume `tcb` once. The caller owns the state transition that follows.
pub(crate) fn resume(tcb: &mut TaskControlBlock, now: Tick) -> Result<Suspend, Fault> {
    match &mut tcb.body {
        TaskBody::Periodic(callback) => (*callback)(now).map(|()| Suspend::Complete),
        TaskBody::Thread(thread) => {
            let mut cx = ExecContext::new(now, tcb.id, tcb.resume_point);
            thread.resume(&mut cx)
        }
    }
}
