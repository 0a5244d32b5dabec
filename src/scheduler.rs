//! # Scheduler
//!
//! Static-priority soft-real-time scheduler over a fixed task table.
//!
//! ## Scheduling Algorithm
//!
//! On every decision (after a timer tick, and after every yield, sleep or
//! completion):
//! 1. **Wake**: promote Sleeping tasks whose wake tick has arrived to Ready
//! 2. **Select**: among Ready tasks pick the highest [`Priority`](crate::task::Priority), then the
//!    earliest deadline, then the earliest registration
//! 3. **Run**: mark it Running, resume it through the executor, apply the
//!    suspension it returns, and go back to 1
//!
//! The order is total and deterministic. There is no aging: a High task
//! that is always Ready starves everything below it. This is a soft
//! real-time guarantee, not a hard one.
//!
//! ## Generations
//!
//! Module tasks are tagged with the generation of the module that
//! registered them. Boot tasks use generation 0 and are always visible.
//! A reload registers the incoming module's tasks under a staging
//! generation that [`Scheduler::select`] ignores, then
//! [`Scheduler::commit_generation`] flips `active_generation` in one store.
//! The scheduler never sees a mix of old and new module tasks.

use crate::config::MAX_TASKS;
use crate::error::{ConfigError, Fault};
use crate::executor::{self, Suspend, VirtualThread};
use crate::task::{PeriodicFn, TaskConfig, TaskControlBlock, TaskId, TaskState, TaskStats, ThreadConfig};
use crate::tick::Tick;

/// Generation of tasks registered outside any module.
pub const BOOT_GENERATION: u16 = 0;

const EMPTY_SLOT: Option<TaskControlBlock> = None;

/// How a resumed task handed control back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Yielded,
    Sleeping(Tick),
    /// Periodic release finished.
    Completed { deadline_met: bool },
    /// Virtual thread finished; its slot is free.
    Retired,
}

/// Result of one scheduling decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Nothing was Ready.
    Idle,
    Ran { task: TaskId, outcome: Outcome },
    /// The task returned a fault and is now Faulted.
    Faulted { task: TaskId, fault: Fault },
}

// ---------------------------------------------------------------------------
// Scheduler struct
// ---------------------------------------------------------------------------

/// Task table plus scheduling state. Owned by the mainline
/// [`Runtime`](crate::kernel::Runtime); the timer ISR never touches it.
pub struct Scheduler {
    /// Fixed-size table. `TaskId` is the slot index.
    tasks: [Option<TaskControlBlock>; MAX_TASKS],

    /// Occupied slots.
    task_count: usize,

    /// Task being resumed, if any. At most one at a time.
    current_task: Option<TaskId>,

    /// Next registration sequence number.
    next_seq: u32,

    /// Module generation whose tasks are visible. 0 when no module is active.
    active_generation: u16,

    /// Generation currently being staged, if a module is activating.
    staging_generation: Option<u16>,

    last_generation: u16,
}

impl Scheduler {
    pub const fn new() -> Self {
        Self {
            tasks: [EMPTY_SLOT; MAX_TASKS],
            task_count: 0,
            current_task: None,
            next_seq: 0,
            active_generation: BOOT_GENERATION,
            staging_generation: None,
            last_generation: BOOT_GENERATION,
        }
    }

    // -----------------------------------------------------------------------
    // Registration
    // -----------------------------------------------------------------------

    fn free_slot(&self) -> Result<usize, ConfigError> {
        self.tasks
            .iter()
            .position(Option::is_none)
            .ok_or(ConfigError::TableFull { capacity: MAX_TASKS })
    }

    fn take_seq(&mut self) -> u32 {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);
        seq
    }

    /// Register a boot-time periodic task, first released at `now`.
    ///
    /// # Returns
    /// - `Ok(task_id)`: the slot the task occupies
    /// - `Err(ConfigError::ZeroPeriod)`: `period_ticks` was 0
    /// - `Err(ConfigError::TableFull)`: all `MAX_TASKS` slots are taken
    pub fn register_periodic(
        &mut self,
        config: TaskConfig,
        callback: PeriodicFn,
        now: Tick,
    ) -> Result<TaskId, ConfigError> {
        self.register_periodic_in(BOOT_GENERATION, config, callback, now)
    }

    pub(crate) fn register_periodic_in(
        &mut self,
        generation: u16,
        config: TaskConfig,
        callback: PeriodicFn,
        now: Tick,
    ) -> Result<TaskId, ConfigError> {
        config.validate()?;
        let slot = self.free_slot()?;
        let id = TaskId(slot as u16);
        let seq = self.take_seq();
        self.tasks[slot] = Some(TaskControlBlock::periodic(id, seq, generation, config, callback, now));
        self.task_count += 1;
        log::debug!(
            "task {} registered: every {} ticks at {:?} (gen {})",
            id,
            config.period_ticks,
            config.priority,
            generation
        );
        Ok(id)
    }

    /// Register a boot-time virtual thread, Ready now or Sleeping until
    /// `wake`. A bare [`Priority`](crate::task::Priority) gets the default deadline budget.
    ///
    /// `wake` is an absolute tick read within the comparable window: one
    /// that is not ahead of `now` starts the thread Ready.
    pub fn register_thread(
        &mut self,
        config: impl Into<ThreadConfig>,
        wake: Option<Tick>,
        thread: &'static mut dyn VirtualThread,
        now: Tick,
    ) -> Result<TaskId, ConfigError> {
        self.register_thread_in(BOOT_GENERATION, config.into(), wake, thread, now)
    }

    pub(crate) fn register_thread_in(
        &mut self,
        generation: u16,
        config: ThreadConfig,
        wake: Option<Tick>,
        thread: &'static mut dyn VirtualThread,
        now: Tick,
    ) -> Result<TaskId, ConfigError> {
        config.validate()?;
        let slot = self.free_slot()?;
        let id = TaskId(slot as u16);
        let seq = self.take_seq();
        self.tasks[slot] = Some(TaskControlBlock::thread(id, seq, generation, config, wake, thread, now));
        self.task_count += 1;
        log::debug!(
            "thread {} registered at {:?}, deadline budget {} (gen {})",
            id,
            config.priority,
            config.deadline_ticks,
            generation
        );
        Ok(id)
    }

    /// Remove a task and free its slot. Faulted tasks included.
    pub fn unregister(&mut self, id: TaskId) -> Result<(), ConfigError> {
        let slot = self
            .tasks
            .get_mut(id.index())
            .ok_or(ConfigError::UnknownTask(id))?;
        if slot.take().is_none() {
            return Err(ConfigError::UnknownTask(id));
        }
        self.task_count -= 1;
        log::debug!("task {} unregistered", id);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Selection and dispatch
    // -----------------------------------------------------------------------

    #[inline]
    fn is_visible(&self, tcb: &TaskControlBlock) -> bool {
        tcb.generation == BOOT_GENERATION || tcb.generation == self.active_generation
    }

    /// Steps 1 and 2: wake due sleepers, then choose.
    ///
    /// # Returns
    /// The task that should run next, or `None` if nothing is Ready.
    pub fn select(&mut self, now: Tick) -> Option<TaskId> {
        let active = self.active_generation;
        let mut best: Option<&TaskControlBlock> = None;

        for tcb in self.tasks.iter_mut().flatten() {
            if tcb.generation != BOOT_GENERATION && tcb.generation != active {
                continue;
            }
            tcb.wake_if_due(now);
            if !tcb.is_runnable() {
                continue;
            }
            let tcb = &*tcb;
            best = match best {
                Some(current) if current.precedence(tcb).is_le() => Some(current),
                _ => Some(tcb),
            };
        }

        best.map(|tcb| tcb.id)
    }

    /// One full scheduling decision: select, run, apply the suspension.
    pub fn dispatch(&mut self, now: Tick) -> Dispatch {
        let Some(id) = self.select(now) else {
            return Dispatch::Idle;
        };
        let Some(tcb) = self.tasks[id.index()].as_mut() else {
            return Dispatch::Idle;
        };

        tcb.state = TaskState::Running;
        self.current_task = Some(id);
        log::trace!("{}: run {} ({:?})", now, id, tcb.priority);

        let result = executor::resume(tcb, now);
        self.current_task = None;

        let outcome = match result {
            Ok(Suspend::Yield { resume_at }) => {
                tcb.record_yield(resume_at, now);
                Outcome::Yielded
            }
            Ok(Suspend::SleepUntil { tick, resume_at }) => {
                tcb.record_sleep(tick, resume_at, now);
                match tcb.state {
                    TaskState::Sleeping(at) => Outcome::Sleeping(at),
                    _ => Outcome::Yielded,
                }
            }
            Ok(Suspend::Complete) if tcb.is_periodic() => {
                let deadline = tcb.next_deadline;
                let deadline_met = tcb.record_completion(now);
                if !deadline_met {
                    log::warn!("task {} missed deadline {} (finished {})", id, deadline, now);
                }
                Outcome::Completed { deadline_met }
            }
            Ok(Suspend::Complete) => {
                self.tasks[id.index()] = None;
                self.task_count -= 1;
                log::debug!("thread {} retired", id);
                Outcome::Retired
            }
            Err(fault) => {
                tcb.state = TaskState::Faulted;
                return Dispatch::Faulted { task: id, fault };
            }
        };

        Dispatch::Ran { task: id, outcome }
    }

    // -----------------------------------------------------------------------
    // Module generations
    // -----------------------------------------------------------------------

    /// Open a staging generation for an activating module. Tasks registered
    /// under it stay invisible until [`commit_generation`](Self::commit_generation).
    pub fn begin_generation(&mut self) -> u16 {
        if let Some(stale) = self.staging_generation {
            self.abort_generation(stale);
        }
        let mut next = self.last_generation.wrapping_add(1);
        if next == BOOT_GENERATION {
            next = 1;
        }
        self.last_generation = next;
        self.staging_generation = Some(next);
        next
    }

    /// Make `generation` the visible module in one step and drop every task
    /// of the previously active module. Returns the number retired.
    pub fn commit_generation(&mut self, generation: u16) -> usize {
        let previous = self.active_generation;
        self.active_generation = generation;
        if self.staging_generation == Some(generation) {
            self.staging_generation = None;
        }
        if previous == BOOT_GENERATION || previous == generation {
            return 0;
        }
        self.retire_generation(previous)
    }

    /// Discard everything registered under a staging generation.
    pub fn abort_generation(&mut self, generation: u16) -> usize {
        if self.staging_generation == Some(generation) {
            self.staging_generation = None;
        }
        if generation == BOOT_GENERATION || generation == self.active_generation {
            return 0;
        }
        self.retire_generation(generation)
    }

    /// Hide the active module's tasks, leaving only boot tasks.
    pub fn deactivate_modules(&mut self) -> usize {
        let previous = self.active_generation;
        self.active_generation = BOOT_GENERATION;
        if previous == BOOT_GENERATION {
            return 0;
        }
        self.retire_generation(previous)
    }

    fn retire_generation(&mut self, generation: u16) -> usize {
        let mut retired = 0;
        for slot in self.tasks.iter_mut() {
            if slot.as_ref().is_some_and(|tcb| tcb.generation == generation) {
                *slot = None;
                retired += 1;
            }
        }
        self.task_count -= retired;
        retired
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub fn task(&self, id: TaskId) -> Option<&TaskControlBlock> {
        self.tasks.get(id.index()).and_then(Option::as_ref)
    }

    pub fn state(&self, id: TaskId) -> Option<TaskState> {
        self.task(id).map(|tcb| tcb.state)
    }

    pub fn stats(&self, id: TaskId) -> Option<TaskStats> {
        self.task(id).map(|tcb| tcb.stats)
    }

    /// All registered tasks in slot order, staged ones included.
    pub fn iter(&self) -> impl Iterator<Item = &TaskControlBlock> + '_ {
        self.tasks.iter().flatten()
    }

    pub fn task_count(&self) -> usize {
        self.task_count
    }

    /// Tasks registered under `generation`.
    pub fn tasks_in(&self, generation: u16) -> usize {
        self.iter().filter(|tcb| tcb.generation == generation).count()
    }

    pub fn current_task(&self) -> Option<TaskId> {
        self.current_task
    }

    pub fn active_generation(&self) -> u16 {
        self.active_generation
    }

    pub fn staging_generation(&self) -> Option<u16> {
        self.staging_generation
    }

    /// True when a module is active and every one of its tasks is Faulted.
    pub fn module_exhausted(&self) -> bool {
        let active = self.active_generation;
        if active == BOOT_GENERATION {
            return false;
        }
        let mut module = self.iter().filter(|tcb| tcb.generation == active).peekable();
        module.peek().is_some() && module.all(|tcb| tcb.state == TaskState::Faulted)
    }

    /// Earliest wake tick among visible sleepers. Lets an idle loop know
    /// how long it may sleep.
    pub fn next_wake(&self) -> Option<Tick> {
        self.iter()
            .filter(|tcb| self.is_visible(tcb))
            .filter_map(|tcb| match tcb.state {
                TaskState::Sleeping(at) => Some(at),
                _ => None,
            })
            .min_by(|a, b| a.cmp_wrapping(*b))
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Registrar
// ---------------------------------------------------------------------------

/// Registration handle given to a module's `init`. Everything registered
/// through it lands in the module's staging generation.
pub struct Registrar<'a> {
    scheduler: &'a mut Scheduler,
    generation: u16,
    now: Tick,
    registered: usize,
}

impl<'a> Registrar<'a> {
    pub(crate) fn new(scheduler: &'a mut Scheduler, generation: u16, now: Tick) -> Self {
        Self {
            scheduler,
            generation,
            now,
            registered: 0,
        }
    }

    pub fn register_periodic(&mut self, config: TaskConfig, callback: PeriodicFn) -> Result<TaskId, ConfigError> {
        let id = self
            .scheduler
            .register_periodic_in(self.generation, config, callback, self.now)?;
        self.registered += 1;
        Ok(id)
    }

    pub fn register_thread(
        &mut self,
        config: impl Into<ThreadConfig>,
        wake: Option<Tick>,
        thread: &'static mut dyn VirtualThread,
    ) -> Result<TaskId, ConfigError> {
        let id = self
            .scheduler
            .register_thread_in(self.generation, config.into(), wake, thread, self.now)?;
        self.registered += 1;
        Ok(id)
    }

    /// Tick the module is being activated at.
    pub fn now(&self) -> Tick {
        self.now
    }

    pub fn registered(&self) -> usize {
        self.registered
    }
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------
