//! # Task Control Block
//!
//! Defines the task model for TickRT. A task is either a periodic callback
//! released every `period_ticks`, or a virtual thread: a resumable state
//! machine that suspends through [`ExecContext`](crate::executor::ExecContext).
//! Neither owns a hardware stack; the saved state is the TCB's resume point
//! plus whatever the thread value itself holds.

use core::cmp::Ordering;
use core::fmt;

use crate::config::{DEFAULT_THREAD_DEADLINE_TICKS, MAX_INTERVAL_TICKS};
use crate::error::{ConfigError, Fault};
use crate::executor::VirtualThread;
use crate::tick::Tick;

// ---------------------------------------------------------------------------
// Identity and priority
// ---------------------------------------------------------------------------

/// Stable task identity: the slot index in the scheduler's table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub u16);

impl TaskId {
    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Static priority class. `High > Medium > Low`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Priority {
    Low,
    Medium,
    High,
}

// ---------------------------------------------------------------------------
// Task state machine
// ---------------------------------------------------------------------------

/// Execution state of a task.
///
/// ```text
///                 select()
///   ┌──────────┐ ─────────► ┌─────────┐  fault  ┌─────────┐
///   │  Ready   │            │ Running │ ──────► │ Faulted │
///   └──────────┘ ◄───────── └─────────┘         └─────────┘
///        ▲          yield        │
///        │                       │ sleep_until / complete
///        │   wake tick reached   ▼
///        └──────────────── ┌──────────┐
///                          │ Sleeping │
///                          └──────────┘
/// ```
///
/// Faulted is terminal: the scheduler never selects the task again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Ready,
    Sleeping(Tick),
    Running,
    Faulted,
}

// ---------------------------------------------------------------------------
// Task configuration (immutable after creation)
// ---------------------------------------------------------------------------

/// Parameters for a periodic task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskConfig {
    /// Release interval in ticks. Positive and at most
    /// [`MAX_INTERVAL_TICKS`].
    pub period_ticks: u32,
    pub priority: Priority,
}

impl TaskConfig {
    pub const fn periodic(period_ticks: u32, priority: Priority) -> Self {
        Self { period_ticks, priority }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.period_ticks {
            0 => Err(ConfigError::ZeroPeriod),
            ticks if ticks > MAX_INTERVAL_TICKS => Err(ConfigError::IntervalTooLong(ticks)),
            _ => Ok(()),
        }
    }
}

/// Parameters for a virtual thread.
///
/// A thread's deadline is `deadline_ticks` after the tick it last became
/// eligible (registration, yield, or wake). Among equal priorities it
/// competes with periodic tasks on that deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadConfig {
    pub priority: Priority,
    pub deadline_ticks: u32,
}

impl ThreadConfig {
    pub const fn new(priority: Priority) -> Self {
        Self {
            priority,
            deadline_ticks: DEFAULT_THREAD_DEADLINE_TICKS,
        }
    }

    pub const fn with_deadline(mut self, ticks: u32) -> Self {
        self.deadline_ticks = ticks;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.deadline_ticks {
            0 => Err(ConfigError::ZeroDeadline),
            ticks if ticks > MAX_INTERVAL_TICKS => Err(ConfigError::IntervalTooLong(ticks)),
            _ => Ok(()),
        }
    }
}

impl From<Priority> for ThreadConfig {
    fn from(priority: Priority) -> Self {
        Self::new(priority)
    }
}

/// Control logic invoked once per release with the current tick.
pub type PeriodicFn = fn(Tick) -> Result<(), Fault>;

/// What the executor resumes.
pub enum TaskBody {
    Periodic(PeriodicFn),
    Thread(&'static mut dyn VirtualThread),
}

// ---------------------------------------------------------------------------
// Statistics
// ---------------------------------------------------------------------------

/// Per-task counters. Saturating; never reset while the task lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TaskStats {
    /// Completed runs (periodic releases or thread completions).
    pub runs: u32,
    pub deadlines_met: u32,
    pub deadlines_missed: u32,
    /// Voluntary yields and sleeps.
    pub suspensions: u32,
}

// ---------------------------------------------------------------------------
// Task Control Block
// ---------------------------------------------------------------------------

/// Everything the scheduler knows about one task. Stored inline in the
/// scheduler's fixed table.
pub struct TaskControlBlock {
    pub id: TaskId,

    /// Registration order; breaks ties between equal priority and deadline.
    pub seq: u32,

    /// Module generation that owns the task. 0 for boot tasks.
    pub generation: u16,

    pub priority: Priority,

    /// Release interval, or 0 for virtual threads.
    pub period_ticks: u32,

    /// Thread deadline budget, or 0 for periodic tasks.
    pub deadline_ticks: u32,

    pub state: TaskState,

    /// Periodic: end of the current release window. Thread: the tick it
    /// last became eligible plus its deadline budget.
    pub next_deadline: Tick,

    /// Where a virtual thread continues on its next resume. 0 is the start.
    pub resume_point: u16,

    pub body: TaskBody,

    pub stats: TaskStats,
}

impl TaskControlBlock {
    /// Periodic task, first released at `now`.
    pub fn periodic(id: TaskId, seq: u32, generation: u16, config: TaskConfig, callback: PeriodicFn, now: Tick) -> Self {
        Self {
            id,
            seq,
            generation,
            priority: config.priority,
            period_ticks: config.period_ticks,
            deadline_ticks: 0,
            state: TaskState::Ready,
            next_deadline: now.wrapping_add(config.period_ticks),
            resume_point: 0,
            body: TaskBody::Periodic(callback),
            stats: TaskStats::default(),
        }
    }

    /// Virtual thread, Ready at `now` or Sleeping until `wake`.
    pub fn thread(
        id: TaskId,
        seq: u32,
        generation: u16,
        config: ThreadConfig,
        wake: Option<Tick>,
        thread: &'static mut dyn VirtualThread,
        now: Tick,
    ) -> Self {
        let (state, eligible) = match wake {
            Some(at) if !at.is_reached(now) => (TaskState::Sleeping(at), at),
            _ => (TaskState::Ready, now),
        };
        Self {
            id,
            seq,
            generation,
            priority: config.priority,
            period_ticks: 0,
            deadline_ticks: config.deadline_ticks,
            state,
            next_deadline: eligible.wrapping_add(config.deadline_ticks),
            resume_point: 0,
            body: TaskBody::Thread(thread),
            stats: TaskStats::default(),
        }
    }

    #[inline]
    pub fn is_periodic(&self) -> bool {
        self.period_ticks > 0
    }

    #[inline]
    pub fn is_runnable(&self) -> bool {
        self.state == TaskState::Ready
    }

    /// Start of the current release window for periodic tasks.
    #[inline]
    pub fn release_tick(&self) -> Tick {
        self.next_deadline.wrapping_sub(self.period_ticks)
    }

    /// Threads restart their deadline budget from `at`. Periodic deadlines
    /// follow the release grid instead.
    fn mark_eligible(&mut self, at: Tick) {
        if !self.is_periodic() {
            self.next_deadline = at.wrapping_add(self.deadline_ticks);
        }
    }

    /// Sleeping → Ready once the wake tick has arrived.
    pub fn wake_if_due(&mut self, now: Tick) -> bool {
        if let TaskState::Sleeping(at) = self.state {
            if at.is_reached(now) {
                self.state = TaskState::Ready;
                self.mark_eligible(at);
                return true;
            }
        }
        false
    }

    /// Voluntary yield: Ready again immediately, behind every equal-priority
    /// task whose deadline falls before `now` plus the budget.
    pub fn record_yield(&mut self, resume_at: u16, now: Tick) {
        self.resume_point = resume_at;
        self.state = TaskState::Ready;
        self.mark_eligible(now);
        self.stats.suspensions = self.stats.suspensions.saturating_add(1);
    }

    /// Sleep request. A wake tick that is not in the future degrades to a
    /// yield: Ready on the very next scheduling decision.
    pub fn record_sleep(&mut self, until: Tick, resume_at: u16, now: Tick) {
        self.resume_point = resume_at;
        self.stats.suspensions = self.stats.suspensions.saturating_add(1);
        if until.is_reached(now) {
            self.state = TaskState::Ready;
            self.mark_eligible(now);
        } else {
            self.state = TaskState::Sleeping(until);
            self.mark_eligible(until);
        }
    }

    /// Periodic run finished. Advances the deadline by exactly one period
    /// and sleeps until the next release. Returns whether the deadline was
    /// met.
    pub fn record_completion(&mut self, now: Tick) -> bool {
        self.resume_point = 0;
        self.stats.runs = self.stats.runs.saturating_add(1);
        let met = now.cmp_wrapping(self.next_deadline) == Ordering::Less;
        if met {
            self.stats.deadlines_met = self.stats.deadlines_met.saturating_add(1);
        } else {
            self.stats.deadlines_missed = self.stats.deadlines_missed.saturating_add(1);
        }
        self.next_deadline = self.next_deadline.wrapping_add(self.period_ticks);
        let release = self.release_tick();
        self.state = if release.is_reached(now) {
            TaskState::Ready
        } else {
            TaskState::Sleeping(release)
        };
        met
    }

    /// Scheduling order: higher priority, then earlier deadline, then
    /// earlier registration. `Less` means `self` runs first.
    pub fn precedence(&self, other: &TaskControlBlock) -> Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| self.next_deadline.cmp_wrapping(other.next_deadline))
            .then_with(|| self.seq.cmp(&other.seq))
    }
}

impl fmt::Debug for TaskControlBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskControlBlock")
            .field("id", &self.id)
            .field("seq", &self.seq)
            .field("generation", &self.generation)
            .field("priority", &self.priority)
            .field("period_ticks", &self.period_ticks)
            .field("state", &self.state)
            .field("next_deadline", &self.next_deadline)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------
