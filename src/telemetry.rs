//! # Telemetry
//!
//! Structured records bound for the persistent log sink, and the
//! fixed-capacity buffer that holds them until a flush.
//!
//! Every record pushed into a [`TelemetryBuffer`] is mirrored to the `log`
//! facade at the record's level, so a serial logger sees the same events the
//! persistent sink eventually receives.

use core::fmt;

use log::Level;
use thiserror::Error;

use crate::config::{SafeStatePolicy, TELEMETRY_CAPACITY};
use crate::panic::ErrorContext;
use crate::task::{Priority, TaskId};
use crate::tick::Tick;

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// A captured error context, flushed by the panic handler.
    Fault(ErrorContext),
    TaskRegistered { task: TaskId, priority: Priority },
    TaskFaulted { task: TaskId },
    TaskRetired { task: TaskId },
    DeadlineMissed { task: TaskId, deadline: Tick },
    ModuleActivated { version: u32, entry: u8 },
    ModuleRejected { version: Option<u32> },
    FallbackActivated { version: u32 },
    NoController,
    OutputsDisabled { attempts: u8, ok: bool },
    SafeStateEntered { policy: SafeStatePolicy },
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Event::Fault(ctx) => write!(
                f,
                "fault {:?} ({:?}) in {:?} at {}",
                ctx.code(),
                ctx.severity(),
                ctx.task(),
                ctx.tick()
            ),
            Event::TaskRegistered { task, priority } => {
                write!(f, "task {} registered at {:?}", task, priority)
            }
            Event::TaskFaulted { task } => write!(f, "task {} quarantined", task),
            Event::TaskRetired { task } => write!(f, "task {} retired", task),
            Event::DeadlineMissed { task, deadline } => {
                write!(f, "task {} missed deadline {}", task, deadline)
            }
            Event::ModuleActivated { version, entry } => {
                write!(f, "module v{} active (entry {})", version, entry)
            }
            Event::ModuleRejected { version } => write!(f, "module rejected (v{:?})", version),
            Event::FallbackActivated { version } => {
                write!(f, "fell back to last-known-good v{}", version)
            }
            Event::NoController => write!(f, "no verified controller module"),
            Event::OutputsDisabled { attempts, ok } => {
                write!(f, "outputs disabled={} after {} attempt(s)", ok, attempts)
            }
            Event::SafeStateEntered { policy } => write!(f, "safe state, then {:?}", policy),
        }
    }
}

/// One append-only entry for the sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogRecord {
    pub tick: Tick,
    pub level: Level,
    pub event: Event,
}

impl LogRecord {
    pub const fn new(tick: Tick, level: Level, event: Event) -> Self {
        Self { tick, level, event }
    }
}

/// Why the sink refused a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SinkError {
    #[error("sink busy")]
    Busy,
    #[error("sink full")]
    Full,
    #[error("sink I/O error {0}")]
    Io(u16),
}

/// Append-only destination for records (flash log, UART, radio).
///
/// Implementations must return in bounded time. Return [`SinkError::Busy`]
/// rather than waiting: the safe-state sequence calls this with a fixed
/// retry budget and then moves on.
pub trait LogSink {
    fn append(&mut self, record: &LogRecord) -> Result<(), SinkError>;
}

/// Result of draining records into a sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FlushReport {
    pub written: usize,
    /// Records still buffered because the sink kept failing.
    pub stranded: usize,
}

/// Write one record with at most `attempts` tries.
pub(crate) fn append_with_retry<S: LogSink + ?Sized>(
    sink: &mut S,
    record: &LogRecord,
    attempts: u8,
) -> bool {
    for attempt in 1..=attempts.max(1) {
        match sink.append(record) {
            Ok(()) => return true,
            Err(err) => log::trace!("sink append attempt {} failed: {}", attempt, err),
        }
    }
    false
}

/// Buffer size the runtime uses.
pub type Telemetry = TelemetryBuffer<TELEMETRY_CAPACITY>;

/// Ring of records waiting for the sink. Full buffers evict the oldest
/// record and count it in [`TelemetryBuffer::dropped`].
pub struct TelemetryBuffer<const N: usize> {
    records: [Option<LogRecord>; N],
    head: usize,
    len: usize,
    dropped: u32,
}

impl<const N: usize> TelemetryBuffer<N> {
    pub const fn new() -> Self {
        Self {
            records: [None; N],
            head: 0,
            len: 0,
            dropped: 0,
        }
    }

    /// Buffer a record and mirror it to the `log` facade.
    pub fn push(&mut self, record: LogRecord) {
        log::log!(record.level, "[{}] {}", record.tick, record.event);
        if N == 0 {
            self.dropped = self.dropped.saturating_add(1);
            return;
        }
        if self.len == N {
            self.head = (self.head + 1) % N;
            self.len -= 1;
            self.dropped = self.dropped.saturating_add(1);
        }
        let tail = (self.head + self.len) % N;
        self.records[tail] = Some(record);
        self.len += 1;
    }

    pub fn record(&mut self, tick: Tick, level: Level, event: Event) {
        self.push(LogRecord::new(tick, level, event));
    }

    pub fn front(&self) -> Option<&LogRecord> {
        if self.len == 0 {
            return None;
        }
        self.records[self.head].as_ref()
    }

    pub fn pop_front(&mut self) -> Option<LogRecord> {
        if self.len == 0 {
            return None;
        }
        let record = self.records[self.head].take();
        self.head = (self.head + 1) % N;
        self.len -= 1;
        record
    }

    /// Oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &LogRecord> + '_ {
        (0..self.len).filter_map(move |i| self.records[(self.head + i) % N].as_ref())
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Records evicted because the buffer was full.
    #[inline]
    pub fn dropped(&self) -> u32 {
        self.dropped
    }

    /// Drain oldest-first into `sink`. A record that still fails after
    /// `attempts` tries stops the flush and stays buffered.
    pub fn flush<S: LogSink + ?Sized>(&mut self, sink: &mut S, attempts: u8) -> FlushReport {
        let mut report = FlushReport::default();
        while let Some(record) = self.front() {
            if !append_with_retry(sink, record, attempts) {
                break;
            }
            self.pop_front();
            report.written += 1;
        }
        report.stranded = self.len;
        report
    }
}

impl<const N: usize> Default for TelemetryBuffer<N> {
    fn default() -> Self {
        Self::new()
    }
}
