//! # Panic / Safe-State Handler
//!
//! Faults raised by task logic land here instead of halting the system.
//! The handler captures an [`ErrorContext`] into a ring reserved at boot,
//! classifies the fault, and either isolates the task or drives the system
//! into the safe state.
//!
//! ## Safe-state sequence
//!
//! ```text
//!   enter_safe_state()
//!     ├─► 1. OutputBank::disable_all()   (bounded retry, then continue)
//!     ├─► 2. flush contexts + telemetry   (bounded retry per record)
//!     └─► 3. SystemControl::halt() | reboot()
//! ```
//!
//! Each step runs even when the previous one failed. A fault raised while the
//! sequence is in progress re-enters it at most
//! [`SAFE_STATE_REENTRY_LIMIT`] times; past that the handler halts without
//! touching outputs or the sink again.

use core::sync::atomic::{AtomicU8, Ordering};

use log::Level;

use crate::config::{RuntimeConfig, SafeStatePolicy, MAX_CAUSE_FRAMES, MAX_PENDING_CONTEXTS, SAFE_STATE_REENTRY_LIMIT};
use crate::error::{ErrorKind, Fault, FaultCode};
use crate::hal::{OutputBank, SystemControl};
use crate::task::TaskId;
use crate::telemetry::{append_with_retry, Event, LogRecord, LogSink, TelemetryBuffer};
use crate::tick::Tick;

// ---------------------------------------------------------------------------
// Causal frames
// ---------------------------------------------------------------------------

/// One link in a fault's causal chain: a short location tag plus an
/// optional numeric detail (register value, error code, channel).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CauseFrame {
    pub tag: &'static str,
    pub detail: Option<u32>,
}

/// Fixed-capacity chain of frames, innermost first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameChain {
    frames: [Option<CauseFrame>; MAX_CAUSE_FRAMES],
    len: u8,
    dropped: u8,
}

impl FrameChain {
    pub const fn new() -> Self {
        Self {
            frames: [None; MAX_CAUSE_FRAMES],
            len: 0,
            dropped: 0,
        }
    }

    /// Append a frame, or count it when the chain is full.
    pub fn push(&mut self, frame: CauseFrame) {
        let len = self.len as usize;
        if len < MAX_CAUSE_FRAMES {
            self.frames[len] = Some(frame);
            self.len += 1;
        } else {
            self.dropped = self.dropped.saturating_add(1);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &CauseFrame> + '_ {
        self.frames[..self.len as usize].iter().flatten()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len as usize
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Frames that did not fit.
    #[inline]
    pub fn dropped(&self) -> u8 {
        self.dropped
    }
}

impl Default for FrameChain {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Error context
// ---------------------------------------------------------------------------

/// How far a fault reaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Quarantine the originating task, keep running the rest.
    TaskLocal,
    /// Nothing can be trusted; enter the safe state.
    Global,
}

/// Immutable record of one fault. Fields are read-only after capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorContext {
    kind: ErrorKind,
    code: FaultCode,
    severity: Severity,
    task: Option<TaskId>,
    tick: Tick,
    frames: FrameChain,
}

impl ErrorContext {
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn code(&self) -> FaultCode {
        self.code
    }

    pub fn severity(&self) -> Severity {
        self.severity
    }

    pub fn task(&self) -> Option<TaskId> {
        self.task
    }

    pub fn tick(&self) -> Tick {
        self.tick
    }

    pub fn frames(&self) -> &FrameChain {
        &self.frames
    }
}

/// What the caller must do after [`PanicHandler::on_panic`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Mark this task Faulted; other tasks keep running.
    Isolate(TaskId),
    /// Run [`PanicHandler::enter_safe_state`].
    SafeState,
}

// ---------------------------------------------------------------------------
// Reentry guard
// ---------------------------------------------------------------------------

/// Counts safe-state entries that have not finished.
///
/// A fault inside the sequence (an output driver that panics, a sink that
/// corrupts memory) re-enters it. The guard lets that happen a bounded
/// number of times before forcing a halt.
pub struct ReentryGuard {
    depth: AtomicU8,
}

/// Result of [`ReentryGuard::enter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entry {
    /// Depth after entering. 1 is the first entry.
    Run(u8),
    /// Limit exceeded; halt now.
    Exhausted,
}

impl ReentryGuard {
    pub const fn new() -> Self {
        Self {
            depth: AtomicU8::new(0),
        }
    }

    /// Count one more entry. Past the limit the depth stays where it is,
    /// so any number of refused entries keeps reporting `Exhausted`.
    pub fn enter(&self) -> Entry {
        match self
            .depth
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |d| {
                (d < SAFE_STATE_REENTRY_LIMIT).then(|| d + 1)
            }) {
            Ok(previous) => Entry::Run(previous + 1),
            Err(_) => Entry::Exhausted,
        }
    }

    pub fn exit(&self) {
        let _ = self
            .depth
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |d| Some(d.saturating_sub(1)));
    }

    pub fn depth(&self) -> u8 {
        self.depth.load(Ordering::Acquire)
    }
}

impl Default for ReentryGuard {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Safe-state outcome
// ---------------------------------------------------------------------------

/// Final step taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SafeStateAction {
    Halted,
    Rebooted,
    /// Reentry limit hit; outputs and sink were not touched again.
    ForcedHalt,
}

/// What the safe-state sequence managed to do. Only observable on hosts
/// where [`SystemControl`] returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SafeStateReport {
    pub outputs_disabled: bool,
    pub output_attempts: u8,
    pub records_flushed: usize,
    pub records_stranded: usize,
    pub action: SafeStateAction,
}

/// Step 1: zero every actuator, retrying up to `limit` times.
fn disable_outputs<O: OutputBank + ?Sized>(outputs: &mut O, limit: u8) -> (bool, u8) {
    let limit = limit.max(1);
    for attempt in 1..=limit {
        match outputs.disable_all() {
            Ok(()) => return (true, attempt),
            Err(err) => log::error!("disable outputs attempt {}: {}", attempt, err),
        }
    }
    (false, limit)
}

/// Step 3.
fn finish<C: SystemControl + ?Sized>(control: &mut C, policy: SafeStatePolicy) -> SafeStateAction {
    match policy {
        SafeStatePolicy::Halt => {
            control.halt();
            SafeStateAction::Halted
        }
        SafeStatePolicy::Reboot => {
            control.reboot();
            SafeStateAction::Rebooted
        }
    }
}

/// Safe-state path for contexts that cannot reach a [`PanicHandler`], such
/// as a `#[panic_handler]`. Disables outputs and halts or reboots; there is
/// no log flush because the buffers belong to the mainline.
pub fn fatal<O, C>(guard: &ReentryGuard, outputs: &mut O, control: &mut C, config: &RuntimeConfig) -> SafeStateAction
where
    O: OutputBank + ?Sized,
    C: SystemControl + ?Sized,
{
    match guard.enter() {
        Entry::Exhausted => {
            control.halt();
            SafeStateAction::ForcedHalt
        }
        Entry::Run(_) => {
            disable_outputs(outputs, config.output_retry_limit);
            let action = finish(control, config.safe_state_policy);
            guard.exit();
            action
        }
    }
}

// ---------------------------------------------------------------------------
// Handler
// ---------------------------------------------------------------------------

/// Captures faults and owns their contexts until they reach the sink.
pub struct PanicHandler {
    config: RuntimeConfig,
    contexts: [Option<ErrorContext>; MAX_PENDING_CONTEXTS],
    head: usize,
    len: usize,
    /// Contexts overwritten before a flush.
    overwritten: u32,
    /// Contexts captured since boot.
    captured: u32,
    guard: ReentryGuard,
}

impl PanicHandler {
    pub const fn new(config: RuntimeConfig) -> Self {
        Self {
            config,
            contexts: [None; MAX_PENDING_CONTEXTS],
            head: 0,
            len: 0,
            overwritten: 0,
            captured: 0,
            guard: ReentryGuard::new(),
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Severity rule: codes in `RuntimeConfig::global_faults` are global,
    /// everything else stays with the task that raised it.
    pub fn classify(&self, code: FaultCode) -> Severity {
        if self.config.global_faults.contains(code) {
            Severity::Global
        } else {
            Severity::TaskLocal
        }
    }

    /// A task returned `Err(fault)`, or the bootstrap layer signalled one
    /// (`task == None`). Captures context and decides disposition.
    pub fn on_panic(&mut self, fault: &Fault, task: Option<TaskId>, tick: Tick) -> Disposition {
        let severity = self.classify(fault.code());
        let ctx = self.capture(fault.code(), severity, *fault.frames(), task, tick);
        log::error!(
            "fault {:?} in task {:?} at {} ({} frame(s), {:?})",
            ctx.code,
            ctx.task,
            ctx.tick,
            ctx.frames.len(),
            ctx.severity
        );
        match (severity, task) {
            (Severity::TaskLocal, Some(id)) => Disposition::Isolate(id),
            _ => Disposition::SafeState,
        }
    }

    /// Record a fault that is handled elsewhere (rejected image, failed
    /// registration). Never changes disposition.
    pub fn report(&mut self, fault: &Fault, task: Option<TaskId>, tick: Tick) -> ErrorContext {
        let ctx = self.capture(fault.code(), Severity::TaskLocal, *fault.frames(), task, tick);
        log::warn!("{:?} recorded at {} ({} frame(s))", ctx.code, ctx.tick, ctx.frames.len());
        ctx
    }

    fn capture(
        &mut self,
        code: FaultCode,
        severity: Severity,
        frames: FrameChain,
        task: Option<TaskId>,
        tick: Tick,
    ) -> ErrorContext {
        let ctx = ErrorContext {
            kind: code.kind(),
            code,
            severity,
            task,
            tick,
            frames,
        };
        if self.len == MAX_PENDING_CONTEXTS {
            self.head = (self.head + 1) % MAX_PENDING_CONTEXTS;
            self.len -= 1;
            self.overwritten = self.overwritten.saturating_add(1);
        }
        let tail = (self.head + self.len) % MAX_PENDING_CONTEXTS;
        self.contexts[tail] = Some(ctx);
        self.len += 1;
        self.captured = self.captured.saturating_add(1);
        ctx
    }

    /// Unflushed contexts, oldest first.
    pub fn pending(&self) -> impl Iterator<Item = &ErrorContext> + '_ {
        (0..self.len).filter_map(move |i| self.contexts[(self.head + i) % MAX_PENDING_CONTEXTS].as_ref())
    }

    pub fn last(&self) -> Option<&ErrorContext> {
        if self.len == 0 {
            return None;
        }
        self.contexts[(self.head + self.len - 1) % MAX_PENDING_CONTEXTS].as_ref()
    }

    pub fn captured(&self) -> u32 {
        self.captured
    }

    pub fn overwritten(&self) -> u32 {
        self.overwritten
    }

    pub fn guard(&self) -> &ReentryGuard {
        &self.guard
    }

    /// Move captured contexts into the sink, oldest first. Returns
    /// (written, stranded).
    pub fn flush_contexts<S: LogSink + ?Sized>(&mut self, sink: &mut S) -> (usize, usize) {
        let mut written = 0;
        while self.len > 0 {
            let Some(ctx) = self.contexts[self.head] else {
                break;
            };
            let record = LogRecord::new(ctx.tick, Level::Error, Event::Fault(ctx));
            if !append_with_retry(sink, &record, self.config.sink_retry_limit) {
                break;
            }
            self.contexts[self.head] = None;
            self.head = (self.head + 1) % MAX_PENDING_CONTEXTS;
            self.len -= 1;
            written += 1;
        }
        (written, self.len)
    }

    /// Run the safe-state sequence: outputs off, then logs flushed, then
    /// halt or reboot. Every step runs even when the one before it failed.
    pub fn enter_safe_state<const N: usize, O, S, C>(
        &mut self,
        now: Tick,
        outputs: &mut O,
        telemetry: &mut TelemetryBuffer<N>,
        sink: &mut S,
        control: &mut C,
    ) -> SafeStateReport
    where
        O: OutputBank + ?Sized,
        S: LogSink + ?Sized,
        C: SystemControl + ?Sized,
    {
        if let Entry::Exhausted = self.guard.enter() {
            log::error!("safe state re-entered past limit, forcing halt");
            control.halt();
            return SafeStateReport {
                outputs_disabled: false,
                output_attempts: 0,
                records_flushed: 0,
                records_stranded: self.len + telemetry.len(),
                action: SafeStateAction::ForcedHalt,
            };
        }

        let (outputs_disabled, output_attempts) = disable_outputs(outputs, self.config.output_retry_limit);
        telemetry.record(
            now,
            if outputs_disabled { Level::Warn } else { Level::Error },
            Event::OutputsDisabled {
                attempts: output_attempts,
                ok: outputs_disabled,
            },
        );
        telemetry.record(
            now,
            Level::Error,
            Event::SafeStateEntered {
                policy: self.config.safe_state_policy,
            },
        );

        let (ctx_written, ctx_stranded) = self.flush_contexts(sink);
        let flushed = telemetry.flush(sink, self.config.sink_retry_limit);

        let action = finish(control, self.config.safe_state_policy);
        self.guard.exit();

        SafeStateReport {
            outputs_disabled,
            output_attempts,
            records_flushed: ctx_written + flushed.written,
            records_stranded: ctx_stranded + flushed.stranded,
            action,
        }
    }
}
