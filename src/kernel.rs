//! # Kernel
//!
//! [`Runtime`] ties the tick clock, scheduler, panic handler, telemetry and
//! module loader together and drives them from the mainline loop.
//!
//! ## Startup Sequence
//!
//! ```text
//! reset_handler (cortex-m-rt)
//!   └─► main()
//!         ├─► Runtime::new(&CLOCK, config, loader)
//!         ├─► register_periodic / register_thread   ← boot tasks (gen 0)
//!         ├─► boot_module(store, candidate)          ← verified module tasks
//!         ├─► arch: configure SysTick, set priorities
//!         └─► loop
//!               ├─► run_until_idle()
//!               ├─► safe state? ─► enter_safe_state(outputs, sink, control)
//!               └─► sleep until the next tick
//! ```
//!
//! The timer ISR only calls [`TickClock::on_timer_interrupt`]. Everything
//! here runs on the mainline, one task at a time.

use log::Level;

use crate::config::RuntimeConfig;
use crate::error::{ConfigError, Fault, FaultCode};
use crate::executor::VirtualThread;
use crate::hal::{OutputBank, SystemControl};
use crate::loader::{LoadContext, LoadOutcome, ModuleLoader, ModuleStore};
use crate::panic::{Disposition, PanicHandler, SafeStateReport};
use crate::scheduler::{Dispatch, Outcome, Scheduler};
use crate::task::{PeriodicFn, Priority, TaskConfig, TaskId, ThreadConfig};
use crate::telemetry::{Event, FlushReport, LogSink, Telemetry};
use crate::tick::{Tick, TickClock};
use crate::verify::SignatureVerifier;

/// Result of [`Runtime::dispatch_once`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Idle,
    Ran { task: TaskId, outcome: Outcome },
    /// The task faulted and was quarantined; everything else keeps running.
    Isolated(TaskId),
    /// A global fault, or no controller. Call [`Runtime::enter_safe_state`].
    SafeStateRequired,
}

/// Summary of one [`Runtime::run_until_idle`] pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PassSummary {
    pub dispatched: u16,
    pub isolated: u16,
    /// The pass ended because nothing was Ready (not because of the budget).
    pub idle: bool,
    pub safe_state: bool,
}

pub struct Runtime<'c, V> {
    clock: &'c TickClock,
    scheduler: Scheduler,
    panic: PanicHandler,
    telemetry: Telemetry,
    loader: ModuleLoader<V>,
    safe_state_pending: bool,
}

impl<'c, V: SignatureVerifier> Runtime<'c, V> {
    pub fn new(clock: &'c TickClock, config: RuntimeConfig, loader: ModuleLoader<V>) -> Self {
        Self {
            clock,
            scheduler: Scheduler::new(),
            panic: PanicHandler::new(config),
            telemetry: Telemetry::new(),
            loader,
            safe_state_pending: false,
        }
    }

    #[inline]
    pub fn now(&self) -> Tick {
        self.clock.current_tick()
    }

    // -----------------------------------------------------------------------
    // Boot tasks
    // -----------------------------------------------------------------------

    /// Register a periodic task outside any module. First release is now.
    pub fn register_periodic(&mut self, config: TaskConfig, callback: PeriodicFn) -> Result<TaskId, ConfigError> {
        let now = self.now();
        let result = self.scheduler.register_periodic(config, callback, now);
        self.note_registration(result, config.priority, "register_periodic", now)
    }

    /// Register a virtual thread, Ready now or Sleeping until `wake`.
    pub fn register_thread(
        &mut self,
        config: impl Into<ThreadConfig>,
        wake: Option<Tick>,
        thread: &'static mut dyn VirtualThread,
    ) -> Result<TaskId, ConfigError> {
        let config = config.into();
        let now = self.now();
        let result = self.scheduler.register_thread(config, wake, thread, now);
        self.note_registration(result, config.priority, "register_thread", now)
    }

    fn note_registration(
        &mut self,
        result: Result<TaskId, ConfigError>,
        priority: Priority,
        tag: &'static str,
        now: Tick,
    ) -> Result<TaskId, ConfigError> {
        match result {
            Ok(task) => {
                self.telemetry
                    .record(now, Level::Info, Event::TaskRegistered { task, priority });
            }
            Err(err) => {
                log::warn!("{}: {}", tag, err);
                self.panic.report(&Fault::new(FaultCode::Config).frame(tag, None), None, now);
            }
        }
        result
    }

    pub fn unregister(&mut self, id: TaskId) -> Result<(), ConfigError> {
        self.scheduler.unregister(id)
    }

    // -----------------------------------------------------------------------
    // Main loop
    // -----------------------------------------------------------------------

    /// One scheduling decision at the current tick.
    pub fn dispatch_once(&mut self) -> Step {
        if self.safe_state_pending {
            return Step::SafeStateRequired;
        }
        let now = self.now();

        match self.scheduler.dispatch(now) {
            Dispatch::Idle => Step::Idle,
            Dispatch::Ran { task, outcome } => {
                match outcome {
                    Outcome::Completed { deadline_met: false } => {
                        let deadline = self
                            .scheduler
                            .task(task)
                            .map(|tcb| tcb.next_deadline.wrapping_sub(tcb.period_ticks))
                            .unwrap_or(now);
                        self.telemetry
                            .record(now, Level::Warn, Event::DeadlineMissed { task, deadline });
                    }
                    Outcome::Retired => {
                        self.telemetry.record(now, Level::Debug, Event::TaskRetired { task });
                    }
                    _ => {}
                }
                Step::Ran { task, outcome }
            }
            Dispatch::Faulted { task, fault } => {
                self.telemetry.record(now, Level::Error, Event::TaskFaulted { task });
                match self.panic.on_panic(&fault, Some(task), now) {
                    Disposition::Isolate(id) => Step::Isolated(id),
                    Disposition::SafeState => {
                        self.safe_state_pending = true;
                        Step::SafeStateRequired
                    }
                }
            }
        }
    }

    /// Dispatch until nothing is Ready, the per-pass budget runs out, or
    /// safe state is required.
    pub fn run_until_idle(&mut self) -> PassSummary {
        let budget = self.panic.config().max_dispatches_per_pass.max(1);
        let mut pass = PassSummary::default();

        while pass.dispatched < budget {
            match self.dispatch_once() {
                Step::Idle => {
                    pass.idle = true;
                    break;
                }
                Step::Ran { .. } => pass.dispatched += 1,
                Step::Isolated(_) => {
                    pass.dispatched += 1;
                    pass.isolated += 1;
                }
                Step::SafeStateRequired => {
                    pass.safe_state = true;
                    break;
                }
            }
        }
        pass
    }

    /// Fault raised outside any task (bootstrap code, an ISR hand-off).
    /// Always ends in safe state.
    pub fn signal_fault(&mut self, fault: Fault) -> Disposition {
        let disposition = self.panic.on_panic(&fault, None, self.now());
        self.safe_state_pending = true;
        disposition
    }

    // -----------------------------------------------------------------------
    // Modules
    // -----------------------------------------------------------------------

    fn with_loader<S, F>(&mut self, store: &mut S, f: F) -> LoadOutcome
    where
        S: ModuleStore,
        F: FnOnce(&mut ModuleLoader<V>, &mut LoadContext<'_>) -> LoadOutcome,
    {
        let now = self.now();
        let mut cx = LoadContext {
            scheduler: &mut self.scheduler,
            panic: &mut self.panic,
            telemetry: &mut self.telemetry,
            store,
            now,
        };
        let outcome = f(&mut self.loader, &mut cx);
        if !outcome.has_controller() {
            log::error!("no controller module, safe state required");
            self.safe_state_pending = true;
        }
        outcome
    }

    /// Restore last-known-good from `store`, then try `candidate`.
    pub fn boot_module<S: ModuleStore>(&mut self, store: &mut S, candidate: Option<&[u8]>) -> LoadOutcome {
        self.with_loader(store, |loader, cx| loader.boot(candidate, cx))
    }

    /// Install a new module while tasks keep running.
    pub fn reload_module<S: ModuleStore>(&mut self, store: &mut S, candidate: &[u8]) -> LoadOutcome {
        self.with_loader(store, |loader, cx| loader.reload(candidate, cx))
    }

    /// Drop the active module for the retained last-known-good.
    pub fn revert_module<S: ModuleStore>(&mut self, store: &mut S) -> LoadOutcome {
        self.with_loader(store, |loader, cx| loader.revert(cx))
    }

    /// Every task of the active module is Faulted; the caller should
    /// [`revert_module`](Self::revert_module).
    pub fn module_exhausted(&self) -> bool {
        self.scheduler.module_exhausted()
    }

    // -----------------------------------------------------------------------
    // Logs and safe state
    // -----------------------------------------------------------------------

    /// Routine flush: captured contexts first, then telemetry.
    pub fn flush_logs<S: LogSink + ?Sized>(&mut self, sink: &mut S) -> FlushReport {
        let (ctx_written, ctx_stranded) = self.panic.flush_contexts(sink);
        let attempts = self.panic.config().sink_retry_limit;
        let telemetry = self.telemetry.flush(sink, attempts);
        FlushReport {
            written: ctx_written + telemetry.written,
            stranded: ctx_stranded + telemetry.stranded,
        }
    }

    /// Outputs off, logs flushed, then halt or reboot per policy.
    pub fn enter_safe_state<O, S, C>(&mut self, outputs: &mut O, sink: &mut S, control: &mut C) -> SafeStateReport
    where
        O: OutputBank + ?Sized,
        S: LogSink + ?Sized,
        C: SystemControl + ?Sized,
    {
        self.safe_state_pending = true;
        let now = self.now();
        self.panic
            .enter_safe_state(now, outputs, &mut self.telemetry, sink, control)
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub fn safe_state_pending(&self) -> bool {
        self.safe_state_pending
    }

    pub fn clock(&self) -> &'c TickClock {
        self.clock
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn panic_handler(&self) -> &PanicHandler {
        &self.panic
    }

    pub fn telemetry(&self) -> &Telemetry {
        &self.telemetry
    }

    pub fn loader(&self) -> &ModuleLoader<V> {
        &self.loader
    }

    pub fn config(&self) -> &RuntimeConfig {
        self.panic.config()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FaultMask;
    use crate::error::HardwareFault;
    use crate::executor::{ExecContext, Suspend};
    use crate::telemetry::SinkError;
    use crate::verify::K256Verifier;
    use std::boxed::Box;
    use std::vec::Vec;

    fn ok(_: Tick) -> Result<(), Fault> {
        Ok(())
    }

    fn overflow(_: Tick) -> Result<(), Fault> {
        Err(Fault::at(FaultCode::StackOverflow, "overflow"))
    }

    fn divide(_: Tick) -> Result<(), Fault> {
        Err(Fault::at(FaultCode::Arithmetic, "divide"))
    }

    fn runtime(clock: &TickClock, config: RuntimeConfig) -> Runtime<'_, K256Verifier> {
        Runtime::new(clock, config, ModuleLoader::new(K256Verifier, &[], &[]))
    }

    struct NoStore;

    impl ModuleStore for NoStore {
        fn load_last_known_good(&mut self, _: &mut [u8]) -> Result<Option<usize>, HardwareFault> {
            Ok(None)
        }

        fn store_last_known_good(&mut self, _: &[u8]) -> Result<(), HardwareFault> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct VecSink(Vec<Event>);

    impl LogSink for VecSink {
        fn append(&mut self, record: &crate::telemetry::LogRecord) -> Result<(), SinkError> {
            self.0.push(record.event);
            Ok(())
        }
    }

    struct Busy;

    impl VirtualThread for Busy {
        fn resume(&mut self, cx: &mut ExecContext) -> Result<Suspend, Fault> {
            Ok(cx.yield_now(0))
        }
    }

    #[test]
    fn test_task_local_fault_is_isolated() {
        let clock = TickClock::new();
        let mut rt = runtime(&clock, RuntimeConfig::DEFAULT);
        let bad = rt
            .register_periodic(TaskConfig::periodic(10, Priority::High), divide)
            .unwrap();
        rt.register_periodic(TaskConfig::periodic(10, Priority::Low), ok).unwrap();

        assert_eq!(rt.dispatch_once(), Step::Isolated(bad));
        assert!(matches!(rt.dispatch_once(), Step::Ran { .. }));
        assert_eq!(rt.dispatch_once(), Step::Idle);
        assert!(!rt.safe_state_pending());
        assert_eq!(rt.panic_handler().captured(), 1);
    }

    #[test]
    fn test_global_fault_requests_safe_state() {
        let clock = TickClock::new();
        let mut rt = runtime(&clock, RuntimeConfig::DEFAULT);
        rt.register_periodic(TaskConfig::periodic(10, Priority::Low), overflow)
            .unwrap();
        rt.register_periodic(TaskConfig::periodic(10, Priority::Low), ok).unwrap();

        let pass = rt.run_until_idle();
        assert!(pass.safe_state);
        assert_eq!(pass.dispatched, 0);
        // nothing else runs once safe state is pending
        assert_eq!(rt.dispatch_once(), Step::SafeStateRequired);
    }

    #[test]
    fn test_global_mask_is_configurable() {
        let clock = TickClock::new();
        let config = RuntimeConfig::DEFAULT.with_global_faults(FaultMask::EMPTY.with(FaultCode::Arithmetic));
        let mut rt = runtime(&clock, config);
        rt.register_periodic(TaskConfig::periodic(10, Priority::Low), divide)
            .unwrap();
        assert_eq!(rt.dispatch_once(), Step::SafeStateRequired);
    }

    #[test]
    fn test_dispatch_budget_bounds_a_pass() {
        let clock = TickClock::new();
        let mut rt = runtime(&clock, RuntimeConfig::DEFAULT.with_dispatch_budget(5));
        rt.register_thread(Priority::Low, None, Box::leak(Box::new(Busy)))
            .unwrap();

        let pass = rt.run_until_idle();
        assert_eq!(pass.dispatched, 5);
        assert!(!pass.idle);
    }

    #[test]
    fn test_registration_error_is_reported() {
        let clock = TickClock::new();
        let mut rt = runtime(&clock, RuntimeConfig::DEFAULT);
        assert_eq!(
            rt.register_periodic(TaskConfig::periodic(0, Priority::Low), ok),
            Err(ConfigError::ZeroPeriod)
        );
        assert_eq!(rt.panic_handler().last().map(|ctx| ctx.code()), Some(FaultCode::Config));
    }

    #[test]
    fn test_no_module_means_safe_state() {
        let clock = TickClock::new();
        let mut rt = runtime(&clock, RuntimeConfig::DEFAULT);
        let outcome = rt.boot_module(&mut NoStore, None);
        assert_eq!(outcome, LoadOutcome::NoController { reason: None });
        assert!(rt.safe_state_pending());
    }

    #[test]
    fn test_flush_logs_drains_contexts_first() {
        let clock = TickClock::new();
        let mut rt = runtime(&clock, RuntimeConfig::DEFAULT);
        rt.register_periodic(TaskConfig::periodic(10, Priority::Low), divide)
            .unwrap();
        rt.run_until_idle();

        let mut sink = VecSink::default();
        let report = rt.flush_logs(&mut sink);
        assert_eq!(report.stranded, 0);
        assert!(matches!(sink.0[0], Event::Fault(_)));
        assert!(sink.0.contains(&Event::TaskFaulted { task: TaskId(0) }));
        assert_eq!(report.written, sink.0.len());
    }

    #[test]
    fn test_missed_deadline_is_recorded() {
        fn slow(_: Tick) -> Result<(), Fault> {
            Ok(())
        }
        let clock = TickClock::new();
        let mut rt = runtime(&clock, RuntimeConfig::DEFAULT);
        let id = rt
            .register_periodic(TaskConfig::periodic(2, Priority::Low), slow)
            .unwrap();
        // the first release (deadline 2) only gets the CPU at tick 3
        for _ in 0..3 {
            clock.on_timer_interrupt();
        }
        assert_eq!(
            rt.dispatch_once(),
            Step::Ran {
                task: id,
                outcome: Outcome::Completed { deadline_met: false },
            }
        );
        assert!(rt
            .telemetry()
            .iter()
            .any(|record| record.event == Event::DeadlineMissed { task: id, deadline: Tick(2) }));
    }
}
