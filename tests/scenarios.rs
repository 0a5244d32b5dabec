//! End-to-end runs of the runtime on a simulated tick source.

mod common;

use std::cell::RefCell;
use std::rc::Rc;
use std::vec::Vec;

use common::*;
use tickrt::config::RuntimeConfig;
use tickrt::image::ModuleImage;
use tickrt::loader::Rejection;
use tickrt::panic::SafeStateAction;
use tickrt::scheduler::Registrar;
use tickrt::task::TaskState;
use tickrt::telemetry::Event;
use tickrt::verify::K256Verifier;
use tickrt::*;

fn ok(_: Tick) -> Result<(), Fault> {
    Ok(())
}

fn divide_by_zero(_: Tick) -> Result<(), Fault> {
    Err(Fault::at(FaultCode::Arithmetic, "ratio").frame("filter", Some(0)))
}

fn heap_smashed(_: Tick) -> Result<(), Fault> {
    Err(Fault::at(FaultCode::MemoryCorruption, "canary"))
}

fn controller_init(_: &ModuleImage<'_>, reg: &mut Registrar<'_>) -> Result<(), ConfigError> {
    reg.register_periodic(TaskConfig::periodic(10, Priority::High), ok)?;
    Ok(())
}

static MODULES: [ModuleEntry; 1] = [ModuleEntry {
    name: "controller",
    init: controller_init,
    teardown: None,
}];

fn runtime(clock: &TickClock) -> Runtime<'_, K256Verifier> {
    Runtime::new(
        clock,
        RuntimeConfig::DEFAULT,
        ModuleLoader::new(K256Verifier, public_key(), &MODULES),
    )
}

/// Run one pass per tick, then advance the clock.
fn run_ticks(rt: &mut Runtime<'_, K256Verifier>, clock: &TickClock, ticks: u32) {
    for _ in 0..ticks {
        rt.run_until_idle();
        clock.on_timer_interrupt();
    }
}

fn runs(rt: &Runtime<'_, K256Verifier>, id: TaskId) -> u32 {
    rt.scheduler().stats(id).map(|stats| stats.runs).unwrap_or(0)
}

#[test]
fn high_and_low_periodic_share_the_cpu() {
    let clock = TickClock::new();
    let mut rt = runtime(&clock);
    let high = rt
        .register_periodic(TaskConfig::periodic(10, Priority::High), ok)
        .unwrap();
    let low = rt
        .register_periodic(TaskConfig::periodic(100, Priority::Low), ok)
        .unwrap();

    run_ticks(&mut rt, &clock, 1000);

    assert_eq!(runs(&rt, high), 100);
    assert_eq!(runs(&rt, low), 10);
    assert_eq!(rt.scheduler().stats(high).unwrap().deadlines_missed, 0);
    assert_eq!(rt.scheduler().stats(low).unwrap().deadlines_missed, 0);
    assert_eq!(clock.current_tick(), Tick(1000));
}

#[test]
fn low_priority_fault_does_not_stop_high() {
    let clock = TickClock::new();
    let mut rt = runtime(&clock);
    let high = rt
        .register_periodic(TaskConfig::periodic(10, Priority::High), ok)
        .unwrap();
    let low = rt
        .register_periodic(TaskConfig::periodic(100, Priority::Low), divide_by_zero)
        .unwrap();

    run_ticks(&mut rt, &clock, 1000);

    assert_eq!(runs(&rt, high), 100);
    assert_eq!(rt.scheduler().state(low), Some(TaskState::Faulted));
    assert!(!rt.safe_state_pending());

    let ctx = rt.panic_handler().last().copied().unwrap();
    assert_eq!(ctx.task(), Some(low));
    assert_eq!(ctx.code(), FaultCode::Arithmetic);
    assert_eq!(ctx.kind(), ErrorKind::Runtime);
    assert_eq!(ctx.frames().len(), 2);
}

#[test]
fn safe_state_disables_outputs_before_flush_and_halt() {
    let clock = TickClock::new();
    let mut rt = runtime(&clock);
    rt.register_periodic(TaskConfig::periodic(10, Priority::Low), heap_smashed)
        .unwrap();
    rt.register_periodic(TaskConfig::periodic(10, Priority::Low), ok)
        .unwrap();

    let pass = rt.run_until_idle();
    assert!(pass.safe_state);

    let journal: Journal = Rc::new(RefCell::new(Vec::new()));
    let mut outputs = FlakyOutputs {
        journal: journal.clone(),
        working: false,
    };
    let mut sink = JournalSink {
        journal: journal.clone(),
        working: false,
        records: Vec::new(),
    };
    let mut control = JournalControl {
        journal: journal.clone(),
    };
    let report = rt.enter_safe_state(&mut outputs, &mut sink, &mut control);

    assert!(!report.outputs_disabled);
    assert_eq!(report.output_attempts, 3);
    assert_eq!(report.action, SafeStateAction::Halted);
    assert!(report.records_stranded > 0);

    let journal = journal.borrow();
    assert_eq!(&journal[..3], &["disable", "disable", "disable"]);
    assert!(journal[3..journal.len() - 1].iter().all(|step| *step == "append"));
    assert_eq!(journal.last(), Some(&"halt"));
}

#[test]
fn safe_state_flushes_fault_context_to_a_working_sink() {
    let clock = TickClock::new();
    let mut rt = runtime(&clock);
    rt.register_periodic(TaskConfig::periodic(10, Priority::High), heap_smashed)
        .unwrap();
    rt.run_until_idle();

    let journal: Journal = Rc::new(RefCell::new(Vec::new()));
    let mut sink = JournalSink {
        journal: journal.clone(),
        working: true,
        records: Vec::new(),
    };
    let report = rt.enter_safe_state(
        &mut FlakyOutputs {
            journal: journal.clone(),
            working: true,
        },
        &mut sink,
        &mut JournalControl {
            journal: journal.clone(),
        },
    );

    assert!(report.outputs_disabled);
    assert_eq!(report.records_stranded, 0);
    assert!(matches!(sink.records[0].event, Event::Fault(ctx) if ctx.code() == FaultCode::MemoryCorruption));
    assert!(sink
        .records
        .iter()
        .any(|record| matches!(record.event, Event::SafeStateEntered { .. })));
    assert_eq!(journal.borrow().first(), Some(&"disable"));
}

#[test]
fn tampered_reload_never_activates() {
    let clock = TickClock::new();
    let mut rt = runtime(&clock);
    let mut store = MemStore::default();

    let outcome = rt.boot_module(&mut store, Some(&signed_image(0, 1, b"gains")));
    assert_eq!(outcome, LoadOutcome::Activated { version: 1, tasks: 1 });
    let generation = rt.scheduler().active_generation();

    run_ticks(&mut rt, &clock, 50);

    let outcome = rt.reload_module(&mut store, &tampered_image(0, 2, b"gains"));
    assert_eq!(
        outcome,
        LoadOutcome::KeptActive {
            version: 1,
            reason: Rejection::Verification(VerificationFailure::BadSignature),
        }
    );
    assert_eq!(rt.loader().active_version(), Some(1));
    assert_eq!(rt.scheduler().active_generation(), generation);
    assert_eq!(store.image.as_deref(), Some(&signed_image(0, 1, b"gains")[..]));

    // the old controller keeps its release grid
    let module_task = rt
        .scheduler()
        .iter()
        .find(|tcb| tcb.generation == generation)
        .map(|tcb| tcb.id)
        .unwrap();
    let before = runs(&rt, module_task);
    run_ticks(&mut rt, &clock, 50);
    assert_eq!(runs(&rt, module_task), before + 5);
    assert!(!rt.safe_state_pending());
}

#[test]
fn tampered_boot_image_falls_back_to_stored_module() {
    let clock = TickClock::new();
    let mut rt = runtime(&clock);
    let mut store = MemStore {
        image: Some(signed_image(0, 3, b"stored")),
        writes: 0,
    };

    let outcome = rt.boot_module(&mut store, Some(&tampered_image(0, 4, b"fresh")));
    assert!(matches!(outcome, LoadOutcome::FellBack { version: 3, reason: Some(_) }));
    assert_eq!(rt.loader().active_version(), Some(3));
    assert!(rt
        .telemetry()
        .iter()
        .any(|record| record.event == Event::ModuleRejected { version: Some(4) }));
    assert_eq!(rt.scheduler().task_count(), 1);
}

#[test]
fn no_verified_module_requires_safe_state() {
    let clock = TickClock::new();
    let mut rt = runtime(&clock);
    let boot = rt
        .register_periodic(TaskConfig::periodic(10, Priority::Low), ok)
        .unwrap();
    let outcome = rt.boot_module(&mut MemStore::default(), Some(&tampered_image(0, 1, b"x")));

    assert!(!outcome.has_controller());
    assert!(rt.safe_state_pending());
    assert_eq!(rt.dispatch_once(), Step::SafeStateRequired);
    assert_eq!(runs(&rt, boot), 0);
}

#[test]
fn schedule_is_deterministic() {
    struct Sampler;

    impl VirtualThread for Sampler {
        fn resume(&mut self, cx: &mut ExecContext) -> Result<Suspend, Fault> {
            match cx.resume_point() {
                0 => cx.sleep_for(3, 1),
                1 => Ok(cx.yield_now(2)),
                _ => cx.sleep_for(2, 0),
            }
        }
    }

    fn trace() -> Vec<(u32, Step)> {
        let clock = TickClock::new();
        let mut rt = runtime(&clock);
        rt.register_periodic(TaskConfig::periodic(7, Priority::High), ok)
            .unwrap();
        rt.register_periodic(TaskConfig::periodic(5, Priority::Medium), ok)
            .unwrap();
        rt.register_thread(Priority::Medium, None, Box::leak(Box::new(Sampler)))
            .unwrap();

        let mut steps = Vec::new();
        for _ in 0..200 {
            loop {
                match rt.dispatch_once() {
                    Step::Idle => break,
                    step => steps.push((clock.current_tick().raw(), step)),
                }
            }
            clock.on_timer_interrupt();
        }
        steps
    }

    let first = trace();
    assert!(!first.is_empty());
    assert_eq!(first, trace());
}

#[test]
fn periodic_grid_survives_tick_wrap() {
    let clock = TickClock::starting_at(Tick(u32::MAX - 34));
    let mut rt = runtime(&clock);
    let id = rt
        .register_periodic(TaskConfig::periodic(10, Priority::High), ok)
        .unwrap();

    run_ticks(&mut rt, &clock, 100);

    let stats = rt.scheduler().stats(id).unwrap();
    assert_eq!(stats.runs, 10);
    assert_eq!(stats.deadlines_missed, 0);
    assert!(clock.current_tick().raw() < 100);
}
