//! # Module Loader
//!
//! Verifies signed controller modules and swaps them in without ever
//! leaving the system on an unverified one.
//!
//! ## Slots
//!
//! Two fixed RAM slots. One holds the Active image, the other the retained
//! last-known-good. A candidate is parsed, verified and staged straight from
//! the caller's buffer and is copied into the spare slot only once nothing
//! can fail any more, so a refused candidate leaves both slots untouched.
//!
//! ```text
//!   candidate ──verify──> staged ──copy──> Active ──next install──> LastKnownGood
//!       │                   │                                            │
//!       └──> refused <──────┘                 Rejected <──revert / bad───┘
//! ```
//!
//! ## Activation
//!
//! The image's `entry` byte picks a [`ModuleEntry`] from the firmware table.
//! Its `init` registers tasks through a [`Registrar`] under a staging
//! generation. Only when `init` succeeds with at least one task does the
//! loader tear down the old module and commit the generation, which swaps
//! the visible task set in one step. The new image is then persisted as
//! last-known-good.

use log::Level;
use thiserror::Error;

use crate::config::MAX_IMAGE_BYTES;
use crate::error::{ConfigError, Fault, FaultCode, HardwareFault, VerificationFailure};
use crate::image::{ImageError, ModuleHeader, ModuleImage};
use crate::panic::PanicHandler;
use crate::scheduler::{Registrar, Scheduler};
use crate::telemetry::{Event, Telemetry};
use crate::tick::Tick;
use crate::verify::SignatureVerifier;

/// Registers a module's tasks. The image is borrowed for the call only;
/// a module that needs its payload later copies what it needs.
pub type ModuleInit = fn(&ModuleImage<'_>, &mut Registrar<'_>) -> Result<(), ConfigError>;

/// Releases whatever `init` claimed outside the task table.
pub type ModuleTeardown = fn(&ModuleImage<'_>);

/// One controller implementation linked into the firmware.
#[derive(Clone, Copy)]
pub struct ModuleEntry {
    pub name: &'static str,
    pub init: ModuleInit,
    pub teardown: Option<ModuleTeardown>,
}

impl core::fmt::Debug for ModuleEntry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ModuleEntry").field("name", &self.name).finish()
    }
}

/// Non-volatile home of the last-known-good image.
pub trait ModuleStore {
    /// Copy the stored image into `buf`. `Ok(None)` when nothing is stored.
    fn load_last_known_good(&mut self, buf: &mut [u8]) -> Result<Option<usize>, HardwareFault>;

    fn store_last_known_good(&mut self, image: &[u8]) -> Result<(), HardwareFault>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Empty,
    Active,
    LastKnownGood,
    Rejected,
}

/// Why an image did not become active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Rejection {
    #[error(transparent)]
    Verification(#[from] VerificationFailure),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl From<ImageError> for Rejection {
    fn from(err: ImageError) -> Self {
        Rejection::Verification(err.into())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    /// The candidate is now the active module.
    Activated { version: u32, tasks: usize },
    /// The candidate was refused; the running module stays.
    KeptActive { version: u32, reason: Rejection },
    /// Nothing was running; the last-known-good image took over.
    FellBack { version: u32, reason: Option<Rejection> },
    /// No verified module is available. The runtime must enter safe state.
    NoController { reason: Option<Rejection> },
}

impl LoadOutcome {
    pub fn has_controller(&self) -> bool {
        !matches!(self, LoadOutcome::NoController { .. })
    }
}

/// Everything activation touches besides the loader itself.
pub struct LoadContext<'a> {
    pub scheduler: &'a mut Scheduler,
    pub panic: &'a mut PanicHandler,
    pub telemetry: &'a mut Telemetry,
    pub store: &'a mut dyn ModuleStore,
    pub now: Tick,
}

struct ImageSlot {
    bytes: [u8; MAX_IMAGE_BYTES],
    len: usize,
    state: SlotState,
}

impl ImageSlot {
    const EMPTY: ImageSlot = ImageSlot {
        bytes: [0; MAX_IMAGE_BYTES],
        len: 0,
        state: SlotState::Empty,
    };

    /// Overwrite the slot with `src`. The caller sets the new state.
    fn fill(&mut self, src: &[u8]) -> Result<(), ImageError> {
        let dst = self
            .bytes
            .get_mut(..src.len())
            .ok_or(ImageError::TooLarge(src.len()))?;
        dst.copy_from_slice(src);
        self.len = src.len();
        Ok(())
    }

    fn clear(&mut self) {
        self.len = 0;
        self.state = SlotState::Empty;
    }

    fn contents(&self) -> &[u8] {
        &self.bytes[..self.len]
    }

    fn image(&self) -> Result<ModuleImage<'_>, ImageError> {
        ModuleImage::parse(self.contents())
    }

    fn version(&self) -> Option<u32> {
        self.image().ok().map(|image| image.version())
    }
}

/// Tasks registered under a staging generation, waiting for the swap.
#[derive(Clone, Copy)]
struct Staged {
    header: ModuleHeader,
    generation: u16,
    tasks: usize,
    name: &'static str,
}

pub struct ModuleLoader<V> {
    verifier: V,
    public_key: &'static [u8],
    entries: &'static [ModuleEntry],
    slots: [ImageSlot; 2],
    active: Option<usize>,
}

impl<V: SignatureVerifier> ModuleLoader<V> {
    pub const fn new(verifier: V, public_key: &'static [u8], entries: &'static [ModuleEntry]) -> Self {
        Self {
            verifier,
            public_key,
            entries,
            slots: [ImageSlot::EMPTY, ImageSlot::EMPTY],
            active: None,
        }
    }

    // -----------------------------------------------------------------------
    // Entry points
    // -----------------------------------------------------------------------

    /// Restore last-known-good from the store, then try `candidate`.
    /// Without a candidate the last-known-good is activated directly.
    pub fn boot(&mut self, candidate: Option<&[u8]>, cx: &mut LoadContext<'_>) -> LoadOutcome {
        self.restore(cx);
        match candidate {
            Some(bytes) => self.install(bytes, cx),
            None => self.activate_fallback(None, cx),
        }
    }

    /// Verify and activate `candidate`, or keep/restore a verified module.
    pub fn install(&mut self, candidate: &[u8], cx: &mut LoadContext<'_>) -> LoadOutcome {
        match self.try_install(candidate, cx) {
            Ok(outcome) => outcome,
            Err(reason) => {
                let version = ModuleImage::parse(candidate).ok().map(|image| image.version());
                self.reject(version, reason, cx);
                self.recover(reason, cx)
            }
        }
    }

    /// Runtime update. Same path as boot-time install.
    pub fn reload(&mut self, candidate: &[u8], cx: &mut LoadContext<'_>) -> LoadOutcome {
        log::info!("reload requested ({} bytes)", candidate.len());
        self.install(candidate, cx)
    }

    /// Give up on the active module and go back to the retained
    /// last-known-good. Without one, the active module is retired and the
    /// outcome is `NoController`.
    pub fn revert(&mut self, cx: &mut LoadContext<'_>) -> LoadOutcome {
        let broken = self.active;
        log::warn!("reverting module v{:?}", self.active_version());
        match self.activate_fallback(None, cx) {
            outcome @ LoadOutcome::FellBack { .. } => {
                if let Some(idx) = broken {
                    self.slots[idx].state = SlotState::Rejected;
                }
                outcome
            }
            outcome => {
                self.retire_active(cx);
                outcome
            }
        }
    }

    // -----------------------------------------------------------------------
    // Steps
    // -----------------------------------------------------------------------

    fn spare_slot(&self) -> usize {
        match self.active {
            Some(idx) => 1 - idx,
            None if self.slots[0].state == SlotState::LastKnownGood => 1,
            None => 0,
        }
    }

    fn retained_slot(&self) -> Option<usize> {
        (0..self.slots.len()).find(|&idx| self.slots[idx].state == SlotState::LastKnownGood)
    }

    fn restore(&mut self, cx: &mut LoadContext<'_>) {
        let idx = self.spare_slot();
        let slot = &mut self.slots[idx];
        match cx.store.load_last_known_good(&mut slot.bytes) {
            Ok(Some(len)) if len <= MAX_IMAGE_BYTES => {
                slot.len = len;
                slot.state = SlotState::LastKnownGood;
                log::info!("last-known-good restored ({} bytes)", len);
            }
            Ok(Some(len)) => {
                slot.clear();
                let fault = Fault::new(FaultCode::Verification).frame("lkg_restore", Some(len as u32));
                cx.panic.report(&fault, None, cx.now);
            }
            Ok(None) => {
                slot.clear();
                log::info!("no last-known-good stored");
            }
            Err(err) => {
                slot.clear();
                cx.panic.report(&Fault::from(err).frame("lkg_restore", None), None, cx.now);
            }
        }
    }

    fn try_install(&mut self, candidate: &[u8], cx: &mut LoadContext<'_>) -> Result<LoadOutcome, Rejection> {
        let image = ModuleImage::parse(candidate)?;
        let header = self.verify(&image)?;
        log::debug!("module v{} verified", header.version);
        let staged = self.stage(&image, cx)?;

        let target = self.spare_slot();
        if let Err(err) = self.slots[target].fill(candidate) {
            cx.scheduler.abort_generation(staged.generation);
            return Err(err.into());
        }
        let tasks = self.swap_in(target, staged, true, cx);
        Ok(LoadOutcome::Activated {
            version: header.version,
            tasks,
        })
    }

    fn verify(&self, image: &ModuleImage<'_>) -> Result<ModuleHeader, VerificationFailure> {
        if !self
            .verifier
            .verify(image.signed_bytes(), image.signature(), self.public_key)
        {
            return Err(VerificationFailure::BadSignature);
        }
        Ok(*image.header())
    }

    /// Run the entry's `init` under a fresh staging generation. On failure
    /// the generation is aborted and nothing visible changes.
    fn stage(&self, image: &ModuleImage<'_>, cx: &mut LoadContext<'_>) -> Result<Staged, Rejection> {
        let header = *image.header();
        let entry = self
            .entries
            .get(header.entry as usize)
            .ok_or(ConfigError::UnknownEntry(header.entry))?;

        let generation = cx.scheduler.begin_generation();
        let mut registrar = Registrar::new(cx.scheduler, generation, cx.now);
        let result = (entry.init)(image, &mut registrar);
        let tasks = registrar.registered();

        if let Err(err) = result {
            cx.scheduler.abort_generation(generation);
            return Err(err.into());
        }
        if tasks == 0 {
            cx.scheduler.abort_generation(generation);
            return Err(ConfigError::NoTasks.into());
        }
        Ok(Staged {
            header,
            generation,
            tasks,
            name: entry.name,
        })
    }

    /// Tear down the old module, commit the staged generation and make slot
    /// `idx` active. The old active slot becomes last-known-good.
    fn swap_in(&mut self, idx: usize, staged: Staged, persist: bool, cx: &mut LoadContext<'_>) -> usize {
        let Staged {
            header,
            generation,
            tasks,
            name,
        } = staged;

        self.teardown_active();
        let retired = cx.scheduler.commit_generation(generation);

        let previous = self.active.replace(idx);
        self.slots[idx].state = SlotState::Active;
        if let Some(prev) = previous.filter(|&prev| prev != idx) {
            self.slots[prev].state = SlotState::LastKnownGood;
        }

        log::info!(
            "module '{}' v{} active: {} task(s), {} retired (gen {})",
            name,
            header.version,
            tasks,
            retired,
            generation
        );
        cx.telemetry.record(
            cx.now,
            Level::Info,
            Event::ModuleActivated {
                version: header.version,
                entry: header.entry,
            },
        );

        if persist {
            if let Err(err) = cx.store.store_last_known_good(self.slots[idx].contents()) {
                cx.panic.report(&Fault::from(err).frame("lkg_persist", Some(header.version)), None, cx.now);
            }
        }
        tasks
    }

    fn teardown_active(&self) {
        let Some(idx) = self.active else {
            return;
        };
        let Ok(image) = self.slots[idx].image() else {
            return;
        };
        if let Some(teardown) = self
            .entries
            .get(image.header().entry as usize)
            .and_then(|entry| entry.teardown)
        {
            teardown(&image);
        }
    }

    fn retire_active(&mut self, cx: &mut LoadContext<'_>) {
        if let Some(idx) = self.active {
            self.teardown_active();
            cx.scheduler.deactivate_modules();
            self.slots[idx].state = SlotState::Rejected;
            self.active = None;
        }
    }

    fn reject(&mut self, version: Option<u32>, reason: Rejection, cx: &mut LoadContext<'_>) {
        let (code, tag) = match reason {
            Rejection::Verification(_) => (FaultCode::Verification, "module_verify"),
            Rejection::Config(_) => (FaultCode::Config, "module_init"),
        };
        log::warn!("module v{:?} rejected: {}", version, reason);
        cx.panic.report(&Fault::new(code).frame(tag, version), None, cx.now);
        cx.telemetry.record(cx.now, Level::Warn, Event::ModuleRejected { version });
    }

    fn recover(&mut self, reason: Rejection, cx: &mut LoadContext<'_>) -> LoadOutcome {
        match self.active.and_then(|idx| self.slots[idx].version()) {
            Some(version) => {
                log::info!("keeping active module v{}", version);
                LoadOutcome::KeptActive { version, reason }
            }
            None => self.activate_fallback(Some(reason), cx),
        }
    }

    /// Re-verify and activate the retained image.
    fn activate_fallback(&mut self, reason: Option<Rejection>, cx: &mut LoadContext<'_>) -> LoadOutcome {
        let Some(idx) = self.retained_slot() else {
            return self.no_controller(reason, cx);
        };

        // Reverting at runtime makes the retained image the newest good one.
        let persist = self.active.is_some();
        let staged = self.slots[idx].image().map_err(Rejection::from).and_then(|image| {
            self.verify(&image)?;
            self.stage(&image, cx)
        });

        match staged {
            Ok(staged) => {
                let header = staged.header;
                self.swap_in(idx, staged, persist, cx);
                cx.telemetry.record(
                    cx.now,
                    Level::Warn,
                    Event::FallbackActivated {
                        version: header.version,
                    },
                );
                LoadOutcome::FellBack {
                    version: header.version,
                    reason,
                }
            }
            Err(err) => {
                let version = self.slots[idx].version();
                self.slots[idx].state = SlotState::Rejected;
                self.reject(version, err, cx);
                self.no_controller(reason.or(Some(err)), cx)
            }
        }
    }

    fn no_controller(&mut self, reason: Option<Rejection>, cx: &mut LoadContext<'_>) -> LoadOutcome {
        log::error!("no verified controller module available");
        cx.telemetry.record(cx.now, Level::Error, Event::NoController);
        LoadOutcome::NoController { reason }
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub fn active_header(&self) -> Option<ModuleHeader> {
        let idx = self.active?;
        self.slots[idx].image().ok().map(|image| *image.header())
    }

    pub fn active_version(&self) -> Option<u32> {
        self.active_header().map(|header| header.version)
    }

    pub fn active_entry(&self) -> Option<&'static ModuleEntry> {
        let entries = self.entries;
        self.active_header()
            .and_then(|header| entries.get(header.entry as usize))
    }

    pub fn has_last_known_good(&self) -> bool {
        self.retained_slot().is_some()
    }

    pub fn slot_state(&self, idx: usize) -> Option<SlotState> {
        self.slots.get(idx).map(|slot| slot.state)
    }

    pub fn entries(&self) -> &'static [ModuleEntry] {
        self.entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::image::{append_signature, write_unsigned};
    use crate::task::{Priority, TaskConfig};
    use crate::verify::K256Verifier;
    use k256::ecdsa::{signature::Signer, Signature, SigningKey};
    use std::boxed::Box;
    use std::cell::Cell;
    use std::vec::Vec;

    std::thread_local! {
        static TEARDOWNS: Cell<u32> = const { Cell::new(0) };
    }

    fn ok(_: Tick) -> Result<(), Fault> {
        Ok(())
    }

    fn one_task(_: &ModuleImage<'_>, reg: &mut Registrar<'_>) -> Result<(), ConfigError> {
        reg.register_periodic(TaskConfig::periodic(10, Priority::High), ok)?;
        Ok(())
    }

    fn no_tasks(_: &ModuleImage<'_>, _: &mut Registrar<'_>) -> Result<(), ConfigError> {
        Ok(())
    }

    fn half_then_fail(_: &ModuleImage<'_>, reg: &mut Registrar<'_>) -> Result<(), ConfigError> {
        reg.register_periodic(TaskConfig::periodic(10, Priority::High), ok)?;
        reg.register_periodic(TaskConfig::periodic(0, Priority::High), ok)?;
        Ok(())
    }

    fn count_teardown(_: &ModuleImage<'_>) {
        TEARDOWNS.with(|count| count.set(count.get() + 1));
    }

    static ENTRIES: [ModuleEntry; 3] = [
        ModuleEntry {
            name: "pump",
            init: one_task,
            teardown: Some(count_teardown),
        },
        ModuleEntry {
            name: "empty",
            init: no_tasks,
            teardown: None,
        },
        ModuleEntry {
            name: "broken",
            init: half_then_fail,
            teardown: None,
        },
    ];

    #[derive(Default)]
    struct MemStore {
        image: Option<Vec<u8>>,
        writes: u32,
    }

    impl ModuleStore for MemStore {
        fn load_last_known_good(&mut self, buf: &mut [u8]) -> Result<Option<usize>, HardwareFault> {
            Ok(self.image.as_ref().map(|image| {
                buf[..image.len()].copy_from_slice(image);
                image.len()
            }))
        }

        fn store_last_known_good(&mut self, image: &[u8]) -> Result<(), HardwareFault> {
            self.image = Some(image.to_vec());
            self.writes += 1;
            Ok(())
        }
    }

    struct Harness {
        scheduler: Scheduler,
        panic: PanicHandler,
        telemetry: Telemetry,
        store: MemStore,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                scheduler: Scheduler::new(),
                panic: PanicHandler::new(RuntimeConfig::DEFAULT),
                telemetry: Telemetry::new(),
                store: MemStore::default(),
            }
        }

        fn cx(&mut self) -> LoadContext<'_> {
            LoadContext {
                scheduler: &mut self.scheduler,
                panic: &mut self.panic,
                telemetry: &mut self.telemetry,
                store: &mut self.store,
                now: Tick(0),
            }
        }

        fn saw(&self, event: Event) -> bool {
            self.telemetry.iter().any(|record| record.event == event)
        }
    }

    fn signing_key() -> SigningKey {
        SigningKey::from_bytes(&[0x11u8; 32].into()).unwrap()
    }

    fn loader() -> ModuleLoader<K256Verifier> {
        let point = signing_key().verifying_key().to_encoded_point(true);
        let public_key: &'static [u8] = Box::leak(point.as_bytes().to_vec().into_boxed_slice());
        ModuleLoader::new(K256Verifier, public_key, &ENTRIES)
    }

    fn image(entry: u8, version: u32) -> Vec<u8> {
        let mut buf = [0u8; MAX_IMAGE_BYTES];
        let signed = write_unsigned(entry, version, b"kp=12;ki=3", &mut buf).unwrap();
        let sig: Signature = signing_key().sign(&buf[..signed]);
        let len = append_signature(&mut buf, signed, &sig.to_bytes()).unwrap();
        buf[..len].to_vec()
    }

    fn tampered(entry: u8, version: u32) -> Vec<u8> {
        let mut bytes = image(entry, version);
        bytes[20] ^= 0x01;
        bytes
    }

    #[test]
    fn test_boot_activates_and_persists() {
        let mut h = Harness::new();
        let mut loader = loader();
        let outcome = loader.boot(Some(&image(0, 1)), &mut h.cx());

        assert_eq!(outcome, LoadOutcome::Activated { version: 1, tasks: 1 });
        assert_eq!(loader.active_version(), Some(1));
        assert_eq!(loader.active_entry().map(|entry| entry.name), Some("pump"));
        assert_eq!(h.store.writes, 1);
        assert_eq!(h.scheduler.tasks_in(h.scheduler.active_generation()), 1);
        assert!(h.saw(Event::ModuleActivated { version: 1, entry: 0 }));
    }

    #[test]
    fn test_tampered_reload_keeps_active() {
        let mut h = Harness::new();
        let mut loader = loader();
        loader.boot(Some(&image(0, 1)), &mut h.cx());
        let generation = h.scheduler.active_generation();

        let outcome = loader.reload(&tampered(0, 2), &mut h.cx());
        assert_eq!(
            outcome,
            LoadOutcome::KeptActive {
                version: 1,
                reason: Rejection::Verification(VerificationFailure::BadSignature),
            }
        );
        assert_eq!(loader.active_version(), Some(1));
        assert_eq!(h.scheduler.active_generation(), generation);
        assert_eq!(h.scheduler.task_count(), 1);
        assert_eq!(h.panic.last().map(|ctx| ctx.code()), Some(FaultCode::Verification));
        assert!(h.saw(Event::ModuleRejected { version: Some(2) }));
        assert_eq!(h.store.writes, 1);
        TEARDOWNS.with(|count| assert_eq!(count.get(), 0));
    }

    #[test]
    fn test_tampered_boot_falls_back_to_stored() {
        let mut h = Harness::new();
        h.store.image = Some(image(0, 4));
        let mut loader = loader();

        let outcome = loader.boot(Some(&tampered(0, 5)), &mut h.cx());
        assert_eq!(
            outcome,
            LoadOutcome::FellBack {
                version: 4,
                reason: Some(Rejection::Verification(VerificationFailure::BadSignature)),
            }
        );
        assert_eq!(loader.active_version(), Some(4));
        // already the stored image, nothing rewritten
        assert_eq!(h.store.writes, 0);
        assert!(h.saw(Event::FallbackActivated { version: 4 }));
    }

    #[test]
    fn test_corrupted_store_and_candidate_leave_no_controller() {
        let mut h = Harness::new();
        h.store.image = Some(tampered(0, 4));
        let mut loader = loader();

        let outcome = loader.boot(Some(&tampered(0, 5)), &mut h.cx());
        assert!(!outcome.has_controller());
        assert_eq!(loader.active_version(), None);
        assert_eq!(h.scheduler.task_count(), 0);
        assert!(h.saw(Event::NoController));

        let mut empty = Harness::new();
        let outcome = self::loader().boot(None, &mut empty.cx());
        assert_eq!(outcome, LoadOutcome::NoController { reason: None });
    }

    #[test]
    fn test_module_without_tasks_is_refused() {
        let mut h = Harness::new();
        let mut loader = loader();
        loader.boot(Some(&image(0, 1)), &mut h.cx());

        let outcome = loader.reload(&image(1, 2), &mut h.cx());
        assert_eq!(
            outcome,
            LoadOutcome::KeptActive {
                version: 1,
                reason: Rejection::Config(ConfigError::NoTasks),
            }
        );
        assert_eq!(h.panic.last().map(|ctx| ctx.code()), Some(FaultCode::Config));
        assert_eq!(h.scheduler.staging_generation(), None);
    }

    #[test]
    fn test_failed_init_discards_staged_tasks() {
        let mut h = Harness::new();
        let mut loader = loader();
        loader.boot(Some(&image(0, 1)), &mut h.cx());

        let outcome = loader.reload(&image(2, 2), &mut h.cx());
        assert!(matches!(
            outcome,
            LoadOutcome::KeptActive {
                reason: Rejection::Config(ConfigError::ZeroPeriod),
                ..
            }
        ));
        assert_eq!(h.scheduler.task_count(), 1);

        let outcome = loader.reload(&image(9, 3), &mut h.cx());
        assert!(matches!(
            outcome,
            LoadOutcome::KeptActive {
                reason: Rejection::Config(ConfigError::UnknownEntry(9)),
                ..
            }
        ));
    }

    #[test]
    fn test_reload_swaps_and_retains_previous() {
        let mut h = Harness::new();
        let mut loader = loader();
        loader.boot(Some(&image(0, 1)), &mut h.cx());
        let old_generation = h.scheduler.active_generation();

        let outcome = loader.reload(&image(0, 2), &mut h.cx());
        assert_eq!(outcome, LoadOutcome::Activated { version: 2, tasks: 1 });
        TEARDOWNS.with(|count| assert_eq!(count.get(), 1));
        assert_eq!(h.scheduler.tasks_in(old_generation), 0);
        assert_eq!(h.scheduler.task_count(), 1);
        assert!(loader.has_last_known_good());
        assert_eq!(h.store.image.as_deref(), Some(&image(0, 2)[..]));

        let outcome = loader.revert(&mut h.cx());
        assert_eq!(outcome, LoadOutcome::FellBack { version: 1, reason: None });
        assert_eq!(loader.active_version(), Some(1));
        assert!(!loader.has_last_known_good());
        assert_eq!(h.store.image.as_deref(), Some(&image(0, 1)[..]));
    }

    #[test]
    fn test_refused_candidate_keeps_retained_image() {
        let mut h = Harness::new();
        let mut loader = loader();
        loader.boot(Some(&image(0, 1)), &mut h.cx());
        loader.reload(&image(0, 2), &mut h.cx());
        assert_eq!(loader.slot_state(1), Some(SlotState::Active));
        assert_eq!(loader.slot_state(0), Some(SlotState::LastKnownGood));

        let outcome = loader.reload(&tampered(0, 3), &mut h.cx());
        assert!(matches!(outcome, LoadOutcome::KeptActive { version: 2, .. }));
        let outcome = loader.reload(&image(1, 4), &mut h.cx());
        assert!(matches!(outcome, LoadOutcome::KeptActive { version: 2, .. }));
        assert!(loader.has_last_known_good());
        assert_eq!(loader.slot_state(0), Some(SlotState::LastKnownGood));

        let outcome = loader.revert(&mut h.cx());
        assert_eq!(outcome, LoadOutcome::FellBack { version: 1, reason: None });
        assert_eq!(loader.active_version(), Some(1));
        assert_eq!(loader.slot_state(1), Some(SlotState::Rejected));
        assert_eq!(h.scheduler.task_count(), 1);
    }

    #[test]
    fn test_revert_without_fallback_retires_module() {
        let mut h = Harness::new();
        let mut loader = loader();
        loader.boot(Some(&image(0, 1)), &mut h.cx());

        let outcome = loader.revert(&mut h.cx());
        assert_eq!(outcome, LoadOutcome::NoController { reason: None });
        assert_eq!(loader.active_version(), None);
        assert_eq!(h.scheduler.task_count(), 0);
    }

    #[test]
    fn test_oversized_candidate_rejected() {
        let mut h = Harness::new();
        let mut loader = loader();
        let huge = std::vec![0u8; MAX_IMAGE_BYTES + 1];
        let outcome = loader.boot(Some(&huge), &mut h.cx());
        assert_eq!(
            outcome,
            LoadOutcome::NoController {
                reason: Some(Rejection::Verification(VerificationFailure::Malformed(
                    ImageError::TooLarge(MAX_IMAGE_BYTES + 1)
                ))),
            }
        );
    }
}
