//! # TickRT Example Firmware
//!
//! Tank-level controller on an STM32F407. The boot image carries two tasks
//! that are always present; the pump controller itself arrives as a signed
//! module and can be replaced at runtime.
//!
//! | Task | Kind | Priority | Source | Behavior |
//! |------|------|----------|--------|----------|
//! | `heartbeat` | periodic 500 | Low | boot | toggles the status LED |
//! | `Sampler` | virtual thread | Medium | boot | ADC conversion, 1 tick wait, 4 tick rest |
//! | `pump_control` | periodic 10 | High | module 0 | PI loop on the sampled level |
//! | `drain_control` | periodic 20 | Medium | module 1 | bang-bang drain |
//!
//! Module images live in flash sectors 10 (candidate) and 11
//! (last-known-good), each as a length word followed by the image.

#![no_std]
#![no_main]

use core::panic::PanicInfo;
use core::sync::atomic::{AtomicBool, AtomicI32, AtomicU16, Ordering};

use cortex_m::peripheral::{itm, ITM};
use cortex_m_rt::{entry, exception};
use log::{LevelFilter, Log, Metadata, Record};

use tickrt::arch::cortex_m4::{self, CoreControl};
use tickrt::config::{RuntimeConfig, SafeStatePolicy, MAX_IMAGE_BYTES};
use tickrt::error::{ConfigError, Fault, FaultContext, HardwareFault};
use tickrt::executor::{ExecContext, Suspend, VirtualThread};
use tickrt::hal::{Actuator, Sensor};
use tickrt::image::ModuleImage;
use tickrt::kernel::Runtime;
use tickrt::loader::{ModuleEntry, ModuleLoader, ModuleStore};
use tickrt::panic::{fatal, ReentryGuard};
use tickrt::scheduler::Registrar;
use tickrt::task::{Priority, TaskConfig};
use tickrt::telemetry::{LogRecord, LogSink, SinkError};
use tickrt::tick::{Tick, TickClock};
use tickrt::verify::K256Verifier;

static CLOCK: TickClock = TickClock::new();

const FIRMWARE_CONFIG: RuntimeConfig = RuntimeConfig::DEFAULT.with_policy(SafeStatePolicy::Reboot);

// `MODULE_KEY`: the module signing public key, generated by build.rs from
// the TICKRT_MODULE_KEY environment variable.
include!(concat!(env!("OUT_DIR"), "/module_key.rs"));

static MODULES: [ModuleEntry; 2] = [
    ModuleEntry {
        name: "pump-pi",
        init: pump_init,
        teardown: Some(pump_teardown),
    },
    ModuleEntry {
        name: "drain",
        init: drain_init,
        teardown: Some(pump_teardown),
    },
];

// ---------------------------------------------------------------------------
// Board
// ---------------------------------------------------------------------------

mod board {
    use core::ptr::{read_volatile, write_volatile};

    use tickrt::error::HardwareFault;
    use tickrt::hal::{Actuator, OutputBank, Sensor};

    const ADC1_SR: *const u32 = 0x4001_2000 as *const u32;
    const ADC1_CR2: *mut u32 = 0x4001_2008 as *mut u32;
    const ADC1_DR: *const u32 = 0x4001_204C as *const u32;
    const TIM3_CCR1: *mut u32 = 0x4000_0434 as *mut u32;
    const GPIOD_ODR: *mut u32 = 0x4002_0C14 as *mut u32;

    const ADC_SR_EOC: u32 = 1 << 1;
    const ADC_CR2_SWSTART: u32 = 1 << 30;
    const LED_PIN: u32 = 1 << 12;

    pub const PWM_MAX: u16 = 1000;

    /// Tank level on ADC1, 12 bit.
    pub struct LevelSensor;

    impl LevelSensor {
        pub fn start(&mut self) {
            // SAFETY: ADC1 is owned by this driver
            unsafe {
                let cr2 = read_volatile(ADC1_CR2);
                write_volatile(ADC1_CR2, cr2 | ADC_CR2_SWSTART);
            }
        }
    }

    impl Sensor for LevelSensor {
        type Value = u16;

        fn read(&mut self) -> Result<u16, HardwareFault> {
            // SAFETY: read-only status and data registers
            let sr = unsafe { read_volatile(ADC1_SR) };
            if sr & ADC_SR_EOC == 0 {
                return Err(HardwareFault::new("adc1", 1));
            }
            let raw = unsafe { read_volatile(ADC1_DR) };
            Ok((raw & 0x0FFF) as u16)
        }
    }

    /// Pump drive on TIM3 channel 1.
    pub struct PumpPwm;

    impl Actuator for PumpPwm {
        type Value = u16;

        fn set(&mut self, duty: u16) -> Result<(), HardwareFault> {
            if duty > PWM_MAX {
                return Err(HardwareFault::new("tim3", 2));
            }
            // SAFETY: TIM3 is owned by this driver
            unsafe { write_volatile(TIM3_CCR1, duty as u32) };
            Ok(())
        }
    }

    /// Pump PWM plus the GPIOD outputs.
    pub struct Outputs;

    impl OutputBank for Outputs {
        fn disable_all(&mut self) -> Result<(), HardwareFault> {
            // SAFETY: plain register writes, valid from any context
            unsafe {
                write_volatile(TIM3_CCR1, 0);
                write_volatile(GPIOD_ODR, 0);
                if read_volatile(TIM3_CCR1) != 0 {
                    return Err(HardwareFault::new("tim3", 3));
                }
            }
            Ok(())
        }
    }

    const FLASH_KEYR: *mut u32 = 0x4002_3C04 as *mut u32;
    const FLASH_SR: *mut u32 = 0x4002_3C0C as *mut u32;
    const FLASH_CR: *mut u32 = 0x4002_3C10 as *mut u32;

    const FLASH_KEY1: u32 = 0x4567_0123;
    const FLASH_KEY2: u32 = 0xCDEF_89AB;
    const SR_BSY: u32 = 1 << 16;
    /// PGSERR, PGPERR, PGAERR, WRPERR, OPERR
    const SR_ERRORS: u32 = 0b1111_0010;
    const CR_PG: u32 = 1 << 0;
    const CR_SER: u32 = 1 << 1;
    const CR_SNB_SHIFT: u32 = 3;
    const CR_PSIZE_X32: u32 = 0b10 << 8;
    const CR_STRT: u32 = 1 << 16;
    const CR_LOCK: u32 = 1 << 31;

    /// A 128 KiB sector erase takes up to 2 s at x32 parallelism.
    const FLASH_SPIN_LIMIT: u32 = 40_000_000;

    /// Embedded flash controller, 32-bit programming (2.7 V to 3.6 V).
    ///
    /// Instruction fetch from flash stalls while a sector erases, so the
    /// tick count falls behind wall time across a write.
    pub struct Flash;

    impl Flash {
        fn wait_idle(&self) -> Result<(), HardwareFault> {
            for _ in 0..FLASH_SPIN_LIMIT {
                // SAFETY: status register, error bits are write-1-to-clear
                let sr = unsafe { read_volatile(FLASH_SR) };
                if sr & SR_BSY != 0 {
                    continue;
                }
                if sr & SR_ERRORS != 0 {
                    unsafe { write_volatile(FLASH_SR, sr & SR_ERRORS) };
                    return Err(HardwareFault::new("flash", (sr & SR_ERRORS) as u16));
                }
                return Ok(());
            }
            Err(HardwareFault::new("flash", 0x100))
        }

        fn unlock(&self) {
            // SAFETY: key sequence from RM0090 3.5.1
            unsafe {
                if read_volatile(FLASH_CR) & CR_LOCK != 0 {
                    write_volatile(FLASH_KEYR, FLASH_KEY1);
                    write_volatile(FLASH_KEYR, FLASH_KEY2);
                }
            }
        }

        fn lock(&self) {
            unsafe { write_volatile(FLASH_CR, CR_LOCK) };
        }

        fn erase_sector(&self, sector: u32) -> Result<(), HardwareFault> {
            self.wait_idle()?;
            let cr = CR_PSIZE_X32 | CR_SER | (sector << CR_SNB_SHIFT);
            // SAFETY: controller is unlocked and idle
            unsafe {
                write_volatile(FLASH_CR, cr);
                write_volatile(FLASH_CR, cr | CR_STRT);
            }
            self.wait_idle()
        }

        fn program_word(&self, addr: usize, word: u32) -> Result<(), HardwareFault> {
            // SAFETY: addr is word aligned inside an erased sector
            unsafe {
                write_volatile(FLASH_CR, CR_PSIZE_X32 | CR_PG);
                write_volatile(addr as *mut u32, word);
            }
            self.wait_idle()
        }

        /// Erase `sector` and write `image` behind a length word at `base`.
        /// The length word goes in last, so an interrupted write reads back
        /// as an empty region.
        pub fn write_region(&mut self, base: usize, sector: u32, image: &[u8]) -> Result<(), HardwareFault> {
            self.unlock();
            let result = self.erase_sector(sector).and_then(|()| {
                for (i, chunk) in image.chunks(4).enumerate() {
                    let mut word = [0xFF; 4];
                    word[..chunk.len()].copy_from_slice(chunk);
                    self.program_word(base + 4 + i * 4, u32::from_le_bytes(word))?;
                }
                self.program_word(base, image.len() as u32)
            });
            self.lock();
            result
        }
    }

    pub fn toggle_led() {
        // SAFETY: GPIOD is only touched from the mainline
        unsafe {
            let odr = read_volatile(GPIOD_ODR);
            write_volatile(GPIOD_ODR, odr ^ LED_PIN);
        }
    }
}

// ---------------------------------------------------------------------------
// Logging: ITM port 0 for the `log` facade, port 1 for the record sink
// ---------------------------------------------------------------------------

fn with_stim<R>(port: usize, f: impl FnOnce(&mut itm::Stim) -> R) -> R {
    cortex_m::interrupt::free(|_| {
        // SAFETY: stimulus ports are only written inside this critical section
        let itm = unsafe { &mut *(ITM::PTR as *mut itm::RegisterBlock) };
        f(&mut itm.stim[port])
    })
}

struct ItmLogger;

impl Log for ItmLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            with_stim(0, |port| {
                cortex_m::itm::write_fmt(port, format_args!("{:<5} {}\n", record.level(), record.args()))
            });
        }
    }

    fn flush(&self) {}
}

static LOGGER: ItmLogger = ItmLogger;

struct ItmSink;

impl LogSink for ItmSink {
    fn append(&mut self, record: &LogRecord) -> Result<(), SinkError> {
        with_stim(1, |port| {
            if !port.is_fifo_ready() {
                return Err(SinkError::Busy);
            }
            cortex_m::itm::write_fmt(port, format_args!("{} {} {}\n", record.tick, record.level, record.event));
            Ok(())
        })
    }
}

// ---------------------------------------------------------------------------
// Module storage
// ---------------------------------------------------------------------------

const CANDIDATE_REGION: usize = 0x080C_0000;
const LKG_REGION: usize = 0x080E_0000;
const LKG_SECTOR: u32 = 11;
const ERASED: u32 = 0xFFFF_FFFF;

/// Image stored in a flash region, if the length word is sane.
fn region(base: usize) -> Option<&'static [u8]> {
    // SAFETY: both regions are memory-mapped flash reserved in memory.x
    let len = unsafe { core::ptr::read_volatile(base as *const u32) };
    if len == ERASED || len == 0 || len as usize > MAX_IMAGE_BYTES {
        return None;
    }
    Some(unsafe { core::slice::from_raw_parts((base + 4) as *const u8, len as usize) })
}

struct FlashStore {
    flash: board::Flash,
}

impl ModuleStore for FlashStore {
    fn load_last_known_good(&mut self, buf: &mut [u8]) -> Result<Option<usize>, HardwareFault> {
        let Some(image) = region(LKG_REGION) else {
            return Ok(None);
        };
        let dst = buf
            .get_mut(..image.len())
            .ok_or(HardwareFault::new("flash", 1))?;
        dst.copy_from_slice(image);
        Ok(Some(image.len()))
    }

    fn store_last_known_good(&mut self, image: &[u8]) -> Result<(), HardwareFault> {
        if region(LKG_REGION) == Some(image) {
            return Ok(());
        }
        self.flash.write_region(LKG_REGION, LKG_SECTOR, image)?;
        if region(LKG_REGION) != Some(image) {
            return Err(HardwareFault::new("flash", 2));
        }
        log::info!("last-known-good persisted ({} bytes)", image.len());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Boot tasks
// ---------------------------------------------------------------------------

/// Last level sample, written by the sampler, read by the controllers.
static LEVEL: AtomicU16 = AtomicU16::new(0);

fn heartbeat(_: Tick) -> Result<(), Fault> {
    board::toggle_led();
    Ok(())
}

struct Sampler {
    sensor: board::LevelSensor,
}

impl VirtualThread for Sampler {
    fn resume(&mut self, cx: &mut ExecContext) -> Result<Suspend, Fault> {
        match cx.resume_point() {
            0 => {
                self.sensor.start();
                cx.sleep_for(1, 1)
            }
            _ => {
                let level = self.sensor.read().context("level_sample")?;
                LEVEL.store(level, Ordering::Relaxed);
                cx.sleep_for(4, 0)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Controller modules
// ---------------------------------------------------------------------------

static SETPOINT: AtomicU16 = AtomicU16::new(2048);
static KP: AtomicU16 = AtomicU16::new(8);
static KI: AtomicU16 = AtomicU16::new(1);
static INTEGRAL: AtomicI32 = AtomicI32::new(0);

const INTEGRAL_LIMIT: i32 = 64_000;

/// Payload: setpoint, kp, ki as little-endian u16. Missing fields keep
/// their defaults.
fn pump_init(image: &ModuleImage<'_>, reg: &mut Registrar<'_>) -> Result<(), ConfigError> {
    if let [s0, s1, p0, p1, i0, i1, ..] = image.payload() {
        SETPOINT.store(u16::from_le_bytes([*s0, *s1]), Ordering::Relaxed);
        KP.store(u16::from_le_bytes([*p0, *p1]), Ordering::Relaxed);
        KI.store(u16::from_le_bytes([*i0, *i1]), Ordering::Relaxed);
    }
    INTEGRAL.store(0, Ordering::Relaxed);
    reg.register_periodic(TaskConfig::periodic(10, Priority::High), pump_control)?;
    Ok(())
}

fn pump_control(_: Tick) -> Result<(), Fault> {
    let error = SETPOINT.load(Ordering::Relaxed) as i32 - LEVEL.load(Ordering::Relaxed) as i32;
    let integral = (INTEGRAL.load(Ordering::Relaxed) + error).clamp(-INTEGRAL_LIMIT, INTEGRAL_LIMIT);
    INTEGRAL.store(integral, Ordering::Relaxed);

    let kp = KP.load(Ordering::Relaxed) as i32;
    let ki = KI.load(Ordering::Relaxed) as i32;
    let output = kp
        .saturating_mul(error)
        .saturating_add(ki.saturating_mul(integral) / 16)
        / 16;
    let duty = output.clamp(0, board::PWM_MAX as i32) as u16;

    board::PumpPwm.set(duty).context("pump_pwm")
}

fn drain_init(image: &ModuleImage<'_>, reg: &mut Registrar<'_>) -> Result<(), ConfigError> {
    if let [s0, s1, ..] = image.payload() {
        SETPOINT.store(u16::from_le_bytes([*s0, *s1]), Ordering::Relaxed);
    }
    reg.register_periodic(TaskConfig::periodic(20, Priority::Medium), drain_control)?;
    Ok(())
}

fn drain_control(_: Tick) -> Result<(), Fault> {
    let duty = if LEVEL.load(Ordering::Relaxed) < SETPOINT.load(Ordering::Relaxed) {
        board::PWM_MAX
    } else {
        0
    };
    board::PumpPwm.set(duty).context("drain_pwm")
}

fn pump_teardown(_: &ModuleImage<'_>) {
    if let Err(err) = board::PumpPwm.set(0) {
        log::warn!("pump teardown: {}", err);
    }
    INTEGRAL.store(0, Ordering::Relaxed);
}

// ---------------------------------------------------------------------------
// Exceptions
// ---------------------------------------------------------------------------

#[exception]
fn SysTick() {
    CLOCK.on_timer_interrupt();
}

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    static GUARD: ReentryGuard = ReentryGuard::new();
    static REPORTED: AtomicBool = AtomicBool::new(false);

    if !REPORTED.swap(true, Ordering::Relaxed) {
        log::error!("panic: {}", info);
    }
    fatal(&GUARD, &mut board::Outputs, &mut CoreControl, &FIRMWARE_CONFIG);
    cortex_m4::halt()
}

// ---------------------------------------------------------------------------
// Main entry point
// ---------------------------------------------------------------------------

#[entry]
fn main() -> ! {
    let Some(mut core) = cortex_m::Peripherals::take() else {
        cortex_m4::halt()
    };
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(LevelFilter::Info);
    }

    let loader = ModuleLoader::new(K256Verifier, &MODULE_KEY, &MODULES);
    let mut rt = Runtime::new(&CLOCK, FIRMWARE_CONFIG, loader);

    if let Err(err) = rt.register_periodic(TaskConfig::periodic(500, Priority::Low), heartbeat) {
        log::warn!("heartbeat not registered: {}", err);
    }
    if let Some(sampler) = cortex_m::singleton!(: Sampler = Sampler { sensor: board::LevelSensor }) {
        if let Err(err) = rt.register_thread(Priority::Medium, None, sampler) {
            log::warn!("sampler not registered: {}", err);
        }
    }

    let mut store = FlashStore { flash: board::Flash };
    let outcome = rt.boot_module(&mut store, region(CANDIDATE_REGION));
    log::info!("boot: {:?}", outcome);

    cortex_m4::set_interrupt_priorities(&mut core.SCB);
    cortex_m4::configure_systick(&mut core.SYST);

    let mut sink = ItmSink;
    loop {
        let pass = rt.run_until_idle();
        if pass.safe_state || rt.safe_state_pending() {
            rt.enter_safe_state(&mut board::Outputs, &mut sink, &mut CoreControl);
            cortex_m4::halt();
        }
        if rt.module_exhausted() {
            let outcome = rt.revert_module(&mut store);
            log::warn!("module exhausted, {:?}", outcome);
            continue;
        }
        rt.flush_logs(&mut sink);
        if pass.idle {
            cortex_m4::wait_for_tick(&CLOCK);
        }
    }
}
