//! # Cortex-M4 Port Layer
//!
//! Hardware-specific code for the ARM Cortex-M4 (Thumb-2) processor.
//!
//! The runtime needs very little from the core: a periodic SysTick that
//! feeds [`TickClock::on_timer_interrupt`], a way to sleep until that tick
//! without losing it, and the two terminal actions of the safe-state
//! sequence. There is no context switch: tasks are resumed as ordinary
//! calls on the main stack.
//!
//! ## Interrupt Priorities
//!
//! - SysTick: 0xF0 (lowest with 4 priority bits). The handler only bumps an
//!   atomic counter, so it never needs to preempt application ISRs.

use cortex_m::peripheral::scb::SystemHandler;
use cortex_m::peripheral::syst::SystClkSource;
use cortex_m::peripheral::{SCB, SYST};

use crate::config::{SYSTEM_CLOCK_HZ, TICK_HZ};
use crate::hal::SystemControl;
use crate::tick::TickClock;

const SYSTICK_PRIORITY: u8 = 0xF0;

// ---------------------------------------------------------------------------
// SysTick configuration
// ---------------------------------------------------------------------------

/// Fire SysTick at `TICK_HZ` from the processor clock.
///
/// The firmware's `SysTick` exception handler must call
/// [`TickClock::on_timer_interrupt`] and nothing else.
pub fn configure_systick(syst: &mut SYST) {
    let reload = SYSTEM_CLOCK_HZ / TICK_HZ - 1;
    syst.set_reload(reload);
    syst.clear_current();
    syst.set_clock_source(SystClkSource::Core);
    syst.enable_counter();
    syst.enable_interrupt();
}

/// Put SysTick at the lowest priority.
pub fn set_interrupt_priorities(scb: &mut SCB) {
    // SAFETY: changing an exception priority cannot break a critical
    // section; the runtime does not use priority-based locking.
    unsafe {
        scb.set_priority(SystemHandler::SysTick, SYSTICK_PRIORITY);
    }
}

// ---------------------------------------------------------------------------
// Idle
// ---------------------------------------------------------------------------

/// Sleep until the next tick unless one already arrived.
///
/// The flag is checked with interrupts masked. WFI still wakes on a pending
/// interrupt, so a tick landing between the check and the sleep is not lost.
pub fn wait_for_tick(clock: &TickClock) {
    cortex_m::interrupt::free(|_| {
        if !clock.take_reschedule() {
            cortex_m::asm::wfi();
        }
    });
}

// ---------------------------------------------------------------------------
// Terminal actions
// ---------------------------------------------------------------------------

/// Mask interrupts and stop.
pub fn halt() -> ! {
    cortex_m::interrupt::disable();
    loop {
        cortex_m::asm::wfi();
    }
}

/// Request a system reset through AIRCR.
pub fn reset() -> ! {
    SCB::sys_reset()
}

/// [`SystemControl`] backed by the core itself.
#[derive(Debug, Default)]
pub struct CoreControl;

impl SystemControl for CoreControl {
    fn halt(&mut self) {
        halt()
    }

    fn reboot(&mut self) {
        reset()
    }
}
