//! # Tick Clock
//!
//! The monotonic tick counter is the only source of time in the system.
//! The SysTick handler calls [`TickClock::on_timer_interrupt`]; everything
//! else reads.
//!
//! ## Wraparound
//!
//! Ticks are `u32` and wrap at 2^32 (about 49.7 days at 1 kHz). Comparisons
//! go through [`Tick::cmp_wrapping`], which orders two ticks by their signed
//! distance. That is correct as long as the ticks being compared are less
//! than 2^31 apart, which holds for every deadline and wake time the
//! scheduler keeps.

use core::cmp::Ordering;
use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering as AtomicOrdering};

use crate::sync;

/// One unit of the hardware-timer-driven clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Tick(pub u32);

impl Tick {
    pub const ZERO: Tick = Tick(0);

    #[inline]
    pub const fn raw(self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn wrapping_add(self, ticks: u32) -> Tick {
        Tick(self.0.wrapping_add(ticks))
    }

    #[inline]
    pub const fn wrapping_sub(self, ticks: u32) -> Tick {
        Tick(self.0.wrapping_sub(ticks))
    }

    /// Signed distance from `self` to `later`. Positive when `later` is ahead.
    #[inline]
    pub const fn distance_to(self, later: Tick) -> i32 {
        later.0.wrapping_sub(self.0) as i32
    }

    /// Order two ticks across the wrap boundary.
    #[inline]
    pub const fn cmp_wrapping(self, other: Tick) -> Ordering {
        let d = other.distance_to(self);
        if d < 0 {
            Ordering::Less
        } else if d > 0 {
            Ordering::Greater
        } else {
            Ordering::Equal
        }
    }

    /// `true` once `now` has caught up with this tick.
    #[inline]
    pub const fn is_reached(self, now: Tick) -> bool {
        self.distance_to(now) >= 0
    }

    /// Ticks left until this tick, saturating at zero when already reached.
    #[inline]
    pub const fn ticks_from(self, now: Tick) -> u32 {
        let d = now.distance_to(self);
        if d > 0 {
            d as u32
        } else {
            0
        }
    }
}

impl fmt::Display for Tick {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}

/// Interrupt-safe monotonic counter plus the "reschedule needed" flag.
///
/// `const`-constructible so firmware can keep it in a `static` the SysTick
/// handler can reach:
///
/// ```ignore
/// static CLOCK: TickClock = TickClock::new();
///
/// #[exception]
/// fn SysTick() {
///     CLOCK.on_timer_interrupt();
/// }
/// ```
pub struct TickClock {
    ticks: AtomicU32,
    reschedule: AtomicBool,
}

impl TickClock {
    pub const fn new() -> Self {
        Self::starting_at(Tick::ZERO)
    }

    /// Clock that starts at an arbitrary tick. Used to exercise wraparound.
    pub const fn starting_at(tick: Tick) -> Self {
        Self {
            ticks: AtomicU32::new(tick.0),
            reschedule: AtomicBool::new(false),
        }
    }

    /// Current tick. One atomic load.
    #[inline]
    pub fn current_tick(&self) -> Tick {
        Tick(self.ticks.load(AtomicOrdering::Acquire))
    }

    /// Timer ISR entry point. Advances the counter by exactly one and asks
    /// the mainline to re-evaluate readiness. Never runs task logic.
    #[inline]
    pub fn on_timer_interrupt(&self) {
        // Single writer: only this ISR stores to `ticks`, so load + store
        // cannot lose an increment and needs no read-modify-write support.
        let next = self.ticks.load(AtomicOrdering::Relaxed).wrapping_add(1);
        self.ticks.store(next, AtomicOrdering::Release);
        self.reschedule.store(true, AtomicOrdering::Release);
    }

    /// Read and clear the reschedule flag.
    #[inline]
    pub fn take_reschedule(&self) -> bool {
        sync::critical_section(|_| {
            let pending = self.reschedule.load(AtomicOrdering::Acquire);
            self.reschedule.store(false, AtomicOrdering::Release);
            pending
        })
    }

    /// Tick and reschedule flag read together, with the flag cleared.
    ///
    /// Taking both inside one critical section guarantees the flag refers to
    /// the returned tick and not to an increment that lands in between.
    pub fn snapshot(&self) -> (Tick, bool) {
        sync::critical_section(|_| {
            let now = Tick(self.ticks.load(AtomicOrdering::Acquire));
            let pending = self.reschedule.load(AtomicOrdering::Acquire);
            self.reschedule.store(false, AtomicOrdering::Release);
            (now, pending)
        })
    }
}

impl Default for TickClock {
    fn default() -> Self {
        Self::new()
    }
}
