//! # Synchronization Primitives
//!
//! Interrupt-safe critical section for the one boundary the runtime has:
//! the SysTick handler against the mainline scheduling loop.
//!
//! On the Cortex-M4 target the implementation comes from `cortex-m`'s
//! `critical-section-single-core` feature (PRIMASK masking). Host builds
//! use `critical-section`'s `std` implementation.

use critical_section::CriticalSection;

/// Execute a closure with interrupts masked.
///
/// Only multi-step reads or writes of state shared with the timer ISR need
/// this. Single atomic loads and stores do not.
///
/// # Usage
/// ```ignore
/// sync::critical_section(|_cs| {
///     // read tick and flag together
/// });
/// ```
#[inline]
pub fn critical_section<F, R>(f: F) -> R
where
    F: FnOnce(CriticalSection<'_>) -> R,
{
    critical_section::with(f)
}
