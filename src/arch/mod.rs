//! # Architecture Abstraction Layer
//!
//! Register-level shims the firmware needs around the portable core:
//! SysTick setup, idle sleep, halt and reset. Only built for ARM targets;
//! everything else in the crate is target-independent.

#[cfg(target_arch = "arm")]
pub mod cortex_m4;
