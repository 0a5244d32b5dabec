//! # TickRT Configuration
//!
//! Compile-time limits for the runtime core plus the [`RuntimeConfig`] policy
//! value handed to [`Runtime::new`](crate::kernel::Runtime::new).
//! All limits are fixed at compile time; nothing is allocated dynamically.

use crate::error::FaultCode;

/// Maximum number of tasks the task table can hold at once.
///
/// Module reloads stage the incoming module's tasks next to the outgoing
/// ones before the swap, so this must cover boot tasks plus two modules.
pub const MAX_TASKS: usize = 16;

/// SysTick frequency in Hz. One tick is one millisecond at the default.
pub const TICK_HZ: u32 = 1000;

/// Longest period, sleep or thread deadline budget, in ticks. Tick
/// comparisons use the signed distance between two ticks, so anything
/// further ahead would read as already past.
pub const MAX_INTERVAL_TICKS: u32 = i32::MAX as u32;

/// Deadline budget a virtual thread gets unless it asks for another one:
/// it should run within this many ticks of becoming eligible.
pub const DEFAULT_THREAD_DEADLINE_TICKS: u32 = 10;

/// System clock frequency in Hz (default for STM32F4 at 16 MHz HSI).
pub const SYSTEM_CLOCK_HZ: u32 = 16_000_000;

/// Causal frames kept per [`ErrorContext`](crate::panic::ErrorContext).
/// Deeper chains are truncated and the drop is counted.
pub const MAX_CAUSE_FRAMES: usize = 8;

/// Error contexts the panic handler holds between flushes.
pub const MAX_PENDING_CONTEXTS: usize = 8;

/// Structured records buffered for the persistent log sink.
pub const TELEMETRY_CAPACITY: usize = 32;

/// Largest module image (header + payload + signature) a slot can hold.
pub const MAX_IMAGE_BYTES: usize = 2048;

/// Nested safe-state entries tolerated before the handler forces a halt.
pub const SAFE_STATE_REENTRY_LIMIT: u8 = 2;

/// What the safe-state sequence does once outputs are off and logs flushed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SafeStatePolicy {
    /// Park the CPU until power cycle.
    Halt,
    /// Request a controlled system reset.
    Reboot,
}

/// Bit set of [`FaultCode`]s classified as global severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaultMask(u32);

impl FaultMask {
    pub const EMPTY: Self = Self(0);

    pub const fn with(self, code: FaultCode) -> Self {
        Self(self.0 | code.bit())
    }

    pub const fn without(self, code: FaultCode) -> Self {
        Self(self.0 & !code.bit())
    }

    #[inline]
    pub const fn contains(&self, code: FaultCode) -> bool {
        self.0 & code.bit() != 0
    }
}

/// Runtime policy, fixed at boot.
#[derive(Debug, Clone, Copy)]
pub struct RuntimeConfig {
    /// Final step of the safe-state sequence.
    pub safe_state_policy: SafeStatePolicy,

    /// Fault codes that take the whole system to safe state instead of
    /// isolating the task that raised them.
    pub global_faults: FaultMask,

    /// Attempts at disabling outputs before the sequence moves on.
    pub output_retry_limit: u8,

    /// Attempts per record when writing to the log sink.
    pub sink_retry_limit: u8,

    /// Upper bound on scheduling decisions in one `run_until_idle` pass.
    /// Tasks that keep yielding would otherwise spin the pass forever.
    pub max_dispatches_per_pass: u16,
}

impl RuntimeConfig {
    pub const DEFAULT: Self = Self {
        safe_state_policy: SafeStatePolicy::Halt,
        global_faults: FaultMask::EMPTY
            .with(FaultCode::MemoryCorruption)
            .with(FaultCode::StackOverflow)
            .with(FaultCode::Watchdog),
        output_retry_limit: 3,
        sink_retry_limit: 3,
        max_dispatches_per_pass: 64,
    };

    pub const fn with_policy(mut self, policy: SafeStatePolicy) -> Self {
        self.safe_state_policy = policy;
        self
    }

    pub const fn with_global_faults(mut self, mask: FaultMask) -> Self {
        self.global_faults = mask;
        self
    }

    pub const fn with_retry_limits(mut self, outputs: u8, sink: u8) -> Self {
        self.output_retry_limit = outputs;
        self.sink_retry_limit = sink;
        self
    }

    pub const fn with_dispatch_budget(mut self, budget: u16) -> Self {
        self.max_dispatches_per_pass = budget;
        self
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}
