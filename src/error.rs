//! # Errors
//!
//! The four error kinds the runtime distinguishes, and how they propagate:
//!
//! | Kind | Raised by | Goes to |
//! |------|-----------|---------|
//! | [`ConfigError`] | task registration, module `init` | the registering caller; aborts module activation |
//! | [`HardwareFault`] | HAL capabilities | the calling task; `?` escalates it to a [`Fault`] |
//! | [`VerificationFailure`] | module loader | stays in the loader, triggers fallback |
//! | [`Fault`] | task logic | always the panic handler |

use thiserror::Error;

use crate::image::ImageError;
use crate::panic::{CauseFrame, FrameChain};
use crate::task::TaskId;

/// Coarse classification carried by every [`ErrorContext`](crate::panic::ErrorContext).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Config,
    Hardware,
    Verification,
    Runtime,
}

/// Bad registration parameters or exhausted task table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("period_ticks must be positive")]
    ZeroPeriod,
    #[error("thread deadline budget must be positive")]
    ZeroDeadline,
    #[error("interval of {0} ticks exceeds the comparable range")]
    IntervalTooLong(u32),
    #[error("task table full ({capacity} slots)")]
    TableFull { capacity: usize },
    #[error("no task with id {0}")]
    UnknownTask(TaskId),
    #[error("module init registered no tasks")]
    NoTasks,
    #[error("image names entry table {0}, firmware has none")]
    UnknownEntry(u8),
}

/// A capability read/write that the device refused or could not complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("hardware fault on {device} (code {code})")]
pub struct HardwareFault {
    pub device: &'static str,
    pub code: u16,
}

impl HardwareFault {
    pub const fn new(device: &'static str, code: u16) -> Self {
        Self { device, code }
    }
}

/// Why a candidate module image was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum VerificationFailure {
    #[error("malformed image: {0}")]
    Malformed(#[from] ImageError),
    #[error("signature does not match image")]
    BadSignature,
}

/// Cause of a runtime fault. The discriminant doubles as the bit index in
/// [`FaultMask`](crate::config::FaultMask).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultCode {
    /// Overflow, division by zero, out-of-range conversion.
    Arithmetic,
    /// A task broke its own contract (bad state, violated precondition).
    Contract,
    /// An unhandled [`HardwareFault`] escalated by the task.
    Hardware,
    /// Corruption signalled by the bootstrap layer.
    MemoryCorruption,
    StackOverflow,
    Watchdog,
    /// Registration failure reported through the panic handler.
    Config,
    /// Rejected module image reported through the panic handler.
    Verification,
}

impl FaultCode {
    #[inline]
    pub const fn bit(self) -> u32 {
        1 << (self as u32)
    }

    pub const fn kind(self) -> ErrorKind {
        match self {
            FaultCode::Config => ErrorKind::Config,
            FaultCode::Verification => ErrorKind::Verification,
            FaultCode::Hardware => ErrorKind::Hardware,
            _ => ErrorKind::Runtime,
        }
    }
}

/// Unrecoverable failure raised by task logic.
///
/// Carries a bounded chain of causal frames, innermost first. Building one
/// never allocates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("runtime fault {code:?}")]
pub struct Fault {
    code: FaultCode,
    frames: FrameChain,
}

impl Fault {
    pub const fn new(code: FaultCode) -> Self {
        Self {
            code,
            frames: FrameChain::new(),
        }
    }

    /// Fault with a single location frame.
    pub fn at(code: FaultCode, tag: &'static str) -> Self {
        Self::new(code).frame(tag, None)
    }

    /// Append an outer frame. Frames past capacity are counted, not stored.
    pub fn frame(mut self, tag: &'static str, detail: Option<u32>) -> Self {
        self.frames.push(CauseFrame { tag, detail });
        self
    }

    pub const fn code(&self) -> FaultCode {
        self.code
    }

    pub const fn frames(&self) -> &FrameChain {
        &self.frames
    }
}

impl From<HardwareFault> for Fault {
    fn from(err: HardwareFault) -> Self {
        Fault::new(FaultCode::Hardware).frame(err.device, Some(err.code as u32))
    }
}

/// Attach a frame to the error side of a result while converting it to a
/// [`Fault`].
///
/// ```ignore
/// let level = tank.read().context("tank_level")?;
/// ```
pub trait FaultContext<T> {
    fn context(self, tag: &'static str) -> Result<T, Fault>;
}

impl<T, E: Into<Fault>> FaultContext<T> for Result<T, E> {
    fn context(self, tag: &'static str) -> Result<T, Fault> {
        self.map_err(|e| e.into().frame(tag, None))
    }
}

/// Union of the runtime's error kinds, for callers that handle several.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Hardware(#[from] HardwareFault),
    #[error(transparent)]
    Verification(#[from] VerificationFailure),
    #[error(transparent)]
    Runtime(#[from] Fault),
}

impl Error {
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Error::Config(_) => ErrorKind::Config,
            Error::Hardware(_) => ErrorKind::Hardware,
            Error::Verification(_) => ErrorKind::Verification,
            Error::Runtime(_) => ErrorKind::Runtime,
        }
    }
}
