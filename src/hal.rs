//! # Capability Contracts
//!
//! The only hardware surface the runtime core and its tasks see. Concrete
//! implementations live with the board support code: exactly one per
//! physical device, handed to a task when it is registered. Nothing above
//! this boundary touches registers.

use crate::error::HardwareFault;

/// Readable input: ADC channel, digital pin, encoder.
pub trait Sensor {
    type Value;

    fn read(&mut self) -> Result<Self::Value, HardwareFault>;
}

/// Writable output: GPIO, PWM duty cycle, DAC.
pub trait Actuator {
    type Value;

    fn set(&mut self, value: Self::Value) -> Result<(), HardwareFault>;
}

/// Every actuator the board drives, as one bank the safe-state sequence
/// can switch off.
pub trait OutputBank {
    /// Drive every output to its inert value (zero duty, pins low).
    fn disable_all(&mut self) -> Result<(), HardwareFault>;
}

/// Last step of the safe-state sequence.
///
/// Firmware implementations do not return. Host doubles return so tests
/// can observe the call.
pub trait SystemControl {
    fn halt(&mut self);
    fn reboot(&mut self);
}

impl<T: OutputBank + ?Sized> OutputBank for &mut T {
    fn disable_all(&mut self) -> Result<(), HardwareFault> {
        (**self).disable_all()
    }
}
