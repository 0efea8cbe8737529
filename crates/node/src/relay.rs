//! The irrigation relay. The `gpio` feature gates the real rppal driver;
//! without it, a mock keeps the state in memory and logs changes.

use anyhow::Result;
use tracing::info;

#[cfg(feature = "gpio")]
use rppal::gpio::{Gpio, OutputPin};

// ---------------------------------------------------------------------------
// Real GPIO relay (production, requires rppal + Raspberry Pi hardware)
// ---------------------------------------------------------------------------
#[cfg(feature = "gpio")]
pub(crate) struct Relay {
    pin: OutputPin,
    active_low: bool, // many relay boards are active-low
    on: bool,
}

#[cfg(feature = "gpio")]
impl Relay {
    /// Claims the pin and drives it to "off".
    pub(crate) fn new(pin_num: u8, active_low: bool) -> Result<Self> {
        let pin = Gpio::new()?.get(pin_num)?.into_output();
        let mut relay = Self {
            pin,
            active_low,
            on: true,
        };
        relay.set(false);
        info!(gpio = pin_num, active_low, "relay: initialised off");
        Ok(relay)
    }

    /// Returns true when the state changed.
    pub(crate) fn set(&mut self, on: bool) -> bool {
        // active-low: LOW = ON, HIGH = OFF
        if on != self.active_low {
            self.pin.set_high();
        } else {
            self.pin.set_low();
        }
        let changed = self.on != on;
        self.on = on;
        if changed {
            info!(on, "relay: switched");
        }
        changed
    }

    pub(crate) fn is_on(&self) -> bool {
        self.on
    }
}

// ---------------------------------------------------------------------------
// Mock relay (development, no hardware)
// ---------------------------------------------------------------------------
#[cfg(not(feature = "gpio"))]
pub(crate) struct Relay {
    on: bool,
}

#[cfg(not(feature = "gpio"))]
impl Relay {
    pub(crate) fn new(pin_num: u8, _active_low: bool) -> Result<Self> {
        info!(gpio = pin_num, "[mock-gpio] relay initialised off (no hardware)");
        Ok(Self { on: false })
    }

    pub(crate) fn set(&mut self, on: bool) -> bool {
        let changed = self.on != on;
        self.on = on;
        if changed {
            info!(on, "[mock-gpio] relay switched");
        }
        changed
    }

    pub(crate) fn is_on(&self) -> bool {
        self.on
    }
}

// ===========================================================================
// Tests
// ===========================================================================
