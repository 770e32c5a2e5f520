use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use pidose_traits::{BoxError, Button, PressFn, Relay};
use rppal::gpio::{Gpio, InputPin, Level, OutputPin, Trigger};
use tracing::{debug, info};

use crate::error::{HwError, Result};

fn gpio_err(e: rppal::gpio::Error) -> HwError {
    HwError::Gpio(e.to_string())
}

/// Relay on a GPIO output. Polarity is wiring, so it is configured, not assumed.
pub struct GpioRelay {
    pin: Mutex<OutputPin>,
    active_low: bool,
}

impl GpioRelay {
    pub fn new(pin: u8, active_low: bool) -> Result<Self> {
        let gpio = Gpio::new().map_err(gpio_err)?;
        let mut out = gpio.get(pin).map_err(gpio_err)?.into_output();
        // Never power up with the pump running.
        out.set_reset_on_drop(false);
        if active_low {
            out.set_high();
        } else {
            out.set_low();
        }
        info!(pin, active_low, "relay ready (off)");
        Ok(Self {
            pin: Mutex::new(out),
            active_low,
        })
    }

    fn drive(&self, on: bool) {
        let mut pin = self.pin.lock().unwrap_or_else(PoisonError::into_inner);
        if on != self.active_low {
            pin.set_high();
        } else {
            pin.set_low();
        }
    }
}

impl Relay for GpioRelay {
    fn on(&self) -> std::result::Result<(), BoxError> {
        self.drive(true);
        Ok(())
    }

    fn off(&self) -> std::result::Result<(), BoxError> {
        self.drive(false);
        Ok(())
    }

    fn is_on(&self) -> bool {
        let pin = self.pin.lock().unwrap_or_else(PoisonError::into_inner);
        pin.is_set_high() != self.active_low
    }
}

impl Drop for GpioRelay {
    fn drop(&mut self) {
        self.drive(false);
    }
}

/// Push-button on a GPIO input, edge-triggered with a software debounce window.
pub struct GpioButton {
    pin: InputPin,
    pull_up: bool,
    debounce: Duration,
}

impl GpioButton {
    pub fn new(pin: u8, pull_up: bool, debounce: Duration) -> Result<Self> {
        let gpio = Gpio::new().map_err(gpio_err)?;
        let p = gpio.get(pin).map_err(gpio_err)?;
        let input = if pull_up {
            p.into_input_pullup()
        } else {
            p.into_input_pulldown()
        };
        Ok(Self {
            pin: input,
            pull_up,
            debounce,
        })
    }
}

impl Button for GpioButton {
    fn when_pressed(&mut self, mut callback: PressFn) -> std::result::Result<(), BoxError> {
        // Pressed pulls the line toward the opposite rail of the pull resistor.
        let (trigger, pressed_level) = if self.pull_up {
            (Trigger::FallingEdge, Level::Low)
        } else {
            (Trigger::RisingEdge, Level::High)
        };
        let debounce = self.debounce;
        let mut last: Option<Instant> = None;
        self.pin
            .set_async_interrupt(trigger, move |level: Level| {
                if level != pressed_level {
                    return;
                }
                let now = Instant::now();
                if let Some(prev) = last
                    && now.saturating_duration_since(prev) < debounce
                {
                    debug!("button bounce ignored");
                    return;
                }
                last = Some(now);
                callback();
            })
            .map_err(gpio_err)?;
        Ok(())
    }
}
