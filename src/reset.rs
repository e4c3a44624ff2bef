//! Strategies for forcing the target into its bootloader.
//!
//! Optiboot only listens for a short window after reset, so each strategy
//! discards any stale input before releasing the target from reset.

use embedded_hal::blocking::delay::DelayMs;
use embedded_hal::digital::v2::OutputPin;

use crate::{Error, SerialPort};

/// Default reset hold time when toggling the RTS line
pub const RTS_HOLD_MS: u32 = 500;

/// Default reset hold time when toggling a GPIO
pub const GPIO_HOLD_MS: u32 = 200;

/// Reset action applied once before synchronising with the bootloader
pub trait Reset<P, E> {
    fn reset<D: DelayMs<u32>>(&mut self, port: &mut P, delay: &mut D) -> Result<(), Error<E>>;
}

/// Reset via the serial port RTS line, as wired on USB attached boards
#[derive(Clone, PartialEq, Debug)]
pub struct RtsReset {
    pub hold_ms: u32,
}

impl Default for RtsReset {
    fn default() -> Self {
        Self { hold_ms: RTS_HOLD_MS }
    }
}

impl<P, E> Reset<P, E> for RtsReset
where
    P: SerialPort<E>,
{
    fn reset<D: DelayMs<u32>>(&mut self, port: &mut P, delay: &mut D) -> Result<(), Error<E>> {
        info!("Resetting via RTS...");

        port.set_rts(false)?;
        delay.delay_ms(self.hold_ms);

        let n = port.flush_input()?;
        if n > 0 {
            debug!("Discarded {} stale bytes", n);
        }

        port.set_rts(true)?;

        Ok(())
    }
}

/// Reset via an output pin connected to the target reset line
pub struct PinReset<G> {
    pin: G,
    hold_ms: u32,
}

impl<G: OutputPin> PinReset<G> {
    pub fn new(pin: G, hold_ms: u32) -> Self {
        Self { pin, hold_ms }
    }

    /// Release the underlying pin
    pub fn release(self) -> G {
        self.pin
    }

    /// Reset the target then hand the pin to `release`, whether or not the reset succeeded.
    ///
    /// A reset error takes precedence over a release error.
    pub fn reset_and_release<P, E, D, F>(mut self, port: &mut P, delay: &mut D, release: F) -> Result<(), Error<E>>
    where
        P: SerialPort<E>,
        D: DelayMs<u32>,
        F: FnOnce(G) -> Result<(), Error<E>>,
        G::Error: core::fmt::Debug,
    {
        let res = Reset::<P, E>::reset(&mut self, port, delay);
        let released = release(self.pin);

        res.and(released)
    }
}

impl<P, E, G> Reset<P, E> for PinReset<G>
where
    P: SerialPort<E>,
    G: OutputPin,
    G::Error: core::fmt::Debug,
{
    fn reset<D: DelayMs<u32>>(&mut self, port: &mut P, delay: &mut D) -> Result<(), Error<E>> {
        self.pin.set_low().map_err(|e| Error::Reset(format!("{:?}", e)))?;
        delay.delay_ms(self.hold_ms);

        port.flush_input()?;

        self.pin.set_high().map_err(|e| Error::Reset(format!("{:?}", e)))?;

        Ok(())
    }
}
