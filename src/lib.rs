//! AVR optiboot serial bootloader programmer.
//!
//! Based on AVR061 (STK500 communication protocol), implementing
//! the subset of commands understood by optiboot.

use core::marker::PhantomData;

#[macro_use]
extern crate log;

#[macro_use(block)]
extern crate nb;

extern crate embedded_hal;
use embedded_hal::serial::{Write, Read};
use embedded_hal::blocking::delay::DelayMs;

#[cfg(feature = "structopt")]
extern crate structopt;

#[cfg(feature = "linux")]
extern crate linux_embedded_hal;

pub mod protocol;
use protocol::Command;

pub mod reset;
pub use reset::{PinReset, Reset, RtsReset};

pub mod flash;

pub mod ihex;
pub use ihex::{Checksum, HexError, Image};

pub mod ops;
pub use ops::{Mismatch, Progress, Task};

#[cfg(feature = "linux")]
pub mod linux;

#[cfg(test)]
mod mock;

/// Upper bound on bytes discarded by a single input flush
pub const FLUSH_LIMIT: usize = 4096;

pub trait SerialPort<E>: Write<u8, Error=E> + Read<u8, Error=E> {
    fn set_rts(&mut self, level: bool) -> Result<(), E>;

    /// Discard any pending input, returning the number of bytes dropped
    fn flush_input(&mut self) -> Result<usize, E> {
        let mut n = 0;

        while n < FLUSH_LIMIT {
            match self.read() {
                Ok(_) => n += 1,
                Err(nb::Error::WouldBlock) => break,
                Err(nb::Error::Other(e)) => return Err(e),
            }
        }

        Ok(n)
    }
}

#[derive(Copy, Clone, PartialEq, Debug)]
pub enum State {
    Init,
    Synced,
}

#[derive(Clone, PartialEq, Debug, thiserror::Error)]
pub enum Error<SerialError> {
    #[error("serial port error: {0:?}")]
    Serial(SerialError),

    /// Response was short, out of sync, or carried a failure status
    #[error("command {command:02x?} returned error, response was {response:02x?}")]
    BadResponse { command: Vec<u8>, response: Vec<u8> },

    #[error("no bootloader found after {attempts} sync attempts")]
    NoBootloader { attempts: usize },

    #[error("page of {len} bytes exceeds the {max} byte limit")]
    PageSize { len: usize, max: usize },

    #[error("address 0x{0:x} is outside the word addressable range")]
    AddressRange(u32),

    #[error("verify failed with {0} mismatched blocks")]
    VerifyFailed(usize),

    #[error("reset failed: {0}")]
    Reset(String),
}

impl<SerialError> From<SerialError> for Error<SerialError> {
    fn from(e: SerialError) -> Self {
        Self::Serial(e)
    }
}

#[derive(Clone, PartialEq, Debug)]
#[cfg_attr(feature = "structopt", derive(structopt::StructOpt))]
pub struct Options {
    /// Do not reset the device on connection
    #[cfg_attr(feature = "structopt", structopt(long))]
    pub no_reset: bool,

    /// Timeout to wait for each bootloader response
    #[cfg_attr(feature = "structopt", structopt(long, default_value="500"))]
    pub response_timeout_ms: u32,

    /// Period to poll for bootloader responses
    #[cfg_attr(feature = "structopt", structopt(long, default_value="1"))]
    pub poll_delay_ms: u32,

    /// Period to wait for bootloader init after reset before attempting sync
    #[cfg_attr(feature = "structopt", structopt(long, default_value="200"))]
    pub init_delay_ms: u32,

    /// Number of sign-on attempts before giving up
    #[cfg_attr(feature = "structopt", structopt(long, default_value="10"))]
    pub sync_attempts: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            no_reset: false,
            response_timeout_ms: 500,
            poll_delay_ms: 1,
            init_delay_ms: 200,
            sync_attempts: 10,
        }
    }
}

pub struct Programmer<P, D, R, E> {
    state: State,
    options: Options,
    port: P,
    delay: D,
    reset: R,
    _err: PhantomData<E>,
}

impl <P, D, R, E> Programmer<P, D, R, E>
where
    P: SerialPort<E>,
    D: DelayMs<u32>,
    R: Reset<P, E>,
    E: core::fmt::Debug,
{
    /// Create a new programmer instance
    pub fn new(port: P, delay: D, reset: R, options: Options) -> Self {
        Self{state: State::Init, options, port, delay, reset, _err: PhantomData}
    }

    /// Fetch the programmer state
    pub fn state(&self) -> State {
        self.state
    }

    /// Release the underlying port, delay and reset strategy
    pub fn release(self) -> (P, D, R) {
        (self.port, self.delay, self.reset)
    }

    /// Reset the target into the bootloader and establish sync
    pub fn init(&mut self) -> Result<(), Error<E>> {

        // First, reset device and let the bootloader start
        if !self.options.no_reset {
            debug!("Resetting device");

            self.reset.reset(&mut self.port, &mut self.delay)?;

            self.delay.delay_ms(self.options.init_delay_ms);
        }

        // Then, attempt to sign on
        let frame = protocol::encode(Command::SignOn, &[], &[]);

        for attempt in 1..=self.options.sync_attempts {
            debug!("Sync attempt {}", attempt);

            // Sign-on payloads differ between bootloaders and are ignored
            match self.transact(&frame, 0) {
                Ok(_) => {
                    info!("Synced with bootloader");
                    self.state = State::Synced;
                    return Ok(())
                },
                Err(Error::BadResponse{response, ..}) => {
                    info!("Bootloader response was: {:02x?}", response);
                },
                Err(e) => return Err(e),
            }
        }

        self.state = State::Init;

        Err(Error::NoBootloader{ attempts: self.options.sync_attempts })
    }

    /// Encode and issue a command, returning the response payload
    pub fn command(&mut self, command: Command, params: &[u8], payload: &[u8], response_len: usize)
    -> Result<Vec<u8>, Error<E>> {
        let frame = protocol::encode(command, params, payload);
        self.transact(&frame, response_len)
    }

    /// Write a frame and read back a response with `response_len` payload bytes.
    ///
    /// Malformed or short responses are returned as [`Error::BadResponse`]
    /// with the raw bytes received, and are not retried here.
    pub fn transact(&mut self, frame: &[u8], response_len: usize)
    -> Result<Vec<u8>, Error<E>> {

        // Write command
        for b in frame {
            block!(self.port.write(*b))?;
        }
        block!(self.port.flush())?;

        // Read response
        let raw = self.read_data(response_len + protocol::RESPONSE_OVERHEAD)?;

        match protocol::decode_response(&raw) {
            Some(payload) if payload.len() == response_len => Ok(payload.to_vec()),
            _ => Err(Error::BadResponse{ command: frame.to_vec(), response: raw }),
        }
    }

    /// Read up to `len` bytes, stopping early on response timeout
    fn read_data(&mut self, len: usize) -> Result<Vec<u8>, Error<E>> {
        let mut data = Vec::with_capacity(len);
        let mut t = 0;

        while data.len() < len {
            // Attempt to read from serial port
            match self.port.read() {
                Ok(v) => {
                    data.push(v);
                    continue;
                },
                Err(nb::Error::WouldBlock) => (),
                Err(nb::Error::Other(e)) => return Err(e.into()),
            };

            // Wait for delay period
            if t >= self.options.response_timeout_ms {
                debug!("Receive timeout ({} of {} bytes)", data.len(), len);
                break;
            }

            self.delay.delay_ms(self.options.poll_delay_ms);
            t += self.options.poll_delay_ms.max(1);
        }

        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockDelay, MockTarget};
    use crate::protocol::*;

    fn programmer(target: MockTarget) -> Programmer<MockTarget, MockDelay, RtsReset, ()> {
        Programmer::new(target, MockDelay::default(), RtsReset::default(), Options::default())
    }

    #[test]
    fn sync_resets_then_signs_on() {
        let mut p = programmer(MockTarget::new());

        p.init().unwrap();
        assert_eq!(p.state(), State::Synced);

        let (port, delay, _) = p.release();
        assert_eq!(port.rts, vec![false, true]);
        assert_eq!(port.commands, vec![(Command::SignOn, vec![], vec![])]);
        assert_eq!(delay.total_ms, 500 + 200);
    }

    #[test]
    fn sync_skips_reset_when_disabled() {
        let options = Options{ no_reset: true, ..Options::default() };
        let mut p = Programmer::new(MockTarget::new(), MockDelay::default(), RtsReset::default(), options);

        p.init().unwrap();

        let (port, delay, _) = p.release();
        assert!(port.rts.is_empty());
        assert_eq!(delay.total_ms, 0);
    }

    #[test]
    fn sync_fails_after_attempts_on_failed_status() {
        let mut target = MockTarget::new();
        target.status = STK_FAILED;

        let mut p = programmer(target);

        assert_eq!(p.init(), Err(Error::NoBootloader{ attempts: 10 }));
        assert_eq!(p.state(), State::Init);

        let (port, _, _) = p.release();
        assert_eq!(port.commands.len(), 10);
    }

    #[test]
    fn sync_recovers_after_silent_attempts() {
        let mut target = MockTarget::new();
        target.silent_for = 3;

        let mut p = programmer(target);
        p.init().unwrap();

        let (port, delay, _) = p.release();
        assert_eq!(port.commands.len(), 4);
        // Each silent attempt waits out the full response timeout
        assert_eq!(delay.total_ms, 500 + 200 + 3 * 500);
    }

    #[test]
    fn response_timeout_counts_poll_periods() {
        let mut target = MockTarget::new();
        target.silent_for = 1;

        let options = Options{ no_reset: true, poll_delay_ms: 5, response_timeout_ms: 100, ..Options::default() };
        let mut p = Programmer::new(target, MockDelay::default(), RtsReset::default(), options);
        p.init().unwrap();

        // Only the poll delay elapses while waiting, so the silent attempt costs exactly the timeout
        let (_, delay, _) = p.release();
        assert_eq!(delay.total_ms, 100);
    }

    #[test]
    fn stale_input_is_flushed_by_reset() {
        let mut target = MockTarget::new();
        target.tx.extend(&[0x00, 0xFF, 0x42]);

        let mut p = programmer(target);
        p.init().unwrap();

        let (port, _, _) = p.release();
        assert_eq!(port.commands.len(), 1);
        assert!(port.tx.is_empty());
    }

    #[test]
    fn transact_returns_payload() {
        let mut p = programmer(MockTarget::new());
        p.port.flash[..4].copy_from_slice(&[1, 2, 3, 4]);

        let data = p.command(Command::ReadPage, &page_params(4, MEMTYPE_FLASH), &[], 4).unwrap();
        assert_eq!(data, vec![1, 2, 3, 4]);
    }

    #[test]
    fn transact_reports_short_response() {
        let mut target = MockTarget::new();
        target.silent_for = 1;

        let mut p = programmer(target);
        let frame = encode(Command::SignOn, &[], &[]);

        match p.transact(&frame, 0) {
            Err(Error::BadResponse{ command, response }) => {
                assert_eq!(command, frame);
                assert!(response.is_empty());
            },
            r => panic!("unexpected result: {:?}", r),
        }
    }
}
