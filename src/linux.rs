use std::io::ErrorKind as IoErrorKind;
use std::path::Path;
use std::time::Duration;

use embedded_hal::blocking::delay::DelayMs;
use serial_core::{
    BaudRate, CharSize, Error as SerialError, ErrorKind as SerialErrorKind, FlowControl, Parity,
    SerialDevice as _, SerialPortSettings as _, StopBits,
};
use linux_embedded_hal::sysfs_gpio::{self, Direction};
use linux_embedded_hal::{Delay, Serial, SysfsPin};

use crate::reset::{GPIO_HOLD_MS, PinReset, Reset, RtsReset};
use crate::{Error, Options, Programmer, SerialPort};

/// Default GPIO wired to the target reset line
pub const DEFAULT_RESET_PIN: u64 = 4;

/// Device level read timeout. Reads return immediately so that only the
/// poll delay counts towards the response timeout
const PORT_TIMEOUT: Duration = Duration::from_millis(0);

fn io_kind(e: SerialError) -> IoErrorKind {
    match e.kind() {
        SerialErrorKind::Io(k) => k,
        SerialErrorKind::InvalidInput => IoErrorKind::InvalidInput,
        SerialErrorKind::NoDevice => IoErrorKind::NotFound,
    }
}

impl SerialPort<IoErrorKind> for Serial {
    fn set_rts(&mut self, level: bool) -> Result<(), IoErrorKind> {
        self.0.set_rts(level).map_err(io_kind)
    }
}

/// Reset via a sysfs GPIO, exported for the duration of the reset
#[derive(Clone, PartialEq, Debug)]
pub struct SysfsReset {
    pub pin: u64,
    pub hold_ms: u32,
}

impl SysfsReset {
    pub fn new(pin: u64) -> Self {
        Self { pin, hold_ms: GPIO_HOLD_MS }
    }
}

fn gpio_err(e: sysfs_gpio::Error) -> Error<IoErrorKind> {
    Error::Reset(e.to_string())
}

impl Reset<Serial, IoErrorKind> for SysfsReset {
    fn reset<D: DelayMs<u32>>(&mut self, port: &mut Serial, delay: &mut D) -> Result<(), Error<IoErrorKind>> {
        info!("Resetting via GPIO{}...", self.pin);

        let gpio = sysfs_gpio::Pin::new(self.pin);
        gpio.export().map_err(gpio_err)?;

        if let Err(e) = gpio.set_direction(Direction::Out) {
            let _ = gpio.unexport();
            return Err(gpio_err(e));
        }

        let toggle = PinReset::new(SysfsPin(gpio), self.hold_ms);
        toggle.reset_and_release(port, delay, |pin| pin.0.unexport().map_err(gpio_err))
    }
}

/// Reset strategies available on linux hosts
#[derive(Clone, PartialEq, Debug)]
pub enum LinuxReset {
    /// Toggle RTS, for USB attached boards
    Rts(RtsReset),
    /// Toggle a GPIO, for targets wired directly to the host
    Gpio(SysfsReset),
}

impl Reset<Serial, IoErrorKind> for LinuxReset {
    fn reset<D: DelayMs<u32>>(&mut self, port: &mut Serial, delay: &mut D) -> Result<(), Error<IoErrorKind>> {
        match self {
            LinuxReset::Rts(r) => Reset::<Serial, IoErrorKind>::reset(r, port, delay),
            LinuxReset::Gpio(r) => r.reset(port, delay),
        }
    }
}

impl Programmer<Serial, Delay, LinuxReset, IoErrorKind> {
    /// Create a new linux serial port programmer instance
    pub fn linux<P: AsRef<Path>>(
        port: P,
        baud: usize,
        reset: LinuxReset,
        options: Options,
    ) -> Result<Self, SerialError> {
        // Open port
        let mut port = Serial::open(port.as_ref())?;

        // Apply settings
        let mut settings = port.0.read_settings()?;

        settings.set_char_size(CharSize::Bits8);
        settings.set_stop_bits(StopBits::Stop1);
        settings.set_baud_rate(BaudRate::from_speed(baud))?;
        settings.set_flow_control(FlowControl::FlowNone);
        settings.set_parity(Parity::ParityNone);

        port.0.write_settings(&settings)?;
        port.0.set_timeout(PORT_TIMEOUT)?;

        // Return instance
        Ok(Self::new(port, Delay {}, reset, options))
    }
}
