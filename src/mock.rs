//! Simulated optiboot target for tests.

use std::collections::VecDeque;
use std::sync::Mutex;

use embedded_hal::blocking::delay::DelayMs;
use embedded_hal::digital::v2::OutputPin;
use embedded_hal::serial::{Read, Write};

use crate::protocol::{self, Command, CRC_EOP, STK_FAILED, STK_INSYNC, STK_OK};
use crate::SerialPort;

pub const FLASH_SIZE: usize = 0x8000;

pub struct MockTarget {
    pub flash: Vec<u8>,
    pub addr: usize,
    /// Bytes received from the programmer, pending a complete frame
    pub rx: Vec<u8>,
    /// Bytes waiting to be read by the programmer
    pub tx: VecDeque<u8>,
    pub rts: Vec<bool>,
    /// Every decoded command, as (command, params, payload)
    pub commands: Vec<(Command, Vec<u8>, Vec<u8>)>,
    /// Status byte closing each response
    pub status: u8,
    /// Number of commands to ignore before responding
    pub silent_for: usize,
    /// Reject page writes
    pub fail_writes: bool,
}

impl MockTarget {
    pub fn new() -> Self {
        Self {
            flash: vec![0xFF; FLASH_SIZE],
            addr: 0,
            rx: vec![],
            tx: VecDeque::new(),
            rts: vec![],
            commands: vec![],
            status: STK_OK,
            silent_for: 0,
            fail_writes: false,
        }
    }

    fn respond(&mut self, payload: &[u8]) {
        self.tx.push_back(STK_INSYNC);
        self.tx.extend(payload);
        self.tx.push_back(self.status);
    }

    fn handle(&mut self, command: Command, params: &[u8], payload: &[u8]) {
        self.commands.push((command, params.to_vec(), payload.to_vec()));

        if self.silent_for > 0 {
            self.silent_for -= 1;
            return;
        }

        match command {
            Command::SignOn => self.respond(&[]),
            Command::LoadAddress => {
                self.addr = u16::from_le_bytes([params[0], params[1]]) as usize * 2;
                self.respond(&[]);
            },
            Command::ReadPage => {
                let size = u16::from_be_bytes([params[0], params[1]]) as usize;
                let data: Vec<u8> = (self.addr..self.addr + size)
                    .map(|a| self.flash.get(a).cloned().unwrap_or(0xFF))
                    .collect();
                self.addr += size;
                self.respond(&data);
            },
            Command::ProgPage => {
                if self.fail_writes {
                    self.tx.extend(&[STK_INSYNC, STK_FAILED]);
                    return;
                }
                self.flash[self.addr..self.addr + payload.len()].copy_from_slice(payload);
                self.addr += payload.len();
                self.respond(&[]);
            },
        }
    }
}

impl Write<u8> for MockTarget {
    type Error = ();

    fn write(&mut self, b: u8) -> nb::Result<(), ()> {
        self.rx.push(b);

        if b == CRC_EOP {
            let frame = self.rx.clone();
            if let Some((command, params, payload)) = protocol::decode_command(&frame) {
                self.rx.clear();
                self.handle(command, params, payload);
            }
        }

        Ok(())
    }

    fn flush(&mut self) -> nb::Result<(), ()> {
        Ok(())
    }
}

impl Read<u8> for MockTarget {
    type Error = ();

    fn read(&mut self) -> nb::Result<u8, ()> {
        self.tx.pop_front().ok_or(nb::Error::WouldBlock)
    }
}

impl SerialPort<()> for MockTarget {
    fn set_rts(&mut self, level: bool) -> Result<(), ()> {
        self.rts.push(level);
        Ok(())
    }
}

#[derive(Default)]
pub struct MockDelay {
    pub total_ms: u32,
}

impl DelayMs<u32> for MockDelay {
    fn delay_ms(&mut self, ms: u32) {
        self.total_ms += ms;
    }
}

#[derive(Default)]
pub struct MockPin {
    pub levels: Vec<bool>,
    pub broken: bool,
}

impl OutputPin for MockPin {
    type Error = ();

    fn set_low(&mut self) -> Result<(), ()> {
        if self.broken {
            return Err(());
        }
        self.levels.push(false);
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), ()> {
        if self.broken {
            return Err(());
        }
        self.levels.push(true);
        Ok(())
    }
}

static LOGGED: Mutex<Vec<String>> = Mutex::new(Vec::new());

/// Logger recording formatted messages so tests can assert on them
struct CaptureLogger;

impl log::Log for CaptureLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= log::Level::Info
    }

    fn log(&self, record: &log::Record) {
        if self.enabled(record.metadata()) {
            if let Ok(mut l) = LOGGED.lock() {
                l.push(record.args().to_string());
            }
        }
    }

    fn flush(&self) {}
}

static LOGGER: CaptureLogger = CaptureLogger;

/// Install the capturing logger, shared by every test in the process
pub fn capture_logs() {
    let _ = log::set_logger(&LOGGER);
    log::set_max_level(log::LevelFilter::Info);
}

/// Check whether a message has been logged at info level or above
pub fn logged(message: &str) -> bool {
    LOGGED.lock().map(|l| l.iter().any(|m| m == message)).unwrap_or(false)
}
