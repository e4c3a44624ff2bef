//! High level programmer operations.

use embedded_hal::blocking::delay::DelayMs;

use crate::ihex::Image;
use crate::protocol::WRITE_PAGE_MAX;
use crate::{Error, Programmer, Reset, SerialPort};

/// Block size used when comparing and displaying flash contents
pub const VERIFY_BLOCK: usize = 16;

/// Flash size dumped by default when reading
pub const DEFAULT_READ_SIZE: usize = 32 * 1024;

/// Operation to perform once synchronised with the bootloader
#[derive(Clone, PartialEq, Debug)]
pub enum Task {
    /// Check communication with the bootloader only
    Test,
    /// Dump flash contents
    Read { size: usize },
    /// Compare flash contents against an image
    Verify(Image),
    /// Write an image to flash then verify it
    Program(Image),
}

/// Progress through a task, in bytes processed by the current stage
#[derive(Copy, Clone, PartialEq, Debug)]
pub enum Progress {
    Read(usize),
    Program(usize),
    Verify(usize),
}

/// Block of flash that differs from the expected image
#[derive(Clone, PartialEq, Debug)]
pub struct Mismatch {
    pub addr: u32,
    pub want: Vec<u8>,
    pub got: Vec<u8>,
}

/// Format bytes as space separated hex
pub fn hex_str(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

impl <P, D, R, E> Programmer<P, D, R, E>
where
    P: SerialPort<E>,
    D: DelayMs<u32>,
    R: Reset<P, E>,
    E: core::fmt::Debug,
{
    /// Synchronise with the bootloader then execute the provided task,
    /// returning any data read from the device
    pub fn run(&mut self, task: &Task) -> Result<Vec<u8>, Error<E>> {
        self.run_with(task, |_| ())
    }

    /// Execute a task, see [`Programmer::run`], reporting progress
    pub fn run_with<F: FnMut(Progress)>(&mut self, task: &Task, progress: F) -> Result<Vec<u8>, Error<E>> {

        // Initialise bootloading
        self.init()?;

        self.execute_with(task, progress)
    }

    /// Execute a task on an already synchronised bootloader, reporting progress
    pub fn execute_with<F: FnMut(Progress)>(&mut self, task: &Task, mut progress: F) -> Result<Vec<u8>, Error<E>> {
        match task {
            Task::Test => {
                info!("Bootloader communications OK");
                Ok(vec![])
            },
            Task::Read{ size } => self.read_all_with(*size, |n| progress(Progress::Read(n))),
            Task::Verify(image) => {
                self.verify_with(image, |n| progress(Progress::Verify(n)))?;
                Ok(vec![])
            },
            Task::Program(image) => {
                self.program_with(image, |n| progress(Progress::Program(n)))?;
                self.verify_with(image, |n| progress(Progress::Verify(n)))?;
                Ok(vec![])
            },
        }
    }

    /// Read `size` bytes of flash from address zero, logging each block
    pub fn read_all(&mut self, size: usize) -> Result<Vec<u8>, Error<E>> {
        self.read_all_with(size, |_| ())
    }

    /// Read flash with progress reporting, see [`Programmer::read_all`]
    pub fn read_all_with<F: FnMut(usize)>(&mut self, size: usize, mut progress: F) -> Result<Vec<u8>, Error<E>> {
        let mut data = Vec::with_capacity(size);

        for addr in (0..size).step_by(VERIFY_BLOCK) {
            let n = (size - addr).min(VERIFY_BLOCK);
            let block = self.read_flash(addr as u32, n)?;

            info!("{:04X}: {}", addr, hex_str(&block));
            data.extend_from_slice(&block);
            progress(data.len());
        }

        Ok(data)
    }

    /// Write an image to flash
    pub fn program(&mut self, image: &Image) -> Result<(), Error<E>> {
        self.program_with(image, |_| ())
    }

    /// Write an image to flash, reporting the number of bytes written after each page
    pub fn program_with<F: FnMut(usize)>(&mut self, image: &Image, mut progress: F) -> Result<(), Error<E>> {
        info!("Programming {} bytes at 0x{:04x}", image.len(), image.base);

        for (i, chunk) in image.data.chunks(WRITE_PAGE_MAX).enumerate() {
            let offset = i * WRITE_PAGE_MAX;
            let addr = image.base + offset as u32;

            info!("Programming 0x{:04x}", addr);
            self.write_flash(addr, chunk)?;
            progress(offset + chunk.len());
        }

        Ok(())
    }

    /// Compare flash contents against an image, returning every mismatched block
    pub fn compare(&mut self, image: &Image) -> Result<Vec<Mismatch>, Error<E>> {
        self.compare_with(image, |_| ())
    }

    /// Compare flash contents against an image, reporting the number of bytes checked after each block
    pub fn compare_with<F: FnMut(usize)>(&mut self, image: &Image, mut progress: F) -> Result<Vec<Mismatch>, Error<E>> {
        let mut mismatches = vec![];

        for (i, want) in image.data.chunks(VERIFY_BLOCK).enumerate() {
            let offset = i * VERIFY_BLOCK;
            let addr = image.base + offset as u32;

            let got = self.read_flash(addr, want.len())?;
            if got != want {
                mismatches.push(Mismatch{ addr, want: want.to_vec(), got });
            }

            progress(offset + want.len());
        }

        Ok(mismatches)
    }

    /// Verify flash contents against an image, failing if any block differs
    pub fn verify(&mut self, image: &Image) -> Result<(), Error<E>> {
        self.verify_with(image, |_| ())
    }

    /// Verify with progress reporting, see [`Programmer::compare_with`]
    pub fn verify_with<F: FnMut(usize)>(&mut self, image: &Image, progress: F) -> Result<(), Error<E>> {
        let mismatches = self.compare_with(image, progress)?;

        for m in &mismatches {
            info!("Mismatch at addr 0x{:04x}", m.addr);
            info!("Want {}", hex_str(&m.want));
            info!("Got  {}", hex_str(&m.got));
        }

        if !mismatches.is_empty() {
            return Err(Error::VerifyFailed(mismatches.len()));
        }

        info!("Verify OK");

        Ok(())
    }
}
