//! Paged flash access.
//!
//! Every page operation acts at the bootloader's current address, so the
//! address is loaded explicitly before each transfer sequence.

use embedded_hal::blocking::delay::DelayMs;

use crate::protocol::{self, Command, MEMTYPE_FLASH, READ_PAGE_MAX, WRITE_PAGE_MAX};
use crate::{Error, Programmer, Reset, SerialPort};

/// Highest byte address reachable with a 16-bit word address
pub const MAX_BYTE_ADDR: u32 = 0x1_FFFF;

impl <P, D, R, E> Programmer<P, D, R, E>
where
    P: SerialPort<E>,
    D: DelayMs<u32>,
    R: Reset<P, E>,
    E: core::fmt::Debug,
{
    /// Load the current address, converting a byte address to the word
    /// address used on the wire
    pub fn set_address(&mut self, byte_addr: u32) -> Result<(), Error<E>> {
        if byte_addr > MAX_BYTE_ADDR {
            return Err(Error::AddressRange(byte_addr));
        }
        if byte_addr % 2 != 0 {
            warn!("Address 0x{:04x} is not word aligned, using 0x{:04x}", byte_addr, byte_addr & !1);
        }

        let word_addr = (byte_addr / 2) as u16;
        self.command(Command::LoadAddress, &protocol::address_params(word_addr), &[], 0)?;

        Ok(())
    }

    /// Read a single page of `size` bytes from the current address
    pub fn read_page(&mut self, size: usize, memtype: u8) -> Result<Vec<u8>, Error<E>> {
        if size > READ_PAGE_MAX {
            return Err(Error::PageSize{ len: size, max: READ_PAGE_MAX });
        }

        let params = protocol::page_params(size as u16, memtype);
        self.command(Command::ReadPage, &params, &[], size)
    }

    /// Read `size` bytes of flash starting at `addr`
    pub fn read_flash(&mut self, addr: u32, size: usize) -> Result<Vec<u8>, Error<E>> {
        self.set_address(addr)?;

        // Following pages rely on the bootloader advancing the address
        let mut data = Vec::with_capacity(size);
        while data.len() < size {
            let n = (size - data.len()).min(READ_PAGE_MAX);
            let page = self.read_page(n, MEMTYPE_FLASH)?;
            data.extend_from_slice(&page);
        }

        Ok(data)
    }

    /// Write a single page of at most [`WRITE_PAGE_MAX`] bytes at `addr`
    pub fn write_page(&mut self, addr: u32, block: &[u8], memtype: u8) -> Result<(), Error<E>> {
        if block.len() > WRITE_PAGE_MAX {
            return Err(Error::PageSize{ len: block.len(), max: WRITE_PAGE_MAX });
        }

        debug!("Programming 0x{:04x} ({} bytes)", addr, block.len());

        self.set_address(addr)?;

        let params = protocol::page_params(block.len() as u16, memtype);
        self.command(Command::ProgPage, &params, block, 0)?;

        Ok(())
    }

    /// Write `data` to flash starting at `addr`, one page at a time
    pub fn write_flash(&mut self, addr: u32, data: &[u8]) -> Result<(), Error<E>> {
        for (i, chunk) in data.chunks(WRITE_PAGE_MAX).enumerate() {
            self.write_page(addr + (i * WRITE_PAGE_MAX) as u32, chunk, MEMTYPE_FLASH)?;
        }

        Ok(())
    }
}
