//! STK500 protocol subset as implemented by optiboot.
//!
//! Based on AVR061, see also `stk500.h` in the optiboot sources.

use core::convert::TryFrom;

/// Response marker: the bootloader is in sync with the command stream
pub const STK_INSYNC: u8 = 0x14;
/// Response status: command completed
pub const STK_OK: u8 = 0x10;
/// Response status: command failed
pub const STK_FAILED: u8 = 0x11;

/// End of packet marker (a CRC in name only)
pub const CRC_EOP: u8 = 0x20;

/// Memory type tag for flash
pub const MEMTYPE_FLASH: u8 = b'F';

/// Largest page the bootloader will return for a single read
pub const READ_PAGE_MAX: usize = 32;

/// Largest page the bootloader can buffer for a single write
pub const WRITE_PAGE_MAX: usize = 128;

/// Response overhead, one sync byte plus one status byte
pub const RESPONSE_OVERHEAD: usize = 2;

#[derive(Debug, PartialEq, Clone, Copy)]
pub enum Command {
    /// Sign-on probe, answered with an empty response by any STK500 bootloader
    SignOn = 0x30,

    /// Sets the current word address for the following page operation
    LoadAddress = 0x55,

    /// Writes a page of memory at the current address
    ProgPage = 0x64,

    /// Reads a page of memory from the current address
    ReadPage = 0x74,
}

impl Command {
    /// Number of fixed parameter bytes following the opcode
    pub fn param_len(&self) -> usize {
        match self {
            Command::SignOn => 0,
            Command::LoadAddress => 2,
            Command::ProgPage | Command::ReadPage => 3,
        }
    }
}

impl TryFrom<u8> for Command {
    type Error = u8;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0x30 => Ok(Command::SignOn),
            0x55 => Ok(Command::LoadAddress),
            0x64 => Ok(Command::ProgPage),
            0x74 => Ok(Command::ReadPage),
            _ => Err(v),
        }
    }
}

/// Build a command frame: opcode, parameters, payload and the end of packet marker
pub fn encode(command: Command, params: &[u8], payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(1 + params.len() + payload.len() + 1);
    frame.push(command as u8);
    frame.extend_from_slice(params);
    frame.extend_from_slice(payload);
    frame.push(CRC_EOP);
    frame
}

/// Extract the payload from a response frame.
///
/// Returns `None` unless the frame is at least two bytes long, opens with
/// [`STK_INSYNC`] and closes with [`STK_OK`].
pub fn decode_response(frame: &[u8]) -> Option<&[u8]> {
    if frame.len() < RESPONSE_OVERHEAD {
        return None;
    }

    match (frame.first(), frame.last()) {
        (Some(&STK_INSYNC), Some(&STK_OK)) => Some(&frame[1..frame.len() - 1]),
        _ => None,
    }
}

/// Split a complete command frame back into command, parameters and payload.
///
/// Frames carry no length prefix, so this only succeeds when `frame` is
/// exactly one command long (including the page data for [`Command::ProgPage`]).
pub fn decode_command(frame: &[u8]) -> Option<(Command, &[u8], &[u8])> {
    let (&opcode, rest) = frame.split_first()?;
    let command = Command::try_from(opcode).ok()?;

    let (&eop, body) = rest.split_last()?;
    if eop != CRC_EOP || body.len() < command.param_len() {
        return None;
    }

    let (params, payload) = body.split_at(command.param_len());
    let payload_len = match command {
        Command::ProgPage => u16::from_be_bytes([params[0], params[1]]) as usize,
        _ => 0,
    };

    if payload.len() != payload_len {
        return None;
    }

    Some((command, params, payload))
}

/// Parameters for a load address command, word address little endian
pub fn address_params(word_addr: u16) -> [u8; 2] {
    word_addr.to_le_bytes()
}

/// Parameters for a page command, size big endian followed by the memory type
pub fn page_params(size: u16, memtype: u8) -> [u8; 3] {
    let s = size.to_be_bytes();
    [s[0], s[1], memtype]
}
