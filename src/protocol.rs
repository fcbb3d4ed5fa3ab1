//! Wire format shared by the bootloader and the host programmer.
//!
//! Request: `[len][cmd][payload..][crc:u32 le]`, where `len` counts every
//! byte after itself. Response: `[ACK][follow_len][result..]` or `[NACK]`.

use core::convert::TryFrom;

use crate::crc;

/// Positive acknowledgement, followed by a length byte and the result
pub const BL_ACK: u8 = 0xA5;

/// Negative acknowledgement, sent alone on checksum failure
pub const BL_NACK: u8 = 0x7F;

/// Bootloader version reported by `GetVersion` (1.0)
pub const BL_VERSION: u8 = 0x10;

/// Result byte for an acceptable target address
pub const ADDR_VALID: u8 = 0x00;

/// Result byte for an address outside every legal region
pub const ADDR_INVALID: u8 = 0x01;

/// Receive buffer capacity, large enough for any `u8` length prefix
pub const RX_LEN: usize = 256;

/// Checksum trailer size
pub const CRC_LEN: usize = 4;

/// Shortest legal value of the length byte: command code plus checksum
pub const MIN_FRAME_LEN: usize = 1 + CRC_LEN;

/// Largest payload one request frame can carry
pub const MAX_PAYLOAD: usize = u8::MAX as usize - MIN_FRAME_LEN;

/// Largest data block a single `MemWrite` frame can carry
/// (payload minus the address and length fields)
pub const MAX_WRITE_CHUNK: usize = MAX_PAYLOAD - 5;

/// Command codes reported by `GetHelp`, in table order
pub const SUPPORTED_COMMANDS: [u8; 8] = [
    Command::GetVersion as u8,
    Command::GetHelp as u8,
    Command::GetChipId as u8,
    Command::GetRdpStatus as u8,
    Command::GoToAddress as u8,
    Command::FlashErase as u8,
    Command::MemWrite as u8,
    Command::ReadSectorProtectionStatus as u8,
];

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Command {
    /// Reads the bootloader version
    GetVersion = 0x51,

    /// Lists the command codes the bootloader supports
    GetHelp = 0x52,

    /// Reads the MCU chip identification number
    GetChipId = 0x53,

    /// Reads the flash read protection level
    GetRdpStatus = 0x54,

    /// Jumps to a host-specified address
    GoToAddress = 0x55,

    /// Mass erase, or erase of a range of sectors
    FlashErase = 0x56,

    /// Writes a block of data to memory
    MemWrite = 0x57,

    /// Enables write or read/write protection on a set of sectors
    EnableRwProtect = 0x58,

    /// Reads memory. Accepted but not answered.
    MemRead = 0x59,

    /// Reads the protection state of every sector
    ReadSectorProtectionStatus = 0x5A,

    /// Reads the OTP area. Accepted but not answered.
    OtpRead = 0x5B,

    /// Removes read/write protection from every sector
    DisableRwProtect = 0x5C,
}

impl TryFrom<u8> for Command {
    type Error = u8;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        let c = match code {
            0x51 => Command::GetVersion,
            0x52 => Command::GetHelp,
            0x53 => Command::GetChipId,
            0x54 => Command::GetRdpStatus,
            0x55 => Command::GoToAddress,
            0x56 => Command::FlashErase,
            0x57 => Command::MemWrite,
            0x58 => Command::EnableRwProtect,
            0x59 => Command::MemRead,
            0x5A => Command::ReadSectorProtectionStatus,
            0x5B => Command::OtpRead,
            0x5C => Command::DisableRwProtect,
            other => return Err(other),
        };
        Ok(c)
    }
}

/// A received request, borrowed from the receive buffer.
///
/// `raw` holds the length byte followed by `len` further bytes.
#[derive(Debug, Clone, Copy)]
pub struct Frame<'a> {
    raw: &'a [u8],
}

impl<'a> Frame<'a> {
    /// Wrap a received frame, `raw[0]` being the length byte
    pub fn new(raw: &'a [u8]) -> Self {
        Self { raw }
    }

    /// The length byte: number of bytes following it
    pub fn total_length(&self) -> usize {
        self.raw[0] as usize
    }

    /// Command code, absent on a zero-length frame
    pub fn code(&self) -> Option<u8> {
        self.raw.get(1).copied()
    }

    /// Whether the frame is long enough to carry a command and checksum
    pub fn is_well_formed(&self) -> bool {
        self.total_length() >= MIN_FRAME_LEN && self.raw.len() == self.total_length() + 1
    }

    /// Bytes covered by the checksum: length byte through the last payload byte
    pub fn covered(&self) -> &'a [u8] {
        &self.raw[..self.raw.len() - CRC_LEN]
    }

    /// Checksum sent by the host, little-endian
    pub fn checksum(&self) -> u32 {
        let n = self.raw.len();
        let mut b = [0u8; CRC_LEN];
        b.copy_from_slice(&self.raw[n - CRC_LEN..]);
        u32::from_le_bytes(b)
    }

    /// Command-specific bytes between the command code and the checksum
    pub fn payload(&self) -> &'a [u8] {
        &self.raw[2..self.raw.len() - CRC_LEN]
    }
}

/// A decoded request
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Request<'a> {
    GetVersion,
    GetHelp,
    GetChipId,
    GetRdpStatus,
    GoToAddress { address: u32 },
    FlashErase { sector: u8, count: u8 },
    MemWrite { address: u32, data: &'a [u8] },
    EnableRwProtect { sectors: u16, mode: u8 },
    MemRead,
    ReadSectorProtectionStatus,
    OtpRead,
    DisableRwProtect,
}

impl<'a> Request<'a> {
    /// Decode the payload of a `command` frame.
    ///
    /// Returns `None` when the payload is too short for the command.
    pub fn parse(command: Command, payload: &'a [u8]) -> Option<Self> {
        let r = match command {
            Command::GetVersion => Request::GetVersion,
            Command::GetHelp => Request::GetHelp,
            Command::GetChipId => Request::GetChipId,
            Command::GetRdpStatus => Request::GetRdpStatus,
            Command::GoToAddress => Request::GoToAddress {
                address: le_u32(payload, 0)?,
            },
            Command::FlashErase => Request::FlashErase {
                sector: *payload.get(0)?,
                count: *payload.get(1)?,
            },
            Command::MemWrite => {
                let address = le_u32(payload, 0)?;
                let len = *payload.get(4)? as usize;
                Request::MemWrite {
                    address,
                    data: payload.get(5..5 + len)?,
                }
            }
            Command::EnableRwProtect => Request::EnableRwProtect {
                sectors: le_u16(payload, 0)?,
                mode: *payload.get(2)?,
            },
            Command::MemRead => Request::MemRead,
            Command::ReadSectorProtectionStatus => Request::ReadSectorProtectionStatus,
            Command::OtpRead => Request::OtpRead,
            Command::DisableRwProtect => Request::DisableRwProtect,
        };
        Some(r)
    }

    pub fn command(&self) -> Command {
        match self {
            Request::GetVersion => Command::GetVersion,
            Request::GetHelp => Command::GetHelp,
            Request::GetChipId => Command::GetChipId,
            Request::GetRdpStatus => Command::GetRdpStatus,
            Request::GoToAddress { .. } => Command::GoToAddress,
            Request::FlashErase { .. } => Command::FlashErase,
            Request::MemWrite { .. } => Command::MemWrite,
            Request::EnableRwProtect { .. } => Command::EnableRwProtect,
            Request::MemRead => Command::MemRead,
            Request::ReadSectorProtectionStatus => Command::ReadSectorProtectionStatus,
            Request::OtpRead => Command::OtpRead,
            Request::DisableRwProtect => Command::DisableRwProtect,
        }
    }

    /// Encode as a complete frame into `buf`, returning its length
    pub fn encode(&self, buf: &mut [u8]) -> Option<usize> {
        let mut payload = [0u8; MAX_PAYLOAD];

        let n = match self {
            Request::GoToAddress { address } => {
                payload[..4].copy_from_slice(&address.to_le_bytes());
                4
            }
            Request::FlashErase { sector, count } => {
                payload[0] = *sector;
                payload[1] = *count;
                2
            }
            Request::MemWrite { address, data } => {
                if data.len() > MAX_WRITE_CHUNK {
                    return None;
                }
                payload[..4].copy_from_slice(&address.to_le_bytes());
                payload[4] = data.len() as u8;
                payload[5..5 + data.len()].copy_from_slice(data);
                5 + data.len()
            }
            Request::EnableRwProtect { sectors, mode } => {
                payload[..2].copy_from_slice(&sectors.to_le_bytes());
                payload[2] = *mode;
                3
            }
            _ => 0,
        };

        encode_request(self.command(), &payload[..n], buf)
    }
}

/// Little-endian `u32` at `offset` in `data`, if present
pub fn le_u32(data: &[u8], offset: usize) -> Option<u32> {
    let b = data.get(offset..offset + 4)?;
    Some(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

/// Little-endian `u16` at `offset` in `data`, if present
pub fn le_u16(data: &[u8], offset: usize) -> Option<u16> {
    let b = data.get(offset..offset + 2)?;
    Some(u16::from_le_bytes([b[0], b[1]]))
}

/// Encode a request frame into `buf`, returning the number of bytes used.
///
/// Returns `None` if the payload does not fit a single frame.
pub fn encode_request(command: Command, payload: &[u8], buf: &mut [u8]) -> Option<usize> {
    if payload.len() > MAX_PAYLOAD {
        return None;
    }

    let len = MIN_FRAME_LEN + payload.len();
    let total = len + 1;
    let buf = buf.get_mut(..total)?;

    buf[0] = len as u8;
    buf[1] = command as u8;
    buf[2..2 + payload.len()].copy_from_slice(payload);

    let crc = crc::checksum(&buf[..total - CRC_LEN]);
    buf[total - CRC_LEN..].copy_from_slice(&crc.to_le_bytes());

    Some(total)
}
