//! STM32 serial command bootloader.
//!
//! A framed command protocol engine resident at the start of flash, which
//! lets a host inspect, erase, program and protect the device over a UART
//! before handing off to the application image. The flash controller, CRC
//! unit, status LED and control transfer are collaborators behind traits,
//! so the engine runs unchanged against the [`sim`] target on a host.
//!
//! The host side of the protocol is provided by [`host::Programmer`].
//!
//! Without the `std` feature only the engine and its collaborator traits
//! are built, for linking into the on-target image.

#![cfg_attr(not(any(test, feature = "std")), no_std)]

#[macro_use]
extern crate log;

#[macro_use(block)]
extern crate nb;

#[cfg(feature = "structopt")]
extern crate structopt;

#[cfg(feature = "linux")]
extern crate linux_embedded_hal;

pub mod bootloader;
pub mod crc;
pub mod flash;
pub mod launch;
pub mod memory;
pub mod protect;
pub mod protocol;

#[cfg(feature = "std")]
pub mod host;

#[cfg(feature = "std")]
pub mod sim;

#[cfg(feature = "linux")]
pub mod linux;

pub use bootloader::{Bootloader, Cycle};

#[cfg(feature = "std")]
pub use host::Programmer;

use core::fmt::Debug;

use crate::memory::FLASH_SECTOR2_BASE;

#[derive(Debug, thiserror::Error, Clone, PartialEq)]
pub enum Error<SerialError: Debug> {
    #[error("serial transport error: {0:?}")]
    Serial(SerialError),
    #[error("request rejected (NACK)")]
    Nack,
    #[error("timeout awaiting bootloader response")]
    ResponseTimeout,
    #[error("unexpected response byte {0:#04x}")]
    InvalidResponse(u8),
    #[error("response carried {actual} bytes, expected {expected}")]
    UnexpectedLength { expected: usize, actual: usize },
    #[error("payload of {0} bytes does not fit a frame")]
    PayloadTooLong(usize),
}

impl<SerialError: Debug> From<SerialError> for Error<SerialError> {
    fn from(e: SerialError) -> Self {
        Self::Serial(e)
    }
}

#[derive(Clone, PartialEq, Debug)]
#[cfg_attr(feature = "structopt", derive(structopt::StructOpt))]
pub struct Options {
    /// Vector table of the resident user application
    #[cfg_attr(feature = "structopt", structopt(long, default_value="0x08008000", parse(try_from_str = parse_int::parse::<u32>)))]
    pub app_base: u32,

    /// Timeout to wait for bootloader responses
    #[cfg_attr(feature = "structopt", structopt(long, default_value="1000"))]
    pub response_timeout_ms: u32,

    /// Period to poll for bootloader responses
    #[cfg_attr(feature = "structopt", structopt(long, default_value="1"))]
    pub poll_delay_ms: u32,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            app_base: FLASH_SECTOR2_BASE,
            response_timeout_ms: 1000,
            poll_delay_ms: 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options() {
        let o = Options::default();
        assert_eq!(o.app_base, 0x0800_8000);
    }

    #[cfg(feature = "structopt")]
    #[test]
    fn test_app_base_prefixes() {
        use structopt::StructOpt;

        let o = Options::from_iter_safe(&["bl", "--app-base", "0x0801_0000"]).unwrap();
        assert_eq!(o.app_base, 0x0801_0000);

        let o = Options::from_iter_safe(&["bl", "--app-base", "0b1_0000_0000"]).unwrap();
        assert_eq!(o.app_base, 0x100);

        assert!(Options::from_iter_safe(&["bl", "--app-base", "0xZZ"]).is_err());
    }
}
