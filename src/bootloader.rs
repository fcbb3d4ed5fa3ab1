//! Device side protocol engine.
//!
//! Each cycle blocks for one length-prefixed frame, verifies its checksum,
//! then dispatches on the command code. Every checksum-valid, well-formed
//! frame of a known command gets exactly one `ACK` plus result; a checksum
//! failure gets a lone `NACK` and has no side effects. Unknown codes are
//! logged and dropped without a response.

use core::convert::{Infallible, TryFrom};
use core::fmt::Debug;
use core::marker::PhantomData;

use embedded_hal::digital::v2::OutputPin;
use embedded_hal::serial::{Read, Write};

use crate::crc::{self, CrcUnit};
use crate::flash::{self, FlashDriver};
use crate::launch::{EntryDescriptor, System};
use crate::memory::{self, AddressStatus};
use crate::protect::{self, Protection, ProtectionMode};
use crate::protocol::{
    Command, Frame, Request, BL_ACK, BL_NACK, BL_VERSION, RX_LEN, SUPPORTED_COMMANDS,
};
use crate::{Error, Options};

/// Chip ID bits of DBGMCU_IDCODE
pub const CHIP_ID_MASK: u32 = 0x0FFF;

/// What one protocol cycle did
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Cycle {
    /// Frame accepted and answered with `ACK` and a result
    Acked(Command),
    /// Checksum or payload rejected, answered with `NACK`
    Nacked(Command),
    /// Known command without an implementation, not answered
    Unanswered(Command),
    /// Unknown or missing command code, not answered
    Ignored(Option<u8>),
}

pub struct Bootloader<P, F, C, L, S, E> {
    options: Options,
    port: P,
    flash: F,
    crc: C,
    led: L,
    system: S,
    _err: PhantomData<E>,
}

impl<P, F, C, L, S, E> Bootloader<P, F, C, L, S, E>
where
    P: Read<u8, Error = E> + Write<u8, Error = E>,
    F: FlashDriver,
    C: CrcUnit,
    L: OutputPin,
    S: System,
    E: Debug,
{
    /// Create a new bootloader instance
    pub fn new(port: P, flash: F, crc: C, led: L, system: S, options: Options) -> Self {
        Self {
            options,
            port,
            flash,
            crc,
            led,
            system,
            _err: PhantomData,
        }
    }

    pub fn port(&mut self) -> &mut P {
        &mut self.port
    }

    pub fn flash(&mut self) -> &mut F {
        &mut self.flash
    }

    pub fn led(&self) -> &L {
        &self.led
    }

    /// Run the command loop, or start the resident application
    pub fn boot(&mut self, stay_in_bootloader: bool) -> Result<Infallible, Error<E>> {
        if stay_in_bootloader {
            info!("Entering bootloader command loop");
            self.run()
        } else {
            self.jump_to_user_app()
        }
    }

    /// Serve commands until the transport fails
    pub fn run(&mut self) -> Result<Infallible, Error<E>> {
        loop {
            self.poll()?;
        }
    }

    /// Start the application whose vector table is at `app_base`
    pub fn jump_to_user_app(&mut self) -> ! {
        let base = self.options.app_base;
        debug!("Jumping to user application at {:#010x}", base);

        let entry = EntryDescriptor::from_vector_table(&mut self.flash, base);
        debug!(
            "MSP value: {:x?}, reset handler: {:#010x}",
            entry.stack_pointer, entry.entry_point
        );

        self.system.transfer(entry)
    }

    /// Receive and handle a single frame
    pub fn poll(&mut self) -> Result<Cycle, Error<E>> {
        let mut buf = [0u8; RX_LEN];
        let n = self.read_frame(&mut buf)?;
        let frame = Frame::new(&buf[..n]);

        #[cfg(feature = "std")]
        trace!("Frame: {}", hex::encode(&buf[..n]));
        #[cfg(not(feature = "std"))]
        trace!("Frame: {:02x?}", &buf[..n]);

        self.dispatch(&frame)
    }

    /// Read the length byte then exactly that many further bytes
    fn read_frame(&mut self, buf: &mut [u8; RX_LEN]) -> Result<usize, Error<E>> {
        buf[0] = block!(self.port.read())?;
        let len = buf[0] as usize;

        for b in buf[1..=len].iter_mut() {
            *b = block!(self.port.read())?;
        }

        Ok(len + 1)
    }

    fn dispatch(&mut self, frame: &Frame) -> Result<Cycle, Error<E>> {
        let code = match frame.code() {
            Some(c) => c,
            None => {
                warn!("Empty frame received from host");
                return Ok(Cycle::Ignored(None));
            }
        };

        let command = match Command::try_from(code) {
            Ok(c) => c,
            Err(c) => {
                warn!("Invalid command code received from host: {:#04x}", c);
                return Ok(Cycle::Ignored(Some(c)));
            }
        };

        debug!("Handling {:?}", command);

        if let Command::MemRead | Command::OtpRead = command {
            debug!("{:?} is not implemented, no response", command);
            return Ok(Cycle::Unanswered(command));
        }

        if !frame.is_well_formed() {
            warn!("Frame too short ({} bytes)", frame.total_length());
            self.send_nack()?;
            return Ok(Cycle::Nacked(command));
        }

        if !crc::verify(&mut self.crc, frame.covered(), frame.checksum()) {
            warn!("Checksum fail");
            self.send_nack()?;
            return Ok(Cycle::Nacked(command));
        }

        debug!("Checksum success");

        let request = match Request::parse(command, frame.payload()) {
            Some(r) => r,
            None => {
                warn!("Payload too short for {:?}", command);
                self.send_nack()?;
                return Ok(Cycle::Nacked(command));
            }
        };

        self.handle(request)?;
        self.flush()?;

        Ok(Cycle::Acked(command))
    }

    fn handle(&mut self, request: Request) -> Result<(), Error<E>> {
        match request {
            Request::GetVersion => {
                debug!("BL_VER: {:#04x}", BL_VERSION);
                self.respond(&[BL_VERSION])
            }
            Request::GetHelp => self.respond(&SUPPORTED_COMMANDS),
            Request::GetChipId => {
                let cid = (self.system.idcode() & CHIP_ID_MASK) as u16;
                debug!("MCU ID: {:#05x}", cid);
                self.respond(&cid.to_le_bytes())
            }
            Request::GetRdpStatus => {
                let rdp = self.flash.rdp_level();
                debug!("RDP level: {:#04x}", rdp);
                self.respond(&[rdp])
            }
            Request::GoToAddress { address } => self.handle_go(address),
            Request::FlashErase { sector, count } => {
                debug!("Initial sector: {} sector count: {}", sector, count);

                self.send_ack(1)?;

                let _ = self.led.set_high();
                let status = flash::erase(&mut self.flash, sector, count);
                let _ = self.led.set_low();

                if !status.is_ok() {
                    error!("Flash erase failed: {:?}", status);
                }
                self.write_bytes(&[status.code()])
            }
            Request::MemWrite { address, data } => {
                debug!("Memory write of {} bytes at {:#010x}", data.len(), address);

                self.send_ack(1)?;

                if memory::classify(address) == AddressStatus::Invalid {
                    warn!("Invalid memory write address {:#010x}", address);
                    return self.write_bytes(&[AddressStatus::Invalid.code()]);
                }

                let _ = self.led.set_high();
                let status = flash::write(&mut self.flash, data, address);
                let _ = self.led.set_low();

                if !status.is_ok() {
                    error!("Memory write failed: {:?}", status);
                }
                self.write_bytes(&[status.code()])
            }
            Request::EnableRwProtect { sectors, mode } => {
                self.send_ack(1)?;

                let status = match ProtectionMode::from_code(mode) {
                    Some(mode) => {
                        protect::configure(&mut self.flash, Protection::Enable { sectors, mode })
                    }
                    None => {
                        warn!("Unknown protection mode {}, nothing changed", mode);
                        0
                    }
                };

                debug!("Protection status: {:#04x}", status);
                self.write_bytes(&[status])
            }
            Request::DisableRwProtect => {
                self.send_ack(1)?;
                let status = protect::configure(&mut self.flash, Protection::Disable);
                self.write_bytes(&[status])
            }
            Request::ReadSectorProtectionStatus => {
                let status = protect::read_status(&mut self.flash);
                debug!("nWRP status: {:#06x}", status);
                self.respond(&status.to_le_bytes())
            }
            // Answered in dispatch
            Request::MemRead | Request::OtpRead => Ok(()),
        }
    }

    fn handle_go(&mut self, address: u32) -> Result<(), Error<E>> {
        debug!("GO address: {:#010x}", address);

        self.send_ack(1)?;

        match memory::classify(address) {
            AddressStatus::Valid => {
                self.write_bytes(&[AddressStatus::Valid.code()])?;
                self.flush()?;

                info!("Jumping to go address {:#010x}", address);
                self.system.transfer(EntryDescriptor::thumb(address))
            }
            AddressStatus::Invalid => {
                warn!("GO address invalid: {:#010x}", address);
                self.write_bytes(&[AddressStatus::Invalid.code()])
            }
        }
    }

    /// `ACK` followed by the whole of `result`
    fn respond(&mut self, result: &[u8]) -> Result<(), Error<E>> {
        self.send_ack(result.len() as u8)?;
        self.write_bytes(result)
    }

    fn send_ack(&mut self, follow_len: u8) -> Result<(), Error<E>> {
        self.write_bytes(&[BL_ACK, follow_len])
    }

    fn send_nack(&mut self) -> Result<(), Error<E>> {
        self.write_bytes(&[BL_NACK])?;
        self.flush()
    }

    fn write_bytes(&mut self, data: &[u8]) -> Result<(), Error<E>> {
        for b in data {
            block!(self.port.write(*b))?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), Error<E>> {
        block!(self.port.flush())?;
        Ok(())
    }
}
