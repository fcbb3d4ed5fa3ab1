//! Host side of the bootloader protocol.

use core::fmt::Debug;
use core::marker::PhantomData;

use embedded_hal::blocking::delay::DelayMs;
use embedded_hal::serial::{Read, Write};

use crate::memory::AddressStatus;
use crate::protect::ProtectionMode;
use crate::protocol::{Request, BL_ACK, BL_NACK, MAX_WRITE_CHUNK, RX_LEN};
use crate::{Error, Options};

pub struct Programmer<P, D, E> {
    options: Options,
    port: P,
    delay: D,
    _err: PhantomData<E>,
}

impl<P, D, E> Programmer<P, D, E>
where
    P: Read<u8, Error = E> + Write<u8, Error = E>,
    D: DelayMs<u32>,
    E: Debug,
{
    /// Create a new programmer instance
    pub fn new(port: P, delay: D, options: Options) -> Self {
        Self {
            options,
            port,
            delay,
            _err: PhantomData,
        }
    }

    /// Fetch the bootloader version byte
    pub fn version(&mut self) -> Result<u8, Error<E>> {
        let mut v = [0u8; 1];
        self.command_exact(Request::GetVersion, &mut v)?;
        Ok(v[0])
    }

    /// Fetch the list of supported command codes
    pub fn help(&mut self) -> Result<Vec<u8>, Error<E>> {
        let mut buf = [0u8; u8::MAX as usize];
        let n = self.command(Request::GetHelp, &mut buf)?;
        Ok(buf[..n].to_vec())
    }

    /// Fetch the 12 bit chip ID
    pub fn chip_id(&mut self) -> Result<u16, Error<E>> {
        let mut b = [0u8; 2];
        self.command_exact(Request::GetChipId, &mut b)?;
        Ok(u16::from_le_bytes(b))
    }

    /// Fetch the read protection level
    pub fn rdp_level(&mut self) -> Result<u8, Error<E>> {
        let mut b = [0u8; 1];
        self.command_exact(Request::GetRdpStatus, &mut b)?;
        Ok(b[0])
    }

    /// Ask the bootloader to jump to `address`.
    ///
    /// On success the device has left the bootloader.
    pub fn go(&mut self, address: u32) -> Result<AddressStatus, Error<E>> {
        let mut b = [0u8; 1];
        self.command_exact(Request::GoToAddress { address }, &mut b)?;

        match b[0] {
            0x00 => Ok(AddressStatus::Valid),
            0x01 => Ok(AddressStatus::Invalid),
            other => Err(Error::InvalidResponse(other)),
        }
    }

    /// Erase `count` sectors from `sector` (`0xFF` for mass erase),
    /// returning the flash status byte
    pub fn erase(&mut self, sector: u8, count: u8) -> Result<u8, Error<E>> {
        let mut b = [0u8; 1];
        self.command_exact(Request::FlashErase { sector, count }, &mut b)?;
        Ok(b[0])
    }

    /// Write `data` at `address`, split into as many frames as needed.
    ///
    /// Stops at the first non-zero status and returns it. `progress` is
    /// called with the byte count of each completed chunk.
    pub fn write_memory<F>(
        &mut self,
        address: u32,
        data: &[u8],
        mut progress: F,
    ) -> Result<u8, Error<E>>
    where
        F: FnMut(usize),
    {
        for (i, chunk) in data.chunks(MAX_WRITE_CHUNK).enumerate() {
            let a = address.wrapping_add((i * MAX_WRITE_CHUNK) as u32);
            debug!("Writing {} bytes at {:#010x}", chunk.len(), a);

            let mut b = [0u8; 1];
            self.command_exact(
                Request::MemWrite {
                    address: a,
                    data: chunk,
                },
                &mut b,
            )?;

            if b[0] != 0 {
                warn!("Write at {:#010x} failed with status {:#04x}", a, b[0]);
                return Ok(b[0]);
            }
            progress(chunk.len());
        }

        Ok(0)
    }

    /// Protect the sectors set in `sectors`
    pub fn enable_protection(
        &mut self,
        sectors: u16,
        mode: ProtectionMode,
    ) -> Result<u8, Error<E>> {
        let mut b = [0u8; 1];
        self.command_exact(
            Request::EnableRwProtect {
                sectors,
                mode: mode as u8,
            },
            &mut b,
        )?;
        Ok(b[0])
    }

    /// Remove all sector protection
    pub fn disable_protection(&mut self) -> Result<u8, Error<E>> {
        let mut b = [0u8; 1];
        self.command_exact(Request::DisableRwProtect, &mut b)?;
        Ok(b[0])
    }

    /// Read the protection half-word: `nWRP` bits and `SPRMOD` in bit 15
    pub fn protection_status(&mut self) -> Result<u16, Error<E>> {
        let mut b = [0u8; 2];
        self.command_exact(Request::ReadSectorProtectionStatus, &mut b)?;
        Ok(u16::from_le_bytes(b))
    }

    /// Issue a command whose result must fill `data` exactly
    fn command_exact(&mut self, request: Request, data: &mut [u8]) -> Result<(), Error<E>> {
        let n = self.command(request, data)?;
        if n != data.len() {
            return Err(Error::UnexpectedLength {
                expected: data.len(),
                actual: n,
            });
        }
        Ok(())
    }

    /// Issue a command and read its result into `data`
    pub fn command(&mut self, request: Request, data: &mut [u8]) -> Result<usize, Error<E>> {
        let mut frame = [0u8; RX_LEN];
        let n = match request.encode(&mut frame) {
            Some(n) => n,
            None => {
                let len = match request {
                    Request::MemWrite { data, .. } => data.len(),
                    _ => 0,
                };
                return Err(Error::PayloadTooLong(len));
            }
        };

        debug!("Sending {:?}", request.command());
        trace!("Frame: {}", hex::encode(&frame[..n]));

        for b in &frame[..n] {
            block!(self.port.write(*b))?;
        }
        block!(self.port.flush())?;

        let len = self.await_ack()? as usize;
        if len > data.len() {
            // Consume the result so the next command starts in sync
            for _ in 0..len {
                self.read_byte()?;
            }
            return Err(Error::UnexpectedLength {
                expected: data.len(),
                actual: len,
            });
        }

        for b in data[..len].iter_mut() {
            *b = self.read_byte()?;
        }

        Ok(len)
    }

    /// Await `ACK` and return the follow length
    fn await_ack(&mut self) -> Result<u8, Error<E>> {
        match self.read_byte()? {
            BL_ACK => {
                debug!("Received bootloader ack");
                self.read_byte()
            }
            BL_NACK => {
                debug!("Received bootloader nack");
                Err(Error::Nack)
            }
            v => {
                debug!("Received unexpected value: 0x{:x}", v);
                Err(Error::InvalidResponse(v))
            }
        }
    }

    fn read_byte(&mut self) -> Result<u8, Error<E>> {
        let mut t = 0;

        loop {
            // Attempt to read from serial port
            match self.port.read() {
                Err(nb::Error::WouldBlock) => (),
                Err(nb::Error::Other(e)) => return Err(e.into()),
                Ok(v) => return Ok(v),
            };

            // Wait for delay period
            self.delay.delay_ms(self.options.poll_delay_ms);
            t += self.options.poll_delay_ms;

            if t > self.options.response_timeout_ms {
                error!("Receive timeout");
                return Err(Error::ResponseTimeout);
            }
        }
    }
}
