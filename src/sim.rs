//! Simulated STM32F429 target.
//!
//! An in-memory flash array, SRAM and option byte register standing in for
//! the hardware collaborators, so the protocol engine can be driven from
//! tests or served over a serial port on a development machine.

use std::collections::VecDeque;
use std::convert::Infallible;
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender};
use std::time::Duration;

use embedded_hal::digital::v2::OutputPin;
use embedded_hal::serial;

use crate::flash::{EraseKind, FlashDriver, FlashStatus};
use crate::launch::{EntryDescriptor, System};
use crate::memory::{
    sector_base, sector_of, BKPSRAM_BASE, BKPSRAM_END, FLASH_BASE, FLASH_END, SECTOR_COUNT,
    SECTOR_SIZES, SRAM1_BASE, SRAM3_END,
};
use crate::protect::{ProtectionRegister, OPTLOCK, OPTSTRT};

/// Factory default option control register: RDP level 0, no protection
pub const OPTCR_DEFAULT: u32 = 0x0FFF_AAED;

/// STM32F42x/43x device ID, revision 3
pub const IDCODE_F429: u32 = 0x2001_6419;

/// Controller polls reported busy after an erase or option byte commit
const BUSY_POLLS: usize = 4;

/// In-memory flash controller, flash array and SRAM
pub struct SimFlash {
    flash: Vec<u8>,
    sram: Vec<u8>,
    bkpsram: Vec<u8>,

    unlocked: bool,
    ob_unlocked: bool,
    optcr: u32,
    committed: u32,
    busy: usize,

    mutations: usize,
}

impl SimFlash {
    /// A blank device: flash erased, SRAM zeroed, no protection
    pub fn new() -> Self {
        Self {
            flash: vec![0xFF; (FLASH_END - FLASH_BASE) as usize + 1],
            sram: vec![0; (SRAM3_END - SRAM1_BASE) as usize + 1],
            bkpsram: vec![0; (BKPSRAM_END - BKPSRAM_BASE) as usize + 1],
            unlocked: false,
            ob_unlocked: false,
            optcr: OPTCR_DEFAULT,
            committed: OPTCR_DEFAULT,
            busy: 0,
            mutations: 0,
        }
    }

    /// Simulate a system reset: controller locked, option bytes reloaded
    /// from their committed copy, volatile SRAM cleared
    pub fn reset(&mut self) {
        self.unlocked = false;
        self.ob_unlocked = false;
        self.optcr = self.committed | OPTLOCK;
        self.busy = 0;
        for b in self.sram.iter_mut() {
            *b = 0;
        }
    }

    /// Place `data` at `address` without going through the controller
    pub fn load(&mut self, address: u32, data: &[u8]) {
        for (i, b) in data.iter().enumerate() {
            if let Some(cell) = self.cell(address.wrapping_add(i as u32)) {
                *cell = *b;
            }
        }
    }

    /// Copy `len` bytes from `address`, unmapped bytes reading as zero
    pub fn peek(&mut self, address: u32, len: usize) -> Vec<u8> {
        (0..len)
            .map(|i| self.cell(address.wrapping_add(i as u32)).map(|c| *c).unwrap_or(0))
            .collect()
    }

    /// Number of erase, program and option byte commit operations applied
    pub fn mutations(&self) -> usize {
        self.mutations
    }

    /// Whether both the flash and option byte interfaces are locked
    pub fn is_locked(&self) -> bool {
        !self.unlocked && !self.ob_unlocked
    }

    /// Option bytes as they will be after the next reset
    pub fn committed_optcr(&self) -> u32 {
        self.committed
    }

    fn cell(&mut self, address: u32) -> Option<&mut u8> {
        match address {
            FLASH_BASE..=FLASH_END => self.flash.get_mut((address - FLASH_BASE) as usize),
            SRAM1_BASE..=SRAM3_END => self.sram.get_mut((address - SRAM1_BASE) as usize),
            BKPSRAM_BASE..=BKPSRAM_END => {
                self.bkpsram.get_mut((address - BKPSRAM_BASE) as usize)
            }
            _ => None,
        }
    }

    fn sector_protected(&self, sector: u8) -> bool {
        ProtectionRegister::new(self.optcr).is_protected(sector)
    }

    fn erase_sector(&mut self, sector: u8) -> FlashStatus {
        if self.sector_protected(sector) {
            warn!("Erase of protected sector {}", sector);
            return FlashStatus::Error;
        }

        // Sector numbers are bounded by the caller
        let base = (sector_base(sector).unwrap_or(FLASH_BASE) - FLASH_BASE) as usize;
        let size = SECTOR_SIZES[sector as usize] as usize;
        for b in self.flash[base..base + size].iter_mut() {
            *b = 0xFF;
        }

        FlashStatus::Ok
    }
}

impl Default for SimFlash {
    fn default() -> Self {
        Self::new()
    }
}

impl FlashDriver for SimFlash {
    fn unlock(&mut self) -> FlashStatus {
        self.unlocked = true;
        FlashStatus::Ok
    }

    fn lock(&mut self) {
        self.unlocked = false;
    }

    fn erase(&mut self, kind: EraseKind) -> FlashStatus {
        if !self.unlocked {
            return FlashStatus::Error;
        }

        self.mutations += 1;
        self.busy = BUSY_POLLS;

        match kind {
            EraseKind::Mass => {
                if (0..SECTOR_COUNT).any(|s| self.sector_protected(s)) {
                    warn!("Mass erase with protected sectors");
                    return FlashStatus::Error;
                }
                for s in 0..SECTOR_COUNT {
                    self.erase_sector(s);
                }
                FlashStatus::Ok
            }
            EraseKind::Sectors { first, count } => {
                let last = first.saturating_add(count).min(SECTOR_COUNT);
                for s in first..last {
                    let status = self.erase_sector(s);
                    if !status.is_ok() {
                        return status;
                    }
                }
                FlashStatus::Ok
            }
        }
    }

    fn program_byte(&mut self, address: u32, value: u8) -> FlashStatus {
        match address {
            FLASH_BASE..=FLASH_END => {
                if !self.unlocked {
                    return FlashStatus::Error;
                }
                if let Some(s) = sector_of(address) {
                    if self.sector_protected(s) {
                        return FlashStatus::Error;
                    }
                }
                self.mutations += 1;
                // Programming can only clear bits
                if let Some(cell) = self.cell(address) {
                    *cell &= value;
                }
                FlashStatus::Ok
            }
            _ => match self.cell(address) {
                Some(cell) => {
                    *cell = value;
                    self.mutations += 1;
                    FlashStatus::Ok
                }
                None => FlashStatus::Error,
            },
        }
    }

    fn read_word(&mut self, address: u32) -> u32 {
        let b = self.peek(address, 4);
        u32::from_le_bytes([b[0], b[1], b[2], b[3]])
    }

    fn ob_unlock(&mut self) -> FlashStatus {
        self.ob_unlocked = true;
        self.optcr &= !OPTLOCK;
        FlashStatus::Ok
    }

    fn ob_lock(&mut self) {
        self.ob_unlocked = false;
        self.optcr |= OPTLOCK;
    }

    fn is_busy(&mut self) -> bool {
        if self.busy > 0 {
            self.busy -= 1;
            true
        } else {
            false
        }
    }

    fn read_optcr(&mut self) -> u32 {
        self.optcr
    }

    fn write_optcr(&mut self, value: u32) {
        if !self.ob_unlocked {
            warn!("Option control register written while locked");
            return;
        }

        if value & OPTSTRT != 0 {
            self.optcr = value & !OPTSTRT;
            self.committed = self.optcr;
            self.mutations += 1;
            self.busy = BUSY_POLLS;
        } else {
            self.optcr = value;
        }
    }

    fn rdp_level(&mut self) -> u8 {
        ProtectionRegister::new(self.optcr).rdp()
    }
}

/// What to do when the bootloader hands over control
pub type TransferHandler = fn(EntryDescriptor) -> !;

fn panic_on_transfer(entry: EntryDescriptor) -> ! {
    panic!(
        "control transferred: sp={:x?} entry={:#010x}",
        entry.stack_pointer, entry.entry_point
    )
}

/// Simulated execution environment
pub struct SimSystem {
    idcode: u32,
    on_transfer: TransferHandler,
}

impl SimSystem {
    /// An STM32F429 which panics on control transfer
    pub fn new() -> Self {
        Self::with_handler(panic_on_transfer)
    }

    pub fn with_handler(on_transfer: TransferHandler) -> Self {
        Self {
            idcode: IDCODE_F429,
            on_transfer,
        }
    }
}

impl Default for SimSystem {
    fn default() -> Self {
        Self::new()
    }
}

impl System for SimSystem {
    fn idcode(&self) -> u32 {
        self.idcode
    }

    fn transfer(&mut self, entry: EntryDescriptor) -> ! {
        (self.on_transfer)(entry)
    }
}

/// Status LED which remembers how often it was lit
#[derive(Debug, Default)]
pub struct SimLed {
    pub lit: bool,
    pub activations: usize,
}

impl OutputPin for SimLed {
    type Error = Infallible;

    fn set_high(&mut self) -> Result<(), Self::Error> {
        self.lit = true;
        self.activations += 1;
        Ok(())
    }

    fn set_low(&mut self) -> Result<(), Self::Error> {
        self.lit = false;
        Ok(())
    }
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum PortError {
    /// The other end has gone away or the script is exhausted
    Closed,
}

/// Scripted serial port: reads from a queue, records writes
#[derive(Debug, Default)]
pub struct SimPort {
    pub rx: VecDeque<u8>,
    pub tx: Vec<u8>,
}

impl SimPort {
    pub fn new(input: &[u8]) -> Self {
        Self {
            rx: input.iter().copied().collect(),
            tx: Vec::new(),
        }
    }

    /// Queue more bytes for the reader
    pub fn feed(&mut self, input: &[u8]) {
        self.rx.extend(input.iter().copied());
    }

    /// Take everything written so far
    pub fn take(&mut self) -> Vec<u8> {
        std::mem::replace(&mut self.tx, Vec::new())
    }
}

impl serial::Read<u8> for SimPort {
    type Error = PortError;

    fn read(&mut self) -> nb::Result<u8, Self::Error> {
        self.rx.pop_front().ok_or(nb::Error::Other(PortError::Closed))
    }
}

impl serial::Write<u8> for SimPort {
    type Error = PortError;

    fn write(&mut self, word: u8) -> nb::Result<(), Self::Error> {
        self.tx.push(word);
        Ok(())
    }

    fn flush(&mut self) -> nb::Result<(), Self::Error> {
        Ok(())
    }
}

/// One end of an in-process serial link
pub struct ChannelPort {
    tx: Sender<u8>,
    rx: Receiver<u8>,
}

/// A connected pair of ports
pub fn channel_pair() -> (ChannelPort, ChannelPort) {
    let (a_tx, b_rx) = channel();
    let (b_tx, a_rx) = channel();
    (
        ChannelPort { tx: a_tx, rx: a_rx },
        ChannelPort { tx: b_tx, rx: b_rx },
    )
}

impl serial::Read<u8> for ChannelPort {
    type Error = PortError;

    fn read(&mut self) -> nb::Result<u8, Self::Error> {
        match self.rx.recv_timeout(Duration::from_millis(1)) {
            Ok(b) => Ok(b),
            Err(RecvTimeoutError::Timeout) => Err(nb::Error::WouldBlock),
            Err(RecvTimeoutError::Disconnected) => Err(nb::Error::Other(PortError::Closed)),
        }
    }
}

impl serial::Write<u8> for ChannelPort {
    type Error = PortError;

    fn write(&mut self, word: u8) -> nb::Result<(), Self::Error> {
        self.tx
            .send(word)
            .map_err(|_| nb::Error::Other(PortError::Closed))
    }

    fn flush(&mut self) -> nb::Result<(), Self::Error> {
        Ok(())
    }
}
