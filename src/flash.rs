//! Flash erase and program executors.
//!
//! Both executors hold the flash controller unlocked only for the duration
//! of one call, re-locking on every exit path through [`Unlocked`].

use core::ops::{Deref, DerefMut};

use crate::memory::{MASS_ERASE, SECTOR_COUNT};

/// Status codes returned by the flash driver, as forwarded to the host
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum FlashStatus {
    Ok = 0x00,
    Error = 0x01,
    Busy = 0x02,
    Timeout = 0x03,
    /// Erase request outside the sector map
    InvalidSector = 0x04,
}

impl FlashStatus {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn is_ok(self) -> bool {
        self == FlashStatus::Ok
    }
}

/// Erase request passed to the driver
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum EraseKind {
    /// Every sector of the bank
    Mass,
    /// `count` contiguous sectors starting at `first`
    Sectors { first: u8, count: u8 },
}

/// Flash controller primitives.
///
/// Main-array operations require [`FlashDriver::unlock`]; option-byte
/// register writes require [`FlashDriver::ob_unlock`].
pub trait FlashDriver {
    /// Enable writes to the flash control registers
    fn unlock(&mut self) -> FlashStatus;

    /// Disable writes to the flash control registers
    fn lock(&mut self);

    /// Erase sectors, blocking until the controller is idle
    fn erase(&mut self, kind: EraseKind) -> FlashStatus;

    /// Program a single byte
    fn program_byte(&mut self, address: u32, value: u8) -> FlashStatus;

    /// Memory-mapped word read
    fn read_word(&mut self, address: u32) -> u32;

    /// Enable writes to the option control register
    fn ob_unlock(&mut self) -> FlashStatus;

    /// Disable writes to the option control register
    fn ob_lock(&mut self);

    /// Whether a flash or option-byte operation is in progress
    fn is_busy(&mut self) -> bool;

    /// Read the option control register
    fn read_optcr(&mut self) -> u32;

    /// Write the option control register
    fn write_optcr(&mut self, value: u32);

    /// Current read protection level byte
    fn rdp_level(&mut self) -> u8;
}

/// Main flash held unlocked, locked again on drop
pub struct Unlocked<'a, F: FlashDriver> {
    flash: &'a mut F,
}

impl<'a, F: FlashDriver> Unlocked<'a, F> {
    pub fn new(flash: &'a mut F) -> Self {
        let s = flash.unlock();
        if !s.is_ok() {
            warn!("Flash unlock returned {:?}", s);
        }
        Self { flash }
    }
}

impl<'a, F: FlashDriver> Deref for Unlocked<'a, F> {
    type Target = F;

    fn deref(&self) -> &F {
        self.flash
    }
}

impl<'a, F: FlashDriver> DerefMut for Unlocked<'a, F> {
    fn deref_mut(&mut self) -> &mut F {
        self.flash
    }
}

impl<'a, F: FlashDriver> Drop for Unlocked<'a, F> {
    fn drop(&mut self) {
        self.flash.lock();
    }
}

/// Erase `count` sectors from `sector`, or the whole bank when `sector`
/// is [`MASS_ERASE`].
///
/// Counts of [`SECTOR_COUNT`] or more are rejected outright, and ranges
/// running past the last sector are clamped to it.
pub fn erase<F: FlashDriver>(flash: &mut F, sector: u8, count: u8) -> FlashStatus {
    if count >= SECTOR_COUNT {
        return FlashStatus::InvalidSector;
    }

    let kind = if sector == MASS_ERASE {
        EraseKind::Mass
    } else if sector < SECTOR_COUNT {
        let remaining = SECTOR_COUNT - sector;
        EraseKind::Sectors {
            first: sector,
            count: count.min(remaining),
        }
    } else {
        return FlashStatus::InvalidSector;
    };

    debug!("Erasing {:?}", kind);

    let mut f = Unlocked::new(flash);
    f.erase(kind)
}

/// Program `data` byte by byte from `address`.
///
/// The address is not validated here. Every byte is attempted even after a
/// failure, and the status of the last program operation is returned.
pub fn write<F: FlashDriver>(flash: &mut F, data: &[u8], address: u32) -> FlashStatus {
    let mut status = FlashStatus::Ok;

    let mut f = Unlocked::new(flash);
    for (i, b) in data.iter().enumerate() {
        status = f.program_byte(address.wrapping_add(i as u32), *b);
    }

    status
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        unlocked: bool,
        unlocks: usize,
        erases: Vec<EraseKind>,
        programmed: Vec<(u32, u8, bool)>,
        fail_at: Option<u32>,
        erase_status: Option<FlashStatus>,
    }

    impl FlashDriver for Recorder {
        fn unlock(&mut self) -> FlashStatus {
            self.unlocked = true;
            self.unlocks += 1;
            FlashStatus::Ok
        }
        fn lock(&mut self) {
            self.unlocked = false;
        }
        fn erase(&mut self, kind: EraseKind) -> FlashStatus {
            assert!(self.unlocked);
            self.erases.push(kind);
            self.erase_status.unwrap_or(FlashStatus::Ok)
        }
        fn program_byte(&mut self, address: u32, value: u8) -> FlashStatus {
            self.programmed.push((address, value, self.unlocked));
            if self.fail_at == Some(address) {
                FlashStatus::Error
            } else {
                FlashStatus::Ok
            }
        }
        fn read_word(&mut self, _address: u32) -> u32 {
            0
        }
        fn ob_unlock(&mut self) -> FlashStatus {
            FlashStatus::Ok
        }
        fn ob_lock(&mut self) {}
        fn is_busy(&mut self) -> bool {
            false
        }
        fn read_optcr(&mut self) -> u32 {
            0
        }
        fn write_optcr(&mut self, _value: u32) {}
        fn rdp_level(&mut self) -> u8 {
            0xAA
        }
    }

    #[test]
    fn test_mass_erase() {
        let mut f = Recorder::default();
        assert_eq!(erase(&mut f, MASS_ERASE, 0), FlashStatus::Ok);
        assert_eq!(erase(&mut f, MASS_ERASE, 7), FlashStatus::Ok);
        assert_eq!(f.erases, vec![EraseKind::Mass, EraseKind::Mass]);
        assert!(!f.unlocked);
    }

    #[test]
    fn test_ranged_erase_clamped() {
        let mut f = Recorder::default();
        erase(&mut f, 2, 3);
        erase(&mut f, 10, 5);
        erase(&mut f, 11, 11);
        assert_eq!(
            f.erases,
            vec![
                EraseKind::Sectors { first: 2, count: 3 },
                EraseKind::Sectors { first: 10, count: 2 },
                EraseKind::Sectors { first: 11, count: 1 },
            ]
        );
    }

    #[test]
    fn test_invalid_erase_requests() {
        let mut f = Recorder::default();
        assert_eq!(erase(&mut f, 0, 12), FlashStatus::InvalidSector);
        assert_eq!(erase(&mut f, 5, 0xFF), FlashStatus::InvalidSector);
        assert_eq!(erase(&mut f, 12, 1), FlashStatus::InvalidSector);
        assert_eq!(erase(&mut f, 0x80, 1), FlashStatus::InvalidSector);
        assert!(f.erases.is_empty());
        assert_eq!(f.unlocks, 0);
    }

    #[test]
    fn test_erase_failure_relocks() {
        let mut f = Recorder {
            erase_status: Some(FlashStatus::Timeout),
            ..Default::default()
        };
        assert_eq!(erase(&mut f, 4, 1), FlashStatus::Timeout);
        assert!(!f.unlocked);
    }

    #[test]
    fn test_write_in_order_under_one_unlock() {
        let mut f = Recorder::default();
        let status = write(&mut f, &[1, 2, 3], 0x0800_8000);
        assert_eq!(status, FlashStatus::Ok);
        assert_eq!(
            f.programmed,
            vec![
                (0x0800_8000, 1, true),
                (0x0800_8001, 2, true),
                (0x0800_8002, 3, true)
            ]
        );
        assert_eq!(f.unlocks, 1);
        assert!(!f.unlocked);
    }

    #[test]
    fn test_write_continues_after_failure() {
        let mut f = Recorder {
            fail_at: Some(0x2000_0001),
            ..Default::default()
        };
        // Last byte succeeds, so the earlier failure is not reported
        assert_eq!(write(&mut f, &[9, 9, 9], 0x2000_0000), FlashStatus::Ok);
        assert_eq!(f.programmed.len(), 3);

        let mut f = Recorder {
            fail_at: Some(0x2000_0002),
            ..Default::default()
        };
        assert_eq!(write(&mut f, &[9, 9, 9], 0x2000_0000), FlashStatus::Error);
    }

    #[test]
    fn test_empty_write() {
        let mut f = Recorder::default();
        assert_eq!(write(&mut f, &[], 0x0800_0000), FlashStatus::Ok);
        assert!(f.programmed.is_empty());
    }
}
