//! Sector write and read/write protection through the option bytes.
//!
//! The option control register (FLASH_OPTCR) holds a 12 bit `nWRP` field,
//! one bit per sector, and the `SPRMOD` bit selecting its meaning:
//!
//! * `SPRMOD = 0`: a cleared `nWRP` bit write-protects the sector
//! * `SPRMOD = 1`: a set `nWRP` bit read/write-protects the sector
//!
//! Changes are staged in the register and committed to the persistent
//! option bytes by setting `OPTSTRT`.

use core::ops::{Deref, DerefMut};

use crate::flash::{FlashDriver, FlashStatus};
use crate::memory::SECTOR_COUNT;

/// Option byte lock bit
pub const OPTLOCK: u32 = 1 << 0;
/// Option byte commit bit
pub const OPTSTRT: u32 = 1 << 1;
/// Read protection level field
pub const RDP_SHIFT: u32 = 8;
pub const RDP_MASK: u32 = 0xFF << RDP_SHIFT;
/// Sector protection field
pub const NWRP_SHIFT: u32 = 16;
pub const NWRP_MASK: u32 = 0x0FFF << NWRP_SHIFT;
/// Protection mode selection bit
pub const SPRMOD: u32 = 1 << 31;

/// Sector bits, one per sector
pub const SECTOR_BITS: u16 = 0x0FFF;

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum ProtectionMode {
    /// Write protection of the selected sectors
    WriteOnly = 1,
    /// Read and write protection (PCROP) of the selected sectors
    ReadWrite = 2,
}

impl ProtectionMode {
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(ProtectionMode::WriteOnly),
            2 => Some(ProtectionMode::ReadWrite),
            _ => None,
        }
    }
}

/// Protection change requested by the host
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Protection {
    /// Remove every sector protection and return to write-only mode
    Disable,
    /// Protect the sectors set in `sectors`
    Enable { sectors: u16, mode: ProtectionMode },
}

/// Typed view of the option control register
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct ProtectionRegister(u32);

impl ProtectionRegister {
    pub fn new(bits: u32) -> Self {
        Self(bits)
    }

    pub fn bits(&self) -> u32 {
        self.0
    }

    /// Whether read/write protection mode is selected
    pub fn sprmod(&self) -> bool {
        self.0 & SPRMOD != 0
    }

    pub fn set_sprmod(&mut self, on: bool) {
        if on {
            self.0 |= SPRMOD;
        } else {
            self.0 &= !SPRMOD;
        }
    }

    /// The 12 bit `nWRP` field
    pub fn sectors(&self) -> u16 {
        ((self.0 & NWRP_MASK) >> NWRP_SHIFT) as u16
    }

    /// Replace the `nWRP` field
    pub fn set_sectors(&mut self, sectors: u16) {
        self.0 &= !NWRP_MASK;
        self.0 |= ((sectors & SECTOR_BITS) as u32) << NWRP_SHIFT;
    }

    /// Clear the `nWRP` bits named in `sectors`
    pub fn clear_sectors(&mut self, sectors: u16) {
        self.0 &= !(((sectors & SECTOR_BITS) as u32) << NWRP_SHIFT);
    }

    pub fn rdp(&self) -> u8 {
        ((self.0 & RDP_MASK) >> RDP_SHIFT) as u8
    }

    /// Upper half-word: `nWRP` in the low 12 bits, `SPRMOD` in bit 15
    pub fn status(&self) -> u16 {
        (self.0 >> 16) as u16
    }

    /// Whether `sector` is protected under the current mode
    pub fn is_protected(&self, sector: u8) -> bool {
        if sector >= SECTOR_COUNT {
            return false;
        }
        let bit = self.sectors() & (1 << sector) != 0;
        if self.sprmod() {
            bit
        } else {
            !bit
        }
    }
}

/// Option control register held unlocked, locked again on drop
pub struct OptionBytes<'a, F: FlashDriver> {
    flash: &'a mut F,
}

impl<'a, F: FlashDriver> OptionBytes<'a, F> {
    pub fn unlock(flash: &'a mut F) -> Self {
        let s = flash.ob_unlock();
        if s != FlashStatus::Ok {
            warn!("Option byte unlock returned {:?}", s);
        }
        Self { flash }
    }

    /// Spin until the controller reports idle
    pub fn wait_idle(&mut self) {
        while self.flash.is_busy() {}
    }

    /// Stage the register change made by `f` and commit it
    pub fn modify<M>(&mut self, f: M)
    where
        M: FnOnce(&mut ProtectionRegister),
    {
        self.wait_idle();

        let mut reg = ProtectionRegister::new(self.flash.read_optcr());
        f(&mut reg);
        self.flash.write_optcr(reg.bits());

        self.flash.write_optcr(reg.bits() | OPTSTRT);
        self.wait_idle();
    }
}

impl<'a, F: FlashDriver> Deref for OptionBytes<'a, F> {
    type Target = F;

    fn deref(&self) -> &F {
        self.flash
    }
}

impl<'a, F: FlashDriver> DerefMut for OptionBytes<'a, F> {
    fn deref_mut(&mut self) -> &mut F {
        self.flash
    }
}

impl<'a, F: FlashDriver> Drop for OptionBytes<'a, F> {
    fn drop(&mut self) {
        self.flash.ob_lock();
    }
}

/// Apply a protection change, returning the status byte for the host.
///
/// Every path reports success; a commit that never completes blocks here.
pub fn configure<F: FlashDriver>(flash: &mut F, request: Protection) -> u8 {
    let mut ob = OptionBytes::unlock(flash);

    match request {
        Protection::Disable => {
            debug!("Removing all sector protection");
            ob.modify(|r| {
                r.set_sprmod(false);
                r.set_sectors(SECTOR_BITS);
            });
        }
        Protection::Enable {
            sectors,
            mode: ProtectionMode::WriteOnly,
        } => {
            debug!("Write protecting sectors {:#05x}", sectors & SECTOR_BITS);
            ob.modify(|r| {
                r.set_sprmod(false);
                r.clear_sectors(sectors);
            });
        }
        Protection::Enable {
            sectors,
            mode: ProtectionMode::ReadWrite,
        } => {
            debug!("Read/write protecting sectors {:#05x}", sectors & SECTOR_BITS);
            ob.modify(|r| {
                r.set_sprmod(true);
                r.set_sectors(sectors);
            });
        }
    }

    0
}

/// Current protection state: `nWRP` in the low 12 bits, `SPRMOD` in bit 15
pub fn read_status<F: FlashDriver>(flash: &mut F) -> u16 {
    ProtectionRegister::new(flash.read_optcr()).status()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flash::EraseKind;

    /// Factory default OPTCR: RDP level 0, all sectors unprotected, locked
    const OPTCR_DEFAULT: u32 = 0x0FFF_AAED;

    struct Register {
        optcr: u32,
        committed: u32,
        unlocked: bool,
        busy_polls: usize,
        log: Vec<&'static str>,
    }

    impl Register {
        fn new() -> Self {
            Self {
                optcr: OPTCR_DEFAULT,
                committed: OPTCR_DEFAULT,
                unlocked: false,
                busy_polls: 0,
                log: Vec::new(),
            }
        }
    }

    impl FlashDriver for Register {
        fn unlock(&mut self) -> FlashStatus {
            FlashStatus::Ok
        }
        fn lock(&mut self) {}
        fn erase(&mut self, _kind: EraseKind) -> FlashStatus {
            FlashStatus::Ok
        }
        fn program_byte(&mut self, _address: u32, _value: u8) -> FlashStatus {
            FlashStatus::Ok
        }
        fn read_word(&mut self, _address: u32) -> u32 {
            0
        }
        fn ob_unlock(&mut self) -> FlashStatus {
            self.unlocked = true;
            self.log.push("unlock");
            FlashStatus::Ok
        }
        fn ob_lock(&mut self) {
            self.unlocked = false;
            self.log.push("lock");
        }
        fn is_busy(&mut self) -> bool {
            if self.busy_polls > 0 {
                self.busy_polls -= 1;
                true
            } else {
                false
            }
        }
        fn read_optcr(&mut self) -> u32 {
            self.optcr
        }
        fn write_optcr(&mut self, value: u32) {
            assert!(self.unlocked, "OPTCR written while locked");
            if value & OPTSTRT != 0 {
                self.optcr = value & !OPTSTRT;
                self.committed = self.optcr;
                self.busy_polls = 3;
                self.log.push("commit");
            } else {
                self.optcr = value;
                self.log.push("stage");
            }
        }
        fn rdp_level(&mut self) -> u8 {
            ProtectionRegister::new(self.optcr).rdp()
        }
    }

    #[test]
    fn test_register_fields() {
        let mut r = ProtectionRegister::new(OPTCR_DEFAULT);
        assert!(!r.sprmod());
        assert_eq!(r.sectors(), 0x0FFF);
        assert_eq!(r.rdp(), 0xAA);

        r.set_sprmod(true);
        r.set_sectors(0xF00F);
        assert!(r.sprmod());
        assert_eq!(r.sectors(), 0x000F);
        assert_eq!(r.status(), 0x800F);
        assert_eq!(r.rdp(), 0xAA);
    }

    #[test]
    fn test_is_protected() {
        let mut r = ProtectionRegister::new(OPTCR_DEFAULT);
        assert!(!(0..SECTOR_COUNT).any(|s| r.is_protected(s)));
        assert!(!r.is_protected(SECTOR_COUNT));

        r.clear_sectors(0b100);
        assert!(r.is_protected(2));
        assert!(!r.is_protected(3));

        r.set_sprmod(true);
        r.set_sectors(0b1000);
        assert!(r.is_protected(3));
        assert!(!r.is_protected(2));
    }

    #[test]
    fn test_write_only_clears_bits() {
        let mut f = Register::new();
        assert_eq!(
            configure(
                &mut f,
                Protection::Enable {
                    sectors: 0b0000_0000_0110,
                    mode: ProtectionMode::WriteOnly
                }
            ),
            0
        );
        assert_eq!(read_status(&mut f), 0x0FF9);
        assert_eq!(f.committed & NWRP_MASK, 0x0FF9 << 16);
    }

    #[test]
    fn test_read_write_replaces_field() {
        let mut f = Register::new();
        configure(
            &mut f,
            Protection::Enable {
                sectors: 0x0A5,
                mode: ProtectionMode::ReadWrite,
            },
        );
        let status = read_status(&mut f);
        assert_eq!(status & SECTOR_BITS, 0x0A5);
        assert_eq!(status & 0x8000, 0x8000);
        // RDP untouched
        assert_eq!(f.rdp_level(), 0xAA);
    }

    #[test]
    fn test_disable_restores_unprotected() {
        let mut f = Register::new();
        configure(
            &mut f,
            Protection::Enable {
                sectors: 0x003,
                mode: ProtectionMode::ReadWrite,
            },
        );
        assert_eq!(configure(&mut f, Protection::Disable), 0);
        assert_eq!(read_status(&mut f), 0x0FFF);
        assert_eq!(f.committed, OPTCR_DEFAULT);
    }

    #[test]
    fn test_commit_sequence() {
        let mut f = Register::new();
        configure(&mut f, Protection::Disable);
        assert_eq!(f.log, vec!["unlock", "stage", "commit", "lock"]);
        assert!(!f.unlocked);
        assert_eq!(f.busy_polls, 0);
    }

    #[test]
    fn test_mode_codes() {
        assert_eq!(ProtectionMode::from_code(1), Some(ProtectionMode::WriteOnly));
        assert_eq!(ProtectionMode::from_code(2), Some(ProtectionMode::ReadWrite));
        assert_eq!(ProtectionMode::from_code(0), None);
        assert_eq!(ProtectionMode::from_code(3), None);
    }
}
