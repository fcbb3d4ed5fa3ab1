//! STM32F429 memory map.
//!
//! Legal target regions for `GoToAddress` and `MemWrite`, and the bank 1
//! sector layout used by the erase executor.

/// Start of the main flash array
pub const FLASH_BASE: u32 = 0x0800_0000;
/// Last byte of the main flash array (2 MiB)
pub const FLASH_END: u32 = 0x081F_FFFF;

pub const SRAM1_BASE: u32 = 0x2000_0000;
pub const SRAM1_END: u32 = 0x2001_BFFF;

pub const SRAM2_BASE: u32 = 0x2001_C000;
pub const SRAM2_END: u32 = 0x2001_FFFF;

pub const SRAM3_BASE: u32 = 0x2002_0000;
pub const SRAM3_END: u32 = 0x2002_FFFF;

pub const BKPSRAM_BASE: u32 = 0x4002_4000;
pub const BKPSRAM_END: u32 = 0x4002_4FFF;

/// Base of flash sector 2, where the user application lives
pub const FLASH_SECTOR2_BASE: u32 = 0x0800_8000;

/// Number of sectors addressed by the erase and protection commands
pub const SECTOR_COUNT: u8 = 12;

/// Sector number requesting a mass erase
pub const MASS_ERASE: u8 = 0xFF;

/// Sector sizes of flash bank 1, in bytes
pub const SECTOR_SIZES: [u32; SECTOR_COUNT as usize] = [
    16 * 1024,
    16 * 1024,
    16 * 1024,
    16 * 1024,
    64 * 1024,
    128 * 1024,
    128 * 1024,
    128 * 1024,
    128 * 1024,
    128 * 1024,
    128 * 1024,
    128 * 1024,
];

/// An inclusive address range
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Region {
    pub name: &'static str,
    pub base: u32,
    pub end: u32,
}

impl Region {
    pub const fn new(name: &'static str, base: u32, end: u32) -> Self {
        Self { name, base, end }
    }

    pub fn contains(&self, address: u32) -> bool {
        address >= self.base && address <= self.end
    }

    /// Region size in bytes
    pub fn size(&self) -> usize {
        (self.end - self.base) as usize + 1
    }
}

/// Regions a host may jump to or write into.
///
/// Peripheral and external memory are reachable on the bus but are never
/// accepted as targets.
pub const LEGAL_REGIONS: [Region; 5] = [
    Region::new("flash", FLASH_BASE, FLASH_END),
    Region::new("sram1", SRAM1_BASE, SRAM1_END),
    Region::new("sram2", SRAM2_BASE, SRAM2_END),
    Region::new("sram3", SRAM3_BASE, SRAM3_END),
    Region::new("bkpsram", BKPSRAM_BASE, BKPSRAM_END),
];

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum AddressStatus {
    Valid,
    Invalid,
}

impl AddressStatus {
    /// Result byte reported to the host
    pub fn code(self) -> u8 {
        match self {
            AddressStatus::Valid => crate::protocol::ADDR_VALID,
            AddressStatus::Invalid => crate::protocol::ADDR_INVALID,
        }
    }
}

/// Classify a host-supplied address against [`LEGAL_REGIONS`]
pub fn classify(address: u32) -> AddressStatus {
    if region_of(address).is_some() {
        AddressStatus::Valid
    } else {
        AddressStatus::Invalid
    }
}

/// The legal region containing `address`, if any
pub fn region_of(address: u32) -> Option<&'static Region> {
    LEGAL_REGIONS.iter().find(|r| r.contains(address))
}

/// Start address of a bank 1 sector
pub fn sector_base(sector: u8) -> Option<u32> {
    if sector >= SECTOR_COUNT {
        return None;
    }
    let offset: u32 = SECTOR_SIZES[..sector as usize].iter().sum();
    Some(FLASH_BASE + offset)
}

/// Bank 1 sector holding `address`, if any
pub fn sector_of(address: u32) -> Option<u8> {
    let mut base = FLASH_BASE;
    for (i, size) in SECTOR_SIZES.iter().enumerate() {
        if address >= base && address < base + size {
            return Some(i as u8);
        }
        base += size;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_region_boundaries() {
        for r in LEGAL_REGIONS.iter() {
            assert_eq!(classify(r.base), AddressStatus::Valid, "{} base", r.name);
            assert_eq!(classify(r.end), AddressStatus::Valid, "{} end", r.name);
            assert_eq!(classify(r.base + r.size() as u32 / 2), AddressStatus::Valid);
        }
    }

    #[test]
    fn test_outside_regions() {
        assert_eq!(classify(FLASH_BASE - 1), AddressStatus::Invalid);
        assert_eq!(classify(FLASH_END + 1), AddressStatus::Invalid);
        assert_eq!(classify(SRAM1_BASE - 1), AddressStatus::Invalid);
        assert_eq!(classify(SRAM3_END + 1), AddressStatus::Invalid);
        assert_eq!(classify(BKPSRAM_BASE - 1), AddressStatus::Invalid);
        assert_eq!(classify(BKPSRAM_END + 1), AddressStatus::Invalid);
    }

    #[test]
    fn test_peripherals_and_external_rejected() {
        // USART1, GPIOA, FMC bank 1, system memory, 0 and top of bus
        for a in [0x4001_1000, 0x4002_0000, 0x6000_0000, 0x1FFF_0000, 0, 0xFFFF_FFFF].iter() {
            assert_eq!(classify(*a), AddressStatus::Invalid, "{:#010x}", a);
        }
    }

    #[test]
    fn test_sram_contiguous() {
        assert_eq!(SRAM1_END + 1, SRAM2_BASE);
        assert_eq!(SRAM2_END + 1, SRAM3_BASE);
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(AddressStatus::Valid.code(), 0x00);
        assert_eq!(AddressStatus::Invalid.code(), 0x01);
    }

    #[test]
    fn test_sector_layout() {
        assert_eq!(sector_base(0), Some(FLASH_BASE));
        assert_eq!(sector_base(2), Some(FLASH_SECTOR2_BASE));
        assert_eq!(sector_base(4), Some(0x0801_0000));
        assert_eq!(sector_base(5), Some(0x0802_0000));
        assert_eq!(sector_base(11), Some(0x080E_0000));
        assert_eq!(sector_base(12), None);

        assert_eq!(sector_of(FLASH_SECTOR2_BASE), Some(2));
        assert_eq!(sector_of(0x080F_FFFF), Some(11));
        assert_eq!(sector_of(0x0810_0000), None);
    }
}
