//! Handing control to another image.

use crate::flash::FlashDriver;

/// Where execution resumes after leaving the bootloader
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct EntryDescriptor {
    /// Main stack pointer to install, if any
    pub stack_pointer: Option<u32>,
    /// Address branched to, thumb bit included
    pub entry_point: u32,
}

impl EntryDescriptor {
    /// Entry through a vector table: initial stack pointer then reset vector
    pub fn from_vector_table<F: FlashDriver>(flash: &mut F, base: u32) -> Self {
        let msp = flash.read_word(base);
        let reset = flash.read_word(base.wrapping_add(4));
        Self {
            stack_pointer: Some(msp),
            entry_point: reset,
        }
    }

    /// Direct branch to `address`, switching to thumb state
    pub fn thumb(address: u32) -> Self {
        Self {
            stack_pointer: None,
            entry_point: address | 1,
        }
    }
}

/// Execution environment services used by the bootloader
pub trait System {
    /// Raw MCU ID code register (DBGMCU_IDCODE)
    fn idcode(&self) -> u32;

    /// Abandon the bootloader and continue at `entry`.
    ///
    /// Callers must have range-checked the target.
    fn transfer(&mut self, entry: EntryDescriptor) -> !;
}

/// Cortex-M execution environment
#[cfg(feature = "cortex-m")]
pub struct CortexM;

#[cfg(feature = "cortex-m")]
impl System for CortexM {
    fn idcode(&self) -> u32 {
        const DBGMCU_IDCODE: *const u32 = 0xE004_2000 as *const u32;
        unsafe { core::ptr::read_volatile(DBGMCU_IDCODE) }
    }

    fn transfer(&mut self, entry: EntryDescriptor) -> ! {
        info!("Transferring control to {:#010x}", entry.entry_point);

        // This is the only place the bootloader leaves its own code
        unsafe {
            match entry.stack_pointer {
                Some(msp) => {
                    cortex_m::asm::bootstrap(msp as *const u32, entry.entry_point as *const u32)
                }
                None => {
                    let f: extern "C" fn() -> ! =
                        core::mem::transmute(entry.entry_point as usize);
                    f()
                }
            }
        }
    }
}
