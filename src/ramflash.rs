//! NOR flash emulated in RAM.
//!
//! Behaves like the real part where it matters to a filesystem: erase sets a
//! sector to `0xFF`, programming ANDs bits in, so writing over unerased data
//! corrupts it exactly as hardware would.

use crate::{
    config::FLASH_SECTOR_SIZE,
    flash::BlockDevice,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RamFlashError {
    OutOfBounds,
    Misaligned,
}

pub struct RamFlash<'a> {
    mem: &'a mut [u8],
    erases: u32,
}

impl<'a> RamFlash<'a> {
    /// Wrap `mem` as-is. Its length is rounded down to whole sectors.
    pub fn new(mem: &'a mut [u8]) -> Self {
        let usable = mem.len() - mem.len() % FLASH_SECTOR_SIZE;
        Self {
            mem: &mut mem[..usable],
            erases: 0,
        }
    }

    /// Sector erases performed so far.
    pub const fn erases(&self) -> u32 {
        self.erases
    }

    pub fn contents(&self) -> &[u8] {
        self.mem
    }

    fn span(&mut self, addr: u32, len: usize) -> Result<&mut [u8], RamFlashError> {
        let start = addr as usize;
        let end = start.checked_add(len).ok_or(RamFlashError::OutOfBounds)?;
        self.mem
            .get_mut(start..end)
            .ok_or(RamFlashError::OutOfBounds)
    }
}

impl BlockDevice for RamFlash<'_> {
    type Error = RamFlashError;

    fn capacity(&self) -> u32 {
        self.mem.len() as u32
    }

    fn read(&mut self, addr: u32, buf: &mut [u8]) -> Result<(), Self::Error> {
        buf.copy_from_slice(self.span(addr, buf.len())?);
        Ok(())
    }

    fn program(&mut self, addr: u32, data: &[u8]) -> Result<(), Self::Error> {
        for (cell, byte) in self.span(addr, data.len())?.iter_mut().zip(data) {
            *cell &= byte;
        }
        Ok(())
    }

    fn erase_sector(&mut self, addr: u32) -> Result<(), Self::Error> {
        if addr as usize % FLASH_SECTOR_SIZE != 0 {
            return Err(RamFlashError::Misaligned);
        }
        self.span(addr, FLASH_SECTOR_SIZE)?.fill(0xFF);
        self.erases += 1;
        Ok(())
    }
}
