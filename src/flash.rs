//! SPI NOR flash on the shared bus.
//!
//! Standard 25-series command set with 24-bit addresses. Every command is its
//! own bus selection; program and erase wait for the busy bit to clear before
//! returning.

use core::fmt::Debug;

use embedded_hal::{
    digital::OutputPin,
    spi::SpiBus,
};

use crate::{
    bus::{
        BusConfig,
        BusError,
        DeviceHandle,
        SharedBus,
    },
    config::{
        FLASH_BUSY_POLLS,
        FLASH_PAGE_SIZE,
        FLASH_SECTOR_SIZE,
    },
};

const READ_DATA: u8 = 0x03;
const PAGE_PROGRAM: u8 = 0x02;
const SECTOR_ERASE: u8 = 0x20;
const WRITE_ENABLE: u8 = 0x06;
const READ_STATUS: u8 = 0x05;
const JEDEC_ID: u8 = 0x9F;

const STATUS_BUSY: u8 = 0x01;

/// Erase-before-write block storage.
///
/// Erasing sets a whole sector to `0xFF`; programming can only clear bits.
pub trait BlockDevice {
    type Error: Debug;

    /// Size in bytes.
    fn capacity(&self) -> u32;

    fn read(&mut self, addr: u32, buf: &mut [u8]) -> Result<(), Self::Error>;

    /// Program bytes at `addr`. May cross page boundaries.
    fn program(&mut self, addr: u32, data: &[u8]) -> Result<(), Self::Error>;

    /// Erase the [`FLASH_SECTOR_SIZE`] sector starting at `addr`.
    fn erase_sector(&mut self, addr: u32) -> Result<(), Self::Error>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FlashError<E> {
    Bus(BusError<E>),
    /// The JEDEC ID read back blank or names an unsupported size.
    NotPresent([u8; 3]),
    /// The busy bit never cleared.
    Timeout,
    OutOfBounds,
    Misaligned,
}

impl<E> From<BusError<E>> for FlashError<E> {
    fn from(e: BusError<E>) -> Self {
        Self::Bus(e)
    }
}

pub struct SpiFlash<'a, BUS, CS> {
    bus: &'a SharedBus<BUS, CS>,
    device: DeviceHandle,
    capacity: u32,
}

impl<'a, BUS, CS> SpiFlash<'a, BUS, CS>
where
    BUS: BusConfig,
    CS: OutputPin,
{
    /// Identify the chip and size it from the JEDEC capacity byte.
    pub fn new(
        bus: &'a SharedBus<BUS, CS>,
        device: DeviceHandle,
    ) -> Result<Self, FlashError<BUS::Error>> {
        let id = read_jedec_id(bus, device)?;
        info!(
            "flash JEDEC id {=u8:#x} {=u8:#x} {=u8:#x}",
            id[0], id[1], id[2]
        );

        if id == [0x00; 3] || id == [0xFF; 3] || !(0x10..=0x18).contains(&id[2]) {
            error!("no usable flash on the bus");
            return Err(FlashError::NotPresent(id));
        }

        Ok(Self {
            bus,
            device,
            capacity: 1u32 << id[2],
        })
    }

    fn check_range(&self, addr: u32, len: usize) -> Result<(), FlashError<BUS::Error>> {
        match addr.checked_add(len as u32) {
            Some(end) if end <= self.capacity => Ok(()),
            _ => Err(FlashError::OutOfBounds),
        }
    }

    fn write_enable(&self) -> Result<(), FlashError<BUS::Error>> {
        let mut spi = self.bus.select(self.device)?;
        spi.write(&[WRITE_ENABLE])?;
        Ok(())
    }

    fn status(&self) -> Result<u8, FlashError<BUS::Error>> {
        let mut spi = self.bus.select(self.device)?;
        let mut status = [0u8];
        spi.write(&[READ_STATUS])?;
        spi.read(&mut status)?;
        Ok(status[0])
    }

    fn wait_idle(&self) -> Result<(), FlashError<BUS::Error>> {
        for _ in 0..FLASH_BUSY_POLLS {
            if self.status()? & STATUS_BUSY == 0 {
                return Ok(());
            }
        }
        error!("flash stayed busy");
        Err(FlashError::Timeout)
    }

    fn program_page(&self, addr: u32, data: &[u8]) -> Result<(), FlashError<BUS::Error>> {
        self.write_enable()?;
        {
            let mut spi = self.bus.select(self.device)?;
            spi.write(&with_address(PAGE_PROGRAM, addr))?;
            spi.write(data)?;
        }
        self.wait_idle()
    }
}

fn read_jedec_id<BUS, CS>(
    bus: &SharedBus<BUS, CS>,
    device: DeviceHandle,
) -> Result<[u8; 3], BusError<BUS::Error>>
where
    BUS: BusConfig,
    CS: OutputPin,
{
    let mut spi = bus.select(device)?;
    let mut id = [0u8; 3];
    spi.write(&[JEDEC_ID])?;
    spi.read(&mut id)?;
    Ok(id)
}

fn with_address(command: u8, addr: u32) -> [u8; 4] {
    let [_, a2, a1, a0] = addr.to_be_bytes();
    [command, a2, a1, a0]
}

impl<BUS, CS> BlockDevice for SpiFlash<'_, BUS, CS>
where
    BUS: BusConfig,
    CS: OutputPin,
{
    type Error = FlashError<BUS::Error>;

    fn capacity(&self) -> u32 {
        self.capacity
    }

    fn read(&mut self, addr: u32, buf: &mut [u8]) -> Result<(), Self::Error> {
        self.check_range(addr, buf.len())?;
        let mut spi = self.bus.select(self.device)?;
        spi.write(&with_address(READ_DATA, addr))?;
        spi.read(buf)?;
        Ok(())
    }

    fn program(&mut self, mut addr: u32, mut data: &[u8]) -> Result<(), Self::Error> {
        self.check_range(addr, data.len())?;
        while !data.is_empty() {
            // A page program wraps within its page, so stop at the boundary.
            let room = FLASH_PAGE_SIZE - (addr as usize % FLASH_PAGE_SIZE);
            let (page, rest) = data.split_at(room.min(data.len()));
            self.program_page(addr, page)?;
            addr += page.len() as u32;
            data = rest;
        }
        Ok(())
    }

    fn erase_sector(&mut self, addr: u32) -> Result<(), Self::Error> {
        if addr as usize % FLASH_SECTOR_SIZE != 0 {
            return Err(FlashError::Misaligned);
        }
        self.check_range(addr, FLASH_SECTOR_SIZE)?;
        self.write_enable()?;
        {
            let mut spi = self.bus.select(self.device)?;
            spi.write(&with_address(SECTOR_ERASE, addr))?;
        }
        self.wait_idle()
    }
}
