//! Shared SPI bus arbiter.
//!
//! Every peripheral on the node sits on one SPI bus with its own chip-select
//! line, clock rate and mode. [`SharedBus`] owns the bus and all chip-select
//! pins; drivers borrow it and open a [`Selection`] for each transaction.
//! The selection asserts the device's chip select when created and releases
//! it when dropped, on every exit path.
//!
//! Only one selection can be open at a time. Opening a second one while the
//! first is alive is a programming error and panics. So is selecting through
//! a handle that another bus handed out.

use core::{
    cell::{
        RefCell,
        RefMut,
    },
    sync::atomic::{
        AtomicU32,
        Ordering,
    },
};

use embedded_hal::{
    digital::OutputPin,
    spi::{
        ErrorKind,
        ErrorType,
        Mode,
        SpiBus,
    },
};
use heapless::Vec;

use crate::config::{
    DeviceConfig,
    MAX_BUS_DEVICES,
};

/// An SPI bus that can change clock rate and mode between devices.
pub trait BusConfig: SpiBus {
    fn reconfigure(&mut self, clock_hz: u32, mode: Mode) -> Result<(), Self::Error>;
}

/// Errors raised while talking through the arbiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BusError<E> {
    /// The bus peripheral reported an error.
    Transport(E),
    /// A chip-select line could not be driven.
    ChipSelect,
}

impl<E: embedded_hal::spi::Error> embedded_hal::spi::Error for BusError<E> {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::Transport(e) => e.kind(),
            Self::ChipSelect => ErrorKind::ChipSelectFault,
        }
    }
}

/// Source of bus identities. Zero means "no device attached yet".
static NEXT_BUS_ID: AtomicU32 = AtomicU32::new(1);

/// One logical device on the shared bus.
///
/// Only [`SharedBus::attach`] hands these out, and each attach consumes a
/// chip-select pin, so two handles never share a select line. The handle
/// remembers which bus issued it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceHandle {
    bus: u32,
    index: u8,
    config: DeviceConfig,
}

impl DeviceHandle {
    pub const fn config(&self) -> DeviceConfig {
        self.config
    }
}

struct Inner<BUS, CS> {
    id: u32,
    bus: BUS,
    lines: Vec<CS, MAX_BUS_DEVICES>,
    /// Clock and mode last pushed to the bus peripheral.
    applied: Option<DeviceConfig>,
}

/// The bus plus every chip-select line on it.
pub struct SharedBus<BUS, CS> {
    inner: RefCell<Inner<BUS, CS>>,
}

impl<BUS, CS> SharedBus<BUS, CS>
where
    BUS: BusConfig,
    CS: OutputPin,
{
    pub const fn new(bus: BUS) -> Self {
        Self {
            inner: RefCell::new(Inner {
                id: 0,
                bus,
                lines: Vec::new(),
                applied: None,
            }),
        }
    }

    /// Take ownership of a chip-select pin and register its device.
    ///
    /// The line is driven inactive (high) before the handle is returned.
    ///
    /// # Panics
    ///
    /// Panics if more than [`MAX_BUS_DEVICES`] devices are attached.
    pub fn attach(
        &mut self,
        mut cs: CS,
        config: DeviceConfig,
    ) -> Result<DeviceHandle, BusError<BUS::Error>> {
        let inner = self.inner.get_mut();
        cs.set_high().map_err(|_| BusError::ChipSelect)?;

        let index = inner.lines.len();
        if inner.lines.push(cs).is_err() {
            panic!("shared bus is limited to {} devices", MAX_BUS_DEVICES);
        }
        if inner.id == 0 {
            inner.id = NEXT_BUS_ID.fetch_add(1, Ordering::Relaxed);
        }

        Ok(DeviceHandle {
            bus: inner.id,
            index: index as u8,
            config,
        })
    }

    /// Select a device for exclusive use of the bus.
    ///
    /// Reconfigures the bus if the device's clock or mode differs from the
    /// last selected device, then asserts its chip select.
    ///
    /// # Panics
    ///
    /// Panics if another selection on this bus is still alive, or if the
    /// handle was not attached to this bus.
    #[track_caller]
    pub fn select(
        &self,
        device: DeviceHandle,
    ) -> Result<Selection<'_, BUS, CS>, BusError<BUS::Error>> {
        let Ok(mut inner) = self.inner.try_borrow_mut() else {
            panic!("shared bus already has a device selected");
        };

        let index = usize::from(device.index);
        if device.bus != inner.id || index >= inner.lines.len() {
            panic!("device {} is not attached to this bus", index);
        }

        if inner.applied != Some(device.config) {
            inner
                .bus
                .reconfigure(device.config.clock_hz, device.config.mode)
                .map_err(BusError::Transport)?;
            inner.applied = Some(device.config);
        }

        inner.lines[index]
            .set_low()
            .map_err(|_| BusError::ChipSelect)?;

        Ok(Selection { inner, index })
    }
}

/// Exclusive access to the bus with one device selected.
///
/// Implements [`SpiBus`], so drivers can run plain reads and writes through
/// it. Dropping it flushes the bus and deselects the device.
pub struct Selection<'a, BUS, CS>
where
    BUS: SpiBus,
    CS: OutputPin,
{
    inner: RefMut<'a, Inner<BUS, CS>>,
    index: usize,
}

impl<BUS, CS> ErrorType for Selection<'_, BUS, CS>
where
    BUS: SpiBus,
    CS: OutputPin,
{
    type Error = BusError<BUS::Error>;
}

impl<BUS, CS> SpiBus for Selection<'_, BUS, CS>
where
    BUS: SpiBus,
    CS: OutputPin,
{
    fn read(&mut self, words: &mut [u8]) -> Result<(), Self::Error> {
        self.inner.bus.read(words).map_err(BusError::Transport)
    }

    fn write(&mut self, words: &[u8]) -> Result<(), Self::Error> {
        self.inner.bus.write(words).map_err(BusError::Transport)
    }

    fn transfer(&mut self, read: &mut [u8], write: &[u8]) -> Result<(), Self::Error> {
        self.inner
            .bus
            .transfer(read, write)
            .map_err(BusError::Transport)
    }

    fn transfer_in_place(&mut self, words: &mut [u8]) -> Result<(), Self::Error> {
        self.inner
            .bus
            .transfer_in_place(words)
            .map_err(BusError::Transport)
    }

    fn flush(&mut self) -> Result<(), Self::Error> {
        self.inner.bus.flush().map_err(BusError::Transport)
    }
}

impl<BUS, CS> Drop for Selection<'_, BUS, CS>
where
    BUS: SpiBus,
    CS: OutputPin,
{
    fn drop(&mut self) {
        let inner = &mut *self.inner;
        // The last byte must be on the wire before the select line rises.
        if inner.bus.flush().is_err() {
            warn!("bus flush failed while deselecting device {}", self.index);
        }
        if inner.lines[self.index].set_high().is_err() {
            error!("chip select {} stuck low", self.index);
        }
    }
}
