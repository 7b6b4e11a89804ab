//! Board constants and tunables.

use embedded_hal::spi::{
    MODE_0,
    MODE_3,
    Mode,
};

/// Maximum number of devices sharing the SPI bus.
pub const MAX_BUS_DEVICES: usize = 4;

/// SPI clock for the NOR flash.
pub const FLASH_CLOCK_HZ: u32 = 8_000_000;
/// SPI clock for the BMP280 barometer (10 MHz max).
pub const BAROMETER_CLOCK_HZ: u32 = 2_000_000;
/// SPI clock for the AM1815 RTC (2 MHz max).
pub const RTC_CLOCK_HZ: u32 = 2_000_000;

/// Microphone sample rate (16 kHz).
pub const SAMPLE_RATE_HZ: u32 = 16_000;

/// Samples per capture buffer. Must match the FFT size used by [`crate::spectrum`].
pub const CAPTURE_LEN: usize = 1024;

/// Completed buffers thrown away after arming, while the microphone settles.
pub const SETTLE_BUFFERS: u8 = 1;

/// NOR flash program page.
pub const FLASH_PAGE_SIZE: usize = 256;
/// NOR flash erase sector.
pub const FLASH_SECTOR_SIZE: usize = 4096;
/// Status polls before a program/erase is declared stuck.
pub const FLASH_BUSY_POLLS: u32 = 100_000;

/// Sectors reserved for each named log (64 KiB).
pub const LOG_REGION_SECTORS: u16 = 16;
/// Entries in the log table.
pub const MAX_LOGS: usize = 8;
/// Longest log name, in bytes.
pub const MAX_LOG_NAME: usize = 16;

/// Clock rate and SPI mode for one device on the shared bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceConfig {
    pub clock_hz: u32,
    pub mode: Mode,
}

impl DeviceConfig {
    pub const fn new(clock_hz: u32, mode: Mode) -> Self {
        Self { clock_hz, mode }
    }

    pub const fn flash() -> Self {
        Self::new(FLASH_CLOCK_HZ, MODE_0)
    }

    pub const fn barometer() -> Self {
        Self::new(BAROMETER_CLOCK_HZ, MODE_0)
    }

    pub const fn rtc() -> Self {
        Self::new(RTC_CLOCK_HZ, MODE_3)
    }
}

/// Audio capture tunables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CaptureConfig {
    /// Sample rate the front-end is running at, used to turn a bin into Hz.
    pub sample_rate_hz: u32,
    /// Completed buffers to discard before the analysed one.
    pub settle_buffers: u8,
    /// Upper bound on low-power waits per buffer. `None` waits forever.
    pub max_sleeps: Option<u32>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            sample_rate_hz: SAMPLE_RATE_HZ,
            settle_buffers: SETTLE_BUFFERS,
            max_sleeps: None,
        }
    }
}
