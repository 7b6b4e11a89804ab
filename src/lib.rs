//! # sensornode
//!
//! Acquisition and logging core for a battery-powered sensor node.
//!
//! One acquisition pass reads every sensor once, captures a burst of audio and
//! appends each measurement as a `<value>,<timestamp>\r\n` line to its own log
//! on SPI NOR flash:
//! - **Bus**: one SPI bus shared by flash, barometer and RTC, with scoped
//!   chip-select guards
//! - **Logs**: append-only named logs with one header line each, and a
//!   format-and-remount recovery when the store will not mount
//! - **Capture**: double-buffered DMA audio capture with a race-free
//!   sleep-until-ready wait
//! - **Spectrum**: dominant frequency of one 1024-sample buffer
//! - **Sensors**: BMP280 barometer, AM1815 real-time clock, ADC light sensor
//!
//! Everything except the board binding is hardware independent and runs on the
//! host.
//!
//! ## Quick start
//!
//! ```rust,ignore
//! let peripherals = sensornode::init();
//! let resources = sensornode::split_resources!(peripherals);
//!
//! let mut store = FlashStore::new(flash);
//! let mut mounted = mount_or_format(&mut store)?;
//! let mic = microphone.stream(ring, &CAPTURE)?;
//! let mut node = Node { barometer, clock, light, capture, dma: &mic, sleep: &mic };
//! let report = node.acquire(&mut mounted)?;
//! ```

#![cfg_attr(not(test), no_std)]
#![cfg_attr(
    all(target_arch = "xtensa", feature = "board"),
    feature(asm_experimental_arch)
)]

#[macro_use]
mod fmt;

#[cfg(test)]
mod testing;

pub mod acquisition;
pub mod bmp280;
pub mod bus;
pub mod capture;
pub mod config;
pub mod flash;
pub mod flashfs;
pub mod logbook;
pub mod ramflash;
pub mod rtc;
pub mod sensors;
pub mod spectrum;
pub mod store;
pub mod timestamp;

#[cfg(all(target_arch = "xtensa", feature = "board"))]
mod board;
#[cfg(all(target_arch = "xtensa", feature = "board"))]
pub mod light;
#[cfg(all(target_arch = "xtensa", feature = "board"))]
pub mod microphone;

pub use acquisition::{
    Node,
    Outcome,
    PassReport,
    Skip,
};
pub use bmp280::Bmp280;
#[cfg(all(target_arch = "xtensa", feature = "board"))]
pub use board::*;
pub use bus::{
    BusConfig,
    BusError,
    DeviceHandle,
    SharedBus,
};
pub use capture::{
    AudioCapture,
    CaptureDma,
    DoubleBuffer,
    RingFeeder,
    Sleep,
};
pub use flash::SpiFlash;
pub use flashfs::FlashStore;
#[cfg(all(target_arch = "xtensa", feature = "board"))]
pub use light::LightAdc;
pub use logbook::LogWriter;
#[cfg(all(target_arch = "xtensa", feature = "board"))]
pub use microphone::{
    MicFrontEnd,
    Microphone,
};
pub use ramflash::RamFlash;
pub use rtc::Am1815;
pub use sensors::{
    Metric,
    Sample,
};
pub use store::{
    Store,
    mount_or_format,
};

/// StaticCell helper: allocates a value into a `static` exactly once.
#[macro_export]
macro_rules! mk_static {
    ($t:ty, $val:expr) => {{
        static STATIC_CELL: static_cell::StaticCell<$t> = static_cell::StaticCell::new();
        #[deny(unused_attributes)]
        let x = STATIC_CELL.uninit().write($val);
        x
    }};
}
