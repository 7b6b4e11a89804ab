//! What the acquisition pass needs from each peripheral, and what it logs.

use core::fmt::Debug;

use crate::bus::BusError;

/// Failures of the bus-attached sensor drivers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DriverError<E> {
    Bus(BusError<E>),
    /// The identification register held something unexpected.
    WrongId(u8),
    /// A conversion never finished.
    Timeout,
    /// The device returned a value that cannot be converted.
    InvalidReading,
}

impl<E> From<BusError<E>> for DriverError<E> {
    fn from(e: BusError<E>) -> Self {
        Self::Bus(e)
    }
}

/// Temperature and pressure source.
pub trait Barometer {
    type Error: Debug;

    /// Temperature in millidegrees Celsius.
    fn read_temperature(&mut self) -> Result<i32, Self::Error>;

    /// Pressure in pascals.
    fn read_pressure(&mut self) -> Result<u32, Self::Error>;
}

/// Source of wall-clock time.
pub trait WallClock {
    type Error: Debug;

    /// Seconds since the Unix epoch.
    fn now(&mut self) -> Result<u64, Self::Error>;
}

/// Ambient light level.
pub trait LightSensor {
    type Error: Debug;

    /// Sensor output in millivolts.
    fn read_light(&mut self) -> Result<u32, Self::Error>;
}

/// One logged quantity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Metric {
    Temperature,
    Pressure,
    Light,
    AudioPeak,
}

impl Metric {
    /// Every metric, in the order a pass records them.
    pub const ALL: [Self; 4] = [
        Self::Temperature,
        Self::Pressure,
        Self::Light,
        Self::AudioPeak,
    ];

    /// Name of the metric's log on the store.
    pub const fn log_name(self) -> &'static str {
        match self {
            Self::Temperature => "temperature",
            Self::Pressure => "pressure",
            Self::Light => "light",
            Self::AudioPeak => "audio-peak",
        }
    }

    /// First line of the metric's log.
    pub const fn header(self) -> &'static str {
        match self {
            Self::Temperature => "temperature_mC,unix_time_s\r\n",
            Self::Pressure => "pressure_Pa,unix_time_s\r\n",
            Self::Light => "light_mV,unix_time_s\r\n",
            Self::AudioPeak => "audio_peak_Hz,unix_time_s\r\n",
        }
    }

    pub const fn index(self) -> usize {
        self as usize
    }
}

/// One measurement, between being read and being logged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Sample {
    pub metric: Metric,
    pub value: i64,
    pub timestamp_secs: u64,
}
