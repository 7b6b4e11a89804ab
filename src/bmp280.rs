//! Bosch BMP280 barometer over SPI.
//!
//! Runs one forced-mode conversion per read and applies the integer
//! compensation from the datasheet.

use embedded_hal::{
    digital::OutputPin,
    spi::SpiBus,
};

use crate::{
    bus::{
        BusConfig,
        DeviceHandle,
        SharedBus,
    },
    sensors::{
        Barometer,
        DriverError,
    },
};

const REG_CALIB: u8 = 0x88;
const REG_ID: u8 = 0xD0;
const REG_STATUS: u8 = 0xF3;
const REG_CTRL_MEAS: u8 = 0xF4;
const REG_DATA: u8 = 0xF7;

const CHIP_ID: u8 = 0x58;
/// Temperature and pressure oversampling x1, forced mode.
const FORCED_X1: u8 = 0b001_001_01;
const STATUS_MEASURING: u8 = 1 << 3;
const MEASURE_POLLS: u32 = 10_000;

/// Factory trimming parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Calibration {
    pub t1: u16,
    pub t2: i16,
    pub t3: i16,
    pub p1: u16,
    pub p2: i16,
    pub p3: i16,
    pub p4: i16,
    pub p5: i16,
    pub p6: i16,
    pub p7: i16,
    pub p8: i16,
    pub p9: i16,
}

impl Calibration {
    pub fn from_bytes(raw: &[u8; 24]) -> Self {
        let u = |i: usize| u16::from_le_bytes([raw[i], raw[i + 1]]);
        let s = |i: usize| i16::from_le_bytes([raw[i], raw[i + 1]]);
        Self {
            t1: u(0),
            t2: s(2),
            t3: s(4),
            p1: u(6),
            p2: s(8),
            p3: s(10),
            p4: s(12),
            p5: s(14),
            p6: s(16),
            p7: s(18),
            p8: s(20),
            p9: s(22),
        }
    }

    /// Fine temperature shared by both compensations.
    pub fn t_fine(&self, adc_t: i32) -> i32 {
        // Widened so out-of-range raw values cannot overflow.
        let adc_t = i64::from(adc_t);
        let t1 = i64::from(self.t1);
        let var1 = (((adc_t >> 3) - (t1 << 1)) * i64::from(self.t2)) >> 11;
        let delta = (adc_t >> 4) - t1;
        let var2 = (((delta * delta) >> 12) * i64::from(self.t3)) >> 14;
        (var1 + var2) as i32
    }

    /// Temperature in m°C, rounded. `t_fine` counts 1/5120 °C.
    pub fn millidegrees(&self, t_fine: i32) -> i32 {
        ((i64::from(t_fine) * 25 + 64) >> 7) as i32
    }

    /// Pressure in Pa as Q24.8, or `None` for calibration that would divide by
    /// zero.
    pub fn pressure_q24_8(&self, t_fine: i32, adc_p: i32) -> Option<u32> {
        let mut var1 = i64::from(t_fine) - 128_000;
        let mut var2 = var1 * var1 * i64::from(self.p6);
        var2 += (var1 * i64::from(self.p5)) << 17;
        var2 += i64::from(self.p4) << 35;
        var1 = ((var1 * var1 * i64::from(self.p3)) >> 8) + ((var1 * i64::from(self.p2)) << 12);
        var1 = (((1i64 << 47) + var1) * i64::from(self.p1)) >> 33;
        if var1 == 0 {
            return None;
        }

        let mut p = 1_048_576 - i64::from(adc_p);
        p = (((p << 31) - var2) * 3125) / var1;
        let var1 = (i64::from(self.p9) * (p >> 13) * (p >> 13)) >> 25;
        let var2 = (i64::from(self.p8) * p) >> 19;
        p = ((p + var1 + var2) >> 8) + (i64::from(self.p7) << 4);
        u32::try_from(p).ok()
    }
}

/// Raw 20-bit conversion results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Raw {
    temperature: i32,
    pressure: i32,
}

fn raw20(bytes: &[u8]) -> i32 {
    (i32::from(bytes[0]) << 12) | (i32::from(bytes[1]) << 4) | (i32::from(bytes[2]) >> 4)
}

pub struct Bmp280<'a, BUS, CS> {
    bus: &'a SharedBus<BUS, CS>,
    device: DeviceHandle,
    calibration: Calibration,
}

impl<'a, BUS, CS> Bmp280<'a, BUS, CS>
where
    BUS: BusConfig,
    CS: OutputPin,
{
    /// Check the chip ID and load calibration.
    pub fn new(
        bus: &'a SharedBus<BUS, CS>,
        device: DeviceHandle,
    ) -> Result<Self, DriverError<BUS::Error>> {
        let mut this = Self {
            bus,
            device,
            calibration: Calibration::from_bytes(&[0; 24]),
        };

        let id = this.read_register(REG_ID)?;
        info!("BMP280 id {=u8:#x}", id);
        if id != CHIP_ID {
            return Err(DriverError::WrongId(id));
        }

        let mut raw = [0u8; 24];
        this.read_registers(REG_CALIB, &mut raw)?;
        this.calibration = Calibration::from_bytes(&raw);
        Ok(this)
    }

    pub const fn calibration(&self) -> &Calibration {
        &self.calibration
    }

    pub fn read_register(&self, reg: u8) -> Result<u8, DriverError<BUS::Error>> {
        let mut value = [0u8];
        self.read_registers(reg, &mut value)?;
        Ok(value[0])
    }

    fn read_registers(&self, reg: u8, buf: &mut [u8]) -> Result<(), DriverError<BUS::Error>> {
        let mut spi = self.bus.select(self.device)?;
        spi.write(&[reg | 0x80])?;
        spi.read(buf)?;
        Ok(())
    }

    fn write_register(&self, reg: u8, value: u8) -> Result<(), DriverError<BUS::Error>> {
        let mut spi = self.bus.select(self.device)?;
        spi.write(&[reg & 0x7F, value])?;
        Ok(())
    }

    /// Trigger one conversion and wait for it.
    fn measure(&self) -> Result<Raw, DriverError<BUS::Error>> {
        self.write_register(REG_CTRL_MEAS, FORCED_X1)?;

        let mut polls = 0;
        while self.read_register(REG_STATUS)? & STATUS_MEASURING != 0 {
            polls += 1;
            if polls >= MEASURE_POLLS {
                return Err(DriverError::Timeout);
            }
        }

        let mut data = [0u8; 6];
        self.read_registers(REG_DATA, &mut data)?;
        Ok(Raw {
            pressure: raw20(&data[0..3]),
            temperature: raw20(&data[3..6]),
        })
    }
}

impl<BUS, CS> Barometer for Bmp280<'_, BUS, CS>
where
    BUS: BusConfig,
    CS: OutputPin,
{
    type Error = DriverError<BUS::Error>;

    fn read_temperature(&mut self) -> Result<i32, Self::Error> {
        let raw = self.measure()?;
        let t_fine = self.calibration.t_fine(raw.temperature);
        let millidegrees = self.calibration.millidegrees(t_fine);
        info!("temperature {} mC", millidegrees);
        Ok(millidegrees)
    }

    fn read_pressure(&mut self) -> Result<u32, Self::Error> {
        let raw = self.measure()?;
        let t_fine = self.calibration.t_fine(raw.temperature);
        let pascals = self
            .calibration
            .pressure_q24_8(t_fine, raw.pressure)
            .ok_or(DriverError::InvalidReading)?
            >> 8;
        info!("pressure {} Pa", pascals);
        Ok(pascals)
    }
}
