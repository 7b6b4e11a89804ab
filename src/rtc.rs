//! Ambiq AM1815 real-time clock over SPI.

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
        DriverError,
        WallClock,
    },
};

const REG_SECONDS: u8 = 0x01;
const REG_ID0: u8 = 0x28;
const PART_ID: u8 = 0x18;

/// Calendar time as kept by the chip, in UTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DateTime {
    pub year: u16,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
}

impl DateTime {
    /// Decode the seconds..years register block.
    fn from_registers(regs: &[u8; 6]) -> Option<Self> {
        let dt = Self {
            second: bcd(regs[0] & 0x7F)?,
            minute: bcd(regs[1] & 0x7F)?,
            hour: bcd(regs[2] & 0x3F)?,
            day: bcd(regs[3] & 0x3F)?,
            month: bcd(regs[4] & 0x1F)?,
            year: 2000 + u16::from(bcd(regs[5])?),
        };
        let valid = dt.second < 60
            && dt.minute < 60
            && dt.hour < 24
            && (1..=31).contains(&dt.day)
            && (1..=12).contains(&dt.month);
        valid.then_some(dt)
    }

    /// Seconds since 1970-01-01T00:00:00Z.
    pub fn unix_seconds(&self) -> u64 {
        let days = days_from_civil(self.year, self.month, self.day);
        days * 86_400
            + u64::from(self.hour) * 3_600
            + u64::from(self.minute) * 60
            + u64::from(self.second)
    }
}

fn bcd(value: u8) -> Option<u8> {
    let (tens, ones) = (value >> 4, value & 0x0F);
    (tens <= 9 && ones <= 9).then_some(tens * 10 + ones)
}

/// Days from 1970-01-01 to a proleptic Gregorian date at or after it.
fn days_from_civil(year: u16, month: u8, day: u8) -> u64 {
    // Count years from March so the leap day is the last day of the year.
    let year = u64::from(year) - u64::from(month <= 2);
    let era = year / 400;
    let year_of_era = year - era * 400;
    let month = u64::from(month);
    let shifted_month = if month > 2 { month - 3 } else { month + 9 };
    let day_of_year = (153 * shifted_month + 2) / 5 + u64::from(day) - 1;
    let day_of_era = year_of_era * 365 + year_of_era / 4 - year_of_era / 100 + day_of_year;
    era * 146_097 + day_of_era - 719_468
}

pub struct Am1815<'a, BUS, CS> {
    bus: &'a SharedBus<BUS, CS>,
    device: DeviceHandle,
}

impl<'a, BUS, CS> Am1815<'a, BUS, CS>
where
    BUS: BusConfig,
    CS: OutputPin,
{
    /// Check the part ID.
    pub fn new(
        bus: &'a SharedBus<BUS, CS>,
        device: DeviceHandle,
    ) -> Result<Self, DriverError<BUS::Error>> {
        let rtc = Self { bus, device };
        let id = rtc.read_register(REG_ID0)?;
        info!("RTC id {=u8:#x}", id);
        if id != PART_ID {
            return Err(DriverError::WrongId(id));
        }
        Ok(rtc)
    }

    pub fn read_register(&self, reg: u8) -> Result<u8, DriverError<BUS::Error>> {
        let mut value = [0u8];
        self.read_registers(reg, &mut value)?;
        Ok(value[0])
    }

    fn read_registers(&self, reg: u8, buf: &mut [u8]) -> Result<(), DriverError<BUS::Error>> {
        let mut spi = self.bus.select(self.device)?;
        spi.write(&[reg & 0x7F])?;
        spi.read(buf)?;
        Ok(())
    }

    /// Read the calendar registers in one burst, so they cannot roll over
    /// between bytes.
    pub fn read_time(&self) -> Result<DateTime, DriverError<BUS::Error>> {
        let mut regs = [0u8; 6];
        self.read_registers(REG_SECONDS, &mut regs)?;
        DateTime::from_registers(&regs).ok_or(DriverError::InvalidReading)
    }
}

impl<BUS, CS> WallClock for Am1815<'_, BUS, CS>
where
    BUS: BusConfig,
    CS: OutputPin,
{
    type Error = DriverError<BUS::Error>;

    fn now(&mut self) -> Result<u64, Self::Error> {
        let seconds = self.read_time()?.unix_seconds();
        debug!("time {}", seconds);
        Ok(seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::DeviceConfig,
        testing::shared_bus,
    };

    fn date(regs: [u8; 6]) -> u64 {
        DateTime::from_registers(&regs).unwrap().unix_seconds()
    }

    #[test]
    fn converts_calendar_to_unix_time() {
        assert_eq!(date([0x00, 0x00, 0x00, 0x01, 0x01, 0x00]), 946_684_800);
        assert_eq!(date([0x20, 0x13, 0x22, 0x14, 0x11, 0x23]), 1_700_000_000);
        assert_eq!(date([0x00, 0x00, 0x00, 0x29, 0x02, 0x24]), 1_709_164_800);
        assert_eq!(date([0x59, 0x59, 0x23, 0x31, 0x12, 0x99]), 4_102_444_799);
    }

    #[test]
    fn control_bits_are_masked_off() {
        // Oscillator-fail flag in seconds, century bits in hours.
        assert_eq!(date([0x80 | 0x20, 0x13, 0xC0 | 0x22, 0x14, 0x11, 0x23]), 1_700_000_000);
    }

    #[test]
    fn nonsense_registers_are_rejected() {
        assert_eq!(DateTime::from_registers(&[0x5A, 0, 0, 1, 1, 0]), None);
        assert_eq!(DateTime::from_registers(&[0x60, 0, 0, 1, 1, 0]), None);
        assert_eq!(DateTime::from_registers(&[0, 0, 0, 0, 1, 0]), None);
        assert_eq!(DateTime::from_registers(&[0, 0, 0, 1, 0x13, 0]), None);
    }

    #[test]
    fn reads_time_in_one_burst() {
        let (bus, shared, [dev]) = shared_bus([DeviceConfig::rtc()]);
        bus.respond(&[PART_ID]);
        let mut rtc = Am1815::new(&shared, dev).unwrap();
        bus.clear();

        bus.respond(&[0x20, 0x13, 0x22, 0x14, 0x11, 0x23]);
        assert_eq!(rtc.now(), Ok(1_700_000_000));
        assert_eq!(bus.written(), [vec![REG_SECONDS]]);
    }

    #[test]
    fn unknown_part_is_rejected() {
        let (bus, shared, [dev]) = shared_bus([DeviceConfig::rtc()]);
        bus.respond(&[0x00]);
        assert!(matches!(
            Am1815::new(&shared, dev),
            Err(DriverError::WrongId(0x00))
        ));
    }
}
