//! ESP32-S3 pin map, clock setup and the shared SPI bus.

use embedded_hal::spi::{
    self,
    ErrorKind,
    ErrorType,
    Phase,
    Polarity,
    SpiBus,
};
use esp_hal::{
    Blocking,
    assign_resources,
    clock::{
        Clock,
        CpuClock,
    },
    gpio::{
        AnyPin,
        Level,
        Output,
        OutputConfig,
    },
    rom,
    spi::{
        Mode,
        master::{
            Config,
            ConfigError,
            Spi,
        },
    },
    time::Rate,
};

use crate::{
    bus::{
        BusConfig,
        BusError,
        DeviceHandle,
        SharedBus,
    },
    config::DeviceConfig,
};

// ── Pin / peripheral assignments ────────────────────────────────────────────

assign_resources! {
    pub Resources<'d> {
        spi: SpiResources<'d> {
            sck: GPIO4,
            mosi: GPIO5,
            miso: GPIO16,
            flash_cs: GPIO6,
            barometer_cs: GPIO10,
            rtc_cs: GPIO7,
            spi: SPI2,
        },
        mic: MicResources<'d> {
            ws: GPIO8,
            sd: GPIO3,
            dio: GPIO46,
            i2s: I2S0,
            dma: DMA_CH1,
        },
        light: LightResources<'d> {
            pin: GPIO9,
            adc: ADC1,
        },
    }
}

// ── Board initialisation ────────────────────────────────────────────────────

/// Step the CPU down through the PLL divider before `esp_hal::init` takes
/// over; the bootloader leaves it at the wrong divider for a direct switch.
fn set_cpu_clock(cpu_clock_speed: CpuClock) {
    let _ = esp_hal::peripherals::SYSTEM::regs()
        .sysclk_conf()
        .modify(|_, w| unsafe { w.soc_clk_sel().bits(1) });
    let _ = esp_hal::peripherals::SYSTEM::regs()
        .cpu_per_conf()
        .modify(|_, w| unsafe {
            let _ = w.pll_freq_sel().set_bit();
            w.cpuperiod_sel().bits(match cpu_clock_speed {
                CpuClock::_80MHz => 0,
                CpuClock::_160MHz => 1,
                _ => 2,
            })
        });

    rom::ets_update_cpu_frequency_rom(cpu_clock_speed.frequency().as_mhz());
}

/// Initialise the node at its low-power clock and return the raw
/// peripheral set.
///
/// Call this once at the top of `main`, then break the peripherals into
/// resource groups with [`split_resources!`].
#[must_use]
pub fn init() -> esp_hal::peripherals::Peripherals {
    set_cpu_clock(CpuClock::_80MHz);
    let config = esp_hal::Config::default().with_cpu_clock(CpuClock::_80MHz);
    esp_hal::init(config)
}

impl From<esp_hal::peripherals::Peripherals> for Resources<'_> {
    fn from(peripherals: esp_hal::peripherals::Peripherals) -> Self {
        split_resources!(peripherals)
    }
}

// ── Shared SPI bus ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BoardSpiError {
    Transfer(esp_hal::spi::Error),
    /// The requested clock or mode is not reachable.
    Config(ConfigError),
}

impl spi::Error for BoardSpiError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::Transfer(e) => e.kind(),
            Self::Config(_) => ErrorKind::Other,
        }
    }
}

/// The SPI2 master, reconfigurable per device.
pub struct BoardSpi<'d> {
    spi: Spi<'d, Blocking>,
}

fn esp_mode(mode: spi::Mode) -> Mode {
    match (mode.polarity, mode.phase) {
        (Polarity::IdleLow, Phase::CaptureOnFirstTransition) => Mode::_0,
        (Polarity::IdleLow, Phase::CaptureOnSecondTransition) => Mode::_1,
        (Polarity::IdleHigh, Phase::CaptureOnFirstTransition) => Mode::_2,
        (Polarity::IdleHigh, Phase::CaptureOnSecondTransition) => Mode::_3,
    }
}

fn spi_config(device: DeviceConfig) -> Config {
    Config::default()
        .with_frequency(Rate::from_hz(device.clock_hz))
        .with_mode(esp_mode(device.mode))
}

impl ErrorType for BoardSpi<'_> {
    type Error = BoardSpiError;
}

impl SpiBus for BoardSpi<'_> {
    fn read(&mut self, words: &mut [u8]) -> Result<(), Self::Error> {
        SpiBus::read(&mut self.spi, words).map_err(BoardSpiError::Transfer)
    }

    fn write(&mut self, words: &[u8]) -> Result<(), Self::Error> {
        SpiBus::write(&mut self.spi, words).map_err(BoardSpiError::Transfer)
    }

    fn transfer(&mut self, read: &mut [u8], write: &[u8]) -> Result<(), Self::Error> {
        SpiBus::transfer(&mut self.spi, read, write).map_err(BoardSpiError::Transfer)
    }

    fn transfer_in_place(&mut self, words: &mut [u8]) -> Result<(), Self::Error> {
        SpiBus::transfer_in_place(&mut self.spi, words).map_err(BoardSpiError::Transfer)
    }

    fn flush(&mut self) -> Result<(), Self::Error> {
        SpiBus::flush(&mut self.spi).map_err(BoardSpiError::Transfer)
    }
}

impl BusConfig for BoardSpi<'_> {
    fn reconfigure(&mut self, clock_hz: u32, mode: spi::Mode) -> Result<(), Self::Error> {
        self.spi
            .apply_config(&spi_config(DeviceConfig::new(clock_hz, mode)))
            .map_err(BoardSpiError::Config)
    }
}

/// Handles for every device on the shared bus.
#[derive(Debug, Clone, Copy)]
pub struct BusDevices {
    pub flash: DeviceHandle,
    pub barometer: DeviceHandle,
    pub rtc: DeviceHandle,
}

pub type NodeBus<'d> = SharedBus<BoardSpi<'d>, Output<'d>>;

impl<'d> SpiResources<'d> {
    /// Bring up SPI2 and attach flash, barometer and RTC with their chip
    /// selects held inactive.
    pub fn into_shared_bus(self) -> Result<(NodeBus<'d>, BusDevices), BusError<BoardSpiError>> {
        let spi = Spi::new(self.spi, spi_config(DeviceConfig::flash()))
            .map_err(|e| BusError::Transport(BoardSpiError::Config(e)))?
            .with_sck(self.sck)
            .with_mosi(self.mosi)
            .with_miso(self.miso);

        let cs = |pin: AnyPin<'d>| Output::new(pin, Level::High, OutputConfig::default());
        let mut bus = SharedBus::new(BoardSpi { spi });
        let devices = BusDevices {
            flash: bus.attach(cs(self.flash_cs.into()), DeviceConfig::flash())?,
            barometer: bus.attach(cs(self.barometer_cs.into()), DeviceConfig::barometer())?,
            rtc: bus.attach(cs(self.rtc_cs.into()), DeviceConfig::rtc())?,
        };
        Ok((bus, devices))
    }
}
