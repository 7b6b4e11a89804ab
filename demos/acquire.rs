//! One acquisition pass per boot: read every sensor, capture audio, append
//! everything to the flash logs, then deep-sleep until the next pass.

#![no_std]
#![no_main]

use core::time::Duration;

use defmt::{
    error,
    info,
    warn,
};
use esp_backtrace as _;
use esp_hal::{
    dma::DmaDescriptor,
    rtc_cntl::{
        Rtc,
        sleep::TimerWakeupSource,
    },
};
use esp_println as _;
#[allow(clippy::wildcard_imports)]
use sensornode::*;
use sensornode::{
    config::{
        CAPTURE_LEN,
        CaptureConfig,
        SAMPLE_RATE_HZ,
    },
    microphone::RING_BYTES,
};

esp_bootloader_esp_idf::esp_app_desc!();

/// Time between passes.
const PASS_INTERVAL: Duration = Duration::from_secs(600);
/// Low-power waits before a capture is given up. Each RX done interrupt is
/// one wait.
const CAPTURE_WAITS: u32 = 64;

static CAPTURE: DoubleBuffer<CAPTURE_LEN> = DoubleBuffer::new();

fn pass(res: Resources<'static>) -> Result<PassReport, ()> {
    let (bus, devices) = res
        .spi
        .into_shared_bus()
        .map_err(|e| error!("SPI bus: {}", e))?;

    let flash = SpiFlash::new(&bus, devices.flash).map_err(|e| error!("flash: {}", e))?;
    let barometer = Bmp280::new(&bus, devices.barometer).map_err(|e| error!("BMP280: {}", e))?;
    let clock = Am1815::new(&bus, devices.rtc).map_err(|e| error!("RTC: {}", e))?;

    let descriptors = mk_static!([DmaDescriptor; 8], [DmaDescriptor::EMPTY; 8]);
    let ring = mk_static!([u8; RING_BYTES], [0; RING_BYTES]);
    let mut microphone = Microphone::new(res.mic, SAMPLE_RATE_HZ, descriptors)
        .map_err(|e| error!("microphone: {}", e))?;
    let mic = microphone
        .stream(ring, &CAPTURE)
        .map_err(|e| error!("microphone DMA: {}", e))?;

    let mut node = Node {
        barometer,
        clock,
        light: LightAdc::from(res.light),
        capture: AudioCapture::new(
            &CAPTURE,
            CaptureConfig {
                max_sleeps: Some(CAPTURE_WAITS),
                ..CaptureConfig::default()
            },
        ),
        dma: &mic,
        sleep: &mic,
    };

    let mut store = FlashStore::new(flash);
    let mut mounted = mount_or_format(&mut store).map_err(|e| error!("no store: {}", e))?;
    node.acquire(&mut mounted)
        .map_err(|e| error!("pass aborted: {}", e))
}

#[esp_hal::main]
fn main() -> ! {
    let peripherals = sensornode::init();
    let mut rtc = Rtc::new(peripherals.LPWR);
    let resources = split_resources!(peripherals);

    if let Ok(report) = pass(resources) {
        if report.reformatted {
            warn!("store was reformatted; earlier logs are gone");
        }
        for sample in report.recorded() {
            info!("{} = {}", sample.metric.log_name(), sample.value);
        }
        for (metric, why) in report.skipped() {
            warn!("{} skipped: {}", metric.log_name(), why);
        }
    }

    info!("sleeping for {} s", PASS_INTERVAL.as_secs());
    rtc.sleep_deep(&[&TimerWakeupSource::new(PASS_INTERVAL)])
}
