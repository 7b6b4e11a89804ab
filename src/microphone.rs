//! I2S MEMS microphone as the capture front end.
//!
//! The node has an I2S microphone connected via:
//! - WS (word select / LRCLK) on GPIO8
//! - SD (serial data / DIN) on GPIO3
//! - DIO (bit clock / BCLK) on GPIO46
//!
//! Once streaming, the I2S peripheral writes into a circular DMA ring on its
//! own and raises RX done as data lands. The capture wait masks interrupts,
//! checks for a ready buffer and otherwise executes `waiti`, which unmasks and
//! halts the core in one instruction. After each wake the pending samples
//! are copied out of the ring into the slot the [`DoubleBuffer`] handed out.

use core::arch::asm;

use esp_hal::{
    Blocking,
    dma::DmaDescriptor,
    handler,
    i2s::master::{
        Channels,
        Config,
        ConfigError,
        DataFormat,
        Error,
        I2s,
        I2sInterrupt,
        I2sRx,
    },
    peripherals::I2S0,
    time::Rate,
};

use crate::{
    MicResources,
    capture::{
        DoubleBuffer,
        RingFeeder,
        Sleep,
    },
    config::CAPTURE_LEN,
};

/// Size of the circular DMA ring: four full descriptors.
pub const RING_BYTES: usize = 4 * 4092;

/// The streaming microphone as a capture front end.
///
/// [`CaptureDma`](crate::CaptureDma) and [`Sleep`] are implemented on
/// `&MicFrontEnd`, so one front end serves as both halves of an
/// [`AudioCapture`](crate::AudioCapture) pass.
pub type MicFrontEnd<'a, R> = RingFeeder<'a, R>;

#[handler]
fn rx_done() {
    // Waking the core is the whole job.
    let _ = I2S0::regs()
        .int_clr()
        .write(|w| w.rx_done().clear_bit_by_one());
}

/// The wired and configured I2S receiver.
pub struct Microphone<'d> {
    rx: I2sRx<'d, Blocking>,
}

impl<'d> Microphone<'d> {
    /// `sample_rate` is in Hz (e.g. 16000 for 16 kHz).
    /// `descriptors` must be a `&'static mut` slice; use
    /// [`mk_static!`](crate::mk_static) or a static array.
    pub fn new(
        res: MicResources<'d>,
        sample_rate: u32,
        descriptors: &'static mut [DmaDescriptor],
    ) -> Result<Self, ConfigError> {
        let mut i2s = I2s::new(
            res.i2s,
            res.dma,
            Config::new_tdm_philips()
                .with_sample_rate(Rate::from_hz(sample_rate))
                .with_data_format(DataFormat::Data16Channel16)
                .with_channels(Channels::MONO),
        )?;
        i2s.set_interrupt_handler(rx_done);
        i2s.listen(I2sInterrupt::RxDone);

        let rx = i2s
            .i2s_rx
            .with_bclk(res.dio)
            .with_ws(res.ws)
            .with_din(res.sd)
            .build(descriptors);

        Ok(Self { rx })
    }

    /// Start the circular transfer into `ring` and feed `buffer` from it.
    pub fn stream<'a>(
        &'a mut self,
        ring: &'static mut [u8],
        buffer: &'a DoubleBuffer<CAPTURE_LEN>,
    ) -> Result<MicFrontEnd<'a, impl FnMut(&mut [u8]) -> Result<usize, Error> + 'a>, Error> {
        let mut transfer = self.rx.read_dma_circular(ring)?;
        info!("microphone streaming");

        let ring = move |out: &mut [u8]| match transfer.available()? {
            0 => Ok(0),
            n => transfer.pop(&mut out[..n.min(out.len())]),
        };
        Ok(RingFeeder::new(ring, buffer))
    }
}

impl<R> Sleep for &RingFeeder<'_, R>
where
    R: FnMut(&mut [u8]) -> Result<usize, Error>,
{
    fn check_or_sleep<T>(&mut self, check: impl FnOnce() -> Option<T>) -> Option<T> {
        if let Err(e) = self.pump() {
            warn!("microphone ring: {:?}", e);
        }

        let token: u32;
        // SAFETY: raises the interrupt level; every path below restores it.
        unsafe { asm!("rsil {0}, 5", out(reg) token) };
        if let Some(ready) = check() {
            unsafe { asm!("wsr.ps {0}", "rsync", in(reg) token) };
            return Some(ready);
        }
        // Drops to level 0 and halts until the next interrupt.
        unsafe { asm!("waiti 0") };
        unsafe { asm!("wsr.ps {0}", "rsync", in(reg) token) };
        None
    }
}
