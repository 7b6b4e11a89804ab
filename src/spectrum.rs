//! Dominant frequency of one capture buffer.

use microfft::real::rfft_1024;

use crate::config::CAPTURE_LEN;

/// Strongest non-DC bin of a transformed buffer.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SpectralPeak {
    /// Bin index, `1..=CAPTURE_LEN / 2`.
    pub bin: usize,
    /// Bin centre frequency, rounded down.
    pub frequency_hz: u32,
    /// Squared magnitude of the bin.
    pub power: f32,
}

/// Find the largest-magnitude bin of `samples`, ignoring DC.
///
/// Returns `None` when nothing but DC carries energy, such as an all-zero
/// buffer.
pub fn analyze(samples: &[i16; CAPTURE_LEN], sample_rate_hz: u32) -> Option<SpectralPeak> {
    let mut input = [0f32; CAPTURE_LEN];
    for (x, &s) in input.iter_mut().zip(samples) {
        *x = f32::from(s);
    }

    // Bin k lands at spectrum[k]; the real-valued Nyquist bin is packed into
    // the imaginary part of the DC slot.
    let spectrum = rfft_1024(&mut input);
    let nyquist = spectrum[0].im * spectrum[0].im;
    spectrum[0].im = 0.0;

    let (mut bin, mut power) = (0, 0.0);
    for (k, c) in spectrum.iter().enumerate().skip(1) {
        let p = c.norm_sqr();
        if p > power {
            (bin, power) = (k, p);
        }
    }
    if nyquist > power {
        (bin, power) = (CAPTURE_LEN / 2, nyquist);
    }

    if bin == 0 {
        return None;
    }

    Some(SpectralPeak {
        bin,
        frequency_hz: (bin as u64 * u64::from(sample_rate_hz) / CAPTURE_LEN as u64) as u32,
        power,
    })
}
