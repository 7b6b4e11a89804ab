//! Light sensor on an ADC1 channel.

use esp_hal::{
    Blocking,
    analog::adc::{
        Adc,
        AdcCalLine,
        AdcConfig,
        AdcPin,
        Attenuation,
    },
    peripherals::{
        ADC1,
        GPIO9,
    },
};

use crate::{
    LightResources,
    sensors::LightSensor,
};

type Calibration<'d> = AdcCalLine<ADC1<'d>>;

/// Photodiode amplifier output read through the line-calibrated ADC, so
/// readings come back in millivolts.
pub struct LightAdc<'d> {
    adc: Adc<'d, ADC1<'d>, Blocking>,
    pin: AdcPin<GPIO9<'d>, ADC1<'d>, Calibration<'d>>,
}

impl<'d> From<LightResources<'d>> for LightAdc<'d> {
    fn from(res: LightResources<'d>) -> Self {
        let mut config = AdcConfig::new();
        let pin = config.enable_pin_with_cal::<_, Calibration<'d>>(res.pin, Attenuation::_11dB);
        Self {
            adc: Adc::new(res.adc, config),
            pin,
        }
    }
}

impl LightSensor for LightAdc<'_> {
    type Error = ();

    fn read_light(&mut self) -> Result<u32, Self::Error> {
        let millivolts = nb::block!(self.adc.read_oneshot(&mut self.pin))?;
        info!("light {} mV", millivolts);
        Ok(u32::from(millivolts))
    }
}
