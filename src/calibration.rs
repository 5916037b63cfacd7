//! Linear conversion between raw ADC codes and volts.

use crate::channel_model::{AnalogChannel, ChannelError, ChannelId, ChannelModel};

/// Gains the PGA can be switched to, in the order the firmware indexes them.
pub const GAIN_VALUES: [u8; 8] = [1, 2, 4, 5, 8, 10, 16, 32];

/// ADC bit depths the PGA channels can be captured with.
pub const RESOLUTION_BITS: [u8; 2] = [10, 12];

#[derive(Debug, thiserror::Error)]
pub enum CalibrationError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error(transparent)]
    Channel(#[from] ChannelError),
}

/// `volts = slope * raw + intercept` for one channel at its current gain and
/// resolution.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinearCalibration {
    slope: f64,
    intercept: f64,
    resolution: u16,
}

impl LinearCalibration {
    pub fn for_channel(channel: &AnalogChannel) -> Self {
        let gain = f64::from(channel.gain());
        let resolution = channel.resolution();
        Self {
            slope: (channel.max_input - channel.min_input) / f64::from(resolution) / gain,
            intercept: channel.min_input / gain,
            resolution,
        }
    }

    pub fn scale(&self, raw: u16) -> f64 {
        self.slope * f64::from(raw) + self.intercept
    }

    /// Inverse of [`scale`](Self::scale). Voltages outside the representable
    /// range saturate at `0` or the resolution.
    pub fn unscale(&self, volts: f64) -> u16 {
        let raw = ((volts - self.intercept) / self.slope).round();
        raw.clamp(0.0, f64::from(self.resolution)) as u16
    }
}

/// Convert a raw code from `channel` to volts.
pub fn scale(channel: &AnalogChannel, raw: u16) -> f64 {
    LinearCalibration::for_channel(channel).scale(raw)
}

/// Convert volts to the raw code `channel` would report.
pub fn unscale(channel: &AnalogChannel, volts: f64) -> u16 {
    LinearCalibration::for_channel(channel).unscale(volts)
}

/// Position of `gain` in [`GAIN_VALUES`].
pub fn gain_index(gain: u8) -> Result<u8, CalibrationError> {
    GAIN_VALUES
        .iter()
        .position(|&g| g == gain)
        .map(|i| i as u8)
        .ok_or_else(|| {
            CalibrationError::InvalidArgument(format!(
                "gain {} is not one of {:?}",
                gain, GAIN_VALUES
            ))
        })
}

fn pga_channel(model: &ChannelModel, id: ChannelId) -> Result<&AnalogChannel, CalibrationError> {
    let channel = model.get(id)?;
    match channel.as_analog() {
        Some(analog) if analog.is_pga_capable() => Ok(analog),
        _ => Err(CalibrationError::InvalidArgument(format!(
            "channel {} has no programmable gain amplifier",
            channel.name
        ))),
    }
}

/// Check that `gain` can be applied to channel `id`.
///
/// Returns the PGA id and the gain index to send to the device. The model is
/// left untouched; use [`apply_gain`] once the device has acknowledged.
pub fn select_gain(
    model: &ChannelModel,
    id: ChannelId,
    gain: u8,
) -> Result<(u8, u8), CalibrationError> {
    let index = gain_index(gain)?;
    let analog = pga_channel(model, id)?;
    Ok((analog.pga(), index))
}

/// Record a gain the device is now using for channel `id`.
pub fn apply_gain(model: &mut ChannelModel, id: ChannelId, gain: u8) -> Result<(), CalibrationError> {
    select_gain(model, id, gain)?;
    model.analog_mut(id)?.set_gain(gain);
    Ok(())
}

/// Switch the ADC bit depth used when scaling channel `id`.
pub fn select_resolution(
    model: &mut ChannelModel,
    id: ChannelId,
    bits: u8,
) -> Result<(), CalibrationError> {
    if !RESOLUTION_BITS.contains(&bits) {
        return Err(CalibrationError::InvalidArgument(format!(
            "resolution of {} bits is not one of {:?}",
            bits, RESOLUTION_BITS
        )));
    }
    pga_channel(model, id)?;
    model.analog_mut(id)?.set_resolution_bits(bits);
    Ok(())
}
