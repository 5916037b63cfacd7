//! Four-channel square-wave (PWM) generation and static digital outputs.

use crate::channel_model::{ChannelError, ChannelId, ChannelModel};
use crate::command_codec::{Command, CommandCodec, Param, ProtocolError};
use crate::serial_link::Link;

/// Main clock of the waveform timers.
pub const CLOCK_RATE: f64 = 64_000_000.0;

/// Timer prescalers, in the order the firmware indexes them.
pub const PRESCALERS: [u32; 4] = [1, 8, 64, 256];

pub const PWM_CHANNELS: usize = 4;

/// `(min, max, step)` of the settable output quantities.
pub const OUTPUT_FREQUENCY_MIN_MAX_STEP: (f64, f64, f64) = (10.0, 10_000_000.0, 1.0);
pub const DUTY_CYCLE_MIN_MAX_STEP: (f64, f64, f64) = (0.0, 100.0, 0.001);
pub const PHASE_MIN_MAX_STEP: (f64, f64, f64) = (0.0, 360.0, 0.001);

/// Keep the outputs running instead of emitting a single period.
const CONTINUOUS: u8 = 1 << 5;

#[derive(Debug, thiserror::Error)]
pub enum WaveformError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),
}

/// Pick the smallest prescaler whose wavelength fits the 16-bit timer.
///
/// Returns `(wavelength, prescaler)` where the wavelength is the number of
/// timer ticks per table entry.
pub fn compute_timing(frequency: f64, table_size: u32) -> Result<(u16, u32), WaveformError> {
    if !frequency.is_finite() || frequency <= 0.0 || table_size == 0 {
        return Err(WaveformError::InvalidArgument(format!(
            "cannot generate {} Hz with a table of {} entries",
            frequency, table_size
        )));
    }

    for prescaler in PRESCALERS {
        let wavelength =
            (CLOCK_RATE / frequency / f64::from(prescaler) / f64::from(table_size)).round();
        if wavelength > 0.0 && wavelength < 65536.0 {
            log::debug!(
                "{} Hz: wavelength {}, prescaler {}",
                frequency,
                wavelength,
                prescaler
            );
            return Ok((wavelength as u16, prescaler));
        }
    }

    Err(WaveformError::InvalidArgument(format!(
        "frequency {} Hz is out of range for every prescaler",
        frequency
    )))
}

/// Convert fractions of a period into timer ticks.
///
/// Returns `(duty, phase)`. The duty word marks where the high time ends,
/// `frac(duty + phase)` into the period; the phase word marks where it
/// starts. A non-zero duty request never rounds down to zero ticks.
pub fn quantize_duty_phase(duty: f64, phase: f64, wavelength: u16) -> (u16, u16) {
    let wl = f64::from(wavelength);
    let duty = duty.clamp(0.0, 1.0 - 1.0 / wl.max(1.0));
    let phase = phase.clamp(0.0, 1.0);

    let end = ((duty + phase) % 1.0 * wl) as u16;
    let mut duty_ticks = end.saturating_sub(1);
    if duty > 0.0 {
        duty_ticks = duty_ticks.max(1);
    }
    let phase_ticks = ((phase % 1.0) * wl) as u16;

    (duty_ticks, phase_ticks.saturating_sub(1))
}

/// Duty cycle and phase of one output, as fractions of a period.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PwmChannel {
    pub duty_cycle: f64,
    pub phase: f64,
}

/// User-facing settings of the square-wave outputs SQ1..SQ4.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PwmSettings {
    frequency: Option<f64>,
    channels: [PwmChannel; PWM_CHANNELS],
}

fn check_range(what: &str, value: f64, (min, max, _): (f64, f64, f64)) -> Result<(), WaveformError> {
    if !(min..=max).contains(&value) {
        return Err(WaveformError::InvalidArgument(format!(
            "{} {} outside {}..={}",
            what, value, min, max
        )));
    }
    Ok(())
}

impl PwmSettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frequency(&self) -> Option<f64> {
        self.frequency
    }

    pub fn set_frequency(&mut self, hz: f64) -> Result<(), WaveformError> {
        check_range("output frequency", hz, OUTPUT_FREQUENCY_MIN_MAX_STEP)?;
        self.frequency = Some(hz);
        Ok(())
    }

    fn slot(model: &ChannelModel, name: &str) -> Result<usize, WaveformError> {
        let id = model.lookup(name)?;
        model.logic(id)?;
        Ok(usize::from(model.get(id)?.index))
    }

    /// Duty cycle of output `name` in percent.
    pub fn duty_cycle(&self, model: &ChannelModel, name: &str) -> Result<f64, WaveformError> {
        Ok(self.channels[Self::slot(model, name)?].duty_cycle * 100.0)
    }

    pub fn set_duty_cycle(
        &mut self,
        model: &ChannelModel,
        name: &str,
        percent: f64,
    ) -> Result<(), WaveformError> {
        check_range("duty cycle", percent, DUTY_CYCLE_MIN_MAX_STEP)?;
        self.channels[Self::slot(model, name)?].duty_cycle = percent / 100.0;
        Ok(())
    }

    /// Phase of output `name` in degrees.
    pub fn phase(&self, model: &ChannelModel, name: &str) -> Result<f64, WaveformError> {
        Ok(self.channels[Self::slot(model, name)?].phase * 360.0)
    }

    pub fn set_phase(
        &mut self,
        model: &ChannelModel,
        name: &str,
        degrees: f64,
    ) -> Result<(), WaveformError> {
        check_range("phase", degrees, PHASE_MIN_MAX_STEP)?;
        self.channels[Self::slot(model, name)?].phase = degrees / 360.0;
        Ok(())
    }

    pub fn channels(&self) -> &[PwmChannel; PWM_CHANNELS] {
        &self.channels
    }
}

/// Timer words for one configuration of the four outputs.
#[derive(Debug, Clone, PartialEq)]
pub struct WaveformPlan {
    pub frequency: f64,
    pub wavelength: u16,
    pub prescaler: u32,
    pub prescaler_index: u8,
    pub duty: [u16; PWM_CHANNELS],
    pub phase: [u16; PWM_CHANNELS],
}

impl WaveformPlan {
    pub fn new(settings: &PwmSettings) -> Result<Self, WaveformError> {
        let frequency = settings.frequency.ok_or_else(|| {
            WaveformError::InvalidArgument("output frequency not set".to_string())
        })?;
        let (wavelength, prescaler) = compute_timing(frequency, 1)?;
        let prescaler_index = PRESCALERS
            .iter()
            .position(|&p| p == prescaler)
            .ok_or_else(|| WaveformError::InvalidArgument(format!("prescaler {}", prescaler)))?
            as u8;

        let mut duty = [0; PWM_CHANNELS];
        let mut phase = [0; PWM_CHANNELS];
        for (i, channel) in settings.channels.iter().enumerate() {
            (duty[i], phase[i]) = quantize_duty_phase(channel.duty_cycle, channel.phase, wavelength);
            log::debug!("SQ{}: duty {} ticks, phase {} ticks", i + 1, duty[i], phase[i]);
        }

        Ok(Self {
            frequency,
            wavelength,
            prescaler,
            prescaler_index,
            duty,
            phase,
        })
    }

    /// Timer words in wire order. SQ1 is the phase reference, so its phase
    /// is not sent.
    pub fn words(&self) -> [u16; 8] {
        [
            self.wavelength - 1,
            self.duty[0],
            self.phase[1],
            self.duty[1],
            self.phase[2],
            self.duty[2],
            self.phase[3],
            self.duty[3],
        ]
    }

    pub fn prescaler_byte(&self) -> u8 {
        self.prescaler_index | CONTINUOUS
    }
}

/// Send `plan` to the device and wait for the ACK.
pub fn encode_and_send<L: Link>(
    codec: &mut CommandCodec<L>,
    plan: &WaveformPlan,
) -> Result<(), WaveformError> {
    let _span = tracing::debug_span!("generate_pwm", frequency = plan.frequency).entered();

    codec.send_command(Command::Sqr4)?;
    let words: Vec<Param> = plan.words().into_iter().map(Param::U16).collect();
    codec.send_bytes(&words)?;
    codec.send_bytes(&[Param::U8(plan.prescaler_byte())])?;
    codec.await_ack().map_err(|e| {
        log::error!("Did not receive ACK for PWM generate commands");
        e
    })?;
    Ok(())
}

/// Digital state byte: each listed output contributes its mask plus its level
/// at its own bit.
pub fn compose_state(model: &ChannelModel, states: &[(ChannelId, bool)]) -> Result<u8, WaveformError> {
    let mut byte = 0u8;
    for &(id, high) in states {
        let mask = model.logic(id)?.state_mask;
        let index = model.get(id)?.index;
        byte |= mask | (u8::from(high) << index);
    }
    Ok(byte)
}

/// Drive the listed outputs to static levels.
pub fn set_digital_state<L: Link>(
    codec: &mut CommandCodec<L>,
    model: &ChannelModel,
    states: &[(ChannelId, bool)],
) -> Result<u8, WaveformError> {
    let byte = compose_state(model, states)?;
    log::debug!("Setting digital state {:#04x}", byte);

    codec.send_command(Command::SetState)?;
    codec.send_bytes(&[Param::U8(byte)])?;
    codec.await_ack().map_err(|e| {
        log::error!("Did not receive ACK for set state");
        e
    })?;
    Ok(byte)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serial_link::mock::MockLink;

    #[test]
    fn test_compute_timing_1khz() {
        assert_eq!(compute_timing(1000.0, 1).unwrap(), (64000, 1));
    }

    #[test]
    fn test_compute_timing_needs_larger_prescaler() {
        let (wavelength, prescaler) = compute_timing(10.0, 1).unwrap();
        assert!(prescaler > 1);
        assert_eq!((wavelength, prescaler), (25000, 256));

        assert_eq!(compute_timing(500.0, 1).unwrap(), (16000, 8));
    }

    #[test]
    fn test_compute_timing_out_of_range() {
        for frequency in [0.5, 1e9, 0.0, -5.0, f64::NAN] {
            assert!(
                matches!(compute_timing(frequency, 1), Err(WaveformError::InvalidArgument(_))),
                "{frequency} Hz should be rejected"
            );
        }
        assert!(compute_timing(1000.0, 0).is_err());
    }

    #[test]
    fn test_quantize_duty_phase() {
        assert_eq!(quantize_duty_phase(0.5, 0.0, 100), (49, 0));
        assert_eq!(quantize_duty_phase(0.5, 0.25, 100), (74, 24));
        // High time wraps past the end of the period.
        assert_eq!(quantize_duty_phase(0.5, 0.75, 100), (24, 74));
        assert_eq!(quantize_duty_phase(0.0, 0.0, 100), (0, 0));
    }

    #[test]
    fn test_quantize_small_duty_is_not_zero() {
        assert_eq!(quantize_duty_phase(0.001, 0.0, 100), (1, 0));
    }

    #[test]
    fn test_quantize_stays_below_wavelength() {
        for wavelength in [2u16, 3, 100, 64000] {
            for step in 0..=20 {
                let duty = f64::from(step) / 20.0;
                for phase_step in 0..=20 {
                    let phase = f64::from(phase_step) / 20.0;
                    let (d, p) = quantize_duty_phase(duty, phase, wavelength);
                    assert!(d < wavelength && p < wavelength);
                }
            }
        }
    }

    #[test]
    fn test_settings_validation() {
        let model = ChannelModel::pslab();
        let mut settings = PwmSettings::new();
        assert!(settings.set_frequency(5.0).is_err());
        assert!(settings.set_frequency(20e6).is_err());
        assert!(settings.set_duty_cycle(&model, "SQ1", 100.5).is_err());
        assert!(settings.set_phase(&model, "SQ2", 361.0).is_err());
        assert!(matches!(
            settings.set_duty_cycle(&model, "CH1", 50.0),
            Err(WaveformError::Channel(ChannelError::NotLogic(_)))
        ));

        settings.set_duty_cycle(&model, "SQ3", 25.0).unwrap();
        settings.set_phase(&model, "SQ3", 90.0).unwrap();
        assert_eq!(settings.duty_cycle(&model, "SQ3").unwrap(), 25.0);
        assert_eq!(settings.phase(&model, "SQ3").unwrap(), 90.0);
        assert_eq!(settings.channels()[2].phase, 0.25);
    }

    #[test]
    fn test_plan_requires_frequency() {
        assert!(matches!(
            WaveformPlan::new(&PwmSettings::new()),
            Err(WaveformError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_encode_and_send() {
        let model = ChannelModel::pslab();
        let mut settings = PwmSettings::new();
        settings.set_frequency(1000.0).unwrap();
        for name in ["SQ1", "SQ2", "SQ3", "SQ4"] {
            settings.set_duty_cycle(&model, name, 50.0).unwrap();
        }
        settings.set_phase(&model, "SQ2", 90.0).unwrap();

        let plan = WaveformPlan::new(&settings).unwrap();
        assert_eq!(plan.wavelength, 64000);
        assert_eq!(plan.prescaler_index, 0);
        assert_eq!(plan.words(), [63999, 31999, 15999, 47999, 0, 31999, 0, 31999]);

        let mut link = MockLink::new();
        link.queue(&[0x01]);
        let mut codec = CommandCodec::new(link);
        encode_and_send(&mut codec, &plan).unwrap();

        let written = codec.into_link().written;
        assert_eq!(&written[..2], &[0x07, 0x07]);
        assert_eq!(&written[2..4], &63999u16.to_le_bytes());
        assert_eq!(written.len(), 2 + 16 + 1);
        assert_eq!(written[18], 0x20);
    }

    #[test]
    fn test_encode_and_send_without_ack() {
        let mut settings = PwmSettings::new();
        settings.set_frequency(10.0).unwrap();
        let plan = WaveformPlan::new(&settings).unwrap();
        assert_eq!(plan.prescaler_byte(), 0x23);

        let mut codec = CommandCodec::new(MockLink::new());
        assert!(matches!(
            encode_and_send(&mut codec, &plan),
            Err(WaveformError::Protocol(ProtocolError::NoAck { .. }))
        ));
    }

    #[test]
    fn test_set_digital_state() {
        let model = ChannelModel::pslab();
        let sq1 = model.lookup("SQ1").unwrap();
        let sq3 = model.lookup("SQ3").unwrap();

        let mut link = MockLink::new();
        link.queue(&[0x01]);
        let mut codec = CommandCodec::new(link);
        let byte = set_digital_state(&mut codec, &model, &[(sq1, true), (sq3, false)]).unwrap();
        assert_eq!(byte, 0x51);
        assert_eq!(codec.into_link().written, vec![0x08, 0x01, 0x51]);

        let ch1 = model.lookup("CH1").unwrap();
        assert!(compose_state(&model, &[(ch1, true)]).is_err());
    }
}
