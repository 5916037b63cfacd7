use crate::calibration;
use crate::channel_model::{ChannelId, ChannelModel};

/// Number of inputs the capture trigger can watch.
pub const TRIGGER_SOURCES: u8 = 4;

#[derive(Debug, thiserror::Error)]
pub enum TriggerError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

/// Trigger fields as they go on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriggerFields {
    /// Timeout prescaler in the upper nibble, one-hot source in the lower.
    pub source: u8,
    /// Trigger level as a raw code of the source channel.
    pub level: u16,
}

#[derive(Debug)]
pub struct AnalogTriggerBuilder {
    channel: String,
    prescaler: u8,
}

impl AnalogTriggerBuilder {
    /// Timeout prescaler for the firmware's trigger wait, 0..=15.
    pub fn timeout_prescaler(mut self, prescaler: u8) -> Self {
        self.prescaler = prescaler;
        self
    }

    /// Start capturing once the channel rises through `volts`.
    pub fn rises_through(self, volts: f64) -> PendingAnalogTrigger {
        PendingAnalogTrigger {
            channel: self.channel,
            volts,
            prescaler: self.prescaler,
        }
    }
}

/// A trigger as the user describes it, by channel name and voltage.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingAnalogTrigger {
    pub channel: String,
    pub volts: f64,
    pub prescaler: u8,
}

impl PendingAnalogTrigger {
    /// Resolve the channel name against `model`.
    pub fn into_trigger(self, model: &ChannelModel) -> Result<AnalogTrigger, TriggerError> {
        let id = model
            .lookup(&self.channel)
            .map_err(|e| TriggerError::InvalidArgument(e.to_string()))?;
        let channel = model
            .get(id)
            .map_err(|e| TriggerError::InvalidArgument(e.to_string()))?;
        if channel.as_analog().is_none() || channel.index >= TRIGGER_SOURCES {
            return Err(TriggerError::InvalidArgument(format!(
                "channel {} cannot be used as a trigger source",
                self.channel
            )));
        }
        if self.prescaler > 0x0f {
            return Err(TriggerError::InvalidArgument(format!(
                "trigger timeout prescaler {} does not fit in 4 bits",
                self.prescaler
            )));
        }
        Ok(AnalogTrigger {
            channel: id,
            volts: self.volts,
            prescaler: self.prescaler,
        })
    }
}

/// Level trigger on one analog input, referring to the channel by id.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AnalogTrigger {
    pub channel: ChannelId,
    pub volts: f64,
    pub prescaler: u8,
}

impl AnalogTrigger {
    pub fn start_capturing_when(channel: &str) -> AnalogTriggerBuilder {
        AnalogTriggerBuilder {
            channel: channel.to_string(),
            prescaler: 0,
        }
    }

    /// Encode against the current capture.
    ///
    /// `channel_one` is the channel the capture command samples first; it
    /// always answers to source bit 0, every other input to its own index.
    /// The level is converted with the trigger channel's current gain.
    pub fn into_trigger_fields(
        &self,
        model: &ChannelModel,
        channel_one: ChannelId,
    ) -> Result<TriggerFields, TriggerError> {
        let channel = model
            .get(self.channel)
            .map_err(|e| TriggerError::InvalidArgument(e.to_string()))?;
        let analog = channel.as_analog().ok_or_else(|| {
            TriggerError::InvalidArgument(format!("channel {} is not analog", channel.name))
        })?;

        let bit = if self.channel == channel_one {
            0
        } else {
            channel.index
        };
        if bit >= TRIGGER_SOURCES {
            return Err(TriggerError::InvalidArgument(format!(
                "channel {} cannot be used as a trigger source",
                channel.name
            )));
        }

        Ok(TriggerFields {
            source: (self.prescaler << 4) | (1 << bit),
            level: calibration::unscale(analog, self.volts),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_resolves_channel() {
        let model = ChannelModel::pslab();
        let trigger = AnalogTrigger::start_capturing_when("CH3")
            .rises_through(1.0)
            .into_trigger(&model)
            .unwrap();
        assert_eq!(trigger.channel, model.lookup("CH3").unwrap());
        assert_eq!(trigger.prescaler, 0);
    }

    #[test]
    fn test_invalid_sources_are_rejected() {
        let model = ChannelModel::pslab();
        for name in ["CH7", "CAP", "SQ1"] {
            let result = AnalogTrigger::start_capturing_when(name)
                .rises_through(0.0)
                .into_trigger(&model);
            assert!(
                matches!(result, Err(TriggerError::InvalidArgument(_))),
                "{name} should be rejected"
            );
        }
        let result = AnalogTrigger::start_capturing_when("CH1")
            .timeout_prescaler(16)
            .rises_through(0.0)
            .into_trigger(&model);
        assert!(result.is_err());
    }

    #[test]
    fn test_channel_one_uses_bit_zero() {
        let model = ChannelModel::pslab();
        let ch3 = model.lookup("CH3").unwrap();
        let trigger = AnalogTrigger::start_capturing_when("CH3")
            .timeout_prescaler(2)
            .rises_through(0.0)
            .into_trigger(&model)
            .unwrap();

        // CH3 sampled first: bit 0 regardless of its index.
        let fields = trigger.into_trigger_fields(&model, ch3).unwrap();
        assert_eq!(fields.source, 0x21);

        // CH1 sampled first: CH3 answers to its natural index 2.
        let ch1 = model.lookup("CH1").unwrap();
        let fields = trigger.into_trigger_fields(&model, ch1).unwrap();
        assert_eq!(fields.source, 0x24);
    }

    #[test]
    fn test_level_is_scaled() {
        let model = ChannelModel::pslab();
        let ch1 = model.lookup("CH1").unwrap();
        let trigger = AnalogTrigger::start_capturing_when("CH1")
            .rises_through(16.5)
            .into_trigger(&model)
            .unwrap();
        let fields = trigger.into_trigger_fields(&model, ch1).unwrap();
        assert_eq!(fields.level, 0);

        let trigger = AnalogTrigger {
            volts: -16.5,
            ..trigger
        };
        assert_eq!(trigger.into_trigger_fields(&model, ch1).unwrap().level, 1023);
    }
}
