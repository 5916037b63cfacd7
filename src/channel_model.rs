//! Static and mutable description of the channels of a PSLab device.
//!
//! Channels live in an arena owned by [`ChannelModel`] and are referred to by
//! [`ChannelId`]. Captures and triggers only ever hold ids, never copies.

/// Analog inputs as `(name, chosa, min input, max input, pga)`.
///
/// CH1 and CH2 sit behind inverting front-ends, so their minimum is the
/// positive end of the range.
const ANALOG_INPUTS: [(&str, u8, f64, f64, u8); 8] = [
    ("CH1", 3, 16.5, -16.5, 1),
    ("CH2", 0, 16.5, -16.5, 2),
    ("CH3", 1, -3.3, 3.3, 0),
    ("MIC", 2, -3.3, 3.3, 0),
    ("CAP", 5, 0.0, 3.3, 0),
    ("RES", 7, 0.0, 3.3, 0),
    ("VOL", 8, 0.0, 3.3, 0),
    ("AN4", 4, 0.0, 3.3, 0),
];

/// Square-wave / digital outputs as `(name, state mask)`.
const DIGITAL_OUTPUTS: [(&str, u8); 4] = [("SQ1", 0x10), ("SQ2", 0x20), ("SQ3", 0x40), ("SQ4", 0x80)];

pub const DEFAULT_RESOLUTION_BITS: u8 = 10;

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Channel {0} not found")]
    NotFound(String),

    #[error("Channel id {0} does not exist")]
    UnknownId(usize),

    #[error("Channel {0} is not an analog channel")]
    NotAnalog(String),

    #[error("Channel {0} is not a logic channel")]
    NotLogic(String),

    #[error("Buffer offset for channel {0} does not fit the device buffer")]
    OffsetOverflow(String),
}

/// Stable index of a channel inside its [`ChannelModel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(usize);

impl ChannelId {
    pub fn index(&self) -> usize {
        self.0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AnalogChannel {
    /// Hardware selector code sent with capture commands.
    pub chosa: u8,
    pub min_input: f64,
    pub max_input: f64,
    gain: u8,
    pga: u8,
    resolution: u16,
    buffer_offset: Option<u16>,
}

impl AnalogChannel {
    fn new(chosa: u8, min_input: f64, max_input: f64, pga: u8) -> Self {
        Self {
            chosa,
            min_input,
            max_input,
            gain: 1,
            pga,
            resolution: (1 << DEFAULT_RESOLUTION_BITS) - 1,
            buffer_offset: None,
        }
    }

    pub fn gain(&self) -> u8 {
        self.gain
    }

    /// Id of the programmable-gain amplifier in front of this input, 0 if none.
    pub fn pga(&self) -> u8 {
        self.pga
    }

    pub fn is_pga_capable(&self) -> bool {
        self.pga != 0
    }

    /// Largest raw code the ADC produces for this channel.
    pub fn resolution(&self) -> u16 {
        self.resolution
    }

    /// Start of this channel's samples in the device buffer, once a capture
    /// has been configured.
    pub fn buffer_offset(&self) -> Option<u16> {
        self.buffer_offset
    }

    pub(crate) fn set_gain(&mut self, gain: u8) {
        self.gain = gain;
    }

    pub(crate) fn set_resolution_bits(&mut self, bits: u8) {
        self.resolution = (1u16 << bits) - 1;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogicChannel {
    /// Bit set in the digital state byte to drive this output statically.
    pub state_mask: u8,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChannelKind {
    Analog(AnalogChannel),
    Logic(LogicChannel),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Channel {
    pub name: String,
    /// Position among the channels of the same kind.
    pub index: u8,
    pub kind: ChannelKind,
}

impl Channel {
    pub fn as_analog(&self) -> Option<&AnalogChannel> {
        match &self.kind {
            ChannelKind::Analog(analog) => Some(analog),
            ChannelKind::Logic(_) => None,
        }
    }

    pub fn as_logic(&self) -> Option<&LogicChannel> {
        match &self.kind {
            ChannelKind::Logic(logic) => Some(logic),
            ChannelKind::Analog(_) => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChannelModel {
    channels: Vec<Channel>,
    enabled: Vec<ChannelId>,
}

impl Default for ChannelModel {
    fn default() -> Self {
        Self::pslab()
    }
}

impl ChannelModel {
    /// Channel layout of the PSLab v5/v6 boards.
    pub fn pslab() -> Self {
        let analog = ANALOG_INPUTS
            .iter()
            .enumerate()
            .map(|(i, &(name, chosa, min, max, pga))| Channel {
                name: name.to_string(),
                index: i as u8,
                kind: ChannelKind::Analog(AnalogChannel::new(chosa, min, max, pga)),
            });
        let logic = DIGITAL_OUTPUTS
            .iter()
            .enumerate()
            .map(|(i, &(name, state_mask))| Channel {
                name: name.to_string(),
                index: i as u8,
                kind: ChannelKind::Logic(LogicChannel { state_mask }),
            });

        Self {
            channels: analog.chain(logic).collect(),
            enabled: Vec::new(),
        }
    }

    pub fn lookup(&self, name: &str) -> Result<ChannelId, ChannelError> {
        self.channels
            .iter()
            .position(|c| c.name == name)
            .map(ChannelId)
            .ok_or_else(|| ChannelError::NotFound(name.to_string()))
    }

    pub fn get(&self, id: ChannelId) -> Result<&Channel, ChannelError> {
        self.channels.get(id.0).ok_or(ChannelError::UnknownId(id.0))
    }

    pub fn analog(&self, id: ChannelId) -> Result<&AnalogChannel, ChannelError> {
        let channel = self.get(id)?;
        channel
            .as_analog()
            .ok_or_else(|| ChannelError::NotAnalog(channel.name.clone()))
    }

    pub(crate) fn analog_mut(&mut self, id: ChannelId) -> Result<&mut AnalogChannel, ChannelError> {
        let channel = self
            .channels
            .get_mut(id.0)
            .ok_or(ChannelError::UnknownId(id.0))?;
        match &mut channel.kind {
            ChannelKind::Analog(analog) => Ok(analog),
            ChannelKind::Logic(_) => Err(ChannelError::NotAnalog(channel.name.clone())),
        }
    }

    pub fn logic(&self, id: ChannelId) -> Result<&LogicChannel, ChannelError> {
        let channel = self.get(id)?;
        channel
            .as_logic()
            .ok_or_else(|| ChannelError::NotLogic(channel.name.clone()))
    }

    pub fn iter(&self) -> impl Iterator<Item = (ChannelId, &Channel)> {
        self.channels.iter().enumerate().map(|(i, c)| (ChannelId(i), c))
    }

    pub fn analog_channels(&self) -> impl Iterator<Item = (ChannelId, &Channel)> {
        self.iter().filter(|(_, c)| c.as_analog().is_some())
    }

    pub fn logic_channels(&self) -> impl Iterator<Item = (ChannelId, &Channel)> {
        self.iter().filter(|(_, c)| c.as_logic().is_some())
    }

    pub fn enabled(&self) -> &[ChannelId] {
        &self.enabled
    }

    /// Replace the enabled set. Every buffer offset goes back to unassigned.
    pub fn configure(&mut self, enabled: &[ChannelId]) -> Result<(), ChannelError> {
        for id in enabled {
            self.get(*id)?;
        }
        self.clear_offsets();
        self.enabled = enabled.to_vec();
        Ok(())
    }

    /// Assign each enabled analog channel `position × sample_count` as its
    /// buffer offset, in enabled-list order.
    pub fn assign_offsets(&mut self, sample_count: u16) -> Result<(), ChannelError> {
        let enabled = self.enabled.clone();
        for (position, id) in enabled.into_iter().enumerate() {
            let name = self.get(id)?.name.clone();
            let ChannelKind::Analog(analog) = &mut self.channels[id.0].kind else {
                continue;
            };
            let offset = u16::try_from(position * usize::from(sample_count))
                .map_err(|_| ChannelError::OffsetOverflow(name))?;
            analog.buffer_offset = Some(offset);
        }
        Ok(())
    }

    pub fn clear_offsets(&mut self) {
        for channel in &mut self.channels {
            if let ChannelKind::Analog(analog) = &mut channel.kind {
                analog.buffer_offset = None;
            }
        }
    }
}
