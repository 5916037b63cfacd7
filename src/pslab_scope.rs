use crate::calibration::{self, CalibrationError};
use crate::capture::{
    AbortHandle, AnalogFrame, CaptureError, CaptureLimits, CaptureOrchestrator,
    CaptureParameters, CaptureState, FrameSink, PollPolicy,
};
use crate::channel_model::{ChannelError, ChannelModel};
use crate::command_codec::{Command, CommandCodec, Param, ProtocolError};
use crate::serial_link::{Link, SerialLink};
use crate::waveform::{self, PwmSettings, WaveformError, WaveformPlan};
use polars::prelude::*;

const TIME_COLUMN_NAME: &str = "time";

#[derive(Debug, thiserror::Error)]
pub enum PslabScopeError {
    #[error("Calibration error: {0}")]
    Calibration(#[from] CalibrationError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),
}

/// A capture that ended early, with whatever frames were emitted before it
/// stopped. An abort during retrieval leaves a partial last frame.
#[derive(Debug, thiserror::Error)]
#[error("Capture failed after {} frame(s): {error}", .reading.frames.len())]
pub struct CaptureFailure {
    pub reading: ScopeReading,
    #[source]
    pub error: CaptureError,
}

/// Frames of one capture, in enabled-channel order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScopeReading {
    pub effective_samplerate: f64,
    pub frames: Vec<AnalogFrame>,
}

impl FrameSink for ScopeReading {
    fn send_frame(&mut self, frame: AnalogFrame) {
        self.frames.push(frame);
    }
}

impl ScopeReading {
    pub fn frame(&self, name: &str) -> Option<&AnalogFrame> {
        self.frames.iter().find(|f| f.name == name)
    }

    /// A `time` column in seconds plus one voltage column per channel.
    ///
    /// Frames cut short by a short read shorten every column to match.
    pub fn to_dataframe(&self) -> Result<DataFrame, PolarsError> {
        let rows = self
            .frames
            .iter()
            .map(|f| f.samples.len())
            .min()
            .unwrap_or(0);

        let time: Vec<f64> = (0..rows)
            .map(|i| i as f64 / self.effective_samplerate)
            .collect();
        let mut columns: Vec<Column> = vec![Series::new(TIME_COLUMN_NAME.into(), time).into()];
        for frame in &self.frames {
            columns.push(Series::new(frame.name.as_str().into(), &frame.samples[..rows]).into());
        }

        DataFrame::new(columns)
    }
}

/// A PSLab with no operation in flight.
pub struct IdlePslab<L: Link = SerialLink> {
    version: String,
    codec: CommandCodec<L>,
    channels: ChannelModel,
    limits: CaptureLimits,
    poll: PollPolicy,
}

impl<L: Link> std::fmt::Debug for IdlePslab<L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdlePslab")
            .field("version", &self.version)
            .field("limits", &self.limits)
            .field("poll", &self.poll)
            .finish_non_exhaustive()
    }
}

impl<L: Link> IdlePslab<L> {
    pub fn new(codec: CommandCodec<L>, version: String) -> Self {
        Self {
            version,
            codec,
            channels: ChannelModel::pslab(),
            limits: CaptureLimits::default(),
            poll: PollPolicy::default(),
        }
    }

    pub fn with_limits(mut self, limits: CaptureLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_poll_policy(mut self, poll: PollPolicy) -> Self {
        self.poll = poll;
        self
    }

    /// Version line the device reported when connecting.
    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn channels(&self) -> &ChannelModel {
        &self.channels
    }

    /// Switch the PGA in front of `channel` and use the new gain for scaling.
    ///
    /// The model only changes once the device has acknowledged.
    pub fn set_gain(&mut self, channel: &str, gain: u8) -> Result<(), PslabScopeError> {
        let id = self.channels.lookup(channel)?;
        let (pga, index) = calibration::select_gain(&self.channels, id, gain)?;
        log::debug!("Setting {} to gain {} (PGA {}, index {})", channel, gain, pga, index);

        self.codec.send_command(Command::SetPgaGain)?;
        self.codec.send_bytes(&[Param::U8(pga), Param::U8(index)])?;
        self.codec.await_ack()?;

        calibration::apply_gain(&mut self.channels, id, gain)?;
        Ok(())
    }

    pub fn set_resolution(&mut self, channel: &str, bits: u8) -> Result<(), CalibrationError> {
        let id = self.channels.lookup(channel)?;
        calibration::select_resolution(&mut self.channels, id, bits)
    }

    /// Validate `params` and hand the device to a capture the caller steps to
    /// completion. On invalid parameters the device comes back untouched.
    pub fn start_capture(
        self,
        params: CaptureParameters,
    ) -> Result<CapturingPslab<L>, (Self, CaptureError)> {
        let orchestrator = CaptureOrchestrator::new(params, self.limits, self.poll);
        let mut capturing = CapturingPslab {
            pslab: self,
            orchestrator,
            reading: ScopeReading::default(),
        };
        match capturing.advance() {
            Ok(_) => Ok(capturing),
            Err(e) => Err((capturing.pslab, e)),
        }
    }

    /// Run a whole capture cycle and return its frames.
    pub fn capture_sync(&mut self, params: CaptureParameters) -> Result<ScopeReading, CaptureFailure> {
        let mut orchestrator = CaptureOrchestrator::new(params, self.limits, self.poll);
        let mut reading = ScopeReading::default();
        let result = orchestrator.run(&mut self.codec, &mut self.channels, &mut reading);
        reading.effective_samplerate = orchestrator.session().effective_samplerate();
        match result {
            Ok(()) => Ok(reading),
            Err(error) => Err(CaptureFailure { reading, error }),
        }
    }

    pub fn generate_pwm(&mut self, settings: &PwmSettings) -> Result<WaveformPlan, WaveformError> {
        let plan = WaveformPlan::new(settings)?;
        waveform::encode_and_send(&mut self.codec, &plan)?;
        Ok(plan)
    }

    /// Drive the named outputs to static levels. Returns the state byte sent.
    pub fn set_digital_state(&mut self, states: &[(&str, bool)]) -> Result<u8, WaveformError> {
        let states = states
            .iter()
            .map(|&(name, high)| Ok((self.channels.lookup(name)?, high)))
            .collect::<Result<Vec<_>, ChannelError>>()?;
        waveform::set_digital_state(&mut self.codec, &self.channels, &states)
    }

    pub fn into_link(self) -> L {
        self.codec.into_link()
    }
}

/// A PSLab owned by a running capture.
pub struct CapturingPslab<L: Link = SerialLink> {
    pslab: IdlePslab<L>,
    orchestrator: CaptureOrchestrator,
    reading: ScopeReading,
}

impl<L: Link> std::fmt::Debug for CapturingPslab<L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapturingPslab")
            .field("pslab", &self.pslab)
            .field("orchestrator", &self.orchestrator)
            .finish_non_exhaustive()
    }
}

impl<L: Link> CapturingPslab<L> {
    pub fn state(&self) -> CaptureState {
        self.orchestrator.state()
    }

    pub fn abort_handle(&self) -> AbortHandle {
        self.orchestrator.abort_handle()
    }

    fn advance(&mut self) -> Result<CaptureState, CaptureError> {
        let result = self.orchestrator.step(
            &mut self.pslab.codec,
            &mut self.pslab.channels,
            &mut self.reading,
        );
        self.reading.effective_samplerate = self.orchestrator.session().effective_samplerate();
        result
    }

    fn fail(self, error: CaptureError) -> (IdlePslab<L>, CaptureFailure) {
        let failure = CaptureFailure {
            reading: self.reading,
            error,
        };
        (self.pslab, failure)
    }

    /// Perform one step of the capture.
    ///
    /// Hands back the idle device and the reading once the last frame is in,
    /// or `self` while the capture is still going. On failure the frames
    /// emitted so far come back inside the [`CaptureFailure`].
    pub fn try_get_result(
        mut self,
    ) -> Result<Result<(IdlePslab<L>, ScopeReading), CapturingPslab<L>>, (IdlePslab<L>, CaptureFailure)>
    {
        match self.advance() {
            Ok(CaptureState::Idle) => Ok(Ok((self.pslab, self.reading))),
            Ok(CaptureState::Aborted) => Err(self.fail(CaptureError::Aborted)),
            Ok(_) => Ok(Err(self)),
            Err(e) => Err(self.fail(e)),
        }
    }

    pub fn wait(self) -> Result<(IdlePslab<L>, ScopeReading), (IdlePslab<L>, CaptureFailure)> {
        let mut capturing = self;
        loop {
            match capturing.try_get_result()? {
                Ok(done) => return Ok(done),
                Err(still_capturing) => capturing = still_capturing,
            }
        }
    }

    /// Stop the capture. Frames emitted so far, including a partial one, are
    /// returned with the device.
    pub fn cancel(mut self) -> (IdlePslab<L>, ScopeReading) {
        self.orchestrator.abort_handle().abort();
        if let Err(e) = self.advance() {
            log::debug!("Capture cancelled: {}", e);
        }
        (self.pslab, self.reading)
    }
}
