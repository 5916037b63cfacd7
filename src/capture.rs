//! Oscilloscope capture cycle.
//!
//! One cycle runs through
//! `Configuring → Triggering? → Capturing → Polling → Retrieving ⇄ Emitting → Idle`.
//! [`CaptureOrchestrator::step`] performs the work of exactly one state and
//! moves to the next, so a host event loop can drive a capture by calling it
//! whenever the link is readable. Any failure moves the machine to
//! [`CaptureState::Aborted`] and hands the error back.

use crate::calibration::LinearCalibration;
use crate::channel_model::{ChannelError, ChannelId, ChannelModel};
use crate::command_codec::{Command, CommandCodec, Param, ProtocolError};
use crate::serial_link::Link;
use crate::trigger_config::{AnalogTrigger, TriggerError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Samples the device buffer holds, shared by all captured channels.
pub const DEVICE_CAPACITY: u32 = 10_000;
pub const MIN_SAMPLES: u16 = 10;
pub const MAX_CHANNELS: usize = 4;

/// Tick rate of the timing word sent with capture commands.
pub const TIMER_CLOCK: f64 = 8_000_000.0;

/// Set on the selector byte when the capture waits for the trigger.
const TRIGGER_FLAG: u8 = 0x80;

/// Shortest sample interval in timer ticks per mode, untriggered then triggered.
const MIN_TIMEGAP_TICKS: [[u16; 3]; 2] = [[4, 7, 14], [6, 8, 16]];

#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("Invalid capture parameters: {0}")]
    InvalidParameters(String),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Capture did not complete within {0:?}")]
    Timeout(Duration),

    #[error("Capture aborted")]
    Aborted,

    #[error("Trigger error: {0}")]
    Trigger(#[from] TriggerError),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),
}

/// Which capture command the device runs, picked from the channel count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureMode {
    One,
    Two,
    Four,
}

impl CaptureMode {
    pub fn for_channel_count(count: usize) -> Option<Self> {
        match count {
            1 => Some(Self::One),
            2 => Some(Self::Two),
            3 | 4 => Some(Self::Four),
            _ => None,
        }
    }

    pub fn command(&self) -> Command {
        match self {
            Self::One => Command::CaptureOne,
            Self::Two => Command::CaptureTwo,
            Self::Four => Command::CaptureFour,
        }
    }

    fn table_index(&self) -> usize {
        match self {
            Self::One => 0,
            Self::Two => 1,
            Self::Four => 2,
        }
    }
}

/// Device limits a capture is validated against.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CaptureLimits {
    pub capacity: u32,
    pub min_samples: u16,
    /// `[untriggered, triggered]` shortest interval per mode, in timer ticks.
    pub min_timegap_ticks: [[u16; 3]; 2],
}

impl Default for CaptureLimits {
    fn default() -> Self {
        Self {
            capacity: DEVICE_CAPACITY,
            min_samples: MIN_SAMPLES,
            min_timegap_ticks: MIN_TIMEGAP_TICKS,
        }
    }
}

impl CaptureLimits {
    pub fn max_sample_count(&self, channels: usize) -> u32 {
        self.capacity / channels.max(1) as u32
    }

    pub fn max_samplerate(&self, mode: CaptureMode, triggered: bool) -> f64 {
        let ticks = self.min_timegap_ticks[usize::from(triggered)][mode.table_index()];
        TIMER_CLOCK / f64::from(ticks)
    }

    /// Slowest rate the 16-bit timing word can express.
    pub fn min_samplerate(&self) -> f64 {
        TIMER_CLOCK / f64::from(u16::MAX)
    }
}

/// How long the status poll may spin before the capture is given up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    /// Added on top of the nominal acquisition time.
    pub margin: Duration,
    /// Pause between status queries.
    pub interval: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            margin: Duration::from_secs(1),
            interval: Duration::ZERO,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CaptureParameters {
    /// Enabled channels; the order fixes buffer layout and frame order.
    pub channels: Vec<ChannelId>,
    pub sample_count: u16,
    /// Requested samples per second per channel.
    pub samplerate: f64,
    pub trigger: Option<AnalogTrigger>,
}

impl CaptureParameters {
    pub fn new(channels: Vec<ChannelId>, sample_count: u16, samplerate: f64) -> Self {
        Self {
            channels,
            sample_count,
            samplerate,
            trigger: None,
        }
    }

    /// Resolve channel names against `model`.
    pub fn by_name(
        model: &ChannelModel,
        names: &[&str],
        sample_count: u16,
        samplerate: f64,
    ) -> Result<Self, ChannelError> {
        let channels = names
            .iter()
            .map(|name| model.lookup(name))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(channels, sample_count, samplerate))
    }

    pub fn with_trigger(mut self, trigger: AnalogTrigger) -> Self {
        self.trigger = Some(trigger);
        self
    }

    /// Check against `limits` and return the capture mode and timing word.
    ///
    /// Nothing is sent to the device and the model is not modified.
    pub fn validate(
        &self,
        model: &ChannelModel,
        limits: &CaptureLimits,
    ) -> Result<(CaptureMode, u16), CaptureError> {
        let count = self.channels.len();
        let mode = CaptureMode::for_channel_count(count).ok_or_else(|| {
            CaptureError::InvalidParameters(format!(
                "{} channels requested, between 1 and {} are supported",
                count, MAX_CHANNELS
            ))
        })?;

        for (i, id) in self.channels.iter().enumerate() {
            model
                .analog(*id)
                .map_err(|e| CaptureError::InvalidParameters(e.to_string()))?;
            if self.channels[..i].contains(id) {
                return Err(CaptureError::InvalidParameters(format!(
                    "channel {} enabled twice",
                    model.get(*id)?.name
                )));
            }
        }

        let max_samples = limits.max_sample_count(count);
        if self.sample_count < limits.min_samples || u32::from(self.sample_count) > max_samples {
            return Err(CaptureError::InvalidParameters(format!(
                "{} samples requested, {} to {} allowed with {} channel(s)",
                self.sample_count, limits.min_samples, max_samples, count
            )));
        }

        let triggered = self.trigger.is_some();
        let max_rate = limits.max_samplerate(mode, triggered);
        if !self.samplerate.is_finite()
            || self.samplerate < limits.min_samplerate()
            || self.samplerate > max_rate
        {
            return Err(CaptureError::InvalidParameters(format!(
                "samplerate {} Hz outside {:.0}..={:.0} Hz for {:?} mode{}",
                self.samplerate,
                limits.min_samplerate(),
                max_rate,
                mode,
                if triggered { " with trigger" } else { "" }
            )));
        }
        let ticks = (TIMER_CLOCK / self.samplerate).round();
        let timegap = u16::try_from(ticks as u32).map_err(|_| {
            CaptureError::InvalidParameters(format!("sample interval of {} ticks", ticks))
        })?;

        if let Some(trigger) = &self.trigger {
            if !self.channels.contains(&trigger.channel) {
                return Err(TriggerError::InvalidArgument(format!(
                    "trigger channel {} is not enabled",
                    model.get(trigger.channel)?.name
                ))
                .into());
            }
            trigger.into_trigger_fields(model, self.channels[0])?;
        }

        Ok((mode, timegap))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    Idle,
    Configuring,
    Triggering,
    Capturing,
    Polling,
    Retrieving,
    Emitting,
    Aborted,
}

/// Scaled samples of one channel from one capture.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalogFrame {
    pub channel: ChannelId,
    pub name: String,
    pub samplerate: f64,
    pub samples: Vec<f64>,
}

/// Receiver of the frames a capture produces.
pub trait FrameSink {
    fn send_frame(&mut self, frame: AnalogFrame);

    fn end_of_session(&mut self) {}
}

impl FrameSink for Vec<AnalogFrame> {
    fn send_frame(&mut self, frame: AnalogFrame) {
        self.push(frame);
    }
}

/// Cloneable request to stop a running capture.
#[derive(Debug, Clone, Default)]
pub struct AbortHandle(Arc<AtomicBool>);

impl AbortHandle {
    pub fn abort(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Book-keeping for one acquisition cycle.
#[derive(Debug)]
pub struct CaptureSession {
    params: CaptureParameters,
    mode: CaptureMode,
    timegap: u16,
    cursor: usize,
    samples: Vec<f64>,
    poll_deadline: Option<Instant>,
    samples_acquired: u16,
}

impl CaptureSession {
    fn new(params: CaptureParameters) -> Self {
        Self {
            params,
            mode: CaptureMode::One,
            timegap: 0,
            cursor: 0,
            samples: Vec::new(),
            poll_deadline: None,
            samples_acquired: 0,
        }
    }

    pub fn params(&self) -> &CaptureParameters {
        &self.params
    }

    pub fn mode(&self) -> CaptureMode {
        self.mode
    }

    /// Samplerate the device actually runs at after rounding the timing word.
    pub fn effective_samplerate(&self) -> f64 {
        if self.timegap == 0 {
            return self.params.samplerate;
        }
        TIMER_CLOCK / f64::from(self.timegap)
    }

    /// Position in the enabled list of the channel being retrieved.
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Last sample counter reported by the status poll.
    pub fn samples_acquired(&self) -> u16 {
        self.samples_acquired
    }

    fn acquisition_time(&self) -> Duration {
        let ticks = f64::from(self.params.sample_count) * f64::from(self.timegap);
        Duration::from_secs_f64(ticks / TIMER_CLOCK)
    }
}

#[derive(Debug)]
pub struct CaptureOrchestrator {
    state: CaptureState,
    session: CaptureSession,
    limits: CaptureLimits,
    poll: PollPolicy,
    abort: AbortHandle,
}

impl CaptureOrchestrator {
    pub fn new(params: CaptureParameters, limits: CaptureLimits, poll: PollPolicy) -> Self {
        Self {
            state: CaptureState::Configuring,
            session: CaptureSession::new(params),
            limits,
            poll,
            abort: AbortHandle::default(),
        }
    }

    pub fn state(&self) -> CaptureState {
        self.state
    }

    pub fn session(&self) -> &CaptureSession {
        &self.session
    }

    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.state, CaptureState::Idle | CaptureState::Aborted)
    }

    /// Run the current state and advance. Returns the new state.
    pub fn step<L: Link>(
        &mut self,
        codec: &mut CommandCodec<L>,
        model: &mut ChannelModel,
        sink: &mut dyn FrameSink,
    ) -> Result<CaptureState, CaptureError> {
        if self.is_finished() {
            return Ok(self.state);
        }
        let _span = tracing::debug_span!("capture_step", state = ?self.state).entered();

        let result = if self.abort.is_aborted() {
            Err(CaptureError::Aborted)
        } else {
            match self.state {
                CaptureState::Configuring => self.configure(model),
                CaptureState::Triggering => self.send_trigger(codec, model),
                CaptureState::Capturing => self.start_capture(codec, model),
                CaptureState::Polling => self.poll_status(codec),
                CaptureState::Retrieving => self.retrieve(codec, model),
                CaptureState::Emitting => self.emit(codec, model, sink),
                CaptureState::Idle | CaptureState::Aborted => Ok(self.state),
            }
        };

        match result {
            Ok(next) => {
                log::debug!("Capture {:?} -> {:?}", self.state, next);
                self.state = next;
                Ok(next)
            }
            Err(e) => {
                self.fail(model, sink, &e);
                Err(e)
            }
        }
    }

    /// Step until the capture is done.
    pub fn run<L: Link>(
        &mut self,
        codec: &mut CommandCodec<L>,
        model: &mut ChannelModel,
        sink: &mut dyn FrameSink,
    ) -> Result<(), CaptureError> {
        loop {
            match self.step(codec, model, sink)? {
                CaptureState::Idle => return Ok(()),
                CaptureState::Aborted => return Err(CaptureError::Aborted),
                _ => {}
            }
        }
    }

    fn fail(&mut self, model: &mut ChannelModel, sink: &mut dyn FrameSink, error: &CaptureError) {
        log::warn!("Capture aborted in {:?}: {}", self.state, error);

        // An abort keeps whatever the current channel delivered so far.
        if matches!(error, CaptureError::Aborted) && !self.session.samples.is_empty() {
            if let Ok(frame) = self.take_frame(model) {
                sink.send_frame(frame);
            }
        }
        self.session.samples.clear();
        if self.state != CaptureState::Configuring {
            model.clear_offsets();
        }
        self.state = CaptureState::Aborted;
    }

    fn configure(&mut self, model: &mut ChannelModel) -> Result<CaptureState, CaptureError> {
        let (mode, timegap) = self.session.params.validate(model, &self.limits)?;
        model.configure(&self.session.params.channels)?;

        self.session.mode = mode;
        self.session.timegap = timegap;
        self.session.cursor = 0;
        self.session.samples.clear();
        log::debug!(
            "Capture of {} samples on {} channel(s) in {:?} mode, timegap {} ticks",
            self.session.params.sample_count,
            self.session.params.channels.len(),
            mode,
            timegap
        );

        Ok(if self.session.params.trigger.is_some() {
            CaptureState::Triggering
        } else {
            CaptureState::Capturing
        })
    }

    fn send_trigger<L: Link>(
        &mut self,
        codec: &mut CommandCodec<L>,
        model: &ChannelModel,
    ) -> Result<CaptureState, CaptureError> {
        let params = &self.session.params;
        let Some(trigger) = &params.trigger else {
            return Ok(CaptureState::Capturing);
        };
        let fields = trigger.into_trigger_fields(model, params.channels[0])?;
        log::debug!("Trigger source {:#04x}, level {}", fields.source, fields.level);

        codec.send_command(Command::ConfigureTrigger)?;
        codec.send_bytes(&[Param::U8(fields.source), Param::U16(fields.level)])?;
        codec.await_ack()?;
        Ok(CaptureState::Capturing)
    }

    fn start_capture<L: Link>(
        &mut self,
        codec: &mut CommandCodec<L>,
        model: &mut ChannelModel,
    ) -> Result<CaptureState, CaptureError> {
        let session = &mut self.session;
        model.assign_offsets(session.params.sample_count)?;

        let mut selector = model.analog(session.params.channels[0])?.chosa;
        if session.params.trigger.is_some() {
            selector |= TRIGGER_FLAG;
        }

        codec.send_command(session.mode.command())?;
        codec.send_bytes(&[
            Param::U8(selector),
            Param::U16(session.params.sample_count),
            Param::U16(session.timegap),
        ])?;
        codec.await_ack()?;

        session.poll_deadline = Some(Instant::now() + session.acquisition_time() + self.poll.margin);
        Ok(CaptureState::Polling)
    }

    fn poll_status<L: Link>(&mut self, codec: &mut CommandCodec<L>) -> Result<CaptureState, CaptureError> {
        codec.send_command(Command::GetCaptureStatus)?;
        let done = codec.read_u8()?;
        let acquired = codec.read_u16()?;
        codec.await_ack()?;
        self.session.samples_acquired = acquired;

        if done != 0 {
            log::debug!("Capture complete, {} samples", acquired);
            return Ok(CaptureState::Retrieving);
        }

        if let Some(deadline) = self.session.poll_deadline {
            if Instant::now() >= deadline {
                return Err(CaptureError::Timeout(
                    self.session.acquisition_time() + self.poll.margin,
                ));
            }
        }
        if !self.poll.interval.is_zero() {
            std::thread::sleep(self.poll.interval);
        }
        Ok(CaptureState::Polling)
    }

    fn retrieve<L: Link>(
        &mut self,
        codec: &mut CommandCodec<L>,
        model: &ChannelModel,
    ) -> Result<CaptureState, CaptureError> {
        let id = self.session.params.channels[self.session.cursor];
        let analog = model.analog(id)?;
        let offset = analog
            .buffer_offset()
            .ok_or_else(|| CaptureError::InvalidParameters("buffer offset not assigned".into()))?;
        let calibration = LinearCalibration::for_channel(analog);
        let count = self.session.params.sample_count;

        codec.send_command(Command::RetrieveBuffer)?;
        codec.send_bytes(&[Param::U16(offset), Param::U16(count)])?;

        let samples = &mut self.session.samples;
        samples.clear();
        samples.reserve(usize::from(count));
        for _ in 0..count {
            if self.abort.is_aborted() {
                return Err(CaptureError::Aborted);
            }
            match codec.read_u16() {
                Ok(raw) => samples.push(calibration.scale(raw)),
                Err(ProtocolError::ShortRead { .. }) => {
                    log::warn!(
                        "Short read from {}, keeping {} of {} samples",
                        model.get(id)?.name,
                        samples.len(),
                        count
                    );
                    break;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(CaptureState::Emitting)
    }

    fn take_frame(&mut self, model: &ChannelModel) -> Result<AnalogFrame, CaptureError> {
        let id = self.session.params.channels[self.session.cursor];
        Ok(AnalogFrame {
            channel: id,
            name: model.get(id)?.name.clone(),
            samplerate: self.session.effective_samplerate(),
            samples: std::mem::take(&mut self.session.samples),
        })
    }

    fn emit<L: Link>(
        &mut self,
        codec: &mut CommandCodec<L>,
        model: &mut ChannelModel,
        sink: &mut dyn FrameSink,
    ) -> Result<CaptureState, CaptureError> {
        let frame = self.take_frame(model)?;
        sink.send_frame(frame);
        codec.await_ack()?;

        self.session.cursor += 1;
        if self.session.cursor < self.session.params.channels.len() {
            return Ok(CaptureState::Retrieving);
        }
        model.clear_offsets();
        sink.end_of_session();
        Ok(CaptureState::Idle)
    }
}
