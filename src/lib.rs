//! # PSLab RS
//!
//! A Rust library for acquiring analog captures from and generating square
//! waves with PSLab devices over their binary serial protocol.
//!
//! ## Features
//!
//! - **Serial link**: Uses `serialport` with per-transfer timeouts derived from the baud rate
//! - **Command codec**: Opcodes, little-endian parameters and ACK checking
//! - **Channel model**: Analog inputs and digital outputs addressed by stable ids
//! - **Calibration**: Linear raw-code/volt conversion honouring gain and resolution
//! - **Capture state machine**: Step-driven, abortable, with a bounded status poll
//! - **Waveform generation**: Four phase-locked square-wave outputs and static levels
//! - **DataFrame output**: Uses `polars` for captured data
//!
//! ## Examples
//!
//! ### Capture two channels
//!
//! ```rust,no_run
//! use pslab_rs::{CaptureParameters, PslabConnector};
//!
//! let mut pslab = PslabConnector::connect("/dev/ttyACM0", None)?;
//! pslab.set_gain("CH1", 2)?;
//!
//! let params = CaptureParameters::by_name(pslab.channels(), &["CH1", "CH2"], 1000, 100_000.0)?;
//! let reading = pslab.capture_sync(params)?;
//! println!("{}", reading.to_dataframe()?);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ### Triggered capture driven step by step
//!
//! ```rust,no_run
//! use pslab_rs::{AnalogTrigger, CaptureParameters, PslabConnector};
//!
//! let pslab = PslabConnector::connect("/dev/ttyACM0", Some("1000000/8n1"))?;
//! let trigger = AnalogTrigger::start_capturing_when("CH1")
//!     .rises_through(1.5)
//!     .into_trigger(pslab.channels())?;
//! let params = CaptureParameters::by_name(pslab.channels(), &["CH1"], 500, 1_000_000.0)?
//!     .with_trigger(trigger);
//!
//! let mut capturing = pslab.start_capture(params).map_err(|(_, e)| e)?;
//! let (_pslab, reading) = loop {
//!     match capturing.try_get_result().map_err(|(_, e)| e)? {
//!         Ok(done) => break done,
//!         Err(still_capturing) => capturing = still_capturing,
//!     }
//! };
//! println!("{} frames", reading.frames.len());
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ### Square waves
//!
//! ```rust,no_run
//! use pslab_rs::{PslabConnector, PwmSettings};
//!
//! let mut pslab = PslabConnector::connect("/dev/ttyACM0", None)?;
//! let mut settings = PwmSettings::new();
//! settings.set_frequency(1000.0)?;
//! settings.set_duty_cycle(pslab.channels(), "SQ1", 25.0)?;
//! settings.set_duty_cycle(pslab.channels(), "SQ2", 25.0)?;
//! settings.set_phase(pslab.channels(), "SQ2", 180.0)?;
//! pslab.generate_pwm(&settings)?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ### Timing words without a device
//!
//! ```rust
//! use pslab_rs::waveform::compute_timing;
//!
//! let (wavelength, prescaler) = compute_timing(1000.0, 1).unwrap();
//! assert_eq!((wavelength, prescaler), (64000, 1));
//! ```

pub mod calibration;
pub mod capture;
pub mod channel_model;
pub mod command_codec;
pub mod pslab_connector;
pub mod pslab_scope;
pub mod serial_link;
pub mod trigger_config;
pub mod waveform;

// Re-export the main types for convenience
pub use capture::{
    AbortHandle, AnalogFrame, CaptureError, CaptureLimits, CaptureOrchestrator, CaptureParameters,
    CaptureState, FrameSink, PollPolicy,
};

pub use channel_model::{ChannelError, ChannelId, ChannelModel};

pub use command_codec::{CommandCodec, ProtocolError};

pub use serial_link::{Link, LinkError, SerialLink, SerialSettings};

pub use trigger_config::{AnalogTrigger, TriggerError};

pub use waveform::{PwmSettings, WaveformError, WaveformPlan};

pub use pslab_connector::{PslabConnector, PslabConnectorError};

pub use pslab_scope::{
    CaptureFailure, CapturingPslab, IdlePslab, PslabScopeError, ScopeReading,
};
