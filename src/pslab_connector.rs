use crate::command_codec::{CommandCodec, ProtocolError};
use crate::pslab_scope::IdlePslab;
use crate::serial_link::{Link, LinkError, SerialLink, SerialSettings};

/// Version lines of supported firmware start with one of these.
pub const COMPATIBLE_PREFIXES: [&str; 2] = ["PSLab", "CSpark"];

#[derive(Debug, thiserror::Error)]
pub enum PslabConnectorError {
    #[error("Link error: {0}")]
    Link(#[from] LinkError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Device on {port} reported version '{version}', which is not a PSLab")]
    NotAPslab { port: String, version: String },
}

pub struct PslabConnector;

impl PslabConnector {
    /// Open `port` and check that a PSLab answers on it.
    ///
    /// `serialcomm` is a `"<baud>/<data bits><parity><stop bits>"` string,
    /// `1000000/8n1` when not given.
    pub fn connect(
        port: &str,
        serialcomm: Option<&str>,
    ) -> Result<IdlePslab<SerialLink>, PslabConnectorError> {
        let settings = match serialcomm {
            Some(serialcomm) => serialcomm.parse()?,
            None => SerialSettings::default(),
        };
        log::debug!("Connecting to PSLab on port {}", port);

        let link = SerialLink::open(port, settings)?;
        Self::probe(port, link)
    }

    /// Run the version handshake over an already open link.
    pub fn probe<L: Link>(port: &str, link: L) -> Result<IdlePslab<L>, PslabConnectorError> {
        let mut codec = CommandCodec::new(link);
        let version = codec.handshake_version()?;

        if !Self::is_compatible(&version) {
            return Err(PslabConnectorError::NotAPslab {
                port: port.to_string(),
                version,
            });
        }

        log::info!("Connected to {} on {}", version, port);
        Ok(IdlePslab::new(codec, version))
    }

    pub fn is_compatible(version: &str) -> bool {
        COMPATIBLE_PREFIXES
            .iter()
            .any(|prefix| version.starts_with(prefix))
    }
}
