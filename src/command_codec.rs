//! Binary command vocabulary of the PSLab firmware.
//!
//! Every command is a group byte followed by a sub-command byte, then a fixed
//! list of `u8`/`u16` little-endian parameters. There is no framing, length
//! prefix or checksum: both sides simply agree on the table below. Most
//! command groups end with a single acknowledgement byte.

use crate::serial_link::{Link, LinkError};

/// Raw opcode values, grouped the way the firmware dispatches them.
pub mod opcodes {
    pub const ADC: u8 = 0x02;
    pub const CAPTURE_ONE: u8 = 0x01;
    pub const CAPTURE_TWO: u8 = 0x02;
    pub const CAPTURE_FOUR: u8 = 0x04;
    pub const CONFIGURE_TRIGGER: u8 = 0x05;
    pub const GET_CAPTURE_STATUS: u8 = 0x06;
    pub const SET_PGA_GAIN: u8 = 0x08;

    pub const COMMON: u8 = 0x0b;
    pub const GET_VERSION: u8 = 0x05;
    pub const RETRIEVE_BUFFER: u8 = 0x08;

    pub const WAVEGEN: u8 = 0x07;
    pub const SQR4: u8 = 0x07;

    pub const DOUT: u8 = 0x08;
    pub const SET_STATE: u8 = 0x01;
}

/// Maximum length of the version line, excluding the terminator.
pub const VERSION_MAX_LEN: usize = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    CaptureOne,
    CaptureTwo,
    CaptureFour,
    ConfigureTrigger,
    GetCaptureStatus,
    RetrieveBuffer,
    SetPgaGain,
    GetVersion,
    Sqr4,
    SetState,
}

impl Command {
    /// Group and sub-command byte.
    pub fn opcode(&self) -> [u8; 2] {
        use opcodes::*;
        match self {
            Command::CaptureOne => [ADC, CAPTURE_ONE],
            Command::CaptureTwo => [ADC, CAPTURE_TWO],
            Command::CaptureFour => [ADC, CAPTURE_FOUR],
            Command::ConfigureTrigger => [ADC, CONFIGURE_TRIGGER],
            Command::GetCaptureStatus => [ADC, GET_CAPTURE_STATUS],
            Command::SetPgaGain => [ADC, SET_PGA_GAIN],
            Command::RetrieveBuffer => [COMMON, RETRIEVE_BUFFER],
            Command::GetVersion => [COMMON, GET_VERSION],
            Command::Sqr4 => [WAVEGEN, SQR4],
            Command::SetState => [DOUT, SET_STATE],
        }
    }
}

/// One value written to the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Param {
    U8(u8),
    U16(u16),
}

impl Param {
    fn width(&self) -> usize {
        match self {
            Param::U8(_) => 1,
            Param::U16(_) => 2,
        }
    }
}

impl From<u8> for Param {
    fn from(value: u8) -> Self {
        Self::U8(value)
    }
}

impl From<u16> for Param {
    fn from(value: u16) -> Self {
        Self::U16(value)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Did not receive ACK, got {received:?}")]
    NoAck { received: Option<u8> },

    #[error("Short read: expected {expected} bytes, got {actual}")]
    ShortRead { expected: usize, actual: usize },

    #[error("Link error: {0}")]
    Link(#[from] LinkError),
}

/// True for a valid acknowledgement byte.
pub fn is_ack(byte: u8) -> bool {
    byte & 0x01 != 0 && byte != 0
}

/// Exclusive owner of a [`Link`] that speaks the command protocol on it.
#[derive(Debug)]
pub struct CommandCodec<L: Link> {
    link: L,
}

impl<L: Link> CommandCodec<L> {
    pub fn new(link: L) -> Self {
        Self { link }
    }

    pub fn link_mut(&mut self) -> &mut L {
        &mut self.link
    }

    pub fn into_link(self) -> L {
        self.link
    }

    /// Write each parameter on its own. A short write is only logged: the ACK
    /// that follows the command group decides whether it went through.
    pub fn send_bytes(&mut self, params: &[Param]) -> Result<(), ProtocolError> {
        for param in params {
            let buf = match *param {
                Param::U8(v) => [v, 0],
                Param::U16(v) => v.to_le_bytes(),
            };
            let width = param.width();
            let written = self.link.write_blocking(&buf[..width])?;
            if written < width {
                log::warn!(
                    "Short write for {:?}: {} of {} bytes sent",
                    param,
                    written,
                    width
                );
            }
        }
        Ok(())
    }

    /// Send the two opcode bytes of `command`.
    pub fn send_command(&mut self, command: Command) -> Result<(), ProtocolError> {
        let [group, sub] = command.opcode();
        self.send_bytes(&[Param::U8(group), Param::U8(sub)])
    }

    /// Read one byte and check that it acknowledges the preceding command group.
    pub fn await_ack(&mut self) -> Result<u8, ProtocolError> {
        let mut buf = [0u8; 1];
        let read = self.link.read_blocking(&mut buf)?;
        if read < 1 {
            log::debug!("Timed out waiting for ACK");
            return Err(ProtocolError::NoAck { received: None });
        }
        if !is_ack(buf[0]) {
            log::debug!("Received non-ACK byte {:#04x} while waiting for ACK", buf[0]);
            return Err(ProtocolError::NoAck {
                received: Some(buf[0]),
            });
        }
        Ok(buf[0])
    }

    pub fn read_u8(&mut self) -> Result<u8, ProtocolError> {
        let mut buf = [0u8; 1];
        self.read_exact(&mut buf)?;
        Ok(buf[0])
    }

    pub fn read_u16(&mut self) -> Result<u16, ProtocolError> {
        let mut buf = [0u8; 2];
        self.read_exact(&mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), ProtocolError> {
        let read = self.link.read_blocking(buf)?;
        if read < buf.len() {
            return Err(ProtocolError::ShortRead {
                expected: buf.len(),
                actual: read,
            });
        }
        Ok(())
    }

    /// Ask the device to identify itself and return the version line.
    ///
    /// The line is read byte by byte up to `\n` or [`VERSION_MAX_LEN`] bytes,
    /// whichever comes first. Whether the reply names a compatible product is
    /// up to the caller.
    pub fn handshake_version(&mut self) -> Result<String, ProtocolError> {
        log::info!("Sending version command to device");
        self.send_command(Command::GetVersion)?;

        let mut line = Vec::with_capacity(VERSION_MAX_LEN);
        let mut byte = [0u8; 1];
        while line.len() < VERSION_MAX_LEN {
            if self.link.read_blocking(&mut byte)? < 1 {
                break;
            }
            if byte[0] == b'\n' {
                break;
            }
            line.push(byte[0]);
        }

        let version = String::from_utf8_lossy(&line).trim_end().to_string();
        log::debug!("Device version: {}", version);
        Ok(version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serial_link::mock::MockLink;

    fn codec_with(rx: &[u8]) -> CommandCodec<MockLink> {
        let mut link = MockLink::new();
        link.queue(rx);
        CommandCodec::new(link)
    }

    #[test]
    fn test_ack_semantics() {
        assert!(!is_ack(0x00));
        assert!(!is_ack(0x02));
        assert!(is_ack(0x01));
        assert!(is_ack(0x03));
    }

    #[test]
    fn test_await_ack_rejects_invalid_bytes() {
        for byte in [0x00u8, 0x02, 0xfe] {
            let mut codec = codec_with(&[byte]);
            assert!(matches!(
                codec.await_ack(),
                Err(ProtocolError::NoAck { received: Some(b) }) if b == byte
            ));
        }
    }

    #[test]
    fn test_await_ack_accepts_odd_bytes() {
        let mut codec = codec_with(&[0x01, 0x03]);
        assert_eq!(codec.await_ack().unwrap(), 0x01);
        assert_eq!(codec.await_ack().unwrap(), 0x03);
    }

    #[test]
    fn test_await_ack_times_out() {
        let mut codec = codec_with(&[]);
        assert!(matches!(
            codec.await_ack(),
            Err(ProtocolError::NoAck { received: None })
        ));
    }

    #[test]
    fn test_send_bytes_little_endian() {
        let mut codec = codec_with(&[]);
        codec
            .send_bytes(&[Param::U8(0x02), Param::U16(0x1234), 500u16.into()])
            .unwrap();
        assert_eq!(codec.into_link().written, vec![0x02, 0x34, 0x12, 0xf4, 0x01]);
    }

    #[test]
    fn test_short_write_is_not_an_error() {
        let mut link = MockLink::new();
        link.write_budget = Some(2);
        let mut codec = CommandCodec::new(link);
        codec
            .send_bytes(&[Param::U8(1), Param::U16(0xffff)])
            .unwrap();
        assert_eq!(codec.into_link().written, vec![1, 0xff]);
    }

    #[test]
    fn test_command_opcodes() {
        assert_eq!(Command::CaptureTwo.opcode(), [0x02, 0x02]);
        assert_eq!(Command::RetrieveBuffer.opcode(), [0x0b, 0x08]);
        assert_eq!(Command::Sqr4.opcode(), [0x07, 0x07]);
        assert_eq!(Command::SetState.opcode(), [0x08, 0x01]);
    }

    #[test]
    fn test_read_u16_short_read() {
        let mut codec = codec_with(&[0x10]);
        assert!(matches!(
            codec.read_u16(),
            Err(ProtocolError::ShortRead {
                expected: 2,
                actual: 1
            })
        ));
    }

    #[test]
    fn test_handshake_version() {
        let mut codec = codec_with(b"PSLab V6\nextra");
        assert_eq!(codec.handshake_version().unwrap(), "PSLab V6");
        let link = codec.into_link();
        assert_eq!(link.written, vec![0x0b, 0x05]);
        assert_eq!(link.rx.len(), 5);
    }

    #[test]
    fn test_handshake_version_is_bounded() {
        let mut codec = codec_with(b"0123456789abcdefghij");
        assert_eq!(codec.handshake_version().unwrap(), "0123456789abcde");
    }
}
