use serialport::{DataBits, Parity, SerialPort, StopBits};
use std::io::{ErrorKind, Read, Write};
use std::str::FromStr;
use std::time::{Duration, Instant};

/// Serial parameters used when the caller does not specify any.
pub const DEFAULT_SERIALCOMM: &str = "1000000/8n1";

/// Fixed slack added on top of the raw transmission time of a transfer.
const TIMEOUT_MARGIN: Duration = Duration::from_millis(10);

#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("Serial port error: {0}")]
    SerialPort(#[from] serialport::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid serial settings '{0}', expected e.g. \"1000000/8n1\"")]
    InvalidSettings(String),
}

/// Byte-oriented duplex channel to a device.
///
/// Reads and writes never fail just because the peer is slow: a transfer that
/// runs into the timeout returns the number of bytes actually moved and the
/// caller decides whether that is fatal.
pub trait Link {
    /// Write `bytes`, blocking until all are sent or the timeout expires.
    fn write_blocking(&mut self, bytes: &[u8]) -> Result<usize, LinkError>;

    /// Fill `buf`, blocking until it is full or the timeout expires.
    fn read_blocking(&mut self, buf: &mut [u8]) -> Result<usize, LinkError>;

    /// Copy whatever is already pending into `buf` without waiting.
    fn read_nonblocking(&mut self, buf: &mut [u8]) -> Result<usize, LinkError>;

    /// Number of bytes waiting in the receive buffer.
    fn bytes_to_read(&mut self) -> Result<usize, LinkError>;

    /// Drop anything buffered in either direction.
    fn clear(&mut self) -> Result<(), LinkError>;
}

/// Parsed form of a `"<baud>/<data bits><parity><stop bits>"` string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SerialSettings {
    pub baud_rate: u32,
    pub data_bits: DataBits,
    pub parity: Parity,
    pub stop_bits: StopBits,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            baud_rate: 1_000_000,
            data_bits: DataBits::Eight,
            parity: Parity::None,
            stop_bits: StopBits::One,
        }
    }
}

impl FromStr for SerialSettings {
    type Err = LinkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || LinkError::InvalidSettings(s.to_string());

        let (baud, frame) = s.trim().split_once('/').ok_or_else(invalid)?;
        let baud_rate: u32 = baud.parse().map_err(|_| invalid())?;
        if baud_rate == 0 {
            return Err(invalid());
        }

        let frame: Vec<char> = frame.chars().collect();
        let &[bits, parity, stop] = frame.as_slice() else {
            return Err(invalid());
        };

        let data_bits = match bits {
            '5' => DataBits::Five,
            '6' => DataBits::Six,
            '7' => DataBits::Seven,
            '8' => DataBits::Eight,
            _ => return Err(invalid()),
        };
        let parity = match parity.to_ascii_lowercase() {
            'n' => Parity::None,
            'o' => Parity::Odd,
            'e' => Parity::Even,
            _ => return Err(invalid()),
        };
        let stop_bits = match stop {
            '1' => StopBits::One,
            '2' => StopBits::Two,
            _ => return Err(invalid()),
        };

        Ok(Self {
            baud_rate,
            data_bits,
            parity,
            stop_bits,
        })
    }
}

impl SerialSettings {
    /// Bits on the wire for one byte, including start, parity and stop bits.
    fn bits_per_frame(&self) -> u32 {
        let data = match self.data_bits {
            DataBits::Five => 5,
            DataBits::Six => 6,
            DataBits::Seven => 7,
            DataBits::Eight => 8,
        };
        let parity = u32::from(self.parity != Parity::None);
        let stop = match self.stop_bits {
            StopBits::One => 1,
            StopBits::Two => 2,
        };
        1 + data + parity + stop
    }

    /// Time allowed for moving `count` bytes over the link.
    pub fn timeout_for(&self, count: usize) -> Duration {
        let bits = u64::from(self.bits_per_frame()) * count as u64;
        let micros = bits * 1_000_000 / u64::from(self.baud_rate);
        Duration::from_micros(micros) + TIMEOUT_MARGIN
    }
}

/// [`Link`] backed by a real serial port.
pub struct SerialLink {
    serial: Box<dyn SerialPort>,
    settings: SerialSettings,
}

impl std::fmt::Debug for SerialLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialLink")
            .field("port", &self.serial.name())
            .field("settings", &self.settings)
            .finish()
    }
}

impl SerialLink {
    /// Open `port` with the given settings and flush any stale bytes.
    pub fn open(port: &str, settings: SerialSettings) -> Result<Self, LinkError> {
        log::debug!("Opening {} at {} baud", port, settings.baud_rate);
        let serial = serialport::new(port, settings.baud_rate)
            .data_bits(settings.data_bits)
            .parity(settings.parity)
            .stop_bits(settings.stop_bits)
            .timeout(settings.timeout_for(1))
            .open()?;

        let mut link = Self { serial, settings };
        link.clear()?;
        Ok(link)
    }

    pub fn settings(&self) -> SerialSettings {
        self.settings
    }
}

impl Link for SerialLink {
    fn write_blocking(&mut self, bytes: &[u8]) -> Result<usize, LinkError> {
        let deadline = Instant::now() + self.settings.timeout_for(bytes.len());
        let mut written = 0;

        while written < bytes.len() {
            match self.serial.write(&bytes[written..]) {
                Ok(n) => written += n,
                Err(e) if e.kind() == ErrorKind::TimedOut || e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
            if Instant::now() >= deadline {
                break;
            }
        }
        self.serial.flush()?;
        Ok(written)
    }

    fn read_blocking(&mut self, buf: &mut [u8]) -> Result<usize, LinkError> {
        let deadline = Instant::now() + self.settings.timeout_for(buf.len());
        let mut filled = 0;

        while filled < buf.len() {
            match self.serial.read(&mut buf[filled..]) {
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::TimedOut || e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
            if Instant::now() >= deadline {
                break;
            }
        }
        Ok(filled)
    }

    fn read_nonblocking(&mut self, buf: &mut [u8]) -> Result<usize, LinkError> {
        let pending = self.bytes_to_read()?.min(buf.len());
        if pending == 0 {
            return Ok(0);
        }
        Ok(self.serial.read(&mut buf[..pending])?)
    }

    fn bytes_to_read(&mut self) -> Result<usize, LinkError> {
        Ok(self.serial.bytes_to_read()? as usize)
    }

    fn clear(&mut self) -> Result<(), LinkError> {
        self.serial.clear(serialport::ClearBuffer::All)?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod mock {
    use super::{Link, LinkError};
    use crate::capture::AbortHandle;
    use std::collections::VecDeque;

    /// Scripted in-memory link: reads pop from `rx`, writes land in `written`.
    #[derive(Debug, Default)]
    pub(crate) struct MockLink {
        pub rx: VecDeque<u8>,
        pub written: Vec<u8>,
        /// Accept at most this many more bytes before writes come up short.
        pub write_budget: Option<usize>,
        /// Fire the handle once no more than this many bytes are left to read.
        pub abort_when_left: Option<(usize, AbortHandle)>,
    }

    impl MockLink {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn queue(&mut self, bytes: &[u8]) -> &mut Self {
            self.rx.extend(bytes.iter().copied());
            self
        }

        pub fn queue_u16(&mut self, value: u16) -> &mut Self {
            self.queue(&value.to_le_bytes())
        }
    }

    impl Link for MockLink {
        fn write_blocking(&mut self, bytes: &[u8]) -> Result<usize, LinkError> {
            let n = match self.write_budget.as_mut() {
                Some(budget) => {
                    let n = bytes.len().min(*budget);
                    *budget -= n;
                    n
                }
                None => bytes.len(),
            };
            self.written.extend_from_slice(&bytes[..n]);
            Ok(n)
        }

        fn read_blocking(&mut self, buf: &mut [u8]) -> Result<usize, LinkError> {
            self.read_nonblocking(buf)
        }

        fn read_nonblocking(&mut self, buf: &mut [u8]) -> Result<usize, LinkError> {
            let mut n = 0;
            while n < buf.len() {
                match self.rx.pop_front() {
                    Some(byte) => {
                        buf[n] = byte;
                        n += 1;
                    }
                    None => break,
                }
            }
            if let Some((left, handle)) = &self.abort_when_left {
                if self.rx.len() <= *left {
                    handle.abort();
                }
            }
            Ok(n)
        }

        fn bytes_to_read(&mut self) -> Result<usize, LinkError> {
            Ok(self.rx.len())
        }

        fn clear(&mut self) -> Result<(), LinkError> {
            self.rx.clear();
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_default_serialcomm() {
        let settings: SerialSettings = DEFAULT_SERIALCOMM.parse().unwrap();
        assert_eq!(settings, SerialSettings::default());
    }

    #[test]
    fn test_parse_serialcomm_variants() {
        let settings: SerialSettings = "115200/7E2".parse().unwrap();
        assert_eq!(settings.baud_rate, 115_200);
        assert_eq!(settings.data_bits, DataBits::Seven);
        assert_eq!(settings.parity, Parity::Even);
        assert_eq!(settings.stop_bits, StopBits::Two);
    }

    #[test]
    fn test_parse_serialcomm_rejects_garbage() {
        for bad in ["", "1000000", "abc/8n1", "0/8n1", "9600/9n1", "9600/8x1", "9600/8n3", "9600/8n"] {
            assert!(
                matches!(bad.parse::<SerialSettings>(), Err(LinkError::InvalidSettings(_))),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn test_timeout_scales_with_byte_count() {
        let settings: SerialSettings = "9600/8n1".parse().unwrap();
        // 10 bits per byte at 9600 baud is ~1.04 ms per byte.
        assert_eq!(settings.timeout_for(0), TIMEOUT_MARGIN);
        assert_eq!(
            settings.timeout_for(96),
            Duration::from_millis(100) + TIMEOUT_MARGIN
        );
    }

    #[test]
    fn test_mock_link_short_write() {
        let mut link = mock::MockLink::new();
        link.write_budget = Some(1);
        assert_eq!(link.write_blocking(&[1, 2]).unwrap(), 1);
        assert_eq!(link.write_blocking(&[3]).unwrap(), 0);
        assert_eq!(link.written, vec![1]);
    }
}
