//! Serial device reader
//!
//! Owns the serial handle and wraps the wire protocol with:
//! - open/close lifecycle (8-N-1, configurable port, baud and timeout)
//! - single request/response reads
//! - sequential retries with a fixed 100 ms delay
//! - physical range validation

use std::io::{self, Read, Write};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::protocol::{self, ProtocolError, Reading, ValidationError, RESPONSE_LEN};
use crate::retry::RetryPolicy;

/// Default Modbus slave address of a factory-fresh meter
pub const DEFAULT_ADDRESS: u8 = 0x01;

/// Anything the reader can talk to: a real serial port or a test double
pub trait SerialLink: Read + Write + Send {}

impl<T: Read + Write + Send + ?Sized> SerialLink for T {}

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("serial transport error: {0}")]
    Transport(#[from] io::Error),
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("invalid reading: {0}")]
    Validation(#[from] ValidationError),
    #[error("failed to open serial port {port}: {source}")]
    Open {
        port: String,
        #[source]
        source: serialport::Error,
    },
    #[error("serial port is closed")]
    Closed,
}

pub struct DeviceReader {
    link: Option<Box<dyn SerialLink>>,
    address: u8,
    port_name: String,
}

impl std::fmt::Debug for DeviceReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceReader")
            .field("port", &self.port_name)
            .field("address", &self.address)
            .field("open", &self.link.is_some())
            .finish()
    }
}

impl DeviceReader {
    /// Open the serial port, 8 data bits, no parity, 1 stop bit
    pub fn open(port: &str, baud_rate: u32, timeout: Duration) -> Result<Self, DeviceError> {
        let handle = serialport::new(port, baud_rate)
            .timeout(timeout)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(serialport::FlowControl::None)
            .open()
            .map_err(|source| DeviceError::Open {
                port: port.to_string(),
                source,
            })?;

        info!("Opened serial port {} at {} baud (timeout {:?})", port, baud_rate, timeout);
        Ok(Self {
            link: Some(Box::new(handle)),
            address: DEFAULT_ADDRESS,
            port_name: port.to_string(),
        })
    }

    /// Wrap an already-open link
    pub fn from_link(link: Box<dyn SerialLink>, port_name: impl Into<String>) -> Self {
        Self {
            link: Some(link),
            address: DEFAULT_ADDRESS,
            port_name: port_name.into(),
        }
    }

    pub fn with_address(mut self, address: u8) -> Self {
        self.address = address;
        self
    }

    pub fn address(&self) -> u8 {
        self.address
    }

    pub fn port_name(&self) -> &str {
        &self.port_name
    }

    pub fn is_open(&self) -> bool {
        self.link.is_some()
    }

    /// Release the handle. Safe to call more than once.
    pub fn close(&mut self) {
        if let Some(mut link) = self.link.take() {
            if let Err(e) = link.flush() {
                warn!("Error flushing serial port {}: {}", self.port_name, e);
            }
            info!("Closed serial port {}", self.port_name);
        }
    }

    /// One request/response exchange
    pub fn read(&mut self) -> Result<Reading, DeviceError> {
        let link = self.link.as_mut().ok_or(DeviceError::Closed)?;

        let command = protocol::build_command(self.address);
        link.write_all(&command)?;
        link.flush()?;

        let mut response = [0u8; RESPONSE_LEN];
        link.read_exact(&mut response)?;

        Ok(protocol::decode(&response)?)
    }

    /// Up to `max_attempts` reads, 100 ms apart; the last error wins
    pub fn read_with_retry(&mut self, max_attempts: u32) -> Result<Reading, DeviceError> {
        RetryPolicy::device(max_attempts).run_blocking(
            |attempt| {
                self.read().inspect_err(|e| {
                    debug!("Device read attempt {}/{} failed: {}", attempt, max_attempts, e);
                })
            },
            |e| !matches!(e, DeviceError::Closed),
        )
    }

    pub fn validate(reading: &Reading) -> Result<(), DeviceError> {
        reading.validate().map_err(DeviceError::from)
    }

    /// Read with retry, then range-check. What every sample tick does.
    pub fn read_validated(&mut self, max_attempts: u32) -> Result<Reading, DeviceError> {
        let reading = self.read_with_retry(max_attempts)?;
        Self::validate(&reading)?;
        Ok(reading)
    }

    /// One-shot check that the meter answers with a plausible reading
    pub fn test_connection(&mut self) -> Result<Reading, DeviceError> {
        self.read_validated(3)
    }
}

impl Drop for DeviceReader {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::crc16;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    /// Answers each command with the next scripted response; `None` times out
    struct ScriptedLink {
        script: VecDeque<Option<Vec<u8>>>,
        pending: VecDeque<u8>,
        writes: Arc<Mutex<Vec<Vec<u8>>>>,
    }

    impl ScriptedLink {
        fn new(script: Vec<Option<Vec<u8>>>) -> (Self, Arc<Mutex<Vec<Vec<u8>>>>) {
            let writes = Arc::new(Mutex::new(Vec::new()));
            let link = Self {
                script: script.into(),
                pending: VecDeque::new(),
                writes: writes.clone(),
            };
            (link, writes)
        }
    }

    impl Write for ScriptedLink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.writes.lock().unwrap().push(buf.to_vec());
            if let Some(Some(frame)) = self.script.pop_front() {
                self.pending = frame.into();
            }
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Read for ScriptedLink {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.pending.is_empty() {
                return Err(io::Error::new(io::ErrorKind::TimedOut, "no response"));
            }
            let n = buf.len().min(self.pending.len());
            for slot in buf.iter_mut().take(n) {
                *slot = self.pending.pop_front().unwrap();
            }
            Ok(n)
        }
    }

    fn frame(volts_tenths: u16, hz_tenths: u16) -> Vec<u8> {
        let mut f = vec![0x01, 0x04, 0x14];
        f.extend_from_slice(&volts_tenths.to_be_bytes());
        f.extend_from_slice(&[0x03, 0xE8, 0x00, 0x00]); // 1.000 A
        f.extend_from_slice(&[0x08, 0x98, 0x00, 0x00]); // 220.0 W
        f.extend_from_slice(&[0x00, 0x10, 0x00, 0x00]); // 16 Wh
        f.extend_from_slice(&hz_tenths.to_be_bytes());
        f.extend_from_slice(&100u16.to_be_bytes());
        f.extend_from_slice(&[0x00, 0x00]);
        let crc = crc16(&f).to_le_bytes();
        f.extend_from_slice(&crc);
        f
    }

    fn reader(script: Vec<Option<Vec<u8>>>) -> (DeviceReader, Arc<Mutex<Vec<Vec<u8>>>>) {
        let (link, writes) = ScriptedLink::new(script);
        (DeviceReader::from_link(Box::new(link), "mock"), writes)
    }

    #[test]
    fn test_read_sends_command_and_decodes() {
        let (mut dev, writes) = reader(vec![Some(frame(2300, 500))]);
        let reading = dev.read().unwrap();
        assert_eq!(reading.voltage, 230.0);
        assert_eq!(reading.power, 220.0);
        assert_eq!(writes.lock().unwrap()[0], protocol::build_command(0x01).to_vec());
    }

    #[test]
    fn test_read_uses_configured_address() {
        let (dev, writes) = reader(vec![Some(frame(2300, 500))]);
        let mut dev = dev.with_address(0x07);
        dev.read().unwrap();
        assert_eq!(writes.lock().unwrap()[0][0], 0x07);
    }

    #[test]
    fn test_timeout_is_transport_error() {
        let (mut dev, _) = reader(vec![None]);
        assert!(matches!(dev.read(), Err(DeviceError::Transport(_))));
    }

    #[test]
    fn test_retry_recovers_after_bad_frames() {
        let mut corrupted = frame(2300, 500);
        corrupted[10] ^= 0xFF;
        let (mut dev, writes) = reader(vec![None, Some(corrupted), Some(frame(2310, 500))]);
        let reading = dev.read_with_retry(3).unwrap();
        assert_eq!(reading.voltage, 231.0);
        assert_eq!(writes.lock().unwrap().len(), 3);
    }

    #[test]
    fn test_retry_returns_last_error() {
        let mut corrupted = frame(2300, 500);
        corrupted[4] ^= 0x01;
        let (mut dev, writes) = reader(vec![None, None, Some(corrupted)]);
        let err = dev.read_with_retry(3).unwrap_err();
        assert!(matches!(err, DeviceError::Protocol(ProtocolError::CrcMismatch { .. })));
        assert_eq!(writes.lock().unwrap().len(), 3);
    }

    #[test]
    fn test_read_validated_rejects_out_of_range() {
        // 70.0 Hz decodes fine but is not a mains frequency
        let (mut dev, _) = reader(vec![Some(frame(2300, 700))]);
        let err = dev.read_validated(1).unwrap_err();
        assert!(matches!(err, DeviceError::Validation(ref v) if v.field == "frequency"));
    }

    #[test]
    fn test_closed_reader_fails_fast() {
        let (mut dev, writes) = reader(vec![Some(frame(2300, 500))]);
        dev.close();
        dev.close();
        assert!(!dev.is_open());
        assert!(matches!(dev.read_with_retry(3), Err(DeviceError::Closed)));
        assert!(writes.lock().unwrap().is_empty());
    }
}
