//! Wire protocol for the PZEM-004T style power meter
//!
//! Handles:
//! - Building the 8-byte "read input registers" request frame
//! - CRC16 (Modbus) computation and verification
//! - Decoding the 25-byte response into a typed [`Reading`]
//! - Physical range validation of decoded readings

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Length of a full response frame, CRC included
pub const RESPONSE_LEN: usize = 25;

/// Length of the request frame, CRC included
pub const COMMAND_LEN: usize = 8;

/// Modbus function code: read input registers
const FN_READ_INPUT: u8 = 0x04;

/// Registers 0x0000..0x000A hold every measurement
const REGISTER_COUNT: u8 = 0x0A;

/// Framing and checksum failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("short frame: got {len} bytes, expected {}", RESPONSE_LEN)]
    ShortFrame { len: usize },
    #[error("CRC mismatch: frame carries {received:#06x}, computed {computed:#06x}")]
    CrcMismatch { received: u16, computed: u16 },
}

/// A single measurement taken from the meter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub timestamp: DateTime<Utc>,
    /// Volts
    pub voltage: f64,
    /// Amperes
    pub current: f64,
    /// Watts
    pub power: f64,
    /// Cumulative energy, Wh
    pub energy: f64,
    /// Hz
    pub frequency: f64,
    /// 0..=1
    pub power_factor: f64,
    pub alarm: bool,
}

/// A reading outside the physical range the meter can report
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{field} out of range: {value} (allowed {min}..={max})")]
pub struct ValidationError {
    pub field: &'static str,
    pub value: f64,
    pub min: f64,
    pub max: f64,
}

impl Reading {
    /// Range gate for typical household/industrial installations
    pub fn validate(&self) -> Result<(), ValidationError> {
        check("voltage", self.voltage, 0.0, 300.0)?;
        check("current", self.current, 0.0, 100.0)?;
        check("power", self.power, 0.0, 30_000.0)?;
        check("energy", self.energy, 0.0, f64::MAX)?;
        check("frequency", self.frequency, 45.0, 65.0)?;
        check("power_factor", self.power_factor, 0.0, 1.0)?;
        Ok(())
    }

    pub fn is_valid(&self) -> bool {
        self.validate().is_ok()
    }
}

fn check(field: &'static str, value: f64, min: f64, max: f64) -> Result<(), ValidationError> {
    // NaN fails both comparisons, so test for the accepted range instead
    if value >= min && value <= max {
        Ok(())
    } else {
        Err(ValidationError { field, value, min, max })
    }
}

impl fmt::Display for Reading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Voltage: {:.1}V, Current: {:.3}A, Power: {:.1}W, Energy: {:.0}Wh, \
             Frequency: {:.1}Hz, PowerFactor: {:.2}, Alarm: {}",
            self.voltage,
            self.current,
            self.power,
            self.energy,
            self.frequency,
            self.power_factor,
            self.alarm
        )
    }
}

/// CRC-16/MODBUS: init 0xFFFF, reflected polynomial 0xA001
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &byte in data {
        crc ^= u16::from(byte);
        for _ in 0..8 {
            if crc & 0x0001 != 0 {
                crc = (crc >> 1) ^ 0xA001;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

/// Checks the trailing little-endian CRC against the rest of the frame
pub fn verify_crc(frame: &[u8]) -> bool {
    if frame.len() < 3 {
        return false;
    }
    let (body, tail) = frame.split_at(frame.len() - 2);
    let received = u16::from_le_bytes([tail[0], tail[1]]);
    crc16(body) == received
}

/// Request frame `[address, 0x04, 0x00, 0x00, 0x00, 0x0A, crc_lo, crc_hi]`
pub fn build_command(address: u8) -> [u8; COMMAND_LEN] {
    let mut frame = [address, FN_READ_INPUT, 0x00, 0x00, 0x00, REGISTER_COUNT, 0, 0];
    let crc = crc16(&frame[..6]).to_le_bytes();
    frame[6] = crc[0];
    frame[7] = crc[1];
    frame
}

/// Decodes a response frame, stamping the reading with the current time
pub fn decode(frame: &[u8]) -> Result<Reading, ProtocolError> {
    decode_at(frame, Utc::now())
}

/// Decodes a response frame with an explicit timestamp
pub fn decode_at(frame: &[u8], timestamp: DateTime<Utc>) -> Result<Reading, ProtocolError> {
    if frame.len() < RESPONSE_LEN {
        return Err(ProtocolError::ShortFrame { len: frame.len() });
    }
    if !verify_crc(frame) {
        let (body, tail) = frame.split_at(frame.len() - 2);
        return Err(ProtocolError::CrcMismatch {
            received: u16::from_le_bytes([tail[0], tail[1]]),
            computed: crc16(body),
        });
    }

    // 32-bit values arrive low word first, each word big-endian. Device quirk, keep as is.
    let voltage = word(frame, 3);
    let current = split_dword(frame, 5);
    let power = split_dword(frame, 9);
    let energy = split_dword(frame, 13);
    let frequency = word(frame, 17);
    let power_factor = word(frame, 19);

    Ok(Reading {
        timestamp,
        voltage: f64::from(voltage) / 10.0,
        current: f64::from(current) / 1000.0,
        power: f64::from(power) / 10.0,
        energy: f64::from(energy),
        frequency: f64::from(frequency) / 10.0,
        power_factor: f64::from(power_factor) / 100.0,
        alarm: frame[21] != 0,
    })
}

fn word(frame: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([frame[at], frame[at + 1]])
}

fn split_dword(frame: &[u8], at: usize) -> u32 {
    let low = u32::from(word(frame, at));
    let high = u32::from(word(frame, at + 2));
    (high << 16) | low
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 220.0 V, 1.5 A, 330.0 W, 70000 Wh, 50.0 Hz, PF 0.95, no alarm
    fn fixture_frame() -> Vec<u8> {
        let mut frame = vec![0x01, 0x04, 0x14];
        frame.extend_from_slice(&2200u16.to_be_bytes());
        frame.extend_from_slice(&[0x05, 0xDC, 0x00, 0x00]); // 1500 mA
        frame.extend_from_slice(&[0x0C, 0xE4, 0x00, 0x00]); // 3300 dW
        frame.extend_from_slice(&[0x11, 0x70, 0x00, 0x01]); // 0x0001_1170 = 70000 Wh
        frame.extend_from_slice(&500u16.to_be_bytes());
        frame.extend_from_slice(&95u16.to_be_bytes());
        frame.extend_from_slice(&[0x00, 0x00]); // alarm register
        let crc = crc16(&frame).to_le_bytes();
        frame.extend_from_slice(&crc);
        frame
    }

    #[test]
    fn test_crc16_reference_vector() {
        // CRC-16/MODBUS check value
        assert_eq!(crc16(b"123456789"), 0x4B37);
        assert_eq!(crc16(&[]), 0xFFFF);
    }

    #[test]
    fn test_build_command() {
        let cmd = build_command(0x01);
        assert_eq!(cmd, [0x01, 0x04, 0x00, 0x00, 0x00, 0x0A, 0x70, 0x0D]);
        assert!(verify_crc(&cmd));
    }

    #[test]
    fn test_decode_fixture() {
        let frame = fixture_frame();
        assert_eq!(frame.len(), RESPONSE_LEN);

        let reading = decode(&frame).unwrap();
        assert_eq!(reading.voltage, 220.0);
        assert_eq!(reading.current, 1.5);
        assert_eq!(reading.power, 330.0);
        assert_eq!(reading.energy, 70000.0);
        assert_eq!(reading.frequency, 50.0);
        assert_eq!(reading.power_factor, 0.95);
        assert!(!reading.alarm);
    }

    #[test]
    fn test_decode_keeps_low_word_first() {
        let mut frame = fixture_frame();
        // current = high word 0x0001, low word 0x0000 -> 65536 mA
        frame[5..9].copy_from_slice(&[0x00, 0x00, 0x00, 0x01]);
        frame[21] = 0xFF;
        let len = frame.len();
        let crc = crc16(&frame[..len - 2]).to_le_bytes();
        frame[len - 2..].copy_from_slice(&crc);

        let reading = decode(&frame).unwrap();
        assert_eq!(reading.current, 65.536);
        assert!(reading.alarm);
    }

    #[test]
    fn test_any_flipped_byte_breaks_crc() {
        let frame = fixture_frame();
        assert!(verify_crc(&frame));
        for i in 0..frame.len() {
            let mut corrupted = frame.clone();
            corrupted[i] ^= 0x01;
            assert!(!verify_crc(&corrupted), "flip at byte {} went unnoticed", i);
        }
    }

    #[test]
    fn test_decode_rejects_bad_frames() {
        let frame = fixture_frame();
        assert_eq!(
            decode(&frame[..24]),
            Err(ProtocolError::ShortFrame { len: 24 })
        );
        assert!(matches!(decode(&[]), Err(ProtocolError::ShortFrame { len: 0 })));

        let mut corrupted = frame;
        corrupted[4] ^= 0x80;
        assert!(matches!(
            decode(&corrupted),
            Err(ProtocolError::CrcMismatch { .. })
        ));
    }

    fn nominal() -> Reading {
        decode(&fixture_frame()).unwrap()
    }

    #[test]
    fn test_validation_ranges() {
        let ok = nominal();
        assert!(ok.is_valid());

        let mut r = nominal();
        r.voltage = 250.0;
        assert!(r.is_valid());
        r.voltage = 301.0;
        assert_eq!(r.validate().unwrap_err().field, "voltage");

        let mut r = nominal();
        r.current = -1.0;
        assert_eq!(r.validate().unwrap_err().field, "current");

        let mut r = nominal();
        r.frequency = 70.0;
        assert_eq!(r.validate().unwrap_err().field, "frequency");

        let mut r = nominal();
        r.power_factor = 1.00;
        assert!(r.is_valid());
        r.power_factor = 1.01;
        assert_eq!(r.validate().unwrap_err().field, "power_factor");

        let mut r = nominal();
        r.power = f64::NAN;
        assert!(!r.is_valid());
    }

    #[test]
    fn test_display_format() {
        let text = nominal().to_string();
        assert!(text.starts_with("Voltage: 220.0V, Current: 1.500A"));
        assert!(text.ends_with("PowerFactor: 0.95, Alarm: false"));
    }
}
