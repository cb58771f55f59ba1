/// Modbus RTU frame codec
///
/// Builds function 0x03 request frames and validates response frames,
/// including CRC-16/MODBUS computation. Only "read holding registers" is
/// encoded; the remaining function codes are listed so configuration and
/// log output can name them.
use byteorder::{BigEndian, ByteOrder};
use crc::{Crc, CRC_16_MODBUS};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{ThermoError, ThermoResult};

/// Modbus address type (0-65535)
pub type ModbusAddress = u16;

/// Modbus slave/unit identifier (1-247)
pub type SlaveId = u8;

/// Length of a function 0x03 request frame
pub const READ_REQUEST_FRAME_LEN: usize = 8;

/// Smallest valid response frame: slave, function, one byte, CRC
pub const MIN_RESPONSE_FRAME_LEN: usize = 5;

/// CRC calculator for RTU (poly 0xA001 reflected, init 0xFFFF)
const CRC_MODBUS: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

/// Modbus function codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ModbusFunction {
    ReadCoils = 0x01,
    ReadDiscreteInputs = 0x02,
    ReadHoldingRegisters = 0x03,
    ReadInputRegisters = 0x04,
    WriteSingleCoil = 0x05,
    WriteSingleRegister = 0x06,
    WriteMultipleCoils = 0x0F,
    WriteMultipleRegisters = 0x10,
}

impl ModbusFunction {
    /// Convert from u8 to ModbusFunction
    pub fn from_u8(value: u8) -> ThermoResult<Self> {
        match value {
            0x01 => Ok(ModbusFunction::ReadCoils),
            0x02 => Ok(ModbusFunction::ReadDiscreteInputs),
            0x03 => Ok(ModbusFunction::ReadHoldingRegisters),
            0x04 => Ok(ModbusFunction::ReadInputRegisters),
            0x05 => Ok(ModbusFunction::WriteSingleCoil),
            0x06 => Ok(ModbusFunction::WriteSingleRegister),
            0x0F => Ok(ModbusFunction::WriteMultipleCoils),
            0x10 => Ok(ModbusFunction::WriteMultipleRegisters),
            _ => Err(ThermoError::frame(format!("Unknown function code 0x{:02X}", value))),
        }
    }

    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Check if this is a write function
    pub fn is_write_function(self) -> bool {
        matches!(
            self,
            ModbusFunction::WriteSingleCoil
                | ModbusFunction::WriteSingleRegister
                | ModbusFunction::WriteMultipleCoils
                | ModbusFunction::WriteMultipleRegisters
        )
    }
}

impl fmt::Display for ModbusFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ModbusFunction::ReadCoils => "Read Coils",
            ModbusFunction::ReadDiscreteInputs => "Read Discrete Inputs",
            ModbusFunction::ReadHoldingRegisters => "Read Holding Registers",
            ModbusFunction::ReadInputRegisters => "Read Input Registers",
            ModbusFunction::WriteSingleCoil => "Write Single Coil",
            ModbusFunction::WriteSingleRegister => "Write Single Register",
            ModbusFunction::WriteMultipleCoils => "Write Multiple Coils",
            ModbusFunction::WriteMultipleRegisters => "Write Multiple Registers",
        };
        write!(f, "{} (0x{:02X})", name, *self as u8)
    }
}

/// Compute the Modbus CRC-16 of `data`
pub fn compute_crc16(data: &[u8]) -> u16 {
    CRC_MODBUS.checksum(data)
}

/// Check the trailing little-endian CRC of a complete frame
pub fn validate_crc(frame: &[u8]) -> bool {
    if frame.len() < 3 {
        return false;
    }
    let body_len = frame.len() - 2;
    let received = u16::from_le_bytes([frame[body_len], frame[body_len + 1]]);
    received == compute_crc16(&frame[..body_len])
}

/// Build a "read holding registers" request
///
/// Layout: `[slave, 0x03, addrHi, addrLo, qtyHi, qtyLo, crcLo, crcHi]`.
/// Address and quantity are big-endian, the CRC is little-endian.
pub fn build_read_holding_registers_frame(
    slave_id: SlaveId,
    start_address: ModbusAddress,
    quantity: u16,
) -> ThermoResult<[u8; READ_REQUEST_FRAME_LEN]> {
    crate::utils::validation::validate_slave_id(slave_id)?;
    crate::utils::validation::validate_register_count(quantity)?;
    crate::utils::validation::validate_address_range(start_address, quantity)?;

    let mut frame = [0u8; READ_REQUEST_FRAME_LEN];
    frame[0] = slave_id;
    frame[1] = ModbusFunction::ReadHoldingRegisters.to_u8();
    BigEndian::write_u16(&mut frame[2..4], start_address);
    BigEndian::write_u16(&mut frame[4..6], quantity);

    let crc = compute_crc16(&frame[..6]);
    frame[6..8].copy_from_slice(&crc.to_le_bytes());

    Ok(frame)
}

/// A response frame that passed CRC and header validation
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseFrame {
    pub slave_id: SlaveId,
    pub function_code: u8,
    /// Payload between the function code and the CRC
    pub data: Vec<u8>,
}

impl ResponseFrame {
    /// Decode the register values of a 0x03 response
    ///
    /// The payload is a byte count followed by big-endian u16 values; the
    /// byte count must cover exactly `expected_quantity` registers.
    pub fn registers(&self, expected_quantity: u16) -> ThermoResult<Vec<u16>> {
        let byte_count = *self
            .data
            .first()
            .ok_or_else(|| ThermoError::frame("Empty response data"))? as usize;

        if byte_count % 2 != 0 {
            return Err(ThermoError::frame(format!(
                "Invalid register data length: {}",
                byte_count
            )));
        }
        if self.data.len() < 1 + byte_count {
            return Err(ThermoError::frame(format!(
                "Incomplete register data: byte count {} but {} bytes present",
                byte_count,
                self.data.len() - 1
            )));
        }
        if byte_count != expected_quantity as usize * 2 {
            return Err(ThermoError::frame(format!(
                "Expected {} registers, response carries {}",
                expected_quantity,
                byte_count / 2
            )));
        }

        Ok(self.data[1..1 + byte_count]
            .chunks_exact(2)
            .map(BigEndian::read_u16)
            .collect())
    }
}

/// Validate a response frame against the request that produced it
///
/// Checks run in order: minimum length, CRC, slave id, exception flag,
/// function code.
pub fn parse_response(
    frame: &[u8],
    expected_slave: SlaveId,
    expected_function: ModbusFunction,
) -> ThermoResult<ResponseFrame> {
    if frame.len() < MIN_RESPONSE_FRAME_LEN {
        return Err(ThermoError::invalid_length(frame.len(), MIN_RESPONSE_FRAME_LEN));
    }

    let body_len = frame.len() - 2;
    let received_crc = u16::from_le_bytes([frame[body_len], frame[body_len + 1]]);
    let calculated_crc = compute_crc16(&frame[..body_len]);
    if received_crc != calculated_crc {
        return Err(ThermoError::crc_mismatch(calculated_crc, received_crc));
    }

    let slave_id = frame[0];
    if slave_id != expected_slave {
        return Err(ThermoError::slave_mismatch(expected_slave, slave_id));
    }

    let function_code = frame[1];
    if function_code & 0x80 != 0 && function_code & 0x7F == expected_function.to_u8() {
        return Err(ThermoError::exception(function_code & 0x7F, frame[2]));
    }
    if function_code != expected_function.to_u8() {
        return Err(ThermoError::function_code_mismatch(
            expected_function.to_u8(),
            function_code,
        ));
    }

    Ok(ResponseFrame {
        slave_id,
        function_code,
        data: frame[2..body_len].to_vec(),
    })
}

/// Build a 0x03 response frame; used by simulators and tests
pub fn build_read_holding_registers_response(slave_id: SlaveId, values: &[u16]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(5 + values.len() * 2);
    frame.push(slave_id);
    frame.push(ModbusFunction::ReadHoldingRegisters.to_u8());
    frame.push((values.len() * 2) as u8);
    for value in values {
        frame.extend_from_slice(&value.to_be_bytes());
    }
    let crc = compute_crc16(&frame);
    frame.extend_from_slice(&crc.to_le_bytes());
    frame
}

/// Expected total length of a response, given its first bytes
///
/// Returns `None` while not enough header bytes are known.
pub fn expected_response_len(header: &[u8]) -> Option<usize> {
    let function_code = *header.get(1)?;
    if function_code & 0x80 != 0 {
        return Some(5);
    }
    match function_code {
        0x01..=0x04 => header.get(2).map(|&count| 5 + count as usize),
        0x05 | 0x06 | 0x0F | 0x10 => Some(8),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Bit-by-bit reference implementation
    fn reference_crc16(data: &[u8]) -> u16 {
        let mut crc: u16 = 0xFFFF;
        for &byte in data {
            crc ^= byte as u16;
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

    #[test]
    fn test_crc_matches_reference() {
        let samples: [&[u8]; 4] = [
            &[0x01, 0x03, 0x00, 0x00, 0x00, 0x02],
            &[0x11, 0x03, 0x00, 0x6B, 0x00, 0x03],
            &[],
            &[0xFF; 32],
        ];
        for data in samples {
            assert_eq!(compute_crc16(data), reference_crc16(data));
        }
        assert_eq!(compute_crc16(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x02]), 0x0BC4);
    }

    #[test]
    fn test_build_frame_layout() {
        let frame = build_read_holding_registers_frame(1, 0, 2).unwrap();
        assert_eq!(frame, [0x01, 0x03, 0x00, 0x00, 0x00, 0x02, 0xC4, 0x0B]);

        let frame = build_read_holding_registers_frame(0x11, 0x006B, 3).unwrap();
        assert_eq!(&frame[..6], &[0x11, 0x03, 0x00, 0x6B, 0x00, 0x03]);
        assert!(validate_crc(&frame));
    }

    #[test]
    fn test_build_frame_validation() {
        assert!(build_read_holding_registers_frame(0, 0, 1).is_err());
        assert!(build_read_holding_registers_frame(248, 0, 1).is_err());
        assert!(build_read_holding_registers_frame(1, 0, 0).is_err());
        assert!(build_read_holding_registers_frame(1, 0, 126).is_err());
        assert!(build_read_holding_registers_frame(1, 65535, 2).is_err());
        assert!(build_read_holding_registers_frame(247, 65535, 1).is_ok());
    }

    #[test]
    fn test_parse_valid_response() {
        let frame = vec![0x01, 0x03, 0x04, 0x00, 0x0A, 0x00, 0x0B, 0x2B, 0xF5];
        let frame_crc = compute_crc16(&frame[..7]).to_le_bytes();
        let mut frame = frame;
        frame[7] = frame_crc[0];
        frame[8] = frame_crc[1];

        let response = parse_response(&frame, 1, ModbusFunction::ReadHoldingRegisters).unwrap();
        assert_eq!(response.slave_id, 1);
        assert_eq!(response.function_code, 0x03);
        assert_eq!(response.registers(2).unwrap(), vec![0x000A, 0x000B]);
    }

    #[test]
    fn test_parse_errors() {
        let short = [0x01, 0x03, 0x02, 0x00];
        assert!(matches!(
            parse_response(&short, 1, ModbusFunction::ReadHoldingRegisters),
            Err(ThermoError::InvalidLength { length: 4, .. })
        ));

        let mut corrupted = build_read_holding_registers_response(1, &[400]);
        corrupted[3] ^= 0xFF;
        assert!(matches!(
            parse_response(&corrupted, 1, ModbusFunction::ReadHoldingRegisters),
            Err(ThermoError::CrcMismatch { .. })
        ));

        let other_slave = build_read_holding_registers_response(2, &[400]);
        assert_eq!(
            parse_response(&other_slave, 1, ModbusFunction::ReadHoldingRegisters),
            Err(ThermoError::slave_mismatch(1, 2))
        );

        let mut other_function = vec![0x01, 0x04, 0x02, 0x01, 0x90];
        let crc = compute_crc16(&other_function);
        other_function.extend_from_slice(&crc.to_le_bytes());
        assert_eq!(
            parse_response(&other_function, 1, ModbusFunction::ReadHoldingRegisters),
            Err(ThermoError::function_code_mismatch(0x03, 0x04))
        );
    }

    #[test]
    fn test_parse_exception_response() {
        let mut frame = vec![0x01, 0x83, 0x02];
        let crc = compute_crc16(&frame);
        frame.extend_from_slice(&crc.to_le_bytes());

        match parse_response(&frame, 1, ModbusFunction::ReadHoldingRegisters) {
            Err(ThermoError::Exception { function, code, message }) => {
                assert_eq!(function, 0x03);
                assert_eq!(code, 0x02);
                assert_eq!(message, "Illegal Data Address");
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_register_count_mismatch() {
        let frame = build_read_holding_registers_response(1, &[1, 2]);
        let response = parse_response(&frame, 1, ModbusFunction::ReadHoldingRegisters).unwrap();
        assert!(response.registers(3).is_err());
    }

    #[test]
    fn test_expected_response_len() {
        assert_eq!(expected_response_len(&[0x01]), None);
        assert_eq!(expected_response_len(&[0x01, 0x03]), None);
        assert_eq!(expected_response_len(&[0x01, 0x03, 0x04]), Some(9));
        assert_eq!(expected_response_len(&[0x01, 0x83]), Some(5));
        assert_eq!(expected_response_len(&[0x01, 0x06]), Some(8));
    }

    #[test]
    fn test_function_conversion() {
        assert_eq!(
            ModbusFunction::from_u8(0x03).unwrap(),
            ModbusFunction::ReadHoldingRegisters
        );
        assert!(ModbusFunction::from_u8(0xFF).is_err());
        assert!(ModbusFunction::WriteSingleRegister.is_write_function());
        assert_eq!(
            ModbusFunction::ReadHoldingRegisters.to_string(),
            "Read Holding Registers (0x03)"
        );
    }
}
