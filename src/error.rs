//! # Thermo Modbus Error Handling
//!
//! Every failure the acquisition pipeline can produce is expressed as a
//! [`ThermoError`]. None of them is fatal: protocol and timeout errors cost one
//! tick, formula errors fall back to the builtin conversion, and calibration,
//! import and export errors are handed back to the caller.
//!
//! ## Error Categories
//!
//! ### Transport Errors
//! - **I/O Errors**: serial port or socket failures
//! - **Connection Errors**: port not open, bridge closed
//! - **Timeout Errors**: no response within the configured timeout
//!
//! ### Protocol Errors
//! - **Length / CRC / header mismatches** while validating a response frame
//! - **Exception Responses**: standard Modbus exception codes from the device
//!
//! ### Pipeline Errors
//! - **Formula**: custom conversion formula failed to compile or evaluate
//! - **NoData**: calibration requested on an empty history
//! - **Import / Export**: CSV could not be read or written
//! - **Session**: illegal start/pause/resume/stop transition
//!
//! ## Classification
//!
//! ```rust
//! use thermo_modbus::{ErrorKind, ThermoError};
//!
//! let error = ThermoError::crc_mismatch(0x0BC4, 0x1234);
//! assert!(error.is_protocol_error());
//! assert_eq!(error.kind(), ErrorKind::Protocol);
//!
//! let error = ThermoError::timeout("read holding registers", 1000);
//! assert!(error.is_recoverable());
//! ```

use std::fmt;
use thiserror::Error;

/// Result type alias used throughout the crate
pub type ThermoResult<T> = Result<T, ThermoError>;

/// Coarse error category, mirroring the failure taxonomy of the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Transport,
    Timeout,
    Protocol,
    Conversion,
    Calibration,
    Import,
    Export,
    Session,
    Configuration,
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Transport => "transport",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Protocol => "protocol",
            ErrorKind::Conversion => "conversion",
            ErrorKind::Calibration => "calibration",
            ErrorKind::Import => "import",
            ErrorKind::Export => "export",
            ErrorKind::Session => "session",
            ErrorKind::Configuration => "configuration",
            ErrorKind::Internal => "internal",
        };
        f.write_str(name)
    }
}

/// Errors produced by the acquisition and conversion pipeline
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ThermoError {
    /// I/O related errors (serial port, socket)
    #[error("I/O error: {message}")]
    Io { message: String },

    /// Transport not open, bridge closed, port could not be opened
    #[error("Connection error: {message}")]
    Connection { message: String },

    /// No response within the configured timeout
    #[error("Timeout after {timeout_ms}ms: {operation}")]
    Timeout { operation: String, timeout_ms: u64 },

    /// Response frame shorter than the minimum RTU frame
    #[error("Invalid frame length: {length} bytes (minimum {minimum})")]
    InvalidLength { length: usize, minimum: usize },

    /// Trailing CRC does not match the CRC computed over the frame body
    #[error("CRC validation failed: expected={expected:04X}, actual={actual:04X}")]
    CrcMismatch { expected: u16, actual: u16 },

    /// Response came from a different slave than the one addressed
    #[error("Slave mismatch: expected {expected}, got {actual}")]
    SlaveMismatch { expected: u8, actual: u8 },

    /// Response carries a different function code than the request
    #[error("Function code mismatch: expected 0x{expected:02X}, got 0x{actual:02X}")]
    FunctionCodeMismatch { expected: u8, actual: u8 },

    /// Modbus exception response returned by the device
    ///
    /// # Standard Exception Codes
    /// - 0x01: Illegal Function
    /// - 0x02: Illegal Data Address
    /// - 0x03: Illegal Data Value
    /// - 0x04: Slave Device Failure
    /// - 0x06: Slave Device Busy
    #[error("Modbus exception: function={function:02X}, code={code:02X} ({message})")]
    Exception { function: u8, code: u8, message: String },

    /// Structurally invalid payload (byte count, register count)
    #[error("Frame error: {message}")]
    Frame { message: String },

    /// Custom conversion formula failed; the builtin rule was used instead
    #[error("Formula error in '{formula}': {message}")]
    Formula { formula: String, message: String },

    /// Calibration was requested but there is no reading history
    #[error("No data available: {message}")]
    NoData { message: String },

    /// CSV import found no acceptable data row
    #[error("No valid rows found ({rejected} rejected)")]
    NoValidRows { rejected: usize },

    /// CSV import failed structurally
    #[error("Import error: {message}")]
    Import { message: String },

    /// Serialization of an export failed
    #[error("Export error: {message}")]
    Export { message: String },

    /// Illegal session transition (e.g. pause while already paused)
    #[error("Session error: {message}")]
    Session { message: String },

    /// Invalid configuration value
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Invalid argument value
    #[error("Invalid data: {message}")]
    InvalidData { message: String },

    /// Internal errors (lock poisoning and the like)
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl ThermoError {
    pub fn io<S: Into<String>>(message: S) -> Self {
        Self::Io { message: message.into() }
    }

    pub fn connection<S: Into<String>>(message: S) -> Self {
        Self::Connection { message: message.into() }
    }

    pub fn timeout<S: Into<String>>(operation: S, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    pub fn invalid_length(length: usize, minimum: usize) -> Self {
        Self::InvalidLength { length, minimum }
    }

    pub fn crc_mismatch(expected: u16, actual: u16) -> Self {
        Self::CrcMismatch { expected, actual }
    }

    pub fn slave_mismatch(expected: u8, actual: u8) -> Self {
        Self::SlaveMismatch { expected, actual }
    }

    pub fn function_code_mismatch(expected: u8, actual: u8) -> Self {
        Self::FunctionCodeMismatch { expected, actual }
    }

    /// Create a Modbus exception error
    ///
    /// Maps standard exception codes to human-readable messages.
    pub fn exception(function: u8, code: u8) -> Self {
        let message = match code {
            0x01 => "Illegal Function",
            0x02 => "Illegal Data Address",
            0x03 => "Illegal Data Value",
            0x04 => "Slave Device Failure",
            0x05 => "Acknowledge",
            0x06 => "Slave Device Busy",
            0x08 => "Memory Parity Error",
            0x0A => "Gateway Path Unavailable",
            0x0B => "Gateway Target Device Failed to Respond",
            _ => "Unknown Exception",
        }
        .to_string();

        Self::Exception {
            function,
            code,
            message,
        }
    }

    pub fn frame<S: Into<String>>(message: S) -> Self {
        Self::Frame { message: message.into() }
    }

    pub fn formula<F: Into<String>, S: Into<String>>(formula: F, message: S) -> Self {
        Self::Formula {
            formula: formula.into(),
            message: message.into(),
        }
    }

    pub fn no_data<S: Into<String>>(message: S) -> Self {
        Self::NoData { message: message.into() }
    }

    pub fn no_valid_rows(rejected: usize) -> Self {
        Self::NoValidRows { rejected }
    }

    pub fn import<S: Into<String>>(message: S) -> Self {
        Self::Import { message: message.into() }
    }

    pub fn export<S: Into<String>>(message: S) -> Self {
        Self::Export { message: message.into() }
    }

    pub fn session<S: Into<String>>(message: S) -> Self {
        Self::Session { message: message.into() }
    }

    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration { message: message.into() }
    }

    pub fn invalid_data<S: Into<String>>(message: S) -> Self {
        Self::InvalidData { message: message.into() }
    }

    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal { message: message.into() }
    }

    /// Category of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Io { .. } | Self::Connection { .. } => ErrorKind::Transport,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::InvalidLength { .. }
            | Self::CrcMismatch { .. }
            | Self::SlaveMismatch { .. }
            | Self::FunctionCodeMismatch { .. }
            | Self::Exception { .. }
            | Self::Frame { .. } => ErrorKind::Protocol,
            Self::Formula { .. } => ErrorKind::Conversion,
            Self::NoData { .. } => ErrorKind::Calibration,
            Self::NoValidRows { .. } | Self::Import { .. } => ErrorKind::Import,
            Self::Export { .. } => ErrorKind::Export,
            Self::Session { .. } => ErrorKind::Session,
            Self::Configuration { .. } | Self::InvalidData { .. } => ErrorKind::Configuration,
            Self::Internal { .. } => ErrorKind::Internal,
        }
    }

    /// Check if the error is recoverable (the next attempt may succeed)
    ///
    /// Timeouts, transport hiccups and line noise (CRC, framing) are worth
    /// retrying; configuration and data errors are not.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Io { .. } | Self::Timeout { .. } => true,
            Self::InvalidLength { .. } | Self::CrcMismatch { .. } | Self::Frame { .. } => true,
            Self::Exception { code, .. } => matches!(code, 0x05 | 0x06),
            _ => false,
        }
    }

    /// Check if the error is a transport issue
    pub fn is_transport_error(&self) -> bool {
        matches!(
            self,
            Self::Io { .. } | Self::Connection { .. } | Self::Timeout { .. }
        )
    }

    /// Check if the error is a Modbus protocol issue
    pub fn is_protocol_error(&self) -> bool {
        self.kind() == ErrorKind::Protocol
    }
}

impl From<std::io::Error> for ThermoError {
    fn from(err: std::io::Error) -> Self {
        Self::io(err.to_string())
    }
}

/// Tokio's elapsed error carries no duration; callers that know the
/// configured timeout build [`ThermoError::timeout`] directly.
impl From<tokio::time::error::Elapsed> for ThermoError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Self::timeout("Operation timeout", 0)
    }
}

impl From<serde_json::Error> for ThermoError {
    fn from(err: serde_json::Error) -> Self {
        Self::configuration(format!("JSON error: {}", err))
    }
}

impl From<serde_yaml::Error> for ThermoError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::configuration(format!("YAML error: {}", err))
    }
}

/// The formula text is unknown here; the converter attaches it itself
impl From<evalexpr::EvalexprError> for ThermoError {
    fn from(err: evalexpr::EvalexprError) -> Self {
        Self::formula("", err.to_string())
    }
}

impl From<csv::Error> for ThermoError {
    fn from(err: csv::Error) -> Self {
        Self::import(format!("CSV error: {}", err))
    }
}

impl From<tokio_serial::Error> for ThermoError {
    fn from(err: tokio_serial::Error) -> Self {
        Self::connection(format!("Serial port error: {}", err))
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ThermoError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::connection(format!("WebSocket error: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = ThermoError::timeout("read_registers", 1000);
        assert!(err.is_recoverable());
        assert!(err.is_transport_error());
        assert_eq!(err.kind(), ErrorKind::Timeout);

        let err = ThermoError::exception(0x03, 0x02);
        assert!(!err.is_recoverable());
        assert!(err.is_protocol_error());

        let err = ThermoError::exception(0x03, 0x06);
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_error_display() {
        let err = ThermoError::crc_mismatch(0x1234, 0x5678);
        let msg = format!("{}", err);
        assert!(msg.contains("CRC validation failed"));
        assert!(msg.contains("1234"));
        assert!(msg.contains("5678"));

        let err = ThermoError::function_code_mismatch(0x03, 0x04);
        assert_eq!(
            err.to_string(),
            "Function code mismatch: expected 0x03, got 0x04"
        );
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(ThermoError::no_data("empty").kind(), ErrorKind::Calibration);
        assert_eq!(ThermoError::no_valid_rows(3).kind(), ErrorKind::Import);
        assert_eq!(ThermoError::formula("x", "bad").kind(), ErrorKind::Conversion);
        assert_eq!(ThermoError::session("bad").kind(), ErrorKind::Session);
        assert!(!ThermoError::connection("closed").is_recoverable());
        assert!(ThermoError::connection("closed").is_transport_error());
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe closed");
        let err: ThermoError = io.into();
        assert!(matches!(err, ThermoError::Io { .. }));
        assert!(err.to_string().contains("pipe closed"));
    }
}
