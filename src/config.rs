//! # Acquisition Configuration
//!
//! Configuration objects consumed by the pipeline. Field names are
//! camelCase on the wire so a dashboard configuration can be loaded as-is:
//!
//! ```yaml
//! slaveId: 1
//! timeoutMs: 1000
//! serial:
//!   port: /dev/ttyUSB0
//!   baudRate: 9600
//!   startRegister: 40001
//!   registerCount: 4
//!   offsetAddress: 40001
//! recording:
//!   interval: 0.5
//!   selectedChannels: [1, 2, 3, 4]
//! conversion:
//!   mode: custom
//!   customFormula: "signed16(registerValue) / 100"
//! ```

use log::warn;
use serde::{Deserialize, Deserializer, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::calibration::CalibrationOffset;
use crate::error::{ThermoError, ThermoResult};
use crate::utils::validation;

/// Minimum acquisition period (10 Hz)
pub const MIN_INTERVAL_SECS: f64 = 0.1;

/// Serial parity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    #[default]
    None,
    Even,
    Odd,
}

impl From<Parity> for tokio_serial::Parity {
    fn from(parity: Parity) -> Self {
        match parity {
            Parity::None => tokio_serial::Parity::None,
            Parity::Even => tokio_serial::Parity::Even,
            Parity::Odd => tokio_serial::Parity::Odd,
        }
    }
}

/// Transport and register parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SerialConfig {
    pub port: String,
    pub baud_rate: u32,
    pub data_bits: u8,
    pub stop_bits: u8,
    pub parity: Parity,
    pub start_register: u16,
    pub register_count: u16,
    /// Bias subtracted from configured addresses (e.g. 40001); 0 disables it
    pub offset_address: u16,
    /// Explicit address list, overrides start/count when non-empty
    #[serde(deserialize_with = "deserialize_custom_registers")]
    pub custom_registers: Option<Vec<u16>>,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".to_string(),
            baud_rate: 9600,
            data_bits: 8,
            stop_bits: 1,
            parity: Parity::None,
            start_register: 0,
            register_count: 8,
            offset_address: 0,
            custom_registers: None,
        }
    }
}

impl SerialConfig {
    /// Custom register list, if present and non-empty
    pub fn custom_list(&self) -> Option<&[u16]> {
        self.custom_registers
            .as_deref()
            .filter(|registers| !registers.is_empty())
    }

    pub fn data_bits(&self) -> ThermoResult<tokio_serial::DataBits> {
        match self.data_bits {
            5 => Ok(tokio_serial::DataBits::Five),
            6 => Ok(tokio_serial::DataBits::Six),
            7 => Ok(tokio_serial::DataBits::Seven),
            8 => Ok(tokio_serial::DataBits::Eight),
            other => Err(ThermoError::configuration(format!("Unsupported data bits: {}", other))),
        }
    }

    pub fn stop_bits(&self) -> ThermoResult<tokio_serial::StopBits> {
        match self.stop_bits {
            1 => Ok(tokio_serial::StopBits::One),
            2 => Ok(tokio_serial::StopBits::Two),
            other => Err(ThermoError::configuration(format!("Unsupported stop bits: {}", other))),
        }
    }

    pub fn validate(&self) -> ThermoResult<()> {
        if self.baud_rate == 0 {
            return Err(ThermoError::configuration("Baud rate must be positive"));
        }
        self.data_bits()?;
        self.stop_bits()?;
        if self.custom_list().is_none()
            && (self.register_count == 0 || self.register_count as usize > crate::MAX_CHANNELS)
        {
            return Err(ThermoError::configuration(format!(
                "Register count must be 1-{}, got {}",
                crate::MAX_CHANNELS,
                self.register_count
            )));
        }
        if let Some(registers) = &self.custom_registers {
            if registers.len() > crate::MAX_CHANNELS {
                return Err(ThermoError::configuration(format!(
                    "At most {} custom registers are supported, got {}",
                    crate::MAX_CHANNELS,
                    registers.len()
                )));
            }
        }
        Ok(())
    }
}

/// Drops out-of-range entries and truncates to the channel limit
fn deserialize_custom_registers<'de, D>(deserializer: D) -> Result<Option<Vec<u16>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<Vec<i64>> = Option::deserialize(deserializer)?;
    Ok(raw.map(|values| {
        values
            .into_iter()
            .filter_map(|value| u16::try_from(value).ok())
            .take(crate::MAX_CHANNELS)
            .collect()
    }))
}

/// Recording parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RecordingConfig {
    /// Tick period in seconds
    pub interval: f64,
    /// Channels to record; empty means every resolved channel
    pub selected_channels: Vec<u8>,
    pub is_recording: bool,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            interval: 1.0,
            selected_channels: Vec::new(),
            is_recording: false,
        }
    }
}

impl RecordingConfig {
    /// Tick period with the 10 Hz ceiling applied
    pub fn period(&self) -> Duration {
        period_from_secs(self.interval)
    }

    /// Recording frequency in Hz after the ceiling is applied
    pub fn frequency_hz(&self) -> f64 {
        1.0 / self.period().as_secs_f64()
    }

    pub fn is_selected(&self, channel: u8) -> bool {
        self.selected_channels.is_empty() || self.selected_channels.contains(&channel)
    }
}

fn period_from_secs(secs: f64) -> Duration {
    if !secs.is_finite() || secs < MIN_INTERVAL_SECS {
        Duration::from_secs_f64(MIN_INTERVAL_SECS)
    } else {
        Duration::from_secs_f64(secs)
    }
}

/// Soft temperature envelope for synthetic data
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TemperatureRange {
    pub min: f64,
    pub max: f64,
}

impl Default for TemperatureRange {
    fn default() -> Self {
        Self { min: 20.0, max: 30.0 }
    }
}

/// Synthetic data generation parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TestModeConfig {
    pub enabled: bool,
    /// Generation rate in Hz (capped at 10 Hz)
    pub data_generation_rate: f64,
    pub temperature_range: TemperatureRange,
    /// Half-width of the uniform noise in °C
    pub noise_level: f64,
    /// Fixed RNG seed for reproducible runs
    pub seed: Option<u64>,
}

impl Default for TestModeConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            data_generation_rate: 1.0,
            temperature_range: TemperatureRange::default(),
            noise_level: 0.5,
            seed: None,
        }
    }
}

impl TestModeConfig {
    pub fn period(&self) -> Duration {
        if self.data_generation_rate > 0.0 {
            period_from_secs(1.0 / self.data_generation_rate)
        } else {
            period_from_secs(f64::NAN)
        }
    }

    pub fn validate(&self) -> ThermoResult<()> {
        if !(self.data_generation_rate > 0.0) {
            return Err(ThermoError::configuration(
                "Data generation rate must be positive",
            ));
        }
        if !(self.temperature_range.min < self.temperature_range.max) {
            return Err(ThermoError::configuration(format!(
                "Temperature range min ({}) must be below max ({})",
                self.temperature_range.min, self.temperature_range.max
            )));
        }
        if self.noise_level < 0.0 {
            return Err(ThermoError::configuration("Noise level must not be negative"));
        }
        Ok(())
    }
}

/// Raw-to-temperature conversion mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversionMode {
    #[default]
    Builtin,
    Custom,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TemperatureConversionConfig {
    pub mode: ConversionMode,
    pub custom_formula: String,
    /// Raw value used to preview the formula
    pub test_value: i64,
}

impl Default for TemperatureConversionConfig {
    fn default() -> Self {
        Self {
            mode: ConversionMode::Builtin,
            custom_formula: "registerValue * 0.1".to_string(),
            test_value: 400,
        }
    }
}

/// Complete configuration of one acquisition setup
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AcquisitionConfig {
    pub slave_id: u8,
    pub timeout_ms: u64,
    /// In-tick retries for recoverable failures
    pub retries: u32,
    /// WebSocket bridge URL; when set it replaces the serial port
    pub bridge_url: Option<String>,
    /// Hex-dump every frame sent and received
    pub packet_logging: bool,
    pub serial: SerialConfig,
    pub recording: RecordingConfig,
    pub test_mode: TestModeConfig,
    pub conversion: TemperatureConversionConfig,
    pub calibration: Vec<CalibrationOffset>,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            slave_id: 1,
            timeout_ms: crate::DEFAULT_TIMEOUT_MS,
            retries: 0,
            bridge_url: None,
            packet_logging: false,
            serial: SerialConfig::default(),
            recording: RecordingConfig::default(),
            test_mode: TestModeConfig::default(),
            conversion: TemperatureConversionConfig::default(),
            calibration: Vec::new(),
        }
    }
}

impl AcquisitionConfig {
    /// Load from a `.yaml`/`.yml` or `.json` file and validate it
    pub fn from_file<P: AsRef<Path>>(path: P) -> ThermoResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            ThermoError::configuration(format!("Cannot read {}: {}", path.display(), e))
        })?;

        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_ascii_lowercase());
        match extension.as_deref() {
            Some("yaml") | Some("yml") => Self::from_yaml_str(&text),
            Some("json") => Self::from_json_str(&text),
            _ => Err(ThermoError::configuration(format!(
                "Unsupported configuration format: {}",
                path.display()
            ))),
        }
    }

    pub fn from_yaml_str(text: &str) -> ThermoResult<Self> {
        let config: Self = serde_yaml::from_str(text)?;
        config.normalized()
    }

    pub fn from_json_str(text: &str) -> ThermoResult<Self> {
        let config: Self = serde_json::from_str(text)?;
        config.normalized()
    }

    /// Raise sub-minimum intervals to the 10 Hz ceiling, then validate
    pub fn normalized(mut self) -> ThermoResult<Self> {
        if !(self.recording.interval >= MIN_INTERVAL_SECS) {
            warn!(
                "Recording interval {}s below minimum, using {}s",
                self.recording.interval, MIN_INTERVAL_SECS
            );
            self.recording.interval = MIN_INTERVAL_SECS;
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> ThermoResult<()> {
        validation::validate_slave_id(self.slave_id)
            .map_err(|e| ThermoError::configuration(e.to_string()))?;
        if self.timeout_ms == 0 {
            return Err(ThermoError::configuration("Timeout must be positive"));
        }
        self.serial.validate()?;
        if self.test_mode.enabled {
            self.test_mode.validate()?;
        }
        for channel in &self.recording.selected_channels {
            validation::validate_channel(*channel)
                .map_err(|e| ThermoError::configuration(e.to_string()))?;
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}
