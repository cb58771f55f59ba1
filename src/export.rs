//! CSV export and import
//!
//! Exports start with a `#` comment block describing the device, the
//! recording and the session, followed by
//! `Timestamp,Channel,Temperature_C,Raw_Value[,Calibrated_Temperature_C]`.
//! Timestamps are written as epoch milliseconds; temperatures with one
//! decimal.
//!
//! Import is lenient per row and strict per file: malformed rows are counted
//! and skipped, but a file without a header row or without a single valid
//! row is refused as a whole.

use chrono::{DateTime, Local, TimeZone};
use log::{info, warn};
use std::path::{Path, PathBuf};

use crate::calibration::CalibrationSet;
use crate::config::{AcquisitionConfig, SerialConfig};
use crate::converter::encode_builtin;
use crate::error::{ThermoError, ThermoResult};
use crate::reading::TemperatureReading;
use crate::session::SessionTracker;
use crate::utils::format::{format_millis, format_timestamp};
use crate::utils::now_millis;

/// Lowest temperature accepted on import (absolute zero)
pub const MIN_IMPORT_TEMPERATURE: f64 = -273.15;
/// Highest temperature accepted on import
pub const MAX_IMPORT_TEMPERATURE: f64 = 1000.0;

const HEADER: [&str; 4] = ["Timestamp", "Channel", "Temperature_C", "Raw_Value"];
const CALIBRATED_HEADER: &str = "Calibrated_Temperature_C";

/// Context written into the export header and file name
#[derive(Debug, Clone)]
pub struct ExportMetadata {
    /// Export time, epoch milliseconds
    pub exported_at: i64,
    pub slave_id: u8,
    pub serial: SerialConfig,
    pub frequency_hz: f64,
    pub calibration: CalibrationSet,
    pub session: SessionTracker,
}

impl ExportMetadata {
    pub fn new(config: &AcquisitionConfig, calibration: CalibrationSet, session: SessionTracker) -> Self {
        let frequency_hz = if config.test_mode.enabled {
            1.0 / config.test_mode.period().as_secs_f64()
        } else {
            config.recording.frequency_hz()
        };

        Self {
            exported_at: now_millis(),
            slave_id: config.slave_id,
            serial: config.serial.clone(),
            frequency_hz,
            calibration,
            session,
        }
    }

    fn register_description(&self) -> String {
        match self.serial.custom_list() {
            Some(registers) => format!(
                "custom [{}]",
                registers
                    .iter()
                    .map(|r| r.to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
            None => format!(
                "{}-{} ({} registers)",
                self.serial.start_register,
                last_register(&self.serial),
                self.serial.register_count
            ),
        }
    }
}

fn last_register(serial: &SerialConfig) -> u32 {
    serial.start_register as u32 + serial.register_count.max(1) as u32 - 1
}

/// Successful import
#[derive(Debug, Clone, PartialEq)]
pub struct ImportReport {
    /// Accepted readings sorted by timestamp
    pub readings: Vec<TemperatureReading>,
    /// Number of data rows that were skipped
    pub rejected: usize,
}

/// Serialize `readings` with a metadata header
pub fn to_csv(readings: &[TemperatureReading], metadata: &ExportMetadata) -> ThermoResult<String> {
    let has_calibrated = readings.iter().any(|r| r.calibrated_temperature.is_some());

    let mut text = String::new();
    for line in header_lines(readings, metadata) {
        text.push_str("# ");
        text.push_str(&line);
        text.push('\n');
    }

    let mut writer = csv::Writer::from_writer(Vec::new());
    let export_error = |e: csv::Error| ThermoError::export(e.to_string());

    let mut header: Vec<&str> = HEADER.to_vec();
    if has_calibrated {
        header.push(CALIBRATED_HEADER);
    }
    writer.write_record(&header).map_err(export_error)?;

    for reading in readings {
        let mut row = vec![
            reading.timestamp.to_string(),
            reading.channel.to_string(),
            format!("{:.1}", reading.temperature),
            reading.raw_value.to_string(),
        ];
        if has_calibrated {
            row.push(
                reading
                    .calibrated_temperature
                    .map(|value| format!("{:.1}", value))
                    .unwrap_or_default(),
            );
        }
        writer.write_record(&row).map_err(export_error)?;
    }

    let body = writer
        .into_inner()
        .map_err(|e| ThermoError::export(e.to_string()))?;
    let body = String::from_utf8(body).map_err(|e| ThermoError::export(e.to_string()))?;
    text.push_str(&body);
    Ok(text)
}

fn header_lines(readings: &[TemperatureReading], metadata: &ExportMetadata) -> Vec<String> {
    let serial = &metadata.serial;
    let mut lines = vec![
        "Temperature Data Export".to_string(),
        format!("Export Date: {}", format_timestamp(metadata.exported_at)),
        format!(
            "Device: slave {} on {} ({} baud, {}{}{})",
            metadata.slave_id,
            serial.port,
            serial.baud_rate,
            serial.data_bits,
            match serial.parity {
                crate::config::Parity::None => "N",
                crate::config::Parity::Even => "E",
                crate::config::Parity::Odd => "O",
            },
            serial.stop_bits
        ),
        format!("Registers: {}", metadata.register_description()),
    ];
    if serial.offset_address > 0 {
        lines.push(format!("Address Offset: {}", serial.offset_address));
    }
    lines.push(format!("Recording Frequency: {} Hz", format_frequency(metadata.frequency_hz)));

    let first = readings.iter().map(|r| r.timestamp).min();
    let last = readings.iter().map(|r| r.timestamp).max();
    if let (Some(first), Some(last)) = (first, last) {
        lines.push(format!(
            "Time Range: {} to {} ({})",
            format_timestamp(first),
            format_timestamp(last),
            format_millis(last - first)
        ));
    }
    lines.push(format!("Records: {}", readings.len()));

    let calibrated: Vec<String> = metadata
        .calibration
        .offsets()
        .iter()
        .filter(|offset| offset.enabled)
        .map(|offset| format!("CH{} ({:+.2} °C)", offset.channel_id, offset.offset))
        .collect();
    if !calibrated.is_empty() {
        lines.push(format!("Calibrated Channels: {}", calibrated.join(", ")));
    }

    lines.extend(metadata.session.narrative(metadata.exported_at));
    lines
}

/// Parse CSV text produced by [`to_csv`] or a compatible tool
///
/// Accepted rows have 3 (`timestamp,channel,temperature`), 4 (plus raw
/// value) or 5 (plus calibrated temperature) columns. Timestamps may be
/// epoch milliseconds or RFC 3339. A 3-column row derives its raw value from
/// the temperature with the builtin encoding. Anything before the first
/// line mentioning `timestamp` is skipped.
pub fn from_csv(text: &str) -> ThermoResult<ImportReport> {
    let mut lines = text.lines();
    let mut header = None;
    for line in lines.by_ref() {
        let line = line.trim_start_matches('\u{feff}').trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if line.to_ascii_lowercase().contains("timestamp") {
            header = Some(line.to_string());
            break;
        }
        log::debug!("Skipping CSV preamble: {}", line);
    }
    let header = header.ok_or_else(|| ThermoError::import("no header row found"))?;
    let with_calibrated = header.split(',').count() >= 5;

    let body: String = lines.flat_map(|line| [line, "\n"]).collect();
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .comment(Some(b'#'))
        .trim(csv::Trim::All)
        .from_reader(body.as_bytes());

    let mut readings = Vec::new();
    let mut rejected = 0;
    for record in reader.records() {
        let parsed = record
            .map_err(ThermoError::from)
            .and_then(|record| parse_row(&record, with_calibrated));
        match parsed {
            Ok(Some(reading)) => readings.push(reading),
            Ok(None) => {}
            Err(e) => {
                rejected += 1;
                log::debug!("Rejected CSV row: {}", e);
            }
        }
    }

    if readings.is_empty() {
        return Err(ThermoError::no_valid_rows(rejected));
    }
    if rejected > 0 {
        warn!("CSV import skipped {} invalid rows", rejected);
    }

    readings.sort_by_key(|reading| reading.timestamp);
    info!("Imported {} readings", readings.len());
    Ok(ImportReport { readings, rejected })
}

/// `Ok(None)` for blank lines
fn parse_row(record: &csv::StringRecord, with_calibrated: bool) -> ThermoResult<Option<TemperatureReading>> {
    if record.iter().all(|field| field.is_empty()) {
        return Ok(None);
    }
    if record.len() < 3 {
        return Err(ThermoError::import(format!("expected at least 3 columns, got {}", record.len())));
    }

    let timestamp = parse_timestamp(&record[0])?;

    let channel: i64 = record[1]
        .parse()
        .map_err(|_| ThermoError::import(format!("invalid channel '{}'", &record[1])))?;
    if !(1..=crate::MAX_CHANNELS as i64).contains(&channel) {
        return Err(ThermoError::import(format!("channel {} out of range", channel)));
    }

    let temperature = parse_temperature(&record[2])?;

    let raw_value = match record.get(3).filter(|field| !field.is_empty()) {
        Some(field) => field
            .parse::<i64>()
            .ok()
            .and_then(|value| u16::try_from(value).ok())
            .ok_or_else(|| ThermoError::import(format!("invalid raw value '{}'", field)))?,
        None => encode_builtin(temperature),
    };

    let calibrated_temperature = match record.get(4).filter(|field| with_calibrated && !field.is_empty()) {
        Some(field) => Some(parse_temperature(field)?),
        None => None,
    };

    Ok(Some(TemperatureReading {
        timestamp,
        channel: channel as u8,
        temperature,
        raw_value,
        calibrated_temperature,
    }))
}

fn parse_timestamp(field: &str) -> ThermoResult<i64> {
    if let Ok(millis) = field.parse::<i64>() {
        return Ok(millis);
    }
    if let Ok(millis) = field.parse::<f64>() {
        if millis.is_finite() {
            return Ok(millis.round() as i64);
        }
    }
    DateTime::parse_from_rfc3339(field)
        .map(|time| time.timestamp_millis())
        .map_err(|_| ThermoError::import(format!("invalid timestamp '{}'", field)))
}

fn parse_temperature(field: &str) -> ThermoResult<f64> {
    let value: f64 = field
        .parse()
        .map_err(|_| ThermoError::import(format!("invalid temperature '{}'", field)))?;
    if !(MIN_IMPORT_TEMPERATURE..=MAX_IMPORT_TEMPERATURE).contains(&value) {
        return Err(ThermoError::import(format!("temperature {} out of range", value)));
    }
    Ok(value)
}

/// File name for an export, e.g.
/// `temperature_data_20240501_142233_reg40001-40008_1Hz_480records_2pauses_calibrated.csv`
pub fn export_filename(metadata: &ExportMetadata, record_count: usize, calibrated: bool) -> String {
    let time = match Local.timestamp_millis_opt(metadata.exported_at) {
        chrono::LocalResult::Single(time) => time.format("%Y%m%d_%H%M%S").to_string(),
        _ => "00000000_000000".to_string(),
    };
    let registers = match metadata.serial.custom_list() {
        Some(registers) => format!("custom{}regs", registers.len()),
        None => format!(
            "reg{}-{}",
            metadata.serial.start_register,
            last_register(&metadata.serial)
        ),
    };

    let mut name = format!(
        "temperature_data_{}_{}_{}Hz_{}records",
        time,
        registers,
        format_frequency(metadata.frequency_hz),
        record_count
    );
    let pauses = metadata.session.pause_count();
    if pauses > 0 {
        name.push_str(&format!("_{}pauses", pauses));
    }
    if calibrated {
        name.push_str("_calibrated");
    }
    name.push_str(".csv");
    name
}

/// Write an export into `directory`, returning the created file's path
///
/// The CSV is fully serialized before the file is created.
pub fn write_csv_file<P: AsRef<Path>>(
    directory: P,
    readings: &[TemperatureReading],
    metadata: &ExportMetadata,
) -> ThermoResult<PathBuf> {
    let text = to_csv(readings, metadata)?;
    let calibrated = readings.iter().any(|r| r.calibrated_temperature.is_some());
    let path = directory
        .as_ref()
        .join(export_filename(metadata, readings.len(), calibrated));

    std::fs::write(&path, text)
        .map_err(|e| ThermoError::export(format!("cannot write {}: {}", path.display(), e)))?;
    info!("Exported {} readings to {}", readings.len(), path.display());
    Ok(path)
}

pub fn read_csv_file<P: AsRef<Path>>(path: P) -> ThermoResult<ImportReport> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)
        .map_err(|e| ThermoError::import(format!("cannot read {}: {}", path.display(), e)))?;
    from_csv(&text)
}

fn format_frequency(hz: f64) -> String {
    let text = format!("{:.2}", hz);
    text.trim_end_matches('0').trim_end_matches('.').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::CalibrationOffset;
    use crate::session::SessionAction;
    use approx::assert_relative_eq;

    fn metadata() -> ExportMetadata {
        let mut config = AcquisitionConfig::default();
        config.serial.start_register = 40001;
        config.serial.register_count = 8;
        config.serial.offset_address = 40001;
        ExportMetadata::new(&config, CalibrationSet::default(), SessionTracker::new())
    }

    fn readings() -> Vec<TemperatureReading> {
        vec![
            TemperatureReading::new(1_000, 1, 20.5, 205),
            TemperatureReading::new(1_000, 2, -4.0, 0xFFD8),
            TemperatureReading::new(2_000, 1, 21.0, 210),
        ]
    }

    #[test]
    fn test_round_trip() {
        let original = readings();
        let text = to_csv(&original, &metadata()).unwrap();
        assert!(text.starts_with("# Temperature Data Export"));
        assert!(text.contains("Timestamp,Channel,Temperature_C,Raw_Value\n"));
        assert!(!text.contains(CALIBRATED_HEADER));

        let report = from_csv(&text).unwrap();
        assert_eq!(report.rejected, 0);
        assert_eq!(report.readings, original);
    }

    #[test]
    fn test_calibrated_column() {
        let mut original = readings();
        original[0].calibrated_temperature = Some(21.0);
        let text = to_csv(&original, &metadata()).unwrap();
        assert!(text.contains("Raw_Value,Calibrated_Temperature_C\n"));
        assert!(text.contains("1000,1,20.5,205,21.0\n"));
        assert!(text.contains("1000,2,-4.0,65496,\n"));

        let report = from_csv(&text).unwrap();
        assert_eq!(report.readings[0].calibrated_temperature, Some(21.0));
        assert_eq!(report.readings[1].calibrated_temperature, None);
    }

    #[test]
    fn test_out_of_range_channels_rejected() {
        let text = "Timestamp,Channel,Temperature_C,Raw_Value\n\
                    1000,0,20.0,200\n\
                    1000,17,20.0,200\n\
                    1000,3,20.0,200\n";
        let report = from_csv(text).unwrap();
        assert_eq!(report.rejected, 2);
        assert_eq!(report.readings.len(), 1);
        assert_eq!(report.readings[0].channel, 3);
    }

    #[test]
    fn test_invalid_rows() {
        let text = "timestamp,channel,temperature\n\
                    abc,1,20.0\n\
                    1000,1,nan-ish\n\
                    1000,1,1200\n\
                    1000,1,-300\n\
                    1000,1\n\
                    1000,1,20.0,99999\n";
        assert_eq!(from_csv(text), Err(ThermoError::no_valid_rows(6)));
    }

    #[test]
    fn test_three_columns_and_rfc3339() {
        let text = "# exported elsewhere\n\
                    TIMESTAMP,CHANNEL,TEMP\n\
                    \n\
                    2024-01-01T00:00:01Z,2,-40.0\n\
                    2024-01-01T00:00:00Z,1,40.0\n";
        let report = from_csv(text).unwrap();
        assert_eq!(report.readings.len(), 2);
        assert_eq!(report.readings[0].timestamp, 1_704_067_200_000);
        assert_eq!(report.readings[0].raw_value, 400);
        assert_eq!(report.readings[1].raw_value, 0xFE70);
        assert_relative_eq!(report.readings[1].temperature, -40.0);
    }

    #[test]
    fn test_missing_header() {
        assert!(matches!(from_csv("1000,1,20.0\n"), Err(ThermoError::Import { .. })));
        assert!(matches!(from_csv("# only comments\n"), Err(ThermoError::Import { .. })));
    }

    #[test]
    fn test_preamble_before_header() {
        let text = "Exported by logger v2\nSite: lab 3\n\ntimestamp,channel,temperature\n1000,1,20.0\n1000,2,21.5\n";
        let report = from_csv(text).unwrap();
        assert_eq!(report.readings.len(), 2);
        assert_eq!(report.rejected, 0);
        assert_eq!(report.readings[1].channel, 2);
    }

    #[test]
    fn test_header_block() {
        let mut meta = metadata();
        meta.calibration = CalibrationSet::new(vec![CalibrationOffset::new(2, -0.5, true)]);
        meta.session.record(1_000, SessionAction::Start, "").unwrap();
        meta.session.record(1_500, SessionAction::Pause, "door open").unwrap();
        meta.session.record(1_800, SessionAction::Resume, "").unwrap();

        let text = to_csv(&readings(), &meta).unwrap();
        assert!(text.contains("# Registers: 40001-40008 (8 registers)"));
        assert!(text.contains("# Address Offset: 40001"));
        assert!(text.contains("# Recording Frequency: 1 Hz"));
        assert!(text.contains("# Calibrated Channels: CH2 (-0.50 °C)"));
        assert!(text.contains("reason: door open"));
        assert!(text.contains("# Records: 3"));
    }

    #[test]
    fn test_export_filename() {
        let mut meta = metadata();
        let name = export_filename(&meta, 480, false);
        assert!(name.starts_with("temperature_data_"));
        assert!(name.ends_with("_reg40001-40008_1Hz_480records.csv"));

        meta.serial.custom_registers = Some(vec![1, 5, 9]);
        meta.frequency_hz = 2.5;
        meta.session.record(0, SessionAction::Start, "").unwrap();
        meta.session.record(1, SessionAction::Pause, "").unwrap();
        meta.session.record(2, SessionAction::Resume, "").unwrap();
        let name = export_filename(&meta, 10, true);
        assert!(name.ends_with("_custom3regs_2.5Hz_10records_1pauses_calibrated.csv"));
    }

    #[test]
    fn test_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_csv_file(dir.path(), &readings(), &metadata()).unwrap();
        assert!(path.exists());
        let report = read_csv_file(&path).unwrap();
        assert_eq!(report.readings.len(), 3);
    }

    #[test]
    fn test_format_frequency() {
        assert_eq!(format_frequency(10.0), "10");
        assert_eq!(format_frequency(0.5), "0.5");
        assert_eq!(format_frequency(1.0 / 3.0), "0.33");
    }
}
