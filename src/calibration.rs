/// Per-channel additive calibration
///
/// Calibration is retroactive: applying an offset set rewrites the whole
/// reading history, and the same set keeps calibrating every new reading
/// until it is replaced or cleared.
use log::info;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{ThermoError, ThermoResult};
use crate::reading::TemperatureReading;

/// Offset for one channel
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CalibrationOffset {
    pub channel_id: u8,
    /// Additive offset in °C
    pub offset: f64,
    pub enabled: bool,
}

impl CalibrationOffset {
    pub fn new(channel_id: u8, offset: f64, enabled: bool) -> Self {
        Self {
            channel_id,
            offset,
            enabled,
        }
    }
}

/// Set `calibrated_temperature` on `reading` from `offsets`, or remove it
/// when the channel has no enabled offset
pub fn calibrate_reading(offsets: &[CalibrationOffset], reading: &mut TemperatureReading) {
    match offsets.iter().find(|offset| offset.channel_id == reading.channel) {
        Some(offset) if offset.enabled => {
            reading.calibrated_temperature = Some(reading.temperature + offset.offset);
        }
        _ => reading.calibrated_temperature = None,
    }
}

/// Apply `offsets` to the entire `history`
///
/// Fails with `NoData` when there is nothing to calibrate.
pub fn apply_calibration(
    offsets: &[CalibrationOffset],
    history: &[TemperatureReading],
) -> ThermoResult<Vec<TemperatureReading>> {
    if history.is_empty() {
        return Err(ThermoError::no_data("no readings to calibrate"));
    }

    Ok(history
        .iter()
        .map(|reading| {
            let mut reading = reading.clone();
            calibrate_reading(offsets, &mut reading);
            reading
        })
        .collect())
}

/// Offsets bringing each channel's latest reading to `target`
///
/// Every channel present in `latest` gets `target - temperature` and is
/// enabled; entries of `existing` for channels without a reading are kept
/// unchanged. The result is ordered by channel.
pub fn one_click_offsets(
    target: f64,
    latest: &BTreeMap<u8, TemperatureReading>,
    existing: &[CalibrationOffset],
) -> Vec<CalibrationOffset> {
    let mut offsets: BTreeMap<u8, CalibrationOffset> = existing
        .iter()
        .map(|offset| (offset.channel_id, *offset))
        .collect();

    for (channel, reading) in latest {
        offsets.insert(
            *channel,
            CalibrationOffset::new(*channel, target - reading.temperature, true),
        );
    }

    offsets.into_values().collect()
}

/// Offset set currently in force
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CalibrationSet {
    offsets: Vec<CalibrationOffset>,
}

impl CalibrationSet {
    pub fn new(offsets: Vec<CalibrationOffset>) -> Self {
        Self { offsets }
    }

    pub fn offsets(&self) -> &[CalibrationOffset] {
        &self.offsets
    }

    /// True when at least one channel has an enabled offset
    pub fn is_active(&self) -> bool {
        self.offsets.iter().any(|offset| offset.enabled)
    }

    /// Channels with an enabled offset, in configuration order
    pub fn enabled_channels(&self) -> Vec<u8> {
        self.offsets
            .iter()
            .filter(|offset| offset.enabled)
            .map(|offset| offset.channel_id)
            .collect()
    }

    pub fn offset_for(&self, channel: u8) -> Option<f64> {
        self.offsets
            .iter()
            .find(|offset| offset.channel_id == channel && offset.enabled)
            .map(|offset| offset.offset)
    }

    pub fn apply_to(&self, reading: &mut TemperatureReading) {
        calibrate_reading(&self.offsets, reading);
    }

    /// Replace the set wholesale
    pub fn replace(&mut self, offsets: Vec<CalibrationOffset>) {
        info!(
            "Calibration updated: {} offsets, {} enabled",
            offsets.len(),
            offsets.iter().filter(|offset| offset.enabled).count()
        );
        self.offsets = offsets;
    }

    pub fn clear(&mut self) {
        self.offsets.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn reading(timestamp: i64, channel: u8, temperature: f64) -> TemperatureReading {
        TemperatureReading::new(timestamp, channel, temperature, 0)
    }

    #[test]
    fn test_calibration_is_retroactive() {
        let history = vec![reading(1, 1, 20.0), reading(2, 1, 22.0)];
        let offsets = [CalibrationOffset::new(1, 1.5, true)];

        let calibrated = apply_calibration(&offsets, &history).unwrap();
        assert_relative_eq!(calibrated[0].calibrated_temperature.unwrap(), 21.5);
        assert_relative_eq!(calibrated[1].calibrated_temperature.unwrap(), 23.5);
        assert_eq!(calibrated[0].temperature, 20.0);
    }

    #[test]
    fn test_disable_removes_and_reenable_restores() {
        let history = vec![reading(1, 1, 20.0), reading(2, 2, 25.0)];
        let enabled = [CalibrationOffset::new(1, 0.7, true), CalibrationOffset::new(2, -1.0, true)];
        let first = apply_calibration(&enabled, &history).unwrap();

        let disabled = [CalibrationOffset::new(1, 0.7, false), CalibrationOffset::new(2, -1.0, false)];
        let stripped = apply_calibration(&disabled, &first).unwrap();
        assert!(stripped.iter().all(|r| r.calibrated_temperature.is_none()));

        let again = apply_calibration(&enabled, &stripped).unwrap();
        assert_eq!(again, first);
    }

    #[test]
    fn test_channel_without_offset_is_uncalibrated() {
        let mut with_value = reading(1, 3, 10.0);
        with_value.calibrated_temperature = Some(11.0);
        let calibrated = apply_calibration(&[CalibrationOffset::new(1, 1.0, true)], &[with_value]).unwrap();
        assert_eq!(calibrated[0].calibrated_temperature, None);
    }

    #[test]
    fn test_empty_history_is_rejected() {
        let result = apply_calibration(&[CalibrationOffset::new(1, 1.0, true)], &[]);
        assert!(matches!(result, Err(ThermoError::NoData { .. })));
    }

    #[test]
    fn test_one_click_offsets() {
        let mut latest = BTreeMap::new();
        latest.insert(1, reading(10, 1, 24.2));
        latest.insert(2, reading(10, 2, 25.9));
        let existing = [CalibrationOffset::new(2, 0.3, false), CalibrationOffset::new(5, 0.8, false)];

        let offsets = one_click_offsets(25.0, &latest, &existing);
        assert_eq!(offsets.len(), 3);
        assert_eq!(offsets[0].channel_id, 1);
        assert_relative_eq!(offsets[0].offset, 0.8, epsilon = 1e-9);
        assert!(offsets[0].enabled);
        assert_relative_eq!(offsets[1].offset, -0.9, epsilon = 1e-9);
        assert!(offsets[1].enabled);
        // No reading for channel 5: untouched
        assert_eq!(offsets[2], CalibrationOffset::new(5, 0.8, false));
    }

    #[test]
    fn test_calibration_set() {
        let mut set = CalibrationSet::default();
        assert!(!set.is_active());

        set.replace(vec![CalibrationOffset::new(1, 2.0, true), CalibrationOffset::new(2, 1.0, false)]);
        assert!(set.is_active());
        assert_eq!(set.enabled_channels(), vec![1]);
        assert_eq!(set.offset_for(1), Some(2.0));
        assert_eq!(set.offset_for(2), None);

        let mut r = reading(1, 1, 30.0);
        set.apply_to(&mut r);
        assert_eq!(r.calibrated_temperature, Some(32.0));

        set.clear();
        set.apply_to(&mut r);
        assert_eq!(r.calibrated_temperature, None);
    }
}
