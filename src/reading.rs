/// Temperature readings and the shared reading store
///
/// The store keeps the reading history as an immutable snapshot behind an
/// `Arc<RwLock<_>>`. Appends and calibration rewrites take the write lock, so
/// a tick can never interleave with a calibration pass; readers (charts,
/// exporters) clone the current `Arc` and keep a consistent view while new
/// snapshots are published.
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::calibration::{self, CalibrationOffset, CalibrationSet};
use crate::error::{ThermoError, ThermoResult};

/// One temperature sample for one channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemperatureReading {
    /// Milliseconds since the Unix epoch
    pub timestamp: i64,
    /// Channel number (1-16)
    pub channel: u8,
    /// Converted temperature in °C
    pub temperature: f64,
    pub raw_value: u16,
    /// Present only while calibration is enabled for this channel
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub calibrated_temperature: Option<f64>,
}

impl TemperatureReading {
    pub fn new(timestamp: i64, channel: u8, temperature: f64, raw_value: u16) -> Self {
        Self {
            timestamp,
            channel,
            temperature,
            raw_value,
            calibrated_temperature: None,
        }
    }

    /// Calibrated value when available, raw temperature otherwise
    pub fn effective_temperature(&self) -> f64 {
        self.calibrated_temperature.unwrap_or(self.temperature)
    }
}

/// Consistent view of the store at one version
#[derive(Debug, Clone)]
pub struct ReadingSnapshot {
    pub version: u64,
    pub readings: Arc<Vec<TemperatureReading>>,
    pub calibration: CalibrationSet,
}

#[derive(Debug, Default)]
struct StoreInner {
    readings: Arc<Vec<TemperatureReading>>,
    version: u64,
    calibration: CalibrationSet,
}

impl StoreInner {
    fn publish(&mut self, readings: Vec<TemperatureReading>) {
        self.readings = Arc::new(readings);
        self.version += 1;
    }
}

/// Shared, versioned reading history
///
/// Cloning the store clones the handle; all clones see the same history.
#[derive(Debug, Clone, Default)]
pub struct ReadingStore {
    inner: Arc<RwLock<StoreInner>>,
}

impl ReadingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store that calibrates new readings with `offsets` from the start
    pub fn with_calibration(offsets: Vec<CalibrationOffset>) -> Self {
        let store = Self::new();
        if let Ok(mut inner) = store.inner.write() {
            inner.calibration = CalibrationSet::new(offsets);
        }
        store
    }

    fn read(&self) -> ThermoResult<RwLockReadGuard<'_, StoreInner>> {
        self.inner
            .read()
            .map_err(|_| ThermoError::internal("Failed to lock reading store"))
    }

    fn write(&self) -> ThermoResult<RwLockWriteGuard<'_, StoreInner>> {
        self.inner
            .write()
            .map_err(|_| ThermoError::internal("Failed to lock reading store"))
    }

    /// Append a batch, calibrating each reading with the current offsets
    ///
    /// Returns the new version. The history is extended in place unless a
    /// snapshot still holds it, in which case that snapshot keeps the old
    /// contents and the store moves on to a copy.
    pub fn append(&self, batch: Vec<TemperatureReading>) -> ThermoResult<u64> {
        let mut inner = self.write()?;
        if batch.is_empty() {
            return Ok(inner.version);
        }

        let StoreInner {
            readings,
            version,
            calibration,
        } = &mut *inner;
        let readings = Arc::make_mut(readings);
        readings.reserve(batch.len());
        readings.extend(batch.into_iter().map(|mut reading| {
            calibration.apply_to(&mut reading);
            reading
        }));
        *version += 1;
        Ok(*version)
    }

    /// Replace the whole history (e.g. after an import)
    ///
    /// Readings are sorted by timestamp and calibrated with the current set.
    pub fn replace(&self, mut readings: Vec<TemperatureReading>) -> ThermoResult<u64> {
        readings.sort_by_key(|reading| reading.timestamp);
        let mut inner = self.write()?;
        for reading in readings.iter_mut() {
            inner.calibration.apply_to(reading);
        }
        inner.publish(readings);
        Ok(inner.version)
    }

    pub fn snapshot(&self) -> ThermoResult<ReadingSnapshot> {
        let inner = self.read()?;
        Ok(ReadingSnapshot {
            version: inner.version,
            readings: Arc::clone(&inner.readings),
            calibration: inner.calibration.clone(),
        })
    }

    pub fn readings(&self) -> ThermoResult<Arc<Vec<TemperatureReading>>> {
        Ok(Arc::clone(&self.read()?.readings))
    }

    pub fn len(&self) -> usize {
        self.read().map(|inner| inner.readings.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn version(&self) -> u64 {
        self.read().map(|inner| inner.version).unwrap_or(0)
    }

    pub fn calibration(&self) -> ThermoResult<CalibrationSet> {
        Ok(self.read()?.calibration.clone())
    }

    /// Apply `offsets` to the whole history and keep them for new readings
    ///
    /// Fails with `NoData` on an empty history, leaving the store untouched.
    pub fn apply_calibration(&self, offsets: Vec<CalibrationOffset>) -> ThermoResult<usize> {
        let mut inner = self.write()?;
        let calibrated = calibration::apply_calibration(&offsets, &inner.readings)?;
        let count = calibrated.len();
        inner.calibration.replace(offsets);
        inner.publish(calibrated);
        Ok(count)
    }

    /// Install `offsets` for new readings, recalibrating any existing history
    pub fn set_calibration(&self, offsets: Vec<CalibrationOffset>) -> ThermoResult<()> {
        let mut inner = self.write()?;
        if !inner.readings.is_empty() {
            let calibrated = calibration::apply_calibration(&offsets, &inner.readings)?;
            inner.publish(calibrated);
        }
        inner.calibration.replace(offsets);
        Ok(())
    }

    /// Calibrate every channel with data so its latest reading reads `target`
    pub fn one_click_calibrate(&self, target: f64) -> ThermoResult<Vec<CalibrationOffset>> {
        let mut inner = self.write()?;
        if inner.readings.is_empty() {
            return Err(ThermoError::no_data("no readings to calibrate"));
        }

        let latest = latest_by_channel(&inner.readings);
        let offsets = calibration::one_click_offsets(target, &latest, inner.calibration.offsets());
        let calibrated = calibration::apply_calibration(&offsets, &inner.readings)?;
        inner.calibration.replace(offsets.clone());
        inner.publish(calibrated);
        Ok(offsets)
    }

    /// Drop all offsets and strip calibrated values from the history
    pub fn clear_calibration(&self) -> ThermoResult<()> {
        let mut inner = self.write()?;
        inner.calibration.clear();
        if !inner.readings.is_empty() {
            let stripped = calibration::apply_calibration(&[], &inner.readings)?;
            inner.publish(stripped);
        }
        Ok(())
    }

    /// Most recent reading of every channel
    pub fn latest_per_channel(&self) -> ThermoResult<BTreeMap<u8, TemperatureReading>> {
        Ok(latest_by_channel(&self.read()?.readings))
    }

    /// Destroy all readings; calibration offsets are kept
    pub fn clear(&self) -> ThermoResult<()> {
        let mut inner = self.write()?;
        inner.publish(Vec::new());
        Ok(())
    }
}

fn latest_by_channel(readings: &[TemperatureReading]) -> BTreeMap<u8, TemperatureReading> {
    let mut latest: BTreeMap<u8, TemperatureReading> = BTreeMap::new();
    for reading in readings {
        match latest.get(&reading.channel) {
            Some(current) if current.timestamp > reading.timestamp => {}
            _ => {
                latest.insert(reading.channel, reading.clone());
            }
        }
    }
    latest
}
