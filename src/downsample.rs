/// Bucketed averaging of oversized reading sets for display
///
/// Output of this module is a visualization aid only. It must never be fed
/// back into the store, calibration or export.
use std::borrow::Cow;
use std::collections::{BTreeMap, BTreeSet};

use crate::reading::TemperatureReading;

/// Inputs at or below this size are returned unchanged
pub const DOWNSAMPLE_THRESHOLD: usize = 15_000;

/// Upper bound on the number of readings produced
pub const DOWNSAMPLE_TARGET: usize = 10_000;

/// Downsample with the default threshold and target
pub fn downsample(readings: &[TemperatureReading], calibration_active: bool) -> Cow<'_, [TemperatureReading]> {
    downsample_with(readings, DOWNSAMPLE_THRESHOLD, DOWNSAMPLE_TARGET, calibration_active)
}

/// Reduce `readings` to at most `target` points once they exceed `threshold`
///
/// Readings are sorted by timestamp and cut into contiguous buckets of
/// consecutive readings (channels mixed). The bucket count is
/// `target / channels`, so one averaged reading per channel per bucket stays
/// within `target`. Each averaged reading takes the timestamp of the bucket's
/// middle element.
///
/// When `calibration_active` is set, a bucket without calibrated values for
/// a channel reports the mean uncalibrated temperature as its calibrated
/// value, keeping both series aligned point for point.
pub fn downsample_with(
    readings: &[TemperatureReading],
    threshold: usize,
    target: usize,
    calibration_active: bool,
) -> Cow<'_, [TemperatureReading]> {
    if readings.len() <= threshold || target == 0 {
        return Cow::Borrowed(readings);
    }

    let mut sorted: Vec<&TemperatureReading> = readings.iter().collect();
    sorted.sort_by_key(|reading| reading.timestamp);

    let channels = sorted
        .iter()
        .map(|reading| reading.channel)
        .collect::<BTreeSet<_>>()
        .len()
        .max(1);
    let bucket_count = (target / channels).max(1);
    let bucket_size = (sorted.len() + bucket_count - 1) / bucket_count;

    let mut output = Vec::with_capacity(target);
    for bucket in sorted.chunks(bucket_size) {
        let timestamp = bucket[bucket.len() / 2].timestamp;

        let mut groups: BTreeMap<u8, Accumulator> = BTreeMap::new();
        for reading in bucket {
            groups.entry(reading.channel).or_default().add(reading);
        }

        output.extend(
            groups
                .into_iter()
                .map(|(channel, acc)| acc.finish(timestamp, channel, calibration_active)),
        );
    }

    log::debug!(
        "Downsampled {} readings to {} ({} buckets of {})",
        readings.len(),
        output.len(),
        bucket_count,
        bucket_size
    );
    Cow::Owned(output)
}

#[derive(Default)]
struct Accumulator {
    count: usize,
    temperature_sum: f64,
    raw_sum: f64,
    calibrated_count: usize,
    calibrated_sum: f64,
}

impl Accumulator {
    fn add(&mut self, reading: &TemperatureReading) {
        self.count += 1;
        self.temperature_sum += reading.temperature;
        self.raw_sum += reading.raw_value as f64;
        if let Some(calibrated) = reading.calibrated_temperature {
            self.calibrated_count += 1;
            self.calibrated_sum += calibrated;
        }
    }

    fn finish(self, timestamp: i64, channel: u8, calibration_active: bool) -> TemperatureReading {
        let count = self.count as f64;
        let temperature = self.temperature_sum / count;
        let calibrated_temperature = if self.calibrated_count > 0 {
            Some(self.calibrated_sum / self.calibrated_count as f64)
        } else if calibration_active {
            Some(temperature)
        } else {
            None
        };

        TemperatureReading {
            timestamp,
            channel,
            temperature,
            raw_value: (self.raw_sum / count).round() as u16,
            calibrated_temperature,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn series(count: usize, channels: u8) -> Vec<TemperatureReading> {
        (0..count)
            .map(|i| {
                let channel = (i % channels as usize) as u8 + 1;
                TemperatureReading::new((i / channels as usize) as i64 * 100, channel, 20.0, 200)
            })
            .collect()
    }

    #[test]
    fn test_small_input_is_untouched() {
        let readings = series(DOWNSAMPLE_THRESHOLD, 4);
        let result = downsample(&readings, false);
        assert!(matches!(result, Cow::Borrowed(_)));
        assert_eq!(&*result, readings.as_slice());
    }

    #[test]
    fn test_output_is_bounded() {
        for channels in [1u8, 3, 7, 16] {
            let readings = series(DOWNSAMPLE_THRESHOLD + 1, channels);
            assert!(downsample(&readings, false).len() <= DOWNSAMPLE_TARGET);

            let readings = series(40_000, channels);
            assert!(downsample(&readings, false).len() <= DOWNSAMPLE_TARGET);
        }
    }

    #[test]
    fn test_bucket_means() {
        let readings = vec![
            TemperatureReading::new(0, 1, 10.0, 100),
            TemperatureReading::new(1, 2, 30.0, 300),
            TemperatureReading::new(2, 1, 20.0, 201),
            TemperatureReading::new(3, 2, 40.0, 400),
        ];
        // One bucket per channel count of 2: target 2 over 2 channels
        let result = downsample_with(&readings, 1, 2, false);
        assert_eq!(result.len(), 2);
        assert_eq!(result[0].channel, 1);
        assert_eq!(result[0].timestamp, 2);
        assert_relative_eq!(result[0].temperature, 15.0);
        assert_eq!(result[0].raw_value, 151);
        assert_relative_eq!(result[1].temperature, 35.0);
        assert_eq!(result[1].calibrated_temperature, None);
    }

    #[test]
    fn test_calibrated_fallback() {
        let mut calibrated = TemperatureReading::new(0, 1, 10.0, 100);
        calibrated.calibrated_temperature = Some(11.0);
        let readings = vec![
            calibrated,
            TemperatureReading::new(1, 1, 12.0, 120),
            TemperatureReading::new(2, 2, 30.0, 300),
        ];

        let result = downsample_with(&readings, 1, 2, true);
        assert_eq!(result.len(), 2);
        // Only calibrated values are averaged when any exist
        assert_relative_eq!(result[0].calibrated_temperature.unwrap(), 11.0);
        // No calibrated value in the bucket: uncalibrated mean stands in
        assert_relative_eq!(result[1].calibrated_temperature.unwrap(), 30.0);

        let result = downsample_with(&readings, 1, 2, false);
        assert_eq!(result[1].calibrated_temperature, None);
    }

    #[test]
    fn test_unsorted_input_is_sorted() {
        let readings: Vec<TemperatureReading> = (0..20)
            .rev()
            .map(|t| TemperatureReading::new(t, 1, t as f64, 0))
            .collect();
        let result = downsample_with(&readings, 10, 5, false);
        assert_eq!(result.len(), 5);
        assert!(result.windows(2).all(|pair| pair[0].timestamp < pair[1].timestamp));
        assert_relative_eq!(result[0].temperature, 1.5);
    }
}
