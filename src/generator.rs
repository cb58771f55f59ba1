/// Synthetic temperature source for test mode
///
/// Produces `base + sinusoid + noise + channel offset` per channel, where the
/// base is the middle of the configured range and the sinusoid spans half of
/// it. The range is a soft target: noise and channel offsets may leave it.
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::f64::consts::PI;

use crate::config::TestModeConfig;
use crate::converter::{builtin_convert, encode_builtin};
use crate::reading::TemperatureReading;

/// Period of the sinusoidal component
pub const SIGNAL_PERIOD_SECS: f64 = 60.0;

/// Extra offset per channel number, in °C
pub const CHANNEL_OFFSET_STEP: f64 = 0.5;

pub struct TestSignalGenerator {
    config: TestModeConfig,
    rng: StdRng,
    origin: Option<i64>,
}

impl TestSignalGenerator {
    pub fn new(config: TestModeConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            config,
            rng,
            origin: None,
        }
    }

    pub fn config(&self) -> &TestModeConfig {
        &self.config
    }

    /// Noise-free value for `channel` at `elapsed_secs` after the first sample
    pub fn ideal_temperature(&self, channel: u8, elapsed_secs: f64) -> f64 {
        let range = self.config.temperature_range;
        let base = (range.min + range.max) / 2.0;
        let amplitude = (range.max - range.min) / 4.0;
        let index = channel.saturating_sub(1) as f64;
        let phase = index * PI / 8.0;

        base + amplitude * (2.0 * PI * elapsed_secs / SIGNAL_PERIOD_SECS + phase).sin()
            + CHANNEL_OFFSET_STEP * index
    }

    /// One reading per channel, all stamped with `timestamp`
    ///
    /// Values are quantised through the builtin register encoding so that
    /// `temperature` and `raw_value` always agree.
    pub fn generate(&mut self, timestamp: i64, channels: &[u8]) -> Vec<TemperatureReading> {
        let origin = *self.origin.get_or_insert(timestamp);
        let elapsed_secs = (timestamp - origin) as f64 / 1000.0;
        let noise_level = self.config.noise_level;

        let mut readings = Vec::with_capacity(channels.len());
        for &channel in channels {
            let noise = if noise_level > 0.0 {
                self.rng.gen_range(-noise_level..=noise_level)
            } else {
                0.0
            };
            let raw = encode_builtin(self.ideal_temperature(channel, elapsed_secs) + noise);
            readings.push(TemperatureReading::new(timestamp, channel, builtin_convert(raw), raw));
        }
        readings
    }

    /// Restart the sinusoid at the next sample
    pub fn reset(&mut self) {
        self.origin = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TemperatureRange;
    use approx::assert_relative_eq;

    fn config(noise_level: f64, seed: u64) -> TestModeConfig {
        TestModeConfig {
            enabled: true,
            data_generation_rate: 1.0,
            temperature_range: TemperatureRange { min: 20.0, max: 30.0 },
            noise_level,
            seed: Some(seed),
        }
    }

    #[test]
    fn test_noise_free_signal() {
        let mut generator = TestSignalGenerator::new(config(0.0, 1));
        let readings = generator.generate(5_000, &[1, 3]);
        assert_eq!(readings.len(), 2);
        // Channel 1 at t=0: base only
        assert_relative_eq!(readings[0].temperature, 25.0, epsilon = 1e-9);
        assert_eq!(readings[0].raw_value, 250);
        assert_eq!(readings[0].timestamp, 5_000);

        // Quarter period later the sinusoid peaks (amplitude 2.5)
        let readings = generator.generate(5_000 + 15_000, &[1]);
        assert_relative_eq!(readings[0].temperature, 27.5, epsilon = 1e-9);
    }

    #[test]
    fn test_channel_offset() {
        let generator = TestSignalGenerator::new(config(0.0, 1));
        let delta = generator.ideal_temperature(5, 0.0) - 25.0 - 2.5 * (PI / 2.0).sin();
        assert_relative_eq!(delta, 2.0, epsilon = 1e-9);
    }

    #[test]
    fn test_noise_is_bounded() {
        let mut generator = TestSignalGenerator::new(config(0.5, 7));
        for tick in 0..200 {
            let timestamp = tick * 100;
            let elapsed = timestamp as f64 / 1000.0;
            for reading in generator.generate(timestamp, &[1, 2]) {
                let ideal = generator.ideal_temperature(reading.channel, elapsed);
                assert!((reading.temperature - ideal).abs() <= 0.5 + 0.051);
                assert_eq!(reading.temperature, builtin_convert(reading.raw_value));
            }
        }
    }

    #[test]
    fn test_seed_is_reproducible() {
        let mut a = TestSignalGenerator::new(config(1.0, 42));
        let mut b = TestSignalGenerator::new(config(1.0, 42));
        assert_eq!(a.generate(0, &[1, 2, 3]), b.generate(0, &[1, 2, 3]));
        assert_eq!(a.generate(100, &[1, 2, 3]), b.generate(100, &[1, 2, 3]));
    }
}
