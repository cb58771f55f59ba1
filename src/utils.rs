/// Utility functions and helpers for the acquisition pipeline
///
/// Acquisition statistics, argument validation and formatting helpers.
use log::debug;
use std::time::{Duration, Instant};

use crate::error::{ThermoError, ThermoResult};

/// Current wall-clock time in milliseconds since the Unix epoch
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Acquisition statistics for the scheduler
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AcquisitionStats {
    pub ticks: u64,
    pub readings: u64,
    pub transactions: u64,
    pub successful_transactions: u64,
    pub errors: u64,
    pub timeouts: u64,
    pub min_duration: Option<Duration>,
    pub max_duration: Option<Duration>,
    pub total_duration: Duration,
}

impl AcquisitionStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a successful transaction
    pub fn record_success(&mut self, duration: Duration) {
        self.transactions += 1;
        self.successful_transactions += 1;
        self.total_duration += duration;
        self.min_duration = Some(self.min_duration.map_or(duration, |min| min.min(duration)));
        self.max_duration = Some(self.max_duration.map_or(duration, |max| max.max(duration)));
    }

    /// Record a failed transaction; timeouts are also counted as errors
    pub fn record_failure(&mut self, duration: Duration, timed_out: bool) {
        self.transactions += 1;
        self.errors += 1;
        if timed_out {
            self.timeouts += 1;
        }
        self.total_duration += duration;
    }

    /// Success rate as percentage
    pub fn success_rate(&self) -> f64 {
        if self.transactions == 0 {
            return 0.0;
        }
        (self.successful_transactions as f64 / self.transactions as f64) * 100.0
    }

    /// Mean transaction duration
    pub fn avg_duration(&self) -> Duration {
        if self.transactions == 0 {
            return Duration::ZERO;
        }
        self.total_duration / self.transactions as u32
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Timer for measuring operation duration
pub struct OperationTimer {
    start: Instant,
    operation_name: String,
}

impl OperationTimer {
    pub fn start(operation_name: &str) -> Self {
        Self {
            start: Instant::now(),
            operation_name: operation_name.to_string(),
        }
    }

    /// Stop the timer and return duration
    pub fn stop(self) -> Duration {
        let duration = self.start.elapsed();
        debug!("Operation '{}' completed in {:?}", self.operation_name, duration);
        duration
    }
}

/// Data validation utilities
pub mod validation {
    use super::*;

    /// Validate slave ID (1-247)
    pub fn validate_slave_id(slave_id: u8) -> ThermoResult<()> {
        if slave_id == 0 || slave_id > 247 {
            return Err(ThermoError::invalid_data(format!(
                "Invalid slave ID: {} (must be 1-247)",
                slave_id
            )));
        }
        Ok(())
    }

    /// Validate that `start + count` stays inside the 16-bit address space
    pub fn validate_address_range(start: u16, count: u16) -> ThermoResult<()> {
        if count == 0 || (start as u32 + count as u32) > 65536 {
            return Err(ThermoError::invalid_data(format!(
                "Invalid address range: start={}, count={}",
                start, count
            )));
        }
        Ok(())
    }

    /// Validate register count for a single read request
    pub fn validate_register_count(count: u16) -> ThermoResult<()> {
        if count == 0 || count > crate::MAX_REGISTERS_PER_REQUEST {
            return Err(ThermoError::invalid_data(format!(
                "Invalid register count: {} (must be 1-{})",
                count,
                crate::MAX_REGISTERS_PER_REQUEST
            )));
        }
        Ok(())
    }

    /// Validate a channel number (1-16)
    pub fn validate_channel(channel: u8) -> ThermoResult<()> {
        if channel == 0 || channel as usize > crate::MAX_CHANNELS {
            return Err(ThermoError::invalid_data(format!(
                "Invalid channel: {} (must be 1-{})",
                channel,
                crate::MAX_CHANNELS
            )));
        }
        Ok(())
    }
}

/// Formatting and display utilities
pub mod format {
    use super::*;

    /// Format byte array as hex string
    pub fn bytes_to_hex(bytes: &[u8]) -> String {
        bytes
            .iter()
            .map(|b| format!("{:02X}", b))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Format register values as hex
    pub fn registers_to_hex(registers: &[u16]) -> String {
        registers
            .iter()
            .map(|r| format!("{:04X}", r))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Format a duration in a human-readable way
    pub fn format_duration(duration: Duration) -> String {
        let millis = duration.as_millis();
        if millis < 1000 {
            format!("{}ms", millis)
        } else if millis < 60_000 {
            format!("{:.2}s", duration.as_secs_f64())
        } else if millis < 3_600_000 {
            let mins = millis / 60_000;
            let secs = (millis % 60_000) as f64 / 1000.0;
            format!("{}m {:.1}s", mins, secs)
        } else {
            let hours = millis / 3_600_000;
            let mins = (millis % 3_600_000) / 60_000;
            format!("{}h {}m", hours, mins)
        }
    }

    /// Same as [`format_duration`] for a millisecond count
    pub fn format_millis(millis: i64) -> String {
        format_duration(Duration::from_millis(millis.max(0) as u64))
    }

    /// Format an epoch-millisecond timestamp in local time
    pub fn format_timestamp(millis: i64) -> String {
        use chrono::TimeZone;
        match chrono::Local.timestamp_millis_opt(millis) {
            chrono::LocalResult::Single(time) => time.format("%Y-%m-%d %H:%M:%S%.3f").to_string(),
            _ => millis.to_string(),
        }
    }

    /// Format acquisition statistics as a table
    pub fn format_stats(stats: &AcquisitionStats) -> String {
        format!(
            "Acquisition Statistics:\n\
             ├─ Ticks: {}\n\
             ├─ Readings: {}\n\
             ├─ Transactions: {} ({:.1}% successful)\n\
             ├─ Errors: {}\n\
             ├─ Timeouts: {}\n\
             ├─ Average Duration: {}\n\
             ├─ Min Duration: {}\n\
             └─ Max Duration: {}",
            stats.ticks,
            stats.readings,
            stats.transactions,
            stats.success_rate(),
            stats.errors,
            stats.timeouts,
            format_duration(stats.avg_duration()),
            stats.min_duration.map_or("N/A".to_string(), format_duration),
            stats.max_duration.map_or("N/A".to_string(), format_duration),
        )
    }
}
