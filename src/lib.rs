//! # Thermo Modbus - Modbus RTU Temperature Acquisition
//!
//! Polls multi-channel temperature controllers over Modbus RTU (function
//! 0x03, read holding registers), either on a local serial port or through a
//! WebSocket-to-serial bridge, and turns the register values into a
//! calibrated, exportable temperature history.
//!
//! ## Features
//!
//! - **🔧 RTU Frame Codec**: request building, CRC-16/MODBUS, response validation
//! - **🌡️ Conversion**: builtin 0.1 °C two's-complement decoding or a custom formula
//! - **🎯 Calibration**: per-channel offsets, applied retroactively to the whole history
//! - **⏯️ Sessions**: start/pause/resume/stop log with active and pause durations
//! - **📉 Downsampling**: bucket means for large histories before display
//! - **📄 CSV**: export with a metadata header, tolerant import
//! - **🧪 Test Mode**: synthetic sinusoidal signals without hardware
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use thermo_modbus::{open_transport, AcquisitionConfig, AcquisitionScheduler, OperationLog, ReadingStore};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = AcquisitionConfig::from_file("thermo.yaml")?;
//!     let transport = open_transport(&config).await?;
//!
//!     let store = ReadingStore::new();
//!     let (mut scheduler, handle) =
//!         AcquisitionScheduler::for_device(config, transport, store.clone(), OperationLog::default())?;
//!     let task = tokio::spawn(async move { scheduler.run().await });
//!
//!     tokio::time::sleep(std::time::Duration::from_secs(10)).await;
//!     handle.stop("done").await?;
//!     task.await??;
//!
//!     for (channel, reading) in store.latest_per_channel()? {
//!         println!("CH{}: {:.1} °C", channel, reading.effective_temperature());
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐    ┌─────────────────┐
//! │    Scheduler    │───►│  Reading Store  │──► downsample / CSV
//! └─────────────────┘    └─────────────────┘
//!          │                       ▲
//! ┌─────────────────┐    ┌─────────────────┐
//! │ Register Client │    │   Converter +   │
//! │   (0x03 RTU)    │───►│   Calibration   │
//! └─────────────────┘    └─────────────────┘
//!          │
//! ┌─────────────────┐
//! │    Transport    │  serial port | WebSocket bridge
//! └─────────────────┘
//! ```

/// Error types and result handling
pub mod error;

/// RTU frame construction, CRC and response validation
pub mod protocol;

/// Serial and WebSocket bridge transports
pub mod transport;

/// Holding-register client with retries and operation logging
pub mod client;

/// Configuration model and file loading
pub mod config;

/// Channel to register address resolution
pub mod registers;

/// Raw register to temperature conversion
pub mod converter;

/// Per-channel calibration offsets
pub mod calibration;

/// Temperature readings and the shared history
pub mod reading;

/// Session event log
pub mod session;

/// Bucket averaging for display
pub mod downsample;

/// CSV export and import
pub mod export;

/// Synthetic data for test mode
pub mod generator;

/// Periodic acquisition loop
pub mod scheduler;

/// Statistics, validation and formatting helpers
pub mod utils;

/// Logging setup and the operation log
pub mod logging;

// Re-export main types for convenience
pub use calibration::{CalibrationOffset, CalibrationSet};
pub use client::HoldingRegisterClient;
pub use config::{AcquisitionConfig, ConversionMode, RecordingConfig, SerialConfig, TestModeConfig};
pub use converter::TemperatureConverter;
pub use error::{ErrorKind, ThermoError, ThermoResult};
pub use export::{ExportMetadata, ImportReport};
pub use logging::{OperationLog, OperationLogEntry, OperationStatus};
pub use protocol::{ModbusAddress, ModbusFunction, SlaveId};
pub use reading::{ReadingStore, TemperatureReading};
pub use scheduler::{AcquisitionScheduler, SchedulerCommand, SchedulerHandle, SchedulerState};
pub use session::{SessionAction, SessionTracker};
pub use transport::{open_transport, FrameTransport, SerialTransport, TransportStats, WebSocketBridgeTransport};
pub use utils::{AcquisitionStats, OperationTimer};

/// Default response timeout (1 second)
pub const DEFAULT_TIMEOUT_MS: u64 = 1000;

/// Maximum number of temperature channels
pub const MAX_CHANNELS: usize = 16;

/// Maximum number of registers that can be read in a single request
pub const MAX_REGISTERS_PER_REQUEST: u16 = 125;

/// Maximum Modbus RTU frame size
pub const MAX_RTU_FRAME_SIZE: usize = 256;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Get library information
pub fn info() -> String {
    format!("Thermo Modbus v{} - Modbus RTU temperature acquisition", VERSION)
}
