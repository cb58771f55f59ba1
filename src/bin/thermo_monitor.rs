/// Thermo Modbus Monitor
///
/// Polls a temperature controller (serial port or WebSocket bridge, or the
/// synthetic source when test mode is enabled) until Ctrl-C, printing the
/// latest value of every channel, then exports the session to CSV.
///
/// Usage: thermo_monitor [config.yaml|config.json] [output-dir]
use anyhow::{Context, Result};
use std::path::PathBuf;
use std::time::Duration;

use thermo_modbus::export::{write_csv_file, ExportMetadata};
use thermo_modbus::logging::{init_logger, OperationLog, OperationStatus, DEFAULT_OPERATION_LOG_CAPACITY};
use thermo_modbus::scheduler::ReadingSource;
use thermo_modbus::utils::format::format_stats;
use thermo_modbus::utils::now_millis;
use thermo_modbus::{
    open_transport, AcquisitionConfig, AcquisitionScheduler, ReadingStore, SchedulerHandle,
};

/// How often the console view refreshes
const DISPLAY_PERIOD: Duration = Duration::from_secs(1);

#[tokio::main]
async fn main() -> Result<()> {
    init_logger();

    println!("🌡️  Thermo Modbus Monitor");
    println!("========================");

    let config = match std::env::args().nth(1) {
        Some(path) => AcquisitionConfig::from_file(&path)
            .with_context(|| format!("failed to load configuration from {}", path))?,
        None => {
            println!("No configuration file given, using defaults");
            AcquisitionConfig::default()
        }
    };
    let output_dir = std::env::args()
        .nth(2)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));

    let store = ReadingStore::new();

    if config.test_mode.enabled {
        println!("🧪 Test mode: synthetic data, no device");
        let (scheduler, handle) = AcquisitionScheduler::for_test_mode(config.clone(), store.clone())?;
        monitor(scheduler, handle, store, config, output_dir).await
    } else {
        match &config.bridge_url {
            Some(url) => println!("🔌 Connecting through bridge {}...", url),
            None => println!(
                "🔌 Opening {} at {} baud...",
                config.serial.port, config.serial.baud_rate
            ),
        }
        let transport = open_transport(&config).await?;

        let operation_log = OperationLog::with_callback(
            DEFAULT_OPERATION_LOG_CAPACITY,
            Box::new(|entry| {
                if entry.status != OperationStatus::Success {
                    eprintln!("⚠️  {}: {}", entry.status, entry.message);
                }
            }),
        );
        let (scheduler, handle) =
            AcquisitionScheduler::for_device(config.clone(), transport, store.clone(), operation_log)?;
        monitor(scheduler, handle, store, config, output_dir).await
    }
}

async fn monitor<S: ReadingSource + 'static>(
    mut scheduler: AcquisitionScheduler<S>,
    handle: SchedulerHandle,
    store: ReadingStore,
    config: AcquisitionConfig,
    output_dir: PathBuf,
) -> Result<()> {
    println!("Period {:?}, press Ctrl-C to stop\n", scheduler.period());
    let mut task = tokio::spawn(async move { scheduler.run().await.map(|_| scheduler) });

    let mut display = tokio::time::interval(DISPLAY_PERIOD);
    let scheduler = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!("\n⏹️  Stopping...");
                handle.stop("interrupted by user").await?;
                break task.await??;
            }
            finished = &mut task => {
                // Only a failed handshake ends the run on its own
                break finished??;
            }
            _ = display.tick() => {
                let latest = store.latest_per_channel()?;
                if latest.is_empty() {
                    continue;
                }
                let line = latest
                    .values()
                    .map(|r| format!("CH{}: {:6.1}", r.channel, r.effective_temperature()))
                    .collect::<Vec<_>>()
                    .join("  ");
                println!("[{}] {}", handle.state(), line);
            }
        }
    };

    println!("\n📊 Statistics\n{}", format_stats(scheduler.stats()));
    for line in scheduler.session().narrative(now_millis()) {
        println!("  {}", line);
    }

    let snapshot = store.snapshot()?;
    if snapshot.readings.is_empty() {
        println!("No readings recorded, nothing to export");
        return Ok(());
    }
    let metadata = ExportMetadata::new(&config, snapshot.calibration.clone(), scheduler.session().clone());
    let path = write_csv_file(&output_dir, &snapshot.readings, &metadata)?;
    println!("📄 Exported {} readings to {}", snapshot.readings.len(), path.display());

    Ok(())
}
