/// Thermo Modbus Demo
///
/// Runs the full pipeline without hardware: synthetic acquisition in test
/// mode, a pause, one-click calibration, downsampling and a CSV round trip.
///
/// Usage: thermo_demo [seconds] [output-dir]
use anyhow::{Context, Result};
use std::path::PathBuf;
use std::time::Duration;
use tokio::time::sleep;

use thermo_modbus::downsample::downsample;
use thermo_modbus::export::{read_csv_file, write_csv_file, ExportMetadata};
use thermo_modbus::logging::init_logger;
use thermo_modbus::utils::format::{format_millis, format_stats};
use thermo_modbus::utils::now_millis;
use thermo_modbus::{AcquisitionConfig, AcquisitionScheduler, ReadingStore, SchedulerState};

#[tokio::main]
async fn main() -> Result<()> {
    init_logger();

    println!("🌡️  Thermo Modbus Demo");
    println!("=====================");

    let seconds: u64 = std::env::args()
        .nth(1)
        .map(|arg| arg.parse())
        .transpose()
        .context("seconds must be a whole number")?
        .unwrap_or(6);
    let output_dir = std::env::args()
        .nth(2)
        .map(PathBuf::from)
        .unwrap_or_else(std::env::temp_dir);

    let mut config = AcquisitionConfig::default();
    config.serial.start_register = 40001;
    config.serial.offset_address = 40001;
    config.serial.register_count = 4;
    config.test_mode.enabled = true;
    config.test_mode.data_generation_rate = 10.0;
    config.test_mode.noise_level = 0.2;

    let store = ReadingStore::new();
    let (mut scheduler, handle) = AcquisitionScheduler::for_test_mode(config.clone(), store.clone())?;
    let task = tokio::spawn(async move { scheduler.run().await.map(|_| scheduler) });

    handle.wait_for(SchedulerState::TestMode).await?;
    println!("\n▶️  Generating {} channels at 10 Hz for {}s...", 4, seconds);

    let half = Duration::from_secs(seconds.max(2) / 2);
    sleep(half).await;
    handle.pause("operator break").await?;
    println!("⏸️  Paused with {} readings", store.len());
    sleep(Duration::from_secs(1)).await;
    handle.resume("break over").await?;
    println!("▶️  Resumed");
    sleep(half).await;

    handle.stop("demo finished").await?;
    let scheduler = task.await??;
    println!("⏹️  Stopped with {} readings", store.len());
    println!("\n📊 Statistics\n{}", format_stats(scheduler.stats()));

    println!("\n🕒 Session");
    let now = now_millis();
    for line in scheduler.session().narrative(now) {
        println!("  {}", line);
    }
    let durations = scheduler.session().durations(now);
    println!("  active time {}", format_millis(durations.total_active_ms));

    println!("\n🎯 One-click calibration to 25.0 °C");
    for offset in store.one_click_calibrate(25.0)? {
        println!("  CH{}: {:+.2} °C", offset.channel_id, offset.offset);
    }
    for (channel, reading) in store.latest_per_channel()? {
        println!(
            "  CH{} latest: raw {:.1} °C -> calibrated {:.1} °C",
            channel,
            reading.temperature,
            reading.effective_temperature()
        );
    }

    let snapshot = store.snapshot()?;
    let display = downsample(&snapshot.readings, snapshot.calibration.is_active());
    println!(
        "\n📉 Display series: {} of {} readings",
        display.len(),
        snapshot.readings.len()
    );

    let metadata = ExportMetadata::new(&config, snapshot.calibration.clone(), scheduler.session().clone());
    let path = write_csv_file(&output_dir, &snapshot.readings, &metadata)?;
    println!("\n📄 Exported to {}", path.display());

    let report = read_csv_file(&path)?;
    println!(
        "✅ Re-imported {} readings ({} rows rejected)",
        report.readings.len(),
        report.rejected
    );

    Ok(())
}
