//! # Acquisition Scheduler
//!
//! Drives periodic acquisition from a [`ReadingSource`]: either a device
//! polled over a [`FrameTransport`] or the synthetic test-mode generator.
//!
//! ```text
//!            connect ok               Pause
//!  Idle ──► Connecting ──► Reading ◄────────► Paused
//!   ▲           │          (TestMode)  Resume    │
//!   └───────────┴──────────── Stop ──────────────┘
//! ```
//!
//! Each tick is one suspension point: the tick's transactions run to
//! completion (or time out) before the next tick may start. A command that
//! arrives mid-tick cancels the tick and its readings are discarded. The
//! scheduler runs until it receives `Stop` or every [`SchedulerHandle`] is
//! dropped.
//!
//! ```rust,no_run
//! use thermo_modbus::config::AcquisitionConfig;
//! use thermo_modbus::reading::ReadingStore;
//! use thermo_modbus::scheduler::AcquisitionScheduler;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut config = AcquisitionConfig::default();
//!     config.test_mode.enabled = true;
//!
//!     let store = ReadingStore::new();
//!     let (mut scheduler, handle) = AcquisitionScheduler::for_test_mode(config, store.clone())?;
//!     let task = tokio::spawn(async move { scheduler.run().await });
//!
//!     tokio::time::sleep(std::time::Duration::from_secs(3)).await;
//!     handle.stop("demo finished").await?;
//!     task.await??;
//!     println!("{} readings", store.len());
//!     Ok(())
//! }
//! ```

use async_trait::async_trait;
use log::{debug, error, info, warn};
use serde::Serialize;
use std::fmt;
use std::ops::ControlFlow;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;

use crate::client::HoldingRegisterClient;
use crate::config::AcquisitionConfig;
use crate::converter::TemperatureConverter;
use crate::error::{ThermoError, ThermoResult};
use crate::generator::TestSignalGenerator;
use crate::logging::OperationLog;
use crate::reading::{ReadingStore, TemperatureReading};
use crate::registers::{self, ReadBlock, ResolvedRegister};
use crate::session::SessionTracker;
use crate::transport::FrameTransport;
use crate::utils::{format::format_stats, now_millis, AcquisitionStats};

/// Pending commands before senders wait
const COMMAND_BUFFER: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SchedulerState {
    Idle,
    /// Handshake in progress
    Connecting,
    /// Polling a device
    Reading,
    /// Generating synthetic data
    TestMode,
    Paused,
}

impl fmt::Display for SchedulerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SchedulerState::Idle => "idle",
            SchedulerState::Connecting => "connecting",
            SchedulerState::Reading => "reading",
            SchedulerState::TestMode => "test mode",
            SchedulerState::Paused => "paused",
        };
        f.write_str(name)
    }
}

/// Control messages; the string is the reason recorded in the session log
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerCommand {
    Pause(String),
    Resume(String),
    Stop(String),
}

/// Where readings come from
#[async_trait]
pub trait ReadingSource: Send {
    /// True for synthetic sources that never touch a transport
    fn is_synthetic(&self) -> bool;

    /// Channels this source produces, in tick order
    fn channels(&self) -> Vec<u8>;

    /// Prepare the source; for devices this is the handshake read
    async fn connect(&mut self) -> ThermoResult<()>;

    /// Produce this tick's readings, recording every transaction in `stats`
    ///
    /// Failures are logged and counted, never returned: a failed block
    /// simply yields no readings for its channels.
    async fn acquire(&mut self, timestamp: i64, stats: &mut AcquisitionStats) -> Vec<TemperatureReading>;

    /// Release whatever `connect` acquired
    async fn disconnect(&mut self) -> ThermoResult<()>;
}

/// Device polled through a holding-register client
pub struct DeviceSource<T: FrameTransport> {
    client: HoldingRegisterClient<T>,
    blocks: Vec<ReadBlock>,
    converter: TemperatureConverter,
}

impl<T: FrameTransport> DeviceSource<T> {
    /// Poll `registers`, grouped into contiguous read blocks
    pub fn new(
        client: HoldingRegisterClient<T>,
        registers: &[ResolvedRegister],
        converter: TemperatureConverter,
    ) -> Self {
        Self {
            client,
            blocks: registers::plan_reads(registers, crate::MAX_REGISTERS_PER_REQUEST),
            converter,
        }
    }

    /// Source for the selected channels of `config`
    pub fn from_config(transport: T, config: &AcquisitionConfig, operation_log: OperationLog) -> Self {
        let client = HoldingRegisterClient::from_config(transport, config).with_operation_log(operation_log);
        Self::new(
            client,
            &selected_registers(config),
            TemperatureConverter::new(config.conversion.clone()),
        )
    }

    pub fn blocks(&self) -> &[ReadBlock] {
        &self.blocks
    }

    pub fn client(&self) -> &HoldingRegisterClient<T> {
        &self.client
    }

    pub fn into_client(self) -> HoldingRegisterClient<T> {
        self.client
    }
}

#[async_trait]
impl<T: FrameTransport> ReadingSource for DeviceSource<T> {
    fn is_synthetic(&self) -> bool {
        false
    }

    fn channels(&self) -> Vec<u8> {
        self.blocks.iter().flat_map(|block| block.channels()).collect()
    }

    async fn connect(&mut self) -> ThermoResult<()> {
        let block = self
            .blocks
            .first()
            .ok_or_else(|| ThermoError::configuration("No channels selected"))?;
        let (start, quantity) = (block.start, block.quantity());

        self.client
            .read_holding_registers(start, quantity)
            .await
            .map_err(|e| {
                warn!("Handshake with slave {} failed: {}", self.client.slave_id(), e);
                e
            })?;
        info!(
            "Slave {} answered handshake, polling {} blocks",
            self.client.slave_id(),
            self.blocks.len()
        );
        Ok(())
    }

    async fn acquire(&mut self, timestamp: i64, stats: &mut AcquisitionStats) -> Vec<TemperatureReading> {
        let mut readings = Vec::new();

        for block in &self.blocks {
            let started = Instant::now();
            match self.client.read_holding_registers(block.start, block.quantity()).await {
                Ok(values) => {
                    stats.record_success(started.elapsed());
                    for (register, raw) in block.registers.iter().zip(values) {
                        let conversion = self.converter.convert_register(raw);
                        if let Some(e) = &conversion.error {
                            warn!("Channel {}: {}", register.channel, e);
                        }
                        readings.push(TemperatureReading::new(
                            timestamp,
                            register.channel,
                            conversion.temperature,
                            raw,
                        ));
                    }
                }
                Err(e) => {
                    let timed_out = matches!(e, ThermoError::Timeout { .. });
                    stats.record_failure(started.elapsed(), timed_out);
                    error!(
                        "Read of {} registers at {} failed, skipping channels {:?}: {}",
                        block.quantity(),
                        block.start,
                        block.channels().collect::<Vec<_>>(),
                        e
                    );
                }
            }
        }

        readings
    }

    async fn disconnect(&mut self) -> ThermoResult<()> {
        self.client.close().await
    }
}

/// Test-mode generator
pub struct SyntheticSource {
    generator: TestSignalGenerator,
    channels: Vec<u8>,
}

impl SyntheticSource {
    pub fn new(generator: TestSignalGenerator, channels: Vec<u8>) -> Self {
        Self { generator, channels }
    }

    pub fn from_config(config: &AcquisitionConfig) -> Self {
        let channels = selected_registers(config).iter().map(|r| r.channel).collect();
        Self::new(TestSignalGenerator::new(config.test_mode.clone()), channels)
    }
}

#[async_trait]
impl ReadingSource for SyntheticSource {
    fn is_synthetic(&self) -> bool {
        true
    }

    fn channels(&self) -> Vec<u8> {
        self.channels.clone()
    }

    async fn connect(&mut self) -> ThermoResult<()> {
        self.generator.reset();
        Ok(())
    }

    async fn acquire(&mut self, timestamp: i64, _stats: &mut AcquisitionStats) -> Vec<TemperatureReading> {
        self.generator.generate(timestamp, &self.channels)
    }

    async fn disconnect(&mut self) -> ThermoResult<()> {
        Ok(())
    }
}

/// Resolved registers whose channel is selected for recording
pub fn selected_registers(config: &AcquisitionConfig) -> Vec<ResolvedRegister> {
    registers::resolve(&config.serial)
        .into_iter()
        .filter(|register| config.recording.is_selected(register.channel))
        .collect()
}

/// Remote control for a running scheduler
#[derive(Debug, Clone)]
pub struct SchedulerHandle {
    commands: mpsc::Sender<SchedulerCommand>,
    state: watch::Receiver<SchedulerState>,
}

impl SchedulerHandle {
    pub async fn send(&self, command: SchedulerCommand) -> ThermoResult<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| ThermoError::internal("Scheduler is gone"))
    }

    pub async fn pause<S: Into<String>>(&self, reason: S) -> ThermoResult<()> {
        self.send(SchedulerCommand::Pause(reason.into())).await
    }

    pub async fn resume<S: Into<String>>(&self, reason: S) -> ThermoResult<()> {
        self.send(SchedulerCommand::Resume(reason.into())).await
    }

    pub async fn stop<S: Into<String>>(&self, reason: S) -> ThermoResult<()> {
        self.send(SchedulerCommand::Stop(reason.into())).await
    }

    pub fn state(&self) -> SchedulerState {
        *self.state.borrow()
    }

    /// Receiver for observing state changes
    pub fn subscribe(&self) -> watch::Receiver<SchedulerState> {
        self.state.clone()
    }

    /// Wait until the scheduler publishes `target`
    pub async fn wait_for(&self, target: SchedulerState) -> ThermoResult<()> {
        let mut state = self.state.clone();
        loop {
            if *state.borrow_and_update() == target {
                return Ok(());
            }
            state
                .changed()
                .await
                .map_err(|_| ThermoError::internal("Scheduler is gone"))?;
        }
    }
}

pub struct AcquisitionScheduler<S: ReadingSource> {
    config: AcquisitionConfig,
    source: S,
    store: ReadingStore,
    session: SessionTracker,
    stats: AcquisitionStats,
    commands: mpsc::Receiver<SchedulerCommand>,
    state: watch::Sender<SchedulerState>,
}

impl<T: FrameTransport> AcquisitionScheduler<DeviceSource<T>> {
    /// Scheduler polling the device behind `transport`
    ///
    /// The store is calibrated with the offsets of `config`.
    pub fn for_device(
        config: AcquisitionConfig,
        transport: T,
        store: ReadingStore,
        operation_log: OperationLog,
    ) -> ThermoResult<(Self, SchedulerHandle)> {
        config.validate()?;
        let source = DeviceSource::from_config(transport, &config, operation_log);
        Ok(Self::new(config, source, store))
    }
}

impl AcquisitionScheduler<SyntheticSource> {
    pub fn for_test_mode(config: AcquisitionConfig, store: ReadingStore) -> ThermoResult<(Self, SchedulerHandle)> {
        config.test_mode.validate()?;
        config.validate()?;
        let source = SyntheticSource::from_config(&config);
        Ok(Self::new(config, source, store))
    }
}

impl<S: ReadingSource> AcquisitionScheduler<S> {
    pub fn new(config: AcquisitionConfig, source: S, store: ReadingStore) -> (Self, SchedulerHandle) {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let (state_tx, state_rx) = watch::channel(SchedulerState::Idle);

        if !config.calibration.is_empty() {
            if let Err(e) = store.set_calibration(config.calibration.clone()) {
                warn!("Configured calibration not applied: {}", e);
            }
        }

        let scheduler = Self {
            config,
            source,
            store,
            session: SessionTracker::new(),
            stats: AcquisitionStats::new(),
            commands: command_rx,
            state: state_tx,
        };
        let handle = SchedulerHandle {
            commands: command_tx,
            state: state_rx,
        };
        (scheduler, handle)
    }

    pub fn config(&self) -> &AcquisitionConfig {
        &self.config
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn into_source(self) -> S {
        self.source
    }

    pub fn store(&self) -> &ReadingStore {
        &self.store
    }

    pub fn session(&self) -> &SessionTracker {
        &self.session
    }

    pub fn stats(&self) -> &AcquisitionStats {
        &self.stats
    }

    pub fn state(&self) -> SchedulerState {
        *self.state.borrow()
    }

    /// Tick period: the generation rate in test mode, the recording
    /// interval otherwise, never below 100 ms
    pub fn period(&self) -> Duration {
        if self.source.is_synthetic() {
            self.config.test_mode.period()
        } else {
            self.config.recording.period()
        }
    }

    fn active_state(&self) -> SchedulerState {
        if self.source.is_synthetic() {
            SchedulerState::TestMode
        } else {
            SchedulerState::Reading
        }
    }

    fn set_state(&self, state: SchedulerState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!("Scheduler state: {} -> {}", previous, state);
        }
    }

    /// Discard readings, session log and statistics
    ///
    /// Only allowed while idle.
    pub fn new_session(&mut self) -> ThermoResult<()> {
        if self.state() != SchedulerState::Idle {
            return Err(ThermoError::session("cannot start a new session while acquiring"));
        }
        self.store.clear()?;
        self.session.reset();
        self.stats.reset();
        info!("New session");
        Ok(())
    }

    /// Connect, then tick until stopped
    ///
    /// Returns the handshake error if the source could not be connected;
    /// the scheduler is back in `Idle` either way when this returns.
    pub async fn run(&mut self) -> ThermoResult<()> {
        self.set_state(SchedulerState::Connecting);
        if let Err(e) = self.source.connect().await {
            self.set_state(SchedulerState::Idle);
            return Err(e);
        }

        let action = match self.session.begin(now_millis(), "acquisition started") {
            Ok(action) => action,
            Err(e) => {
                let _ = self.source.disconnect().await;
                self.set_state(SchedulerState::Idle);
                return Err(e);
            }
        };

        let period = self.period();
        info!(
            "Acquisition {} ({}), period {:?}, channels {:?}",
            action,
            self.active_state(),
            period,
            self.source.channels()
        );
        self.set_state(self.active_state());

        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut paused = false;

        loop {
            tokio::select! {
                biased;
                command = self.commands.recv() => {
                    if self.handle_command(command, &mut paused, &mut interval).is_break() {
                        break;
                    }
                }
                _ = interval.tick(), if !paused => {
                    let timestamp = now_millis();
                    let tick = tokio::select! {
                        biased;
                        command = self.commands.recv() => Err(command),
                        readings = self.source.acquire(timestamp, &mut self.stats) => Ok(readings),
                    };

                    match tick {
                        Ok(readings) => self.complete_tick(readings),
                        Err(command) => {
                            debug!("Tick at {} cancelled by command", timestamp);
                            if self.handle_command(command, &mut paused, &mut interval).is_break() {
                                break;
                            }
                        }
                    }
                }
            }
        }

        if let Err(e) = self.source.disconnect().await {
            warn!("Error releasing source: {}", e);
        }
        self.set_state(SchedulerState::Idle);
        info!("Acquisition stopped\n{}", format_stats(&self.stats));
        Ok(())
    }

    fn complete_tick(&mut self, readings: Vec<TemperatureReading>) {
        self.stats.ticks += 1;
        self.stats.readings += readings.len() as u64;
        if readings.is_empty() {
            return;
        }
        if let Err(e) = self.store.append(readings) {
            error!("Failed to store readings: {}", e);
        }
    }

    fn handle_command(
        &mut self,
        command: Option<SchedulerCommand>,
        paused: &mut bool,
        interval: &mut tokio::time::Interval,
    ) -> ControlFlow<()> {
        let now = now_millis();
        match command {
            Some(SchedulerCommand::Pause(reason)) => {
                if *paused {
                    debug!("Already paused");
                } else {
                    note_session(self.session.pause(now, reason));
                    *paused = true;
                    self.set_state(SchedulerState::Paused);
                }
                ControlFlow::Continue(())
            }
            Some(SchedulerCommand::Resume(reason)) => {
                if *paused {
                    note_session(self.session.resume(now, reason));
                    *paused = false;
                    interval.reset_immediately();
                    self.set_state(self.active_state());
                } else {
                    debug!("Not paused, ignoring resume");
                }
                ControlFlow::Continue(())
            }
            Some(SchedulerCommand::Stop(reason)) => {
                if *paused {
                    self.session.close(now);
                } else {
                    note_session(self.session.stop(now, reason));
                }
                ControlFlow::Break(())
            }
            None => {
                if *paused {
                    self.session.close(now);
                } else {
                    note_session(self.session.stop(now, "controller dropped"));
                }
                ControlFlow::Break(())
            }
        }
    }
}

fn note_session(result: ThermoResult<()>) {
    if let Err(e) = result {
        warn!("Session log not updated: {}", e);
    }
}
