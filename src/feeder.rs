// src/feeder.rs - Owns every moving part and drives the control loop
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Local};
use thiserror::Error;
use tokio::sync::{RwLock, broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::config::{Config, home_file_path};
use crate::hardware::{LineSink, LinkError, SerialLink, spawn_reader};
use crate::motion::{MotionController, MotionError, Position, ProtocolState};
use crate::scheduler::{FeedScheduler, ScheduleMode};
use crate::sequencer::{DispensePhase, DispenseSequencer};
use crate::snapshot::{JsonFileStore, MachineSnapshot, SnapshotError, StateStore};
use crate::trigger::{PendingCommandFile, TriggerAction};

/// Control loop period.
const TICK: Duration = Duration::from_millis(50);

/// How long the fans keep running after a completed dispense.
const FAN_COOLDOWN_SECS: i64 = 5 * 60;

#[derive(Debug, Error)]
pub enum FeederError {
    #[error("Link error: {0}")]
    Link(#[from] LinkError),
    #[error("Motion error: {0}")]
    Motion(#[from] MotionError),
    #[error("Snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),
}

/// Read-only view of the feeder refreshed every control-loop pass, shared
/// with the presentation/web layer.
#[derive(Debug, Clone)]
pub struct FeederStatus {
    pub phase: DispensePhase,
    pub protocol_state: ProtocolState,
    pub position: Position,
    pub cans_loaded: u32,
    pub operation_running: bool,
    pub startup_complete: bool,
    pub schedule_mode: ScheduleMode,
    pub feed_gap_hours: f64,
    pub daily_feed_hour: u32,
    pub daily_feed_minute: u32,
    pub next_feed_time: i64,
}

impl Default for FeederStatus {
    fn default() -> Self {
        Self {
            phase: DispensePhase::Idle,
            protocol_state: ProtocolState::Disconnected,
            position: Position::default(),
            cans_loaded: 0,
            operation_running: false,
            startup_complete: false,
            schedule_mode: ScheduleMode::Interval,
            feed_gap_hours: 8.0,
            daily_feed_hour: 6,
            daily_feed_minute: 30,
            next_feed_time: 0,
        }
    }
}

pub struct Feeder {
    config: Config,
    machine: MotionController,
    sequencer: DispenseSequencer,
    scheduler: FeedScheduler,
    store: Arc<dyn StateStore>,
    trigger: PendingCommandFile,
    line_rx: mpsc::Receiver<String>,
    reader: Option<JoinHandle<()>>,
    stop: Arc<AtomicBool>,
    status: Arc<RwLock<FeederStatus>>,
    cans_loaded: u32,
    eject_last: f64,
    operation_running: bool,
    startup_homing: bool,
    startup_complete: bool,
    fan_stop_at: Option<i64>,
}

impl Feeder {
    /// Open the serial link and wire everything up. A link that cannot be
    /// opened is fatal: the dispenser cannot run without its actuator.
    pub fn new(config: Config) -> Result<Self, FeederError> {
        let link = SerialLink::open(&config.link.port, config.link.baud)?;
        let (line_tx, line_rx) = mpsc::channel(64);
        let stop = Arc::new(AtomicBool::new(false));
        let reader = spawn_reader(link.port(), line_tx, stop.clone());
        let store = Arc::new(JsonFileStore::new(home_file_path(&config.paths.state_file)));
        let mut feeder = Self::with_parts(config, Arc::new(link), store, line_rx);
        feeder.stop = stop;
        feeder.reader = Some(reader);
        Ok(feeder)
    }

    /// Assemble a feeder from externally supplied parts. `new` uses this
    /// with the real serial link; tests substitute mocks.
    pub fn with_parts(
        config: Config,
        link: Arc<dyn LineSink>,
        store: Arc<dyn StateStore>,
        line_rx: mpsc::Receiver<String>,
    ) -> Self {
        let machine = MotionController::new(link, config.link.z_move_extra_ack);
        let sequencer = DispenseSequencer::new(config.mechanics.clone());
        let trigger = PendingCommandFile::new(home_file_path(&config.paths.command_file));
        Self {
            config,
            machine,
            sequencer,
            scheduler: FeedScheduler::default(),
            store,
            trigger,
            line_rx,
            reader: None,
            stop: Arc::new(AtomicBool::new(false)),
            status: Arc::new(RwLock::new(FeederStatus::default())),
            cans_loaded: 0,
            eject_last: 318.0,
            operation_running: false,
            startup_homing: false,
            startup_complete: false,
            fan_stop_at: None,
        }
    }

    pub fn status_handle(&self) -> Arc<RwLock<FeederStatus>> {
        self.status.clone()
    }

    /// Z height at which the next can sits ready for opening. `open_last`
    /// is always derived from the calibrated eject height, never stored.
    pub fn open_last(&self) -> f64 {
        self.eject_last - self.config.mechanics.can_to_eject
    }

    pub fn can_open_offset(&self) -> f64 {
        let m = &self.config.mechanics;
        (self.open_last() + m.cartridge_height) - (self.cans_loaded as f64) * m.cartridge_height
    }

    /// Bring the machine up: restore the persisted snapshot, recover a
    /// past-due schedule, then either resume a mid-sequence dispense or run
    /// the startup Z homing. Automatic feeding stays disabled until the
    /// startup path has finished.
    pub async fn startup(&mut self, now: DateTime<Local>) -> Result<(), FeederError> {
        self.machine.connect().await?;

        let snap = self.store.load().await;
        tracing::info!(
            "Restored snapshot: phase={:?} cans={} eject_last={} mode={:?}",
            snap.dispense_phase,
            snap.cans_loaded,
            snap.eject_last,
            snap.schedule_mode
        );
        self.cans_loaded = snap.cans_loaded;
        self.eject_last = snap.eject_last;
        self.scheduler.mode = snap.schedule_mode;
        self.scheduler.set_feed_gap(snap.feed_gap);
        self.scheduler.set_daily_time(snap.daily_feed_hour, snap.daily_feed_minute);
        self.scheduler.next_feed_time = snap.next_feed_time;
        self.machine.set_position(snap.position());
        if snap.protocol_state != ProtocolState::Disconnected {
            self.machine.set_state(snap.protocol_state);
        }
        self.sequencer.set_phase(snap.dispense_phase);

        if self.scheduler.reschedule_if_past(now) {
            self.save_snapshot(now).await;
        }
        if self.scheduler.mode == ScheduleMode::Daily && self.scheduler.next_feed_time == 0 {
            self.scheduler.activate_daily(now);
            self.save_snapshot(now).await;
        }

        tracing::info!("Can open offset: {:.2} mm", self.can_open_offset());

        if self.sequencer.is_active() {
            // Interrupted mid-dispense: phase latches are clear, so the
            // restored phase re-runs its entry action on the first pass.
            tracing::warn!("Resuming dispense from {:?}", self.sequencer.phase());
            self.machine.set_state(ProtocolState::Idle);
            self.operation_running = true;
        } else {
            self.startup_homing = true;
            self.machine.home_z().await?;
        }
        self.save_snapshot(now).await;
        Ok(())
    }

    /// Run the control loop until a shutdown signal arrives.
    pub async fn run(&mut self, mut shutdown: broadcast::Receiver<()>) -> Result<(), FeederError> {
        let mut interval = tokio::time::interval(TICK);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!("Control loop shutting down");
                    break;
                }
                _ = interval.tick() => {
                    if let Err(e) = self.poll_once(Local::now()).await {
                        tracing::error!("Control loop error: {}", e);
                    }
                }
            }
        }
        self.shutdown().await;
        Ok(())
    }

    /// One control-loop pass. Public so tests can drive the feeder with a
    /// deterministic clock.
    pub async fn poll_once(&mut self, now: DateTime<Local>) -> Result<(), FeederError> {
        self.drain_lines().await;

        if self.startup_homing && self.machine.state() == ProtocolState::Idle {
            self.startup_homing = false;
            tracing::info!("Startup Z homing complete");
            self.save_snapshot(now).await;
        }
        if !self.startup_complete
            && !self.startup_homing
            && !self.operation_running
            && self.machine.state() == ProtocolState::Idle
            && !self.sequencer.is_active()
        {
            self.startup_complete = true;
            tracing::info!("Startup sequence complete - automatic feeding enabled");
        }

        if self.startup_complete
            && !self.operation_running
            && !self.sequencer.is_active()
            && self.scheduler.is_due(now)
        {
            tracing::info!("Scheduled feed time reached");
            // Advance before dispensing so a slow sequence cannot re-fire.
            self.scheduler.advance(now);
            self.save_snapshot(now).await;
            self.start_dispense(now).await?;
        }

        if self.operation_running {
            let changed = self
                .sequencer
                .tick(&mut self.machine, &mut self.cans_loaded)
                .await?;
            if changed {
                self.save_snapshot(now).await;
            }
            if !self.sequencer.is_active() && self.machine.state() == ProtocolState::Idle {
                self.operation_running = false;
                self.fan_stop_at = Some(now.timestamp() + FAN_COOLDOWN_SECS);
                tracing::info!("Dispense operation complete, fans cooling down");
                self.save_snapshot(now).await;
            }
        }

        if let Some(action) = self.trigger.poll().await {
            self.handle_action(action, now).await?;
        }

        if let Some(stop_at) = self.fan_stop_at {
            if now.timestamp() >= stop_at {
                tracing::info!("Turning off fans after cooldown");
                if let Err(e) = self.machine.set_fan_speed(0, 0).await {
                    tracing::warn!("Fan 0 off failed: {}", e);
                }
                if let Err(e) = self.machine.set_fan_speed(1, 0).await {
                    tracing::warn!("Fan 1 off failed: {}", e);
                }
                self.fan_stop_at = None;
            }
        }

        self.refresh_status().await;
        Ok(())
    }

    async fn drain_lines(&mut self) {
        while let Ok(line) = self.line_rx.try_recv() {
            if let Err(e) = self.machine.on_line(&line).await {
                tracing::error!("Failed to handle '{}': {}", line, e);
            }
        }
    }

    async fn handle_action(
        &mut self,
        action: TriggerAction,
        now: DateTime<Local>,
    ) -> Result<(), FeederError> {
        match action {
            TriggerAction::ManualFeed => {
                if self.operation_running || self.sequencer.is_active() || !self.startup_complete {
                    tracing::info!("Cannot start manual feed - machine busy or not ready");
                } else {
                    self.start_dispense(now).await?;
                }
            }
        }
        Ok(())
    }

    /// Kick off a full dispense. Refused (logged, not an error) when no cans
    /// are loaded or a sequence is already running.
    pub async fn start_dispense(&mut self, now: DateTime<Local>) -> Result<(), FeederError> {
        if self.cans_loaded < 1 {
            tracing::warn!("No cans loaded, refusing dispense");
            return Ok(());
        }
        if self.operation_running || self.sequencer.is_active() {
            tracing::warn!("Dispense already running");
            return Ok(());
        }
        self.operation_running = true;
        self.sequencer.start(&mut self.machine).await?;
        self.save_snapshot(now).await;
        Ok(())
    }

    /// Eject the current (already opened) can without the opening moves.
    pub async fn start_eject_only(&mut self, now: DateTime<Local>) -> Result<(), FeederError> {
        if self.cans_loaded < 1 {
            tracing::warn!("No cans loaded, refusing eject");
            return Ok(());
        }
        if self.operation_running || self.sequencer.is_active() {
            tracing::warn!("Dispense already running");
            return Ok(());
        }
        self.operation_running = true;
        self.sequencer.start_eject_only(&mut self.machine).await?;
        self.save_snapshot(now).await;
        Ok(())
    }

    /// Abort a running sequence. Idempotent; takes effect immediately.
    pub async fn abort(&mut self, now: DateTime<Local>) -> Result<(), FeederError> {
        if self.sequencer.abort(&mut self.machine).await? {
            self.operation_running = false;
            self.fan_stop_at = None;
            self.save_snapshot(now).await;
            tracing::info!("Operation aborted");
        }
        Ok(())
    }

    pub async fn home_x_now(&mut self) -> Result<(), FeederError> {
        self.machine.home_x().await?;
        Ok(())
    }

    /// Re-home Z and settle at the can-open offset for the current load.
    pub async fn home_z_now(&mut self) -> Result<(), FeederError> {
        tracing::info!("Can open offset: {:.2} mm", self.can_open_offset());
        self.machine.home_z().await?;
        Ok(())
    }

    /// Nudge the calibrated eject height and follow it with the Z axis so
    /// the operator sees the change immediately.
    pub async fn adjust_eject_last(
        &mut self,
        delta: f64,
        now: DateTime<Local>,
    ) -> Result<(), FeederError> {
        self.eject_last += delta;
        let offset = self.can_open_offset();
        tracing::info!("eject_last={:.2} open_last={:.2}", self.eject_last, self.open_last());
        self.machine.move_z_to(offset).await?;
        self.save_snapshot(now).await;
        Ok(())
    }

    /// First half of loading a can: drop the magazine one slot to make room.
    pub async fn can_load_lower(&mut self, now: DateTime<Local>) -> Result<(), FeederError> {
        if self.machine.state() != ProtocolState::Idle {
            tracing::warn!("Cannot lower magazine while machine is busy");
            return Ok(());
        }
        if self.cans_loaded >= self.config.mechanics.max_cans {
            tracing::warn!("Magazine full ({} cans)", self.cans_loaded);
            return Ok(());
        }
        let target = self.machine.position().z - self.config.mechanics.next_can;
        self.machine.move_z_to(target).await?;
        self.save_snapshot(now).await;
        Ok(())
    }

    /// Second half of loading: the operator has inserted the can, bring the
    /// stack back to the opening height.
    pub async fn can_load_finish(&mut self, now: DateTime<Local>) -> Result<(), FeederError> {
        if self.machine.state() != ProtocolState::Idle {
            tracing::warn!("Cannot finish load while machine is busy");
            return Ok(());
        }
        self.cans_loaded += 1;
        let offset = self.can_open_offset();
        self.machine.move_z_to(offset).await?;
        self.save_snapshot(now).await;
        Ok(())
    }

    pub async fn set_cans_loaded(&mut self, cans: u32, now: DateTime<Local>) {
        self.cans_loaded = cans.min(self.config.mechanics.max_cans);
        tracing::info!("Cans loaded set to {}", self.cans_loaded);
        self.save_snapshot(now).await;
    }

    /// Switch to interval mode and restart the countdown from now.
    pub async fn reset_interval(&mut self, now: DateTime<Local>) {
        self.scheduler.set_interval_mode(now);
        self.save_snapshot(now).await;
    }

    pub async fn set_schedule_daily(&mut self, hour: u32, minute: u32, now: DateTime<Local>) {
        self.scheduler.mode = ScheduleMode::Daily;
        self.scheduler.set_daily_time(hour, minute);
        self.scheduler.activate_daily(now);
        self.save_snapshot(now).await;
    }

    pub async fn set_feed_gap(&mut self, hours: f64, now: DateTime<Local>) {
        self.scheduler.set_feed_gap(hours);
        self.save_snapshot(now).await;
    }

    pub fn cans_loaded(&self) -> u32 {
        self.cans_loaded
    }

    pub fn phase(&self) -> DispensePhase {
        self.sequencer.phase()
    }

    pub fn protocol_state(&self) -> ProtocolState {
        self.machine.state()
    }

    pub fn operation_running(&self) -> bool {
        self.operation_running
    }

    pub fn startup_complete(&self) -> bool {
        self.startup_complete
    }

    pub fn next_feed_time(&self) -> i64 {
        self.scheduler.next_feed_time
    }

    fn to_snapshot(&self, now: DateTime<Local>) -> MachineSnapshot {
        let position = self.machine.position();
        MachineSnapshot {
            dispense_phase: self.sequencer.phase(),
            protocol_state: self.machine.state(),
            x_position: position.x,
            z_position: position.z,
            cans_loaded: self.cans_loaded,
            eject_last: self.eject_last,
            feed_gap: self.scheduler.feed_gap_hours,
            schedule_mode: self.scheduler.mode,
            daily_feed_hour: self.scheduler.daily_feed_hour,
            daily_feed_minute: self.scheduler.daily_feed_minute,
            next_feed_time: self.scheduler.next_feed_time,
            timestamp: now.timestamp(),
        }
    }

    async fn save_snapshot(&self, now: DateTime<Local>) {
        if let Err(e) = self.store.save(&self.to_snapshot(now)).await {
            tracing::error!("Failed to save snapshot: {}", e);
        }
    }

    async fn refresh_status(&self) {
        let mut status = self.status.write().await;
        *status = FeederStatus {
            phase: self.sequencer.phase(),
            protocol_state: self.machine.state(),
            position: self.machine.position(),
            cans_loaded: self.cans_loaded,
            operation_running: self.operation_running,
            startup_complete: self.startup_complete,
            schedule_mode: self.scheduler.mode,
            feed_gap_hours: self.scheduler.feed_gap_hours,
            daily_feed_hour: self.scheduler.daily_feed_hour,
            daily_feed_minute: self.scheduler.daily_feed_minute,
            next_feed_time: self.scheduler.next_feed_time,
        };
    }

    /// Stop the reader task (bounded join, then proceed) and drop the link.
    pub async fn shutdown(&mut self) {
        tracing::info!("Shutting down feeder");
        self.save_snapshot(Local::now()).await;
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.reader.take() {
            if tokio::time::timeout(Duration::from_secs(2), handle).await.is_err() {
                tracing::warn!("Reader task did not stop in time, proceeding");
            }
        }
        self.machine.disconnect();
        tracing::info!("Shutdown complete");
    }
}
