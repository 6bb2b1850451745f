//! Persisted machine snapshot: the single record that makes the dispenser
//! resumable across restarts. Written after every phase transition and
//! every calibration or schedule change; read once at startup. A missing or
//! damaged record degrades field-by-field to documented defaults rather
//! than failing startup.

use std::path::PathBuf;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::motion::{Position, ProtocolState};
use crate::scheduler::ScheduleMode;
use crate::sequencer::DispensePhase;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON encode error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineSnapshot {
    pub dispense_phase: DispensePhase,
    pub protocol_state: ProtocolState,
    pub x_position: f64,
    pub z_position: f64,
    pub cans_loaded: u32,
    pub eject_last: f64,
    /// Hours between feeds in interval mode.
    pub feed_gap: f64,
    pub schedule_mode: ScheduleMode,
    pub daily_feed_hour: u32,
    pub daily_feed_minute: u32,
    /// Unix timestamp of the next feed, 0 when unset.
    pub next_feed_time: i64,
    /// Unix timestamp of the save, informational only.
    pub timestamp: i64,
}

impl Default for MachineSnapshot {
    fn default() -> Self {
        Self {
            dispense_phase: DispensePhase::Idle,
            protocol_state: ProtocolState::Idle,
            x_position: 0.0,
            z_position: 0.0,
            cans_loaded: 0,
            eject_last: 318.0,
            feed_gap: 8.0,
            schedule_mode: ScheduleMode::Interval,
            daily_feed_hour: 6,
            daily_feed_minute: 30,
            next_feed_time: 0,
            timestamp: 0,
        }
    }
}

impl MachineSnapshot {
    pub fn position(&self) -> Position {
        Position {
            x: self.x_position,
            z: self.z_position,
        }
    }

    /// Decode a snapshot leniently: each field that is present and
    /// well-typed is taken from `value`, everything else keeps its default.
    pub fn from_value(value: &Value) -> Self {
        fn field<T: DeserializeOwned>(value: &Value, key: &str, out: &mut T) {
            if let Some(raw) = value.get(key) {
                match serde_json::from_value(raw.clone()) {
                    Ok(parsed) => *out = parsed,
                    Err(_) => tracing::warn!("Snapshot field '{}' malformed, using default", key),
                }
            }
        }

        let mut snap = Self::default();
        field(value, "dispense_phase", &mut snap.dispense_phase);
        field(value, "protocol_state", &mut snap.protocol_state);
        field(value, "x_position", &mut snap.x_position);
        field(value, "z_position", &mut snap.z_position);
        field(value, "cans_loaded", &mut snap.cans_loaded);
        field(value, "eject_last", &mut snap.eject_last);
        field(value, "feed_gap", &mut snap.feed_gap);
        field(value, "schedule_mode", &mut snap.schedule_mode);
        field(value, "daily_feed_hour", &mut snap.daily_feed_hour);
        field(value, "daily_feed_minute", &mut snap.daily_feed_minute);
        field(value, "next_feed_time", &mut snap.next_feed_time);
        field(value, "timestamp", &mut snap.timestamp);
        snap.daily_feed_hour = snap.daily_feed_hour.min(23);
        snap.daily_feed_minute = snap.daily_feed_minute.min(59);
        snap
    }
}

/// Durable store for the machine snapshot.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Load the last snapshot. Never fails: corruption degrades to
    /// defaults.
    async fn load(&self) -> MachineSnapshot;
    async fn save(&self, snapshot: &MachineSnapshot) -> Result<(), SnapshotError>;
}

/// JSON file on disk, one record.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

#[async_trait]
impl StateStore for JsonFileStore {
    async fn load(&self) -> MachineSnapshot {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) => {
                tracing::info!(
                    "No snapshot at {} ({}), starting from defaults",
                    self.path.display(),
                    e
                );
                return MachineSnapshot::default();
            }
        };
        match serde_json::from_str::<Value>(&contents) {
            Ok(value) => MachineSnapshot::from_value(&value),
            Err(e) => {
                tracing::warn!("Snapshot unreadable ({}), starting from defaults", e);
                MachineSnapshot::default()
            }
        }
    }

    async fn save(&self, snapshot: &MachineSnapshot) -> Result<(), SnapshotError> {
        let encoded = serde_json::to_string_pretty(snapshot)?;
        tokio::fs::write(&self.path, encoded).await?;
        tracing::debug!("Snapshot saved to {}", self.path.display());
        Ok(())
    }
}
