//! Contains the data models for API requests and responses.

use serde::Serialize;

use crate::sequencer::DispensePhase;

/// Feeder status as served to web clients.
#[derive(Serialize)]
pub struct StatusResponse {
    pub timestamp: i64,
    pub cans_left: u32,
    pub feed_mode: String,
    pub next_feed_time: String,
    pub next_feed_time_unix: i64,
    pub operation_running: bool,
    pub machine_state: DispensePhase,
    pub feed_interval_minutes: i64,
    pub daily_feed_hour: u32,
    pub daily_feed_minute: u32,
}

#[derive(Serialize)]
pub struct FeedResponse {
    pub success: bool,
    pub message: String,
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub state_file_exists: bool,
    pub timestamp: i64,
}
