//! Defines the Axum API routes and handlers.
//!
//! The web layer is a thin external collaborator: it reads the shared
//! status view and posts the single pending command token the control loop
//! polls. It never touches the machine directly.

use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    routing::{get, post},
};
use chrono::{Local, TimeZone};
use tokio::sync::RwLock;

use crate::feeder::FeederStatus;
use crate::scheduler::ScheduleMode;
use crate::web::models::{FeedResponse, HealthResponse, StatusResponse};

#[derive(Clone)]
pub struct AppState {
    pub status: Arc<RwLock<FeederStatus>>,
    pub command_path: PathBuf,
    pub state_path: PathBuf,
}

/// Creates the Axum router with all the API endpoints.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/status", get(get_status))
        .route("/api/feed", post(manual_feed))
        .route("/api/health", get(health_check))
        .with_state(state)
}

fn format_feed_time(unix: i64) -> String {
    if unix <= 0 {
        return "Not set".to_string();
    }
    match Local.timestamp_opt(unix, 0).single() {
        Some(t) => t.format("%Y-%m-%d %H:%M:%S").to_string(),
        None => "Invalid time".to_string(),
    }
}

/// Handler for the current feeder status.
async fn get_status(State(state): State<AppState>) -> Json<StatusResponse> {
    let status = state.status.read().await.clone();
    let feed_mode = match status.schedule_mode {
        ScheduleMode::Interval => "INTERVAL",
        ScheduleMode::Daily => "DAILY",
    };
    Json(StatusResponse {
        timestamp: Local::now().timestamp(),
        cans_left: status.cans_loaded,
        feed_mode: feed_mode.to_string(),
        next_feed_time: format_feed_time(status.next_feed_time),
        next_feed_time_unix: status.next_feed_time,
        operation_running: status.operation_running,
        machine_state: status.phase,
        feed_interval_minutes: (status.feed_gap_hours * 60.0) as i64,
        daily_feed_hour: status.daily_feed_hour,
        daily_feed_minute: status.daily_feed_minute,
    })
}

/// Handler to request a manual feed by writing the pending command token.
async fn manual_feed(
    State(state): State<AppState>,
) -> Result<Json<FeedResponse>, StatusCode> {
    let command = serde_json::json!({
        "action": "manual_feed",
        "source": "web_api",
        "timestamp": Local::now().timestamp(),
    });
    match tokio::fs::write(&state.command_path, command.to_string()).await {
        Ok(()) => Ok(Json(FeedResponse {
            success: true,
            message: "Manual feed command sent".to_string(),
        })),
        Err(e) => {
            tracing::error!("Failed to write command file: {}", e);
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let state_file_exists = state.state_path.exists();
    Json(HealthResponse {
        status: if state_file_exists { "healthy" } else { "degraded" }.to_string(),
        state_file_exists,
        timestamp: Local::now().timestamp(),
    })
}
