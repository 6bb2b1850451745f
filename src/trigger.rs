//! External command-trigger surface: a single pending action token written
//! by the web layer (or anything else) as a small JSON file. The control
//! loop polls it at a slow cadence and the file is deleted as soon as it has
//! been read, whether the action is runnable or not.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use serde_json::Value;

const POLL_EVERY: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerAction {
    ManualFeed,
}

#[derive(Debug)]
pub struct PendingCommandFile {
    path: PathBuf,
    last_check: Option<Instant>,
}

impl PendingCommandFile {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            last_check: None,
        }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    /// Check for a pending action. Rate-limited so the 50ms control loop
    /// does not hammer the filesystem.
    pub async fn poll(&mut self) -> Option<TriggerAction> {
        if let Some(last) = self.last_check {
            if last.elapsed() < POLL_EVERY {
                return None;
            }
        }
        self.last_check = Some(Instant::now());

        let contents = tokio::fs::read_to_string(&self.path).await.ok()?;
        // Consume the token regardless of whether we can act on it.
        if let Err(e) = tokio::fs::remove_file(&self.path).await {
            tracing::warn!("Failed to remove command file: {}", e);
        }

        let action = serde_json::from_str::<Value>(&contents)
            .ok()?
            .get("action")?
            .as_str()?
            .to_string();
        match action.as_str() {
            "manual_feed" => {
                tracing::info!("Manual feed command received");
                Some(TriggerAction::ManualFeed)
            }
            other => {
                tracing::warn!("Unknown command action '{}'", other);
                None
            }
        }
    }
}
