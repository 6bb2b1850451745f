// src/hardware/mod.rs - Serial link to the motion controller
pub mod serial;

use async_trait::async_trait;
use thiserror::Error;

pub use serial::{SerialLink, spawn_reader};

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("Failed to open serial port '{path}': {source}")]
    Open {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Serial write error: {0}")]
    Write(#[from] std::io::Error),
    #[error("Serial link is down")]
    Down,
}

/// Write side of the link. The protocol state machine only ever needs to
/// push whole lines, so this is the seam mocked in tests.
#[async_trait]
pub trait LineSink: Send + Sync {
    /// Append the line terminator and write the whole line out.
    async fn send_line(&self, line: &str) -> Result<(), LinkError>;
}
