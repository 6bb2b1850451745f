// src/hardware/serial.rs - serial2-tokio link and background reader task
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serial2_tokio::SerialPort;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use super::{LineSink, LinkError};

const READ_POLL: Duration = Duration::from_millis(200);

/// Duplex byte channel to the actuator firmware. The port handle is shared:
/// the reader task reads through the same `Arc` the writers send through.
pub struct SerialLink {
    port: Arc<SerialPort>,
    path: String,
}

impl SerialLink {
    pub fn open(path: &str, baud: u32) -> Result<Self, LinkError> {
        let port = SerialPort::open(path, baud).map_err(|source| LinkError::Open {
            path: path.to_string(),
            source,
        })?;
        tracing::info!("Connected to motion controller on {} @ {} baud", path, baud);
        Ok(Self {
            port: Arc::new(port),
            path: path.to_string(),
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn port(&self) -> Arc<SerialPort> {
        self.port.clone()
    }
}

#[async_trait]
impl LineSink for SerialLink {
    async fn send_line(&self, line: &str) -> Result<(), LinkError> {
        let framed = format!("{}\n", line);
        let bytes = framed.as_bytes();
        let mut written = 0;
        while written < bytes.len() {
            let n = self.port.write(&bytes[written..]).await?;
            if n == 0 {
                return Err(LinkError::Down);
            }
            written += n;
        }
        tracing::debug!("TX: {}", line);
        Ok(())
    }
}

impl std::fmt::Debug for SerialLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialLink").field("path", &self.path).finish()
    }
}

/// Spawn the background reader task. It frames incoming bytes into
/// newline-terminated lines (carriage returns trimmed, partial lines kept
/// buffered) and forwards each complete line into `line_tx`. The task stops
/// when `stop` is raised, the port reports EOF, or the receiver is dropped.
pub fn spawn_reader(
    port: Arc<SerialPort>,
    line_tx: mpsc::Sender<String>,
    stop: Arc<AtomicBool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = [0u8; 1024];
        let mut pending = String::new();

        loop {
            if stop.load(Ordering::Relaxed) {
                break;
            }
            match timeout(READ_POLL, port.read(&mut buf)).await {
                Err(_) => continue, // no data yet, check the stop flag again
                Ok(Ok(0)) => {
                    tracing::info!("Serial connection closed by remote");
                    break;
                }
                Ok(Ok(n)) => {
                    pending.push_str(&String::from_utf8_lossy(&buf[..n]));
                    while let Some(pos) = pending.find('\n') {
                        let mut line: String = pending.drain(..=pos).collect();
                        line.truncate(line.trim_end_matches(['\n', '\r']).len());
                        if line.is_empty() {
                            continue;
                        }
                        tracing::debug!("RX: {}", line);
                        if line_tx.send(line).await.is_err() {
                            tracing::info!("Line consumer gone, reader stopping");
                            return;
                        }
                    }
                }
                Ok(Err(e)) => {
                    tracing::error!("Serial read error: {}", e);
                    break;
                }
            }
        }
        tracing::info!("Reader task stopped");
    })
}
